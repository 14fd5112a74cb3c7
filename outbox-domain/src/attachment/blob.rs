//! 内存版附件（BlobAttachment）
//!
//! 以内存缓冲区为载体的 `Attachment` 实现：
//! - `encrypt`：委托给 `BlobEncrypter`，记录加密信息并替换待传输内容；
//! - `upload`：通过 `HomeServerApi::upload` 上传，传输期间随传输层进度持续报告；
//! - `apply_to_content`：明文写入 `<前缀>url`，密文写入 `<前缀>file`（加密信息 + url），
//!   两者都会写入 `<前缀>info.size` 与 `<前缀>info.mimetype`。前缀为键中最后一个 `url` 之前的部分。
//!
use crate::attachment::{Attachment, UploadProgress};
use crate::content::Content;
use crate::error::AttachmentError;
use crate::transport::{HomeServerApi, RequestHandle, UploadRequest, UploadResponse};
use async_trait::async_trait;
use serde_json::Value;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::watch;

/// 加密结果：密文与解密所需的描述信息（密钥、IV、哈希等，由实现决定）
#[derive(Debug, Clone, PartialEq)]
pub struct EncryptedBlob {
    pub body: Vec<u8>,
    pub info: Value,
}

/// 附件加密能力，算法细节由实现方提供
#[async_trait]
pub trait BlobEncrypter: Send + Sync {
    async fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob, AttachmentError>;
}

pub struct BlobAttachment {
    file_name: Option<String>,
    mime_type: String,
    plaintext_size: u64,
    encrypter: Option<Arc<dyn BlobEncrypter>>,
    size: AtomicU64,
    sent_bytes: AtomicU64,
    state: Mutex<BlobState>,
}

#[derive(Default)]
struct BlobState {
    // None：已释放，或正在加密
    transferred: Option<Vec<u8>>,
    encryption_info: Option<Value>,
    content_uri: Option<String>,
    request: Option<Arc<dyn RequestHandle<UploadResponse>>>,
    aborted: bool,
}

impl BlobAttachment {
    pub fn new(body: Vec<u8>, mime_type: impl Into<String>) -> Self {
        let size = body.len() as u64;
        Self {
            file_name: None,
            mime_type: mime_type.into(),
            plaintext_size: size,
            encrypter: None,
            size: AtomicU64::new(size),
            sent_bytes: AtomicU64::new(0),
            state: Mutex::new(BlobState {
                transferred: Some(body),
                ..Default::default()
            }),
        }
    }

    pub fn with_file_name(mut self, file_name: impl Into<String>) -> Self {
        self.file_name = Some(file_name.into());
        self
    }

    pub fn with_encrypter(mut self, encrypter: Arc<dyn BlobEncrypter>) -> Self {
        self.encrypter = Some(encrypter);
        self
    }

    pub fn is_encrypted(&self) -> bool {
        self.lock().encryption_info.is_some()
    }

    pub fn content_uri(&self) -> Option<String> {
        self.lock().content_uri.clone()
    }

    fn lock(&self) -> MutexGuard<'_, BlobState> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    fn advance(&self, sent: u64, progress: &UploadProgress<'_>) {
        self.sent_bytes
            .fetch_max(sent.min(self.size()), Ordering::Relaxed);
        progress.report();
    }
}

#[async_trait]
impl Attachment for BlobAttachment {
    fn size(&self) -> u64 {
        self.size.load(Ordering::Relaxed)
    }

    fn sent_bytes(&self) -> u64 {
        self.sent_bytes.load(Ordering::Relaxed)
    }

    async fn encrypt(&self) -> Result<(), AttachmentError> {
        let Some(encrypter) = self.encrypter.clone() else {
            return Err(AttachmentError::encrypt("no encrypter configured"));
        };

        let plaintext = {
            let mut state = self.lock();
            if state.aborted {
                return Err(AttachmentError::Aborted);
            }
            if state.encryption_info.is_some() {
                return Ok(());
            }
            state.transferred.take().ok_or(AttachmentError::Disposed)?
        };

        let result = encrypter.encrypt(&plaintext).await;

        let mut state = self.lock();
        match result {
            Ok(encrypted) => {
                self.size
                    .store(encrypted.body.len() as u64, Ordering::Relaxed);
                state.transferred = Some(encrypted.body);
                state.encryption_info = Some(encrypted.info);
                Ok(())
            }
            Err(err) => {
                state.transferred = Some(plaintext);
                Err(err)
            }
        }
    }

    async fn upload(
        &self,
        api: &dyn HomeServerApi,
        progress: &UploadProgress<'_>,
    ) -> Result<(), AttachmentError> {
        let (transfer, mut transferred) = watch::channel(0);
        let handle = {
            let mut state = self.lock();
            if state.aborted {
                return Err(AttachmentError::Aborted);
            }
            if state.content_uri.is_some() {
                drop(state);
                self.advance(self.size(), progress);
                return Ok(());
            }
            let body = state
                .transferred
                .clone()
                .ok_or(AttachmentError::Disposed)?;
            let handle = api.upload(
                UploadRequest {
                    file_name: self.file_name.clone(),
                    mime_type: self.mime_type.clone(),
                    body,
                },
                transfer,
            );
            state.request = Some(handle.clone());
            handle
        };

        let response = handle.response();
        tokio::pin!(response);
        let response = loop {
            tokio::select! {
                response = &mut response => break response,
                Ok(()) = transferred.changed() => {
                    let sent = *transferred.borrow_and_update();
                    self.advance(sent, progress);
                }
            }
        };

        let mut state = self.lock();
        state.request = None;
        let response = response?;
        state.content_uri = Some(response.content_uri);
        drop(state);

        self.advance(self.size(), progress);
        Ok(())
    }

    fn abort(&self) {
        let request = {
            let mut state = self.lock();
            state.aborted = true;
            state.request.take()
        };
        if let Some(request) = request {
            request.abort();
        }
    }

    fn dispose(&self) {
        self.lock().transferred = None;
    }

    fn apply_to_content(&self, key: &str, content: Content) -> Result<Content, AttachmentError> {
        let state = self.lock();
        let Some(uri) = state.content_uri.clone() else {
            return Err(AttachmentError::NotUploaded {
                key: key.to_string(),
            });
        };

        let prefix = key.rfind("url").map_or("", |idx| &key[..idx]);
        let content = content
            .with_path(&format!("{prefix}info.size"), self.plaintext_size)
            .with_path(&format!("{prefix}info.mimetype"), self.mime_type.clone());

        let content = match &state.encryption_info {
            Some(info) => {
                let mut file = info.clone();
                if let Value::Object(map) = &mut file {
                    map.insert("mimetype".into(), Value::from(self.mime_type.clone()));
                    map.insert("url".into(), Value::from(uri));
                }
                content.with_path(&format!("{prefix}file"), file)
            }
            None => content.with_path(&format!("{prefix}url"), uri),
        };
        Ok(content)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::attachment::AttachmentSet;
    use crate::pending_event::PendingEventUpdate;
    use crate::transport::InMemoryHomeServer;
    use serde_json::json;
    use tokio::sync::broadcast;

    struct ReverseEncrypter;

    #[async_trait]
    impl BlobEncrypter for ReverseEncrypter {
        async fn encrypt(&self, plaintext: &[u8]) -> Result<EncryptedBlob, AttachmentError> {
            let mut body = plaintext.to_vec();
            body.reverse();
            body.extend_from_slice(b"!!");
            Ok(EncryptedBlob {
                body,
                info: json!({"v": "v2", "key": {"k": "secret"}}),
            })
        }
    }

    #[tokio::test]
    async fn plaintext_upload_sets_url_and_info() {
        let server = InMemoryHomeServer::new();
        let blob = Arc::new(BlobAttachment::new(vec![1; 10], "image/png").with_file_name("a.png"));
        let set = AttachmentSet::new().with("url", blob.clone());
        let (tx, mut rx) = broadcast::channel(8);

        blob.upload(&server, &UploadProgress::new(&set, &tx))
            .await
            .expect("upload");

        assert_eq!(blob.sent_bytes(), 10);
        assert_eq!(
            rx.try_recv().expect("progress"),
            PendingEventUpdate::AttachmentsSentBytes { sent: 10, total: 10 }
        );

        let content = blob
            .apply_to_content("url", Content::new().with_path("body", "hi"))
            .expect("apply");
        let uri = blob.content_uri().expect("uri");
        assert_eq!(
            content.into_value(),
            json!({"body": "hi", "url": uri, "info": {"size": 10, "mimetype": "image/png"}})
        );
        assert_eq!(server.uploads()[0].file_name.as_deref(), Some("a.png"));
    }

    #[tokio::test]
    async fn encrypted_upload_sets_file_under_prefix() {
        let server = InMemoryHomeServer::new();
        let blob = Arc::new(
            BlobAttachment::new(b"thumb".to_vec(), "image/jpeg")
                .with_encrypter(Arc::new(ReverseEncrypter)),
        );
        let set = AttachmentSet::new().with("info.thumbnail_url", blob.clone());
        let (tx, _rx) = broadcast::channel(8);

        blob.encrypt().await.expect("encrypt");
        blob.encrypt().await.expect("encrypt twice");
        assert!(blob.is_encrypted());
        assert_eq!(blob.size(), 7);

        blob.upload(&server, &UploadProgress::new(&set, &tx))
            .await
            .expect("upload");
        assert_eq!(server.uploads()[0].body, b"bmuht!!".to_vec());

        let content = blob
            .apply_to_content("info.thumbnail_url", Content::new())
            .expect("apply");
        let uri = blob.content_uri().expect("uri");
        assert_eq!(
            content.get_path("info.thumbnail_file.url"),
            Some(&json!(uri))
        );
        assert_eq!(
            content.get_path("info.thumbnail_file.mimetype"),
            Some(&json!("image/jpeg"))
        );
        assert_eq!(content.get_path("info.thumbnail_info.size"), Some(&json!(5)));
        assert!(content.get_path("info.thumbnail_url").is_none());
    }

    #[tokio::test]
    async fn apply_before_upload_fails() {
        let blob = BlobAttachment::new(vec![0; 3], "text/plain");
        let err = blob.apply_to_content("url", Content::new()).unwrap_err();
        assert_eq!(err, AttachmentError::NotUploaded { key: "url".into() });
    }

    #[tokio::test]
    async fn progress_grows_while_transferring() {
        let server = InMemoryHomeServer::new().with_latency(std::time::Duration::from_millis(20));
        let blob = Arc::new(BlobAttachment::new(vec![7; 4096], "image/png"));
        let set = AttachmentSet::new().with("url", blob.clone());
        let (tx, mut rx) = broadcast::channel(16);

        blob.upload(&server, &UploadProgress::new(&set, &tx))
            .await
            .expect("upload");

        let mut sent = Vec::new();
        while let Ok(update) = rx.try_recv() {
            if let PendingEventUpdate::AttachmentsSentBytes { sent: bytes, total } = update {
                assert_eq!(total, 4096);
                sent.push(bytes);
            }
        }
        assert!(sent.len() > 1, "progress: {sent:?}");
        assert!(sent.windows(2).all(|w| w[0] <= w[1]));
        assert!(sent[0] < 4096);
        assert_eq!(sent.last(), Some(&4096));
    }

    #[tokio::test]
    async fn disposed_blob_reports_disposed() {
        let server = InMemoryHomeServer::new();
        let blob = Arc::new(
            BlobAttachment::new(vec![1; 8], "image/png").with_encrypter(Arc::new(ReverseEncrypter)),
        );
        let set = AttachmentSet::new().with("url", blob.clone());
        let (tx, _rx) = broadcast::channel(8);

        blob.dispose();

        assert_eq!(blob.encrypt().await, Err(AttachmentError::Disposed));
        assert_eq!(
            blob.upload(&server, &UploadProgress::new(&set, &tx)).await,
            Err(AttachmentError::Disposed)
        );
        assert!(server.uploads().is_empty());
    }

    #[tokio::test]
    async fn encrypt_without_encrypter_fails() {
        let blob = BlobAttachment::new(vec![0; 3], "text/plain");
        assert!(matches!(
            blob.encrypt().await,
            Err(AttachmentError::Encrypt { .. })
        ));
    }

    #[tokio::test]
    async fn abort_cancels_in_flight_upload() {
        let server = InMemoryHomeServer::new().with_latency(std::time::Duration::from_secs(30));
        let blob = Arc::new(BlobAttachment::new(vec![0; 3], "text/plain"));
        let set = AttachmentSet::new().with("url", blob.clone());
        let (tx, _rx) = broadcast::channel(8);

        let upload = {
            let blob = blob.clone();
            let server = server.clone();
            let set = set.clone();
            let tx = tx.clone();
            tokio::spawn(async move { blob.upload(&server, &UploadProgress::new(&set, &tx)).await })
        };
        while server.uploads().is_empty() {
            tokio::task::yield_now().await;
        }
        blob.abort();

        let err = upload.await.expect("join").unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(server.aborted_requests(), 1);
        assert_eq!(blob.sent_bytes(), 0);
    }
}
