//! 待发送事件（PendingEvent）
//!
//! 驱动单条出站消息的完整生命周期：
//! - `upload_attachments`：按需加密附件（顺序执行），再按大小升序上传并合并进内容；
//! - `send`：以事务 ID 发出一次可取消的发送请求，成功后记录远端事件 ID；
//! - `abort`：协作式取消，幂等，唯一一次调用移除回调；
//! - `dispose`：释放附件资源。
//!
//! 所有方法均接收 `&self`：状态读取与 `abort` 可以在异步阶段挂起期间随时调用。
//! 内部状态由短暂持有的互斥锁保护，锁不会跨越 `.await`。
//!
use super::{PendingEventRecord, PendingEventUpdate, SendStatus};
use crate::attachment::{Attachment, AttachmentSet, UploadProgress};
use crate::content::Content;
use crate::error::{AttachmentError, SendError, SendResult, TransportError};
use crate::transport::{HomeServerApi, RequestHandle, SendRequest, SendResponse};
use bon::bon;
use futures_core::stream::BoxStream;
use futures_util::{StreamExt, future};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError};
use tokio::sync::broadcast;
use tokio_stream::wrappers::BroadcastStream;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, debug, info, info_span, warn};

/// 从所属发件箱中移除该事件的回调，最多调用一次
pub type RemoveCallback = Box<dyn FnOnce() + Send>;

/// 待发送事件配置
#[derive(Clone, Copy, Debug)]
pub struct PendingEventConfig {
    /// 变更通知广播缓冲区容量
    pub update_capacity: usize,
}

impl Default for PendingEventConfig {
    fn default() -> Self {
        Self {
            update_capacity: 64,
        }
    }
}

/// 单条出站消息：持有持久化记录、附件与发送状态，驱动其从排队到送达或取消
pub struct PendingEvent {
    room_id: String,
    txn_id: String,
    queue_index: u64,
    state: Mutex<State>,
    attachments: Option<AttachmentSet>,
    remove: Mutex<Option<RemoveCallback>>,
    updates: broadcast::Sender<PendingEventUpdate>,
    token: CancellationToken,
    aborted: AtomicBool,
    disposed: AtomicBool,
}

struct State {
    record: PendingEventRecord,
    status: SendStatus,
    error: Option<SendError>,
    send_request: Option<Arc<dyn RequestHandle<SendResponse>>>,
}

#[bon]
impl PendingEvent {
    /// 由持久化记录与（可选的）附件集合构造
    ///
    /// 记录要求上传但未提供附件时，`is_missing_attachments()` 为真，
    /// 随后的 `upload_attachments` 将以 `MissingAttachments` 失败。
    #[builder]
    pub fn new(
        record: PendingEventRecord,
        attachments: Option<AttachmentSet>,
        on_remove: RemoveCallback,
        #[builder(default)] config: PendingEventConfig,
    ) -> Self {
        let (updates, _rx) = broadcast::channel(config.update_capacity.max(1));
        // 已有远端 ID 的记录即为已送达
        let status = if record.remote_id.is_some() {
            SendStatus::Sent
        } else {
            SendStatus::Waiting
        };

        Self {
            room_id: record.room_id.clone(),
            txn_id: record.txn_id.clone(),
            queue_index: record.queue_index,
            state: Mutex::new(State {
                record,
                status,
                error: None,
                send_request: None,
            }),
            attachments,
            remove: Mutex::new(Some(on_remove)),
            updates,
            token: CancellationToken::new(),
            aborted: AtomicBool::new(false),
            disposed: AtomicBool::new(false),
        }
    }
}

impl PendingEvent {
    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn txn_id(&self) -> &str {
        &self.txn_id
    }

    pub fn queue_index(&self) -> u64 {
        self.queue_index
    }

    pub fn event_type(&self) -> String {
        self.lock().record.event_type.clone()
    }

    pub fn content(&self) -> Content {
        self.lock().record.content.clone()
    }

    pub fn remote_id(&self) -> Option<String> {
        self.lock().record.remote_id.clone()
    }

    pub fn encrypted_event_type(&self) -> Option<String> {
        self.lock().record.encrypted_event_type.clone()
    }

    pub fn encrypted_content(&self) -> Option<Content> {
        self.lock().record.encrypted_content.clone()
    }

    /// 当前记录快照，供发件箱写回存储
    pub fn record(&self) -> PendingEventRecord {
        self.lock().record.clone()
    }

    pub fn status(&self) -> SendStatus {
        self.lock().status
    }

    /// 仅在 `Error` 状态下存在
    pub fn error(&self) -> Option<SendError> {
        self.lock().error.clone()
    }

    pub fn aborted(&self) -> bool {
        self.aborted.load(Ordering::SeqCst)
    }

    pub fn needs_sending(&self) -> bool {
        self.lock().record.remote_id.is_none() && !self.aborted()
    }

    pub fn needs_encryption(&self) -> bool {
        self.lock().record.needs_encryption && !self.aborted()
    }

    pub fn needs_upload(&self) -> bool {
        self.lock().record.needs_upload && !self.aborted()
    }

    pub fn is_missing_attachments(&self) -> bool {
        self.needs_upload() && self.attachments.is_none()
    }

    pub fn has_started_sending(&self) -> bool {
        matches!(self.status(), SendStatus::Sending | SendStatus::Sent)
    }

    pub fn get_attachment(&self, key: &str) -> Option<&Arc<dyn Attachment>> {
        self.attachments.as_ref()?.get(key)
    }

    pub fn attachments_total_bytes(&self) -> u64 {
        self.attachments
            .as_ref()
            .map_or(0, AttachmentSet::total_bytes)
    }

    pub fn attachments_sent_bytes(&self) -> u64 {
        self.attachments
            .as_ref()
            .map_or(0, AttachmentSet::sent_bytes)
    }

    /// 订阅变更通知
    pub fn subscribe(&self) -> broadcast::Receiver<PendingEventUpdate> {
        self.updates.subscribe()
    }

    /// 返回一个 'static 生命周期的变更流，落后被丢弃的通知直接跳过
    pub fn updates(&self) -> BoxStream<'static, PendingEventUpdate> {
        Box::pin(
            BroadcastStream::new(self.updates.subscribe())
                .filter_map(|r| future::ready(r.ok())),
        )
    }

    /// 调用方开始加密消息体
    pub fn set_encrypting(&self) {
        self.set_status(SendStatus::Encrypting);
    }

    /// 调用方完成消息体加密；之后发送将使用加密后的类型与内容
    pub fn set_encrypted(&self, event_type: impl Into<String>, content: Content) {
        let mut state = self.lock();
        state.record.encrypted_event_type = Some(event_type.into());
        state.record.encrypted_content = Some(content);
        state.record.needs_encryption = false;
    }

    /// 记录调用方侧的失败（例如消息体加密失败）
    pub fn set_error(&self, error: SendError) {
        {
            let mut state = self.lock();
            state.status = SendStatus::Error;
            state.error = Some(error);
        }
        self.emit(PendingEventUpdate::Status(SendStatus::Error));
    }

    /// 重新排队等待下一次尝试
    pub fn set_waiting(&self) {
        {
            let mut state = self.lock();
            state.status = SendStatus::Waiting;
            state.error = None;
        }
        self.emit(PendingEventUpdate::Status(SendStatus::Waiting));
    }

    /// 加密并上传附件，结果合并进内容
    ///
    /// 无需上传时立即返回且不改变状态。任一附件失败即整体失败，
    /// 已合并的附件结果保留在内容中，重试时可继续使用。
    pub async fn upload_attachments(&self, api: &dyn HomeServerApi) -> SendResult<()> {
        let span = info_span!(
            "upload_attachments",
            room_id = %self.room_id,
            queue_index = self.queue_index,
            txn_id = %self.txn_id,
        );
        self.run_upload(api).instrument(span).await
    }

    /// 发送事件
    ///
    /// 前置条件：`needs_sending()` 为真。成功后事件进入终态 `Sent`，调用方不应再次发送。
    pub async fn send(&self, api: &dyn HomeServerApi) -> SendResult<()> {
        let span = info_span!(
            "send",
            room_id = %self.room_id,
            queue_index = self.queue_index,
            txn_id = %self.txn_id,
        );
        self.run_send(api).instrument(span).await
    }

    /// 取消：标记取消、取消全部附件与进行中的请求、从发件箱移除
    ///
    /// 幂等；不改变 `status`。
    pub fn abort(&self) {
        if self.aborted.swap(true, Ordering::SeqCst) {
            return;
        }
        self.token.cancel();

        if let Some(attachments) = &self.attachments {
            attachments.abort_all();
        }

        let request = self.lock().send_request.take();
        if let Some(request) = request {
            request.abort();
        }

        let remove = self
            .remove
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take();
        if let Some(remove) = remove {
            remove();
        }
        debug!(room_id = %self.room_id, txn_id = %self.txn_id, "pending event aborted");
    }

    /// 释放附件资源；可在任意阶段、取消之后或重复调用
    pub fn dispose(&self) {
        if self.disposed.swap(true, Ordering::SeqCst) {
            return;
        }
        if let Some(attachments) = &self.attachments {
            attachments.dispose_all();
        }
    }

    async fn run_upload(&self, api: &dyn HomeServerApi) -> SendResult<()> {
        self.ensure_not_aborted()?;
        if !self.needs_upload() {
            return Ok(());
        }

        let Some(attachments) = self.attachments.as_ref() else {
            warn!("upload required but attachments are missing");
            return Err(self.fail(SendError::MissingAttachments {
                room_id: self.room_id.clone(),
                txn_id: self.txn_id.clone(),
            }));
        };

        match self.transfer(api, attachments).await {
            Ok(()) => {
                debug!(count = attachments.len(), "attachments uploaded");
                Ok(())
            }
            Err(_) if self.aborted() => {
                debug!("attachment upload aborted");
                Err(self.aborted_error())
            }
            Err(err) => {
                warn!(error = %err, "attachment upload failed");
                Err(self.fail(err))
            }
        }
    }

    async fn transfer(&self, api: &dyn HomeServerApi, attachments: &AttachmentSet) -> SendResult<()> {
        if self.needs_encryption() {
            self.set_status(SendStatus::EncryptingAttachments);
            for (key, attachment) in attachments.iter() {
                debug!(key, size = attachment.size(), "encrypting attachment");
                attachment
                    .encrypt()
                    .await
                    .map_err(|e| self.attachment_error(key, e))?;
                self.ensure_not_aborted()?;
            }
        }

        self.set_status(SendStatus::UploadingAttachments);
        let progress = UploadProgress::new(attachments, &self.updates);
        for (key, attachment) in attachments.by_size_ascending() {
            self.ensure_not_aborted()?;
            debug!(key, size = attachment.size(), "uploading attachment");
            attachment
                .upload(api, &progress)
                .await
                .map_err(|e| self.attachment_error(key, e))?;
            self.ensure_not_aborted()?;
            self.merge(key, attachment.as_ref())?;
        }

        self.lock().record.needs_upload = false;
        Ok(())
    }

    async fn run_send(&self, api: &dyn HomeServerApi) -> SendResult<()> {
        self.ensure_not_aborted()?;

        let request = {
            let mut state = self.lock();
            debug_assert!(state.record.remote_id.is_none(), "event already sent");
            state.status = SendStatus::Sending;
            let record = &state.record;
            SendRequest {
                room_id: record.room_id.clone(),
                event_type: record
                    .encrypted_event_type
                    .clone()
                    .unwrap_or_else(|| record.event_type.clone()),
                txn_id: record.txn_id.clone(),
                content: record
                    .encrypted_content
                    .clone()
                    .unwrap_or_else(|| record.content.clone()),
            }
        };
        self.emit(PendingEventUpdate::Status(SendStatus::Sending));

        let handle = api.send(request);
        self.lock().send_request = Some(handle.clone());

        // abort() 可能发生在检查之后、句柄登记之前，因此同时等待取消信号
        let result = tokio::select! {
            biased;
            _ = self.token.cancelled() => Err(TransportError::Aborted),
            response = handle.response() => response,
        };
        let unclaimed = self.lock().send_request.take();

        match result {
            Ok(response) => {
                info!(remote_id = %response.event_id, "event sent");
                {
                    let mut state = self.lock();
                    state.record.remote_id = Some(response.event_id);
                    state.status = SendStatus::Sent;
                    state.error = None;
                }
                self.emit(PendingEventUpdate::Status(SendStatus::Sent));
                Ok(())
            }
            Err(_) if self.aborted() => {
                if let Some(handle) = unclaimed {
                    handle.abort();
                }
                debug!("send aborted");
                Err(self.aborted_error())
            }
            Err(source) => {
                warn!(error = %source, "send failed");
                Err(self.fail(SendError::Transport {
                    room_id: self.room_id.clone(),
                    txn_id: self.txn_id.clone(),
                    source,
                }))
            }
        }
    }

    fn merge(&self, key: &str, attachment: &dyn Attachment) -> SendResult<()> {
        let mut state = self.lock();
        let content = state.record.content.clone();
        state.record.content = attachment
            .apply_to_content(key, content)
            .map_err(|e| self.attachment_error(key, e))?;
        Ok(())
    }

    fn ensure_not_aborted(&self) -> SendResult<()> {
        if self.aborted() {
            Err(self.aborted_error())
        } else {
            Ok(())
        }
    }

    fn aborted_error(&self) -> SendError {
        SendError::Aborted {
            room_id: self.room_id.clone(),
            txn_id: self.txn_id.clone(),
        }
    }

    fn attachment_error(&self, key: &str, source: AttachmentError) -> SendError {
        SendError::Attachment {
            room_id: self.room_id.clone(),
            txn_id: self.txn_id.clone(),
            key: key.to_string(),
            source,
        }
    }

    fn fail(&self, error: SendError) -> SendError {
        self.set_error(error.clone());
        error
    }

    fn set_status(&self, status: SendStatus) {
        self.lock().status = status;
        self.emit(PendingEventUpdate::Status(status));
    }

    fn emit(&self, update: PendingEventUpdate) {
        // 无订阅者时 send 返回错误，视为非致命
        let _ = self.updates.send(update);
    }

    fn lock(&self) -> MutexGuard<'_, State> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

impl Drop for PendingEvent {
    fn drop(&mut self) {
        self.dispose();
    }
}

#[cfg(all(test, feature = "inmemory"))]
mod tests {
    use super::*;
    use crate::transport::InMemoryHomeServer;
    use serde_json::json;
    use std::sync::atomic::AtomicUsize;

    fn record() -> PendingEventRecord {
        PendingEventRecord::builder()
            .room_id("!room:hs")
            .queue_index(1)
            .event_type("m.room.message")
            .txn_id("t1")
            .content(Content::new().with_path("body", "hi"))
            .build()
    }

    fn event(record: PendingEventRecord, removed: Arc<AtomicUsize>) -> PendingEvent {
        PendingEvent::builder()
            .record(record)
            .on_remove(Box::new(move || {
                removed.fetch_add(1, Ordering::SeqCst);
            }))
            .build()
    }

    #[tokio::test]
    async fn upload_without_attachments_is_noop() {
        let server = InMemoryHomeServer::new();
        let event = event(record(), Arc::default());
        let mut rx = event.subscribe();

        event.upload_attachments(&server).await.expect("noop");

        assert_eq!(event.status(), SendStatus::Waiting);
        assert!(rx.try_recv().is_err());
        assert!(server.uploads().is_empty());
    }

    #[tokio::test]
    async fn send_prefers_encrypted_pair() {
        let server = InMemoryHomeServer::new();
        let event = event(record(), Arc::default());

        event.set_encrypting();
        assert_eq!(event.status(), SendStatus::Encrypting);
        event.set_encrypted(
            "m.room.encrypted",
            Content::new().with_path("ciphertext", "xyz"),
        );
        event.send(&server).await.expect("send");

        let sent = server.sent();
        assert_eq!(sent[0].event_type, "m.room.encrypted");
        assert_eq!(sent[0].txn_id, "t1");
        assert_eq!(sent[0].content.get("ciphertext"), Some(&json!("xyz")));
        assert_eq!(event.status(), SendStatus::Sent);
        assert!(!event.needs_sending());
        assert!(!event.needs_encryption());
    }

    #[tokio::test]
    async fn transport_failure_sets_error() {
        let server = InMemoryHomeServer::new();
        server.fail_next_send(TransportError::http(500, "boom"));
        let event = event(record(), Arc::default());

        let err = event.send(&server).await.unwrap_err();

        assert!(matches!(err, SendError::Transport { .. }));
        assert_eq!(event.status(), SendStatus::Error);
        assert_eq!(event.error(), Some(err));
        assert!(event.needs_sending());

        event.set_waiting();
        assert!(event.error().is_none());
        event.send(&server).await.expect("retry");
        assert_eq!(event.status(), SendStatus::Sent);
    }

    #[tokio::test]
    async fn abort_is_idempotent_and_keeps_status() {
        let removed = Arc::new(AtomicUsize::new(0));
        let event = event(record(), removed.clone());

        event.abort();
        event.abort();

        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert!(event.aborted());
        assert!(!event.needs_sending());
        assert_eq!(event.status(), SendStatus::Waiting);

        let err = event.send(&InMemoryHomeServer::new()).await.unwrap_err();
        assert!(err.is_aborted());
    }

    #[tokio::test]
    async fn aborted_event_hides_pending_flags() {
        let record = PendingEventRecord::builder()
            .room_id("!room:hs")
            .queue_index(1)
            .event_type("m.room.message")
            .needs_upload(true)
            .needs_encryption(true)
            .build();
        let event = event(record, Arc::default());
        assert!(event.is_missing_attachments());

        event.abort();
        assert!(!event.needs_upload());
        assert!(!event.needs_encryption());
        assert!(!event.is_missing_attachments());
        assert!(event.record().needs_upload());
    }

    #[tokio::test]
    async fn abort_during_send_cancels_request() {
        let server = InMemoryHomeServer::new().with_latency(std::time::Duration::from_secs(30));
        let removed = Arc::new(AtomicUsize::new(0));
        let event = Arc::new(event(record(), removed.clone()));

        let sending = {
            let event = event.clone();
            let server = server.clone();
            tokio::spawn(async move { event.send(&server).await })
        };
        while !event.has_started_sending() {
            tokio::task::yield_now().await;
        }
        event.abort();

        let err = sending.await.expect("join").unwrap_err();
        assert!(err.is_aborted());
        assert_eq!(server.aborted_requests(), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert_eq!(event.status(), SendStatus::Sending);
        assert!(event.remote_id().is_none());
    }

    /// 在 `api.send` 内部触发取消，模拟 abort 落在句柄登记之前
    struct AbortingServer {
        inner: InMemoryHomeServer,
        event: Arc<PendingEvent>,
    }

    impl HomeServerApi for AbortingServer {
        fn send(&self, request: SendRequest) -> Arc<dyn RequestHandle<SendResponse>> {
            self.event.abort();
            self.inner.send(request)
        }

        fn upload(
            &self,
            request: crate::transport::UploadRequest,
            progress: crate::transport::TransferProgress,
        ) -> Arc<dyn RequestHandle<crate::transport::UploadResponse>> {
            self.inner.upload(request, progress)
        }
    }

    #[tokio::test]
    async fn abort_before_handle_is_registered_cancels_it_once() {
        let inner = InMemoryHomeServer::new().with_latency(std::time::Duration::from_secs(30));
        let removed = Arc::new(AtomicUsize::new(0));
        let event = Arc::new(event(record(), removed.clone()));
        let server = AbortingServer {
            inner: inner.clone(),
            event: event.clone(),
        };

        let err = tokio::time::timeout(std::time::Duration::from_secs(2), event.send(&server))
            .await
            .expect("send should not wait for the response")
            .unwrap_err();

        assert!(err.is_aborted());
        assert_eq!(inner.sent().len(), 1);
        assert_eq!(inner.aborted_requests(), 1);
        assert_eq!(removed.load(Ordering::SeqCst), 1);
        assert!(event.remote_id().is_none());
    }

    #[tokio::test]
    async fn transport_reported_abort_is_a_failure() {
        let server = InMemoryHomeServer::new();
        server.fail_next_send(TransportError::Aborted);
        let removed = Arc::new(AtomicUsize::new(0));
        let event = event(record(), removed.clone());

        let err = event.send(&server).await.unwrap_err();

        assert!(matches!(
            err,
            SendError::Transport {
                source: TransportError::Aborted,
                ..
            }
        ));
        assert!(!err.is_aborted());
        assert!(!event.aborted());
        assert_eq!(event.status(), SendStatus::Error);
        assert_eq!(event.error(), Some(err));
        assert_eq!(removed.load(Ordering::SeqCst), 0);
        assert!(event.needs_sending());
    }

    fn delivered_record() -> PendingEventRecord {
        PendingEventRecord::builder()
            .room_id("!room:hs")
            .queue_index(3)
            .event_type("m.room.message")
            .txn_id("t9")
            .remote_id("$old")
            .build()
    }

    #[tokio::test]
    async fn loaded_remote_id_starts_as_sent() {
        let event = event(delivered_record(), Arc::default());

        assert_eq!(event.status(), SendStatus::Sent);
        assert!(event.has_started_sending());
        assert!(!event.needs_sending());
        assert_eq!(event.remote_id().as_deref(), Some("$old"));
    }

    #[cfg(debug_assertions)]
    #[tokio::test]
    #[should_panic(expected = "event already sent")]
    async fn sending_a_delivered_event_panics_in_debug() {
        let event = event(delivered_record(), Arc::default());
        let _ = event.send(&InMemoryHomeServer::new()).await;
    }
}
