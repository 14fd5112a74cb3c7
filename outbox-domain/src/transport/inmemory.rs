//! 内存版主服务器（InMemoryHomeServer）
//!
//! 满足 `HomeServerApi` 协议的轻量实现：
//! - `send`：记录请求，按 `(room_id, txn_id)` 幂等分配 `$` 前缀的事件 ID；
//! - `upload`：记录上传，分配 `mxc://` 内容 URI；
//! - 支持注入失败与响应延迟，延迟期间请求可被取消；
//! - 成功的上传在延迟窗口内分段报告传输进度；
//! - 典型用途：测试环境、示例与本地开发。
//!
use crate::error::TransportError;
use crate::transport::{
    HomeServerApi, RequestHandle, SendRequest, SendResponse, TransferProgress, UploadRequest,
    UploadResponse,
};
use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

/// 上传进度分段数
const PROGRESS_STEPS: u32 = 4;

#[derive(Clone, Default)]
pub struct InMemoryHomeServer {
    inner: Arc<Inner>,
    latency: Duration,
}

#[derive(Default)]
struct Inner {
    state: Mutex<ServerState>,
    aborted: AtomicUsize,
}

#[derive(Default)]
struct ServerState {
    sent: Vec<SendRequest>,
    uploads: Vec<UploadRequest>,
    event_ids: HashMap<(String, String), String>,
    send_failures: VecDeque<TransportError>,
    upload_failures: VecDeque<TransportError>,
}

impl InMemoryHomeServer {
    pub fn new() -> Self {
        Self::default()
    }

    /// 为每个响应增加固定延迟（延迟期间可被取消）
    pub fn with_latency(mut self, latency: Duration) -> Self {
        self.latency = latency;
        self
    }

    /// 下一次发送以给定错误失败
    pub fn fail_next_send(&self, error: TransportError) {
        self.lock().send_failures.push_back(error);
    }

    /// 下一次上传以给定错误失败
    pub fn fail_next_upload(&self, error: TransportError) {
        self.lock().upload_failures.push_back(error);
    }

    /// 已收到的发送请求（含被取消的）
    pub fn sent(&self) -> Vec<SendRequest> {
        self.lock().sent.clone()
    }

    pub fn uploads(&self) -> Vec<UploadRequest> {
        self.lock().uploads.clone()
    }

    /// 被调用方取消的请求数
    pub fn aborted_requests(&self) -> usize {
        self.inner.aborted.load(Ordering::Relaxed)
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, ServerState> {
        self.inner
            .state
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
    }

    fn request<T: Send + 'static>(
        &self,
        outcome: Result<T, TransportError>,
        progress: Option<(TransferProgress, u64)>,
    ) -> Arc<dyn RequestHandle<T>> {
        Arc::new(InMemoryRequest {
            outcome: Mutex::new(Some(outcome)),
            progress,
            latency: self.latency,
            token: CancellationToken::new(),
            server: self.inner.clone(),
        })
    }
}

impl HomeServerApi for InMemoryHomeServer {
    fn send(&self, request: SendRequest) -> Arc<dyn RequestHandle<SendResponse>> {
        let outcome = {
            let mut state = self.lock();
            let key = (request.room_id.clone(), request.txn_id.clone());
            state.sent.push(request);
            match state.send_failures.pop_front() {
                Some(err) => Err(err),
                None => {
                    let event_id = state
                        .event_ids
                        .entry(key)
                        .or_insert_with(|| format!("${}", Uuid::new_v4().simple()))
                        .clone();
                    Ok(SendResponse { event_id })
                }
            }
        };
        self.request(outcome, None)
    }

    fn upload(
        &self,
        request: UploadRequest,
        progress: TransferProgress,
    ) -> Arc<dyn RequestHandle<UploadResponse>> {
        let total = request.body.len() as u64;
        let outcome = {
            let mut state = self.lock();
            state.uploads.push(request);
            match state.upload_failures.pop_front() {
                Some(err) => Err(err),
                None => Ok(UploadResponse {
                    content_uri: format!("mxc://inmemory/{}", Uuid::new_v4().simple()),
                }),
            }
        };
        // 失败的上传不报告进度
        let progress = outcome.is_ok().then_some((progress, total));
        self.request(outcome, progress)
    }
}

struct InMemoryRequest<T> {
    outcome: Mutex<Option<Result<T, TransportError>>>,
    progress: Option<(TransferProgress, u64)>,
    latency: Duration,
    token: CancellationToken,
    server: Arc<Inner>,
}

#[async_trait]
impl<T: Send + 'static> RequestHandle<T> for InMemoryRequest<T> {
    async fn response(&self) -> Result<T, TransportError> {
        let steps = if self.progress.is_some() { PROGRESS_STEPS } else { 1 };
        for step in 1..=steps {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => return Err(TransportError::Aborted),
                _ = tokio::time::sleep(self.latency / steps) => {}
            }
            if let Some((progress, total)) = &self.progress {
                progress.send_replace(total * u64::from(step) / u64::from(steps));
            }
        }

        self.outcome
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .take()
            .unwrap_or_else(|| Err(TransportError::connection("response already consumed")))
    }

    fn abort(&self) {
        if !self.token.is_cancelled() {
            self.token.cancel();
            self.server.aborted.fetch_add(1, Ordering::Relaxed);
        }
    }
}
