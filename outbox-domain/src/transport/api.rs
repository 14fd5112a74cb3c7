//! 网络层协议（HomeServerApi）
//!
//! 待发送事件只依赖两种能力：按事务 ID 发送事件、上传附件二进制。
//! 两者都返回可取消的请求句柄，句柄在发出时即可获得，便于在等待响应期间被 `abort()`。
//! 上传过程中，实现方通过 `TransferProgress` 写入累计已传输的字节数。
//!
use crate::content::Content;
use crate::error::TransportError;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::watch;

/// 上传进度通道：值为累计已传输字节数，只增不减
pub type TransferProgress = watch::Sender<u64>;

/// 进行中的请求句柄
#[async_trait]
pub trait RequestHandle<T: Send + 'static>: Send + Sync {
    /// 等待响应；请求被取消时返回 `TransportError::Aborted`
    async fn response(&self) -> Result<T, TransportError>;

    /// 取消请求（可重复调用）
    fn abort(&self);
}

/// 主服务器客户端能力
pub trait HomeServerApi: Send + Sync {
    /// 发送事件；服务端以 `(room_id, txn_id)` 去重，重复发送是安全的
    fn send(&self, request: SendRequest) -> Arc<dyn RequestHandle<SendResponse>>;

    /// 上传附件内容，返回内容 URI；传输期间向 `progress` 报告累计字节数
    fn upload(
        &self,
        request: UploadRequest,
        progress: TransferProgress,
    ) -> Arc<dyn RequestHandle<UploadResponse>>;
}

#[derive(Debug, Clone, PartialEq)]
pub struct SendRequest {
    pub room_id: String,
    pub event_type: String,
    pub txn_id: String,
    pub content: Content,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendResponse {
    pub event_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UploadRequest {
    pub file_name: Option<String>,
    pub mime_type: String,
    pub body: Vec<u8>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct UploadResponse {
    pub content_uri: String,
}
