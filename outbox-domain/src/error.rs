//! 发送链路统一错误定义
//!
//! 聚焦待发送事件生命周期中会出现的最小必要集合：
//! - `TransportError`：网络层（发送/上传请求）的不透明失败；
//! - `AttachmentError`：附件加密、上传与合并内容时的失败；
//! - `SendError`：对外暴露的错误，附带房间与事务 ID 便于诊断。
//!
use thiserror::Error;

/// 网络层错误（由 `HomeServerApi` 的请求句柄返回）
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum TransportError {
    #[error("request aborted")]
    Aborted,
    #[error("http error: status={status}, reason={reason}")]
    Http { status: u16, reason: String },
    #[error("connection error: {reason}")]
    Connection { reason: String },
}

impl TransportError {
    pub fn http(status: u16, reason: impl Into<String>) -> Self {
        Self::Http {
            status,
            reason: reason.into(),
        }
    }

    pub fn connection(reason: impl Into<String>) -> Self {
        Self::Connection {
            reason: reason.into(),
        }
    }
}

/// 附件错误（由 `Attachment` 实现返回）
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AttachmentError {
    #[error("attachment aborted")]
    Aborted,
    /// 资源已释放，无法再加密或上传
    #[error("attachment disposed")]
    Disposed,
    #[error("encrypt failed: {reason}")]
    Encrypt { reason: String },
    #[error("upload failed: {source}")]
    Upload {
        #[from]
        source: TransportError,
    },
    #[error("upload has not finished: key={key}")]
    NotUploaded { key: String },
}

impl AttachmentError {
    pub fn encrypt(reason: impl Into<String>) -> Self {
        Self::Encrypt {
            reason: reason.into(),
        }
    }

    /// 是否为取消信号（包括底层请求被取消）
    pub fn is_aborted(&self) -> bool {
        matches!(
            self,
            Self::Aborted
                | Self::Upload {
                    source: TransportError::Aborted
                }
        )
    }
}

/// 待发送事件对外暴露的错误
#[non_exhaustive]
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum SendError {
    #[error("missing attachments: room={room_id}, txn_id={txn_id}")]
    MissingAttachments { room_id: String, txn_id: String },
    #[error("aborted: room={room_id}, txn_id={txn_id}")]
    Aborted { room_id: String, txn_id: String },
    #[error("attachment failure: room={room_id}, txn_id={txn_id}, key={key}, reason={source}")]
    Attachment {
        room_id: String,
        txn_id: String,
        key: String,
        #[source]
        source: AttachmentError,
    },
    #[error("transport failure: room={room_id}, txn_id={txn_id}, reason={source}")]
    Transport {
        room_id: String,
        txn_id: String,
        #[source]
        source: TransportError,
    },
}

impl SendError {
    /// 用户主动取消：调用方不应将其视为投递失败展示给用户
    pub fn is_aborted(&self) -> bool {
        matches!(self, Self::Aborted { .. })
    }

    pub fn room_id(&self) -> &str {
        match self {
            Self::MissingAttachments { room_id, .. }
            | Self::Aborted { room_id, .. }
            | Self::Attachment { room_id, .. }
            | Self::Transport { room_id, .. } => room_id,
        }
    }

    pub fn txn_id(&self) -> &str {
        match self {
            Self::MissingAttachments { txn_id, .. }
            | Self::Aborted { txn_id, .. }
            | Self::Attachment { txn_id, .. }
            | Self::Transport { txn_id, .. } => txn_id,
        }
    }
}

/// 统一 Result 类型别名
pub type SendResult<T> = Result<T, SendError>;
