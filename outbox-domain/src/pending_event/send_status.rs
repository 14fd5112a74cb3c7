use serde::{Deserialize, Serialize};
use std::fmt;

/// 待发送事件的状态
///
/// 正常路径：`Waiting → EncryptingAttachments → UploadingAttachments → Encrypting → Sending → Sent`。
/// 无需上传时跳过两个附件阶段；`Encrypting`（消息体加密）由调用方设置；
/// 任一进行中状态都可能进入 `Error`。
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum SendStatus {
    #[default]
    Waiting,
    EncryptingAttachments,
    UploadingAttachments,
    Encrypting,
    Sending,
    Sent,
    Error,
}

impl SendStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Sent)
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Waiting => "waiting",
            Self::EncryptingAttachments => "encrypting_attachments",
            Self::UploadingAttachments => "uploading_attachments",
            Self::Encrypting => "encrypting",
            Self::Sending => "sending",
            Self::Sent => "sent",
            Self::Error => "error",
        }
    }
}

impl fmt::Display for SendStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}
