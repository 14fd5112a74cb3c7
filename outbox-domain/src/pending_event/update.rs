use super::SendStatus;

/// 可观察字段的变更通知（状态与附件已发送字节数）
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PendingEventUpdate {
    Status(SendStatus),
    AttachmentsSentBytes { sent: u64, total: u64 },
}
