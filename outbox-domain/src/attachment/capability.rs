//! 附件能力（Attachment）协议
//!
//! 附件由待发送事件独占其生命周期：加密、上传、取消与释放均由事件驱动，
//! 上传完成后通过 `apply_to_content` 把资源引用写入事件内容。
//!
use crate::attachment::AttachmentSet;
use crate::content::Content;
use crate::error::AttachmentError;
use crate::pending_event::PendingEventUpdate;
use crate::transport::HomeServerApi;
use async_trait::async_trait;
use tokio::sync::broadcast;

/// 可独立加密与上传的二进制附件
#[async_trait]
pub trait Attachment: Send + Sync {
    /// 待传输的字节数（加密后可能变化）
    fn size(&self) -> u64;

    /// 已传输的字节数，上传期间单调不减
    fn sent_bytes(&self) -> u64;

    /// 加密附件内容；重复调用应当是安全的
    async fn encrypt(&self) -> Result<(), AttachmentError>;

    /// 上传附件，传输过程中通过 `progress` 报告进度
    async fn upload(
        &self,
        api: &dyn HomeServerApi,
        progress: &UploadProgress<'_>,
    ) -> Result<(), AttachmentError>;

    /// 取消进行中的加密/上传（协作式）
    fn abort(&self);

    /// 释放缓冲区、文件句柄等资源
    fn dispose(&self);

    /// 将上传结果合并进内容，`key` 为内容中的点分路径
    fn apply_to_content(&self, key: &str, content: Content) -> Result<Content, AttachmentError>;
}

/// 上传进度上报器：汇总整个附件集合的已发送字节数并广播
pub struct UploadProgress<'a> {
    attachments: &'a AttachmentSet,
    updates: &'a broadcast::Sender<PendingEventUpdate>,
}

impl<'a> UploadProgress<'a> {
    pub fn new(
        attachments: &'a AttachmentSet,
        updates: &'a broadcast::Sender<PendingEventUpdate>,
    ) -> Self {
        Self {
            attachments,
            updates,
        }
    }

    pub fn report(&self) {
        let update = PendingEventUpdate::AttachmentsSentBytes {
            sent: self.attachments.sent_bytes(),
            total: self.attachments.total_bytes(),
        };
        // 无订阅者时 send 返回错误，视为非致命
        let _ = self.updates.send(update);
    }
}
