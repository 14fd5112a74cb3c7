//! 待发送事件的持久化形态（PendingEventRecord）
//!
//! 由发件箱存储保存与加载；`PendingEvent` 在运行期修改其中的内容与标记，
//! 调用方可通过 `PendingEvent::record()` 取回最新快照写回存储。
//!
use crate::content::Content;
use bon::Builder;
use serde::{Deserialize, Serialize};
use uuid::Uuid;

#[derive(Debug, Clone, PartialEq, Builder, Serialize, Deserialize)]
pub struct PendingEventRecord {
    /// 所属房间
    #[builder(into)]
    pub(super) room_id: String,
    /// 在该房间发件箱中的位置（稳定排序键）
    pub(super) queue_index: u64,
    /// 明文事件类型
    #[builder(into)]
    pub(super) event_type: String,
    /// 事务 ID，用于传输层幂等
    #[builder(into, default = PendingEventRecord::new_txn_id())]
    pub(super) txn_id: String,
    /// 服务端分配的事件 ID，仅在发送成功后存在
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) remote_id: Option<String>,
    /// 明文内容，附件上传结果会合并进来
    #[builder(default)]
    #[serde(default)]
    pub(super) content: Content,
    #[builder(default)]
    #[serde(default)]
    pub(super) needs_encryption: bool,
    #[builder(default)]
    #[serde(default)]
    pub(super) needs_upload: bool,
    /// 加密后的事件类型，存在时优先于明文发送
    #[builder(into)]
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) encrypted_event_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub(super) encrypted_content: Option<Content>,
}

impl PendingEventRecord {
    /// 生成客户端事务 ID
    pub fn new_txn_id() -> String {
        format!("t{}", Uuid::new_v4().simple())
    }

    pub fn room_id(&self) -> &str {
        &self.room_id
    }

    pub fn queue_index(&self) -> u64 {
        self.queue_index
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn txn_id(&self) -> &str {
        &self.txn_id
    }

    pub fn remote_id(&self) -> Option<&str> {
        self.remote_id.as_deref()
    }

    pub fn content(&self) -> &Content {
        &self.content
    }

    pub fn needs_encryption(&self) -> bool {
        self.needs_encryption
    }

    pub fn needs_upload(&self) -> bool {
        self.needs_upload
    }

    pub fn encrypted_event_type(&self) -> Option<&str> {
        self.encrypted_event_type.as_deref()
    }

    pub fn encrypted_content(&self) -> Option<&Content> {
        self.encrypted_content.as_ref()
    }
}
