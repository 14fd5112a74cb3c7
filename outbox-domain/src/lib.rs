//! 出站消息生命周期管理（outbox-domain）
//!
//! 负责把一条排队中的消息（待发送事件）从创建推进到终态：
//! - 附件（`attachment`）的加密与按大小升序上传，结果合并进事件内容（`content`）；
//! - 通过网络层（`transport`）以事务 ID 幂等发送，记录服务端事件 ID；
//! - 协作式取消、状态与上传进度的变更通知（`pending_event`）。
//!
//! 发件箱列表本身的持久化、多条消息之间的排序与重试调度由调用方负责，
//! 本 crate 只约定协作者接口，并提供内存实现以便测试与演示。
//!
//! 典型用法：
//! 1. 从发件箱加载 `PendingEventRecord`，连同附件集合构造 `PendingEvent`；
//! 2. 依次调用 `upload_attachments` 与 `send`；
//! 3. 通过 `subscribe`/`updates` 观察状态，必要时调用 `abort`。
//!
pub mod attachment;
pub mod content;
pub mod error;
pub mod pending_event;
pub mod transport;
