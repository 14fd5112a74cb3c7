//! 待发送事件（pending event）
//!
//! 定义出站消息的持久化形态（`PendingEventRecord`）、状态机（`SendStatus`）、
//! 变更通知（`PendingEventUpdate`）以及驱动完整生命周期的 `PendingEvent`。

mod lifecycle;
mod record;
mod send_status;
mod update;

pub use lifecycle::{PendingEvent, PendingEventConfig, RemoveCallback};
pub use record::PendingEventRecord;
pub use send_status::SendStatus;
pub use update::PendingEventUpdate;
