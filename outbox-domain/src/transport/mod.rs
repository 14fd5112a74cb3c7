//! 网络层（transport）
//!
//! - `HomeServerApi`：发送事件与上传附件的客户端能力；
//! - `RequestHandle`：可取消的进行中请求；
//! - `InMemoryHomeServer`：内存实现，用于测试与示例。
//!
pub mod api;
#[cfg(feature = "inmemory")]
pub mod inmemory;

pub use api::{
    HomeServerApi, RequestHandle, SendRequest, SendResponse, TransferProgress, UploadRequest,
    UploadResponse,
};
#[cfg(feature = "inmemory")]
pub use inmemory::InMemoryHomeServer;
