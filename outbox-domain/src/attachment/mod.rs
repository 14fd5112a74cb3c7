//! 附件（attachment）
//!
//! - `Attachment`：附件能力协议（加密、上传、取消、释放、合并内容）；
//! - `AttachmentSet`：按内容路径索引的附件集合，提供升序上传顺序与字节汇总；
//! - `UploadProgress`：上传进度上报；
//! - `BlobAttachment`：内存缓冲区实现，加密算法通过 `BlobEncrypter` 注入。
//!
#[cfg(feature = "inmemory")]
mod blob;
mod capability;
mod set;

#[cfg(feature = "inmemory")]
pub use blob::{BlobAttachment, BlobEncrypter, EncryptedBlob};
pub use capability::{Attachment, UploadProgress};
pub use set::AttachmentSet;
