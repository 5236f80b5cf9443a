// Library crate for altofs: the multipart upload core of an S3-backed
// user-space file system. The host file system feeds dirty byte ranges into a
// per-open-file handle; the handle plans which ranges become uploaded parts,
// server-side copies, or gap downloads, and drives them in parallel against
// the remote store.

pub mod cadapter;
pub mod config;
pub mod daemon;
pub mod error;
pub mod upload;

// Public surface for embedding the upload core into a file system host.
pub use crate::cadapter::client::{ObjectMeta, RemoteStore};
pub use crate::cadapter::memory::MemoryStore;
pub use crate::cadapter::s3::{S3Config, S3Store};
pub use crate::config::{MAX_PART_NUM, MAX_PART_SIZE, MIN_PART_SIZE, UploadConfig};
pub use crate::daemon::scanner::CacheScanner;
pub use crate::error::UploadError;
pub use crate::upload::ByteRange;
pub use crate::upload::handle::{HandleFlags, UploadHandle};
pub use crate::upload::pseudofd::PseudoFdPool;
