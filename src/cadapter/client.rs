//! The wire seam between the upload core and the remote object store.

use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::HashMap;

/// Object metadata forwarded when a multipart upload is created
/// (content-type, user headers, and the like).
pub type ObjectMeta = HashMap<String, String>;

/// One `(part_number, etag)` pair of the finalization payload. The list
/// handed to `complete_multipart_upload` must be sorted by part number and
/// contiguous from 1.
pub type CompletedPartId = (i32, String);

/// Multipart operations against an S3-compatible store.
///
/// `path` identifies the object; for part copies and ranged reads it also
/// identifies the previous version of the same object, which remains intact
/// until `complete_multipart_upload` replaces it.
#[async_trait]
pub trait RemoteStore: Send + Sync + 'static {
    /// Start a multipart upload and return its upload id.
    async fn create_multipart_upload(&self, path: &str, meta: &ObjectMeta) -> Result<String>;

    /// Upload one part and return its etag. `part_num` is 1-based.
    async fn upload_part(
        &self,
        path: &str,
        upload_id: &str,
        part_num: i32,
        data: Bytes,
    ) -> Result<String>;

    /// Produce one part by server-side copy of `[source_start,
    /// source_start+source_size)` from the previous object version.
    async fn upload_part_copy(
        &self,
        path: &str,
        upload_id: &str,
        part_num: i32,
        source_start: u64,
        source_size: u64,
    ) -> Result<String>;

    /// Commit the upload. `parts` must be sorted by part number and
    /// contiguous from 1.
    async fn complete_multipart_upload(
        &self,
        path: &str,
        upload_id: &str,
        parts: &[CompletedPartId],
    ) -> Result<()>;

    /// Release an upload that will not be completed.
    async fn abort_multipart_upload(&self, path: &str, upload_id: &str) -> Result<()>;

    /// Read a range of the previous object version into `buf`. Returns the
    /// number of bytes read; short reads past the object end are not an
    /// error and leave the remainder of `buf` untouched.
    async fn get_object_range(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize>;
}
