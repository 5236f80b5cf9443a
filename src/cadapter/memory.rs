//! In-memory object store for local development and testing.
//!
//! Models just enough of the multipart protocol to exercise the planner:
//! committed objects (the "previous version" served to ranged reads and part
//! copies), open upload sessions keyed by upload id, and etag bookkeeping
//! that `complete_multipart_upload` verifies the same way a real store would.

use crate::cadapter::client::{CompletedPartId, ObjectMeta, RemoteStore};
use anyhow::{Result, anyhow, bail, ensure};
use async_trait::async_trait;
use bytes::Bytes;
use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use tokio::sync::RwLock;

struct PartBody {
    data: Vec<u8>,
    etag: String,
}

struct UploadSession {
    path: String,
    parts: BTreeMap<i32, PartBody>,
}

#[derive(Default)]
pub struct MemoryStore {
    objects: RwLock<HashMap<String, Vec<u8>>>,
    uploads: RwLock<HashMap<String, UploadSession>>,
    seq: AtomicU64,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Seed a committed object, i.e. the previous version that part copies
    /// and ranged reads are served from.
    pub async fn put_object(&self, path: &str, data: &[u8]) {
        self.objects
            .write()
            .await
            .insert(path.to_string(), data.to_vec());
    }

    pub async fn object(&self, path: &str) -> Option<Vec<u8>> {
        self.objects.read().await.get(path).cloned()
    }

    /// Number of multipart uploads that are open (created but neither
    /// completed nor aborted).
    pub async fn open_uploads(&self) -> usize {
        self.uploads.read().await.len()
    }

    /// `(part_num, size)` of every part stored for an open upload, sorted
    /// by part number.
    pub async fn parts_of(&self, upload_id: &str) -> Vec<(i32, u64)> {
        let uploads = self.uploads.read().await;
        uploads
            .get(upload_id)
            .map(|session| {
                session
                    .parts
                    .iter()
                    .map(|(num, body)| (*num, body.data.len() as u64))
                    .collect()
            })
            .unwrap_or_default()
    }

    fn next_etag(&self, part_num: i32) -> String {
        let seq = self.seq.fetch_add(1, Ordering::Relaxed);
        format!("\"mem-{seq}-{part_num}\"")
    }
}

#[async_trait]
impl RemoteStore for MemoryStore {
    async fn create_multipart_upload(&self, path: &str, _meta: &ObjectMeta) -> Result<String> {
        let id = format!("upload-{}", self.seq.fetch_add(1, Ordering::Relaxed));
        self.uploads.write().await.insert(
            id.clone(),
            UploadSession {
                path: path.to_string(),
                parts: BTreeMap::new(),
            },
        );
        Ok(id)
    }

    async fn upload_part(
        &self,
        path: &str,
        upload_id: &str,
        part_num: i32,
        data: Bytes,
    ) -> Result<String> {
        ensure!(part_num >= 1, "part number must be positive: {part_num}");
        ensure!(!data.is_empty(), "part body must not be empty");
        let mut uploads = self.uploads.write().await;
        let session = uploads
            .get_mut(upload_id)
            .ok_or_else(|| anyhow!("no such upload: {upload_id}"))?;
        ensure!(
            session.path == path,
            "upload {upload_id} belongs to {}, not {path}",
            session.path
        );
        let etag = self.next_etag(part_num);
        session.parts.insert(
            part_num,
            PartBody {
                data: data.to_vec(),
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn upload_part_copy(
        &self,
        path: &str,
        upload_id: &str,
        part_num: i32,
        source_start: u64,
        source_size: u64,
    ) -> Result<String> {
        ensure!(part_num >= 1, "part number must be positive: {part_num}");
        ensure!(source_size > 0, "copy source range must not be empty");
        let data = {
            let objects = self.objects.read().await;
            let source = objects
                .get(path)
                .ok_or_else(|| anyhow!("no previous version to copy from: {path}"))?;
            let end = source_start + source_size;
            ensure!(
                end <= source.len() as u64,
                "copy source range {source_start}..{end} is outside the object ({} bytes)",
                source.len()
            );
            source[source_start as usize..end as usize].to_vec()
        };

        let mut uploads = self.uploads.write().await;
        let session = uploads
            .get_mut(upload_id)
            .ok_or_else(|| anyhow!("no such upload: {upload_id}"))?;
        let etag = self.next_etag(part_num);
        session.parts.insert(
            part_num,
            PartBody {
                data,
                etag: etag.clone(),
            },
        );
        Ok(etag)
    }

    async fn complete_multipart_upload(
        &self,
        path: &str,
        upload_id: &str,
        parts: &[CompletedPartId],
    ) -> Result<()> {
        let mut uploads = self.uploads.write().await;
        let session = uploads
            .remove(upload_id)
            .ok_or_else(|| anyhow!("no such upload: {upload_id}"))?;
        ensure!(!parts.is_empty(), "completion list must not be empty");

        let mut assembled = Vec::new();
        for (index, (part_num, etag)) in parts.iter().enumerate() {
            let expected = index as i32 + 1;
            if *part_num != expected {
                bail!("completion list is not contiguous: expected part {expected}, got {part_num}");
            }
            let body = session
                .parts
                .get(part_num)
                .ok_or_else(|| anyhow!("part {part_num} was never uploaded"))?;
            ensure!(
                body.etag == *etag,
                "etag mismatch for part {part_num}: {} vs {etag}",
                body.etag
            );
            assembled.extend_from_slice(&body.data);
        }

        self.objects
            .write()
            .await
            .insert(path.to_string(), assembled);
        Ok(())
    }

    async fn abort_multipart_upload(&self, _path: &str, upload_id: &str) -> Result<()> {
        self.uploads.write().await.remove(upload_id);
        Ok(())
    }

    async fn get_object_range(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        let objects = self.objects.read().await;
        let Some(source) = objects.get(path) else {
            return Ok(0);
        };
        let start = offset as usize;
        if start >= source.len() {
            return Ok(0);
        }
        let end = (start + buf.len()).min(source.len());
        let len = end - start;
        buf[..len].copy_from_slice(&source[start..end]);
        Ok(len)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn multipart_round_trip() {
        let store = MemoryStore::new();
        let meta = ObjectMeta::new();
        let id = store.create_multipart_upload("/file", &meta).await.unwrap();

        let e1 = store
            .upload_part("/file", &id, 1, Bytes::from_static(b"hello "))
            .await
            .unwrap();
        let e2 = store
            .upload_part("/file", &id, 2, Bytes::from_static(b"world"))
            .await
            .unwrap();

        store
            .complete_multipart_upload("/file", &id, &[(1, e1), (2, e2)])
            .await
            .unwrap();

        assert_eq!(store.object("/file").await.unwrap(), b"hello world");
        assert_eq!(store.open_uploads().await, 0);
    }

    #[tokio::test]
    async fn copy_part_reads_previous_version() {
        let store = MemoryStore::new();
        store.put_object("/file", b"0123456789").await;
        let meta = ObjectMeta::new();
        let id = store.create_multipart_upload("/file", &meta).await.unwrap();

        let e1 = store
            .upload_part_copy("/file", &id, 1, 0, 5)
            .await
            .unwrap();
        let e2 = store
            .upload_part("/file", &id, 2, Bytes::from_static(b"ABCDE"))
            .await
            .unwrap();
        store
            .complete_multipart_upload("/file", &id, &[(1, e1), (2, e2)])
            .await
            .unwrap();

        assert_eq!(store.object("/file").await.unwrap(), b"01234ABCDE");
    }

    #[tokio::test]
    async fn complete_rejects_gaps_and_bad_etags() {
        let store = MemoryStore::new();
        let meta = ObjectMeta::new();
        let id = store.create_multipart_upload("/file", &meta).await.unwrap();

        let e2 = store
            .upload_part("/file", &id, 2, Bytes::from_static(b"tail"))
            .await
            .unwrap();
        assert!(
            store
                .complete_multipart_upload("/file", &id, &[(2, e2)])
                .await
                .is_err()
        );

        let id = store.create_multipart_upload("/file", &meta).await.unwrap();
        let _etag = store
            .upload_part("/file", &id, 1, Bytes::from_static(b"head"))
            .await
            .unwrap();
        assert!(
            store
                .complete_multipart_upload("/file", &id, &[(1, "\"stale\"".to_string())])
                .await
                .is_err()
        );
    }

    #[tokio::test]
    async fn ranged_read_clamps_to_object_end() {
        let store = MemoryStore::new();
        store.put_object("/file", b"0123456789").await;

        let mut buf = [0u8; 8];
        let n = store.get_object_range("/file", 6, &mut buf).await.unwrap();
        assert_eq!(n, 4);
        assert_eq!(&buf[..4], b"6789");

        let n = store.get_object_range("/file", 20, &mut buf).await.unwrap();
        assert_eq!(n, 0);
        assert_eq!(store.get_object_range("/gone", 0, &mut buf).await.unwrap(), 0);
    }
}
