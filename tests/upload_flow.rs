//! End-to-end flush and finalize flows over the in-memory store.

use altofs::{
    ByteRange, HandleFlags, MemoryStore, ObjectMeta, PseudoFdPool, RemoteStore, UploadConfig,
    UploadHandle,
};
use anyhow::Result;
use async_trait::async_trait;
use bytes::Bytes;
use std::fs::File;
use std::io::Write;
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};

const M: u64 = 10;
const PATH: &str = "/bucket/file.bin";

fn config() -> UploadConfig {
    UploadConfig::new(M).min_part_size(5)
}

fn pattern(len: usize, seed: u8) -> Vec<u8> {
    (0..len)
        .map(|i| (i as u8).wrapping_mul(31).wrapping_add(seed))
        .collect()
}

fn cache_file(content: &[u8]) -> File {
    let mut file = tempfile::tempfile().unwrap();
    file.write_all(content).unwrap();
    file
}

fn handle_with<S: RemoteStore>(store: Arc<S>, content: &[u8]) -> UploadHandle<S> {
    UploadHandle::new(
        store,
        Arc::new(PseudoFdPool::new()),
        cache_file(content),
        HandleFlags::read_write(),
        config(),
    )
}

#[tokio::test]
async fn untouched_object_flushes_as_pure_copies() {
    let previous = pattern(35, 1);
    let store = Arc::new(MemoryStore::new());
    store.put_object(PATH, &previous).await;

    let handle = handle_with(Arc::clone(&store), &previous);
    handle
        .flush_all(PATH, &ObjectMeta::new(), 35, true)
        .await
        .unwrap();

    // One copy part per window, no fresh uploads.
    let id = handle.upload_id().unwrap();
    assert_eq!(
        store.parts_of(&id).await,
        vec![(1, 10), (2, 10), (3, 10), (4, 5)]
    );

    handle.finalize(PATH).await.unwrap();
    assert_eq!(store.object(PATH).await.unwrap(), previous);
    assert_eq!(store.open_uploads().await, 0);
    assert!(!handle.is_uploading());
    handle.close().await;
}

#[tokio::test]
async fn dirty_range_round_trips_with_copy() {
    let previous = pattern(35, 2);
    let mut local = previous.clone();
    local[12..15].copy_from_slice(b"XYZ");

    let store = Arc::new(MemoryStore::new());
    store.put_object(PATH, &previous).await;

    let handle = handle_with(Arc::clone(&store), &local);
    handle.mark_dirty(12, 3);
    handle
        .flush_all(PATH, &ObjectMeta::new(), 35, true)
        .await
        .unwrap();
    handle.finalize(PATH).await.unwrap();

    assert_eq!(store.object(PATH).await.unwrap(), local);
    assert_eq!(handle.outstanding_parts(), 0);
    assert_eq!(handle.get_last_dirty(), None);
    handle.close().await;
}

#[tokio::test]
async fn dirty_range_round_trips_without_copy() {
    let previous = pattern(35, 3);
    let mut local = previous.clone();
    local[0..3].copy_from_slice(b"abc");
    local[33..35].copy_from_slice(b"yz");

    let store = Arc::new(MemoryStore::new());
    store.put_object(PATH, &previous).await;

    let handle = handle_with(Arc::clone(&store), &local);
    handle.mark_dirty(0, 3);
    handle.mark_dirty(33, 2);
    handle
        .flush_all(PATH, &ObjectMeta::new(), 35, false)
        .await
        .unwrap();
    handle.finalize(PATH).await.unwrap();

    assert_eq!(store.object(PATH).await.unwrap(), local);
    handle.close().await;
}

#[tokio::test]
async fn boundary_flush_then_whole_file_flush() {
    let local = pattern(35, 4);
    let store = Arc::new(MemoryStore::new());

    let handle = handle_with(Arc::clone(&store), &local);
    // A freshly written file: everything is dirty, nothing remote yet.
    handle.mark_dirty(0, 35);
    handle
        .flush_boundary(PATH, &ObjectMeta::new())
        .await
        .unwrap();
    handle.wait_all().await.unwrap();

    // The three whole windows went out; the short tail stays dirty.
    assert_eq!(handle.get_last_dirty(), Some(ByteRange::new(30, 5)));
    let id = handle.upload_id().unwrap();
    assert_eq!(store.parts_of(&id).await, vec![(1, 10), (2, 10), (3, 10)]);

    handle
        .flush_all(PATH, &ObjectMeta::new(), 35, false)
        .await
        .unwrap();
    handle.finalize(PATH).await.unwrap();

    assert_eq!(store.object(PATH).await.unwrap(), local);
    assert_eq!(store.open_uploads().await, 0);
    handle.close().await;
}

#[tokio::test]
async fn empty_file_needs_no_upload() {
    let store = Arc::new(MemoryStore::new());
    let handle = handle_with(Arc::clone(&store), b"");

    handle
        .flush_all(PATH, &ObjectMeta::new(), 0, true)
        .await
        .unwrap();
    handle.finalize(PATH).await.unwrap();

    assert!(!handle.is_uploading());
    assert_eq!(store.open_uploads().await, 0);
    assert_eq!(store.object(PATH).await, None);
    handle.close().await;
}

#[tokio::test]
async fn abort_releases_the_upload_id() {
    let local = pattern(30, 5);
    let store = Arc::new(MemoryStore::new());

    let handle = handle_with(Arc::clone(&store), &local);
    handle.mark_dirty(0, 30);
    handle
        .flush_boundary(PATH, &ObjectMeta::new())
        .await
        .unwrap();
    assert!(handle.is_uploading());

    handle.abort(PATH).await.unwrap();
    assert!(!handle.is_uploading());
    assert_eq!(store.open_uploads().await, 0);
    assert_eq!(store.object(PATH).await, None);
    handle.close().await;
}

/// Store wrapper that fails fresh part uploads while the flag is set.
struct FlakyStore {
    inner: MemoryStore,
    fail_uploads: AtomicBool,
}

impl FlakyStore {
    fn new() -> Self {
        Self {
            inner: MemoryStore::new(),
            fail_uploads: AtomicBool::new(false),
        }
    }
}

#[async_trait]
impl RemoteStore for FlakyStore {
    async fn create_multipart_upload(&self, path: &str, meta: &ObjectMeta) -> Result<String> {
        self.inner.create_multipart_upload(path, meta).await
    }

    async fn upload_part(
        &self,
        path: &str,
        upload_id: &str,
        part_num: i32,
        data: Bytes,
    ) -> Result<String> {
        if self.fail_uploads.load(Ordering::SeqCst) {
            anyhow::bail!("injected upload failure for part {part_num}");
        }
        self.inner.upload_part(path, upload_id, part_num, data).await
    }

    async fn upload_part_copy(
        &self,
        path: &str,
        upload_id: &str,
        part_num: i32,
        source_start: u64,
        source_size: u64,
    ) -> Result<String> {
        self.inner
            .upload_part_copy(path, upload_id, part_num, source_start, source_size)
            .await
    }

    async fn complete_multipart_upload(
        &self,
        path: &str,
        upload_id: &str,
        parts: &[(i32, String)],
    ) -> Result<()> {
        self.inner
            .complete_multipart_upload(path, upload_id, parts)
            .await
    }

    async fn abort_multipart_upload(&self, path: &str, upload_id: &str) -> Result<()> {
        self.inner.abort_multipart_upload(path, upload_id).await
    }

    async fn get_object_range(&self, path: &str, offset: u64, buf: &mut [u8]) -> Result<usize> {
        self.inner.get_object_range(path, offset, buf).await
    }
}

#[tokio::test]
async fn failed_flush_converges_on_retry() {
    let previous = pattern(35, 6);
    let mut local = previous.clone();
    local[10..20].copy_from_slice(b"0123456789");

    let store = Arc::new(FlakyStore::new());
    store.inner.put_object(PATH, &previous).await;

    let handle = handle_with(Arc::clone(&store), &local);
    handle.mark_dirty(10, 10);

    store.fail_uploads.store(true, Ordering::SeqCst);
    let err = handle
        .flush_all(PATH, &ObjectMeta::new(), 35, true)
        .await
        .unwrap_err();
    assert!(err.errno() < 0);
    // The failed plan leaves the dirty set for the next attempt.
    assert_eq!(handle.get_last_dirty(), Some(ByteRange::new(10, 10)));

    // The retry replans against the manifest: the stale window is cancelled
    // and re-uploaded, the copies are already in place.
    store.fail_uploads.store(false, Ordering::SeqCst);
    handle
        .flush_all(PATH, &ObjectMeta::new(), 35, true)
        .await
        .unwrap();
    handle.finalize(PATH).await.unwrap();

    assert_eq!(store.inner.object(PATH).await.unwrap(), local);
    assert_eq!(store.inner.open_uploads().await, 0);
    handle.close().await;
}
