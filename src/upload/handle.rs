//! The per-open-file handle: one pseudo fd, one backing descriptor, one
//! multipart upload, and the planner/executor state driving it.
//!
//! Hosts feed dirty ranges in through `mark_dirty`, call `flush_boundary`
//! opportunistically while the file is open to bound dirty-set growth, and
//! `flush_all` + `finalize` (or `abort`) when the file closes. Flushes on
//! one handle are serialized by the caller.

use crate::cadapter::client::{ObjectMeta, RemoteStore};
use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::upload::ByteRange;
use crate::upload::executor::{Shared, UploadState};
use crate::upload::planner::{self, WholeFilePlan};
use crate::upload::pseudofd::PseudoFdPool;
use std::fs::File;
use std::io::{Seek, SeekFrom};
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use tracing::{debug, warn};

#[derive(Clone, Copy, Debug)]
pub struct HandleFlags {
    pub read: bool,
    pub write: bool,
}

impl HandleFlags {
    pub const fn new(read: bool, write: bool) -> Self {
        Self { read, write }
    }

    pub const fn read_only() -> Self {
        Self::new(true, false)
    }

    pub const fn read_write() -> Self {
        Self::new(true, true)
    }
}

pub struct UploadHandle<S> {
    pseudo_fd: Option<u64>,
    flags: HandleFlags,
    physical: Arc<File>,
    config: UploadConfig,
    shared: Arc<Shared<S>>,
    fd_pool: Arc<PseudoFdPool>,
}

impl<S: RemoteStore> UploadHandle<S> {
    pub fn new(
        store: Arc<S>,
        fd_pool: Arc<PseudoFdPool>,
        file: File,
        flags: HandleFlags,
        config: UploadConfig,
    ) -> Self {
        let pseudo_fd = fd_pool.acquire();
        Self {
            pseudo_fd: Some(pseudo_fd),
            flags,
            physical: Arc::new(file),
            config,
            shared: Arc::new(Shared::new(store)),
            fd_pool,
        }
    }

    pub fn pseudo_fd(&self) -> Option<u64> {
        self.pseudo_fd
    }

    pub fn writable(&self) -> bool {
        self.pseudo_fd.is_some() && self.flags.write
    }

    pub fn readable(&self) -> bool {
        self.pseudo_fd.is_some()
    }

    pub fn is_uploading(&self) -> bool {
        self.shared.state.lock().is_uploading()
    }

    pub fn upload_id(&self) -> Option<String> {
        self.shared.state.lock().upload_id.clone()
    }

    /// Workers submitted but not yet waited for.
    pub fn outstanding_parts(&self) -> usize {
        self.shared.state.lock().instruct_count
    }

    /// Record a host write as dirty.
    pub fn mark_dirty(&self, start: u64, size: u64) {
        self.shared.state.lock().untreated.add(start, size);
    }

    /// The most recently written dirty interval.
    pub fn get_last_dirty(&self) -> Option<ByteRange> {
        self.shared.state.lock().untreated.get_last()
    }

    /// Swap the most recently written dirty interval for its unflushed
    /// remainders; either side may be absent.
    pub fn replace_last_dirty(&self, front: Option<ByteRange>, back: Option<ByteRange>) -> bool {
        self.shared.state.lock().untreated.replace_last(front, back)
    }

    /// Duplicate the backing descriptor for worker reads, once per upload.
    /// The duplicate is rewound and validated before use.
    fn open_upload_file(&self) -> Result<(), UploadError> {
        if self.shared.state.lock().upload_file.is_some() {
            return Ok(());
        }
        let mut dup = self.physical.try_clone()?;
        dup.seek(SeekFrom::Start(0))?;
        let meta = dup.metadata()?;
        if !meta.is_file() {
            return Err(UploadError::Io(std::io::Error::other(
                "backing descriptor is not a regular file",
            )));
        }
        let mut st = self.shared.state.lock();
        if st.upload_file.is_none() {
            st.upload_file = Some(Arc::new(dup));
        }
        Ok(())
    }

    /// Ask the remote for an upload id and bind it to this handle.
    async fn pre_multipart_upload(
        &self,
        path: &str,
        meta: &ObjectMeta,
    ) -> Result<(), UploadError> {
        let upload_id = self
            .shared
            .store
            .create_multipart_upload(path, meta)
            .await
            .map_err(|err| UploadError::Remote(err.to_string()))?;
        let mut st = self.shared.state.lock();
        st.reset_upload_info();
        st.upload_id = Some(upload_id);
        debug!("multipart upload started");
        Ok(())
    }

    /// Flush the most recently written dirty region, bounded to whole parts.
    ///
    /// The region is aligned inward to part boundaries; only whole parts are
    /// uploaded and the misaligned head/tail are re-recorded as dirty.
    /// Returns without error when the region does not yet reach a whole
    /// part. Does not wait for the uploads it spawns.
    #[tracing::instrument(level = "debug", skip(self, meta), fields(pseudo_fd = ?self.pseudo_fd))]
    pub async fn flush_boundary(&self, path: &str, meta: &ObjectMeta) -> Result<(), UploadError> {
        if !self.writable() {
            return Err(UploadError::BadHandle);
        }
        let multipart_size = self.config.multipart_size;

        let Some(last) = self.get_last_dirty() else {
            debug!("no last-written dirty interval, nothing to flush");
            return Ok(());
        };

        let aligned_start = last.start.next_multiple_of(multipart_size);
        if last.end() <= aligned_start {
            debug!(
                start = last.start,
                size = last.size,
                "dirty interval ends before the next part boundary"
            );
            return Ok(());
        }
        let aligned_size = ((last.end() - aligned_start) / multipart_size) * multipart_size;
        if aligned_size == 0 {
            debug!(
                start = last.start,
                size = last.size,
                "aligned dirty interval is shorter than one part"
            );
            return Ok(());
        }

        let plan = {
            let mut st = self.shared.state.lock();
            let UploadState { manifest, .. } = &mut *st;
            planner::extract_from_untreated_area(
                manifest,
                ByteRange::new(aligned_start, aligned_size),
                multipart_size,
            )?
        };
        if plan.to_upload.is_empty() {
            return Ok(());
        }

        if !self.is_uploading() {
            self.pre_multipart_upload(path, meta).await?;
        }

        for cancelled in &plan.cancelled {
            debug!(
                start = cancelled.start,
                size = cancelled.size,
                part = cancelled.part_num,
                "cancelled uploaded part superseded by new data"
            );
        }

        self.open_upload_file()?;
        self.shared.submit_parts(path, &plan.to_upload, false)?;

        let front = (aligned_start > last.start)
            .then(|| ByteRange::new(last.start, aligned_start - last.start));
        let aligned_end = aligned_start + aligned_size;
        let back =
            (last.end() > aligned_end).then(|| ByteRange::new(aligned_end, last.end() - aligned_end));
        if !self.replace_last_dirty(front, back) {
            warn!(
                "could not exclude the flushed range from the dirty set; \
                 the next whole-file flush will reconcile it"
            );
        }
        Ok(())
    }

    /// Plan and execute everything needed to cover `[0, file_size)`:
    /// downloads of read-modify-write gaps first, then uploads and copies in
    /// parallel. Waits for every part before returning. The dirty set is
    /// drained only on success.
    #[tracing::instrument(
        level = "debug",
        skip(self, meta),
        fields(pseudo_fd = ?self.pseudo_fd, file_size, use_copy)
    )]
    pub async fn flush_all(
        &self,
        path: &str,
        meta: &ObjectMeta,
        file_size: u64,
        use_copy: bool,
    ) -> Result<(), UploadError> {
        if !self.writable() {
            return Err(UploadError::BadHandle);
        }

        let plan = {
            let mut st = self.shared.state.lock();
            let snapshot = st.untreated.duplicate();
            let UploadState {
                manifest, ..
            } = &mut *st;
            planner::extract_from_all_area(manifest, snapshot, &self.config, file_size, use_copy)?
        };

        if plan.wait_upload_complete {
            debug!("waiting for in-flight parts before resubmitting cancelled windows");
            self.wait_all().await?;
        }

        if plan.to_upload.is_empty() && plan.to_copy.is_empty() {
            return self.wait_all().await;
        }

        if !self.is_uploading() {
            self.pre_multipart_upload(path, meta).await?;
        }
        self.open_upload_file()?;
        self.fill_gaps_from_remote(path, &plan).await?;

        self.shared.submit_parts(path, &plan.to_upload, false)?;
        self.shared.submit_parts(path, &plan.to_copy, true)?;
        self.wait_all().await?;

        self.shared.state.lock().untreated.clear();
        Ok(())
    }

    /// Fetch the plan's download ranges from the previous object version
    /// into the local cache so read-modify-write windows are complete before
    /// their upload starts. Ranges past the previous end stay zero-filled.
    async fn fill_gaps_from_remote(
        &self,
        path: &str,
        plan: &WholeFilePlan,
    ) -> Result<(), UploadError> {
        for gap in &plan.to_download {
            let mut buf = vec![0u8; gap.size as usize];
            self.shared
                .store
                .get_object_range(path, gap.start, &mut buf)
                .await
                .map_err(|err| UploadError::Remote(err.to_string()))?;

            let file = Arc::clone(&self.physical);
            let offset = gap.start;
            tokio::task::spawn_blocking(move || file.write_all_at(&buf, offset))
                .await
                .map_err(|err| {
                    UploadError::Io(std::io::Error::other(format!(
                        "blocking write failed: {err}"
                    )))
                })??;
        }
        Ok(())
    }

    /// Block until every outstanding part finished; surface the failure
    /// recorded by any worker.
    ///
    /// On failure the state is left reconcilable: unacknowledged parts fall
    /// out of the manifest (fresh-upload ranges return to the dirty set)
    /// and the result code is cleared, so the next plan re-derives exactly
    /// what the remote is still missing.
    pub async fn wait_all(&self) -> Result<(), UploadError> {
        let code = self.shared.wait_all().await;
        if code != 0 {
            let mut st = self.shared.state.lock();
            st.last_result = 0;
            st.reclaim_unacknowledged();
            return Err(UploadError::from_errno(code));
        }
        Ok(())
    }

    /// Commit the manifest. A handle that never started uploading has
    /// nothing to commit and returns successfully.
    #[tracing::instrument(level = "debug", skip(self), fields(pseudo_fd = ?self.pseudo_fd))]
    pub async fn finalize(&self, path: &str) -> Result<(), UploadError> {
        if !self.is_uploading() {
            return Ok(());
        }
        self.wait_all().await?;

        let (upload_id, parts) = {
            let st = self.shared.state.lock();
            let Some(upload_id) = st.upload_id.clone() else {
                return Ok(());
            };
            let parts = st.manifest.etag_list(&st.etags)?;
            (upload_id, parts)
        };

        self.shared
            .store
            .complete_multipart_upload(path, &upload_id, &parts)
            .await
            .map_err(|err| UploadError::Remote(err.to_string()))?;

        self.shared.state.lock().reset_upload_info();
        Ok(())
    }

    /// Give up on the current upload: cancel outstanding work, release the
    /// upload id remotely, and discard the manifest.
    pub async fn abort(&self, path: &str) -> Result<(), UploadError> {
        let upload_id = self.shared.state.lock().upload_id.clone();
        let Some(upload_id) = upload_id else {
            return Ok(());
        };
        self.shared.cancel_all().await;
        self.shared
            .store
            .abort_multipart_upload(path, &upload_id)
            .await
            .map_err(|err| UploadError::Remote(err.to_string()))?;
        self.shared.state.lock().reset_upload_info();
        Ok(())
    }

    /// Tear the handle down: cancel-and-wait outstanding workers, reset the
    /// upload state, close the duplicated descriptor, release the pseudo fd.
    pub async fn close(mut self) {
        self.shared.cancel_all().await;
        {
            let mut st = self.shared.state.lock();
            st.reset_upload_info();
            st.upload_file = None;
        }
        if let Some(fd) = self.pseudo_fd.take() {
            self.fd_pool.release(fd);
        }
    }
}

impl<S> Drop for UploadHandle<S> {
    fn drop(&mut self) {
        let Some(fd) = self.pseudo_fd.take() else {
            return;
        };
        // Cannot block here; flag in-flight workers so they short-circuit.
        // They own the shared state, so nothing dangles.
        let mut st = self.shared.state.lock();
        if st.instruct_count > 0 {
            st.last_result = UploadError::Cancelled.errno();
            warn!(
                pseudo_fd = fd,
                outstanding = st.instruct_count,
                "handle dropped with outstanding part transfers"
            );
        }
        drop(st);
        self.fd_pool.release(fd);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cadapter::memory::MemoryStore;
    use std::io::Write;

    const M: u64 = 10;

    fn config() -> UploadConfig {
        UploadConfig::new(M).min_part_size(5)
    }

    fn cache_file(content: &[u8]) -> File {
        let mut file = tempfile::tempfile().unwrap();
        file.write_all(content).unwrap();
        file
    }

    fn handle_over(content: &[u8]) -> (UploadHandle<MemoryStore>, Arc<MemoryStore>) {
        let store = Arc::new(MemoryStore::new());
        let pool = Arc::new(PseudoFdPool::new());
        let handle = UploadHandle::new(
            Arc::clone(&store),
            pool,
            cache_file(content),
            HandleFlags::read_write(),
            config(),
        );
        (handle, store)
    }

    #[tokio::test]
    async fn boundary_flush_uploads_whole_parts_and_keeps_remainders() {
        let (handle, store) = handle_over(&vec![9u8; 35]);
        handle.mark_dirty(12, 18); // [12, 30)
        handle
            .flush_boundary("/file", &ObjectMeta::new())
            .await
            .unwrap();
        handle.wait_all().await.unwrap();

        // Only the aligned window [20, 30) went out; the head stays dirty.
        assert_eq!(handle.get_last_dirty(), Some(ByteRange::new(12, 8)));
        let id = handle.upload_id().unwrap();
        assert_eq!(store.parts_of(&id).await, vec![(3, 10)]);
        assert_eq!(handle.outstanding_parts(), 0);
    }

    #[tokio::test]
    async fn boundary_flush_below_one_part_is_a_no_op() {
        let (handle, store) = handle_over(&vec![1u8; 20]);
        handle.mark_dirty(0, 9);
        handle
            .flush_boundary("/file", &ObjectMeta::new())
            .await
            .unwrap();

        assert!(!handle.is_uploading());
        assert_eq!(handle.get_last_dirty(), Some(ByteRange::new(0, 9)));
        assert_eq!(store.open_uploads().await, 0);
    }

    #[tokio::test]
    async fn boundary_flush_requires_a_writable_handle() {
        let store = Arc::new(MemoryStore::new());
        let pool = Arc::new(PseudoFdPool::new());
        let handle = UploadHandle::new(
            store,
            pool,
            cache_file(b""),
            HandleFlags::read_only(),
            config(),
        );
        let err = handle
            .flush_boundary("/file", &ObjectMeta::new())
            .await
            .unwrap_err();
        assert!(matches!(err, UploadError::BadHandle));
        assert_eq!(err.errno(), -libc::EBADF);
    }

    #[tokio::test]
    async fn pseudo_fds_are_released_on_close_and_reused() {
        let store = Arc::new(MemoryStore::new());
        let pool = Arc::new(PseudoFdPool::new());
        let first = UploadHandle::new(
            Arc::clone(&store),
            Arc::clone(&pool),
            cache_file(b""),
            HandleFlags::read_write(),
            config(),
        );
        let first_fd = first.pseudo_fd().unwrap();
        first.close().await;

        let second = UploadHandle::new(
            store,
            Arc::clone(&pool),
            cache_file(b""),
            HandleFlags::read_write(),
            config(),
        );
        assert_eq!(second.pseudo_fd(), Some(first_fd));
    }

    #[tokio::test]
    async fn close_cancels_outstanding_work() {
        let (handle, store) = handle_over(&vec![3u8; 40]);
        handle.mark_dirty(0, 40);
        handle
            .flush_boundary("/file", &ObjectMeta::new())
            .await
            .unwrap();
        handle.close().await;
        // The upload session may keep parts that finished before the
        // cancel, but no worker survives the close.
        assert!(store.open_uploads().await <= 1);
    }
}
