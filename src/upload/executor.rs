//! Parallel execution of planned parts.
//!
//! Each submission inserts a manifest record under the upload lock, counts
//! the outstanding instruction, and spawns a worker on the shared runtime.
//! Workers never touch the lock across I/O: they check for cancellation,
//! read their payload with positional reads from the duplicated descriptor,
//! perform the remote request, then re-take the lock just long enough to
//! record the etag or the failure code, and finally release the completion
//! semaphore exactly once.

use crate::cadapter::client::RemoteStore;
use crate::error::UploadError;
use crate::upload::etag::{EtagRef, EtagRegistry};
use crate::upload::manifest::{Filepart, UploadManifest};
use crate::upload::planner::PartPlan;
use crate::upload::untreated::UntreatedParts;
use bytes::Bytes;
use parking_lot::Mutex;
use std::fs::File;
use std::os::unix::fs::FileExt;
use std::sync::Arc;
use tokio::sync::Semaphore;
use tracing::{debug, info, warn};

/// Everything the upload lock protects.
pub(crate) struct UploadState {
    pub upload_id: Option<String>,
    pub upload_file: Option<Arc<File>>,
    pub manifest: UploadManifest,
    pub etags: EtagRegistry,
    pub untreated: UntreatedParts,
    /// Workers submitted but not yet observed by `wait_all`.
    pub instruct_count: usize,
    /// 0 while healthy; the first (or latest) negative worker code otherwise.
    pub last_result: i32,
}

impl UploadState {
    fn new() -> Self {
        Self {
            upload_id: None,
            upload_file: None,
            manifest: UploadManifest::new(),
            etags: EtagRegistry::new(),
            untreated: UntreatedParts::new(),
            instruct_count: 0,
            last_result: 0,
        }
    }

    /// Forget the current upload: id, manifest, etags, counters. The dirty
    /// set is host-owned state and survives.
    pub fn reset_upload_info(&mut self) {
        self.upload_id = None;
        self.manifest.clear();
        self.etags.clear();
        self.instruct_count = 0;
        self.last_result = 0;
    }

    pub fn is_uploading(&self) -> bool {
        self.upload_id.is_some()
    }

    /// Drop manifest parts no worker acknowledged, handing fresh-upload
    /// ranges back to the dirty set. Their bytes exist only in the local
    /// cache, so the next plan must upload them again; copy ranges are
    /// simply replanned from the intact previous version. Only meaningful
    /// once all workers have finished.
    pub fn reclaim_unacknowledged(&mut self) {
        let stale: Vec<Filepart> = self
            .manifest
            .parts()
            .iter()
            .filter(|part| !part.uploaded)
            .cloned()
            .collect();
        for part in stale {
            self.manifest.remove(part.part_num);
            if !part.is_copy {
                self.untreated.add(part.start, part.size);
            }
        }
    }
}

/// Per-handle state shared with the workers it spawned.
pub(crate) struct Shared<S> {
    pub store: Arc<S>,
    pub state: Mutex<UploadState>,
    /// Released exactly once per finished worker; its count is the number of
    /// completed-but-not-yet-observed workers.
    pub completed: Semaphore,
}

struct PartRequest {
    path: String,
    start: u64,
    size: u64,
    part_num: i32,
    is_copy: bool,
}

impl<S: RemoteStore> Shared<S> {
    pub fn new(store: Arc<S>) -> Self {
        Self {
            store,
            state: Mutex::new(UploadState::new()),
            completed: Semaphore::new(0),
        }
    }

    /// Record each planned part in the manifest and hand it to a worker.
    /// Parts contiguous with the manifest tail in positional order take the
    /// append fast path; everything else is inserted and re-sorted.
    pub fn submit_parts(
        self: &Arc<Self>,
        path: &str,
        parts: &[PartPlan],
        is_copy: bool,
    ) -> Result<(), UploadError> {
        if parts.is_empty() {
            return Ok(());
        }

        for part in parts {
            let (etag_ref, upload_id, file) = {
                let mut st = self.state.lock();
                let Some(upload_id) = st.upload_id.clone() else {
                    return Err(UploadError::Io(std::io::Error::other(
                        "multipart upload has not started yet",
                    )));
                };
                let sequential = part.part_num == st.manifest.len() as i32 + 1
                    && part.start == st.manifest.tail_end();
                let UploadState {
                    manifest, etags, ..
                } = &mut *st;
                let etag_ref = if sequential {
                    manifest.append(part.start, part.size, is_copy, etags)?
                } else {
                    manifest.insert(part.start, part.size, part.part_num, is_copy, etags)?
                };
                st.instruct_count += 1;
                (etag_ref, upload_id, st.upload_file.clone())
            };

            let request = PartRequest {
                path: path.to_string(),
                start: part.start,
                size: part.size,
                part_num: part.part_num,
                is_copy,
            };
            let shared = Arc::clone(self);
            tokio::spawn(async move {
                shared.part_worker(request, etag_ref, upload_id, file).await;
            });
        }
        Ok(())
    }

    async fn part_worker(
        self: Arc<Self>,
        request: PartRequest,
        etag_ref: EtagRef,
        upload_id: String,
        file: Option<Arc<File>>,
    ) {
        let outcome = self.run_part(&request, &upload_id, file).await;
        {
            let mut st = self.state.lock();
            match outcome {
                Ok(Some(etag)) => {
                    st.etags.set(etag_ref, etag);
                    st.manifest.mark_uploaded(request.part_num);
                }
                Ok(None) => {
                    // Short-circuited: a cancellation or an earlier failure
                    // already decided this flush.
                }
                Err(code) => {
                    st.last_result = code;
                }
            }
        }
        self.completed.add_permits(1);
    }

    /// Returns the etag on success, None when skipped, or the negative code.
    async fn run_part(
        &self,
        request: &PartRequest,
        upload_id: &str,
        file: Option<Arc<File>>,
    ) -> Result<Option<String>, i32> {
        {
            let st = self.state.lock();
            if st.last_result != 0 {
                debug!(
                    part = request.part_num,
                    result = st.last_result,
                    "skipping part request, the flush is already failed or cancelled"
                );
                return Ok(None);
            }
        }

        if request.is_copy {
            return match self
                .store
                .upload_part_copy(
                    &request.path,
                    upload_id,
                    request.part_num,
                    request.start,
                    request.size,
                )
                .await
            {
                Ok(etag) => Ok(Some(etag)),
                Err(err) => {
                    warn!(
                        path = %request.path,
                        part = request.part_num,
                        error = %err,
                        "copy part request failed"
                    );
                    Err(UploadError::Remote(err.to_string()).errno())
                }
            };
        }

        let Some(file) = file else {
            warn!(part = request.part_num, "upload descriptor is not open");
            return Err(-libc::EBADF);
        };
        let data = read_exact_range(file, request.start, request.size)
            .await
            .map_err(|err| {
                warn!(
                    part = request.part_num,
                    error = %err,
                    "failed to read part payload from the cache file"
                );
                UploadError::Io(err).errno()
            })?;

        match self
            .store
            .upload_part(&request.path, upload_id, request.part_num, data)
            .await
        {
            Ok(etag) => Ok(Some(etag)),
            Err(err) => {
                warn!(
                    path = %request.path,
                    part = request.part_num,
                    error = %err,
                    "upload part request failed"
                );
                Err(UploadError::Remote(err.to_string()).errno())
            }
        }
    }

    /// Block until every outstanding worker has finished, then report the
    /// accumulated result code (0 when all succeeded).
    pub async fn wait_all(&self) -> i32 {
        {
            let st = self.state.lock();
            if st.instruct_count == 0 {
                return st.last_result;
            }
        }
        loop {
            let Ok(permit) = self.completed.acquire().await else {
                // The semaphore is never closed.
                return self.state.lock().last_result;
            };
            permit.forget();
            let mut st = self.state.lock();
            st.instruct_count -= 1;
            if st.instruct_count == 0 {
                return st.last_result;
            }
        }
    }

    /// Flag outstanding workers to stop before their network I/O, then wait
    /// for all of them. Idempotent; a no-op without outstanding work.
    pub async fn cancel_all(&self) -> i32 {
        let need_wait = {
            let mut st = self.state.lock();
            if st.instruct_count > 0 {
                info!("upload workers are running, cancelling and waiting for them");
                st.last_result = UploadError::Cancelled.errno();
                true
            } else {
                false
            }
        };
        if need_wait { self.wait_all().await } else { 0 }
    }
}

/// Positional read of `[offset, offset + size)`; the descriptor's own file
/// offset is never used, so workers can share it.
async fn read_exact_range(file: Arc<File>, offset: u64, size: u64) -> std::io::Result<Bytes> {
    tokio::task::spawn_blocking(move || {
        let mut buf = vec![0u8; size as usize];
        let mut read = 0usize;
        while read < buf.len() {
            let n = file.read_at(&mut buf[read..], offset + read as u64)?;
            if n == 0 {
                return Err(std::io::Error::new(
                    std::io::ErrorKind::UnexpectedEof,
                    "cache file ended before the part payload",
                ));
            }
            read += n;
        }
        Ok(Bytes::from(buf))
    })
    .await
    .map_err(|err| std::io::Error::other(format!("blocking read failed: {err}")))?
}
