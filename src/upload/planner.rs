//! Plan derivation: which byte ranges become uploaded parts, server-side
//! copies, gap downloads, or cancellations of superseded parts.
//!
//! Two entry points with different contracts: `extract_from_untreated_area`
//! serves the opportunistic boundary flush of the most recently written
//! region, `extract_from_all_area` produces the complete plan for the whole
//! file at close time. Both walk the file in windows of the configured
//! multipart size; part numbers are positional (`start / size + 1`) so the
//! remote reassembles parts in file order regardless of completion order.

use crate::config::UploadConfig;
use crate::error::UploadError;
use crate::upload::ByteRange;
use crate::upload::manifest::{Filepart, UploadManifest};
use std::collections::VecDeque;
use tracing::{debug, warn};

/// One part the executor should produce, by fresh upload or by copy.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    pub start: u64,
    pub size: u64,
    pub part_num: i32,
}

impl PartPlan {
    #[inline]
    pub fn end(&self) -> u64 {
        self.start + self.size
    }
}

/// Result of the boundary flush extraction.
#[derive(Debug, Default)]
pub struct BoundaryPlan {
    pub to_upload: Vec<PartPlan>,
    /// Previously uploaded parts superseded by the new data. They have been
    /// removed from the manifest; the upload list covers their extent.
    pub cancelled: Vec<Filepart>,
}

/// Result of the whole-file extraction.
#[derive(Debug, Default)]
pub struct WholeFilePlan {
    pub to_upload: Vec<PartPlan>,
    pub to_copy: Vec<PartPlan>,
    /// Ranges that must be fetched from the previous object version into the
    /// local cache before their windows are uploaded.
    pub to_download: Vec<ByteRange>,
    pub cancelled: Vec<Filepart>,
    /// Set when a cancelled part is still in flight; the executor must wait
    /// for it before resubmitting.
    pub wait_upload_complete: bool,
}

impl WholeFilePlan {
    pub fn is_empty(&self) -> bool {
        self.to_upload.is_empty()
            && self.to_copy.is_empty()
            && self.to_download.is_empty()
            && self.cancelled.is_empty()
    }
}

/// Extract the parts to upload from one contiguous untreated area.
///
/// The area is aligned down to the part boundary and only whole parts are
/// emitted; any remainder stays untreated. Uploaded parts overlapping the
/// aligned area are cancelled (removed from the manifest) and their extent is
/// absorbed, since the dirty data supersedes them and the local cache holds
/// the whole window.
pub fn extract_from_untreated_area(
    manifest: &mut UploadManifest,
    untreated: ByteRange,
    multipart_size: u64,
) -> Result<BoundaryPlan, UploadError> {
    if untreated.size == 0 || multipart_size == 0 {
        return Err(UploadError::Io(std::io::Error::new(
            std::io::ErrorKind::InvalidInput,
            format!(
                "invalid untreated area (start={}, size={})",
                untreated.start, untreated.size
            ),
        )));
    }

    let aligned_start = (untreated.start / multipart_size) * multipart_size;
    let mut aligned_size = untreated.size + (untreated.start - aligned_start);

    let mut plan = BoundaryPlan::default();
    if aligned_size < multipart_size {
        debug!(
            start = untreated.start,
            size = untreated.size,
            "untreated area does not reach a whole part, nothing to flush"
        );
        return Ok(plan);
    }

    // Cancel uploaded parts the aligned area overlaps. A cancelled part may
    // extend past the area end; the area grows to cover it so the re-upload
    // fully replaces it, which can in turn reach further parts.
    loop {
        let removed = manifest.erase_overlapping(aligned_start, aligned_size);
        if removed.is_empty() {
            break;
        }
        for part in removed {
            if part.end() > aligned_start + aligned_size {
                aligned_size = part.end() - aligned_start;
            }
            plan.cancelled.push(part);
        }
    }

    let mut cursor = aligned_start;
    let mut remaining = aligned_size;
    while remaining >= multipart_size {
        plan.to_upload.push(PartPlan {
            start: cursor,
            size: multipart_size,
            part_num: (cursor / multipart_size) as i32 + 1,
        });
        cursor += multipart_size;
        remaining -= multipart_size;
    }

    Ok(plan)
}

/// Produce the complete plan covering `[0, file_size)`.
///
/// Each window is classified against the dirty snapshot and the manifest:
/// untouched uploaded windows are skipped, untouched clean windows are copied
/// from the previous version (or downloaded and re-uploaded when copy is
/// unavailable), dirty windows are uploaded whole with their gaps downloaded
/// first, and dirty windows that were already uploaded cancel the stale part.
///
/// A leading gap in the first dirty run of a window rides along with the
/// preceding copy part instead of being downloaded when the parts are
/// contiguous, the merged copy stays within the maximum part size, and the
/// remaining upload still meets the remote minimum. This cuts one download
/// and keeps the request count down.
///
/// The snapshot is consumed; the live dirty set is untouched. The manifest
/// loses its cancelled parts only when the plan succeeds.
pub fn extract_from_all_area(
    manifest: &mut UploadManifest,
    untreated_snapshot: Vec<ByteRange>,
    config: &UploadConfig,
    file_size: u64,
    use_copy: bool,
) -> Result<WholeFilePlan, UploadError> {
    let multipart_size = config.multipart_size;
    debug_assert!(multipart_size > 0);

    let mut plan = WholeFilePlan::default();
    let mut dirty: VecDeque<ByteRange> = untreated_snapshot.into_iter().collect();
    let uploaded: Vec<Filepart> = manifest.parts().to_vec();
    let mut uploaded_idx = 0usize;
    let mut cancel_nums: Vec<i32> = Vec::new();

    let mut cur_start = 0u64;
    while cur_start < file_size {
        let cur_size = multipart_size.min(file_size - cur_start);
        let cur_end = cur_start + cur_size;
        let part_num = (cur_start / multipart_size) as i32 + 1;

        // Dirty intervals overlapping this window, clipped and consumed from
        // the snapshot. An interval reaching past the window end leaves its
        // tail for the next window.
        let mut cur_untreated: Vec<ByteRange> = Vec::new();
        while let Some(front) = dirty.front_mut() {
            let front_start = front.start;
            let front_end = front.end();
            if front_start >= cur_end {
                break;
            }
            if front_end <= cur_start {
                dirty.pop_front();
                continue;
            }
            let clip_start = front_start.max(cur_start);
            if front_end <= cur_end {
                cur_untreated.push(ByteRange::new(clip_start, front_end - clip_start));
                dirty.pop_front();
            } else {
                cur_untreated.push(ByteRange::new(clip_start, cur_end - clip_start));
                front.start = cur_end;
                front.size = front_end - cur_end;
                break;
            }
        }

        // The uploaded part covering this window, if any. A part that does
        // not coincide with exactly one window cannot be reconciled.
        let mut overlap: Option<&Filepart> = None;
        while uploaded_idx < uploaded.len() {
            let part = &uploaded[uploaded_idx];
            if part.start >= cur_end {
                break;
            }
            if part.end() <= cur_start {
                uploaded_idx += 1;
                continue;
            }
            if overlap.is_some() || part.start != cur_start || part.size != cur_size {
                warn!(
                    part = part.part_num,
                    start = part.start,
                    size = part.size,
                    "uploaded part list is not on the part boundary, cannot continue"
                );
                return Err(UploadError::Misaligned);
            }
            overlap = Some(part);
            uploaded_idx += 1;
        }

        if cur_untreated.is_empty() {
            if let Some(part) = overlap {
                debug!(
                    start = cur_start,
                    size = cur_size,
                    part = part.part_num,
                    "window already uploaded"
                );
            } else if use_copy {
                plan.to_copy.push(PartPlan {
                    start: cur_start,
                    size: cur_size,
                    part_num,
                });
            } else {
                plan.to_download.push(ByteRange::new(cur_start, cur_size));
                plan.to_upload.push(PartPlan {
                    start: cur_start,
                    size: cur_size,
                    part_num,
                });
            }
        } else if let Some(part) = overlap {
            // The stale part was window-aligned, so the local cache holds
            // every byte of this window; replacing it needs no download.
            if !part.uploaded {
                plan.wait_upload_complete = true;
            }
            cancel_nums.push(part.part_num);
            plan.cancelled.push(part.clone());
            plan.to_upload.push(PartPlan {
                start: cur_start,
                size: cur_size,
                part_num,
            });
        } else {
            // Gaps around the dirty runs must be fetched before the window
            // can be uploaded, except a leading gap that the preceding copy
            // part can absorb.
            let mut tmp_start = cur_start;
            let mut tmp_size = cur_size;
            let mut changed_start = cur_start;
            let mut changed_size = cur_size;
            for (index, run) in cur_untreated.iter().enumerate() {
                if tmp_start < run.start {
                    let gap = run.start - tmp_start;
                    let mut absorbed = false;
                    if index == 0
                        && use_copy
                        && let Some(tail) = plan.to_copy.last_mut()
                        && tail.end() == tmp_start
                        && tail.size + gap <= config.max_part_size
                        && (tmp_start + tmp_size) - run.start >= config.min_part_size
                    {
                        tail.size += gap;
                        changed_size -= run.start - changed_start;
                        changed_start = run.start;
                        absorbed = true;
                    }
                    if !absorbed {
                        plan.to_download.push(ByteRange::new(tmp_start, gap));
                    }
                }
                tmp_size = (tmp_start + tmp_size) - run.end();
                tmp_start = run.end();
            }
            if tmp_size > 0 {
                plan.to_download.push(ByteRange::new(tmp_start, tmp_size));
            }
            plan.to_upload.push(PartPlan {
                start: changed_start,
                size: changed_size,
                part_num,
            });
        }

        cur_start = cur_end;
    }

    for part_num in cancel_nums {
        manifest.remove(part_num);
    }
    Ok(plan)
}
