//! The upload manifest: ordered filepart records of one multipart upload.

use crate::upload::etag::{EtagRef, EtagRegistry};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum ManifestError {
    #[error("part at {actual} is not contiguous with the manifest tail at {expected}")]
    NotContiguous { expected: u64, actual: u64 },

    #[error("part [{start}, {end}) overlaps an existing part")]
    Overlap { start: u64, end: u64 },

    #[error("part number {0} is already present")]
    DuplicatePart(i32),

    #[error("invalid part parameters (start={start}, size={size}, part_num={part_num})")]
    InvalidPart { start: u64, size: u64, part_num: i32 },

    #[error("part {0} has no etag recorded yet")]
    MissingEtag(i32),

    #[error("the manifest has no parts to finalize")]
    Empty,
}

/// One in-flight or completed part of the upload.
#[derive(Debug, Clone)]
pub struct Filepart {
    /// Whether the remote has acknowledged this part.
    pub uploaded: bool,
    pub start: u64,
    pub size: u64,
    /// Produced by server-side copy rather than a fresh upload.
    pub is_copy: bool,
    pub etag_ref: EtagRef,
    pub part_num: i32,
}

impl Filepart {
    #[inline]
    pub fn end(&self) -> u64 {
        self.start + self.size
    }

    #[inline]
    pub fn overlaps(&self, start: u64, size: u64) -> bool {
        self.start < start + size && start < self.end()
    }
}

/// Fileparts sorted by part number. All mutation happens under the handle's
/// upload lock.
#[derive(Debug, Default)]
pub struct UploadManifest {
    parts: Vec<Filepart>,
}

impl UploadManifest {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn len(&self) -> usize {
        self.parts.len()
    }

    pub fn is_empty(&self) -> bool {
        self.parts.is_empty()
    }

    pub fn parts(&self) -> &[Filepart] {
        &self.parts
    }

    /// Offset one past the last part, 0 when empty.
    pub fn tail_end(&self) -> u64 {
        self.parts.last().map(|part| part.end()).unwrap_or(0)
    }

    /// Append a part that is exactly contiguous with the tail. The part
    /// number is its position in the manifest.
    pub fn append(
        &mut self,
        start: u64,
        size: u64,
        is_copy: bool,
        registry: &mut EtagRegistry,
    ) -> Result<EtagRef, ManifestError> {
        let expected = self.tail_end();
        if start != expected {
            return Err(ManifestError::NotContiguous {
                expected,
                actual: start,
            });
        }
        let part_num = self.parts.len() as i32 + 1;
        if size == 0 {
            return Err(ManifestError::InvalidPart {
                start,
                size,
                part_num,
            });
        }
        let etag_ref = registry.add(part_num);
        self.parts.push(Filepart {
            uploaded: false,
            start,
            size,
            is_copy,
            etag_ref,
            part_num,
        });
        Ok(etag_ref)
    }

    /// Insert a part produced out of order; the manifest is re-sorted by
    /// part number. Rejects byte overlap with any existing part.
    pub fn insert(
        &mut self,
        start: u64,
        size: u64,
        part_num: i32,
        is_copy: bool,
        registry: &mut EtagRegistry,
    ) -> Result<EtagRef, ManifestError> {
        if size == 0 || part_num < 1 {
            return Err(ManifestError::InvalidPart {
                start,
                size,
                part_num,
            });
        }
        if self.parts.iter().any(|part| part.part_num == part_num) {
            return Err(ManifestError::DuplicatePart(part_num));
        }
        if self.parts.iter().any(|part| part.overlaps(start, size)) {
            return Err(ManifestError::Overlap {
                start,
                end: start + size,
            });
        }
        let etag_ref = registry.add(part_num);
        self.parts.push(Filepart {
            uploaded: false,
            start,
            size,
            is_copy,
            etag_ref,
            part_num,
        });
        self.parts.sort_by_key(|part| part.part_num);
        Ok(etag_ref)
    }

    /// Remove and return every part whose interval overlaps
    /// `[start, start + size)`.
    pub fn erase_overlapping(&mut self, start: u64, size: u64) -> Vec<Filepart> {
        let mut removed = Vec::new();
        self.parts.retain(|part| {
            if part.overlaps(start, size) {
                removed.push(part.clone());
                false
            } else {
                true
            }
        });
        removed
    }

    /// Remove the part with this part number, if present.
    pub fn remove(&mut self, part_num: i32) -> Option<Filepart> {
        let idx = self.parts.iter().position(|part| part.part_num == part_num)?;
        Some(self.parts.remove(idx))
    }

    /// Mark a part as acknowledged by the remote.
    pub fn mark_uploaded(&mut self, part_num: i32) -> bool {
        match self.parts.iter_mut().find(|part| part.part_num == part_num) {
            Some(part) => {
                part.uploaded = true;
                true
            }
            None => false,
        }
    }

    /// The finalization payload, sorted by part number. Fails if any part
    /// has no etag recorded.
    pub fn etag_list(&self, registry: &EtagRegistry) -> Result<Vec<(i32, String)>, ManifestError> {
        if self.parts.is_empty() {
            return Err(ManifestError::Empty);
        }
        self.parts
            .iter()
            .map(|part| match registry.get(part.etag_ref) {
                Some(etag) => Ok((part.part_num, etag.to_string())),
                None => Err(ManifestError::MissingEtag(part.part_num)),
            })
            .collect()
    }

    pub fn clear(&mut self) {
        self.parts.clear();
    }
}
