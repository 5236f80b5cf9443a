//! Part-size configuration for multipart transfers.

use anyhow::ensure;

/// Smallest part the remote accepts for any part except the last (canonical
/// S3 value).
pub const MIN_PART_SIZE: u64 = 5 * 1024 * 1024;
/// Largest single part the remote accepts.
pub const MAX_PART_SIZE: u64 = 5 * 1024 * 1024 * 1024;
/// Highest part number the remote accepts.
pub const MAX_PART_NUM: i32 = 10_000;
/// Default part granularity.
pub const DEFAULT_MULTIPART_SIZE: u64 = 10 * 1024 * 1024;

/// Sizing knobs for the upload planner. All non-final parts are
/// `multipart_size` bytes and start on a multiple of it.
///
/// `min_part_size` is the remote's minimum; the planner consults it when
/// deciding whether a leading gap may be merged into a preceding copy part.
/// Tests shrink both through the same builder.
#[derive(Debug, Clone, Copy)]
pub struct UploadConfig {
    pub multipart_size: u64,
    pub min_part_size: u64,
    pub max_part_size: u64,
}

impl Default for UploadConfig {
    fn default() -> Self {
        Self {
            multipart_size: DEFAULT_MULTIPART_SIZE,
            min_part_size: MIN_PART_SIZE,
            max_part_size: MAX_PART_SIZE,
        }
    }
}

impl UploadConfig {
    pub fn new(multipart_size: u64) -> Self {
        Self {
            multipart_size,
            ..Default::default()
        }
    }

    pub fn multipart_size(self, multipart_size: u64) -> Self {
        Self {
            multipart_size,
            ..self
        }
    }

    pub fn min_part_size(self, min_part_size: u64) -> Self {
        Self {
            min_part_size,
            ..self
        }
    }

    pub fn validate(&self) -> anyhow::Result<()> {
        ensure!(self.multipart_size > 0, "multipart size must be non-zero");
        ensure!(
            self.min_part_size <= self.multipart_size,
            "multipart size {} is below the remote minimum {}",
            self.multipart_size,
            self.min_part_size
        );
        ensure!(
            self.multipart_size <= self.max_part_size,
            "multipart size {} exceeds the remote maximum {}",
            self.multipart_size,
            self.max_part_size
        );
        Ok(())
    }
}
