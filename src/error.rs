//! Error surface of the upload core.
//!
//! The host file system speaks errno, so every variant maps onto a negative
//! integer code. Worker results travel through the shared state as raw codes
//! (`last_result`) and are rehydrated at the entry points.

use crate::upload::manifest::ManifestError;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum UploadError {
    #[error("handle is not open or not writable")]
    BadHandle,

    #[error("local i/o failed: {0}")]
    Io(#[from] std::io::Error),

    #[error("uploaded part list is not on the part boundary")]
    Misaligned,

    #[error("{0}")]
    Manifest(#[from] ManifestError),

    #[error("remote request failed: {0}")]
    Remote(String),

    #[error("upload cancelled")]
    Cancelled,
}

impl UploadError {
    /// Negative errno-style code for the host boundary.
    pub fn errno(&self) -> i32 {
        match self {
            UploadError::BadHandle => -libc::EBADF,
            UploadError::Io(err) => -err.raw_os_error().unwrap_or(libc::EIO),
            UploadError::Misaligned | UploadError::Manifest(_) => -libc::EIO,
            UploadError::Remote(_) => -libc::EREMOTEIO,
            UploadError::Cancelled => -libc::ECANCELED,
        }
    }

    /// Rehydrate a worker result code. `code` must be negative.
    pub fn from_errno(code: i32) -> Self {
        match -code {
            libc::EBADF => UploadError::BadHandle,
            libc::ECANCELED => UploadError::Cancelled,
            libc::EREMOTEIO => UploadError::Remote("remote part request failed".to_string()),
            errno => UploadError::Io(std::io::Error::from_raw_os_error(errno)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn errno_codes_are_negative() {
        assert_eq!(UploadError::BadHandle.errno(), -libc::EBADF);
        assert_eq!(UploadError::Cancelled.errno(), -libc::ECANCELED);
        assert_eq!(UploadError::Misaligned.errno(), -libc::EIO);
        assert_eq!(
            UploadError::Remote("boom".to_string()).errno(),
            -libc::EREMOTEIO
        );
    }

    #[test]
    fn errno_round_trips_through_worker_results() {
        for err in [
            UploadError::BadHandle,
            UploadError::Cancelled,
            UploadError::Remote("x".to_string()),
        ] {
            let code = err.errno();
            assert_eq!(UploadError::from_errno(code).errno(), code);
        }
    }
}
