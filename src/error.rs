//! Error types shared by the cache, the persistence layer and pose recovery.
//!
//! Load passes never fail outright: they return whatever they could read
//! plus a list of these errors. Mutating operations return them directly.

use std::path::PathBuf;

use thiserror::Error;

use crate::recover::pnp::PnpError;

pub type Result<T> = std::result::Result<T, Error>;

/// Coarse classification of an [`Error`], cheap to copy into events.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ErrorKind {
    PathNotFound,
    PathNotADirectory,
    PathNotAFile,
    MalformedDocument,
    NoImagesFound,
    SegmentationMismatch,
    InvalidEntityData,
    ReferentialMismatch,
    PersistenceFailed,
    NotFound,
    InvalidState,
    PoseRecoveryFailed,
    Config,
}

#[derive(Debug, Error)]
pub enum Error {
    #[error("path does not exist: {}", .0.display())]
    PathNotFound(PathBuf),

    #[error("path is not a directory: {}", .0.display())]
    PathNotADirectory(PathBuf),

    #[error("path is not a file: {}", .0.display())]
    PathNotAFile(PathBuf),

    #[error("malformed document {}: {reason}", .path.display())]
    MalformedDocument { path: PathBuf, reason: String },

    #[error("no images found in {}", .0.display())]
    NoImagesFound(PathBuf),

    #[error("found {images} images but {segmentations} segmentation images")]
    SegmentationMismatch { images: usize, segmentations: usize },

    /// Returned by pose mutations given a non-finite position or a matrix
    /// that is not a rotation. Per-entity problems found while loading go to
    /// the invalid lists instead.
    #[error("invalid data for {entity}: {reason}")]
    InvalidEntityData { entity: String, reason: String },

    /// Unresolved references are dropped during loads and stale handles
    /// surface as `NotFound`, so no operation currently returns this.
    #[error("{entity} is not managed by this cache")]
    ReferentialMismatch { entity: String },

    #[error("failed to persist pose {id}: {reason}")]
    PersistenceFailed { id: String, reason: String },

    #[error("{0} not found")]
    NotFound(String),

    #[error("invalid state: {0}")]
    InvalidState(String),

    #[error("pose recovery failed: {0}")]
    PoseRecoveryFailed(#[from] PnpError),

    #[error("configuration error: {0}")]
    Config(String),
}

impl Error {
    pub fn kind(&self) -> ErrorKind {
        match self {
            Error::PathNotFound(_) => ErrorKind::PathNotFound,
            Error::PathNotADirectory(_) => ErrorKind::PathNotADirectory,
            Error::PathNotAFile(_) => ErrorKind::PathNotAFile,
            Error::MalformedDocument { .. } => ErrorKind::MalformedDocument,
            Error::NoImagesFound(_) => ErrorKind::NoImagesFound,
            Error::SegmentationMismatch { .. } => ErrorKind::SegmentationMismatch,
            Error::InvalidEntityData { .. } => ErrorKind::InvalidEntityData,
            Error::ReferentialMismatch { .. } => ErrorKind::ReferentialMismatch,
            Error::PersistenceFailed { .. } => ErrorKind::PersistenceFailed,
            Error::NotFound(_) => ErrorKind::NotFound,
            Error::InvalidState(_) => ErrorKind::InvalidState,
            Error::PoseRecoveryFailed(_) => ErrorKind::PoseRecoveryFailed,
            Error::Config(_) => ErrorKind::Config,
        }
    }

    pub(crate) fn persistence(id: &str, reason: impl std::fmt::Display) -> Self {
        Error::PersistenceFailed {
            id: id.to_string(),
            reason: reason.to_string(),
        }
    }

    pub(crate) fn malformed(path: impl Into<PathBuf>, reason: impl std::fmt::Display) -> Self {
        Error::MalformedDocument {
            path: path.into(),
            reason: reason.to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_kind_matches_variant() {
        let err = Error::NotFound("pose abc".into());
        assert_eq!(err.kind(), ErrorKind::NotFound);
        assert_eq!(err.to_string(), "pose abc not found");

        let err = Error::persistence("img1_model1", "disk full");
        assert_eq!(err.kind(), ErrorKind::PersistenceFailed);
        assert!(err.to_string().contains("disk full"));
    }
}
