//! Packaging library interface.
//!
//! The transfer engine never parses a container's on-disk declaration
//! format itself. Everything it needs from the container goes through the
//! `PackagingLibrary` trait, and the orchestrator holds a plain
//! `ContainerHandle` value describing the opened container.

use std::fmt;
use std::path::{Path, PathBuf};
use thiserror::Error;

use crate::checksums::ChecksumAlgorithm;
use crate::error::{EngineError, TransferError};
use crate::manifest::ChecksumManifest;
use crate::metadata::BagInfo;

/// Kind of a per-file problem found while validating a container.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FixityDetailKind {
    ChecksumMismatch,
    FileMissing,
    UnexpectedFile,
}

/// One per-file problem found while validating a container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FixityDetail {
    pub kind: FixityDetailKind,
    pub path: String,
}

impl FixityDetail {
    pub fn new(kind: FixityDetailKind, path: impl Into<String>) -> Self {
        FixityDetail {
            kind,
            path: path.into(),
        }
    }
}

impl fmt::Display for FixityDetail {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let label = match self.kind {
            FixityDetailKind::ChecksumMismatch => "checksum mismatch",
            FixityDetailKind::FileMissing => "file missing",
            FixityDetailKind::UnexpectedFile => "unexpected file",
        };
        write!(f, "{}: {}", label, self.path)
    }
}

/// Per-file detail lines, or a generic message when none are known.
pub struct FixityDetails<'a>(pub &'a [FixityDetail]);

impl fmt::Display for FixityDetails<'_> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0.is_empty() {
            return f.write_str("container contents do not match its manifests");
        }
        for (i, detail) in self.0.iter().enumerate() {
            if i > 0 {
                f.write_str("\n")?;
            }
            write!(f, "{}", detail)?;
        }
        Ok(())
    }
}

/// Errors surfaced by a packaging library.
#[derive(Debug, Error)]
pub enum PackagingError {
    /// The container is structurally invalid or cannot be opened
    #[error("Invalid container {}: {reason}", path.display())]
    Invalid { path: PathBuf, reason: String },

    /// The container's contents disagree with its own manifests
    #[error("Container failed fixity check:\n{}", FixityDetails(details))]
    Fixity { details: Vec<FixityDetail> },

    #[error(transparent)]
    Transfer(#[from] TransferError),
}

impl PackagingError {
    pub(crate) fn invalid(path: &Path, reason: impl Into<String>) -> Self {
        PackagingError::Invalid {
            path: path.to_path_buf(),
            reason: reason.into(),
        }
    }

    /// Wrap an engine failure raised while the library hashed or walked
    /// the container at `path`.
    pub(crate) fn from_engine(path: &Path, err: EngineError) -> Self {
        match err {
            EngineError::Transfer(e) => PackagingError::Transfer(e),
            EngineError::Packaging(e) => e,
            other => PackagingError::invalid(path, other.to_string()),
        }
    }
}

/// An opened container.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ContainerHandle {
    /// Container root directory
    pub path: PathBuf,
    /// Final path component of the root
    pub name: String,
    /// Directory holding the payload files
    pub payload: PathBuf,
    /// Payload manifest algorithms present, strongest first
    pub algorithms: Vec<ChecksumAlgorithm>,
    /// Info fields as currently recorded
    pub info: BagInfo,
}

impl ContainerHandle {
    /// Strongest payload manifest algorithm present.
    pub fn primary_algorithm(&self) -> Option<ChecksumAlgorithm> {
        self.algorithms.first().copied()
    }
}

/// Narrow interface to an archival container implementation.
pub trait PackagingLibrary {
    /// Open an existing container, checking only its structure.
    fn open(&self, path: &Path) -> Result<ContainerHandle, PackagingError>;

    /// Check the container against its own manifests. `fast` limits the
    /// check to aggregate file count and size.
    fn validate(&self, handle: &ContainerHandle, fast: bool) -> Result<(), PackagingError>;

    /// Convert the directory `source_root` into a container in place.
    fn create(
        &self,
        source_root: &Path,
        algorithms: &[ChecksumAlgorithm],
        info: &BagInfo,
    ) -> Result<ContainerHandle, PackagingError>;

    /// Payload entries the container recorded for `algorithm`, relative to
    /// the payload root.
    fn read_recorded_manifest(
        &self,
        handle: &ContainerHandle,
        algorithm: ChecksumAlgorithm,
    ) -> Result<ChecksumManifest, PackagingError>;

    /// Persist `info`, optionally regenerating payload manifests.
    fn save(
        &self,
        handle: &mut ContainerHandle,
        info: &BagInfo,
        regenerate_manifests: bool,
    ) -> Result<(), PackagingError>;
}
