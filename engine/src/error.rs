//! Error types for the transfer engine.
//!
//! `EngineError` is returned by every public engine operation. It groups
//! failures into the families an operator has to react to differently:
//!
//! - `PathError`: pre-flight problems found before anything is mutated
//! - `FixityError`: a copy could not be proven identical to its source
//! - `TransferError`: I/O failure while reading, copying or moving files
//! - `PackagingError`: failures reported by the packaging library

use std::io;
use std::path::PathBuf;
use thiserror::Error;

use crate::compare::AggregateStats;
use crate::packaging::PackagingError;

/// Result alias used throughout the engine.
pub type Result<T> = std::result::Result<T, EngineError>;

/// Top-level engine error.
#[derive(Debug, Error)]
pub enum EngineError {
    #[error(transparent)]
    Path(#[from] PathError),

    #[error(transparent)]
    Fixity(#[from] FixityError),

    #[error(transparent)]
    Transfer(#[from] TransferError),

    #[error(transparent)]
    Packaging(#[from] PackagingError),

    /// The metadata file could not be read or parsed
    #[error("Metadata file error: {}: {reason}", path.display())]
    Metadata { path: PathBuf, reason: String },

    /// An option value is out of range or inconsistent with the mode
    #[error("Invalid configuration: {0}")]
    Config(String),
}

/// Pre-flight path errors. Raised before any file is touched.
#[derive(Debug, Error)]
pub enum PathError {
    #[error("File or directory not found: {}", path.display())]
    SourceNotFound { path: PathBuf },

    #[error("File or directory exists: {}", path.display())]
    DestinationExists { path: PathBuf },

    #[error("Directory not found: {}", path.display())]
    ParentNotFound { path: PathBuf },

    #[error("Name collision at {}: {reason}", path.display())]
    Collision { path: PathBuf, reason: String },

    #[error("Invalid path: {} ({reason})", path.display())]
    InvalidPath { path: PathBuf, reason: String },

    #[error("Duplicate manifest entry: {path}")]
    DuplicateEntry { path: String },

    #[error("Could not allocate a unique staging directory in {}", root.display())]
    StagingUnavailable { root: PathBuf },
}

/// Fixity failures. Raised after copying; the copied files are left in place.
#[derive(Debug, Error, PartialEq, Eq)]
pub enum FixityError {
    #[error("Number of copied files does not match source: expected {expected}, found {actual}")]
    CountMismatch { expected: usize, actual: usize },

    #[error("Checksum mismatch: {path}")]
    DigestMismatch { path: String },

    #[error("File path mismatch: expected {expected}, found {actual}")]
    PathMismatch { expected: String, actual: String },

    #[error("Manifest algorithms differ: expected {expected}, found {actual}")]
    AlgorithmMismatch { expected: String, actual: String },

    #[error(
        "Expected {} files and {} bytes, but found {} files and {} bytes",
        expected.files, expected.bytes, actual.files, actual.bytes
    )]
    AggregateMismatch {
        expected: AggregateStats,
        actual: AggregateStats,
    },
}

impl FixityError {
    /// Relative path of the offending file, when the failure names one.
    pub fn path(&self) -> Option<&str> {
        match self {
            Self::DigestMismatch { path } => Some(path),
            Self::PathMismatch { expected, .. } => Some(expected),
            _ => None,
        }
    }
}

/// I/O failures during enumeration, hashing, copying or moving.
#[derive(Debug, Error)]
pub enum TransferError {
    #[error("Failed to read file: {}", path.display())]
    Read { path: PathBuf, source: io::Error },

    #[error("Failed to write file: {}", path.display())]
    Write { path: PathBuf, source: io::Error },

    #[error("Failed to remove: {}", path.display())]
    Remove { path: PathBuf, source: io::Error },

    #[error("Failed to create directory: {}", path.display())]
    DirectoryCreation { path: PathBuf, source: io::Error },

    #[error("Failed to enumerate directory: {}", path.display())]
    Enumeration { path: PathBuf, source: io::Error },

    #[error("Refusing to overwrite existing file: {}", path.display())]
    AlreadyExists { path: PathBuf },
}

impl TransferError {
    /// Extract the OS error code from this error, if available.
    pub fn raw_os_error(&self) -> Option<i32> {
        match self {
            Self::Read { source, .. }
            | Self::Write { source, .. }
            | Self::Remove { source, .. }
            | Self::DirectoryCreation { source, .. }
            | Self::Enumeration { source, .. } => source.raw_os_error(),
            Self::AlreadyExists { .. } => None,
        }
    }
}

impl From<walkdir::Error> for TransferError {
    fn from(err: walkdir::Error) -> Self {
        let path = err
            .path()
            .map(|p| p.to_path_buf())
            .unwrap_or_default();
        let source = match err.into_io_error() {
            Some(e) => e,
            None => io::Error::new(io::ErrorKind::Other, "filesystem loop detected"),
        };
        TransferError::Enumeration { path, source }
    }
}

impl From<walkdir::Error> for EngineError {
    fn from(err: walkdir::Error) -> Self {
        EngineError::Transfer(err.into())
    }
}
