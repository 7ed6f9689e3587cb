//! # bagport Engine - Integrity-Verified Transfer Library
//!
//! A headless engine that packages file collections into BagIt bags and
//! unpacks them again, proving at every step that the copied bytes match
//! their source. Front ends (the `bagport` CLI, automation) drive it through
//! jobs and observe it through progress callbacks.
//!
//! ## Overview
//!
//! The engine provides:
//! - Destination layout planning, including the archival
//!   objects/metadata convention and in-place staging
//! - Parallel checksum manifests of file trees
//! - Manifest comparison with precise mismatch reporting, plus a cheaper
//!   aggregate count/size check
//! - Copy and move primitives that never overwrite
//! - Bag, unbag, validate and update workflows
//! - A built-in BagIt packaging library behind a narrow trait
//!
//! ## Basic Usage
//!
//! ```no_run
//! use bagport_engine::{create_job, run_job, BagItLibrary, JobOptions, LayoutMode,
//!     OperationMode, TransferPlan};
//! use std::path::PathBuf;
//!
//! # fn main() -> Result<(), Box<dyn std::error::Error>> {
//! let plan = TransferPlan {
//!     sources: vec![PathBuf::from("/bags/accession1")],
//!     destination_root: Some(PathBuf::from("/processing")),
//!     layout: LayoutMode::Archival,
//!     in_place: false,
//! };
//! let mut job = create_job(OperationMode::Unbag, plan, JobOptions::default())?;
//!
//! let report = run_job(&mut job, &BagItLibrary::default(), None)?;
//! println!("Unbagged to {} ({} files verified)", report.destination.display(), report.verified_entries);
//! # Ok(())
//! # }
//! ```
//!
//! ## Modules
//!
//! - **model**: Core data structures (TransferPlan, JobOptions, TransferJob, Phase)
//! - **error**: Error types and handling
//! - **checksums**: Digest algorithms and streaming hashers
//! - **manifest**: Checksum manifests of file trees
//! - **compare**: Full and aggregate manifest comparison
//! - **fs_ops**: Low-level filesystem operations
//! - **paths**: Destination layout planning
//! - **packaging**: Packaging library trait
//! - **bagit**: Built-in BagIt implementation
//! - **metadata**: Bag info fields
//! - **oplog**: Operation log
//! - **job**: Job orchestration (create, run)
//! - **progress**: Progress callback trait

pub mod bagit;
pub mod checksums;
pub mod compare;
pub mod error;
pub mod fs_ops;
pub mod job;
pub mod manifest;
pub mod metadata;
pub mod model;
pub mod oplog;
pub mod packaging;
pub mod paths;
pub mod progress;

// Re-export main types and functions
pub use bagit::BagItLibrary;
pub use checksums::{compute_file_checksum, ChecksumAlgorithm, Digest};
pub use compare::{compare, fast_compare, AggregateStats};
pub use error::{EngineError, FixityError, PathError, TransferError};
pub use job::{create_job, run_job};
pub use manifest::{ChecksumManifest, HashOptions, ManifestEntry, ManifestSource};
pub use metadata::{BagInfo, BagMetadata};
pub use model::{
    JobOptions, JobReport, LayoutMode, OperationMode, Phase, TransferJob, TransferMode,
    TransferPlan, Verification,
};
pub use oplog::OperationLog;
pub use packaging::{ContainerHandle, PackagingError, PackagingLibrary};
pub use paths::PathSet;
pub use progress::ProgressCallback;
