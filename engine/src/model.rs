//! Core data model for transfer jobs.
//!
//! This module defines the main data structures for one engine invocation:
//! - TransferPlan: what to operate on and where the result goes
//! - JobOptions: how to verify and package it
//! - TransferJob: the plan plus the orchestrator's state machine position
//! - JobReport: what a successful run proved and produced

use std::fmt;
use std::path::PathBuf;
use std::time::SystemTime;
use uuid::Uuid;

use crate::checksums::ChecksumAlgorithm;
use crate::fs_ops::TransferStats;
use crate::metadata::BagInfo;
use crate::oplog::OperationLog;
use crate::paths::PathSet;

/// The workflow a job runs.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum OperationMode {
    /// Package one or more sources into a container
    Bag,
    /// Extract a container's payload and metadata
    Unbag,
    /// Check a container's internal consistency
    Validate,
    /// Rewrite a container's info fields (and optionally manifests)
    Update,
}

impl fmt::Display for OperationMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationMode::Bag => write!(f, "bag"),
            OperationMode::Unbag => write!(f, "unbag"),
            OperationMode::Validate => write!(f, "validate"),
            OperationMode::Update => write!(f, "update"),
        }
    }
}

/// Destination directory convention.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum LayoutMode {
    /// Payload lands directly in the target directory
    #[default]
    Direct,
    /// objects/ + metadata/submissionDocumentation/ convention
    Archival,
}

/// Whether a file transfer leaves the source in place.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferMode {
    /// Copy files; source remains unchanged
    Copy,
    /// Move files; source is consumed
    Move,
}

impl fmt::Display for TransferMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            TransferMode::Copy => write!(f, "Copy"),
            TransferMode::Move => write!(f, "Move"),
        }
    }
}

/// What a job operates on.
///
/// When `in_place` is set, `destination_root` is ignored and every
/// operation happens inside the (single) source root.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TransferPlan {
    pub sources: Vec<PathBuf>,
    pub destination_root: Option<PathBuf>,
    pub layout: LayoutMode,
    pub in_place: bool,
}

impl TransferPlan {
    /// The first (and for every mode except bag, only) source.
    pub fn primary_source(&self) -> Option<&PathBuf> {
        self.sources.first()
    }
}

/// Per-run configuration.
#[derive(Debug, Clone)]
pub struct JobOptions {
    /// Digest algorithm used when creating containers
    pub algorithm: ChecksumAlgorithm,
    /// Hashing parallelism degree (1 = sequential)
    pub processes: usize,
    /// Substitute aggregate count/size checks for digest comparison
    pub fast: bool,
    /// Copy container tag files (and the operation log) into a sidecar when unbagging
    pub copy_bag_files: bool,
    /// Emit the archival checksum file when unbagging with the archival layout
    pub archival_manifest: bool,
    /// Regenerate payload manifests when updating
    pub regenerate_manifests: bool,
    /// Container info fields supplied by the operator
    pub info: BagInfo,
    /// Documents copied into the container root when bagging
    pub submission_documents: Vec<PathBuf>,
}

impl Default for JobOptions {
    fn default() -> Self {
        JobOptions {
            algorithm: ChecksumAlgorithm::Sha256,
            processes: 1,
            fast: false,
            copy_bag_files: true,
            archival_manifest: true,
            regenerate_manifests: false,
            info: BagInfo::new(),
            submission_documents: Vec::new(),
        }
    }
}

/// Orchestrator state machine position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Phase {
    Idle,
    Validating,
    Planning,
    /// In-place only
    Staging,
    /// Bagging only, skipped in fast mode
    PreHashing,
    Copying,
    PostVerify,
    ExternalPackaging,
    MetadataFinalize,
    Done,
    Aborted,
}

impl Phase {
    /// Returns true if this phase is terminal (no further transitions).
    pub fn is_terminal(&self) -> bool {
        matches!(self, Phase::Done | Phase::Aborted)
    }

    /// Position in the forward ordering; `Aborted` has none.
    fn ordinal(&self) -> Option<u8> {
        Some(match self {
            Phase::Idle => 0,
            Phase::Validating => 1,
            Phase::Planning => 2,
            Phase::Staging => 3,
            Phase::PreHashing => 4,
            Phase::Copying => 5,
            Phase::PostVerify => 6,
            Phase::ExternalPackaging => 7,
            Phase::MetadataFinalize => 8,
            Phase::Done => 9,
            Phase::Aborted => return None,
        })
    }

    /// Whether `next` may follow `self`. Phases only move forward (optional
    /// phases may be skipped) and any non-terminal phase may abort.
    pub fn can_transition_to(&self, next: Phase) -> bool {
        if self.is_terminal() {
            return false;
        }
        match (self.ordinal(), next.ordinal()) {
            (_, None) => true,
            (Some(from), Some(to)) => to > from,
            (None, Some(_)) => false,
        }
    }
}

impl fmt::Display for Phase {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Phase::Idle => "idle",
            Phase::Validating => "validating",
            Phase::Planning => "planning",
            Phase::Staging => "staging",
            Phase::PreHashing => "pre-hashing",
            Phase::Copying => "copying",
            Phase::PostVerify => "post-verify",
            Phase::ExternalPackaging => "external packaging",
            Phase::MetadataFinalize => "metadata finalize",
            Phase::Done => "done",
            Phase::Aborted => "aborted",
        };
        f.write_str(name)
    }
}

/// How the copies of a run were verified.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Verification {
    /// Digest-by-digest manifest comparison
    Checksum,
    /// File count and total byte size only
    Aggregate,
}

impl Verification {
    pub fn from_fast(fast: bool) -> Self {
        if fast {
            Verification::Aggregate
        } else {
            Verification::Checksum
        }
    }

    /// Value recorded under the `Fixity check type` key.
    pub fn description(&self) -> &'static str {
        match self {
            Verification::Checksum => "checksum validation",
            Verification::Aggregate => "file number and size validation",
        }
    }
}

/// One invocation of the engine.
#[derive(Debug)]
pub struct TransferJob {
    /// Unique identifier for this job
    pub id: Uuid,

    pub mode: OperationMode,

    pub plan: TransferPlan,

    pub options: JobOptions,

    /// Resolved layout, available once Planning has run
    pub paths: Option<PathSet>,

    /// Current state machine position
    pub phase: Phase,

    /// Phase that was active when the job aborted
    pub aborted_in: Option<Phase>,

    /// Phase timestamps and environment facts
    pub log: OperationLog,

    /// When job was created
    pub created_at: SystemTime,
}

/// Outcome of a successful run.
#[derive(Debug, Clone)]
pub struct JobReport {
    pub mode: OperationMode,
    /// Final location of the result (container root or payload directory)
    pub destination: PathBuf,
    pub verification: Verification,
    /// Number of manifest entries proven identical (0 for aggregate checks)
    pub verified_entries: usize,
    pub transfer: TransferStats,
    pub log: OperationLog,
}
