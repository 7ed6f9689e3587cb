//! Progress reporting trait.
//!
//! The engine never prints. Front ends subscribe to a running job through
//! `ProgressCallback` and decide for themselves what to show.

use std::path::Path;

use crate::model::{JobReport, Phase, TransferJob};

/// Trait for receiving progress updates from a running job.
///
/// All methods are called synchronously on the orchestrator thread. Every
/// method has an empty default so implementors pick what they need.
pub trait ProgressCallback: Send {
    /// Called when the job enters `phase`.
    fn on_phase_started(&self, _job: &TransferJob, _phase: Phase) {}

    /// Called when `phase` finished without error.
    fn on_phase_completed(&self, _job: &TransferJob, _phase: Phase) {}

    /// Called after each file is copied or moved.
    fn on_file_transferred(&self, _src: &Path, _dst: &Path, _bytes: u64) {}

    /// Called once the job reaches `Done`.
    fn on_job_completed(&self, _job: &TransferJob, _report: &JobReport) {}
}
