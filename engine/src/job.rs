//! Job orchestration module.
//!
//! This module provides the job lifecycle functions:
//! - Creating a job from a mode, a plan and options
//! - Running a job through the phase state machine for its mode
//!
//! A run never reports success unless the copies were proven identical to
//! their source (or, in fast mode, matched in file count and total size).
//! Any failure moves the job to `Aborted`; files already copied are left in
//! place for the operator to inspect.

use std::collections::HashSet;
use std::ffi::OsString;
use std::fs;
use std::path::{Path, PathBuf};
use std::time::SystemTime;

use chrono::Local;
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::compare::{compare, fast_compare, AggregateStats};
use crate::error::{EngineError, PathError, Result, TransferError};
use crate::fs_ops::{self, TransferDepth, TransferStats};
use crate::manifest::{ChecksumManifest, HashOptions, ManifestSource};
use crate::metadata::{self, FIXITY_TYPE_KEY};
use crate::model::{
    JobOptions, JobReport, LayoutMode, OperationMode, Phase, TransferJob, TransferMode,
    TransferPlan, Verification,
};
use crate::oplog::{OperationLog, UNBAG_LOG_NAME};
use crate::packaging::{ContainerHandle, PackagingError, PackagingLibrary};
use crate::paths::{self, PathSet, METADATA_DIR, OBJECTS_DIR};
use crate::progress::ProgressCallback;

/// How many staging names are drawn before giving up.
const STAGING_ATTEMPTS: usize = 16;

/// Create a new job.
///
/// Only static inputs are checked here; the filesystem is consulted when the
/// job runs.
///
/// # Arguments
/// * `mode` - Workflow to run
/// * `plan` - Sources, destination, layout and in-place flag
/// * `options` - Verification and packaging options
///
/// # Returns
/// A new TransferJob in the Idle phase
///
/// # Errors
/// Returns `EngineError::Config` if the plan does not fit the mode
pub fn create_job(mode: OperationMode, plan: TransferPlan, options: JobOptions) -> Result<TransferJob> {
    if options.processes == 0 {
        return Err(EngineError::Config(
            "parallelism degree must be at least 1".to_string(),
        ));
    }

    match (mode, plan.sources.len()) {
        (_, 0) => return Err(EngineError::Config("no source given".to_string())),
        (OperationMode::Bag, _) | (_, 1) => {}
        (_, n) => {
            return Err(EngineError::Config(format!(
                "{} takes exactly one bag, {} given",
                mode, n
            )))
        }
    }

    if plan.in_place && plan.sources.len() != 1 {
        return Err(EngineError::Config(
            "in-place operation takes exactly one source".to_string(),
        ));
    }

    let needs_destination = matches!(mode, OperationMode::Bag | OperationMode::Unbag);
    if needs_destination && !plan.in_place && plan.destination_root.is_none() {
        return Err(EngineError::Config(format!(
            "{} requires a destination unless run in place",
            mode
        )));
    }

    Ok(TransferJob {
        id: Uuid::new_v4(),
        mode,
        plan,
        options,
        paths: None,
        phase: Phase::Idle,
        aborted_in: None,
        log: OperationLog::new(),
        created_at: SystemTime::now(),
    })
}

/// Run a job to completion.
///
/// Drives the job through its phases, invoking progress callbacks at each
/// transition. On failure the job ends in `Aborted` with `aborted_in` naming
/// the phase that failed.
///
/// # Arguments
/// * `job` - Job to execute (must be in the Idle phase)
/// * `library` - Packaging library used to open, validate and create containers
/// * `progress_callback` - Optional callback for progress updates
///
/// # Errors
/// Returns the first error raised by any phase.
pub fn run_job(
    job: &mut TransferJob,
    library: &dyn PackagingLibrary,
    progress_callback: Option<&dyn ProgressCallback>,
) -> Result<JobReport> {
    if job.phase != Phase::Idle {
        return Err(EngineError::Config(format!(
            "job must be idle to run; current phase: {}",
            job.phase
        )));
    }

    let mut runner = Runner {
        job,
        library,
        progress: progress_callback,
    };

    let result = match runner.job.mode {
        OperationMode::Bag => runner.bag(),
        OperationMode::Unbag => runner.unbag(),
        OperationMode::Validate => runner.validate(),
        OperationMode::Update => runner.update(),
    };

    match result {
        Ok(report) => {
            runner.enter(Phase::Done)?;
            if let Some(callback) = runner.progress {
                callback.on_job_completed(runner.job, &report);
            }
            Ok(report)
        }
        Err(e) => {
            let failed = runner.job.phase;
            warn!(job_id = %runner.job.id, mode = %runner.job.mode, phase = %failed, error = %e, "job aborted");
            runner.job.aborted_in = Some(failed);
            runner.job.phase = Phase::Aborted;
            Err(e)
        }
    }
}

struct Runner<'a> {
    job: &'a mut TransferJob,
    library: &'a dyn PackagingLibrary,
    progress: Option<&'a dyn ProgressCallback>,
}

impl Runner<'_> {
    fn enter(&mut self, phase: Phase) -> Result<()> {
        let current = self.job.phase;
        if !current.can_transition_to(phase) {
            return Err(EngineError::Config(format!(
                "invalid phase transition from {} to {}",
                current, phase
            )));
        }

        if let Some(callback) = self.progress {
            if current != Phase::Idle {
                callback.on_phase_completed(self.job, current);
            }
        }
        self.job.phase = phase;
        info!(job_id = %self.job.id, mode = %self.job.mode, %phase, "phase started");
        if let Some(callback) = self.progress {
            callback.on_phase_started(self.job, phase);
        }
        Ok(())
    }

    fn options(&self) -> &JobOptions {
        &self.job.options
    }

    fn hash_options(&self, exclude: Vec<PathBuf>) -> HashOptions {
        HashOptions {
            processes: self.job.options.processes,
            exclude,
        }
    }

    fn primary_source(&self) -> Result<PathBuf> {
        self.job
            .plan
            .primary_source()
            .cloned()
            .ok_or_else(|| EngineError::Config("no source given".to_string()))
    }

    fn plan_paths(&mut self, source: &Path, staging_tag: &str) -> Result<PathSet> {
        let plan = &self.job.plan;
        let set = paths::plan(
            self.job.mode,
            plan.layout,
            plan.in_place,
            source,
            plan.destination_root.as_deref(),
            staging_tag,
        )?;
        self.job.paths = Some(set.clone());
        Ok(set)
    }

    fn report(
        &self,
        destination: PathBuf,
        verified_entries: usize,
        transfer: TransferStats,
    ) -> JobReport {
        JobReport {
            mode: self.job.mode,
            destination,
            verification: Verification::from_fast(self.job.options.fast),
            verified_entries,
            transfer,
            log: self.job.log.clone(),
        }
    }

    fn record_environment(&mut self) {
        self.job
            .log
            .record("bagport version", env!("CARGO_PKG_VERSION"));
        self.job.log.record("OS", std::env::consts::OS);
    }

    /// Package sources into a container.
    fn bag(&mut self) -> Result<JobReport> {
        if self.job.plan.in_place {
            return self.bag_in_place();
        }

        let began = Local::now();
        let verification = Verification::from_fast(self.options().fast);
        let sources = self.job.plan.sources.clone();

        self.enter(Phase::Planning)?;
        let first = self.primary_source()?;
        let set = self.plan_paths(&first, "")?;
        let out = set.container.clone();
        check_bag_sources(&sources)?;
        check_new_destination(&out)?;
        for doc in &self.options().submission_documents {
            if !doc.is_file() {
                return Err(PathError::SourceNotFound { path: doc.clone() }.into());
            }
        }

        let mut prehash = None;
        let mut hashed = None;
        if !self.options().fast {
            self.enter(Phase::PreHashing)?;
            let manifest_sources = sources
                .iter()
                .map(|s| source_with_parent_prefix(s))
                .collect::<Result<Vec<_>>>()?;
            let manifest = ChecksumManifest::build(
                &manifest_sources,
                self.options().algorithm,
                &self.hash_options(Vec::new()),
            )?;
            debug!(entries = manifest.len(), "sources hashed");
            hashed = Some(Local::now());
            prehash = Some(manifest);
        }

        self.enter(Phase::Copying)?;
        fs_ops::create_dir(&out)?;
        let mut stats = TransferStats::default();
        for source in &sources {
            let target = out.join(file_name(source)?);
            if source.is_dir() {
                stats.add(fs_ops::transfer(
                    source,
                    &target,
                    TransferDepth::Recursive,
                    TransferMode::Copy,
                    self.progress,
                )?);
            } else {
                let bytes = fs_ops::copy_file_with_metadata(source, &target)?;
                stats.files += 1;
                stats.bytes += bytes;
                if let Some(callback) = self.progress {
                    callback.on_file_transferred(source, &target, bytes);
                }
            }
        }
        let copied = Local::now();

        self.enter(Phase::PostVerify)?;
        let verified_entries = match &prehash {
            Some(expected) => {
                let actual = ChecksumManifest::build(
                    &[ManifestSource::rooted(&out)],
                    self.options().algorithm,
                    &self.hash_options(Vec::new()),
                )?;
                compare(expected, &actual)?;
                actual.len()
            }
            None => {
                for source in &sources {
                    fast_compare(source, &out.join(file_name(source)?), &[])?;
                }
                0
            }
        };
        let validated = Local::now();

        self.enter(Phase::ExternalPackaging)?;
        let handle = self.create_container(&out, verification, prehash.as_ref())?;
        let packaged = Local::now();

        self.enter(Phase::MetadataFinalize)?;
        for doc in self.options().submission_documents.clone() {
            let target = handle.path.join(file_name(&doc)?);
            fs_ops::copy_file_with_metadata(&doc, &target)?;
        }

        self.record_environment();
        let listed: Vec<String> = sources.iter().map(|s| s.display().to_string()).collect();
        self.job.log.record("sources", listed.join(", "));
        self.job.log.record("target", out.display().to_string());
        self.job.log.record_time("bagging began", &began);
        if let Some(hashed) = &hashed {
            self.job.log.record_time("sources hashed", hashed);
        }
        self.job.log.record_time("copied to target", &copied);
        self.job.log.record_time("copies validated", &validated);
        self.job.log.record_time("bag created", &packaged);
        self.job.log.record(FIXITY_TYPE_KEY, verification.description());

        Ok(self.report(handle.path, verified_entries, stats))
    }

    fn bag_in_place(&mut self) -> Result<JobReport> {
        let began = Local::now();
        let verification = Verification::from_fast(self.options().fast);
        let source = self.primary_source()?;

        self.enter(Phase::Planning)?;
        if !source.is_dir() {
            return Err(PathError::InvalidPath {
                path: source.clone(),
                reason: "bagging in place requires a directory".to_string(),
            }
            .into());
        }
        ensure_not_running_from(&source)?;
        let set = self.plan_paths(&source, "")?;
        for doc in &self.options().submission_documents {
            if !doc.is_file() {
                return Err(PathError::SourceNotFound { path: doc.clone() }.into());
            }
        }

        let mut prehash = None;
        let mut aggregate = None;
        let mut hashed = None;
        if self.options().fast {
            aggregate = Some(AggregateStats::collect(&source, &[])?);
        } else {
            self.enter(Phase::PreHashing)?;
            prehash = Some(ChecksumManifest::build(
                &[ManifestSource::rooted(&source)],
                self.options().algorithm,
                &self.hash_options(Vec::new()),
            )?);
            hashed = Some(Local::now());
        }

        self.enter(Phase::ExternalPackaging)?;
        let handle = self.create_container(&set.container, verification, prehash.as_ref())?;
        if let Some(expected) = aggregate {
            expected.ensure_matches(&AggregateStats::collect(&handle.payload, &[])?)?;
        }
        let verified_entries = prehash.as_ref().map_or(0, |m| m.len());

        self.enter(Phase::MetadataFinalize)?;
        for doc in self.options().submission_documents.clone() {
            fs_ops::copy_file_with_metadata(&doc, &handle.path.join(file_name(&doc)?))?;
        }

        self.record_environment();
        self.job.log.record("sources", source.display().to_string());
        self.job.log.record("target", "in place");
        self.job.log.record_time("bagging began", &began);
        if let Some(hashed) = &hashed {
            self.job.log.record_time("sources hashed", hashed);
        }
        self.job.log.record_time("bag created", &Local::now());
        self.job.log.record(FIXITY_TYPE_KEY, verification.description());

        Ok(self.report(handle.path, verified_entries, TransferStats::default()))
    }

    /// Hand `root` to the packaging library, then prove the container
    /// recorded exactly the digests computed before copying.
    fn create_container(
        &self,
        root: &Path,
        verification: Verification,
        prehash: Option<&ChecksumManifest>,
    ) -> Result<ContainerHandle> {
        let options = self.options();
        let mut info = options.info.clone();
        metadata::stamp_updates(&mut info, !options.info.is_empty(), false, &Local::now());
        metadata::record_provenance(&mut info, verification);

        let handle = self.library.create(root, &[options.algorithm], &info)?;

        if let Some(expected) = prehash {
            let recorded = self
                .library
                .read_recorded_manifest(&handle, options.algorithm)?;
            compare(expected, &recorded)?;
            debug!(entries = recorded.len(), "container manifest matches source");
        }
        Ok(handle)
    }

    /// Extract a container's payload and tag files.
    fn unbag(&mut self) -> Result<JobReport> {
        let began = Local::now();
        let in_place = self.job.plan.in_place;
        let layout = self.job.plan.layout;
        let fast = self.options().fast;
        let verification = Verification::from_fast(fast);
        let source = self.primary_source()?;

        self.enter(Phase::Validating)?;
        let handle = self.library.open(&source)?;
        self.library.validate(&handle, fast)?;
        let bag_validated = Local::now();

        self.enter(Phase::Planning)?;
        let staging_tag = if in_place {
            ensure_not_running_from(&handle.path)?;
            allocate_staging_tag(&handle.path, &handle.payload)?
        } else {
            String::new()
        };
        let set = self.plan_paths(&handle.path, &staging_tag)?;
        check_unbag_collisions(&handle, &set, layout, in_place)?;
        for dir in set.directories_to_create(in_place) {
            fs_ops::create_dir_all(&dir)?;
        }

        let algorithm = handle.primary_algorithm().ok_or_else(|| {
            PackagingError::Invalid {
                path: handle.path.clone(),
                reason: "container has no payload manifest".to_string(),
            }
        })?;
        let recorded = self.library.read_recorded_manifest(&handle, algorithm)?;
        let expected_aggregate = if fast {
            Some(AggregateStats::collect(&handle.payload, &[])?)
        } else {
            None
        };

        let staging = set.staging_dirs();
        let copy_from = if in_place {
            self.enter(Phase::Staging)?;
            let (Some(staged_payload), Some(staged_tags)) = (&set.staging_payload, &set.staging_tags)
            else {
                return Err(EngineError::Config("in-place plan has no staging directories".to_string()));
            };
            fs_ops::rename(&handle.payload, staged_payload)?;
            fs_ops::create_dir(staged_tags)?;
            fs_ops::transfer(
                &handle.path,
                staged_tags,
                TransferDepth::Flat,
                TransferMode::Move,
                None,
            )?;
            debug!(staging = %staged_payload.display(), "payload staged");
            staged_payload.clone()
        } else {
            handle.payload.clone()
        };

        self.enter(Phase::Copying)?;
        let mode = if in_place {
            TransferMode::Move
        } else {
            TransferMode::Copy
        };
        let stats = fs_ops::transfer(
            &copy_from,
            &set.payload,
            TransferDepth::Recursive,
            mode,
            self.progress,
        )?;
        let copied = Local::now();

        self.enter(Phase::PostVerify)?;
        let verified_entries = match expected_aggregate {
            Some(expected) => {
                expected.ensure_matches(&AggregateStats::collect(&set.payload, &staging)?)?;
                0
            }
            None => {
                let actual = ChecksumManifest::build(
                    &[ManifestSource::rooted(&set.payload)],
                    algorithm,
                    &self.hash_options(staging.clone()),
                )?;
                compare(&recorded, &actual)?;
                actual.len()
            }
        };
        let copies_validated = Local::now();

        if layout == LayoutMode::Archival && self.options().archival_manifest {
            self.enter(Phase::ExternalPackaging)?;
            if let Some(metadata_dir) = &set.archival_metadata {
                let written = recorded.write_archival(metadata_dir)?;
                debug!(path = %written.display(), "wrote archival checksum file");
            }
        }

        self.enter(Phase::MetadataFinalize)?;
        self.record_environment();
        self.job.log.record("bag name", handle.name.clone());
        self.job.log.record("origin", handle.path.display().to_string());
        let target = match (&set.parent, in_place) {
            (_, true) => "in place".to_string(),
            (Some(parent), false) => parent.display().to_string(),
            (None, false) => set.payload.display().to_string(),
        };
        self.job.log.record("target", target);
        self.job.log.record_time("unbagging began", &began);
        self.job.log.record_time("bag validated", &bag_validated);
        self.job.log.record_time("copied to target", &copied);
        self.job.log.record_time("copies validated", &copies_validated);
        self.job.log.record(FIXITY_TYPE_KEY, verification.description());

        if self.options().copy_bag_files {
            if let Some(bag_files) = &set.bag_files {
                let (tag_source, tag_mode) = match &set.staging_tags {
                    Some(staged_tags) => (staged_tags.clone(), TransferMode::Move),
                    None => (handle.path.clone(), TransferMode::Copy),
                };
                fs_ops::create_dir_all(bag_files)?;
                fs_ops::transfer(&tag_source, bag_files, TransferDepth::Flat, tag_mode, None)?;
                self.job.log.write_once(&bag_files.join(UNBAG_LOG_NAME))?;
            }
        }

        for dir in &staging {
            fs_ops::remove_dir_all(dir)?;
        }

        let destination = set.parent.clone().unwrap_or_else(|| set.payload.clone());
        Ok(self.report(destination, verified_entries, stats))
    }

    /// Check a container against its own manifests.
    fn validate(&mut self) -> Result<JobReport> {
        let source = self.primary_source()?;
        let fast = self.options().fast;

        self.enter(Phase::Validating)?;
        let handle = self.library.open(&source)?;
        self.library.validate(&handle, fast)?;
        self.job.log.record("bag name", handle.name.clone());
        self.job.log.record_time("bag validated", &Local::now());
        self.job
            .log
            .record(FIXITY_TYPE_KEY, Verification::from_fast(fast).description());

        let verified_entries = match (fast, handle.primary_algorithm()) {
            (false, Some(algorithm)) => self.library.read_recorded_manifest(&handle, algorithm)?.len(),
            _ => 0,
        };
        Ok(self.report(handle.path, verified_entries, TransferStats::default()))
    }

    /// Rewrite a container's info fields, optionally regenerating manifests.
    fn update(&mut self) -> Result<JobReport> {
        let source = self.primary_source()?;
        let regenerate = self.options().regenerate_manifests;

        self.enter(Phase::Validating)?;
        let mut handle = self.library.open(&source)?;
        // Regenerating rewrites the manifests from the payload, so only a
        // metadata-only update has to prove the bag intact first.
        if !regenerate {
            self.library.validate(&handle, self.options().fast)?;
        }

        self.enter(Phase::ExternalPackaging)?;
        let updates = self.options().info.clone();
        let mut info = handle.info.clone();
        metadata::merge_fields(&mut info, &updates);
        metadata::stamp_updates(&mut info, !updates.is_empty(), regenerate, &Local::now());
        if regenerate {
            info.insert(
                FIXITY_TYPE_KEY.to_string(),
                Verification::from_fast(self.options().fast).description().to_string(),
            );
        }
        self.library.save(&mut handle, &info, regenerate)?;

        self.job.log.record("bag name", handle.name.clone());
        self.job.log.record_time("bag updated", &Local::now());
        Ok(self.report(handle.path, 0, TransferStats::default()))
    }
}

fn file_name(path: &Path) -> Result<OsString> {
    path.file_name().map(|n| n.to_os_string()).ok_or_else(|| {
        PathError::InvalidPath {
            path: path.to_path_buf(),
            reason: "path has no final component".to_string(),
        }
        .into()
    })
}

/// Hash a bag source relative to its parent, so `/a/x` is recorded as `a/x`
/// and a single file `/b/file.txt` as `file.txt`.
fn source_with_parent_prefix(source: &Path) -> Result<ManifestSource> {
    let parent = source.parent().ok_or_else(|| PathError::InvalidPath {
        path: source.to_path_buf(),
        reason: "cannot bag a filesystem root".to_string(),
    })?;
    Ok(ManifestSource::new(source, parent))
}

fn check_bag_sources(sources: &[PathBuf]) -> Result<()> {
    let mut names = HashSet::new();
    for source in sources {
        if source.symlink_metadata().is_err() {
            return Err(PathError::SourceNotFound {
                path: source.clone(),
            }
            .into());
        }
        let name = file_name(source)?;
        if !names.insert(name) {
            return Err(PathError::Collision {
                path: source.clone(),
                reason: "another source has the same name".to_string(),
            }
            .into());
        }
    }
    Ok(())
}

fn check_new_destination(path: &Path) -> Result<()> {
    if path.symlink_metadata().is_ok() {
        return Err(PathError::DestinationExists {
            path: path.to_path_buf(),
        }
        .into());
    }
    match path.parent() {
        Some(parent) if parent.as_os_str().is_empty() || parent.is_dir() => Ok(()),
        Some(parent) => Err(PathError::ParentNotFound {
            path: parent.to_path_buf(),
        }
        .into()),
        None => Err(PathError::InvalidPath {
            path: path.to_path_buf(),
            reason: "destination has no parent directory".to_string(),
        }
        .into()),
    }
}

fn top_level_names(dir: &Path) -> Result<Vec<OsString>> {
    let entries = fs::read_dir(dir).map_err(|e| TransferError::Enumeration {
        path: dir.to_path_buf(),
        source: e,
    })?;
    let mut names = Vec::new();
    for entry in entries {
        let entry = entry.map_err(|e| TransferError::Enumeration {
            path: dir.to_path_buf(),
            source: e,
        })?;
        names.push(entry.file_name());
    }
    Ok(names)
}

fn check_unbag_collisions(
    handle: &ContainerHandle,
    set: &PathSet,
    layout: LayoutMode,
    in_place: bool,
) -> Result<()> {
    if !in_place {
        let destination = set.parent.as_ref().unwrap_or(&set.payload);
        if let Some(root) = destination.parent() {
            if !root.is_dir() {
                return Err(PathError::ParentNotFound {
                    path: root.to_path_buf(),
                }
                .into());
            }
        }
        check_new_destination(destination)?;
    }

    let (dir, reserved): (&Path, Vec<String>) = match layout {
        LayoutMode::Direct => (
            handle.payload.as_path(),
            vec![paths::bag_files_name(&handle.name)],
        ),
        LayoutMode::Archival if in_place => (
            handle.path.as_path(),
            vec![OBJECTS_DIR.to_string(), METADATA_DIR.to_string()],
        ),
        LayoutMode::Archival => return Ok(()),
    };

    for name in top_level_names(dir)? {
        if reserved.iter().any(|r| name == r.as_str()) {
            return Err(PathError::Collision {
                path: dir.join(&name),
                reason: "name is reserved by the unbagged layout".to_string(),
            }
            .into());
        }
    }
    Ok(())
}

/// Draw staging names until neither name exists in the container root nor
/// as a top-level payload entry.
fn allocate_staging_tag(root: &Path, payload: &Path) -> Result<String> {
    for _ in 0..STAGING_ATTEMPTS {
        let tag = paths::staging_tag(&Local::now(), Uuid::new_v4());
        let tags_name = paths::staging_tags_name(&tag);
        let taken = [&tag, &tags_name].into_iter().any(|name| {
            root.join(name).symlink_metadata().is_ok() || payload.join(name).symlink_metadata().is_ok()
        });
        if !taken {
            return Ok(tag);
        }
        debug!(%tag, "staging name taken, drawing another");
    }
    Err(PathError::StagingUnavailable {
        root: root.to_path_buf(),
    }
    .into())
}

/// Refuse to rearrange a tree the running program lives in.
fn ensure_not_running_from(root: &Path) -> Result<()> {
    let Ok(exe) = std::env::current_exe() else {
        return Ok(());
    };
    let exe = fs::canonicalize(&exe).unwrap_or(exe);
    let root = fs::canonicalize(root).unwrap_or_else(|_| root.to_path_buf());
    if exe.starts_with(&root) {
        return Err(PathError::InvalidPath {
            path: root,
            reason: "directory contains the running program".to_string(),
        }
        .into());
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::bagit::{BagItLibrary, BAG_INFO_TXT, BAGIT_TXT};
    use crate::checksums::ChecksumAlgorithm;
    use crate::error::FixityError;
    use crate::metadata::{BagInfo, INFO_UPDATED_KEY, MANIFESTS_UPDATED_KEY};
    use std::sync::Mutex;

    fn write(path: &Path, content: &[u8]) {
        fs::create_dir_all(path.parent().expect("parent")).expect("Failed to create dirs");
        fs::write(path, content).expect("Failed to write file");
    }

    fn count_files(root: &Path) -> usize {
        fs_ops::walk_files(root, &[]).count()
    }

    fn to_target(sources: Vec<PathBuf>, destination: &Path) -> TransferPlan {
        TransferPlan {
            sources,
            destination_root: Some(destination.to_path_buf()),
            layout: LayoutMode::Direct,
            in_place: false,
        }
    }

    fn in_place(source: &Path) -> TransferPlan {
        TransferPlan {
            sources: vec![source.to_path_buf()],
            destination_root: None,
            layout: LayoutMode::Direct,
            in_place: true,
        }
    }

    /// Bags `root`'s current contents in place and returns the bag path.
    fn make_bag(root: &Path) -> PathBuf {
        write(&root.join("report.txt"), b"annual report");
        write(&root.join("photos").join("one.jpg"), b"jpeg one");
        write(&root.join("photos").join("nested").join("two.jpg"), b"jpeg two");
        BagItLibrary::default()
            .create(root, &[ChecksumAlgorithm::Sha256], &BagInfo::new())
            .expect("Failed to create bag");
        root.to_path_buf()
    }

    // Test helper: records callback invocations
    struct TestProgressCallback {
        calls: Mutex<Vec<String>>,
    }

    impl TestProgressCallback {
        fn new() -> Self {
            TestProgressCallback {
                calls: Mutex::new(Vec::new()),
            }
        }

        fn get_calls(&self) -> Vec<String> {
            self.calls.lock().expect("lock").clone()
        }
    }

    impl ProgressCallback for TestProgressCallback {
        fn on_phase_started(&self, _job: &TransferJob, phase: Phase) {
            self.calls.lock().expect("lock").push(format!("start {}", phase));
        }

        fn on_file_transferred(&self, _src: &Path, _dst: &Path, _bytes: u64) {
            self.calls.lock().expect("lock").push("file".to_string());
        }

        fn on_job_completed(&self, _job: &TransferJob, _report: &JobReport) {
            self.calls.lock().expect("lock").push("completed".to_string());
        }
    }

    /// Packaging library that leaves the tree untouched and reports a fresh
    /// hash of it as the recorded manifest.
    struct PassThroughLibrary;

    impl PackagingLibrary for PassThroughLibrary {
        fn open(&self, path: &Path) -> std::result::Result<ContainerHandle, PackagingError> {
            Ok(ContainerHandle {
                path: path.to_path_buf(),
                name: "passthrough".to_string(),
                payload: path.to_path_buf(),
                algorithms: vec![ChecksumAlgorithm::Sha256],
                info: BagInfo::new(),
            })
        }

        fn validate(&self, _handle: &ContainerHandle, _fast: bool) -> std::result::Result<(), PackagingError> {
            Ok(())
        }

        fn create(
            &self,
            source_root: &Path,
            _algorithms: &[ChecksumAlgorithm],
            _info: &BagInfo,
        ) -> std::result::Result<ContainerHandle, PackagingError> {
            self.open(source_root)
        }

        fn read_recorded_manifest(
            &self,
            handle: &ContainerHandle,
            algorithm: ChecksumAlgorithm,
        ) -> std::result::Result<ChecksumManifest, PackagingError> {
            ChecksumManifest::build(&[ManifestSource::rooted(&handle.payload)], algorithm, &HashOptions::default())
                .map_err(|e| PackagingError::from_engine(&handle.path, e))
        }

        fn save(
            &self,
            _handle: &mut ContainerHandle,
            _info: &BagInfo,
            _regenerate: bool,
        ) -> std::result::Result<(), PackagingError> {
            Ok(())
        }
    }

    #[test]
    fn test_create_job_checks_arity() {
        let plan = |sources: Vec<&str>| TransferPlan {
            sources: sources.into_iter().map(PathBuf::from).collect(),
            destination_root: Some(PathBuf::from("/out")),
            layout: LayoutMode::Direct,
            in_place: false,
        };

        assert!(create_job(OperationMode::Bag, plan(vec!["/a", "/b"]), JobOptions::default()).is_ok());
        assert!(create_job(OperationMode::Bag, plan(vec![]), JobOptions::default()).is_err());
        assert!(create_job(OperationMode::Unbag, plan(vec!["/a", "/b"]), JobOptions::default()).is_err());
        assert!(create_job(OperationMode::Validate, plan(vec!["/a"]), JobOptions::default()).is_ok());

        let mut no_destination = plan(vec!["/a"]);
        no_destination.destination_root = None;
        assert!(create_job(OperationMode::Unbag, no_destination.clone(), JobOptions::default()).is_err());
        assert!(create_job(OperationMode::Update, no_destination, JobOptions::default()).is_ok());

        let options = JobOptions {
            processes: 0,
            ..JobOptions::default()
        };
        assert!(matches!(
            create_job(OperationMode::Validate, plan(vec!["/a"]), options),
            Err(EngineError::Config(_))
        ));

        let job = create_job(OperationMode::Bag, plan(vec!["/a"]), JobOptions::default()).expect("job");
        assert_eq!(job.phase, Phase::Idle);
        assert!(job.paths.is_none());
    }

    #[test]
    fn test_bag_three_sources_into_target() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let base = temp_dir.path();
        write(&base.join("a").join("x.txt"), b"from a");
        write(&base.join("a").join("deep").join("y.txt"), b"from a, deeper");
        write(&base.join("b").join("file.txt"), b"single file");
        write(&base.join("c").join("z.txt"), b"from c");
        let out = base.join("out");

        let sources = vec![base.join("a"), base.join("b").join("file.txt"), base.join("c")];
        let mut job = create_job(OperationMode::Bag, to_target(sources, &out), JobOptions::default())
            .expect("Failed to create job");
        let report = run_job(&mut job, &PassThroughLibrary, None).expect("Failed to run job");

        assert!(out.join("a").join("deep").join("y.txt").is_file());
        assert!(out.join("file.txt").is_file());
        assert!(out.join("c").join("z.txt").is_file());
        assert_eq!(report.verified_entries, 4);
        assert_eq!(report.transfer.files, 4);
        assert_eq!(report.verification, Verification::Checksum);
        assert_eq!(job.phase, Phase::Done);
    }

    #[test]
    fn test_bag_creates_valid_bag() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let base = temp_dir.path();
        write(&base.join("a").join("x.txt"), b"from a");
        write(&base.join("b").join("file.txt"), b"single file");
        write(&base.join("docs").join("accession.pdf"), b"%PDF");
        let out = base.join("bag1");

        let mut info = BagInfo::new();
        info.insert("accession number".to_string(), "A2020-335".to_string());
        let options = JobOptions {
            info,
            submission_documents: vec![base.join("docs").join("accession.pdf")],
            processes: 2,
            ..JobOptions::default()
        };
        let sources = vec![base.join("a"), base.join("b").join("file.txt")];
        let mut job = create_job(OperationMode::Bag, to_target(sources, &out), options).expect("job");
        let library = BagItLibrary::new(2);
        let report = run_job(&mut job, &library, None).expect("Failed to run job");

        assert_eq!(report.destination, out);
        assert!(out.join("data").join("a").join("x.txt").is_file());
        assert!(out.join("data").join("file.txt").is_file());
        assert!(out.join("accession.pdf").is_file());
        assert_eq!(report.log.get(FIXITY_TYPE_KEY), Some("checksum validation"));

        let handle = library.open(&out).expect("open");
        library.validate(&handle, false).expect("bag is valid");
        assert_eq!(handle.info["accession number"], "A2020-335");
        assert!(handle.info.contains_key(INFO_UPDATED_KEY));
        assert!(handle.info.contains_key(metadata::SOFTWARE_AGENT_KEY));
        assert!(base.join("a").join("x.txt").is_file(), "sources are copied, not moved");
    }

    #[test]
    fn test_bag_fast_mode_skips_prehashing() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let base = temp_dir.path();
        write(&base.join("a").join("x.txt"), b"from a");
        let out = base.join("out");

        let options = JobOptions {
            fast: true,
            ..JobOptions::default()
        };
        let callback = TestProgressCallback::new();
        let mut job = create_job(OperationMode::Bag, to_target(vec![base.join("a")], &out), options)
            .expect("job");
        let report = run_job(&mut job, &BagItLibrary::default(), Some(&callback)).expect("run");

        assert_eq!(report.verification, Verification::Aggregate);
        assert_eq!(report.verified_entries, 0);
        let calls = callback.get_calls();
        assert!(!calls.contains(&"start pre-hashing".to_string()));
        assert_eq!(
            calls,
            vec![
                "start planning",
                "start copying",
                "file",
                "start post-verify",
                "start external packaging",
                "start metadata finalize",
                "start done",
                "completed",
            ]
        );
    }

    #[test]
    fn test_bag_refuses_existing_destination() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let base = temp_dir.path();
        write(&base.join("a").join("x.txt"), b"from a");
        let out = base.join("out");
        fs::create_dir(&out).expect("mkdir");

        let mut job = create_job(
            OperationMode::Bag,
            to_target(vec![base.join("a")], &out),
            JobOptions::default(),
        )
        .expect("job");
        let result = run_job(&mut job, &BagItLibrary::default(), None);

        assert!(matches!(
            result,
            Err(EngineError::Path(PathError::DestinationExists { .. }))
        ));
        assert_eq!(job.phase, Phase::Aborted);
        assert_eq!(job.aborted_in, Some(Phase::Planning));
        assert_eq!(count_files(&out), 0);
    }

    #[test]
    fn test_bag_rejects_duplicate_source_names() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let base = temp_dir.path();
        write(&base.join("one").join("same").join("x.txt"), b"1");
        write(&base.join("two").join("same").join("y.txt"), b"2");

        let sources = vec![base.join("one").join("same"), base.join("two").join("same")];
        let mut job = create_job(
            OperationMode::Bag,
            to_target(sources, &base.join("out")),
            JobOptions::default(),
        )
        .expect("job");
        let result = run_job(&mut job, &BagItLibrary::default(), None);
        assert!(matches!(result, Err(EngineError::Path(PathError::Collision { .. }))));
        assert!(!base.join("out").exists());
    }

    #[test]
    fn test_bag_in_place() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("collection");
        write(&root.join("x.txt"), b"x");
        write(&root.join("data").join("y.txt"), b"y");

        let mut job = create_job(OperationMode::Bag, in_place(&root), JobOptions::default()).expect("job");
        let library = BagItLibrary::default();
        let report = run_job(&mut job, &library, None).expect("run");

        assert_eq!(report.destination, root);
        assert_eq!(report.verified_entries, 2);
        assert!(root.join("data").join("data").join("y.txt").is_file());
        assert_eq!(report.log.get("target"), Some("in place"));
        library
            .validate(&library.open(&root).expect("open"), false)
            .expect("valid");
    }

    #[test]
    fn test_unbag_to_target() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let bag = make_bag(&temp_dir.path().join("acc1"));
        let out = temp_dir.path().join("out");
        fs::create_dir(&out).expect("mkdir");

        let mut job = create_job(
            OperationMode::Unbag,
            to_target(vec![bag.clone()], &out),
            JobOptions::default(),
        )
        .expect("job");
        let report = run_job(&mut job, &BagItLibrary::default(), None).expect("run");

        let unbagged = out.join("acc1");
        assert_eq!(report.destination, unbagged);
        assert_eq!(report.verified_entries, 3);
        assert!(unbagged.join("report.txt").is_file());
        assert!(unbagged.join("photos").join("nested").join("two.jpg").is_file());
        assert!(unbagged.join("acc1_bagfiles").join(BAGIT_TXT).is_file());
        assert!(unbagged.join("acc1_bagfiles").join(BAG_INFO_TXT).is_file());
        assert!(bag.join("data").join("report.txt").is_file(), "bag left intact");

        let log = fs::read_to_string(unbagged.join("acc1_bagfiles").join(UNBAG_LOG_NAME)).expect("log");
        let keys: Vec<&str> = log.lines().filter_map(|l| l.split(": ").next()).collect();
        assert_eq!(
            keys,
            vec![
                "bagport version",
                "OS",
                "bag name",
                "origin",
                "target",
                "unbagging began",
                "bag validated",
                "copied to target",
                "copies validated",
                "Fixity check type",
            ]
        );
    }

    #[test]
    fn test_unbag_without_bag_files() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let bag = make_bag(&temp_dir.path().join("acc1"));
        let out = temp_dir.path().join("out");
        fs::create_dir(&out).expect("mkdir");

        let options = JobOptions {
            copy_bag_files: false,
            fast: true,
            ..JobOptions::default()
        };
        let mut job = create_job(OperationMode::Unbag, to_target(vec![bag], &out), options).expect("job");
        let report = run_job(&mut job, &BagItLibrary::default(), None).expect("run");

        assert_eq!(report.verification, Verification::Aggregate);
        assert_eq!(count_files(&out.join("acc1")), 3);
        assert!(!out.join("acc1").join("acc1_bagfiles").exists());
    }

    #[test]
    fn test_unbag_archival_layout() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let bag = make_bag(&temp_dir.path().join("acc1"));
        let out = temp_dir.path().join("out");
        fs::create_dir(&out).expect("mkdir");

        let mut plan = to_target(vec![bag], &out);
        plan.layout = LayoutMode::Archival;
        let mut job = create_job(OperationMode::Unbag, plan, JobOptions::default()).expect("job");
        let report = run_job(&mut job, &BagItLibrary::default(), None).expect("run");

        let root = out.join("acc1");
        assert_eq!(report.destination, root);
        assert!(root.join("objects").join("photos").join("one.jpg").is_file());
        let checksums =
            fs::read_to_string(root.join("metadata").join("checksum.sha256")).expect("checksum file");
        assert_eq!(checksums.lines().count(), 3);
        assert!(checksums.lines().all(|l| l.contains(" ../objects/")));
        assert!(root
            .join("metadata")
            .join("submissionDocumentation")
            .join("acc1_bagfiles")
            .join(UNBAG_LOG_NAME)
            .is_file());
    }

    #[test]
    fn test_unbag_in_place_with_payload_named_data() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("acc1");
        write(&root.join("data").join("inner.txt"), b"inner");
        write(&root.join("tmp").join("scratch.txt"), b"scratch");
        write(&root.join("top.txt"), b"top");
        BagItLibrary::default()
            .create(&root, &[ChecksumAlgorithm::Md5], &BagInfo::new())
            .expect("create");
        let payload_files = count_files(&root.join("data"));

        let callback = TestProgressCallback::new();
        let mut job = create_job(OperationMode::Unbag, in_place(&root), JobOptions::default()).expect("job");
        let report = run_job(&mut job, &BagItLibrary::default(), Some(&callback)).expect("run");

        assert_eq!(report.destination, root);
        assert_eq!(report.verified_entries, payload_files);
        assert!(root.join("data").join("inner.txt").is_file());
        assert!(root.join("tmp").join("scratch.txt").is_file());
        assert!(root.join("top.txt").is_file());
        assert!(root.join("acc1_bagfiles").join(BAGIT_TXT).is_file());
        assert!(!root.join(BAGIT_TXT).exists());
        assert!(!root.join("manifest-md5.txt").exists());

        // Every payload file present exactly once, staging directories gone.
        let sidecar = root.join("acc1_bagfiles");
        assert_eq!(count_files(&root) - count_files(&sidecar), payload_files);
        let leftovers: Vec<_> = fs::read_dir(&root)
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .filter(|e| e.file_name().to_string_lossy().starts_with("tmp_"))
            .collect();
        assert!(leftovers.is_empty());

        let unbag_log = fs::read_to_string(sidecar.join(UNBAG_LOG_NAME)).expect("log");
        assert!(unbag_log.contains("target: in place"));
        assert!(callback.get_calls().contains(&"start staging".to_string()));
    }

    #[test]
    fn test_unbag_in_place_refuses_sidecar_name_collision() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = temp_dir.path().join("acc1");
        write(&root.join("acc1_bagfiles").join("x.txt"), b"x");
        BagItLibrary::default()
            .create(&root, &[ChecksumAlgorithm::Md5], &BagInfo::new())
            .expect("create");

        let mut job = create_job(OperationMode::Unbag, in_place(&root), JobOptions::default()).expect("job");
        let result = run_job(&mut job, &BagItLibrary::default(), None);

        assert!(matches!(result, Err(EngineError::Path(PathError::Collision { .. }))));
        assert_eq!(job.aborted_in, Some(Phase::Planning));
        assert!(root.join("data").join("acc1_bagfiles").join("x.txt").is_file());
    }

    #[test]
    fn test_unbag_existing_target_touches_nothing() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let bag = make_bag(&temp_dir.path().join("acc1"));
        let out = temp_dir.path().join("out");
        write(&out.join("acc1").join("keep.txt"), b"keep");

        let mut job = create_job(
            OperationMode::Unbag,
            to_target(vec![bag], &out),
            JobOptions::default(),
        )
        .expect("job");
        let result = run_job(&mut job, &BagItLibrary::default(), None);

        assert!(matches!(
            result,
            Err(EngineError::Path(PathError::DestinationExists { .. }))
        ));
        assert_eq!(count_files(&out), 1);
    }

    #[test]
    fn test_unbag_corrupt_bag_aborts_in_validation() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let bag = make_bag(&temp_dir.path().join("acc1"));
        fs::write(bag.join("data").join("report.txt"), b"ANNUAL REPORT").expect("corrupt");
        let out = temp_dir.path().join("out");
        fs::create_dir(&out).expect("mkdir");

        let mut job = create_job(
            OperationMode::Unbag,
            to_target(vec![bag], &out),
            JobOptions::default(),
        )
        .expect("job");
        let result = run_job(&mut job, &BagItLibrary::default(), None);

        assert!(matches!(result, Err(EngineError::Packaging(PackagingError::Fixity { .. }))));
        assert_eq!(job.aborted_in, Some(Phase::Validating));
        assert!(!out.join("acc1").exists());
    }

    #[test]
    fn test_validate_and_update() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let bag = make_bag(&temp_dir.path().join("acc1"));
        let plan = TransferPlan {
            sources: vec![bag.clone()],
            destination_root: None,
            layout: LayoutMode::Direct,
            in_place: false,
        };
        let library = BagItLibrary::default();

        let mut validate = create_job(OperationMode::Validate, plan.clone(), JobOptions::default())
            .expect("job");
        let report = run_job(&mut validate, &library, None).expect("valid");
        assert_eq!(report.verified_entries, 3);
        assert_eq!(report.destination, bag);

        write(&bag.join("data").join("new.txt"), b"added later");
        let mut info = BagInfo::new();
        info.insert("notes".to_string(), "re-processed".to_string());
        let options = JobOptions {
            info,
            regenerate_manifests: true,
            ..JobOptions::default()
        };
        let mut update = create_job(OperationMode::Update, plan.clone(), options).expect("job");
        run_job(&mut update, &library, None).expect("update");

        let handle = library.open(&bag).expect("open");
        assert_eq!(handle.info["notes"], "re-processed");
        assert!(handle.info.contains_key(INFO_UPDATED_KEY));
        assert!(handle.info.contains_key(MANIFESTS_UPDATED_KEY));

        let mut revalidate = create_job(OperationMode::Validate, plan, JobOptions::default()).expect("job");
        assert_eq!(run_job(&mut revalidate, &library, None).expect("valid").verified_entries, 4);
    }

    #[test]
    fn test_post_verify_failure_keeps_copies() {
        /// Corrupts the first copied file as it lands.
        struct Corrupter;
        impl ProgressCallback for Corrupter {
            fn on_file_transferred(&self, _src: &Path, dst: &Path, _bytes: u64) {
                let mut bytes = fs::read(dst).expect("read");
                bytes[0] ^= 0xff;
                fs::write(dst, bytes).expect("write");
            }
        }

        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let base = temp_dir.path();
        write(&base.join("a").join("x.txt"), b"content");
        let out = base.join("out");

        let mut job = create_job(
            OperationMode::Bag,
            to_target(vec![base.join("a")], &out),
            JobOptions::default(),
        )
        .expect("job");
        let result = run_job(&mut job, &BagItLibrary::default(), Some(&Corrupter));

        match result {
            Err(EngineError::Fixity(FixityError::DigestMismatch { path })) => assert_eq!(path, "a/x.txt"),
            other => panic!("unexpected result: {:?}", other.map(|r| r.destination)),
        }
        assert_eq!(job.aborted_in, Some(Phase::PostVerify));
        assert!(out.join("a").join("x.txt").is_file());
        assert!(!out.join(BAGIT_TXT).exists());
    }

    #[test]
    fn test_update_refuses_corrupt_bag() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let bag = make_bag(&temp_dir.path().join("acc1"));
        fs::write(bag.join("data").join("report.txt"), b"ANNUAL REPORT").expect("corrupt");
        let plan = TransferPlan {
            sources: vec![bag.clone()],
            destination_root: None,
            layout: LayoutMode::Direct,
            in_place: false,
        };
        let library = BagItLibrary::default();
        let notes = |regenerate_manifests: bool| {
            let mut info = BagInfo::new();
            info.insert("notes".to_string(), "re-processed".to_string());
            JobOptions {
                info,
                regenerate_manifests,
                ..JobOptions::default()
            }
        };

        let mut update = create_job(OperationMode::Update, plan.clone(), notes(false)).expect("job");
        let result = run_job(&mut update, &library, None);
        assert!(matches!(result, Err(EngineError::Packaging(PackagingError::Fixity { .. }))));
        assert_eq!(update.aborted_in, Some(Phase::Validating));
        let bag_info = fs::read_to_string(bag.join(BAG_INFO_TXT)).expect("bag-info");
        assert!(!bag_info.contains("re-processed"), "bag-info must be left alone");

        // Regenerating adopts the payload as it is now.
        let mut regenerate = create_job(OperationMode::Update, plan.clone(), notes(true)).expect("job");
        run_job(&mut regenerate, &library, None).expect("regenerate");
        let mut revalidate = create_job(OperationMode::Validate, plan, JobOptions::default()).expect("job");
        run_job(&mut revalidate, &library, None).expect("valid after regeneration");
    }

    #[test]
    fn test_unbag_archival_in_place() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let root = make_bag(&temp_dir.path().join("acc1"));

        let mut plan = in_place(&root);
        plan.layout = LayoutMode::Archival;
        let mut job = create_job(OperationMode::Unbag, plan, JobOptions::default()).expect("job");
        let report = run_job(&mut job, &BagItLibrary::default(), None).expect("run");

        assert_eq!(report.destination, root);
        assert_eq!(report.verified_entries, 3);
        let mut top: Vec<String> = fs::read_dir(&root)
            .expect("read_dir")
            .filter_map(|e| e.ok())
            .map(|e| e.file_name().to_string_lossy().into_owned())
            .collect();
        top.sort();
        assert_eq!(top, vec!["metadata", "objects"]);

        assert!(root.join("objects").join("report.txt").is_file());
        assert!(root.join("objects").join("photos").join("nested").join("two.jpg").is_file());
        let checksums =
            fs::read_to_string(root.join("metadata").join("checksum.sha256")).expect("checksum file");
        assert_eq!(checksums.lines().count(), 3);
        let bag_files = root
            .join("metadata")
            .join("submissionDocumentation")
            .join("acc1_bagfiles");
        assert!(bag_files.join(BAGIT_TXT).is_file());
        assert!(bag_files.join(UNBAG_LOG_NAME).is_file());
    }

    #[test]
    fn test_fast_unbag_detects_size_change() {
        /// Appends a byte to every file as it lands.
        struct Grower;
        impl ProgressCallback for Grower {
            fn on_file_transferred(&self, _src: &Path, dst: &Path, _bytes: u64) {
                let mut file = fs::OpenOptions::new().append(true).open(dst).expect("open");
                std::io::Write::write_all(&mut file, b"!").expect("append");
            }
        }

        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let bag = make_bag(&temp_dir.path().join("acc1"));
        let out = temp_dir.path().join("out");
        fs::create_dir(&out).expect("mkdir");

        let options = JobOptions {
            fast: true,
            ..JobOptions::default()
        };
        let mut job = create_job(OperationMode::Unbag, to_target(vec![bag], &out), options).expect("job");
        let result = run_job(&mut job, &BagItLibrary::default(), Some(&Grower));

        match result {
            Err(EngineError::Fixity(FixityError::AggregateMismatch { expected, actual })) => {
                assert_eq!(expected.files, 3);
                assert_eq!(actual.files, 3);
                assert_eq!(actual.bytes, expected.bytes + 3);
            }
            other => panic!("unexpected result: {:?}", other.map(|r| r.destination)),
        }
        assert_eq!(job.aborted_in, Some(Phase::PostVerify));
        assert!(out.join("acc1").join("report.txt").is_file(), "copies are kept for inspection");
    }

    #[cfg(unix)]
    #[test]
    fn test_bag_copies_what_links_point_at() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let base = temp_dir.path();
        write(&base.join("elsewhere").join("real.txt"), b"real contents");
        write(&base.join("a").join("x.txt"), b"from a");
        std::os::unix::fs::symlink(base.join("elsewhere").join("real.txt"), base.join("a").join("link.txt"))
            .expect("symlink");
        let out = base.join("bag1");

        let mut job = create_job(OperationMode::Bag, to_target(vec![base.join("a")], &out), JobOptions::default())
            .expect("job");
        let report = run_job(&mut job, &BagItLibrary::default(), None).expect("run");

        assert_eq!(report.verified_entries, 2);
        let copied = out.join("data").join("a").join("link.txt");
        assert!(!copied.symlink_metadata().expect("copied").file_type().is_symlink());
        assert_eq!(fs::read_to_string(copied).expect("read"), "real contents");
    }

    #[cfg(unix)]
    #[test]
    fn test_bag_aborts_on_link_loop() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let base = temp_dir.path();
        write(&base.join("a").join("x.txt"), b"from a");
        std::os::unix::fs::symlink(base.join("a"), base.join("a").join("again")).expect("symlink");
        let out = base.join("bag1");

        let mut job = create_job(OperationMode::Bag, to_target(vec![base.join("a")], &out), JobOptions::default())
            .expect("job");
        let result = run_job(&mut job, &BagItLibrary::default(), None);

        assert!(matches!(
            result,
            Err(EngineError::Transfer(TransferError::Enumeration { .. }))
        ));
        assert_eq!(job.aborted_in, Some(Phase::PreHashing));
        assert!(!out.exists());
    }

    #[cfg(unix)]
    #[test]
    fn test_unbag_in_place_leaves_link_targets_alone() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let outside = temp_dir.path().join("outside");
        write(&outside.join("precious.txt"), b"do not move");
        let root = temp_dir.path().join("acc1");
        write(&root.join("report.txt"), b"annual report");
        std::os::unix::fs::symlink(&outside, root.join("linked")).expect("symlink");
        let library = BagItLibrary::default();
        library
            .create(&root, &[ChecksumAlgorithm::Sha256], &BagInfo::new())
            .expect("create");

        let mut job = create_job(OperationMode::Unbag, in_place(&root), JobOptions::default()).expect("job");
        let report = run_job(&mut job, &library, None).expect("run");

        assert_eq!(report.verified_entries, 2);
        assert_eq!(report.transfer.files, 1);
        assert_eq!(
            fs::read_to_string(outside.join("precious.txt")).expect("still outside"),
            "do not move"
        );
        let link = root.join("linked");
        assert!(link.symlink_metadata().expect("link").file_type().is_symlink());
        assert!(link.join("precious.txt").is_file());
    }

    #[test]
    fn test_job_runs_only_once() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let bag = make_bag(&temp_dir.path().join("acc1"));
        let plan = TransferPlan {
            sources: vec![bag],
            destination_root: None,
            layout: LayoutMode::Direct,
            in_place: false,
        };
        let mut job = create_job(OperationMode::Validate, plan, JobOptions::default()).expect("job");
        run_job(&mut job, &BagItLibrary::default(), None).expect("first run");
        assert!(run_job(&mut job, &BagItLibrary::default(), None).is_err());
        assert_eq!(job.phase, Phase::Done);
    }
}
