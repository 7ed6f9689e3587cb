//! Destination layout planning.
//!
//! `plan` is a pure function: it resolves every path an operation will
//! create or consume without touching the filesystem. Collision checks
//! against what actually exists are done by the orchestrator.

use std::path::{Path, PathBuf};

use chrono::{DateTime, TimeZone};
use uuid::Uuid;

use crate::error::{EngineError, PathError, Result};
use crate::model::{LayoutMode, OperationMode};

/// Payload directory of the archival layout.
pub const OBJECTS_DIR: &str = "objects";
/// Metadata directory of the archival layout.
pub const METADATA_DIR: &str = "metadata";
/// Submission documentation directory beneath the metadata directory.
pub const SUBMISSION_DOCS_DIR: &str = "submissionDocumentation";
/// Suffix of the sidecar directory receiving a container's tag files.
pub const BAG_FILES_SUFFIX: &str = "_bagfiles";

/// Resolved absolute paths for one operation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct PathSet {
    /// Container root being read (unbag/validate/update) or written (bag)
    pub container: PathBuf,
    /// Where payload files end up
    pub payload: PathBuf,
    /// Top-level directory of the archival layout
    pub parent: Option<PathBuf>,
    /// Archival metadata directory
    pub archival_metadata: Option<PathBuf>,
    /// Archival submission documentation directory
    pub submission_docs: Option<PathBuf>,
    /// Sidecar receiving the container's tag files (unbag only)
    pub bag_files: Option<PathBuf>,
    /// In-place staging directory for the payload subtree
    pub staging_payload: Option<PathBuf>,
    /// In-place staging directory for the container's tag files
    pub staging_tags: Option<PathBuf>,
}

impl PathSet {
    /// Every staging directory, for use as an exclusion list.
    pub fn staging_dirs(&self) -> Vec<PathBuf> {
        self.staging_payload
            .iter()
            .chain(self.staging_tags.iter())
            .cloned()
            .collect()
    }

    /// Directories the operation creates, outermost first.
    pub fn directories_to_create(&self, in_place: bool) -> Vec<PathBuf> {
        let mut dirs = Vec::new();
        match &self.parent {
            Some(parent) => {
                if !in_place {
                    dirs.push(parent.clone());
                }
                dirs.push(self.payload.clone());
                dirs.extend(self.archival_metadata.iter().cloned());
                dirs.extend(self.submission_docs.iter().cloned());
            }
            None => {
                if !in_place {
                    dirs.push(self.payload.clone());
                }
            }
        }
        dirs
    }
}

/// Time-derived, randomly suffixed name for in-place staging directories,
/// e.g. `tmp_14h03m22s_1a2b3c4d`.
pub fn staging_tag<Tz: TimeZone>(now: &DateTime<Tz>, token: Uuid) -> String
where
    Tz::Offset: std::fmt::Display,
{
    let simple = token.simple().to_string();
    format!("tmp_{}_{}", now.format("%Hh%Mm%Ss"), &simple[..8])
}

/// Name of the tag-file staging directory paired with a payload staging tag.
pub fn staging_tags_name(tag: &str) -> String {
    format!("{}_tags", tag)
}

/// Sidecar directory name for a container.
pub fn bag_files_name(bag_name: &str) -> String {
    format!("{}{}", bag_name, BAG_FILES_SUFFIX)
}

/// Final path component of a container or source root.
pub fn base_name(path: &Path) -> Result<String> {
    path.file_name()
        .and_then(|n| n.to_str())
        .map(str::to_string)
        .ok_or_else(|| {
            EngineError::Path(PathError::InvalidPath {
                path: path.to_path_buf(),
                reason: "path has no valid UTF-8 final component".to_string(),
            })
        })
}

/// Resolve the layout of one operation.
///
/// - Bag: the container is the destination root (or the source in place)
///   and doubles as the payload target.
/// - Unbag, direct layout: payload lands in `<dest>/<bagName>` (or the
///   container root in place) with the `<bagName>_bagfiles` sidecar beside it.
/// - Unbag, archival layout: `<root>/objects` receives the payload,
///   `<root>/metadata/submissionDocumentation/<bagName>_bagfiles` the sidecar.
/// - Validate/Update: only the container is resolved.
///
/// In place, `staging_tag` names two disjoint staging directories inside the
/// container root.
pub fn plan(
    mode: OperationMode,
    layout: LayoutMode,
    in_place: bool,
    source_root: &Path,
    destination_root: Option<&Path>,
    staging_tag: &str,
) -> Result<PathSet> {
    let destination = |what: &str| -> Result<&Path> {
        destination_root.ok_or_else(|| {
            EngineError::Config(format!("{} to a target requires a destination", what))
        })
    };

    let mut set = PathSet {
        container: source_root.to_path_buf(),
        payload: source_root.to_path_buf(),
        parent: None,
        archival_metadata: None,
        submission_docs: None,
        bag_files: None,
        staging_payload: None,
        staging_tags: None,
    };

    match mode {
        OperationMode::Validate | OperationMode::Update => {}
        OperationMode::Bag => {
            if !in_place {
                let dest = destination("bagging")?.to_path_buf();
                set.container = dest.clone();
                set.payload = dest;
            }
        }
        OperationMode::Unbag => {
            let bag_name = base_name(source_root)?;
            let root = if in_place {
                source_root.to_path_buf()
            } else {
                destination("unbagging")?.join(&bag_name)
            };

            match layout {
                LayoutMode::Archival => {
                    let metadata = root.join(METADATA_DIR);
                    let submission = metadata.join(SUBMISSION_DOCS_DIR);
                    set.payload = root.join(OBJECTS_DIR);
                    set.bag_files = Some(submission.join(bag_files_name(&bag_name)));
                    set.archival_metadata = Some(metadata);
                    set.submission_docs = Some(submission);
                    set.parent = Some(root);
                }
                LayoutMode::Direct => {
                    set.bag_files = Some(root.join(bag_files_name(&bag_name)));
                    set.payload = root;
                }
            }

            if in_place {
                set.staging_payload = Some(source_root.join(staging_tag));
                set.staging_tags = Some(source_root.join(staging_tags_name(staging_tag)));
            }
        }
    }

    Ok(set)
}
