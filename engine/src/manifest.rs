//! Checksum manifests.
//!
//! A `ChecksumManifest` is a sorted list of (relative path, digest) entries.
//! Relative paths use forward slashes and are taken relative to a declared
//! prefix, so manifests of two different absolute trees compare directly.
//! Manifests are either computed by walking the filesystem or built from
//! entries a container already recorded; both go through the same
//! normalization and sort.

use std::fs;
use std::path::{Component, Path, PathBuf};

use rayon::prelude::*;
use tracing::debug;

use crate::checksums::{compute_file_checksum, ChecksumAlgorithm, Digest};
use crate::error::{EngineError, PathError, Result, TransferError};
use crate::fs_ops;

/// Prefix written in front of every path in the archival checksum file.
pub const ARCHIVAL_OBJECTS_PREFIX: &str = "../objects/";

/// One file in a manifest.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ManifestEntry {
    pub relative_path: String,
    pub digest: Digest,
}

/// A tree root to hash and the prefix its relative paths are taken from.
#[derive(Debug, Clone)]
pub struct ManifestSource {
    pub root: PathBuf,
    pub prefix: PathBuf,
}

impl ManifestSource {
    pub fn new(root: impl Into<PathBuf>, prefix: impl Into<PathBuf>) -> Self {
        ManifestSource {
            root: root.into(),
            prefix: prefix.into(),
        }
    }

    /// Paths relative to the root itself.
    pub fn rooted(root: impl Into<PathBuf>) -> Self {
        let root = root.into();
        ManifestSource {
            prefix: root.clone(),
            root,
        }
    }
}

/// Options for building a manifest from the filesystem.
#[derive(Debug, Clone)]
pub struct HashOptions {
    /// Worker pool size; 1 hashes sequentially on the calling thread
    pub processes: usize,
    /// Absolute paths skipped during enumeration
    pub exclude: Vec<PathBuf>,
}

impl Default for HashOptions {
    fn default() -> Self {
        HashOptions {
            processes: 1,
            exclude: Vec::new(),
        }
    }
}

/// Sorted, duplicate-free list of manifest entries. Immutable once built.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChecksumManifest {
    algorithm: ChecksumAlgorithm,
    entries: Vec<ManifestEntry>,
}

impl ChecksumManifest {
    /// Hash every file beneath each source root.
    ///
    /// Files are enumerated first, then hashed independently on a bounded
    /// worker pool. Results come back in no particular order and only gain
    /// one through the final sort.
    pub fn build(
        sources: &[ManifestSource],
        algorithm: ChecksumAlgorithm,
        options: &HashOptions,
    ) -> Result<Self> {
        if options.processes == 0 {
            return Err(EngineError::Config(
                "parallelism degree must be at least 1".to_string(),
            ));
        }

        let mut files = Vec::new();
        for source in sources {
            for path in fs_ops::walk_files(&source.root, &options.exclude) {
                let path = path?;
                let relative = relative_path(&path, &source.prefix)?;
                files.push((relative, path));
            }
        }
        debug!(files = files.len(), %algorithm, processes = options.processes, "hashing files");

        let hash = |(relative, path): &(String, PathBuf)| -> std::result::Result<(String, Digest), TransferError> {
            let digest = compute_file_checksum(path, algorithm)?;
            Ok((relative.clone(), digest))
        };

        let hashed: Vec<(String, Digest)> = if options.processes == 1 {
            files.iter().map(hash).collect::<std::result::Result<_, _>>()?
        } else {
            let pool = rayon::ThreadPoolBuilder::new()
                .num_threads(options.processes)
                .build()
                .map_err(|e| pool_error(options.processes, e))?;
            pool.install(|| {
                files
                    .par_iter()
                    .map(hash)
                    .collect::<std::result::Result<Vec<_>, _>>()
            })?
        };

        Self::from_digests(algorithm, hashed)
    }

    /// Build a manifest from entries a container recorded, e.g. the lines of
    /// a payload manifest. `prefix` (such as `data/`) is stripped from every
    /// path; entries outside it are ignored.
    pub fn from_recorded<I>(algorithm: ChecksumAlgorithm, prefix: &str, entries: I) -> Result<Self>
    where
        I: IntoIterator<Item = (String, String)>,
    {
        let mut digests = Vec::new();
        for (path, hex) in entries {
            let path = normalize_recorded_path(&path);
            if let Some(reason) = unsafe_recorded_path(&path) {
                return Err(PathError::InvalidPath {
                    path: PathBuf::from(&path),
                    reason: reason.to_string(),
                }
                .into());
            }
            let Some(relative) = path.strip_prefix(prefix) else {
                continue;
            };
            digests.push((relative.to_string(), Digest::new(algorithm, hex)));
        }
        Self::from_digests(algorithm, digests)
    }

    /// Sort unordered (path, digest) pairs into a manifest, rejecting
    /// duplicate paths.
    pub fn from_digests(algorithm: ChecksumAlgorithm, digests: Vec<(String, Digest)>) -> Result<Self> {
        let mut entries: Vec<ManifestEntry> = digests
            .into_iter()
            .map(|(relative_path, digest)| ManifestEntry {
                relative_path,
                digest,
            })
            .collect();
        entries.sort_by(|a, b| a.relative_path.cmp(&b.relative_path));

        if let Some(pair) = entries
            .windows(2)
            .find(|pair| pair[0].relative_path == pair[1].relative_path)
        {
            return Err(PathError::DuplicateEntry {
                path: pair[0].relative_path.clone(),
            }
            .into());
        }

        Ok(ChecksumManifest { algorithm, entries })
    }

    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    pub fn entries(&self) -> &[ManifestEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    pub fn iter(&self) -> std::slice::Iter<'_, ManifestEntry> {
        self.entries.iter()
    }

    /// Look up one entry by relative path.
    pub fn get(&self, relative_path: &str) -> Option<&ManifestEntry> {
        self.entries
            .binary_search_by(|e| e.relative_path.as_str().cmp(relative_path))
            .ok()
            .map(|i| &self.entries[i])
    }

    /// Render in the archival checksum convention: one `<hex> ../objects/<path>`
    /// line per entry.
    pub fn render_archival(&self) -> String {
        let mut out = String::new();
        for entry in &self.entries {
            out.push_str(entry.digest.hex());
            out.push(' ');
            out.push_str(ARCHIVAL_OBJECTS_PREFIX);
            out.push_str(&entry.relative_path);
            out.push('\n');
        }
        out
    }

    /// Write `checksum.<alg>` into `dir`.
    pub fn write_archival(&self, dir: &Path) -> Result<PathBuf> {
        let path = dir.join(format!("checksum.{}", self.algorithm));
        fs::write(&path, self.render_archival()).map_err(|e| TransferError::Write {
            path: path.clone(),
            source: e,
        })?;
        Ok(path)
    }
}

/// Relative path of `path` beneath `prefix`, joined with forward slashes.
pub fn relative_path(path: &Path, prefix: &Path) -> Result<String> {
    let rel = path.strip_prefix(prefix).map_err(|_| PathError::InvalidPath {
        path: path.to_path_buf(),
        reason: format!("not beneath {}", prefix.display()),
    })?;

    let mut parts = Vec::new();
    for component in rel.components() {
        match component {
            Component::Normal(part) => {
                let part = part.to_str().ok_or_else(|| PathError::InvalidPath {
                    path: path.to_path_buf(),
                    reason: "file name is not valid UTF-8".to_string(),
                })?;
                parts.push(part);
            }
            Component::CurDir => {}
            _ => {
                return Err(PathError::InvalidPath {
                    path: path.to_path_buf(),
                    reason: "unexpected path component".to_string(),
                }
                .into())
            }
        }
    }

    if parts.is_empty() {
        return Err(PathError::InvalidPath {
            path: path.to_path_buf(),
            reason: "path equals its prefix".to_string(),
        }
        .into());
    }

    Ok(parts.join("/"))
}

fn pool_error(processes: usize, err: rayon::ThreadPoolBuildError) -> EngineError {
    EngineError::Config(format!(
        "failed to create hashing pool with {} workers: {}",
        processes, err
    ))
}

/// Recorded paths are relative, `/`-separated and never climb out of the
/// container.
fn unsafe_recorded_path(path: &str) -> Option<&'static str> {
    if path.contains('\\') {
        return Some("backslash in recorded path");
    }
    if path.starts_with('/') {
        return Some("absolute recorded path");
    }
    if path.split('/').any(|segment| segment.is_empty() || segment == "..") {
        return Some("recorded path escapes the container");
    }
    None
}

fn normalize_recorded_path(path: &str) -> String {
    let decoded = path
        .replace("%0A", "\n")
        .replace("%0a", "\n")
        .replace("%0D", "\r")
        .replace("%0d", "\r")
        .replace("%25", "%");
    decoded.trim_start_matches("./").to_string()
}
