//! Filesystem operations module.
//!
//! This module provides low-level operations for:
//! - Lazily enumerating regular files beneath a root, with pruned exclusions
//! - Copying and moving files with metadata preservation
//! - Relocating whole subtrees (recursive) or only direct children (flat)
//!
//! Symbolic links are followed: a link to a file is treated as a regular file
//! holding the target's content and a link to a directory is descended. Link
//! loops surface as enumeration errors.

use std::fs;
use std::io;
use std::path::{Path, PathBuf};

use tracing::debug;
use walkdir::WalkDir;

use crate::error::TransferError;
use crate::model::TransferMode;
use crate::progress::ProgressCallback;

/// How much of a directory `transfer` relocates.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransferDepth {
    /// The entire subtree, recreating intermediate directories
    Recursive,
    /// Only the direct regular-file children
    Flat,
}

/// Counters returned by `transfer`.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct TransferStats {
    pub files: u64,
    pub bytes: u64,
    pub dirs_created: u64,
}

impl TransferStats {
    pub fn add(&mut self, other: TransferStats) {
        self.files += other.files;
        self.bytes += other.bytes;
        self.dirs_created += other.dirs_created;
    }
}

/// True if `path` lies at or beneath any of the excluded paths.
pub fn is_excluded(path: &Path, exclude: &[PathBuf]) -> bool {
    exclude.iter().any(|e| path.starts_with(e))
}

/// Lazily enumerate every regular file beneath `root`.
///
/// If `root` is itself a file, it is the only item yielded. Excluded
/// directories are pruned without being descended. Each call starts a fresh
/// walk, so the iterator reflects the filesystem at the time it is driven.
pub fn walk_files<'a>(
    root: &Path,
    exclude: &'a [PathBuf],
) -> impl Iterator<Item = Result<PathBuf, TransferError>> + 'a {
    WalkDir::new(root)
        .follow_links(true)
        .into_iter()
        .filter_entry(move |entry| !is_excluded(entry.path(), exclude))
        .filter_map(|entry| match entry {
            Ok(entry) if entry.file_type().is_file() => Some(Ok(entry.into_path())),
            Ok(_) => None,
            Err(e) => Some(Err(TransferError::from(e))),
        })
}

/// Copy a file from source to destination with metadata preservation.
///
/// The destination must not exist. Modification/access times and permission
/// bits are carried over where the platform supports it.
///
/// # Returns
/// Number of bytes copied
pub fn copy_file_with_metadata(src: &Path, dst: &Path) -> Result<u64, TransferError> {
    ensure_parent_dir_exists(dst)?;

    let mut src_file = fs::File::open(src).map_err(|e| TransferError::Read {
        path: src.to_path_buf(),
        source: e,
    })?;

    let src_metadata = src_file.metadata().map_err(|e| TransferError::Read {
        path: src.to_path_buf(),
        source: e,
    })?;

    let mut dst_file = fs::OpenOptions::new()
        .write(true)
        .create_new(true)
        .open(dst)
        .map_err(|e| {
            if e.kind() == io::ErrorKind::AlreadyExists {
                TransferError::AlreadyExists {
                    path: dst.to_path_buf(),
                }
            } else {
                TransferError::Write {
                    path: dst.to_path_buf(),
                    source: e,
                }
            }
        })?;

    let bytes_copied = io::copy(&mut src_file, &mut dst_file).map_err(|e| {
        if e.kind() == io::ErrorKind::PermissionDenied {
            TransferError::Write {
                path: dst.to_path_buf(),
                source: e,
            }
        } else {
            TransferError::Read {
                path: src.to_path_buf(),
                source: e,
            }
        }
    })?;

    dst_file.sync_all().map_err(|e| TransferError::Write {
        path: dst.to_path_buf(),
        source: e,
    })?;
    drop(dst_file);

    preserve_metadata(&src_metadata, dst)?;

    Ok(bytes_copied)
}

fn preserve_metadata(src_metadata: &fs::Metadata, dst: &Path) -> Result<(), TransferError> {
    fs::set_permissions(dst, src_metadata.permissions()).map_err(|e| TransferError::Write {
        path: dst.to_path_buf(),
        source: e,
    })?;

    let mtime = filetime::FileTime::from_last_modification_time(src_metadata);
    let atime = filetime::FileTime::from_last_access_time(src_metadata);
    // Some filesystems reject timestamps; the copy itself still stands.
    if let Err(e) = filetime::set_file_times(dst, atime, mtime) {
        debug!(path = %dst.display(), error = %e, "could not preserve timestamps");
    }

    Ok(())
}

/// Move a file, falling back to copy-then-delete when a rename is not
/// possible (for example across filesystems). The destination must not exist.
///
/// # Returns
/// Size of the moved file in bytes
pub fn move_file(src: &Path, dst: &Path) -> Result<u64, TransferError> {
    ensure_parent_dir_exists(dst)?;

    if dst.symlink_metadata().is_ok() {
        return Err(TransferError::AlreadyExists {
            path: dst.to_path_buf(),
        });
    }

    let size = fs::metadata(src)
        .map_err(|e| TransferError::Read {
            path: src.to_path_buf(),
            source: e,
        })?
        .len();

    match fs::rename(src, dst) {
        Ok(()) => Ok(size),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Err(TransferError::Read {
            path: src.to_path_buf(),
            source: e,
        }),
        Err(e) => {
            debug!(src = %src.display(), error = %e, "rename failed, copying instead");
            let bytes = copy_file_with_metadata(src, dst)?;
            fs::remove_file(src).map_err(|e| TransferError::Remove {
                path: src.to_path_buf(),
                source: e,
            })?;
            Ok(bytes)
        }
    }
}

/// Rename a symbolic link without touching its target.
fn move_link(src: &Path, dst: &Path) -> Result<(), TransferError> {
    ensure_parent_dir_exists(dst)?;
    if dst.symlink_metadata().is_ok() {
        return Err(TransferError::AlreadyExists {
            path: dst.to_path_buf(),
        });
    }
    debug!(src = %src.display(), dst = %dst.display(), "moving link");
    rename(src, dst)
}

/// Copy or move a single file to `dst`.
pub fn transfer_file(src: &Path, dst: &Path, mode: TransferMode) -> Result<u64, TransferError> {
    match mode {
        TransferMode::Copy => copy_file_with_metadata(src, dst),
        TransferMode::Move => move_file(src, dst),
    }
}

/// Relocate files from `src` into the directory `dest`, preserving their
/// relative structure.
///
/// Recursive mode walks the whole subtree and transfers each regular file
/// individually, so progress can be reported per file. Copies follow
/// symbolic links and copy what they point at. Moves relocate the link
/// itself and never descend into it, so nothing outside `src` is moved.
/// Flat mode transfers only the direct regular-file children of `src`. Any
/// failure aborts the transfer; files already transferred are left where
/// they are.
pub fn transfer(
    src: &Path,
    dest: &Path,
    depth: TransferDepth,
    mode: TransferMode,
    progress: Option<&dyn ProgressCallback>,
) -> Result<TransferStats, TransferError> {
    let mut stats = TransferStats::default();

    match depth {
        TransferDepth::Recursive => {
            // Enumerate up front so moves never race the directory reader.
            let entries = WalkDir::new(src)
                .follow_links(mode == TransferMode::Copy)
                .min_depth(1)
                .into_iter()
                .collect::<Result<Vec<_>, _>>()?;
            if entries.is_empty() && !src.is_dir() {
                return Err(TransferError::Enumeration {
                    path: src.to_path_buf(),
                    source: io::Error::new(io::ErrorKind::NotFound, "source is not a directory"),
                });
            }
            create_dir_all(dest)?;

            for entry in entries {
                let rel = entry.path().strip_prefix(src).map_err(|_| TransferError::Enumeration {
                    path: entry.path().to_path_buf(),
                    source: io::Error::new(io::ErrorKind::InvalidInput, "entry outside transfer root"),
                })?;
                let target = dest.join(rel);

                if entry.file_type().is_dir() {
                    if !target.is_dir() {
                        create_dir_all(&target)?;
                        stats.dirs_created += 1;
                    }
                } else if entry.file_type().is_file() {
                    let bytes = transfer_file(entry.path(), &target, mode)?;
                    record(&mut stats, entry.path(), &target, bytes, progress);
                } else if mode == TransferMode::Move && entry.path_is_symlink() {
                    move_link(entry.path(), &target)?;
                }
            }
        }
        TransferDepth::Flat => {
            let entries = fs::read_dir(src).map_err(|e| TransferError::Enumeration {
                path: src.to_path_buf(),
                source: e,
            })?;
            create_dir_all(dest)?;
            let mut files = Vec::new();
            for entry in entries {
                let entry = entry.map_err(|e| TransferError::Enumeration {
                    path: src.to_path_buf(),
                    source: e,
                })?;
                let path = entry.path();
                if path.is_file() {
                    files.push(path);
                }
            }
            files.sort();

            for path in files {
                let Some(name) = path.file_name() else { continue };
                let target = dest.join(name);
                let bytes = transfer_file(&path, &target, mode)?;
                record(&mut stats, &path, &target, bytes, progress);
            }
        }
    }

    Ok(stats)
}

fn record(
    stats: &mut TransferStats,
    src: &Path,
    dst: &Path,
    bytes: u64,
    progress: Option<&dyn ProgressCallback>,
) {
    stats.files += 1;
    stats.bytes += bytes;
    debug!(src = %src.display(), dst = %dst.display(), bytes, "transferred");
    if let Some(callback) = progress {
        callback.on_file_transferred(src, dst, bytes);
    }
}

/// Create a directory and all of its parents.
pub fn create_dir_all(path: &Path) -> Result<(), TransferError> {
    fs::create_dir_all(path).map_err(|e| TransferError::DirectoryCreation {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Create exactly one directory; fails if it already exists.
pub fn create_dir(path: &Path) -> Result<(), TransferError> {
    fs::create_dir(path).map_err(|e| TransferError::DirectoryCreation {
        path: path.to_path_buf(),
        source: e,
    })
}

/// Ensure the parent directory of a path exists, creating it if necessary.
pub fn ensure_parent_dir_exists(path: &Path) -> Result<(), TransferError> {
    let Some(parent) = path.parent() else {
        return Ok(());
    };
    if parent.as_os_str().is_empty() {
        return Ok(());
    }

    match fs::metadata(parent) {
        Ok(metadata) if metadata.is_dir() => Ok(()),
        Ok(_) => Err(TransferError::DirectoryCreation {
            path: parent.to_path_buf(),
            source: io::Error::new(
                io::ErrorKind::InvalidInput,
                "Parent path exists but is not a directory",
            ),
        }),
        Err(e) if e.kind() == io::ErrorKind::NotFound => create_dir_all(parent),
        Err(e) => Err(TransferError::DirectoryCreation {
            path: parent.to_path_buf(),
            source: e,
        }),
    }
}

/// Rename a file or directory.
pub fn rename(src: &Path, dst: &Path) -> Result<(), TransferError> {
    fs::rename(src, dst).map_err(|e| TransferError::Write {
        path: dst.to_path_buf(),
        source: e,
    })
}

/// Remove a directory tree.
pub fn remove_dir_all(path: &Path) -> Result<(), TransferError> {
    fs::remove_dir_all(path).map_err(|e| TransferError::Remove {
        path: path.to_path_buf(),
        source: e,
    })
}
