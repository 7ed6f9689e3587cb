//! Manifest comparison.
//!
//! `compare` proves two manifests identical entry by entry. `fast_compare`
//! only checks file count and total byte size; it is a necessary but not a
//! sufficient condition for equal content, and callers choosing it trade
//! assurance for speed.

use std::fs;
use std::path::{Path, PathBuf};

use serde::Serialize;

use crate::error::{FixityError, Result, TransferError};
use crate::fs_ops;
use crate::manifest::ChecksumManifest;

/// File count and total size of a tree.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub struct AggregateStats {
    pub files: u64,
    pub bytes: u64,
}

impl AggregateStats {
    /// Count every regular file beneath `root` (or `root` itself if it is a
    /// file), skipping excluded paths.
    pub fn collect(root: &Path, exclude: &[PathBuf]) -> Result<Self> {
        let mut stats = AggregateStats::default();
        for path in fs_ops::walk_files(root, exclude) {
            let path = path?;
            let metadata = fs::metadata(&path).map_err(|e| TransferError::Read {
                path: path.clone(),
                source: e,
            })?;
            stats.files += 1;
            stats.bytes += metadata.len();
        }
        Ok(stats)
    }

    /// Fail with `AggregateMismatch` unless `actual` equals `self`.
    pub fn ensure_matches(&self, actual: &AggregateStats) -> std::result::Result<(), FixityError> {
        if self != actual {
            return Err(FixityError::AggregateMismatch {
                expected: *self,
                actual: *actual,
            });
        }
        Ok(())
    }
}

/// Prove that `actual` holds exactly the entries of `expected`.
///
/// Cardinality is checked first. Otherwise both sorted sequences are walked
/// pairwise and the first differing path or digest is reported.
pub fn compare(
    expected: &ChecksumManifest,
    actual: &ChecksumManifest,
) -> std::result::Result<(), FixityError> {
    if expected.len() != actual.len() {
        return Err(FixityError::CountMismatch {
            expected: expected.len(),
            actual: actual.len(),
        });
    }

    if expected.algorithm() != actual.algorithm() {
        return Err(FixityError::AlgorithmMismatch {
            expected: expected.algorithm().to_string(),
            actual: actual.algorithm().to_string(),
        });
    }

    for (want, got) in expected.iter().zip(actual.iter()) {
        if want.relative_path != got.relative_path {
            return Err(FixityError::PathMismatch {
                expected: want.relative_path.clone(),
                actual: got.relative_path.clone(),
            });
        }
        if want.digest.hex() != got.digest.hex() {
            return Err(FixityError::DigestMismatch {
                path: want.relative_path.clone(),
            });
        }
    }

    Ok(())
}

/// Compare only aggregate file count and byte size of two trees.
///
/// Exclusions apply to `root_b` only, where staging directories live.
pub fn fast_compare(root_a: &Path, root_b: &Path, exclude: &[PathBuf]) -> Result<AggregateStats> {
    let expected = AggregateStats::collect(root_a, &[])?;
    let actual = AggregateStats::collect(root_b, exclude)?;
    expected.ensure_matches(&actual)?;
    Ok(actual)
}
