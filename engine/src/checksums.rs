//! Checksum computation.
//!
//! This module provides:
//! - The fixed set of supported digest algorithms (MD5, SHA-256, SHA-512)
//! - `Digest`, one file's algorithm-tagged lowercase hex digest
//! - Streaming file hashing

use crate::error::{EngineError, TransferError};
use serde::{Deserialize, Serialize};
use std::fmt;
use std::fs::File;
use std::io::Read;
use std::path::Path;
use std::str::FromStr;

const READ_BUFFER_SIZE: usize = 64 * 1024;

/// Supported checksum algorithms
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChecksumAlgorithm {
    /// MD5 (legacy, 128-bit)
    Md5,
    /// SHA-256 (default)
    Sha256,
    /// SHA-512
    Sha512,
}

impl ChecksumAlgorithm {
    /// Every supported algorithm, strongest first.
    pub const ALL: [ChecksumAlgorithm; 3] = [Self::Sha512, Self::Sha256, Self::Md5];

    /// Lowercase name used in file names such as `manifest-sha256.txt`.
    pub fn name(&self) -> &'static str {
        match self {
            Self::Md5 => "md5",
            Self::Sha256 => "sha256",
            Self::Sha512 => "sha512",
        }
    }

    /// Length of a hex digest produced by this algorithm.
    pub fn hex_len(&self) -> usize {
        match self {
            Self::Md5 => 32,
            Self::Sha256 => 64,
            Self::Sha512 => 128,
        }
    }
}

impl Default for ChecksumAlgorithm {
    fn default() -> Self {
        Self::Sha256
    }
}

impl fmt::Display for ChecksumAlgorithm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

impl FromStr for ChecksumAlgorithm {
    type Err = EngineError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_lowercase().as_str() {
            "md5" => Ok(Self::Md5),
            "sha256" => Ok(Self::Sha256),
            "sha512" => Ok(Self::Sha512),
            other => Err(EngineError::Config(format!(
                "invalid checksum algorithm '{}' (expected md5, sha256 or sha512)",
                other
            ))),
        }
    }
}

/// A computed digest of one file's full content
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct Digest {
    algorithm: ChecksumAlgorithm,
    hex: String,
}

impl Digest {
    /// Create a digest from an already-computed hex value. The value is
    /// lowercased so recorded and computed digests compare equal.
    pub fn new(algorithm: ChecksumAlgorithm, hex: impl Into<String>) -> Self {
        Digest {
            algorithm,
            hex: hex.into().to_ascii_lowercase(),
        }
    }

    /// Get the algorithm
    pub fn algorithm(&self) -> ChecksumAlgorithm {
        self.algorithm
    }

    /// Get the hex string representation
    pub fn hex(&self) -> &str {
        &self.hex
    }
}

impl fmt::Display for Digest {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.hex)
    }
}

/// Trait for computing checksums incrementally
pub trait ChecksumHasher: Send {
    /// Update the hasher with new data
    fn update(&mut self, data: &[u8]);

    /// Finalize and return the digest
    fn finalize(self: Box<Self>) -> Digest;
}

/// MD5 hasher (backed by md5 crate)
struct Md5Hasher {
    context: md5::Context,
}

impl ChecksumHasher for Md5Hasher {
    fn update(&mut self, data: &[u8]) {
        self.context.consume(data);
    }

    fn finalize(self: Box<Self>) -> Digest {
        let digest = self.context.compute();
        Digest::new(ChecksumAlgorithm::Md5, format!("{:x}", digest))
    }
}

/// SHA-256 hasher (backed by sha2 crate)
struct Sha256Hasher {
    hasher: sha2::Sha256,
}

impl ChecksumHasher for Sha256Hasher {
    fn update(&mut self, data: &[u8]) {
        use sha2::Digest;
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> Digest {
        use sha2::Digest as _;
        let digest = self.hasher.finalize();
        Digest::new(ChecksumAlgorithm::Sha256, format!("{:x}", digest))
    }
}

/// SHA-512 hasher (backed by sha2 crate)
struct Sha512Hasher {
    hasher: sha2::Sha512,
}

impl ChecksumHasher for Sha512Hasher {
    fn update(&mut self, data: &[u8]) {
        use sha2::Digest;
        self.hasher.update(data);
    }

    fn finalize(self: Box<Self>) -> Digest {
        use sha2::Digest as _;
        let digest = self.hasher.finalize();
        Digest::new(ChecksumAlgorithm::Sha512, format!("{:x}", digest))
    }
}

/// Create a new hasher for the given algorithm
pub fn create_hasher(algorithm: ChecksumAlgorithm) -> Box<dyn ChecksumHasher> {
    match algorithm {
        ChecksumAlgorithm::Md5 => Box::new(Md5Hasher {
            context: md5::Context::new(),
        }),
        ChecksumAlgorithm::Sha256 => Box::new(Sha256Hasher {
            hasher: sha2::Sha256::default(),
        }),
        ChecksumAlgorithm::Sha512 => Box::new(Sha512Hasher {
            hasher: sha2::Sha512::default(),
        }),
    }
}

/// Digest of an in-memory buffer.
pub fn compute_bytes_checksum(data: &[u8], algorithm: ChecksumAlgorithm) -> Digest {
    let mut hasher = create_hasher(algorithm);
    hasher.update(data);
    hasher.finalize()
}

/// Compute the digest of a file's full content, streaming it in 64 KiB chunks.
pub fn compute_file_checksum(
    path: &Path,
    algorithm: ChecksumAlgorithm,
) -> Result<Digest, TransferError> {
    let read_error = |source| TransferError::Read {
        path: path.to_path_buf(),
        source,
    };

    let mut file = File::open(path).map_err(read_error)?;
    let mut hasher = create_hasher(algorithm);
    let mut buffer = vec![0u8; READ_BUFFER_SIZE];

    loop {
        match file.read(&mut buffer) {
            Ok(0) => break,
            Ok(n) => hasher.update(&buffer[..n]),
            Err(e) if e.kind() == std::io::ErrorKind::Interrupted => continue,
            Err(e) => return Err(read_error(e)),
        }
    }

    Ok(hasher.finalize())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_algorithm_display() {
        assert_eq!(ChecksumAlgorithm::Md5.to_string(), "md5");
        assert_eq!(ChecksumAlgorithm::Sha256.to_string(), "sha256");
        assert_eq!(ChecksumAlgorithm::Sha512.to_string(), "sha512");
    }

    #[test]
    fn test_algorithm_from_str() {
        assert_eq!("md5".parse::<ChecksumAlgorithm>().ok(), Some(ChecksumAlgorithm::Md5));
        assert_eq!("SHA256".parse::<ChecksumAlgorithm>().ok(), Some(ChecksumAlgorithm::Sha256));
        assert_eq!("sha512".parse::<ChecksumAlgorithm>().ok(), Some(ChecksumAlgorithm::Sha512));
        assert!("crc32".parse::<ChecksumAlgorithm>().is_err());
    }

    #[test]
    fn test_default_algorithm_is_sha256() {
        assert_eq!(ChecksumAlgorithm::default(), ChecksumAlgorithm::Sha256);
    }

    #[test]
    fn test_md5_digest() {
        let digest = compute_bytes_checksum(b"hello", ChecksumAlgorithm::Md5);
        assert_eq!(digest.algorithm(), ChecksumAlgorithm::Md5);
        assert_eq!(digest.hex(), "5d41402abc4b2a76b9719d911017c592");
    }

    #[test]
    fn test_sha256_digest() {
        let digest = compute_bytes_checksum(b"hello", ChecksumAlgorithm::Sha256);
        assert_eq!(
            digest.hex(),
            "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824"
        );
        assert_eq!(digest.hex().len(), ChecksumAlgorithm::Sha256.hex_len());
    }

    #[test]
    fn test_sha512_digest_length() {
        let digest = compute_bytes_checksum(b"hello", ChecksumAlgorithm::Sha512);
        assert_eq!(digest.hex().len(), ChecksumAlgorithm::Sha512.hex_len());
        assert!(digest.hex().starts_with("9b71d224bd62f378"));
    }

    #[test]
    fn test_digest_is_lowercased() {
        let digest = Digest::new(ChecksumAlgorithm::Md5, "ABCDEF");
        assert_eq!(digest.hex(), "abcdef");
        assert_eq!(digest.to_string(), "abcdef");
    }

    #[test]
    fn test_file_checksum_matches_bytes_checksum() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let path = temp_dir.path().join("file.bin");
        let content: Vec<u8> = (0..200_000u32).map(|i| (i % 251) as u8).collect();
        std::fs::write(&path, &content).expect("Failed to write file");

        let from_file = compute_file_checksum(&path, ChecksumAlgorithm::Sha256)
            .expect("Failed to hash file");
        let from_bytes = compute_bytes_checksum(&content, ChecksumAlgorithm::Sha256);
        assert_eq!(from_file, from_bytes);
    }

    #[test]
    fn test_file_checksum_missing_file() {
        let temp_dir = tempfile::tempdir().expect("Failed to create temp dir");
        let result = compute_file_checksum(&temp_dir.path().join("nope"), ChecksumAlgorithm::Md5);
        assert!(matches!(result, Err(TransferError::Read { .. })));
    }
}
