//! Built-in BagIt packaging library.
//!
//! Reads and writes bags in the BagIt 0.97 layout:
//!
//! ```text
//! <bag>/
//!   bagit.txt
//!   bag-info.txt
//!   manifest-<alg>.txt      <hex>  data/<path>
//!   tagmanifest-<alg>.txt   <hex>  <tag file>
//!   data/
//! ```
//!
//! Payload hashing reuses the engine's manifest builder, so the library
//! honours the same worker-pool size as the rest of the run.

use std::fs;
use std::path::{Component, Path, PathBuf};

use chrono::Local;
use tracing::{debug, info};
use uuid::Uuid;

use crate::checksums::{compute_file_checksum, ChecksumAlgorithm};
use crate::compare::AggregateStats;
use crate::error::TransferError;
use crate::fs_ops;
use crate::manifest::{self, ChecksumManifest, HashOptions, ManifestSource};
use crate::metadata::BagInfo;
use crate::packaging::{
    ContainerHandle, FixityDetail, FixityDetailKind, PackagingError, PackagingLibrary,
};
use crate::paths;

pub const BAGIT_VERSION: &str = "0.97";
pub const BAGIT_TXT: &str = "bagit.txt";
pub const BAG_INFO_TXT: &str = "bag-info.txt";
pub const DATA_DIR: &str = "data";
pub const PAYLOAD_OXUM_KEY: &str = "Payload-Oxum";
pub const BAGGING_DATE_KEY: &str = "Bagging-Date";

type Result<T> = std::result::Result<T, PackagingError>;

pub fn manifest_name(algorithm: ChecksumAlgorithm) -> String {
    format!("manifest-{}.txt", algorithm)
}

pub fn tagmanifest_name(algorithm: ChecksumAlgorithm) -> String {
    format!("tagmanifest-{}.txt", algorithm)
}

/// BagIt implementation of `PackagingLibrary`.
#[derive(Debug, Clone)]
pub struct BagItLibrary {
    /// Worker pool size used when hashing payload files
    pub processes: usize,
}

impl Default for BagItLibrary {
    fn default() -> Self {
        BagItLibrary { processes: 1 }
    }
}

impl BagItLibrary {
    pub fn new(processes: usize) -> Self {
        BagItLibrary { processes }
    }

    fn hash_options(&self) -> HashOptions {
        HashOptions {
            processes: self.processes,
            exclude: Vec::new(),
        }
    }

    /// Hash every payload file, with paths relative to `data/`.
    fn hash_payload(&self, root: &Path, algorithm: ChecksumAlgorithm) -> Result<ChecksumManifest> {
        ChecksumManifest::build(
            &[ManifestSource::rooted(root.join(DATA_DIR))],
            algorithm,
            &self.hash_options(),
        )
        .map_err(|e| PackagingError::from_engine(root, e))
    }

    fn write_payload_manifests(&self, root: &Path, algorithms: &[ChecksumAlgorithm]) -> Result<()> {
        for &algorithm in algorithms {
            let manifest = self.hash_payload(root, algorithm)?;
            let mut text = String::new();
            for entry in manifest.iter() {
                text.push_str(entry.digest.hex());
                text.push_str("  ");
                text.push_str(DATA_DIR);
                text.push('/');
                text.push_str(&encode_path(&entry.relative_path));
                text.push('\n');
            }
            write_tag_file(&root.join(manifest_name(algorithm)), &text)?;
            debug!(bag = %root.display(), %algorithm, entries = manifest.len(), "wrote payload manifest");
        }
        Ok(())
    }

    /// Hash every tag file (anything outside `data/` that is not itself a
    /// tag manifest) and write one tag manifest per algorithm.
    fn write_tag_manifests(&self, root: &Path, algorithms: &[ChecksumAlgorithm]) -> Result<()> {
        let exclude = vec![root.join(DATA_DIR)];
        let mut tag_files = Vec::new();
        for path in fs_ops::walk_files(root, &exclude) {
            let path = path?;
            let relative =
                manifest::relative_path(&path, root).map_err(|e| PackagingError::from_engine(root, e))?;
            if !relative.starts_with("tagmanifest-") {
                tag_files.push((relative, path));
            }
        }
        tag_files.sort();

        for &algorithm in algorithms {
            let mut text = String::new();
            for (relative, path) in &tag_files {
                let digest = compute_file_checksum(path, algorithm)?;
                text.push_str(digest.hex());
                text.push_str("  ");
                text.push_str(&encode_path(relative));
                text.push('\n');
            }
            write_tag_file(&root.join(tagmanifest_name(algorithm)), &text)?;
        }
        Ok(())
    }

    fn check_oxum(&self, handle: &ContainerHandle, required: bool) -> Result<()> {
        let Some(oxum) = handle.info.get(PAYLOAD_OXUM_KEY) else {
            if required {
                return Err(PackagingError::invalid(
                    &handle.path,
                    "fast validation requires a Payload-Oxum field in bag-info.txt",
                ));
            }
            return Ok(());
        };

        let expected = parse_oxum(oxum).ok_or_else(|| {
            PackagingError::invalid(&handle.path, format!("malformed Payload-Oxum: {}", oxum))
        })?;
        let actual = AggregateStats::collect(&handle.path.join(DATA_DIR), &[])
            .map_err(|e| PackagingError::from_engine(&handle.path, e))?;

        if expected != actual {
            return Err(PackagingError::invalid(
                &handle.path,
                format!(
                    "Payload-Oxum validation failed. Expected {} files and {} bytes, but found {} files and {} bytes",
                    expected.files, expected.bytes, actual.files, actual.bytes
                ),
            ));
        }
        Ok(())
    }

    fn check_payload(&self, handle: &ContainerHandle, details: &mut Vec<FixityDetail>) -> Result<()> {
        for &algorithm in &handle.algorithms {
            let recorded = self.read_recorded_manifest(handle, algorithm)?;
            let actual = self.hash_payload(&handle.path, algorithm)?;

            for entry in recorded.iter() {
                let path = format!("{}/{}", DATA_DIR, entry.relative_path);
                match actual.get(&entry.relative_path) {
                    None => push_unique(details, FixityDetailKind::FileMissing, path),
                    Some(found) if found.digest.hex() != entry.digest.hex() => {
                        push_unique(details, FixityDetailKind::ChecksumMismatch, path)
                    }
                    Some(_) => {}
                }
            }
            for entry in actual.iter() {
                if recorded.get(&entry.relative_path).is_none() {
                    let path = format!("{}/{}", DATA_DIR, entry.relative_path);
                    push_unique(details, FixityDetailKind::UnexpectedFile, path);
                }
            }
        }
        Ok(())
    }

    fn check_tags(&self, handle: &ContainerHandle, details: &mut Vec<FixityDetail>) -> Result<()> {
        for algorithm in ChecksumAlgorithm::ALL {
            let path = handle.path.join(tagmanifest_name(algorithm));
            if !path.is_file() {
                continue;
            }
            let recorded = ChecksumManifest::from_recorded(algorithm, "", read_manifest_lines(&path)?)
                .map_err(|e| PackagingError::from_engine(&path, e))?;

            for entry in recorded.iter() {
                let file = safe_join(&handle.path, &entry.relative_path)?;
                if !file.is_file() {
                    push_unique(details, FixityDetailKind::FileMissing, entry.relative_path.clone());
                    continue;
                }
                let digest = compute_file_checksum(&file, algorithm)?;
                if digest.hex() != entry.digest.hex() {
                    push_unique(details, FixityDetailKind::ChecksumMismatch, entry.relative_path.clone());
                }
            }
        }
        Ok(())
    }
}

impl PackagingLibrary for BagItLibrary {
    fn open(&self, path: &Path) -> Result<ContainerHandle> {
        if !path.is_dir() {
            return Err(PackagingError::invalid(path, "not a directory"));
        }

        let declaration = path.join(BAGIT_TXT);
        let text = fs::read_to_string(&declaration).map_err(|_| {
            PackagingError::invalid(path, format!("missing or unreadable {}", BAGIT_TXT))
        })?;
        if !text.lines().any(|l| l.starts_with("BagIt-Version:")) {
            return Err(PackagingError::invalid(path, "bagit.txt has no BagIt-Version"));
        }

        if !path.join(DATA_DIR).is_dir() {
            return Err(PackagingError::invalid(path, "missing data directory"));
        }

        let algorithms: Vec<ChecksumAlgorithm> = ChecksumAlgorithm::ALL
            .into_iter()
            .filter(|alg| path.join(manifest_name(*alg)).is_file())
            .collect();
        if algorithms.is_empty() {
            return Err(PackagingError::invalid(
                path,
                "no payload manifest of a supported algorithm",
            ));
        }

        let info_path = path.join(BAG_INFO_TXT);
        let info = if info_path.is_file() {
            let text = fs::read_to_string(&info_path).map_err(|e| TransferError::Read {
                path: info_path.clone(),
                source: e,
            })?;
            parse_bag_info(&text).map_err(|reason| PackagingError::invalid(&info_path, reason))?
        } else {
            BagInfo::new()
        };

        let name = paths::base_name(path).map_err(|e| PackagingError::from_engine(path, e))?;

        Ok(ContainerHandle {
            path: path.to_path_buf(),
            name,
            payload: path.join(DATA_DIR),
            algorithms,
            info,
        })
    }

    fn validate(&self, handle: &ContainerHandle, fast: bool) -> Result<()> {
        self.check_oxum(handle, fast)?;
        if fast {
            return Ok(());
        }

        let mut details = Vec::new();
        self.check_payload(handle, &mut details)?;
        self.check_tags(handle, &mut details)?;

        if !details.is_empty() {
            return Err(PackagingError::Fixity { details });
        }
        info!(bag = %handle.path.display(), "bag is valid");
        Ok(())
    }

    fn create(
        &self,
        source_root: &Path,
        algorithms: &[ChecksumAlgorithm],
        info: &BagInfo,
    ) -> Result<ContainerHandle> {
        if !source_root.is_dir() {
            return Err(PackagingError::invalid(source_root, "bag directory does not exist"));
        }
        if algorithms.is_empty() {
            return Err(PackagingError::invalid(source_root, "no checksum algorithm given"));
        }

        // Gather the current contents under a unique name, then make it data/.
        let staging = source_root.join(format!("tmp_{}", Uuid::new_v4().simple()));
        let entries = fs::read_dir(source_root).map_err(|e| TransferError::Enumeration {
            path: source_root.to_path_buf(),
            source: e,
        })?;
        let mut names = Vec::new();
        for entry in entries {
            let entry = entry.map_err(|e| TransferError::Enumeration {
                path: source_root.to_path_buf(),
                source: e,
            })?;
            names.push(entry.file_name());
        }

        fs_ops::create_dir(&staging)?;
        for name in names {
            fs_ops::rename(&source_root.join(&name), &staging.join(&name))?;
        }
        fs_ops::rename(&staging, &source_root.join(DATA_DIR))?;

        write_tag_file(
            &source_root.join(BAGIT_TXT),
            &format!(
                "BagIt-Version: {}\nTag-File-Character-Encoding: UTF-8\n",
                BAGIT_VERSION
            ),
        )?;

        self.write_payload_manifests(source_root, algorithms)?;

        let mut fields = info.clone();
        fields
            .entry(BAGGING_DATE_KEY.to_string())
            .or_insert_with(|| Local::now().format("%Y-%m-%d").to_string());
        fields.insert(PAYLOAD_OXUM_KEY.to_string(), payload_oxum(source_root)?);
        write_tag_file(&source_root.join(BAG_INFO_TXT), &render_bag_info(&fields))?;

        self.write_tag_manifests(source_root, algorithms)?;
        info!(bag = %source_root.display(), "created bag");

        self.open(source_root)
    }

    fn read_recorded_manifest(
        &self,
        handle: &ContainerHandle,
        algorithm: ChecksumAlgorithm,
    ) -> Result<ChecksumManifest> {
        let path = handle.path.join(manifest_name(algorithm));
        let lines = read_manifest_lines(&path)?;
        let prefix = format!("{}/", DATA_DIR);
        ChecksumManifest::from_recorded(algorithm, &prefix, lines)
            .map_err(|e| PackagingError::from_engine(&path, e))
    }

    fn save(&self, handle: &mut ContainerHandle, info: &BagInfo, regenerate_manifests: bool) -> Result<()> {
        let root = handle.path.clone();
        let mut fields = info.clone();

        if regenerate_manifests {
            self.write_payload_manifests(&root, &handle.algorithms)?;
            fields.insert(PAYLOAD_OXUM_KEY.to_string(), payload_oxum(&root)?);
        }
        write_tag_file(&root.join(BAG_INFO_TXT), &render_bag_info(&fields))?;

        let mut tag_algorithms: Vec<ChecksumAlgorithm> = ChecksumAlgorithm::ALL
            .into_iter()
            .filter(|alg| root.join(tagmanifest_name(*alg)).is_file())
            .collect();
        if tag_algorithms.is_empty() {
            tag_algorithms = handle.algorithms.clone();
        }
        self.write_tag_manifests(&root, &tag_algorithms)?;

        handle.info = fields;
        info!(bag = %root.display(), regenerate_manifests, "saved bag");
        Ok(())
    }
}

fn push_unique(details: &mut Vec<FixityDetail>, kind: FixityDetailKind, path: String) {
    let detail = FixityDetail::new(kind, path);
    if !details.contains(&detail) {
        details.push(detail);
    }
}

fn payload_oxum(root: &Path) -> Result<String> {
    let stats = AggregateStats::collect(&root.join(DATA_DIR), &[])
        .map_err(|e| PackagingError::from_engine(root, e))?;
    Ok(format!("{}.{}", stats.bytes, stats.files))
}

/// Parse `<bytes>.<count>`.
fn parse_oxum(value: &str) -> Option<AggregateStats> {
    let (bytes, files) = value.trim().split_once('.')?;
    Some(AggregateStats {
        files: files.parse().ok()?,
        bytes: bytes.parse().ok()?,
    })
}

fn encode_path(path: &str) -> String {
    path.replace('%', "%25")
        .replace('\n', "%0A")
        .replace('\r', "%0D")
}

/// Join a recorded relative path onto the bag root, refusing anything that
/// would escape it.
fn safe_join(root: &Path, relative: &str) -> Result<PathBuf> {
    let candidate = Path::new(relative);
    if candidate
        .components()
        .any(|c| !matches!(c, Component::Normal(_) | Component::CurDir))
    {
        return Err(PackagingError::invalid(
            root,
            format!("manifest entry escapes the bag: {}", relative),
        ));
    }
    Ok(root.join(candidate))
}

/// `(path, hex)` pairs from a manifest file, still percent-encoded.
fn read_manifest_lines(path: &Path) -> Result<Vec<(String, String)>> {
    let text = fs::read_to_string(path).map_err(|e| TransferError::Read {
        path: path.to_path_buf(),
        source: e,
    })?;

    let mut entries = Vec::new();
    for (number, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        let parsed = line
            .split_once(char::is_whitespace)
            .map(|(hex, rest)| (hex, rest.trim_start()))
            .filter(|(hex, rest)| !hex.is_empty() && !rest.is_empty());
        let Some((hex, relative)) = parsed else {
            return Err(PackagingError::invalid(
                path,
                format!("malformed manifest line {}", number + 1),
            ));
        };
        entries.push((relative.to_string(), hex.to_string()));
    }
    Ok(entries)
}

/// Parse `Key: Value` lines; indented lines continue the previous value.
pub fn parse_bag_info(text: &str) -> std::result::Result<BagInfo, String> {
    let mut info = BagInfo::new();
    let mut current: Option<String> = None;

    for (number, line) in text.lines().enumerate() {
        let line = line.trim_end_matches('\r');
        if line.trim().is_empty() {
            continue;
        }
        if line.starts_with(' ') || line.starts_with('\t') {
            let value = current.as_ref().and_then(|key| info.get_mut(key));
            let Some(value) = value else {
                return Err(format!("continuation without a field on line {}", number + 1));
            };
            value.push('\n');
            value.push_str(line.trim());
            continue;
        }
        let Some((key, value)) = line.split_once(':') else {
            return Err(format!("malformed line {}", number + 1));
        };
        let key = key.trim().to_string();
        info.insert(key.clone(), value.trim().to_string());
        current = Some(key);
    }
    Ok(info)
}

pub fn render_bag_info(info: &BagInfo) -> String {
    let mut out = String::new();
    for (key, value) in info {
        out.push_str(key);
        out.push_str(": ");
        out.push_str(&value.replace('\n', "\n  "));
        out.push('\n');
    }
    out
}

fn write_tag_file(path: &Path, contents: &str) -> Result<()> {
    fs::write(path, contents).map_err(|e| {
        PackagingError::Transfer(TransferError::Write {
            path: path.to_path_buf(),
            source: e,
        })
    })
}
