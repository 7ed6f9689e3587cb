//! Container info fields.
//!
//! Fields come either from individual operator-supplied values or from a
//! JSON file. The JSON file may also name submission documents under the
//! `submission documentation` key; those are copied next to the container's
//! tag files and listed in the info fields as `name (file), ...`.

use std::collections::BTreeMap;
use std::fs;
use std::path::{Path, PathBuf};

use chrono::{DateTime, Local};
use serde_json::Value;

use crate::error::{EngineError, Result};
use crate::model::Verification;

/// Info fields as written to the container, keyed by label.
pub type BagInfo = BTreeMap<String, String>;

pub const SOFTWARE_AGENT_KEY: &str = "Bag-Software-Agent";
pub const FIXITY_TYPE_KEY: &str = "Fixity check type";
pub const INFO_UPDATED_KEY: &str = "Bag info last updated";
pub const MANIFESTS_UPDATED_KEY: &str = "Bag manifests last updated";
pub const SUBMISSION_DOCS_KEY: &str = "submission documentation";

/// Timestamp format used in info fields and operation logs.
pub const TIMESTAMP_FORMAT: &str = "%B %d, %Y %H:%M:%S %z";

/// Render a timestamp the way info fields and logs record it.
pub fn format_timestamp(time: &DateTime<Local>) -> String {
    time.format(TIMESTAMP_FORMAT).to_string()
}

/// Value of the `Bag-Software-Agent` field.
pub fn software_agent() -> String {
    format!("bagport v{}", env!("CARGO_PKG_VERSION"))
}

/// Operator-supplied info fields plus any submission documents.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct BagMetadata {
    pub fields: BagInfo,
    pub submission_documents: Vec<PathBuf>,
}

impl BagMetadata {
    /// Build from label/value pairs, dropping absent or empty values.
    pub fn from_fields<I, K, V>(fields: I) -> Self
    where
        I: IntoIterator<Item = (K, Option<V>)>,
        K: Into<String>,
        V: Into<String>,
    {
        let fields = fields
            .into_iter()
            .filter_map(|(key, value)| {
                let value: String = value?.into();
                if value.is_empty() {
                    None
                } else {
                    Some((key.into(), value))
                }
            })
            .collect();
        BagMetadata {
            fields,
            submission_documents: Vec::new(),
        }
    }

    /// Read fields from a JSON object file.
    pub fn from_json_file(path: &Path) -> Result<Self> {
        let text = fs::read_to_string(path).map_err(|e| EngineError::Metadata {
            path: path.to_path_buf(),
            reason: e.to_string(),
        })?;
        Self::from_json_str(&text).map_err(|reason| EngineError::Metadata {
            path: path.to_path_buf(),
            reason,
        })
    }

    /// Parse a JSON object of fields. Null and empty values are dropped;
    /// numbers and booleans are recorded as their JSON text.
    pub fn from_json_str(text: &str) -> std::result::Result<Self, String> {
        let value: Value = serde_json::from_str(text).map_err(|e| format!("JSON error: {}", e))?;
        let Value::Object(map) = value else {
            return Err("top-level JSON value must be an object".to_string());
        };

        let mut metadata = BagMetadata::default();
        for (key, value) in map {
            if key == SUBMISSION_DOCS_KEY {
                let listing = metadata.read_submission_documents(&value)?;
                if !listing.is_empty() {
                    metadata.fields.insert(key, listing);
                }
                continue;
            }
            if let Some(text) = scalar_text(&value) {
                metadata.fields.insert(key, text);
            }
        }
        Ok(metadata)
    }

    fn read_submission_documents(&mut self, value: &Value) -> std::result::Result<String, String> {
        let Value::Object(docs) = value else {
            return Err(format!("\"{}\" must map document names to paths", SUBMISSION_DOCS_KEY));
        };

        let mut listing = Vec::new();
        for (name, path) in docs {
            let Value::String(path) = path else {
                return Err(format!("submission document \"{}\" must be a path string", name));
            };
            let path = PathBuf::from(path);
            let file_name = path
                .file_name()
                .map(|n| n.to_string_lossy().into_owned())
                .unwrap_or_default();
            listing.push(format!("{} ({})", name, file_name));
            self.submission_documents.push(path);
        }
        Ok(listing.join(", "))
    }

    pub fn is_empty(&self) -> bool {
        self.fields.is_empty() && self.submission_documents.is_empty()
    }
}

fn scalar_text(value: &Value) -> Option<String> {
    match value {
        Value::Null => None,
        Value::String(s) if s.is_empty() => None,
        Value::String(s) => Some(s.clone()),
        other => Some(other.to_string()),
    }
}

/// Merge `updates` into `existing`. Same-named fields are overwritten;
/// empty values never overwrite anything.
pub fn merge_fields(existing: &mut BagInfo, updates: &BagInfo) {
    for (key, value) in updates {
        if !value.is_empty() {
            existing.insert(key.clone(), value.clone());
        }
    }
}

/// Record when info fields and manifests were last rewritten.
pub fn stamp_updates(
    info: &mut BagInfo,
    fields_given: bool,
    manifests_regenerated: bool,
    now: &DateTime<Local>,
) {
    let stamp = format_timestamp(now);
    if fields_given {
        info.insert(INFO_UPDATED_KEY.to_string(), stamp.clone());
    }
    if manifests_regenerated {
        info.insert(MANIFESTS_UPDATED_KEY.to_string(), stamp);
    }
}

/// Fields the engine always adds when creating a container.
pub fn record_provenance(info: &mut BagInfo, verification: Verification) {
    info.insert(SOFTWARE_AGENT_KEY.to_string(), software_agent());
    info.insert(FIXITY_TYPE_KEY.to_string(), verification.description().to_string());
}
