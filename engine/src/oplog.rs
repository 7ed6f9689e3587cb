//! Operation log: phase timestamps and environment facts, in insertion order.

use std::fs;
use std::io::{self, Write};
use std::path::Path;

use chrono::{DateTime, Local};

use crate::error::TransferError;
use crate::metadata::format_timestamp;

/// File name of the log written beside a container's tag files.
pub const UNBAG_LOG_NAME: &str = "unbag.txt";

/// Key/value record of one operation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct OperationLog {
    entries: Vec<(String, String)>,
}

impl OperationLog {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a fact. A key recorded twice keeps its first position and
    /// takes the new value.
    pub fn record(&mut self, key: impl Into<String>, value: impl Into<String>) {
        let key = key.into();
        let value = value.into();
        match self.entries.iter_mut().find(|(k, _)| *k == key) {
            Some(entry) => entry.1 = value,
            None => self.entries.push((key, value)),
        }
    }

    /// Record a timestamp in the log's time format.
    pub fn record_time(&mut self, key: impl Into<String>, time: &DateTime<Local>) {
        self.record(key, format_timestamp(time));
    }

    pub fn get(&self, key: &str) -> Option<&str> {
        self.entries
            .iter()
            .find(|(k, _)| k == key)
            .map(|(_, v)| v.as_str())
    }

    pub fn entries(&self) -> &[(String, String)] {
        &self.entries
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// One `key: value` line per entry.
    pub fn render(&self) -> String {
        let mut out = String::new();
        for (key, value) in &self.entries {
            out.push_str(key);
            out.push_str(": ");
            out.push_str(value);
            out.push('\n');
        }
        out
    }

    /// Write the log to `path`. An existing file is never rewritten.
    pub fn write_once(&self, path: &Path) -> Result<(), TransferError> {
        let mut file = fs::OpenOptions::new()
            .write(true)
            .create_new(true)
            .open(path)
            .map_err(|e| {
                if e.kind() == io::ErrorKind::AlreadyExists {
                    TransferError::AlreadyExists {
                        path: path.to_path_buf(),
                    }
                } else {
                    TransferError::Write {
                        path: path.to_path_buf(),
                        source: e,
                    }
                }
            })?;
        file.write_all(self.render().as_bytes())
            .map_err(|e| TransferError::Write {
                path: path.to_path_buf(),
                source: e,
            })
    }
}
