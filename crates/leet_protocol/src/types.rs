//! Canonical identifiers and data rows shared across all crates.

use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Canonical job identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct JobId(Uuid);

impl JobId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for JobId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for JobId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

impl FromStr for JobId {
    type Err = uuid::Error;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Ok(Self(Uuid::parse_str(s.trim())?))
    }
}

/// Canonical search-request identifier.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, PartialOrd, Ord)]
#[serde(transparent)]
pub struct SearchId(Uuid);

impl SearchId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }
}

impl Default for SearchId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for SearchId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Operating system reported by a backend for a machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize, Default)]
#[serde(rename_all = "lowercase")]
pub enum OsType {
    Windows,
    Linux,
    Mac,
    #[default]
    Unknown,
}

impl OsType {
    pub fn as_str(&self) -> &'static str {
        match self {
            OsType::Windows => "windows",
            OsType::Linux => "linux",
            OsType::Mac => "mac",
            OsType::Unknown => "unknown",
        }
    }

    /// Path separator used when talking to a machine of this type.
    pub fn path_separator(&self) -> char {
        match self {
            OsType::Windows => '\\',
            _ => '/',
        }
    }
}

impl fmt::Display for OsType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// Attribute flags of a remote directory entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum FileAttribute {
    Hidden,
    System,
    Directory,
}

impl FileAttribute {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileAttribute::Hidden => "HIDDEN",
            FileAttribute::System => "SYSTEM",
            FileAttribute::Directory => "DIRECTORY",
        }
    }
}

impl fmt::Display for FileAttribute {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.as_str())
    }
}

/// One entry of a remote directory listing. All timestamps are UTC.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct DirEntry {
    pub name: String,
    pub size: u64,
    pub attributes: Vec<FileAttribute>,
    pub created: DateTime<Utc>,
    pub accessed: DateTime<Utc>,
    pub modified: DateTime<Utc>,
}

impl DirEntry {
    pub fn is_directory(&self) -> bool {
        self.attributes.contains(&FileAttribute::Directory)
    }
}

/// One entry of a remote process listing.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ProcessEntry {
    pub username: String,
    pub pid: u32,
    pub ppid: u32,
    pub start_time: DateTime<Utc>,
    pub command_line: String,
    pub path: String,
}

/// One row of plugin output. All rows of one run carry the same key set, in
/// the same order.
pub type ResultRow = serde_json::Map<String, serde_json::Value>;

/// The single-row result stored on a job that ended in error.
pub fn error_row(message: impl Into<String>) -> Vec<ResultRow> {
    let mut row = ResultRow::new();
    row.insert(
        "error_message".to_string(),
        serde_json::Value::String(message.into()),
    );
    vec![row]
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn job_id_roundtrip() {
        let id = JobId::new();
        let parsed: JobId = id.to_string().parse().unwrap();
        assert_eq!(id, parsed);
    }

    #[test]
    fn path_separator_by_os() {
        assert_eq!(OsType::Windows.path_separator(), '\\');
        assert_eq!(OsType::Linux.path_separator(), '/');
        assert_eq!(OsType::Mac.path_separator(), '/');
        assert_eq!(OsType::Unknown.path_separator(), '/');
    }

    #[test]
    fn error_row_shape() {
        let rows = error_row("boom");
        assert_eq!(rows.len(), 1);
        assert_eq!(rows[0]["error_message"], "boom");
    }
}
