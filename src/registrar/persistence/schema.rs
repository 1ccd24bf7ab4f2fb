// SPDX-License-Identifier: Apache-2.0

//! Persistence schema definitions for the registry file.
//!
//! Currently supports:
//! - v0: Legacy path-keyed format (no version field)
//! - v1: Identity-keyed format with a version field

use std::collections::HashMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

/// Current schema version for persisted state
pub const PERSISTED_STATE_VERSION: u8 = 1;

/// Legacy persisted state (v0): a map from file path to its state.
pub type PersistedStateV0 = HashMap<String, PersistedFileStateV0>;

/// Legacy persisted state for a single file (v0)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedFileStateV0 {
    pub source: String,
    pub offset: u64,
    #[serde(rename = "FileStateOS")]
    pub file_state_os: PersistedFileStateOsV0,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedFileStateOsV0 {
    pub inode: u64,
    pub device: u64,
}

/// Persisted state for all known files (v1)
/// Key is "dev:ino" for efficient lookup
#[derive(Debug, Serialize, Deserialize)]
pub struct PersistedStateV1 {
    /// Schema version (always 1 for this format)
    pub version: u8,
    /// Map from file key (dev:ino) to file entry
    pub files: HashMap<String, PersistedFileEntryV1>,
}

impl Default for PersistedStateV1 {
    fn default() -> Self {
        Self {
            version: PERSISTED_STATE_VERSION,
            files: HashMap::new(),
        }
    }
}

/// Persisted state for a single file (v1)
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct PersistedFileEntryV1 {
    /// Last known path to the file
    pub path: String,

    pub dev: u64,
    pub ino: u64,

    /// Acknowledged offset (byte position in file)
    pub offset: u64,
    /// Truncation generation the offset belongs to
    #[serde(default)]
    pub generation: u64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub last_modified: Option<DateTime<Utc>>,
}

impl PersistedFileEntryV1 {
    /// Generate the map key for this entry ("dev:ino" format)
    pub fn key(&self) -> String {
        file_id_to_key(self.dev, self.ino)
    }
}

impl From<PersistedFileStateV0> for PersistedFileEntryV1 {
    fn from(v0: PersistedFileStateV0) -> Self {
        Self {
            path: v0.source,
            dev: v0.file_state_os.device,
            ino: v0.file_state_os.inode,
            offset: v0.offset,
            generation: 0,
            last_modified: None,
        }
    }
}

/// Generate a map key from dev and ino ("dev:ino" format)
pub fn file_id_to_key(dev: u64, ino: u64) -> String {
    format!("{}:{}", dev, ino)
}
