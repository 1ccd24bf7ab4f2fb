// SPDX-License-Identifier: Apache-2.0

//! Platform-independent file identity.
//!
//! On Unix this is the device ID + inode number, which stays stable across
//! renames and lets a rotated file be followed under its new name.

use serde::{Deserialize, Serialize};
use std::fs::Metadata;
use std::io;
use std::path::Path;

/// A stable identifier for "the same underlying file", independent of path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
pub struct FileId {
    /// Device ID (Unix) or creation time in nanoseconds (other platforms)
    dev: u64,
    /// Inode number (Unix) or a hash of the discovery path (other platforms)
    ino: u64,
}

impl FileId {
    /// Create a FileId from raw device and inode values.
    /// Used for loading persisted state.
    pub fn new(dev: u64, ino: u64) -> Self {
        Self { dev, ino }
    }

    /// Build the identity from already-fetched metadata.
    #[cfg(unix)]
    pub fn from_metadata(metadata: &Metadata, _path: &Path) -> Self {
        use std::os::unix::fs::MetadataExt;

        Self {
            dev: metadata.dev(),
            ino: metadata.ino(),
        }
    }

    /// Best-effort identity for platforms without inode semantics: creation
    /// time plus the path the file was found under. A file renamed on such a
    /// platform is treated as a new file and re-read from the start.
    #[cfg(not(unix))]
    pub fn from_metadata(metadata: &Metadata, path: &Path) -> Self {
        use std::collections::hash_map::DefaultHasher;
        use std::hash::{Hash, Hasher};
        use std::time::UNIX_EPOCH;

        let created = metadata
            .created()
            .ok()
            .and_then(|t| t.duration_since(UNIX_EPOCH).ok())
            .map(|d| d.as_nanos() as u64)
            .unwrap_or_default();

        let mut hasher = DefaultHasher::new();
        path.hash(&mut hasher);

        Self {
            dev: created,
            ino: hasher.finish(),
        }
    }

    /// Get the device ID.
    pub fn dev(&self) -> u64 {
        self.dev
    }

    /// Get the inode number.
    pub fn ino(&self) -> u64 {
        self.ino
    }
}

impl std::fmt::Display for FileId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}:{}", self.dev, self.ino)
    }
}

/// Resolve the identity of whatever currently lives at `path`.
///
/// Returns `Ok(None)` when nothing exists there; other stat failures are
/// returned as errors.
pub fn identity(path: &Path) -> io::Result<Option<FileId>> {
    match std::fs::metadata(path) {
        Ok(metadata) => Ok(Some(FileId::from_metadata(&metadata, path))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

/// Async variant of [`identity`] for use inside harvester tasks.
pub async fn identity_async(path: &Path) -> io::Result<Option<FileId>> {
    match tokio::fs::metadata(path).await {
        Ok(metadata) => Ok(Some(FileId::from_metadata(&metadata, path))),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}
