// SPDX-License-Identifier: Apache-2.0

//! JSON file-based registry persistence with atomic writes.
//!
//! The whole registry is serialized on every save and written to a temp file
//! next to the target, which is then renamed over it.

use std::collections::HashMap;
use std::fs::{self, File};
use std::io::{BufWriter, Write};
use std::path::{Path, PathBuf};

use tracing::{debug, info};

use crate::error::{Error, Result};
use crate::input::FileId;
use crate::registrar::FileState;

use super::schema::{
    PERSISTED_STATE_VERSION, PersistedFileEntryV1, PersistedStateV0, PersistedStateV1,
};
use super::store::StateStore;

/// Registry persisted as a single JSON document.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

impl StateStore for JsonFileStore {
    fn load(&self) -> Result<HashMap<FileId, FileState>> {
        let data = match fs::read(&self.path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = ?self.path, "No registry file found, starting fresh");
                return Ok(HashMap::new());
            }
            Err(e) => {
                return Err(Error::StateCorrupt(format!(
                    "failed to read registry {}: {}",
                    self.path.display(),
                    e
                )));
            }
        };

        let state = decode(&data).map_err(|e| {
            Error::StateCorrupt(format!(
                "registry {} cannot be loaded: {}. To start fresh, delete the registry file and restart.",
                self.path.display(),
                e
            ))
        })?;

        debug!(
            "Loaded {} known files from registry (v{})",
            state.files.len(),
            state.version
        );

        Ok(state
            .files
            .into_values()
            .map(|entry| {
                let file_id = FileId::new(entry.dev, entry.ino);
                (
                    file_id,
                    FileState {
                        file_id,
                        offset: entry.offset,
                        generation: entry.generation,
                        source: PathBuf::from(entry.path),
                        last_modified: entry.last_modified,
                    },
                )
            })
            .collect())
    }

    fn save(&mut self, states: &HashMap<FileId, FileState>) -> Result<()> {
        let files = states
            .values()
            .map(|state| {
                let entry = PersistedFileEntryV1 {
                    path: state.source.to_string_lossy().into_owned(),
                    dev: state.file_id.dev(),
                    ino: state.file_id.ino(),
                    offset: state.offset,
                    generation: state.generation,
                    last_modified: state.last_modified,
                };
                (entry.key(), entry)
            })
            .collect();

        let state = PersistedStateV1 {
            version: PERSISTED_STATE_VERSION,
            files,
        };

        atomic_write(&self.path, &state)
    }
}

/// Parse either schema version. Anything else is an error.
fn decode(data: &[u8]) -> std::result::Result<PersistedStateV1, String> {
    let value: serde_json::Value = serde_json::from_slice(data).map_err(|e| e.to_string())?;

    let is_versioned = value
        .as_object()
        .map(|o| o.contains_key("version"))
        .unwrap_or(false);

    if is_versioned {
        let state: PersistedStateV1 = serde_json::from_value(value).map_err(|e| e.to_string())?;
        if state.version != PERSISTED_STATE_VERSION {
            return Err(format!("unsupported registry version {}", state.version));
        }
        return Ok(state);
    }

    // V0 format (legacy) - migrate to v1
    let state_v0: PersistedStateV0 = serde_json::from_value(value).map_err(|e| e.to_string())?;

    info!(
        "Migrating {} registry entries from v0 to v1 schema",
        state_v0.len()
    );

    let mut files = HashMap::new();
    for entry in state_v0.into_values() {
        let entry = PersistedFileEntryV1::from(entry);
        let key = entry.key();
        // Several paths may have pointed at one file; keep the furthest offset
        match files.get(&key) {
            Some(PersistedFileEntryV1 { offset, .. }) if *offset >= entry.offset => {}
            _ => {
                files.insert(key, entry);
            }
        }
    }

    Ok(PersistedStateV1 {
        version: PERSISTED_STATE_VERSION,
        files,
    })
}

/// Write state to file atomically (write to temp, then rename)
fn atomic_write(path: &Path, state: &PersistedStateV1) -> Result<()> {
    use portable_atomic::{AtomicU64, Ordering};
    static COUNTER: AtomicU64 = AtomicU64::new(0);

    if let Some(parent) = path.parent() {
        if !parent.as_os_str().is_empty() && !parent.exists() {
            fs::create_dir_all(parent).map_err(|e| {
                Error::Persistence(format!("failed to create registry directory: {}", e))
            })?;
        }
    }

    let unique_id = COUNTER.fetch_add(1, Ordering::SeqCst);
    let temp_path = path.with_extension(format!("tmp.{}.{}", std::process::id(), unique_id));

    let file = File::create(&temp_path)
        .map_err(|e| Error::Persistence(format!("failed to create temp file: {}", e)))?;
    let mut writer = BufWriter::new(file);
    let written = serde_json::to_writer_pretty(&mut writer, state)
        .map_err(|e| Error::Persistence(format!("failed to write registry: {}", e)))
        .and_then(|_| {
            writer
                .flush()
                .map_err(|e| Error::Persistence(format!("failed to flush registry: {}", e)))
        })
        .and_then(|_| {
            writer
                .get_ref()
                .sync_all()
                .map_err(|e| Error::Persistence(format!("failed to sync registry: {}", e)))
        });

    drop(writer);

    if let Err(e) = written {
        let _ = fs::remove_file(&temp_path);
        return Err(e);
    }

    // Rename temp to final (atomic on most filesystems)
    if let Err(e) = fs::rename(&temp_path, path) {
        let _ = fs::remove_file(&temp_path);
        return Err(Error::Persistence(format!(
            "failed to rename registry file: {}",
            e
        )));
    }

    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use tempfile::TempDir;

    fn state(dev: u64, ino: u64, offset: u64) -> FileState {
        FileState {
            file_id: FileId::new(dev, ino),
            offset,
            generation: 0,
            source: PathBuf::from(format!("/var/log/{}.log", ino)),
            last_modified: None,
        }
    }

    #[test]
    fn test_missing_file_loads_empty() {
        let dir = TempDir::new().unwrap();
        let store = JsonFileStore::new(dir.path().join("registry.json"));
        assert!(store.load().unwrap().is_empty());
    }

    #[test]
    fn test_save_and_load() {
        let dir = TempDir::new().unwrap();
        let mut store = JsonFileStore::new(dir.path().join("nested/registry.json"));

        let mut states = HashMap::new();
        for s in [state(1, 10, 100), state(1, 20, 1 << 40)] {
            states.insert(s.file_id, s);
        }
        store.save(&states).unwrap();

        let loaded = JsonFileStore::new(store.path()).load().unwrap();
        assert_eq!(loaded, states);
    }

    #[test]
    fn test_save_leaves_no_temp_files() {
        let dir = TempDir::new().unwrap();
        let mut store = JsonFileStore::new(dir.path().join("registry.json"));
        store.save(&HashMap::new()).unwrap();
        store.save(&HashMap::new()).unwrap();

        let names: Vec<_> = fs::read_dir(dir.path())
            .unwrap()
            .map(|e| e.unwrap().file_name())
            .collect();
        assert_eq!(names, vec![std::ffi::OsString::from("registry.json")]);
    }

    #[test]
    fn test_corrupt_file_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, "{ not json").unwrap();

        let err = JsonFileStore::new(&path).load().unwrap_err();
        assert!(matches!(err, Error::StateCorrupt(_)));
    }

    #[test]
    fn test_unknown_version_is_fatal() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(&path, r#"{"version": 9, "files": {}}"#).unwrap();

        assert!(matches!(
            JsonFileStore::new(&path).load(),
            Err(Error::StateCorrupt(_))
        ));
    }

    #[test]
    fn test_legacy_registry_migrated() {
        let dir = TempDir::new().unwrap();
        let path = dir.path().join("registry.json");
        fs::write(
            &path,
            r#"{
                "/var/log/app.log": {"source": "/var/log/app.log", "offset": 120, "FileStateOS": {"inode": 55, "device": 2}},
                "/var/log/app.log.1": {"source": "/var/log/app.log.1", "offset": 300, "FileStateOS": {"inode": 54, "device": 2}}
            }"#,
        )
        .unwrap();

        let loaded = JsonFileStore::new(&path).load().unwrap();
        assert_eq!(loaded.len(), 2);
        assert_eq!(loaded[&FileId::new(2, 55)].offset, 120);
        assert_eq!(
            loaded[&FileId::new(2, 54)].source,
            PathBuf::from("/var/log/app.log.1")
        );
    }
}
