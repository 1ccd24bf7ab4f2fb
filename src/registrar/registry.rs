// SPDX-License-Identifier: Apache-2.0

//! In-memory registry of acknowledged offsets, owned by the registrar task.

use chrono::{DateTime, Utc};
use std::collections::HashMap;
use std::path::PathBuf;

use crate::event::{Batch, Position};
use crate::input::FileId;

/// Durable resume point for one file.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FileState {
    pub file_id: FileId,
    /// Last acknowledged byte offset
    pub offset: u64,
    /// Truncation generation the offset belongs to
    pub generation: u64,
    /// Last path the file was seen under (informational)
    pub source: PathBuf,
    /// When the registrar last changed this entry
    pub last_modified: Option<DateTime<Utc>>,
}

impl FileState {
    pub fn new(file_id: FileId, offset: u64, source: PathBuf) -> Self {
        Self {
            file_id,
            offset,
            generation: 0,
            source,
            last_modified: Some(Utc::now()),
        }
    }

    pub fn position(&self) -> Position {
        Position::new(self.generation, self.offset)
    }
}

/// Mapping FileId -> FileState with forward-only offset updates.
#[derive(Debug, Default)]
pub struct Registry {
    states: HashMap<FileId, FileState>,
    dirty: bool,
}

impl Registry {
    pub fn new(states: HashMap<FileId, FileState>) -> Self {
        Self {
            states,
            dirty: false,
        }
    }

    pub fn get(&self, file_id: &FileId) -> Option<&FileState> {
        self.states.get(file_id)
    }

    pub fn len(&self) -> usize {
        self.states.len()
    }

    pub fn is_empty(&self) -> bool {
        self.states.is_empty()
    }

    pub fn states(&self) -> &HashMap<FileId, FileState> {
        &self.states
    }

    /// Whether anything changed since the last `mark_clean`.
    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn mark_clean(&mut self) {
        self.dirty = false;
    }

    /// Advance every file in `batch` to the furthest position the batch reached.
    ///
    /// Positions compare by (generation, offset). Anything at or behind the
    /// stored position is ignored, so replaying a batch changes nothing.
    /// Returns the number of entries that moved.
    pub fn commit(&mut self, batch: &Batch) -> usize {
        let now = Utc::now();
        let mut updated = 0;

        for (file_id, (position, source)) in batch.positions() {
            match self.states.get_mut(&file_id) {
                Some(state) => {
                    if position <= state.position() {
                        continue;
                    }
                    state.generation = position.generation;
                    state.offset = position.offset;
                    state.source.clone_from(source);
                    state.last_modified = Some(now);
                }
                None => {
                    self.states.insert(
                        file_id,
                        FileState {
                            file_id,
                            offset: position.offset,
                            generation: position.generation,
                            source: source.clone(),
                            last_modified: Some(now),
                        },
                    );
                }
            }
            updated += 1;
        }

        if updated > 0 {
            self.dirty = true;
        }
        updated
    }

    /// Record a newly observed file. Existing entries are never touched.
    pub fn discover(&mut self, state: FileState) -> bool {
        if self.states.contains_key(&state.file_id) {
            return false;
        }
        self.states.insert(state.file_id, state);
        self.dirty = true;
        true
    }
}
