// SPDX-License-Identifier: Apache-2.0

use std::collections::HashMap;

use crate::error::Result;
use crate::input::FileId;
use crate::registrar::FileState;

/// Durable backing for the registry. Only the registrar writes through it.
pub trait StateStore: Send + 'static {
    /// Read every persisted FileState. A store that has never been written
    /// returns an empty map; an unparseable one returns `Error::StateCorrupt`.
    fn load(&self) -> Result<HashMap<FileId, FileState>>;

    /// Replace the persisted state as a whole.
    fn save(&mut self, states: &HashMap<FileId, FileState>) -> Result<()>;
}

/// In-memory store for testing
#[cfg(test)]
#[derive(Default, Clone)]
pub struct MemoryStore {
    inner: std::sync::Arc<std::sync::Mutex<MemoryStoreInner>>,
}

#[cfg(test)]
#[derive(Default)]
struct MemoryStoreInner {
    states: HashMap<FileId, FileState>,
    saves: usize,
    fail_saves: bool,
}

#[cfg(test)]
impl MemoryStore {
    pub fn with_states(states: HashMap<FileId, FileState>) -> Self {
        let store = Self::default();
        store.inner.lock().unwrap().states = states;
        store
    }

    pub fn saved(&self) -> HashMap<FileId, FileState> {
        self.inner.lock().unwrap().states.clone()
    }

    pub fn save_count(&self) -> usize {
        self.inner.lock().unwrap().saves
    }

    pub fn set_fail_saves(&self, fail: bool) {
        self.inner.lock().unwrap().fail_saves = fail;
    }
}

#[cfg(test)]
impl StateStore for MemoryStore {
    fn load(&self) -> Result<HashMap<FileId, FileState>> {
        Ok(self.inner.lock().unwrap().states.clone())
    }

    fn save(&mut self, states: &HashMap<FileId, FileState>) -> Result<()> {
        let mut inner = self.inner.lock().unwrap();
        if inner.fail_saves {
            return Err(crate::error::Error::Persistence(
                "simulated save failure".to_string(),
            ));
        }
        inner.states = states.clone();
        inner.saves += 1;
        Ok(())
    }
}
