// SPDX-License-Identifier: Apache-2.0

//! Registry persistence.
//!
//! Uses JSON file storage with atomic writes for reliable offset tracking.

mod json_file;
mod schema;
mod store;

pub use json_file::JsonFileStore;
pub use schema::{
    PERSISTED_STATE_VERSION, PersistedFileEntryV1, PersistedFileStateV0, PersistedStateV0,
    PersistedStateV1, file_id_to_key,
};
#[cfg(test)]
pub use store::MemoryStore;
pub use store::StateStore;
