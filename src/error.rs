// SPDX-License-Identifier: Apache-2.0

use std::path::PathBuf;
use thiserror::Error;

#[derive(Error, Debug)]
pub enum Error {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    /// The persisted registry exists but cannot be understood. Startup must stop here.
    #[error("Registry state is corrupt: {0}")]
    StateCorrupt(String),

    #[error("Persistence error: {0}")]
    Persistence(String),

    #[error("Configuration error: {0}")]
    Config(String),

    #[error("Invalid glob pattern: {0}")]
    InvalidGlob(String),

    #[error("Failed to open {path}: {source}")]
    Open {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error("Channel closed")]
    ChannelClosed,

    #[error("Publish failed: {0}")]
    Publish(String),
}

pub type Result<T> = std::result::Result<T, Error>;
