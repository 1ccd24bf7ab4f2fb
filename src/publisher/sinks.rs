// SPDX-License-Identifier: Apache-2.0

//! Built-in publish sinks. Each writes one JSON document per event per line.

use std::path::{Path, PathBuf};

use tokio::fs::OpenOptions;
use tokio::io::AsyncWriteExt;
use tower::BoxError;

use crate::config::OutputConfig;
use crate::event::{Batch, EventRecord};

use super::Publish;

/// Encode a batch as newline-delimited JSON.
pub fn encode_batch(batch: &Batch) -> Result<Vec<u8>, serde_json::Error> {
    let mut buf = Vec::with_capacity(batch.len() * 128);
    for event in batch.events() {
        serde_json::to_writer(&mut buf, &EventRecord::from(event))?;
        buf.push(b'\n');
    }
    Ok(buf)
}

pub struct StdoutSink;

impl Publish for StdoutSink {
    async fn publish(&self, batch: &Batch) -> Result<(), BoxError> {
        let buf = encode_batch(batch)?;
        let mut stdout = tokio::io::stdout();
        stdout.write_all(&buf).await?;
        stdout.flush().await?;
        Ok(())
    }
}

/// Appends to a file and syncs it before reporting success.
pub struct FileSink {
    path: PathBuf,
}

impl FileSink {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

impl Publish for FileSink {
    async fn publish(&self, batch: &Batch) -> Result<(), BoxError> {
        let buf = encode_batch(batch)?;
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await
            .map_err(|e| format!("failed to open {}: {}", self.path.display(), e))?;
        file.write_all(&buf).await?;
        file.sync_data().await?;
        Ok(())
    }
}

pub struct BlackholeSink;

impl Publish for BlackholeSink {
    async fn publish(&self, _batch: &Batch) -> Result<(), BoxError> {
        Ok(())
    }
}

/// Sink chosen at startup from [`OutputConfig`].
pub enum Sink {
    Stdout(StdoutSink),
    File(FileSink),
    Blackhole(BlackholeSink),
}

impl From<&OutputConfig> for Sink {
    fn from(config: &OutputConfig) -> Self {
        match config {
            OutputConfig::Stdout => Sink::Stdout(StdoutSink),
            OutputConfig::File { path } => Sink::File(FileSink::new(path)),
            OutputConfig::Blackhole => Sink::Blackhole(BlackholeSink),
        }
    }
}

impl Publish for Sink {
    async fn publish(&self, batch: &Batch) -> Result<(), BoxError> {
        match self {
            Sink::Stdout(s) => s.publish(batch).await,
            Sink::File(s) => s.publish(batch).await,
            Sink::Blackhole(s) => s.publish(batch).await,
        }
    }
}
