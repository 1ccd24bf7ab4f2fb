// SPDX-License-Identifier: Apache-2.0

//! Registrar task: the only writer of the registry.
//!
//! Acknowledged batches and discovery notices arrive over one channel and are
//! applied in order. State is persisted after each acknowledged batch, on a
//! periodic checkpoint when something changed, and once more when the channel
//! closes.

use std::collections::HashMap;
use std::time::{Duration, Instant};

use tokio::select;
use tokio::time::MissedTickBehavior;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::BoundedReceiver;
use crate::error::Result;
use crate::event::Batch;
use crate::input::FileId;

use super::persistence::StateStore;
use super::registry::{FileState, Registry};

/// Messages accepted by the registrar
#[derive(Debug)]
pub enum RegistrarMessage {
    /// The prospector saw this file for the first time
    Discovered(FileState),
    /// The sink confirmed delivery of this batch
    Ack(Batch),
}

/// Configuration for the registrar
#[derive(Debug, Clone)]
pub struct RegistrarConfig {
    /// Interval between periodic checkpoints
    pub checkpoint_interval: Duration,
    /// Maximum duration of consecutive checkpoint failures before returning error
    pub max_checkpoint_failure_duration: Duration,
}

impl Default for RegistrarConfig {
    fn default() -> Self {
        Self {
            checkpoint_interval: Duration::from_secs(1),
            max_checkpoint_failure_duration: Duration::from_secs(60),
        }
    }
}

/// Read the persisted registry at startup.
///
/// A corrupt registry is returned as `Error::StateCorrupt`; callers must not
/// start harvesting in that case.
pub fn load_state<S: StateStore>(store: &S) -> Result<HashMap<FileId, FileState>> {
    let states = store.load()?;
    info!(files = states.len(), "Loaded registry state");
    Ok(states)
}

pub struct Registrar<S: StateStore> {
    registry: Registry,
    store: S,
    rx: BoundedReceiver<RegistrarMessage>,
    config: RegistrarConfig,
    /// Tracks when checkpoint failures started (for threshold-based exit)
    checkpoint_first_failure: Option<Instant>,
}

impl<S: StateStore> Registrar<S> {
    pub fn new(
        store: S,
        states: HashMap<FileId, FileState>,
        rx: BoundedReceiver<RegistrarMessage>,
        config: RegistrarConfig,
    ) -> Self {
        Self {
            registry: Registry::new(states),
            store,
            rx,
            config,
            checkpoint_first_failure: None,
        }
    }

    /// Run until every sender has been dropped, then persist a final time.
    ///
    /// Returns an error if persisting keeps failing beyond the configured
    /// threshold, or if the final persist fails.
    pub async fn run(mut self) -> Result<()> {
        info!("Registrar started");

        let mut checkpoint_interval = tokio::time::interval(self.config.checkpoint_interval);
        checkpoint_interval.set_missed_tick_behavior(MissedTickBehavior::Delay);

        let mut fatal_error = None;

        loop {
            select! {
                biased;

                _ = checkpoint_interval.tick() => {
                    if !self.registry.is_dirty() {
                        continue;
                    }
                    if let Err(e) = self.maybe_checkpoint() {
                        error!("Checkpoint failures persisted beyond threshold, exiting: {}", e);
                        fatal_error = Some(e);
                        break;
                    }
                }

                msg = self.rx.next() => {
                    match msg {
                        Some(msg) => {
                            if let Err(e) = self.handle(msg) {
                                error!("Checkpoint failures persisted beyond threshold, exiting: {}", e);
                                fatal_error = Some(e);
                                break;
                            }
                        }
                        None => {
                            debug!("Registrar channel closed, exiting run loop");
                            break;
                        }
                    }
                }
            }
        }

        let final_result = self.checkpoint();
        match &final_result {
            Ok(()) => info!(
                files = self.registry.len(),
                "Final registry checkpoint completed"
            ),
            Err(e) => error!("Failed to perform final checkpoint: {}", e),
        }

        match fatal_error {
            Some(e) => Err(e),
            None => final_result,
        }
    }

    fn handle(&mut self, msg: RegistrarMessage) -> Result<()> {
        match msg {
            RegistrarMessage::Discovered(state) => {
                let file_id = state.file_id;
                if self.registry.discover(state) {
                    debug!(file_id = %file_id, "Registered new file");
                }
                Ok(())
            }
            RegistrarMessage::Ack(batch) => {
                let updated = self.registry.commit(&batch);
                debug!(
                    events = batch.len(),
                    files = updated,
                    "Committed acknowledged batch"
                );
                if updated == 0 {
                    return Ok(());
                }
                self.maybe_checkpoint()
            }
        }
    }

    /// Conditionally checkpoint and track failures.
    /// Returns Err only when failure duration threshold is breached.
    fn maybe_checkpoint(&mut self) -> Result<()> {
        match self.checkpoint() {
            Ok(()) => {
                if self.checkpoint_first_failure.is_some() {
                    debug!("Checkpoint succeeded after previous failures");
                    self.checkpoint_first_failure = None;
                }
                Ok(())
            }
            Err(e) => {
                let first_failure = *self
                    .checkpoint_first_failure
                    .get_or_insert_with(Instant::now);

                let failure_duration = first_failure.elapsed();

                if failure_duration >= self.config.max_checkpoint_failure_duration {
                    Err(e)
                } else {
                    warn!(
                        "Checkpoint failed (failures started {:?} ago): {}",
                        failure_duration, e
                    );
                    Ok(())
                }
            }
        }
    }

    /// Persist the whole registry. The dirty flag survives a failure so the
    /// next tick retries.
    fn checkpoint(&mut self) -> Result<()> {
        self.store.save(self.registry.states())?;
        self.registry.mark_clean();
        debug!("Checkpoint completed with {} files", self.registry.len());
        Ok(())
    }
}
