// SPDX-License-Identifier: Apache-2.0

//! Spooler: aggregates events from all harvesters into bounded batches.
//!
//! A batch is flushed when it holds `spool_size` events or when
//! `idle_timeout` has passed since its first event, whichever happens first.
//! Flushing waits for room downstream instead of dropping anything.

use std::time::Duration;

use tokio::select;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info};

use crate::bounded_channel::{BoundedReceiver, BoundedSender};
use crate::config::ShipperConfig;
use crate::error::{Error, Result};
use crate::event::{Batch, Event};

#[derive(Debug, Clone)]
pub struct SpoolerConfig {
    pub max_size: usize,
    pub timeout: Duration,
}

impl From<&ShipperConfig> for SpoolerConfig {
    fn from(config: &ShipperConfig) -> Self {
        Self {
            max_size: config.spool_size,
            timeout: config.idle_timeout,
        }
    }
}

/// Accumulating buffer with size and age limits.
pub(crate) struct SpoolBuffer {
    events: Vec<Event>,
    max_size: usize,
    timeout: Duration,
    first_event_at: Option<Instant>,
}

impl SpoolBuffer {
    pub(crate) fn new(max_size: usize, timeout: Duration) -> Self {
        Self {
            events: Vec::with_capacity(max_size),
            max_size,
            timeout,
            first_event_at: None,
        }
    }

    /// Append an event; returns true once the buffer is full.
    pub(crate) fn offer(&mut self, event: Event) -> bool {
        if self.events.is_empty() {
            self.first_event_at = Some(Instant::now());
        }
        self.events.push(event);
        self.events.len() >= self.max_size
    }

    pub(crate) fn take_batch(&mut self) -> Batch {
        self.first_event_at = None;
        let events = std::mem::replace(&mut self.events, Vec::with_capacity(self.max_size));
        Batch::new(events)
    }

    /// When the oldest buffered event reaches the timeout. None when empty or
    /// when the timeout lies beyond what an instant can represent.
    pub(crate) fn deadline(&self) -> Option<Instant> {
        self.first_event_at.and_then(|t| t.checked_add(self.timeout))
    }

    pub(crate) fn should_flush(&self, now: Instant) -> bool {
        self.deadline().is_some_and(|d| d <= now)
    }

    pub(crate) fn len(&self) -> usize {
        self.events.len()
    }

    pub(crate) fn is_empty(&self) -> bool {
        self.events.is_empty()
    }
}

pub struct Spooler {
    rx: BoundedReceiver<Event>,
    tx: BoundedSender<Batch>,
    buffer: SpoolBuffer,
}

impl Spooler {
    pub fn new(config: SpoolerConfig, rx: BoundedReceiver<Event>, tx: BoundedSender<Batch>) -> Self {
        Self {
            rx,
            tx,
            buffer: SpoolBuffer::new(config.max_size, config.timeout),
        }
    }

    /// Run until the event channel closes.
    ///
    /// Cancellation flushes whatever is buffered right away; events still
    /// arriving from stopping harvesters are spooled and flushed when the
    /// channel closes. The batch sender is dropped on return.
    pub async fn run(mut self, cancel: CancellationToken) -> Result<()> {
        info!("Spooler started");
        let mut cancelled = false;

        loop {
            let deadline = self.buffer.deadline();

            select! {
                biased;

                _ = cancel.cancelled(), if !cancelled => {
                    debug!(buffered = self.buffer.len(), "Spooler received shutdown signal, flushing");
                    cancelled = true;
                    self.flush().await?;
                }

                event = self.rx.next() => {
                    match event {
                        Some(event) => {
                            if self.buffer.offer(event) {
                                self.flush().await?;
                            }
                        }
                        None => {
                            debug!("Event channel closed, flushing remaining events");
                            self.flush().await?;
                            break;
                        }
                    }
                }

                _ = sleep_until(deadline), if deadline.is_some() => {
                    if self.buffer.should_flush(Instant::now()) {
                        self.flush().await?;
                    }
                }
            }
        }

        info!("Spooler stopped");
        Ok(())
    }

    async fn flush(&mut self) -> Result<()> {
        if self.buffer.is_empty() {
            return Ok(());
        }

        let batch = self.buffer.take_batch();
        debug!(batch_size = batch.len(), "Flushing spool");

        // Blocks while the publisher is busy; this is the backpressure point
        if self.tx.send(batch).await.is_err() {
            error!("Publisher channel closed, unable to flush spool");
            return Err(Error::ChannelClosed);
        }
        Ok(())
    }
}

async fn sleep_until(deadline: Option<Instant>) {
    match deadline {
        Some(d) => tokio::time::sleep_until(d).await,
        None => std::future::pending().await,
    }
}
