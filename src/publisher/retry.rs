// SPDX-License-Identifier: Apache-2.0

//! Retry with exponential backoff and jitter around any [`Publish`] sink.

use std::time::Duration;

use tokio::select;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::info;

use crate::event::Batch;

use super::Publish;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RetryConfig {
    pub initial_backoff: Duration,
    pub max_backoff: Duration,
    pub max_elapsed_time: Duration,
}

impl Default for RetryConfig {
    fn default() -> Self {
        Self {
            initial_backoff: Duration::from_secs(5),
            max_backoff: Duration::from_secs(30),
            max_elapsed_time: Duration::from_secs(300),
        }
    }
}

/// Wraps a sink so a batch is retried until it succeeds, the retry budget
/// runs out, or shutdown interrupts a backoff sleep. The last error is
/// returned in the latter two cases.
pub struct RetryingSink<P> {
    inner: P,
    config: RetryConfig,
    cancel: CancellationToken,
}

impl<P: Publish> RetryingSink<P> {
    pub fn new(inner: P, config: RetryConfig, cancel: CancellationToken) -> Self {
        Self {
            inner,
            config,
            cancel,
        }
    }
}

impl<P: Publish> Publish for RetryingSink<P> {
    async fn publish(&self, batch: &Batch) -> Result<(), BoxError> {
        let start = Instant::now();
        let mut current_backoff = self.config.initial_backoff;
        let mut attempts: u32 = 0;

        loop {
            let err = match self.inner.publish(batch).await {
                Ok(()) => return Ok(()),
                Err(e) => e,
            };
            attempts += 1;

            let sleep_duration = jittered(current_backoff);

            // If the sleep duration would put us over the maximum elapsed time,
            // stop retrying.
            if start.elapsed().saturating_add(sleep_duration) > self.config.max_elapsed_time {
                return Err(err);
            }

            info!(
                attempt = attempts,
                delay = ?sleep_duration,
                error = %err,
                "Publishing failed, will retry again after delay.",
            );

            select! {
                _ = tokio::time::sleep(sleep_duration) => {},
                _ = self.cancel.cancelled() => return Err(err),
            }

            current_backoff = current_backoff.saturating_mul(2).min(self.config.max_backoff);
        }
    }
}

/// Exponential backoff with jitter
fn jittered(backoff: Duration) -> Duration {
    let backoff_ms = backoff.as_millis() as i64;

    let mut v = backoff_ms / 2;
    // avoid div by zero
    if v == 0 {
        v = 1;
    }

    let jitter = (rand::random::<i64>() % v) - (v / 2);
    let mut sleep_ms = backoff_ms + jitter;
    if sleep_ms < 0 {
        sleep_ms = 1;
    }
    Duration::from_millis(sleep_ms as u64)
}
