// SPDX-License-Identifier: Apache-2.0

//! Bounded MPMC channels shared by every pipeline stage.
//!
//! A full channel suspends the sender; this is how backpressure travels from a
//! slow sink back to the harvesters.

use flume::{Receiver, Sender};
use std::fmt;
use tokio_util::sync::CancellationToken;

pub struct BoundedSender<T> {
    tx: Sender<T>,
}

#[derive(Debug, PartialEq, Eq)]
pub enum SendError {
    Disconnected,
    Cancelled,
}

impl fmt::Display for SendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            SendError::Disconnected => write!(f, "channel disconnected"),
            SendError::Cancelled => write!(f, "send cancelled"),
        }
    }
}

impl std::error::Error for SendError {}

impl<T> BoundedSender<T> {
    pub async fn send(&self, item: T) -> Result<(), SendError> {
        match self.tx.send_async(item).await {
            Ok(()) => Ok(()),
            Err(_e) => Err(SendError::Disconnected), // receiver closed
        }
    }

    /// Waits for capacity, but gives up as soon as `cancel` fires. The item is
    /// dropped in that case, so callers must only use this for data that is
    /// safe to lose (it will be re-read from the last committed offset).
    pub async fn send_or_cancel(
        &self,
        item: T,
        cancel: &CancellationToken,
    ) -> Result<(), SendError> {
        tokio::select! {
            biased;

            res = self.tx.send_async(item) => res.map_err(|_| SendError::Disconnected),
            _ = cancel.cancelled() => Err(SendError::Cancelled),
        }
    }
}

impl<T> Clone for BoundedSender<T> {
    fn clone(&self) -> Self {
        Self {
            tx: self.tx.clone(),
        }
    }
}

#[derive(Clone)]
pub struct BoundedReceiver<T> {
    rx: Receiver<T>,
}

impl<T> BoundedReceiver<T> {
    pub async fn next(&mut self) -> Option<T> {
        match self.rx.recv_async().await {
            Ok(item) => Some(item),
            Err(_e) => None, // disconnected
        }
    }

    /// Non-blocking receive - returns immediately.
    /// Returns None if no item is available or channel is disconnected.
    pub fn try_recv(&self) -> Option<T> {
        self.rx.try_recv().ok()
    }

    #[cfg(test)]
    pub fn len(&self) -> usize {
        self.rx.len()
    }
}

pub fn bounded<T>(size: usize) -> (BoundedSender<T>, BoundedReceiver<T>) {
    let (tx, rx) = flume::bounded::<T>(size);

    let sender = BoundedSender { tx };
    let receiver = BoundedReceiver { rx };

    (sender, receiver)
}
