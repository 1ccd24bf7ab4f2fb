// SPDX-License-Identifier: Apache-2.0

//! Publisher: hands batches to the sink and acknowledges them to the registrar.
//!
//! Only a batch the sink confirmed is forwarded to the registrar, so offsets
//! never move past undelivered data. A batch the sink gives up on stops the
//! publisher with an error; nothing is dropped silently.

mod retry;
mod sinks;

use std::future::Future;

use tower::BoxError;
use tracing::{debug, error, info};

use crate::bounded_channel::{BoundedReceiver, BoundedSender};
use crate::error::{Error, Result};
use crate::event::Batch;
use crate::registrar::RegistrarMessage;

pub use retry::{RetryConfig, RetryingSink};
pub use sinks::{BlackholeSink, FileSink, Sink, StdoutSink, encode_batch};

/// Synchronous, guaranteed delivery of a batch.
///
/// Returning `Ok` means the destination has accepted every event in the batch.
pub trait Publish: Send + Sync + 'static {
    fn publish(&self, batch: &Batch) -> impl Future<Output = std::result::Result<(), BoxError>> + Send;
}

pub struct Publisher<P> {
    sink: P,
    rx: BoundedReceiver<Batch>,
    registrar: BoundedSender<RegistrarMessage>,
}

impl<P: Publish> Publisher<P> {
    pub fn new(
        sink: P,
        rx: BoundedReceiver<Batch>,
        registrar: BoundedSender<RegistrarMessage>,
    ) -> Self {
        Self {
            sink,
            rx,
            registrar,
        }
    }

    /// Publish batches until the spooler's channel closes.
    pub async fn run(mut self) -> Result<()> {
        info!("Publisher started");

        while let Some(batch) = self.rx.next().await {
            if let Err(e) = self.sink.publish(&batch).await {
                error!(
                    events = batch.len(),
                    error = %e,
                    "Batch delivery failed, offsets will not be committed. Restart required to resume."
                );
                return Err(Error::Publish(e.to_string()));
            }

            debug!(events = batch.len(), "Batch published");

            if self
                .registrar
                .send(RegistrarMessage::Ack(batch))
                .await
                .is_err()
            {
                error!("Registrar channel closed, unable to acknowledge batch");
                return Err(Error::ChannelClosed);
            }
        }

        info!("Publisher stopped");
        Ok(())
    }
}
