// SPDX-License-Identifier: Apache-2.0

//! Wires the pipeline together and owns startup and shutdown ordering.
//!
//! Startup: load the registry (refusing to start if it is corrupt), then start
//! the registrar, publisher, spooler and finally the prospector.
//!
//! Shutdown runs in stages, each bounded by what is left of
//! `shutdown_timeout`: stop the prospector and its harvesters, let the
//! spooler flush, let the publisher finish in-flight batches, and let the
//! registrar persist one last time once every sender is gone.

use tokio::select;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;
use tower::BoxError;
use tracing::{debug, error, info, warn};

use crate::bounded_channel::bounded;
use crate::config::ShipperConfig;
use crate::event::{Batch, Event};
use crate::init::wait::{self, TaskSet, deadline_after};
use crate::prospector::{Prospector, ProspectorConfig};
use crate::publisher::{Publish, Publisher, RetryingSink, Sink};
use crate::registrar::persistence::JsonFileStore;
use crate::registrar::{self, Registrar, RegistrarConfig, RegistrarMessage};
use crate::spooler::{Spooler, SpoolerConfig};

pub struct Agent {
    config: ShipperConfig,
}

impl Agent {
    pub fn new(config: ShipperConfig) -> Self {
        Self { config }
    }

    /// Run with the sink selected by the output config.
    pub async fn run(self, agent_cancel: CancellationToken) -> Result<(), BoxError> {
        let sink = Sink::from(&self.config.output);
        self.run_with_sink(sink, agent_cancel).await
    }

    pub async fn run_with_sink<P: Publish>(
        self,
        sink: P,
        agent_cancel: CancellationToken,
    ) -> Result<(), BoxError> {
        let config = self.config;
        config.validate()?;

        info!(
            registry = ?config.registry_file,
            include = ?config.include,
            "Starting tailship."
        );

        let store = JsonFileStore::new(&config.registry_file);
        let states = registrar::load_state(&store).inspect_err(|e| {
            error!(
                path = ?store.path(),
                error = %e,
                "Refusing to start without a readable registry"
            );
        })?;

        let (event_tx, event_rx) = bounded::<Event>(config.event_channel_size);
        let (batch_tx, batch_rx) = bounded::<Batch>(config.batch_channel_size);
        let (registrar_tx, registrar_rx) =
            bounded::<RegistrarMessage>(config.registrar_channel_size);

        let prospector = Prospector::new(
            ProspectorConfig::from(&config),
            &states,
            event_tx,
            registrar_tx.clone(),
        )?;

        let mut registrar_task_set = TaskSet::new();
        let mut publisher_task_set = TaskSet::new();
        let mut spooler_task_set = TaskSet::new();
        let mut prospector_task_set = TaskSet::new();

        let publisher_cancel = CancellationToken::new();
        let spooler_cancel = CancellationToken::new();
        let prospector_cancel = CancellationToken::new();

        let registrar = Registrar::new(
            store,
            states,
            registrar_rx,
            RegistrarConfig {
                checkpoint_interval: config.checkpoint_interval,
                max_checkpoint_failure_duration: config.max_checkpoint_failure_duration,
            },
        );
        registrar_task_set.spawn(async move { registrar.run().await.map_err(|e| e.into()) });

        let publisher = Publisher::new(
            RetryingSink::new(sink, config.retry.clone(), publisher_cancel.clone()),
            batch_rx,
            registrar_tx,
        );
        publisher_task_set.spawn(async move { publisher.run().await.map_err(|e| e.into()) });

        let spooler = Spooler::new(SpoolerConfig::from(&config), event_rx, batch_tx);
        {
            let token = spooler_cancel.clone();
            spooler_task_set.spawn(async move { spooler.run(token).await.map_err(|e| e.into()) });
        }

        {
            let token = prospector_cancel.clone();
            prospector_task_set
                .spawn(async move { prospector.run(token).await.map_err(|e| e.into()) });
        }

        let mut result = Ok(());
        select! {
            _ = agent_cancel.cancelled() => {
                debug!("Agent cancellation signaled.");
            },
            e = wait::wait_for_any_task(&mut prospector_task_set) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of prospector."),
                    Err(e) => result = Err(e),
                }
            },
            e = wait::wait_for_any_task(&mut spooler_task_set) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of spooler."),
                    Err(e) => result = Err(e),
                }
            },
            e = wait::wait_for_any_task(&mut publisher_task_set) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of publisher."),
                    Err(e) => result = Err(e),
                }
            },
            e = wait::wait_for_any_task(&mut registrar_task_set) => {
                match e {
                    Ok(()) => warn!("Unexpected early exit of registrar."),
                    Err(e) => result = Err(e),
                }
            },
        }

        if let Err(e) = &result {
            error!(error = %e, "Pipeline task failed, shutting down.");
        }

        let deadline = deadline_after(config.shutdown_timeout);

        // Step one, stop discovery and every harvester. This drops all event senders.
        prospector_cancel.cancel();
        if let Err(e) = wait_until(&mut prospector_task_set, deadline).await {
            warn!(error = %e, "Prospector did not stop cleanly");
            result = result.and(Err(e));
        }

        // Step two, flush the spool. The spooler exits once the event channel is closed.
        spooler_cancel.cancel();
        if let Err(e) = wait_until(&mut spooler_task_set, deadline).await {
            warn!(error = %e, "Spooler did not stop cleanly");
            result = result.and(Err(e));
        }

        // Step three, the publisher finishes in-flight batches and exits when
        // the batch channel closes. Retries are abandoned if it overruns.
        let res = wait_until(&mut publisher_task_set, deadline).await;
        if let Err(e) = res {
            warn!(error = %e, "Publisher did not finish in time, abandoning unconfirmed batches");
            publisher_cancel.cancel();
            result = result.and(Err(e));
        }

        // Step four, the registrar persists once every sender has been dropped.
        // It always gets a moment for its final write, even after an overrun.
        let registrar_deadline = deadline.max(deadline_after(std::time::Duration::from_secs(1)));
        if let Err(e) = wait_until(&mut registrar_task_set, registrar_deadline).await {
            error!(error = %e, "Registrar failed to persist final state");
            result = result.and(Err(e));
        }

        info!("Tailship stopped.");
        result
    }
}

async fn wait_until(tasks: &mut TaskSet, deadline: Instant) -> Result<(), BoxError> {
    let remaining = deadline.saturating_duration_since(Instant::now());
    wait::wait_for_tasks_with_timeout(tasks, remaining).await
}
