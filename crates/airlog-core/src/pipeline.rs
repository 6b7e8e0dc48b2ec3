//! Wiring of the producer, the writer and the fan-out, plus ordered shutdown.

use std::sync::Arc;

use log::{error, info};
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::broadcast::Broadcaster;
use crate::config::PipelineConfig;
use crate::error::PipelineError;
use crate::metrics::MetricsExporter;
use crate::poller::{Poller, PollerStats};
use crate::queue::{PersistenceQueue, WriterStats, persistence_queue, spawn_writer};
use crate::sensor::{SensorSource, initialize_with_retry};
use crate::store::Store;

/// Read-side handles shared with the query and live-stream surfaces.
#[derive(Clone)]
pub struct Services {
    pub store: Arc<Store>,
    pub metrics: Arc<MetricsExporter>,
    pub broadcaster: Broadcaster,
}

/// Final counters from both background tasks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct ShutdownReport {
    pub poller: PollerStats,
    pub writer: WriterStats,
}

/// A running collector: one poller task and one writer task.
pub struct Pipeline {
    services: Services,
    stop_tx: watch::Sender<bool>,
    poller: JoinHandle<(PersistenceQueue, PollerStats)>,
    writer: JoinHandle<WriterStats>,
}

impl Pipeline {
    /// Open the store, acquire the sensor (with retries) and start polling.
    ///
    /// Fails without spawning anything if the database cannot be opened or
    /// the sensor never comes up.
    pub async fn start(
        config: PipelineConfig,
        sensor: Box<dyn SensorSource>,
    ) -> Result<Self, PipelineError> {
        let store = Arc::new(Store::open_initialized(&config.db_path)?);
        info!("Database ready at {}", store.path().display());

        let retry = config.init_retry;
        let sensor = tokio::task::spawn_blocking(move || {
            let mut sensor = sensor;
            initialize_with_retry(&mut sensor, &retry).map(|()| sensor)
        })
        .await??;

        let metrics = Arc::new(MetricsExporter::new()?);
        let broadcaster =
            Broadcaster::new(Arc::clone(&store), config.backlog, config.subscriber_buffer);

        let (queue, rx) = persistence_queue(config.queue_capacity);
        let writer = spawn_writer(rx, store.writer()?, broadcaster.clone());

        let poller = Poller::new(
            sensor,
            Arc::clone(&metrics),
            queue,
            broadcaster.clone(),
            config.interval,
        );
        let (stop_tx, stop_rx) = watch::channel(false);
        let poller = tokio::spawn(poller.run(stop_rx));

        Ok(Self {
            services: Services {
                store,
                metrics,
                broadcaster,
            },
            stop_tx,
            poller,
            writer,
        })
    }

    pub fn services(&self) -> Services {
        self.services.clone()
    }

    /// Stop the poller, disconnect live subscribers, then drain the queue
    /// through the writer and wait for it to close its connection.
    pub async fn shutdown(self) -> Result<ShutdownReport, PipelineError> {
        info!("Shutting down pipeline");
        let _ = self.stop_tx.send(true);
        join_tasks(self.poller, self.writer, &self.services.broadcaster).await
    }
}

/// Await the poller, then the writer. The writer is awaited even when the
/// poller failed: its queue sender is gone with the poller task, so it drains
/// and closes on its own.
async fn join_tasks(
    poller: JoinHandle<(PersistenceQueue, PollerStats)>,
    writer: JoinHandle<WriterStats>,
    broadcaster: &Broadcaster,
) -> Result<ShutdownReport, PipelineError> {
    let polled = poller.await;
    broadcaster.close_all();

    let poller = match polled {
        Ok((queue, stats)) => {
            queue.stop().await;
            Ok(stats)
        }
        Err(e) => {
            error!("Poller task failed: {e}");
            Err(e)
        }
    };
    let writer = writer.await?;

    Ok(ShutdownReport {
        poller: poller?,
        writer,
    })
}
