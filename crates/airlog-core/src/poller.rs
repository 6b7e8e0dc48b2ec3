//! The periodic producer.
//!
//! Every tick reads the sensor once. A good reading is stamped with its
//! observation time, applied to the metrics gauges and offered to the
//! persistence queue. Live subscribers get it from the writer once it is
//! committed; a reading the queue refused is published here instead. A failed
//! read is logged and the tick skipped; there is no backoff inside the loop.

use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;

use log::{debug, info, warn};
use tokio::sync::watch;
use tokio::time::MissedTickBehavior;

use crate::broadcast::Broadcaster;
use crate::metrics::MetricsExporter;
use crate::queue::{EnqueueOutcome, PersistenceQueue};
use crate::reading::Reading;
use crate::sensor::{ReadError, SensorSource};

/// What one tick did.
#[derive(Debug, Clone, PartialEq)]
pub enum TickOutcome {
    Published(Reading),
    Skipped,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PollerStats {
    pub ticks: u64,
    pub successes: u64,
    pub failures: u64,
    /// Readings that never reached the writer (queue full or closed).
    pub dropped: u64,
}

pub struct Poller {
    sensor: Arc<Mutex<Box<dyn SensorSource>>>,
    metrics: Arc<MetricsExporter>,
    queue: PersistenceQueue,
    broadcaster: Broadcaster,
    interval: Duration,
    stats: PollerStats,
}

impl Poller {
    /// `sensor` must already be initialized.
    pub fn new(
        sensor: Box<dyn SensorSource>,
        metrics: Arc<MetricsExporter>,
        queue: PersistenceQueue,
        broadcaster: Broadcaster,
        interval: Duration,
    ) -> Self {
        Self {
            sensor: Arc::new(Mutex::new(sensor)),
            metrics,
            queue,
            broadcaster,
            interval,
            stats: PollerStats::default(),
        }
    }

    pub fn stats(&self) -> PollerStats {
        self.stats
    }

    /// Run one poll cycle.
    pub async fn tick(&mut self) -> TickOutcome {
        self.stats.ticks += 1;

        let reading = match self.read_sensor().await {
            Ok(r) => r.stamped(),
            Err(e) => {
                self.stats.failures += 1;
                warn!("Sensor read failed, skipping tick: {e}");
                return TickOutcome::Skipped;
            }
        };
        self.stats.successes += 1;

        self.metrics.set(&reading);
        match self.queue.enqueue(reading, self.interval).await {
            EnqueueOutcome::Queued => {}
            EnqueueOutcome::DroppedFull | EnqueueOutcome::Closed => {
                self.stats.dropped += 1;
                let delivered = self.broadcaster.publish(&reading);
                debug!("Unpersisted reading delivered to {delivered} live subscribers");
            }
        }

        info!(
            "Temperature: {:.2}°C, Humidity: {:.2}%, CO2: {} ppm",
            reading.temperature, reading.humidity, reading.co2
        );
        TickOutcome::Published(reading)
    }

    /// Sensor reads block, so they run off the async workers.
    async fn read_sensor(&self) -> Result<Reading, ReadError> {
        let sensor = Arc::clone(&self.sensor);
        tokio::task::spawn_blocking(move || {
            sensor
                .lock()
                .unwrap_or_else(PoisonError::into_inner)
                .read()
        })
        .await
        .unwrap_or_else(|e| Err(ReadError::Unavailable(format!("sensor task failed: {e}"))))
    }

    /// Tick every interval until `shutdown` turns true or its sender is
    /// dropped. Hands the queue back so the caller can send the stop sentinel.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> (PersistenceQueue, PollerStats) {
        let mut ticker = tokio::time::interval(self.interval);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        info!(
            "Polling {} every {:.1}s",
            self.sensor_name(),
            self.interval.as_secs_f64()
        );
        while !*shutdown.borrow() {
            tokio::select! {
                biased;
                changed = shutdown.changed() => {
                    if changed.is_err() {
                        break;
                    }
                }
                _ = ticker.tick() => {
                    self.tick().await;
                }
            }
        }

        info!(
            "Poller stopped after {} ticks ({} ok, {} failed, {} dropped)",
            self.stats.ticks, self.stats.successes, self.stats.failures, self.stats.dropped
        );
        (self.queue, self.stats)
    }

    fn sensor_name(&self) -> &'static str {
        self.sensor.lock().unwrap_or_else(PoisonError::into_inner).name()
    }

    /// Give up the queue without running.
    pub fn into_queue(self) -> (PersistenceQueue, PollerStats) {
        (self.queue, self.stats)
    }
}
