//! Persistence queue and the single store writer.
//!
//! The queue is a bounded FIFO tokio channel with exactly one producer (the
//! poller) and one consumer (the writer task). The writer runs on a blocking
//! thread because SQLite commits are synchronous; it commits one reading per
//! [`StoreWriter::append`] and never retries a failed append, so a storage
//! failure can drop a reading but can never reorder the ones behind it.
//!
//! Each committed row is then published live with its id, which lets the
//! broadcaster tell it apart from rows a new subscriber got in its backlog.
//! A reading whose append failed is still published, unkeyed.
//!
//! Shutdown is an explicit [`WriterMessage::Stop`] sentinel: the writer
//! drains everything queued ahead of (and behind) it, closes its connection
//! and returns its counters.
//!
//! Full-queue policy: [`PersistenceQueue::enqueue`] waits up to the caller's
//! deadline for a free slot, then drops the reading being enqueued.

use std::time::Duration;

use log::{debug, error, info, warn};
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::SendTimeoutError;
use tokio::task::JoinHandle;

use crate::broadcast::Broadcaster;
use crate::reading::Reading;
use crate::store::StoreWriter;

/// Item carried by the persistence queue.
#[derive(Debug, Clone, PartialEq)]
pub enum WriterMessage {
    Reading(Reading),
    /// Drain what is queued, then terminate.
    Stop,
}

/// Result of offering a reading to the queue.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EnqueueOutcome {
    Queued,
    /// The queue stayed full for the whole wait; the reading was dropped.
    DroppedFull,
    /// The writer is gone; the reading was dropped.
    Closed,
}

/// Producer half of the persistence queue.
pub struct PersistenceQueue {
    tx: mpsc::Sender<WriterMessage>,
}

/// Consumer half, handed to [`spawn_writer`].
pub struct QueueReceiver {
    rx: mpsc::Receiver<WriterMessage>,
}

/// Create a queue holding at most `capacity` pending readings.
pub fn persistence_queue(capacity: usize) -> (PersistenceQueue, QueueReceiver) {
    let (tx, rx) = mpsc::channel(capacity.max(1));
    (PersistenceQueue { tx }, QueueReceiver { rx })
}

impl PersistenceQueue {
    /// Offer a reading, waiting at most `wait` for capacity.
    pub async fn enqueue(&self, reading: Reading, wait: Duration) -> EnqueueOutcome {
        match self
            .tx
            .send_timeout(WriterMessage::Reading(reading), wait)
            .await
        {
            Ok(()) => EnqueueOutcome::Queued,
            Err(SendTimeoutError::Timeout(_)) => {
                warn!(
                    "Persistence queue full for {:.1}s, dropping reading (co2={} ppm)",
                    wait.as_secs_f64(),
                    reading.co2
                );
                EnqueueOutcome::DroppedFull
            }
            Err(SendTimeoutError::Closed(_)) => {
                error!("Persistence writer has stopped, dropping reading");
                EnqueueOutcome::Closed
            }
        }
    }

    /// Readings currently waiting for the writer.
    pub fn pending(&self) -> usize {
        self.tx.max_capacity() - self.tx.capacity()
    }

    /// Send the stop sentinel. Waits for a free slot so it lands behind
    /// every reading already queued.
    pub async fn stop(self) {
        if self.tx.send(WriterMessage::Stop).await.is_err() {
            debug!("Persistence writer already gone when stop was sent");
        }
    }
}

/// Counters reported by the writer when it terminates.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct WriterStats {
    /// Readings committed.
    pub written: u64,
    /// Readings dropped because the append failed.
    pub failed: u64,
}

/// Spawn the writer on a dedicated blocking thread.
pub fn spawn_writer(
    queue: QueueReceiver,
    writer: StoreWriter,
    broadcaster: Broadcaster,
) -> JoinHandle<WriterStats> {
    tokio::task::spawn_blocking(move || run_writer(queue, writer, &broadcaster))
}

/// Drain `queue` into `writer` until the stop sentinel (or until every
/// producer is gone), then close the write connection.
pub fn run_writer(
    queue: QueueReceiver,
    mut writer: StoreWriter,
    broadcaster: &Broadcaster,
) -> WriterStats {
    let mut rx = queue.rx;
    let mut stats = WriterStats::default();

    while let Some(msg) = rx.blocking_recv() {
        match msg {
            WriterMessage::Reading(reading) => {
                commit(&mut writer, broadcaster, &reading, &mut stats)
            }
            WriterMessage::Stop => {
                rx.close();
                while let Some(msg) = rx.blocking_recv() {
                    if let WriterMessage::Reading(reading) = msg {
                        commit(&mut writer, broadcaster, &reading, &mut stats);
                    }
                }
                break;
            }
        }
    }

    if let Err(e) = writer.close() {
        error!("Closing store writer failed: {e}");
    }
    info!(
        "Persistence writer finished: {} written, {} failed",
        stats.written, stats.failed
    );
    stats
}

fn commit(
    writer: &mut StoreWriter,
    broadcaster: &Broadcaster,
    reading: &Reading,
    stats: &mut WriterStats,
) {
    let delivered = match writer.append(reading) {
        Ok(row) => {
            stats.written += 1;
            debug!("Persisted reading #{} at {}", row.id, row.timestamp);
            broadcaster.publish_stored(&row)
        }
        Err(e) => {
            stats.failed += 1;
            error!(
                "Dropping reading (temperature={:.2}, humidity={:.2}, co2={}): append failed: {e}",
                reading.temperature, reading.humidity, reading.co2
            );
            broadcaster.publish(reading)
        }
    };
    debug!("Reading delivered to {delivered} live subscribers");
}
