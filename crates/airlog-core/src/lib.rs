//! # airlog-core
//!
//! **A room-air observatory on a single board computer.**
//!
//! `airlog-core` polls an environmental sensor (temperature, relative
//! humidity, CO2 concentration) on a fixed interval, persists every reading to
//! an append-only SQLite log, and fans each reading out to live subscribers
//! while keeping the latest values available as Prometheus gauges.
//!
//! ## Quick Start
//!
//! ```no_run
//! use airlog_core::{Pipeline, PipelineConfig, SimulatedSensor};
//!
//! # async fn demo() -> Result<(), airlog_core::PipelineError> {
//! let config = PipelineConfig::new("airlog.db");
//! let pipeline = Pipeline::start(config, Box::new(SimulatedSensor::new())).await?;
//!
//! let services = pipeline.services();
//! if let Some(latest) = services.store.latest()? {
//!     println!("{} ppm at {}", latest.co2, latest.timestamp);
//! }
//!
//! let report = pipeline.shutdown().await?;
//! println!("{} readings persisted", report.writer.written);
//! # Ok(())
//! # }
//! ```
//!
//! ## Architecture
//!
//! ```text
//!                      ┌─> MetricsExporter (gauges, overwrite)
//! Sensor ─> Poller ────┴─> PersistenceQueue ─> writer task ─> Store (SQLite)
//!                                                   │
//!                                                   └─> Broadcaster ─> LiveSubscriber × N
//! ```
//!
//! - The [`Poller`] is the only producer. A failed read skips the tick.
//! - Exactly one writer task drains the [`PersistenceQueue`] and is the only
//!   code path holding a [`StoreWriter`]. It publishes each row live once it
//!   is committed, so a new subscriber gets every row exactly once.
//! - The [`Broadcaster`] never waits on a subscriber; a subscriber whose
//!   buffer is full or whose transport has gone away is dropped from the set.

pub mod broadcast;
pub mod config;
pub mod error;
pub mod metrics;
pub mod pipeline;
pub mod poller;
pub mod queue;
pub mod reading;
pub mod sensor;
pub mod store;

pub use broadcast::{Broadcaster, LiveSubscriber, SubscriberSendError};
pub use config::PipelineConfig;
pub use error::PipelineError;
pub use metrics::{MetricsExporter, MetricsSnapshot};
pub use pipeline::{Pipeline, Services, ShutdownReport};
pub use poller::{Poller, PollerStats, TickOutcome};
pub use queue::{
    EnqueueOutcome, PersistenceQueue, QueueReceiver, WriterMessage, WriterStats, persistence_queue,
    spawn_writer,
};
pub use reading::{Reading, ReadingPayload, StoredReading};
pub use sensor::{
    InitError, ReadError, RetryPolicy, ScriptedSensor, SensorInfo, SensorSource, SimulatedSensor,
    initialize_with_retry,
};
pub use store::{Store, StoreError, StoreWriter};

/// Library version (from Cargo.toml).
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
