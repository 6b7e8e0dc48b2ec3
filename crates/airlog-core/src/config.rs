//! Pipeline tuning knobs.

use std::path::PathBuf;
use std::time::Duration;

use crate::sensor::RetryPolicy;

/// Upper bound on `/api/history` and the default history page size.
pub const HISTORY_LIMIT: usize = 1000;

/// Rows replayed to a new live subscriber.
pub const BACKLOG_LIMIT: usize = 100;

/// Everything needed to start a [`Pipeline`](crate::Pipeline).
#[derive(Debug, Clone)]
pub struct PipelineConfig {
    /// SQLite database file.
    pub db_path: PathBuf,
    /// Sensor polling period. Also the longest a tick waits for queue space.
    pub interval: Duration,
    /// Persistence queue capacity in readings.
    pub queue_capacity: usize,
    /// Stored rows replayed to each new live subscriber.
    pub backlog: usize,
    /// Live readings a subscriber may fall behind before it is dropped.
    pub subscriber_buffer: usize,
    /// Sensor acquisition retries at startup.
    pub init_retry: RetryPolicy,
}

impl PipelineConfig {
    pub fn new(db_path: impl Into<PathBuf>) -> Self {
        Self {
            db_path: db_path.into(),
            ..Self::default()
        }
    }

    pub fn with_interval(mut self, interval: Duration) -> Self {
        self.interval = interval;
        self
    }
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            db_path: PathBuf::from("sensor_data.db"),
            interval: Duration::from_secs(2),
            queue_capacity: 256,
            backlog: BACKLOG_LIMIT,
            subscriber_buffer: 64,
            init_retry: RetryPolicy::default(),
        }
    }
}
