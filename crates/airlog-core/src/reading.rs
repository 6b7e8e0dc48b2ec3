//! Reading value types and their wire shape.

use chrono::{NaiveDateTime, SubsecRound, Utc};
use serde::{Deserialize, Serialize};

/// One sample from the sensor.
///
/// The poller stamps `observed_at` right after the read, so the live message
/// and the stored row carry the same time. A reading appended without one is
/// stamped by the [`Store`](crate::Store) at insert time.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    /// Degrees Celsius.
    pub temperature: f64,
    /// Relative humidity in percent.
    pub humidity: f64,
    /// CO2 concentration in ppm.
    pub co2: i64,
    /// Producer-supplied observation time (UTC), if any.
    pub observed_at: Option<NaiveDateTime>,
}

impl Reading {
    pub fn new(temperature: f64, humidity: f64, co2: i64) -> Self {
        Self {
            temperature,
            humidity,
            co2,
            observed_at: None,
        }
    }

    pub fn with_observed_at(mut self, observed_at: NaiveDateTime) -> Self {
        self.observed_at = Some(observed_at);
        self
    }

    /// Stamp with the current UTC time (whole seconds) unless already stamped.
    pub fn stamped(mut self) -> Self {
        self.observed_at
            .get_or_insert_with(|| Utc::now().naive_utc().trunc_subsecs(0));
        self
    }
}

/// A reading as committed to the store.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct StoredReading {
    /// Row id, strictly increasing in insertion order.
    pub id: i64,
    pub temperature: f64,
    pub humidity: f64,
    pub co2: i64,
    /// Observation time (UTC, second resolution).
    pub timestamp: NaiveDateTime,
}

/// JSON shape shared by `/api/latest`, `/api/history` and the live stream.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ReadingPayload {
    pub temperature: f64,
    pub humidity: f64,
    pub co2: i64,
    pub timestamp: NaiveDateTime,
}

impl ReadingPayload {
    /// Payload for a reading that has not been persisted yet.
    ///
    /// Unstamped readings take the current UTC time, truncated to whole
    /// seconds to match the store's timestamp resolution.
    pub fn from_live(reading: &Reading) -> Self {
        let timestamp = reading
            .observed_at
            .unwrap_or_else(|| Utc::now().naive_utc())
            .trunc_subsecs(0);
        Self {
            temperature: reading.temperature,
            humidity: reading.humidity,
            co2: reading.co2,
            timestamp,
        }
    }
}

impl From<&StoredReading> for ReadingPayload {
    fn from(row: &StoredReading) -> Self {
        Self {
            temperature: row.temperature,
            humidity: row.humidity,
            co2: row.co2,
            timestamp: row.timestamp,
        }
    }
}

impl From<StoredReading> for ReadingPayload {
    fn from(row: StoredReading) -> Self {
        Self::from(&row)
    }
}
