//! Sensor source trait, error taxonomy and startup retry.
//!
//! Every sensor implements [`SensorSource`]: a one-time [`initialize`] that
//! may fail fatally, and a steady-state [`read`] whose failures are transient.
//! [`initialize_with_retry`] wraps acquisition in a bounded fixed-delay retry;
//! steady-state reads are never retried here (the poller just skips the tick).
//!
//! [`initialize`]: SensorSource::initialize
//! [`read`]: SensorSource::read

use std::time::Duration;

use log::{info, warn};

use crate::reading::Reading;

pub mod drivers;
#[cfg(target_os = "linux")]
pub mod hardware;
pub mod protocol;
pub mod scripted;
pub mod simulated;

pub use scripted::ScriptedSensor;
pub use simulated::SimulatedSensor;

/// Metadata about a sensor source.
#[derive(Debug, Clone)]
pub struct SensorInfo {
    /// Unique identifier (e.g. `"aht20+mhz19"`).
    pub name: &'static str,
    /// One-line human-readable description.
    pub description: &'static str,
    /// Whether this source talks to real hardware.
    pub hardware: bool,
}

/// Fatal sensor acquisition failure.
#[derive(Debug, thiserror::Error)]
pub enum InitError {
    /// The bus device node could not be opened or configured.
    #[error("cannot open bus {device}: {source}")]
    Bus {
        device: String,
        #[source]
        source: std::io::Error,
    },

    /// The bus opened but the device did not answer as expected.
    #[error("device at {device} not responding: {reason}")]
    NotResponding { device: String, reason: String },

    /// Every attempt in the retry policy failed.
    #[error("sensor initialization failed after {attempts} attempts: {last}")]
    Exhausted {
        attempts: u32,
        #[source]
        last: Box<InitError>,
    },
}

impl InitError {
    /// Wiring checklist printed alongside a fatal initialization error.
    pub const TROUBLESHOOTING: &'static [&'static str] = &[
        "Verify your wiring connections (SDA, SCL, VCC, GND)",
        "Ensure sensor is receiving proper voltage (3.3V or 5V)",
        "Check for I2C address conflicts",
        "Try with pull-up resistors on SDA/SCL if not present",
        "Check the CO2 sensor UART wiring (TX/RX crossed) and that the serial console is disabled",
    ];
}

/// Transient failure of a single read.
#[derive(Debug, thiserror::Error)]
pub enum ReadError {
    #[error("sensor I/O error: {0}")]
    Io(#[from] std::io::Error),

    /// The device reported a measurement still in progress.
    #[error("sensor busy")]
    Busy,

    #[error("checksum mismatch: expected {expected:#04x}, got {actual:#04x}")]
    Checksum { expected: u8, actual: u8 },

    #[error("malformed sensor frame: {0}")]
    Malformed(String),

    #[error("sensor unavailable: {0}")]
    Unavailable(String),
}

/// Trait that every sensor source must implement.
pub trait SensorSource: Send {
    /// Source metadata.
    fn info(&self) -> &SensorInfo;

    /// Acquire the device. Called once before the first [`read`](Self::read).
    fn initialize(&mut self) -> Result<(), InitError>;

    /// Take one reading. May block for the duration of the measurement.
    fn read(&mut self) -> Result<Reading, ReadError>;

    /// Convenience: name from info.
    fn name(&self) -> &'static str {
        self.info().name
    }
}

impl SensorSource for Box<dyn SensorSource> {
    fn info(&self) -> &SensorInfo {
        (**self).info()
    }

    fn initialize(&mut self) -> Result<(), InitError> {
        (**self).initialize()
    }

    fn read(&mut self) -> Result<Reading, ReadError> {
        (**self).read()
    }
}

/// Bounded fixed-delay retry for sensor acquisition.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RetryPolicy {
    /// Total attempts, including the first.
    pub attempts: u32,
    /// Delay between consecutive attempts.
    pub delay: Duration,
}

impl Default for RetryPolicy {
    fn default() -> Self {
        Self {
            attempts: 3,
            delay: Duration::from_secs(2),
        }
    }
}

/// Initialize `source`, retrying up to `policy.attempts` times.
///
/// Blocks the calling thread for the inter-attempt delays. The last error is
/// wrapped in [`InitError::Exhausted`] once every attempt has failed.
pub fn initialize_with_retry<S>(source: &mut S, policy: &RetryPolicy) -> Result<(), InitError>
where
    S: SensorSource + ?Sized,
{
    let attempts = policy.attempts.max(1);
    let mut last = None;

    for attempt in 1..=attempts {
        info!(
            "Attempt {attempt}/{attempts} to initialize sensor {}",
            source.name()
        );
        match source.initialize() {
            Ok(()) => {
                info!("Sensor {} initialized", source.name());
                return Ok(());
            }
            Err(e) => {
                warn!("Initialization failed: {e}");
                last = Some(e);
                if attempt < attempts && !policy.delay.is_zero() {
                    std::thread::sleep(policy.delay);
                }
            }
        }
    }

    Err(InitError::Exhausted {
        attempts,
        last: Box::new(last.unwrap_or_else(|| InitError::NotResponding {
            device: source.name().to_string(),
            reason: "no attempt was made".to_string(),
        })),
    })
}
