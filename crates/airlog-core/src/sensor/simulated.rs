//! SimulatedSensor: bounded random walk around typical indoor conditions.
//!
//! Lets the collector run on a machine without an I2C bus or CO2 sensor.
//! Each read nudges the previous value by a small random step and clamps it to
//! a plausible indoor range. An optional failure rate injects transient
//! [`ReadError`]s so the skip-tick path gets exercised.

use rand::rngs::StdRng;
use rand::{Rng, SeedableRng};

use super::{InitError, ReadError, SensorInfo, SensorSource};
use crate::reading::Reading;

const TEMPERATURE_RANGE: (f64, f64) = (15.0, 32.0);
const HUMIDITY_RANGE: (f64, f64) = (20.0, 80.0);
const CO2_RANGE: (i64, i64) = (400, 2500);

pub struct SimulatedSensor {
    info: SensorInfo,
    rng: StdRng,
    temperature: f64,
    humidity: f64,
    co2: i64,
    failure_rate: f64,
}

impl SimulatedSensor {
    pub fn new() -> Self {
        Self::with_rng(StdRng::from_os_rng())
    }

    /// Reproducible walk for tests and demos.
    pub fn seeded(seed: u64) -> Self {
        Self::with_rng(StdRng::seed_from_u64(seed))
    }

    fn with_rng(rng: StdRng) -> Self {
        Self {
            info: SensorInfo {
                name: "simulated",
                description: "Random-walk temperature, humidity and CO2 around indoor baselines",
                hardware: false,
            },
            rng,
            temperature: 22.5,
            humidity: 45.0,
            co2: 410,
            failure_rate: 0.0,
        }
    }

    /// Probability in `[0, 1]` that a read fails transiently.
    pub fn with_failure_rate(mut self, rate: f64) -> Self {
        self.failure_rate = rate.clamp(0.0, 1.0);
        self
    }
}

impl Default for SimulatedSensor {
    fn default() -> Self {
        Self::new()
    }
}

impl SensorSource for SimulatedSensor {
    fn info(&self) -> &SensorInfo {
        &self.info
    }

    fn initialize(&mut self) -> Result<(), InitError> {
        Ok(())
    }

    fn read(&mut self) -> Result<Reading, ReadError> {
        if self.failure_rate > 0.0 && self.rng.random_bool(self.failure_rate) {
            return Err(ReadError::Unavailable("simulated transient failure".to_string()));
        }

        self.temperature = (self.temperature + self.rng.random_range(-0.1..=0.1))
            .clamp(TEMPERATURE_RANGE.0, TEMPERATURE_RANGE.1);
        self.humidity = (self.humidity + self.rng.random_range(-0.3..=0.3))
            .clamp(HUMIDITY_RANGE.0, HUMIDITY_RANGE.1);
        self.co2 = (self.co2 + self.rng.random_range(-5..=8)).clamp(CO2_RANGE.0, CO2_RANGE.1);

        Ok(Reading::new(
            round2(self.temperature),
            round2(self.humidity),
            self.co2,
        ))
    }
}

fn round2(v: f64) -> f64 {
    (v * 100.0).round() / 100.0
}
