//! Last-observed readings exposed as Prometheus gauges.
//!
//! The three gauges live in a private registry behind one mutex. Setting and
//! rendering both take the lock, so a scrape always sees one complete triple
//! and never a half-updated mix of two polls.

use std::sync::{Mutex, PoisonError};

use prometheus::{Encoder, Gauge, Registry, TextEncoder};

use crate::reading::Reading;

/// Content type of [`MetricsExporter::render`] output.
pub const CONTENT_TYPE: &str = prometheus::TEXT_FORMAT;

/// Consistent copy of the three scalars.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MetricsSnapshot {
    pub temperature: f64,
    pub humidity: f64,
    pub co2: i64,
}

struct Gauges {
    temperature: Gauge,
    humidity: Gauge,
    co2: Gauge,
    last: Option<MetricsSnapshot>,
}

pub struct MetricsExporter {
    registry: Registry,
    gauges: Mutex<Gauges>,
}

impl MetricsExporter {
    pub fn new() -> Result<Self, prometheus::Error> {
        let registry = Registry::new();
        let temperature = Gauge::new("temperature_celsius", "Temperature in Celsius")?;
        let humidity = Gauge::new("humidity_percent", "Humidity in percent")?;
        let co2 = Gauge::new("co2_ppm", "CO2 concentration in ppm")?;
        registry.register(Box::new(temperature.clone()))?;
        registry.register(Box::new(humidity.clone()))?;
        registry.register(Box::new(co2.clone()))?;

        Ok(Self {
            registry,
            gauges: Mutex::new(Gauges {
                temperature,
                humidity,
                co2,
                last: None,
            }),
        })
    }

    /// Overwrite all three gauges with `reading`.
    pub fn set(&self, reading: &Reading) {
        let mut g = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
        g.temperature.set(reading.temperature);
        g.humidity.set(reading.humidity);
        g.co2.set(reading.co2 as f64);
        g.last = Some(MetricsSnapshot {
            temperature: reading.temperature,
            humidity: reading.humidity,
            co2: reading.co2,
        });
    }

    /// Last triple set, or `None` before the first successful poll.
    pub fn snapshot(&self) -> Option<MetricsSnapshot> {
        self.gauges
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .last
    }

    /// Render the registry in the Prometheus text exposition format.
    pub fn render(&self) -> Result<String, prometheus::Error> {
        let families = {
            let _consistent = self.gauges.lock().unwrap_or_else(PoisonError::into_inner);
            self.registry.gather()
        };
        let mut buf = Vec::new();
        TextEncoder::new().encode(&families, &mut buf)?;
        String::from_utf8(buf).map_err(|e| prometheus::Error::Msg(e.to_string()))
    }
}
