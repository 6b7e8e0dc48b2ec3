pub mod init_db;
pub mod query;
pub mod sample;
pub mod serve;

use std::path::PathBuf;
use std::time::Duration;

use airlog_core::{InitError, SensorSource, SimulatedSensor};

/// Sensor selection as given on the command line.
#[derive(Debug, Clone)]
pub struct SensorSpec {
    pub kind: String,
    pub i2c_bus: PathBuf,
    pub serial: PathBuf,
    /// Chance that a simulated read fails, in `[0, 1]`.
    pub failure_rate: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SensorKind {
    Hardware,
    Simulated,
}

/// Parse a sensor backend name.
pub fn parse_sensor_kind(s: &str) -> Option<SensorKind> {
    match s {
        "hardware" | "hw" => Some(SensorKind::Hardware),
        "simulated" | "sim" => Some(SensorKind::Simulated),
        _ => None,
    }
}

/// Build the (not yet initialized) sensor named by `spec`.
pub fn make_sensor(spec: &SensorSpec) -> Result<Box<dyn SensorSource>, String> {
    match parse_sensor_kind(&spec.kind) {
        Some(SensorKind::Simulated) => Ok(Box::new(
            SimulatedSensor::new().with_failure_rate(spec.failure_rate),
        )),
        Some(SensorKind::Hardware) => hardware_sensor(spec),
        None => Err(format!(
            "Unknown sensor '{}'. Use 'hardware' or 'simulated'.",
            spec.kind
        )),
    }
}

#[cfg(target_os = "linux")]
fn hardware_sensor(spec: &SensorSpec) -> Result<Box<dyn SensorSource>, String> {
    use airlog_core::sensor::hardware::{EnvironmentSensor, HardwareConfig};

    Ok(Box::new(EnvironmentSensor::new(HardwareConfig {
        i2c_bus: spec.i2c_bus.clone(),
        serial_port: spec.serial.clone(),
        ..HardwareConfig::default()
    })))
}

#[cfg(not(target_os = "linux"))]
fn hardware_sensor(_spec: &SensorSpec) -> Result<Box<dyn SensorSource>, String> {
    Err("The hardware sensor is only supported on Linux. Use --sensor simulated.".to_string())
}

/// Convert a seconds value from the command line into a polling interval.
pub fn parse_interval(secs: f64) -> Result<Duration, String> {
    if secs.is_finite() && secs > 0.0 {
        Ok(Duration::from_secs_f64(secs))
    } else {
        Err(format!("Interval must be a positive number of seconds, got {secs}"))
    }
}

/// Print a fatal initialization error with the wiring checklist.
pub fn report_init_error(err: &InitError) {
    eprintln!("Error: {err}");
    eprintln!();
    eprintln!("Troubleshooting tips:");
    for (i, tip) in InitError::TROUBLESHOOTING.iter().enumerate() {
        eprintln!("  {}. {tip}", i + 1);
    }
}
