//! Linux bindings for the AHT20 (I2C) + MH-Z19 (UART) sensor pair.
//!
//! The AHT20 driver runs on `linux-embedded-hal`'s `i2c-dev` bus
//! (`/dev/i2c-N`). The MH-Z19 port is opened with `serialport` at 9600 8N1
//! with a one second read timeout, so a dead sensor cannot stall the poller
//! forever.

use std::io;
use std::path::{Path, PathBuf};
use std::thread;
use std::time::Duration;

use linux_embedded_hal::{Delay, I2cdev};
use log::{info, warn};
use serialport::{ClearBuffer, SerialPort};

use super::drivers::{Aht20, MhZ19, SerialLink, scan_bus};
use super::protocol::AHT_ADDRESS;
use super::{InitError, ReadError, SensorInfo, SensorSource};
use crate::reading::Reading;

const MHZ_BAUD: u32 = 9600;
const MHZ_TIMEOUT: Duration = Duration::from_secs(1);

impl SerialLink for Box<dyn SerialPort> {
    fn discard_input(&mut self) -> io::Result<()> {
        self.clear(ClearBuffer::Input).map_err(io::Error::from)
    }
}

fn open_bus(path: &Path) -> io::Result<I2cdev> {
    I2cdev::new(path).map_err(|e| io::Error::other(e.to_string()))
}

fn open_serial(path: &Path) -> io::Result<Box<dyn SerialPort>> {
    serialport::new(path.to_string_lossy(), MHZ_BAUD)
        .timeout(MHZ_TIMEOUT)
        .flow_control(serialport::FlowControl::None)
        .open()
        .map_err(io::Error::from)
}

/// Device paths for the hardware sensor pair.
#[derive(Debug, Clone)]
pub struct HardwareConfig {
    pub i2c_bus: PathBuf,
    pub serial_port: PathBuf,
    /// Delay before the first initialization attempt.
    pub stabilize_delay: Duration,
}

impl Default for HardwareConfig {
    fn default() -> Self {
        Self {
            i2c_bus: PathBuf::from("/dev/i2c-1"),
            serial_port: PathBuf::from("/dev/serial0"),
            stabilize_delay: Duration::from_secs(1),
        }
    }
}

/// AHT20 for temperature/humidity plus MH-Z19 for CO2, read as one sample.
pub struct EnvironmentSensor {
    info: SensorInfo,
    config: HardwareConfig,
    stabilized: bool,
    aht: Option<Aht20<I2cdev, Delay>>,
    mhz: Option<MhZ19<Box<dyn SerialPort>>>,
}

impl EnvironmentSensor {
    pub fn new(config: HardwareConfig) -> Self {
        Self {
            info: SensorInfo {
                name: "aht20+mhz19",
                description: "AHT20 temperature/humidity over I2C and MH-Z19 CO2 over UART",
                hardware: true,
            },
            config,
            stabilized: false,
            aht: None,
            mhz: None,
        }
    }

    fn bus_name(&self) -> String {
        self.config.i2c_bus.display().to_string()
    }

    fn report_bus_scan(&self) {
        match open_bus(&self.config.i2c_bus) {
            Ok(mut bus) => {
                let found = scan_bus(&mut bus);
                let hex: Vec<String> = found.iter().map(|a| format!("{a:#04x}")).collect();
                info!("I2C devices found: [{}]", hex.join(", "));
                if !found.contains(&AHT_ADDRESS) {
                    warn!("AHT sensor ({AHT_ADDRESS:#04x}) not found on I2C bus, check your wiring");
                }
            }
            Err(e) => warn!("I2C bus scan of {} failed: {e}", self.bus_name()),
        }
    }

    fn not_responding(&self, reason: String) -> InitError {
        InitError::NotResponding {
            device: format!("{} @ {AHT_ADDRESS:#04x}", self.bus_name()),
            reason,
        }
    }
}

impl SensorSource for EnvironmentSensor {
    fn info(&self) -> &SensorInfo {
        &self.info
    }

    fn initialize(&mut self) -> Result<(), InitError> {
        if !self.stabilized {
            self.report_bus_scan();
            info!("Waiting for sensor to stabilize...");
            thread::sleep(self.config.stabilize_delay);
            self.stabilized = true;
        }

        let bus = open_bus(&self.config.i2c_bus).map_err(|source| InitError::Bus {
            device: self.bus_name(),
            source,
        })?;
        let mut aht = Aht20::new(bus, Delay);
        match aht.calibrate() {
            Ok(true) => {}
            Ok(false) => {
                return Err(self.not_responding("calibration bit stays clear".to_string()));
            }
            Err(e) => return Err(self.not_responding(e.to_string())),
        }

        let port = open_serial(&self.config.serial_port).map_err(|source| InitError::Bus {
            device: self.config.serial_port.display().to_string(),
            source,
        })?;

        self.aht = Some(aht);
        self.mhz = Some(MhZ19::new(port));
        Ok(())
    }

    fn read(&mut self) -> Result<Reading, ReadError> {
        let (Some(aht), Some(mhz)) = (self.aht.as_mut(), self.mhz.as_mut()) else {
            return Err(ReadError::Unavailable("sensor not initialized".to_string()));
        };
        let (temperature, humidity) = aht.measure()?;
        let co2 = mhz.read_co2()?;
        Ok(Reading::new(temperature, humidity, co2))
    }
}
