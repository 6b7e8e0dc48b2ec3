//! Transport-generic drivers for the AHT20 and MH-Z19.
//!
//! The AHT20 is written against the [`embedded_hal::i2c::I2c`] trait and
//! paces itself with [`DelayNs`], so the same driver runs on a Linux
//! `i2c-dev` bus or on a scripted bus in tests. The MH-Z19 only needs a byte
//! stream with a read timeout, expressed as [`SerialLink`].

use std::io::{self, Read, Write};

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::{self, I2c};

use super::ReadError;
use super::protocol::{
    AHT_ADDRESS, AHT_CMD_CALIBRATE, AHT_CMD_MEASURE, MHZ_FRAME_LEN, aht_is_busy,
    aht_is_calibrated, decode_aht, decode_mhz, mhz_read_command,
};

/// Power-on settle time before the first status read.
const AHT_POWER_ON_DELAY_MS: u32 = 40;
const AHT_CALIBRATE_DELAY_MS: u32 = 10;
/// Conversion time after the measure trigger.
const AHT_MEASURE_DELAY_MS: u32 = 80;
const AHT_BUSY_RETRIES: u32 = 3;

/// 7-bit addresses covered by [`scan_bus`] (same as `i2cdetect`).
const SCAN_FIRST: u8 = 0x08;
const SCAN_LAST: u8 = 0x77;

fn bus_error<E: i2c::Error>(e: E) -> ReadError {
    ReadError::Io(io::Error::other(format!("I2C {:?}", e.kind())))
}

/// Addresses on `bus` that acknowledge a one-byte read.
pub fn scan_bus<I: I2c>(bus: &mut I) -> Vec<u8> {
    let mut byte = [0u8; 1];
    (SCAN_FIRST..=SCAN_LAST)
        .filter(|&address| bus.read(address, &mut byte).is_ok())
        .collect()
}

// ---------------------------------------------------------------------------
// AHT20
// ---------------------------------------------------------------------------

pub struct Aht20<I, D> {
    i2c: I,
    delay: D,
}

impl<I: I2c, D: DelayNs> Aht20<I, D> {
    pub fn new(i2c: I, delay: D) -> Self {
        Self { i2c, delay }
    }

    fn status(&mut self) -> Result<u8, ReadError> {
        let mut status = [0u8; 1];
        self.i2c
            .read(AHT_ADDRESS, &mut status)
            .map_err(bus_error)?;
        Ok(status[0])
    }

    /// Load calibration if the device reports it missing. Returns whether
    /// the calibrated bit is set afterwards.
    pub fn calibrate(&mut self) -> Result<bool, ReadError> {
        self.delay.delay_ms(AHT_POWER_ON_DELAY_MS);
        if aht_is_calibrated(self.status()?) {
            return Ok(true);
        }
        self.i2c
            .write(AHT_ADDRESS, &AHT_CMD_CALIBRATE)
            .map_err(bus_error)?;
        self.delay.delay_ms(AHT_CALIBRATE_DELAY_MS);
        Ok(aht_is_calibrated(self.status()?))
    }

    /// Trigger a conversion and return `(temperature °C, humidity %)`.
    pub fn measure(&mut self) -> Result<(f64, f64), ReadError> {
        self.i2c
            .write(AHT_ADDRESS, &AHT_CMD_MEASURE)
            .map_err(bus_error)?;
        self.delay.delay_ms(AHT_MEASURE_DELAY_MS);

        let mut frame = [0u8; 7];
        for _ in 0..AHT_BUSY_RETRIES {
            self.i2c.read(AHT_ADDRESS, &mut frame).map_err(bus_error)?;
            if !aht_is_busy(frame[0]) {
                return decode_aht(&frame);
            }
            self.delay.delay_ms(AHT_CALIBRATE_DELAY_MS);
        }
        Err(ReadError::Busy)
    }
}

// ---------------------------------------------------------------------------
// MH-Z19
// ---------------------------------------------------------------------------

/// Byte stream to the MH-Z19. Reads must time out rather than block forever.
pub trait SerialLink: Read + Write {
    /// Drop unread input so the next response lines up with the next command.
    fn discard_input(&mut self) -> io::Result<()> {
        Ok(())
    }
}

pub struct MhZ19<P> {
    port: P,
}

impl<P: SerialLink> MhZ19<P> {
    pub fn new(port: P) -> Self {
        Self { port }
    }

    pub fn read_co2(&mut self) -> Result<i64, ReadError> {
        self.port.discard_input()?;
        self.port.write_all(&mhz_read_command())?;
        self.port.flush()?;

        let mut frame = [0u8; MHZ_FRAME_LEN];
        self.port.read_exact(&mut frame)?;
        decode_mhz(&frame)
    }
}

#[cfg(test)]
mod tests {
    use std::collections::VecDeque;

    use embedded_hal::i2c::{ErrorKind, ErrorType, NoAcknowledgeSource, Operation};

    use super::*;
    use crate::sensor::protocol::{crc8, mhz_checksum};

    struct NoDelay;

    impl DelayNs for NoDelay {
        fn delay_ns(&mut self, _ns: u32) {}
    }

    /// Bus that answers reads from a queue and records writes.
    #[derive(Default)]
    struct ScriptedBus {
        present: Vec<u8>,
        reads: VecDeque<Vec<u8>>,
        writes: Vec<(u8, Vec<u8>)>,
    }

    impl ErrorType for ScriptedBus {
        type Error = ErrorKind;
    }

    impl I2c for ScriptedBus {
        fn transaction(
            &mut self,
            address: u8,
            operations: &mut [Operation<'_>],
        ) -> Result<(), Self::Error> {
            if !self.present.contains(&address) {
                return Err(ErrorKind::NoAcknowledge(NoAcknowledgeSource::Address));
            }
            for op in operations {
                match op {
                    Operation::Write(bytes) => self.writes.push((address, bytes.to_vec())),
                    Operation::Read(buf) => {
                        let next = self.reads.pop_front().unwrap_or_default();
                        for (dst, src) in buf.iter_mut().zip(next.iter().chain([0u8; 8].iter()))
                        {
                            *dst = *src;
                        }
                    }
                }
            }
            Ok(())
        }
    }

    fn aht_bus(reads: &[&[u8]]) -> ScriptedBus {
        ScriptedBus {
            present: vec![AHT_ADDRESS],
            reads: reads.iter().map(|r| r.to_vec()).collect(),
            writes: Vec::new(),
        }
    }

    fn aht_frame(status: u8) -> Vec<u8> {
        // Half scale on both channels: 50 %RH, 50 °C.
        let mut frame = vec![status, 0x80, 0x00, 0x08, 0x00, 0x00];
        frame.push(crc8(&frame));
        frame
    }

    struct Loopback {
        response: io::Cursor<Vec<u8>>,
        written: Vec<u8>,
    }

    impl Read for Loopback {
        fn read(&mut self, buf: &mut [u8]) -> io::Result<usize> {
            self.response.read(buf)
        }
    }

    impl Write for Loopback {
        fn write(&mut self, buf: &[u8]) -> io::Result<usize> {
            self.written.extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> io::Result<()> {
            Ok(())
        }
    }

    impl SerialLink for Loopback {}

    // -----------------------------------------------------------------------
    // Bus scan
    // -----------------------------------------------------------------------

    #[test]
    fn test_scan_lists_acknowledging_addresses() {
        let mut bus = ScriptedBus {
            present: vec![0x38, 0x76],
            ..ScriptedBus::default()
        };
        assert_eq!(scan_bus(&mut bus), vec![0x38, 0x76]);
    }

    // -----------------------------------------------------------------------
    // AHT20
    // -----------------------------------------------------------------------

    #[test]
    fn test_calibrated_device_skips_calibration_command() {
        let mut aht = Aht20::new(aht_bus(&[&[0x18]]), NoDelay);
        assert!(aht.calibrate().unwrap());
        assert!(aht.i2c.writes.is_empty());
    }

    #[test]
    fn test_uncalibrated_device_gets_calibration_command() {
        let mut aht = Aht20::new(aht_bus(&[&[0x00], &[0x08]]), NoDelay);
        assert!(aht.calibrate().unwrap());
        assert_eq!(aht.i2c.writes, vec![(AHT_ADDRESS, AHT_CMD_CALIBRATE.to_vec())]);
    }

    #[test]
    fn test_measure_decodes_after_busy_frame() {
        let busy = aht_frame(0x80);
        let ready = aht_frame(0x18);
        let mut aht = Aht20::new(aht_bus(&[&busy, &ready]), NoDelay);

        let (temperature, humidity) = aht.measure().unwrap();
        assert!((temperature - 50.0).abs() < 0.01);
        assert!((humidity - 50.0).abs() < 0.01);
        assert_eq!(aht.i2c.writes, vec![(AHT_ADDRESS, AHT_CMD_MEASURE.to_vec())]);
    }

    #[test]
    fn test_measure_gives_up_while_busy() {
        let busy = aht_frame(0x80);
        let mut aht = Aht20::new(aht_bus(&[&busy, &busy, &busy]), NoDelay);
        assert!(matches!(aht.measure(), Err(ReadError::Busy)));
    }

    #[test]
    fn test_missing_device_is_io_error() {
        let mut aht = Aht20::new(ScriptedBus::default(), NoDelay);
        assert!(matches!(aht.measure(), Err(ReadError::Io(_))));
    }

    // -----------------------------------------------------------------------
    // MH-Z19
    // -----------------------------------------------------------------------

    #[test]
    fn test_read_co2_sends_command_and_decodes() {
        let mut response = [0xFF, 0x86, 0x01, 0x9A, 0x00, 0x00, 0x00, 0x00, 0x00];
        response[8] = mhz_checksum(&response);
        let mut mhz = MhZ19::new(Loopback {
            response: io::Cursor::new(response.to_vec()),
            written: Vec::new(),
        });

        assert_eq!(mhz.read_co2().unwrap(), 410);
        assert_eq!(mhz.port.written, mhz_read_command().to_vec());
    }

    #[test]
    fn test_short_response_is_io_error() {
        let mut mhz = MhZ19::new(Loopback {
            response: io::Cursor::new(vec![0xFF, 0x86, 0x01]),
            written: Vec::new(),
        });
        assert!(matches!(mhz.read_co2(), Err(ReadError::Io(_))));
    }
}
