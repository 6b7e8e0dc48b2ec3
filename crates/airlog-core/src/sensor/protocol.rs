//! Wire-level encoding and decoding for the supported sensor chips.
//!
//! Kept free of any I/O so the frame handling can be tested on every platform.
//! The drivers in [`super::drivers`] only move bytes.
//!
//! - **AHT20 / AHTx0** (I2C, address `0x38`): 7-byte measurement frame
//!   `[status, h, h, h|t, t, t, crc]` with 20-bit humidity and temperature.
//! - **MH-Z19** (UART 9600 8N1): 9-byte command/response frames with a
//!   two's-complement checksum over bytes 1..=7.

use super::ReadError;

// ---------------------------------------------------------------------------
// AHT20
// ---------------------------------------------------------------------------

/// Default 7-bit I2C address of the AHT10/AHT20 family.
pub const AHT_ADDRESS: u8 = 0x38;
/// Trigger a measurement.
pub const AHT_CMD_MEASURE: [u8; 3] = [0xAC, 0x33, 0x00];
/// Load calibration coefficients (sent when the calibrated bit is clear).
pub const AHT_CMD_CALIBRATE: [u8; 3] = [0xBE, 0x08, 0x00];

const AHT_STATUS_BUSY: u8 = 0x80;
const AHT_STATUS_CALIBRATED: u8 = 0x08;
const AHT_FULL_SCALE: f64 = (1u32 << 20) as f64;

/// Whether the status byte reports a measurement in progress.
pub fn aht_is_busy(status: u8) -> bool {
    status & AHT_STATUS_BUSY != 0
}

/// Whether the status byte reports loaded calibration.
pub fn aht_is_calibrated(status: u8) -> bool {
    status & AHT_STATUS_CALIBRATED != 0
}

/// CRC-8, polynomial 0x31, init 0xFF, as used by the AHT20 frame trailer.
pub fn crc8(data: &[u8]) -> u8 {
    let mut crc = 0xFFu8;
    for &byte in data {
        crc ^= byte;
        for _ in 0..8 {
            crc = if crc & 0x80 != 0 {
                (crc << 1) ^ 0x31
            } else {
                crc << 1
            };
        }
    }
    crc
}

/// Decode an AHT20 frame into `(temperature °C, relative humidity %)`.
///
/// Accepts a 6-byte frame (no CRC, AHT10 style) or a 7-byte frame whose last
/// byte is verified against [`crc8`].
pub fn decode_aht(frame: &[u8]) -> Result<(f64, f64), ReadError> {
    if frame.len() != 6 && frame.len() != 7 {
        return Err(ReadError::Malformed(format!(
            "AHT frame must be 6 or 7 bytes, got {}",
            frame.len()
        )));
    }
    if aht_is_busy(frame[0]) {
        return Err(ReadError::Busy);
    }
    if frame.len() == 7 {
        let expected = crc8(&frame[..6]);
        if expected != frame[6] {
            return Err(ReadError::Checksum {
                expected,
                actual: frame[6],
            });
        }
    }

    let raw_humidity =
        (u32::from(frame[1]) << 12) | (u32::from(frame[2]) << 4) | (u32::from(frame[3]) >> 4);
    let raw_temperature =
        (u32::from(frame[3] & 0x0F) << 16) | (u32::from(frame[4]) << 8) | u32::from(frame[5]);

    let humidity = f64::from(raw_humidity) / AHT_FULL_SCALE * 100.0;
    let temperature = f64::from(raw_temperature) / AHT_FULL_SCALE * 200.0 - 50.0;
    Ok((temperature, humidity))
}

// ---------------------------------------------------------------------------
// MH-Z19
// ---------------------------------------------------------------------------

/// Frame length of every MH-Z19 command and response.
pub const MHZ_FRAME_LEN: usize = 9;
const MHZ_START: u8 = 0xFF;
const MHZ_CMD_READ_CO2: u8 = 0x86;

/// Checksum of a 9-byte MH-Z19 frame: negated sum of bytes 1..=7.
pub fn mhz_checksum(frame: &[u8; MHZ_FRAME_LEN]) -> u8 {
    let sum = frame[1..8].iter().fold(0u8, |acc, &b| acc.wrapping_add(b));
    (!sum).wrapping_add(1)
}

/// The "read CO2 concentration" command (`FF 01 86 00 00 00 00 00 79`).
pub fn mhz_read_command() -> [u8; MHZ_FRAME_LEN] {
    let mut frame = [MHZ_START, 0x01, MHZ_CMD_READ_CO2, 0, 0, 0, 0, 0, 0];
    frame[8] = mhz_checksum(&frame);
    frame
}

/// Decode a "read CO2" response into ppm.
pub fn decode_mhz(frame: &[u8; MHZ_FRAME_LEN]) -> Result<i64, ReadError> {
    if frame[0] != MHZ_START || frame[1] != MHZ_CMD_READ_CO2 {
        return Err(ReadError::Malformed(format!(
            "unexpected MH-Z19 header {:02x} {:02x}",
            frame[0], frame[1]
        )));
    }
    let expected = mhz_checksum(frame);
    if expected != frame[8] {
        return Err(ReadError::Checksum {
            expected,
            actual: frame[8],
        });
    }
    Ok(i64::from(frame[2]) * 256 + i64::from(frame[3]))
}
