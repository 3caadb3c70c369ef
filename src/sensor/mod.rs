//! SCD40 wire protocol: commands, measurement framing, and raw-to-physical
//! conversions.
//!
//! One function per field, each converting a raw `u16` register value to a
//! physical `f32` and a validity predicate for its datasheet-specified
//! range.

pub mod transport;

use thiserror::Error;

/// Wire-protocol-level errors: frame parsing and CRC validation, kept
/// separate from [`transport::TransportError`] (the I2C connection/retry
/// boundary).
#[derive(Debug, Error, PartialEq, Eq)]
pub enum SensorError {
    #[error("CRC validation failed for {field}")]
    CrcMismatch { field: &'static str },
}

/// 16-bit SCD40 command codes, sent big-endian as two bytes.
pub mod command {
    pub const START_PERIODIC: u16 = 0x21B1;
    pub const READ_MEASUREMENT: u16 = 0xEC05;
    pub const STOP_PERIODIC: u16 = 0x3F86;
    pub const GET_SERIAL: u16 = 0x3682;
}

pub const CO2_MIN: f32 = 400.0;
pub const CO2_MAX: f32 = 40_000.0;
pub const TEMP_MIN: f32 = -40.0;
pub const TEMP_MAX: f32 = 70.0;
pub const HUMIDITY_MIN: f32 = 0.0;
pub const HUMIDITY_MAX: f32 = 100.0;

/// Convert a raw CO2 register value to ppm. `raw == 0` is always invalid
/// (an unpowered/disconnected sensor reads all zero bytes).
pub fn co2_ppm(raw: u16) -> f32 {
    raw as f32
}

pub fn co2_valid(raw: u16, value: f32) -> bool {
    raw != 0 && (CO2_MIN..=CO2_MAX).contains(&value)
}

/// Convert a raw temperature register value to degrees Celsius:
/// `-45 + 175 * raw / 65536`.
pub fn temperature_c(raw: u16) -> f32 {
    -45.0 + 175.0 * (raw as f32 / 65536.0)
}

pub fn temperature_valid(raw: u16, value: f32) -> bool {
    raw != 0 && (TEMP_MIN..=TEMP_MAX).contains(&value)
}

/// Convert a raw humidity register value to percent relative humidity:
/// `100 * raw / 65536`.
pub fn humidity_percent(raw: u16) -> f32 {
    100.0 * (raw as f32 / 65536.0)
}

pub fn humidity_valid(raw: u16, value: f32) -> bool {
    raw != 0 && (HUMIDITY_MIN..=HUMIDITY_MAX).contains(&value)
}

/// The three raw 16-bit words read back from a `READ_MEASUREMENT` command,
/// already CRC-verified, in sensor order (CO2, temperature, humidity).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RawMeasurement {
    pub co2: u16,
    pub temperature: u16,
    pub humidity: u16,
}

/// Parse and CRC-verify the 9-byte measurement frame: three `(word:2,
/// crc:1)` tuples in order. Fails on the first CRC mismatch; the caller
/// (the I2C transport's retry loop) treats that as a frame error and
/// retries.
pub fn parse_measurement_frame(frame: [u8; 9]) -> Result<RawMeasurement, SensorError> {
    let co2 = take_word(&frame[0..3], "co2")?;
    let temperature = take_word(&frame[3..6], "temperature")?;
    let humidity = take_word(&frame[6..9], "humidity")?;
    Ok(RawMeasurement {
        co2,
        temperature,
        humidity,
    })
}

fn take_word(triple: &[u8], field: &'static str) -> Result<u16, SensorError> {
    let data = [triple[0], triple[1]];
    let crc = triple[2];
    if !crate::crc::verify_word(data, crc) {
        return Err(SensorError::CrcMismatch { field });
    }
    Ok(u16::from_be_bytes(data))
}

/// Convert a CRC-verified raw measurement into a [`crate::reading::Reading`]
/// at the given timestamp, applying the datasheet validity ranges to derive
/// the quality bitmask. A reading with any value outside its valid range is
/// still filled in (stored, but flagged invalid) — it is the *caller* (the
/// I2C transport's retry loop) that decides whether an invalid value should
/// instead be treated as a failed read.
pub fn to_reading(raw: RawMeasurement, timestamp_us: u64) -> crate::reading::Reading {
    use crate::reading::QualityFlags;

    let co2 = co2_ppm(raw.co2);
    let temperature = temperature_c(raw.temperature);
    let humidity = humidity_percent(raw.humidity);

    let mut flags = QualityFlags::empty();
    if co2_valid(raw.co2, co2) {
        flags |= QualityFlags::CO2_VALID;
    }
    if temperature_valid(raw.temperature, temperature) {
        flags |= QualityFlags::TEMP_VALID;
    }
    if humidity_valid(raw.humidity, humidity) {
        flags |= QualityFlags::HUMIDITY_VALID;
    }

    crate::reading::Reading {
        timestamp_us,
        co2_ppm: Some(co2),
        temperature_c: Some(temperature),
        humidity_percent: Some(humidity),
        quality_flags: flags,
    }
}

/// Whether every field of a freshly-converted measurement is within range.
/// A reading with any value outside its valid range causes the caller to
/// treat the whole read as failed for retry purposes.
pub fn all_fields_valid(raw: RawMeasurement) -> bool {
    co2_valid(raw.co2, co2_ppm(raw.co2))
        && temperature_valid(raw.temperature, temperature_c(raw.temperature))
        && humidity_valid(raw.humidity, humidity_percent(raw.humidity))
}
