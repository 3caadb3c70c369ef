//! The [`Reading`] type and its binary on-disk encoding.
//!
//! A self-describing, forward-compatible shape built by hand as a small
//! tagged record: a byte cursor pulling fixed-width fields off a slice, the
//! same shape as carving a sensor's fixed-size I2C read buffer apart field
//! by field.

use std::time::{SystemTime, UNIX_EPOCH};

bitflags::bitflags! {
    /// Per-field validity bits. A bit is set iff the corresponding value is
    /// both present and within its validation range.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct QualityFlags: u32 {
        const CO2_VALID = 0x01;
        const TEMP_VALID = 0x02;
        const HUMIDITY_VALID = 0x04;
    }
}

/// One sensor observation: up to three independently-optional fields, plus
/// the validity bitmask and a microsecond-resolution UTC timestamp.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Reading {
    pub timestamp_us: u64,
    pub co2_ppm: Option<f32>,
    pub temperature_c: Option<f32>,
    pub humidity_percent: Option<f32>,
    pub quality_flags: QualityFlags,
}

impl Reading {
    pub fn new(timestamp_us: u64) -> Self {
        Self {
            timestamp_us,
            co2_ppm: None,
            temperature_c: None,
            humidity_percent: None,
            quality_flags: QualityFlags::empty(),
        }
    }

    /// At least one field must be present for the daemon loop to accept a
    /// reading.
    pub fn has_any_value(&self) -> bool {
        self.co2_ppm.is_some() || self.temperature_c.is_some() || self.humidity_percent.is_some()
    }

    pub fn timestamp_system_time(&self) -> SystemTime {
        UNIX_EPOCH + std::time::Duration::from_micros(self.timestamp_us)
    }
}

/// Microseconds since the Unix epoch, now.
pub fn now_micros() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64
}

const SCHEMA_VERSION: u8 = 1;

const TAG_CO2: u8 = 1;
const TAG_TEMPERATURE: u8 = 2;
const TAG_HUMIDITY: u8 = 3;
const TAG_QUALITY_FLAGS: u8 = 4;

/// Serialize a reading to its tagged binary form:
/// `version:u8 ++ timestamp_us:u64(BE) ++ field_count:u8 ++ (tag:u8, len:u8, value)*`
///
/// Unknown future tags are skipped by length on decode, so adding a new
/// optional field in a later `SCHEMA_VERSION` doesn't break old readers.
pub fn serialize(reading: &Reading) -> Vec<u8> {
    let mut fields: Vec<(u8, [u8; 4])> = Vec::with_capacity(4);
    if let Some(v) = reading.co2_ppm {
        fields.push((TAG_CO2, v.to_le_bytes()));
    }
    if let Some(v) = reading.temperature_c {
        fields.push((TAG_TEMPERATURE, v.to_le_bytes()));
    }
    if let Some(v) = reading.humidity_percent {
        fields.push((TAG_HUMIDITY, v.to_le_bytes()));
    }
    fields.push((TAG_QUALITY_FLAGS, reading.quality_flags.bits().to_le_bytes()));

    let mut out = Vec::with_capacity(1 + 8 + 1 + fields.len() * 6);
    out.push(SCHEMA_VERSION);
    out.extend_from_slice(&reading.timestamp_us.to_be_bytes());
    out.push(fields.len() as u8);
    for (tag, value) in fields {
        out.push(tag);
        out.push(value.len() as u8);
        out.extend_from_slice(&value);
    }
    out
}

/// Deserialize a reading, returning `None` on any malformed input
/// (truncated buffer, inconsistent field length) rather than panicking —
/// corrupted records must fail gracefully.
pub fn deserialize(data: &[u8]) -> Option<Reading> {
    let mut cursor = Cursor::new(data);
    let _version = cursor.take_u8()?;
    let timestamp_us = cursor.take_u64_be()?;
    let field_count = cursor.take_u8()?;

    let mut reading = Reading::new(timestamp_us);
    for _ in 0..field_count {
        let tag = cursor.take_u8()?;
        let len = cursor.take_u8()? as usize;
        let value = cursor.take_bytes(len)?;
        match (tag, len) {
            (TAG_CO2, 4) => reading.co2_ppm = Some(f32::from_le_bytes(value.try_into().ok()?)),
            (TAG_TEMPERATURE, 4) => {
                reading.temperature_c = Some(f32::from_le_bytes(value.try_into().ok()?))
            }
            (TAG_HUMIDITY, 4) => {
                reading.humidity_percent = Some(f32::from_le_bytes(value.try_into().ok()?))
            }
            (TAG_QUALITY_FLAGS, 4) => {
                let bits = u32::from_le_bytes(value.try_into().ok()?);
                reading.quality_flags = QualityFlags::from_bits_truncate(bits);
            }
            // Unknown tag from a newer schema version: skip, already
            // consumed by `take_bytes` above.
            _ => {}
        }
    }
    Some(reading)
}

struct Cursor<'a> {
    data: &'a [u8],
    pos: usize,
}

impl<'a> Cursor<'a> {
    fn new(data: &'a [u8]) -> Self {
        Self { data, pos: 0 }
    }

    fn take_u8(&mut self) -> Option<u8> {
        let byte = *self.data.get(self.pos)?;
        self.pos += 1;
        Some(byte)
    }

    fn take_u64_be(&mut self) -> Option<u64> {
        let bytes = self.take_bytes(8)?;
        Some(u64::from_be_bytes(bytes.try_into().ok()?))
    }

    fn take_bytes(&mut self, len: usize) -> Option<&'a [u8]> {
        let end = self.pos.checked_add(len)?;
        let slice = self.data.get(self.pos..end)?;
        self.pos = end;
        Some(slice)
    }
}
