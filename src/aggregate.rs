//! Bucket readings by interval and compute per-field `{min, mean, max,
//! count}` statistics.
//!
//! Bucket boundaries align to the query start, buckets are half-open, and
//! absent values are excluded per-field rather than counted as zero. Built
//! as a plain function over an already-fetched slice, in the same
//! no-framework style as the rest of this crate.

use std::time::Duration;

use crate::reading::Reading;

#[derive(Debug, Clone, Copy, PartialEq, Default)]
pub struct FieldStats {
    pub min: Option<f32>,
    pub mean: Option<f32>,
    pub max: Option<f32>,
    pub count: u32,
}

impl FieldStats {
    fn from_values(values: &[f32]) -> Self {
        if values.is_empty() {
            return Self::default();
        }
        let min = values.iter().copied().fold(f32::INFINITY, f32::min);
        let max = values.iter().copied().fold(f32::NEG_INFINITY, f32::max);
        let sum: f32 = values.iter().sum();
        Self {
            min: Some(min),
            mean: Some(sum / values.len() as f32),
            max: Some(max),
            count: values.len() as u32,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Bucket {
    pub bucket_start_us: u64,
    pub co2_ppm: FieldStats,
    pub temperature_c: FieldStats,
    pub humidity_percent: FieldStats,
}

/// An interval between bucket boundaries, parsed from a `^\d+[TMHD]$`
/// pattern (`T`=minutes, `H`=hours, `D`=days).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Interval(Duration);

impl Interval {
    pub fn from_micros(us: u64) -> Self {
        Self(Duration::from_micros(us))
    }

    pub fn as_micros(&self) -> u64 {
        self.0.as_micros() as u64
    }

    /// Parse `^\d+[TMHD]$`: digits followed by a single unit letter.
    pub fn parse(spec: &str) -> Option<Self> {
        let spec = spec.trim();
        if spec.len() < 2 {
            return None;
        }
        let (digits, unit) = spec.split_at(spec.len() - 1);
        if !digits.chars().all(|c| c.is_ascii_digit()) || digits.is_empty() {
            return None;
        }
        let count: u64 = digits.parse().ok()?;
        if count == 0 {
            return None;
        }
        let seconds = match unit {
            "T" => count.checked_mul(60)?,
            "H" => count.checked_mul(3600)?,
            "D" => count.checked_mul(86_400)?,
            _ => return None,
        };
        Some(Self(Duration::from_secs(seconds)))
    }

    /// Whether this interval divides cleanly into `[start, end]`, required
    /// by the `/data/aggregates` endpoint's parameter validation.
    pub fn divides_evenly(&self, start_us: u64, end_us: u64) -> bool {
        let span = end_us.saturating_sub(start_us);
        let interval = self.as_micros();
        interval > 0 && span % interval == 0
    }
}

/// Bucket `readings` (assumed sorted by timestamp) into `interval`-wide,
/// half-open buckets `[start + i*interval, start + (i+1)*interval)`
/// beginning at `start_us`, through `end_us`.
pub fn aggregate(readings: &[Reading], start_us: u64, end_us: u64, interval: Interval) -> Vec<Bucket> {
    let interval_us = interval.as_micros().max(1);
    let span = end_us.saturating_sub(start_us);
    let bucket_count = span.div_ceil(interval_us).max(1) as usize;

    let mut co2_values: Vec<Vec<f32>> = vec![Vec::new(); bucket_count];
    let mut temp_values: Vec<Vec<f32>> = vec![Vec::new(); bucket_count];
    let mut humidity_values: Vec<Vec<f32>> = vec![Vec::new(); bucket_count];

    for reading in readings {
        if reading.timestamp_us < start_us || reading.timestamp_us >= end_us {
            continue;
        }
        let offset = reading.timestamp_us - start_us;
        // Clamp: a reading exactly at `end_us` would otherwise land one
        // bucket past the last one created by the ceiling-division above.
        let index = ((offset / interval_us) as usize).min(bucket_count - 1);
        if let Some(v) = reading.co2_ppm {
            co2_values[index].push(v);
        }
        if let Some(v) = reading.temperature_c {
            temp_values[index].push(v);
        }
        if let Some(v) = reading.humidity_percent {
            humidity_values[index].push(v);
        }
    }

    (0..bucket_count)
        .map(|i| Bucket {
            bucket_start_us: start_us + i as u64 * interval_us,
            co2_ppm: FieldStats::from_values(&co2_values[i]),
            temperature_c: FieldStats::from_values(&temp_values[i]),
            humidity_percent: FieldStats::from_values(&humidity_values[i]),
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::QualityFlags;

    fn reading_with_co2(ts: u64, co2: f32) -> Reading {
        Reading {
            timestamp_us: ts,
            co2_ppm: Some(co2),
            temperature_c: None,
            humidity_percent: None,
            quality_flags: QualityFlags::CO2_VALID,
        }
    }

    #[test]
    fn single_bucket_stats() {
        let start = 0u64;
        let end = 3_600_000_000u64; // 1 hour in microseconds
        let readings: Vec<Reading> = [400.0, 405.0, 410.0, 415.0, 420.0, 425.0]
            .into_iter()
            .enumerate()
            .map(|(i, co2)| reading_with_co2(i as u64 * 1000, co2))
            .collect();

        let interval = Interval::parse("1H").unwrap();
        let buckets = aggregate(&readings, start, end, interval);
        assert_eq!(buckets.len(), 1);
        let bucket = &buckets[0];
        assert_eq!(bucket.co2_ppm.min, Some(400.0));
        assert_eq!(bucket.co2_ppm.max, Some(425.0));
        assert_eq!(bucket.co2_ppm.mean, Some(412.5));
        assert_eq!(bucket.co2_ppm.count, 6);
    }

    #[test]
    fn empty_bucket_has_zero_count_and_null_stats() {
        let buckets = aggregate(&[], 0, 3_600_000_000, Interval::parse("1H").unwrap());
        assert_eq!(buckets.len(), 1);
        assert_eq!(buckets[0].co2_ppm.count, 0);
        assert_eq!(buckets[0].co2_ppm.min, None);
    }

    #[test]
    fn multiple_buckets_in_order() {
        let one_hour_us = 3_600_000_000u64;
        let readings = vec![
            reading_with_co2(0, 400.0),
            reading_with_co2(one_hour_us, 500.0),
            reading_with_co2(one_hour_us * 2, 600.0),
        ];
        let buckets = aggregate(&readings, 0, one_hour_us * 3, Interval::parse("1H").unwrap());
        assert_eq!(buckets.len(), 3);
        assert_eq!(buckets[0].bucket_start_us, 0);
        assert_eq!(buckets[1].bucket_start_us, one_hour_us);
        assert_eq!(buckets[2].bucket_start_us, one_hour_us * 2);
        assert_eq!(buckets[0].co2_ppm.mean, Some(400.0));
        assert_eq!(buckets[1].co2_ppm.mean, Some(500.0));
        assert_eq!(buckets[2].co2_ppm.mean, Some(600.0));
    }

    #[test]
    fn interval_parsing() {
        assert_eq!(Interval::parse("1H").unwrap().as_micros(), 3_600_000_000);
        assert_eq!(Interval::parse("30T").unwrap().as_micros(), 30 * 60 * 1_000_000);
        assert_eq!(Interval::parse("1D").unwrap().as_micros(), 86_400 * 1_000_000);
        assert!(Interval::parse("abc").is_none());
        assert!(Interval::parse("0H").is_none());
        assert!(Interval::parse("").is_none());
    }

    #[test]
    fn interval_must_divide_range_evenly() {
        let interval = Interval::parse("1H").unwrap();
        assert!(interval.divides_evenly(0, 3_600_000_000 * 2));
        assert!(!interval.divides_evenly(0, 3_600_000_000 + 1));
    }
}
