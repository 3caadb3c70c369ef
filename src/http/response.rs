//! JSON body builders and the raw status-line/header writer: bit-exact
//! status lines and header sets for every response this server sends.

use std::io::{self, Write};
use std::time::{SystemTime, UNIX_EPOCH};

use chrono::{DateTime, SecondsFormat, Utc};
use serde_json::{json, Value};

use crate::aggregate::Bucket;
use crate::reading::Reading;

/// Render a microsecond-since-epoch timestamp as ISO-8601 UTC with a `Z`
/// suffix, e.g. `2024-01-01T00:00:00.000000Z`.
pub fn format_timestamp_us(timestamp_us: u64) -> String {
    DateTime::<Utc>::from_timestamp_micros(timestamp_us as i64)
        .unwrap_or_else(|| DateTime::<Utc>::from(UNIX_EPOCH))
        .to_rfc3339_opts(SecondsFormat::Micros, true)
}

pub fn format_system_time(time: SystemTime) -> String {
    let us = time
        .duration_since(UNIX_EPOCH)
        .unwrap_or_default()
        .as_micros() as u64;
    format_timestamp_us(us)
}

fn reading_json(reading: &Reading) -> Value {
    json!({
        "timestamp": format_timestamp_us(reading.timestamp_us),
        "co2_ppm": reading.co2_ppm,
        "temperature_c": reading.temperature_c,
        "humidity_percent": reading.humidity_percent,
        "quality_flags": reading.quality_flags.bits(),
    })
}

/// `{"readings":[...], "total_count":n}` body for `/data/recent` and
/// `/data/range`.
pub fn readings_body(readings: &[Reading]) -> Value {
    json!({
        "readings": readings.iter().map(reading_json).collect::<Vec<_>>(),
        "total_count": readings.len(),
    })
}

/// `{"timestamp":..., "<field>_mean":..., ...}` per bucket, plus top-level
/// range/interval metadata for `/data/aggregates`.
pub fn aggregates_body(
    buckets: &[Bucket],
    start_us: u64,
    end_us: u64,
    interval_label: &str,
) -> Value {
    let bucket_values: Vec<Value> = buckets
        .iter()
        .map(|bucket| {
            json!({
                "timestamp": format_timestamp_us(bucket.bucket_start_us),
                "co2_ppm_min": bucket.co2_ppm.min,
                "co2_ppm_mean": bucket.co2_ppm.mean,
                "co2_ppm_max": bucket.co2_ppm.max,
                "co2_ppm_count": bucket.co2_ppm.count,
                "temperature_c_min": bucket.temperature_c.min,
                "temperature_c_mean": bucket.temperature_c.mean,
                "temperature_c_max": bucket.temperature_c.max,
                "temperature_c_count": bucket.temperature_c.count,
                "humidity_percent_min": bucket.humidity_percent.min,
                "humidity_percent_mean": bucket.humidity_percent.mean,
                "humidity_percent_max": bucket.humidity_percent.max,
                "humidity_percent_count": bucket.humidity_percent.count,
            })
        })
        .collect();

    json!({
        "buckets": bucket_values,
        "start_time": format_timestamp_us(start_us),
        "end_time": format_timestamp_us(end_us),
        "interval": interval_label,
        "total_intervals": buckets.len(),
    })
}

/// Structured 4xx/5xx error body with a stable `error_code`.
pub fn error_body(
    error: &str,
    error_code: &str,
    details: &str,
    suggestion: &str,
    status_code: u16,
) -> Value {
    json!({
        "error": error,
        "error_code": error_code,
        "details": details,
        "suggestion": suggestion,
        "context": {},
        "timestamp": format_system_time(SystemTime::now()),
        "status_code": status_code,
    })
}

pub fn reason_phrase(status: u16) -> &'static str {
    match status {
        200 => "OK",
        400 => "Bad Request",
        404 => "Not Found",
        405 => "Method Not Allowed",
        429 => "Too Many Requests",
        503 => "Service Unavailable",
        500 => "Internal Server Error",
        _ => "Unknown",
    }
}

/// Write a bit-exact HTTP/1.1 response: status line, the four fixed
/// headers, any extra headers, then the body.
pub fn write_response(
    stream: &mut impl Write,
    status: u16,
    body: &[u8],
    extra_headers: &[(&str, String)],
) -> io::Result<()> {
    let mut head = format!(
        "HTTP/1.1 {status} {}\r\n\
         Content-Type: application/json\r\n\
         Connection: close\r\n\
         Access-Control-Allow-Origin: *\r\n",
        reason_phrase(status)
    );
    for (name, value) in extra_headers {
        head.push_str(name);
        head.push_str(": ");
        head.push_str(value);
        head.push_str("\r\n");
    }
    head.push_str(&format!("Content-Length: {}\r\n\r\n", body.len()));

    stream.write_all(head.as_bytes())?;
    stream.write_all(body)?;
    stream.flush()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::reading::QualityFlags;

    #[test]
    fn formats_known_timestamp() {
        // 2024-01-01T00:00:00Z in microseconds since epoch.
        let us = 1_704_067_200_000_000u64;
        assert_eq!(format_timestamp_us(us), "2024-01-01T00:00:00.000000Z");
    }

    #[test]
    fn readings_body_shape() {
        let reading = Reading {
            timestamp_us: 1_700_000_000_000_000,
            co2_ppm: Some(450.5),
            temperature_c: None,
            humidity_percent: Some(65.8),
            quality_flags: QualityFlags::CO2_VALID,
        };
        let body = readings_body(&[reading]);
        assert_eq!(body["total_count"], 1);
        assert_eq!(body["readings"][0]["co2_ppm"], 450.5);
        assert!(body["readings"][0]["temperature_c"].is_null());
    }

    #[test]
    fn write_response_produces_expected_head() {
        let mut buf = Vec::new();
        write_response(&mut buf, 200, b"{}", &[]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.starts_with("HTTP/1.1 200 OK\r\n"));
        assert!(text.contains("Content-Type: application/json\r\n"));
        assert!(text.contains("Connection: close\r\n"));
        assert!(text.contains("Access-Control-Allow-Origin: *\r\n"));
        assert!(text.contains("Content-Length: 2\r\n"));
        assert!(text.ends_with("{}"));
    }

    #[test]
    fn write_response_includes_extra_headers() {
        let mut buf = Vec::new();
        write_response(&mut buf, 429, b"{}", &[("Retry-After", "60".to_string())]).unwrap();
        let text = String::from_utf8(buf).unwrap();
        assert!(text.contains("Retry-After: 60\r\n"));
    }
}
