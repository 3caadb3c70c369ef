//! HTTP query surface (F): a minimal HTTP/1.1 server over
//! `std::net::TcpListener`, one short-lived worker thread per accepted
//! connection.
//!
//! Hand-assembled byte-level framing rather than a framework: bit-exact
//! status-line/header control and a hard request-size cap are easier to
//! guarantee directly than through a general-purpose HTTP library.

pub mod ratelimit;
pub mod request;
pub mod response;

use std::io::{Read, Write};
use std::net::{IpAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use serde_json::json;

use crate::aggregate::{self, Interval};
use crate::health::HealthMonitor;
use crate::storage::cache::{QueryPerfMonitor, RecentCache};
use crate::storage::{TimeSeriesStore, MAX_RANGE_RESULTS, MAX_RECENT_COUNT};

use self::ratelimit::{RateLimitDecision, RateLimiter};
use self::request::{parse_request, HttpError, MAX_REQUEST_HEADER_BYTES};
use self::response::{aggregates_body, error_body, readings_body, write_response};

const MAX_RANGE_SPAN_SECONDS: u64 = 7 * 24 * 3600;
const DEFAULT_RECENT_COUNT: usize = 100;
const DEFAULT_INTERVAL: &str = "1H";

const ROUTES: &[&str] = &[
    "/health",
    "/metrics",
    "/diagnostic",
    "/ready",
    "/alive",
    "/data/recent",
    "/data/range",
    "/data/aggregates",
    "/data/info",
];

/// Everything an HTTP worker thread needs, shared read-only with the
/// acquisition loop via an `Arc` to a store that is internally
/// synchronized.
pub struct AppState {
    pub store: Arc<TimeSeriesStore>,
    pub cache: Arc<RecentCache>,
    pub perf: Arc<QueryPerfMonitor>,
    pub health: Arc<HealthMonitor>,
    pub rate_limiter: Arc<RateLimiter>,
    pub started_at: Instant,
}

impl AppState {
    pub fn new(
        store: Arc<TimeSeriesStore>,
        health: Arc<HealthMonitor>,
    ) -> Self {
        Self {
            store,
            cache: Arc::new(RecentCache::new()),
            perf: Arc::new(QueryPerfMonitor::new()),
            health,
            rate_limiter: Arc::new(RateLimiter::new()),
            started_at: Instant::now(),
        }
    }
}

/// Run the HTTP listener loop until `shutdown` is set. Polls `accept` with
/// a short timeout so shutdown latency stays bounded, handing each
/// accepted connection to a short-lived worker thread.
pub fn serve(
    bind_addr: IpAddr,
    port: u16,
    state: Arc<AppState>,
    shutdown: Arc<AtomicBool>,
) -> std::io::Result<()> {
    let listener = TcpListener::bind((bind_addr, port))?;
    listener.set_nonblocking(true)?;
    tracing::info!(%bind_addr, port, "http listener bound");

    while !shutdown.load(Ordering::SeqCst) {
        match listener.accept() {
            Ok((stream, peer)) => {
                let state = Arc::clone(&state);
                std::thread::spawn(move || handle_connection(stream, peer.ip(), &state));
            }
            Err(e) if e.kind() == std::io::ErrorKind::WouldBlock => {
                std::thread::sleep(Duration::from_millis(200));
            }
            Err(e) => {
                tracing::warn!(error = %e, "http accept failed");
                std::thread::sleep(Duration::from_millis(200));
            }
        }
    }
    Ok(())
}

fn handle_connection(mut stream: TcpStream, peer_ip: IpAddr, state: &AppState) {
    let _ = stream.set_nonblocking(false);
    let head = match read_request_head(&mut stream) {
        Ok(head) => head,
        Err(ReadError::TooLarge) => {
            send_error(
                &mut stream,
                400,
                "request too large",
                "REQUEST_TOO_LARGE",
                "request line and headers exceeded 8KB",
                "reduce header/query size",
            );
            return;
        }
        Err(ReadError::Io(_)) | Err(ReadError::Closed) => return,
    };

    match state.rate_limiter.check(peer_ip) {
        RateLimitDecision::Allow => {}
        RateLimitDecision::Deny { retry_after_secs } => {
            send_rate_limited(&mut stream, retry_after_secs);
            return;
        }
    }

    let parsed = match parse_request(&head) {
        Ok(parsed) => parsed,
        Err(HttpError::TooLarge) => {
            send_error(
                &mut stream,
                400,
                "request too large",
                "REQUEST_TOO_LARGE",
                "request line and headers exceeded 8KB",
                "reduce header/query size",
            );
            return;
        }
        Err(HttpError::SuspiciousQuery) => {
            send_error(
                &mut stream,
                400,
                "invalid query string",
                "SUSPICIOUS_QUERY",
                "query string matched a known injection pattern",
                "remove special characters from query parameters",
            );
            return;
        }
        Err(HttpError::Malformed) => {
            send_error(
                &mut stream,
                400,
                "malformed request",
                "MALFORMED_REQUEST",
                "could not parse request line",
                "send a well-formed HTTP/1.1 GET request",
            );
            return;
        }
    };

    if parsed.method != "GET" {
        let body = error_body(
            "method not allowed",
            "METHOD_NOT_ALLOWED",
            &format!("method {} is not supported", parsed.method),
            "use GET",
            405,
        );
        let bytes = serde_json::to_vec(&body).unwrap_or_default();
        let _ = write_response(&mut stream, 405, &bytes, &[("Allow", "GET".to_string())]);
        return;
    }

    route(&mut stream, state, &parsed.path, &parsed.query);
}

enum ReadError {
    TooLarge,
    Io(std::io::Error),
    Closed,
}

/// Read request-line + headers up to the terminating blank line, refusing
/// anything over [`MAX_REQUEST_HEADER_BYTES`].
fn read_request_head(stream: &mut TcpStream) -> Result<String, ReadError> {
    let mut buf = Vec::with_capacity(1024);
    let mut chunk = [0u8; 512];
    loop {
        if buf.len() > MAX_REQUEST_HEADER_BYTES {
            return Err(ReadError::TooLarge);
        }
        if buf.windows(4).any(|w| w == b"\r\n\r\n") {
            break;
        }
        let n = stream.read(&mut chunk).map_err(ReadError::Io)?;
        if n == 0 {
            if buf.is_empty() {
                return Err(ReadError::Closed);
            }
            break;
        }
        buf.extend_from_slice(&chunk[..n]);
    }
    if buf.len() > MAX_REQUEST_HEADER_BYTES {
        return Err(ReadError::TooLarge);
    }
    Ok(String::from_utf8_lossy(&buf).into_owned())
}

fn route(
    stream: &mut TcpStream,
    state: &AppState,
    path: &str,
    query: &std::collections::HashMap<String, String>,
) {
    match path {
        "/health" => handle_health(stream, state),
        "/metrics" => handle_metrics(stream, state),
        "/diagnostic" => handle_diagnostic(stream, state),
        "/ready" => handle_ready(stream, state),
        "/alive" => handle_alive(stream, state),
        "/data/recent" => handle_recent(stream, state, query),
        "/data/range" => handle_range(stream, state, query),
        "/data/aggregates" => handle_aggregates(stream, state, query),
        "/data/info" => handle_info(stream, state),
        _ => handle_not_found(stream),
    }
}

fn handle_health(stream: &mut TcpStream, state: &AppState) {
    let status = state.health.check_all();
    let body = json!({
        "status": status.overall_status.as_str(),
        "operational": status.overall_status.is_operational(),
        "last_check": response::format_system_time(status.last_check),
    });
    send_json(stream, 200, &body);
}

fn handle_metrics(stream: &mut TcpStream, state: &AppState) {
    let metrics = &state.health.metrics;
    let cache_stats = state.cache.stats();
    let query_metrics = state.perf.snapshot();
    let body = json!({
        "sensor_successes": metrics.sensor_successes.load(std::sync::atomic::Ordering::Relaxed),
        "sensor_failures": metrics.sensor_failures.load(std::sync::atomic::Ordering::Relaxed),
        "storage_successes": metrics.storage_successes.load(std::sync::atomic::Ordering::Relaxed),
        "storage_failures": metrics.storage_failures.load(std::sync::atomic::Ordering::Relaxed),
        "i2c_connection_failures": metrics.i2c_connection_failures.load(std::sync::atomic::Ordering::Relaxed),
        "rss_bytes": metrics.rss_bytes(),
        "cpu_percent": metrics.cpu_percent(),
        "uptime_seconds": metrics.uptime().as_secs(),
        "sensor_success_rate": metrics.sensor_success_rate(),
        "storage_success_rate": metrics.storage_success_rate(),
        "sensor_success_rate_1h": metrics.sensor_success_rate_1h(),
        "sensor_success_rate_24h": metrics.sensor_success_rate_24h(),
        "sensor_avg_duration_ms_24h": metrics.sensor_avg_duration_ms_24h(),
        "storage_success_rate_1h": metrics.storage_success_rate_1h(),
        "storage_success_rate_24h": metrics.storage_success_rate_24h(),
        "storage_avg_duration_ms_24h": metrics.storage_avg_duration_ms_24h(),
        "i2c_connection_failures_1h": metrics.i2c_connection_failures_1h(),
        "i2c_connection_failures_24h": metrics.i2c_connection_failures_24h(),
        "cache": {
            "hits": cache_stats.hits,
            "misses": cache_stats.misses,
            "evictions": cache_stats.evictions,
            "total_requests": cache_stats.total_requests,
            "hit_ratio": cache_stats.hit_ratio(),
        },
        "query_types": query_metrics.iter().map(|(name, m)| {
            (name.clone(), json!({
                "total_count": m.total_count,
                "avg_duration_ms": m.avg_duration_ms(),
                "slow_count": m.slow_count,
                "cached_count": m.cached_count,
                "failure_count": m.failure_count,
            }))
        }).collect::<serde_json::Map<_, _>>(),
    });
    send_json(stream, 200, &body);
}

fn handle_diagnostic(stream: &mut TcpStream, state: &AppState) {
    let status = state.health.check_all();
    let events = state.health.events.snapshot();
    let info = state.store.info();
    let body = json!({
        "status": status.overall_status.as_str(),
        "components": status.component_results.iter().map(|r| json!({
            "component_name": r.component_name,
            "status": r.status.as_str(),
            "message": r.message,
            "detail": r.detail,
        })).collect::<Vec<_>>(),
        "events": events.iter().rev().take(20).map(|e| json!({
            "component_name": e.component_name,
            "status": e.status.as_str(),
            "message": e.message,
        })).collect::<Vec<_>>(),
        "store": {
            "total_records_estimate": info.total_records_estimate,
            "db_size_bytes": info.db_size_bytes,
            "healthy": info.healthy,
        },
    });
    send_json(stream, 200, &body);
}

fn handle_ready(stream: &mut TcpStream, state: &AppState) {
    let status = state.health.check_all();
    if status.overall_status.is_operational() && state.store.health() {
        send_json(stream, 200, &json!({"ready": true}));
    } else {
        send_json(stream, 503, &json!({"ready": false}));
    }
}

fn handle_alive(stream: &mut TcpStream, state: &AppState) {
    let uptime = state.started_at.elapsed().as_secs();
    send_json(stream, 200, &json!({"alive": true, "uptime_seconds": uptime}));
}

fn handle_recent(stream: &mut TcpStream, state: &AppState, query: &std::collections::HashMap<String, String>) {
    let mut timer = state.perf.start("recent");
    let count_param = query.get("count").map(String::as_str).unwrap_or("");
    let count = if count_param.is_empty() {
        DEFAULT_RECENT_COUNT
    } else {
        match count_param.parse::<i64>() {
            Ok(n) if n >= 1 && n <= MAX_RECENT_COUNT as i64 => n as usize,
            _ => {
                timer.mark_failed();
                return send_validation_error(
                    stream,
                    "invalid count parameter",
                    "INVALID_COUNT",
                    &format!("count must be a positive integer <= {MAX_RECENT_COUNT}, got '{count_param}'"),
                    "pass count between 1 and 10000",
                );
            }
        }
    };

    if let Some(cached) = state.cache.get(count) {
        timer.mark_cached();
        return send_json(stream, 200, &readings_body(&cached));
    }

    match state.store.get_recent(count) {
        Ok(readings) => {
            state.cache.put(count, readings.clone());
            send_json(stream, 200, &readings_body(&readings));
        }
        Err(err) => {
            timer.mark_failed();
            crate::storage::log_storage_error("get_recent", &err);
            send_json(stream, 503, &json!({"error": "storage unavailable"}));
        }
    }
}

fn handle_range(stream: &mut TcpStream, state: &AppState, query: &std::collections::HashMap<String, String>) {
    let mut timer = state.perf.start("range");
    let (start_us, end_us) = match parse_and_validate_range(query) {
        Ok(bounds) => bounds,
        Err((message, code, details, suggestion)) => {
            timer.mark_failed();
            return send_validation_error(stream, message, code, &details, suggestion);
        }
    };

    match state.store.get_range(start_us, end_us, Some(MAX_RANGE_RESULTS)) {
        Ok(readings) => send_json(stream, 200, &readings_body(&readings)),
        Err(err) => {
            timer.mark_failed();
            crate::storage::log_storage_error("get_range", &err);
            send_json(stream, 503, &json!({"error": "storage unavailable"}));
        }
    }
}

fn handle_aggregates(stream: &mut TcpStream, state: &AppState, query: &std::collections::HashMap<String, String>) {
    let mut timer = state.perf.start("aggregate");
    let (start_us, end_us) = match parse_and_validate_range(query) {
        Ok(bounds) => bounds,
        Err((message, code, details, suggestion)) => {
            timer.mark_failed();
            return send_validation_error(stream, message, code, &details, suggestion);
        }
    };

    let interval_label = query
        .get("interval")
        .map(String::as_str)
        .unwrap_or(DEFAULT_INTERVAL);
    let interval = match Interval::parse(interval_label) {
        Some(interval) if interval.divides_evenly(start_us, end_us) => interval,
        Some(_) => {
            timer.mark_failed();
            return send_validation_error(
                stream,
                "interval does not divide the query range evenly",
                "INVALID_INTERVAL",
                &format!("interval '{interval_label}' must evenly divide [start, end]"),
                "choose an interval that evenly divides the range",
            );
        }
        None => {
            timer.mark_failed();
            return send_validation_error(
                stream,
                "invalid interval parameter",
                "INVALID_INTERVAL",
                &format!("interval '{interval_label}' does not match ^\\d+[TMHD]$"),
                "use a pattern like 1H, 30T, or 1D",
            );
        }
    };

    match state.store.get_range(start_us, end_us, Some(MAX_RANGE_RESULTS)) {
        Ok(readings) => {
            let buckets = aggregate::aggregate(&readings, start_us, end_us, interval);
            send_json(stream, 200, &aggregates_body(&buckets, start_us, end_us, interval_label));
        }
        Err(err) => {
            timer.mark_failed();
            crate::storage::log_storage_error("get_range", &err);
            send_json(stream, 503, &json!({"error": "storage unavailable"}));
        }
    }
}

fn handle_info(stream: &mut TcpStream, state: &AppState) {
    let mut timer = state.perf.start("info");
    let info = state.store.info();
    if !info.healthy {
        timer.mark_failed();
    }
    let body = json!({
        "total_records_estimate": info.total_records_estimate,
        "earliest_timestamp": info.earliest_ts.map(response::format_timestamp_us),
        "latest_timestamp": info.latest_ts.map(response::format_timestamp_us),
        "db_size_bytes": info.db_size_bytes,
        "healthy": info.healthy,
        "path": state.store.path().display().to_string(),
    });
    send_json(stream, 200, &body);
}

fn handle_not_found(stream: &mut TcpStream) {
    let body = json!({
        "error": "not found",
        "error_code": "NOT_FOUND",
        "available_endpoints": ROUTES,
    });
    send_json(stream, 404, &body);
}

/// Parse and validate `start`/`end` query parameters shared by
/// `/data/range` and `/data/aggregates`.
fn parse_and_validate_range(
    query: &std::collections::HashMap<String, String>,
) -> Result<(u64, u64), (&'static str, &'static str, String, &'static str)> {
    let start_raw = query.get("start").map(String::as_str).unwrap_or("");
    let end_raw = query.get("end").map(String::as_str).unwrap_or("");

    let start_us = parse_iso8601_us(start_raw).ok_or((
        "invalid start parameter",
        "INVALID_START",
        format!("start '{start_raw}' is not a valid ISO-8601 UTC timestamp (expect e.g. 2024-01-01T00:00:00Z)"),
        "pass start as ISO-8601 with a Z suffix",
    ))?;
    let end_us = parse_iso8601_us(end_raw).ok_or((
        "invalid end parameter",
        "INVALID_END",
        format!("end '{end_raw}' is not a valid ISO-8601 UTC timestamp (expect e.g. 2024-01-01T00:00:00Z)"),
        "pass end as ISO-8601 with a Z suffix",
    ))?;

    if start_us > end_us {
        return Err((
            "start must be <= end",
            "INVALID_RANGE",
            format!("start {start_raw} is after end {end_raw}"),
            "swap start and end, or widen the range",
        ));
    }

    let span_us = end_us - start_us;
    if span_us > MAX_RANGE_SPAN_SECONDS * 1_000_000 {
        return Err((
            "range exceeds maximum span",
            "RANGE_TOO_WIDE",
            format!("range spans more than {MAX_RANGE_SPAN_SECONDS} seconds (7 days)"),
            "narrow the start/end range to 7 days or less",
        ));
    }

    Ok((start_us, end_us))
}

/// Parse an ISO-8601 timestamp with a `T` separator and `Z` suffix into
/// microseconds since epoch.
fn parse_iso8601_us(raw: &str) -> Option<u64> {
    if !raw.ends_with('Z') || !raw.contains('T') {
        return None;
    }
    let parsed = chrono::DateTime::parse_from_rfc3339(raw).ok()?;
    let micros = parsed.timestamp_micros();
    if micros < 0 {
        return None;
    }
    Some(micros as u64)
}

fn send_json(stream: &mut TcpStream, status: u16, body: &serde_json::Value) {
    let bytes = serde_json::to_vec(body).unwrap_or_else(|_| b"{}".to_vec());
    let _ = write_response(stream, status, &bytes, &[]);
}

fn send_validation_error(
    stream: &mut TcpStream,
    error: &str,
    error_code: &str,
    details: &str,
    suggestion: &str,
) {
    send_error(stream, 400, error, error_code, details, suggestion);
}

fn send_error(
    stream: &mut TcpStream,
    status: u16,
    error: &str,
    error_code: &str,
    details: &str,
    suggestion: &str,
) {
    let body = error_body(error, error_code, details, suggestion, status);
    let bytes = serde_json::to_vec(&body).unwrap_or_default();
    let _ = write_response(stream, status, &bytes, &[]);
}

fn send_rate_limited(stream: &mut TcpStream, retry_after_secs: u64) {
    let body = error_body(
        "rate limit exceeded",
        "RATE_LIMITED",
        "too many requests from this client",
        "retry after the indicated number of seconds",
        429,
    );
    let bytes = serde_json::to_vec(&body).unwrap_or_default();
    let _ = write_response(
        stream,
        429,
        &bytes,
        &[("Retry-After", retry_after_secs.to_string())],
    );
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn iso8601_parses_utc_z_suffix() {
        assert_eq!(
            parse_iso8601_us("2024-01-01T00:00:00Z"),
            Some(1_704_067_200_000_000)
        );
    }

    #[test]
    fn iso8601_rejects_missing_z_suffix() {
        assert_eq!(parse_iso8601_us("2024-01-01T00:00:00"), None);
    }

    #[test]
    fn range_rejects_end_before_start() {
        let mut query = std::collections::HashMap::new();
        query.insert("start".to_string(), "2024-01-02T00:00:00Z".to_string());
        query.insert("end".to_string(), "2024-01-01T00:00:00Z".to_string());
        let result = parse_and_validate_range(&query);
        assert!(result.is_err());
    }

    #[test]
    fn range_rejects_span_over_seven_days() {
        let mut query = std::collections::HashMap::new();
        query.insert("start".to_string(), "2024-01-01T00:00:00Z".to_string());
        query.insert("end".to_string(), "2024-01-10T00:00:00Z".to_string());
        let result = parse_and_validate_range(&query);
        assert!(result.is_err());
    }

    #[test]
    fn range_accepts_valid_bounds() {
        let mut query = std::collections::HashMap::new();
        query.insert("start".to_string(), "2024-01-01T00:00:00Z".to_string());
        query.insert("end".to_string(), "2024-01-02T00:00:00Z".to_string());
        let result = parse_and_validate_range(&query);
        assert!(result.is_ok());
    }
}
