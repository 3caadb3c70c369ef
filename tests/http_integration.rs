//! End-to-end HTTP query surface tests: a real `TcpListener` driven by
//! `http::serve`, queried over real `TcpStream` connections, backed by a
//! real on-disk store.

use std::io::{Read, Write};
use std::net::{IpAddr, Ipv4Addr, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;

use sensor_daemon::config::AlertSettings;
use sensor_daemon::health::{HealthMonitor, NullNotifier};
use sensor_daemon::http::{self, AppState};
use sensor_daemon::reading::{QualityFlags, Reading};
use sensor_daemon::storage::TimeSeriesStore;
use tempfile::TempDir;

/// Spin up the HTTP surface on `port` against a fresh store, run `body`
/// against it, then request shutdown and join the listener thread.
fn with_server(port: u16, seed: impl FnOnce(&TimeSeriesStore), body: impl FnOnce()) {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        TimeSeriesStore::open(dir.path(), Duration::from_secs(3600 * 24 * 365)).unwrap(),
    );
    seed(&store);

    let health = Arc::new(HealthMonitor::new(
        AlertSettings::default(),
        Box::new(NullNotifier),
    ));
    let state = Arc::new(AppState::new(Arc::clone(&store), health));
    let shutdown = Arc::new(AtomicBool::new(false));

    let bind_addr = IpAddr::V4(Ipv4Addr::LOCALHOST);
    let server_shutdown = Arc::clone(&shutdown);
    let handle = std::thread::spawn(move || {
        http::serve(bind_addr, port, state, server_shutdown).unwrap();
    });

    // Give the listener a moment to bind before the test issues requests.
    std::thread::sleep(Duration::from_millis(100));

    body();

    shutdown.store(true, Ordering::SeqCst);
    handle.join().unwrap();
}

/// Issue `GET <path>` and return `(status_code, body)`.
fn get(port: u16, path: &str) -> (u16, String) {
    let mut stream = TcpStream::connect(("127.0.0.1", port)).unwrap();
    stream
        .write_all(format!("GET {path} HTTP/1.1\r\nHost: localhost\r\n\r\n").as_bytes())
        .unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();

    let status_line = response.lines().next().unwrap();
    let status_code: u16 = status_line
        .split_whitespace()
        .nth(1)
        .unwrap()
        .parse()
        .unwrap();
    let body = response.split("\r\n\r\n").nth(1).unwrap_or("").to_string();
    (status_code, body)
}

fn sample_reading(ts: u64) -> Reading {
    Reading {
        timestamp_us: ts,
        co2_ppm: Some(450.5),
        temperature_c: Some(23.2),
        humidity_percent: Some(65.8),
        quality_flags: QualityFlags::CO2_VALID | QualityFlags::TEMP_VALID | QualityFlags::HUMIDITY_VALID,
    }
}

#[test]
fn health_endpoint_reports_operational_status() {
    with_server(18_180, |_store| {}, || {
        let (status, body) = get(18_180, "/health");
        assert_eq!(status, 200);
        assert!(body.contains("\"status\""));
    });
}

#[test]
fn unknown_path_returns_404_with_available_endpoints() {
    with_server(18_181, |_store| {}, || {
        let (status, body) = get(18_181, "/nope");
        assert_eq!(status, 404);
        assert!(body.contains("available_endpoints"));
        assert!(body.contains("/data/recent"));
    });
}

#[test]
fn recent_endpoint_returns_seeded_readings() {
    with_server(
        18_182,
        |store| {
            store.put(&sample_reading(1_700_000_000_000_000)).unwrap();
            store.put(&sample_reading(1_700_000_001_000_000)).unwrap();
        },
        || {
            let (status, body) = get(18_182, "/data/recent?count=10");
            assert_eq!(status, 200);
            assert!(body.contains("\"total_count\":2"));
        },
    );
}

#[test]
fn recent_endpoint_rejects_invalid_count() {
    with_server(18_183, |_store| {}, || {
        let (status, body) = get(18_183, "/data/recent?count=0");
        assert_eq!(status, 400);
        assert!(body.contains("INVALID_COUNT"));

        let (status, _) = get(18_183, "/data/recent?count=10001");
        assert_eq!(status, 400);
    });
}

#[test]
fn range_endpoint_rejects_end_before_start() {
    with_server(18_184, |_store| {}, || {
        let (status, body) = get(
            18_184,
            "/data/range?start=2024-01-02T00:00:00Z&end=2024-01-01T00:00:00Z",
        );
        assert_eq!(status, 400);
        assert!(body.contains("INVALID_RANGE"));
    });
}

#[test]
fn aggregates_endpoint_buckets_seeded_readings() {
    with_server(
        18_185,
        |store| {
            let base = 1_704_067_200_000_000u64; // 2024-01-01T00:00:00Z
            for (i, co2) in [400.0, 405.0, 410.0, 415.0, 420.0, 425.0].into_iter().enumerate() {
                let reading = Reading {
                    timestamp_us: base + i as u64 * 1_000_000,
                    co2_ppm: Some(co2),
                    temperature_c: None,
                    humidity_percent: None,
                    quality_flags: QualityFlags::CO2_VALID,
                };
                store.put(&reading).unwrap();
            }
        },
        || {
            let (status, body) = get(
                18_185,
                "/data/aggregates?start=2024-01-01T00:00:00Z&end=2024-01-01T01:00:00Z&interval=1H",
            );
            assert_eq!(status, 200);
            assert!(body.contains("\"co2_ppm_min\":400.0"));
            assert!(body.contains("\"co2_ppm_max\":425.0"));
            assert!(body.contains("\"co2_ppm_count\":6"));
        },
    );
}

#[test]
fn non_get_method_is_rejected_with_405() {
    let dir = TempDir::new().unwrap();
    let store = Arc::new(
        TimeSeriesStore::open(dir.path(), Duration::from_secs(3600 * 24 * 365)).unwrap(),
    );
    let health = Arc::new(HealthMonitor::new(
        AlertSettings::default(),
        Box::new(NullNotifier),
    ));
    let state = Arc::new(AppState::new(Arc::clone(&store), health));
    let shutdown = Arc::new(AtomicBool::new(false));
    let server_shutdown = Arc::clone(&shutdown);
    let handle = std::thread::spawn(move || {
        http::serve(IpAddr::V4(Ipv4Addr::LOCALHOST), 18_186, state, server_shutdown).unwrap();
    });
    std::thread::sleep(Duration::from_millis(100));

    let mut stream = TcpStream::connect(("127.0.0.1", 18_186)).unwrap();
    stream
        .write_all(b"POST /data/recent HTTP/1.1\r\nHost: localhost\r\n\r\n")
        .unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(5))).unwrap();
    let mut response = String::new();
    stream.read_to_string(&mut response).unwrap();
    assert!(response.starts_with("HTTP/1.1 405"));
    assert!(response.contains("Allow: GET"));

    shutdown.store(true, Ordering::SeqCst);
    handle.join().unwrap();
}

#[test]
fn suspicious_query_string_is_rejected() {
    with_server(18_187, |_store| {}, || {
        let (status, body) = get(18_187, "/data/recent?count=<script>alert(1)</script>");
        assert_eq!(status, 400);
        assert!(body.contains("SUSPICIOUS_QUERY"));
    });
}
