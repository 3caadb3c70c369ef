//! Daemon control loop (I): paces sampling, drives transport -> codec ->
//! store, handles signals, and coordinates shutdown.
//!
//! The shutdown flag is a token owned by the control loop rather than a
//! global, flipped by `signal-hook`'s flag API on `SIGTERM`/`SIGINT`.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use embedded_hal::i2c::I2c;

use crate::config::DaemonConfig;
use crate::health::{HealthCheckResult, HealthMonitor, HealthStatus, SystemHealthStatus};
use crate::http::{self, AppState};
use crate::sensor::transport::{StdDelay, Transport, TransportError};
use crate::storage::TimeSeriesStore;

const TICK_SLEEP_INCREMENT: Duration = Duration::from_millis(100);
const GAUGE_REFRESH_INTERVAL: Duration = Duration::from_secs(5 * 60);
const CLEANUP_INTERVAL: Duration = Duration::from_secs(60 * 60);
const HARD_MEMORY_LIMIT_BYTES: u64 = 10 * 1024 * 1024;

/// Shared shutdown flag, flipped by signal handlers or an explicit
/// `request_shutdown()` call, polled by every long-running loop.
#[derive(Clone, Default)]
pub struct ShutdownToken(Arc<AtomicBool>);

impl ShutdownToken {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn is_shutting_down(&self) -> bool {
        self.0.load(Ordering::SeqCst)
    }

    pub fn request_shutdown(&self) {
        self.0.store(true, Ordering::SeqCst);
    }

    pub fn inner(&self) -> Arc<AtomicBool> {
        Arc::clone(&self.0)
    }

    /// Register `SIGTERM`/`SIGINT` to flip this token, and ignore
    /// `SIGPIPE` so a client disconnecting mid-write doesn't kill the
    /// process.
    pub fn install_signal_handlers(&self) -> std::io::Result<()> {
        signal_hook::flag::register(signal_hook::consts::SIGTERM, Arc::clone(&self.0))?;
        signal_hook::flag::register(signal_hook::consts::SIGINT, Arc::clone(&self.0))?;
        unsafe {
            signal_hook::low_level::register(signal_hook::consts::SIGPIPE, || {})?;
        }
        Ok(())
    }

    /// Sleep in [`TICK_SLEEP_INCREMENT`] slices, checking for shutdown
    /// between each so latency stays bounded.
    pub fn interruptible_sleep(&self, total: Duration) {
        let deadline = Instant::now() + total;
        while Instant::now() < deadline {
            if self.is_shutting_down() {
                return;
            }
            std::thread::sleep(TICK_SLEEP_INCREMENT.min(deadline - Instant::now()));
        }
    }
}

/// Coordinates the acquisition loop, the HTTP listener, and shutdown for
/// one SCD40 sensor + time-series store. Generic over the I2C backend so
/// tests can drive it with `embedded-hal-mock`; the binary instantiates it
/// with `linux_embedded_hal::I2cdev`.
pub struct Daemon<I: I2c> {
    config: DaemonConfig,
    store: Arc<TimeSeriesStore>,
    transport: Arc<Transport<I>>,
    health: Arc<HealthMonitor>,
    shutdown: ShutdownToken,
}

impl<I: I2c + Send + Sync + 'static> Daemon<I> {
    pub fn new(
        config: DaemonConfig,
        store: Arc<TimeSeriesStore>,
        transport: Arc<Transport<I>>,
        health: Arc<HealthMonitor>,
        shutdown: ShutdownToken,
    ) -> Self {
        Self {
            config,
            store,
            transport,
            health,
            shutdown,
        }
    }

    /// Register the built-in health checks (memory, CPU, disk, sensor
    /// success rate, storage success rate), pulling current values from
    /// each component's getters rather than holding a reference back to
    /// the daemon.
    pub fn register_health_checks(&self) {
        let max_memory_mb = self.config.alerts.max_memory_mb;

        {
            let health = Arc::clone(&self.health);
            self.health.registry.register(
                "memory",
                Box::new(move || {
                    let rss_mb = health.metrics.rss_bytes() as f64 / (1024.0 * 1024.0);
                    let status = if rss_mb > max_memory_mb {
                        HealthStatus::Warning
                    } else {
                        HealthStatus::Healthy
                    };
                    HealthCheckResult::with_status("memory", status, format!("RSS {rss_mb:.2}MB"))
                        .with_detail("rss_mb", format!("{rss_mb:.2}"))
                }),
            );
        }

        {
            let health = Arc::clone(&self.health);
            let max_cpu = self.config.alerts.max_cpu_percent;
            self.health.registry.register(
                "cpu",
                Box::new(move || {
                    let cpu = health.metrics.cpu_percent();
                    let status = if cpu > max_cpu {
                        HealthStatus::Warning
                    } else {
                        HealthStatus::Healthy
                    };
                    HealthCheckResult::with_status("cpu", status, format!("CPU {cpu:.1}%"))
                }),
            );
        }

        {
            let store = Arc::clone(&self.store);
            self.health.registry.register(
                "storage",
                Box::new(move || {
                    if store.health() {
                        HealthCheckResult::healthy("storage", "store responding")
                    } else {
                        HealthCheckResult::with_status(
                            "storage",
                            HealthStatus::Critical,
                            "store health check failed",
                        )
                    }
                }),
            );
        }

        {
            let transport = Arc::clone(&self.transport);
            self.health.registry.register(
                "sensor",
                Box::new(move || {
                    if transport.is_connected() {
                        HealthCheckResult::healthy("sensor", "transport connected")
                    } else {
                        HealthCheckResult::with_status(
                            "sensor",
                            HealthStatus::Warning,
                            format!("transport disconnected: {}", transport.last_error()),
                        )
                    }
                }),
            );
        }

        {
            let health = Arc::clone(&self.health);
            let min_rate = self.config.alerts.min_sensor_success_rate;
            self.health.registry.register(
                "sensor_success_rate",
                Box::new(move || {
                    let rate = health.metrics.sensor_success_rate();
                    let status = if rate < min_rate {
                        HealthStatus::Warning
                    } else {
                        HealthStatus::Healthy
                    };
                    HealthCheckResult::with_status(
                        "sensor_success_rate",
                        status,
                        format!("{:.1}%", rate * 100.0),
                    )
                }),
            );
        }

        {
            let health = Arc::clone(&self.health);
            let min_rate = self.config.alerts.min_storage_success_rate;
            self.health.registry.register(
                "storage_success_rate",
                Box::new(move || {
                    let rate = health.metrics.storage_success_rate();
                    let status = if rate < min_rate {
                        HealthStatus::Warning
                    } else {
                        HealthStatus::Healthy
                    };
                    HealthCheckResult::with_status(
                        "storage_success_rate",
                        status,
                        format!("{:.1}%", rate * 100.0),
                    )
                }),
            );
        }
    }

    /// Run the HTTP listener on its own thread until shutdown.
    pub fn spawn_http_server(&self) -> std::io::Result<std::thread::JoinHandle<()>> {
        let bind_addr = self.config.monitoring.bind_addr().map_err(|e| {
            std::io::Error::new(std::io::ErrorKind::InvalidInput, e.to_string())
        })?;
        let port = self.config.monitoring.http_server_port;
        let state = Arc::new(AppState::new(Arc::clone(&self.store), Arc::clone(&self.health)));
        let shutdown = self.shutdown.inner();

        Ok(std::thread::spawn(move || {
            if let Err(e) = http::serve(bind_addr, port, state, shutdown) {
                tracing::error!(error = %e, "http server exited with error");
            }
        }))
    }

    /// Drive the acquisition loop until shutdown. `reopen` is invoked both
    /// for the initial connection attempt and whenever the transport needs
    /// to reconnect; a failure to open the device at startup (no hardware
    /// present yet, a transient permissions issue, ...) is non-fatal — the
    /// loop simply retries on its next tick, per the init-order contract
    /// that only config/store failures are fatal at startup.
    pub fn run_acquisition_loop(&self, reopen: impl Fn() -> Option<I>) {
        let mut delay = StdDelay;
        match reopen() {
            Some(i2c) if self.transport.initialize_with(i2c, &mut delay).is_ok() => {}
            _ => {
                tracing::warn!("initial sensor connection failed; will retry on next tick");
                self.health.metrics.record_i2c_connection_failure();
            }
        }

        self.health.notify_ready();

        let sampling_interval = Duration::from_secs(self.config.daemon.sampling_interval_seconds);
        let mut last_gauge_refresh = Instant::now();
        let mut last_cleanup = Instant::now();
        let mut system = sysinfo::System::new();

        while !self.shutdown.is_shutting_down() {
            let health_status = self.health.check_all();
            if health_status.overall_status == HealthStatus::Critical
                && self.health.metrics.rss_bytes() > HARD_MEMORY_LIMIT_BYTES
            {
                tracing::warn!("memory hard limit exceeded");
            }

            self.run_one_sensor_cycle(&reopen, &mut delay);
            self.write_status_file(&health_status);

            if last_gauge_refresh.elapsed() >= GAUGE_REFRESH_INTERVAL {
                self.health.metrics.refresh_process_gauges(&mut system);
                last_gauge_refresh = Instant::now();
            }
            if last_cleanup.elapsed() >= CLEANUP_INTERVAL {
                if let Err(e) = self.store.cleanup() {
                    tracing::warn!(error = %e, "ttl cleanup failed");
                }
                last_cleanup = Instant::now();
            }

            self.health.notify_watchdog();
            self.shutdown.interruptible_sleep(sampling_interval);
        }

        self.shutdown_sequence(&mut delay);
    }

    /// One sensor acquisition attempt: reconnect if needed, read, store.
    fn run_one_sensor_cycle(&self, reopen: &impl Fn() -> Option<I>, delay: &mut StdDelay) {
        if !self.transport.is_connected() {
            self.transport.record_reconnection_attempt();
            match reopen() {
                Some(i2c) => {
                    if self.transport.initialize_with(i2c, delay).is_err() {
                        self.health.metrics.record_i2c_connection_failure();
                        return;
                    }
                }
                None => {
                    self.health.metrics.record_i2c_connection_failure();
                    return;
                }
            }
        }

        let read_started = Instant::now();
        let reading = match self.transport.read_sensor(delay, reopen) {
            Ok(reading) => reading,
            Err(TransportError::Disconnected) => {
                self.transport.mark_disconnected();
                self.health.metrics.record_sensor_failure(read_started.elapsed());
                return;
            }
            Err(_) => {
                self.health.metrics.record_sensor_failure(read_started.elapsed());
                return;
            }
        };

        if !reading.has_any_value() {
            self.health.metrics.record_sensor_failure(read_started.elapsed());
            return;
        }
        self.health.metrics.record_sensor_success(read_started.elapsed());

        let put_started = Instant::now();
        match self.store.put(&reading) {
            Ok(()) => self.health.metrics.record_storage_success(put_started.elapsed()),
            Err(err) => {
                self.health.metrics.record_storage_failure(put_started.elapsed());
                crate::storage::log_storage_error("put", &err);
            }
        }
    }

    /// Write a status JSON snapshot to `monitoring.status_file_path`, for
    /// external pollers that would rather read a file than hit `/health`.
    /// A no-op when the config leaves the path unset; write failures are
    /// logged, not fatal (this is a convenience surface, not the primary
    /// health signal).
    fn write_status_file(&self, status: &SystemHealthStatus) {
        let Some(path) = &self.config.monitoring.status_file_path else {
            return;
        };
        let body = serde_json::json!({
            "status": status.overall_status.as_str(),
            "last_check": crate::http::response::format_system_time(status.last_check),
            "sensor_connected": self.transport.is_connected(),
            "sensor_success_rate": self.health.metrics.sensor_success_rate(),
            "storage_success_rate": self.health.metrics.storage_success_rate(),
        });
        if let Err(e) = std::fs::write(path, body.to_string()) {
            tracing::warn!(error = %e, path = %path, "failed to write status file");
        }
    }

    /// Shutdown order: stop transport (STOP_PERIODIC + close), then the
    /// store is closed by its own `Drop`, then notify systemd STOPPING.
    /// The HTTP listener and worker threads are stopped by the
    /// shared shutdown flag observed by [`http::serve`].
    fn shutdown_sequence(&self, delay: &mut StdDelay) {
        tracing::info!("shutting down: stopping transport");
        self.transport.close(delay);
        if let Err(e) = self.store.cleanup() {
            tracing::warn!(error = %e, "final cleanup on shutdown failed");
        }
        self.health.notify_stopping();
    }
}
