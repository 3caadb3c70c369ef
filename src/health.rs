//! Health & metrics (H): a registry of named checks, rolled up into an
//! overall status, plus a performance-counter collector and an alerting
//! layer with per-alert-type cooldowns.
//!
//! `HealthMonitor` and `MetricsCollector` are two cooperating types that
//! observe the rest of the daemon through getter methods rather than being
//! called back into: no component holds a reference back to the daemon,
//! breaking what would otherwise be a reference cycle.

use std::collections::{HashMap, VecDeque};
use std::panic::{self, AssertUnwindSafe};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime};

use crate::config::AlertSettings;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash)]
pub enum HealthStatus {
    Healthy,
    Warning,
    Critical,
    Failed,
}

impl HealthStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            HealthStatus::Healthy => "HEALTHY",
            HealthStatus::Warning => "WARNING",
            HealthStatus::Critical => "CRITICAL",
            HealthStatus::Failed => "FAILED",
        }
    }

    /// "Operational" per the glossary: healthy enough to keep serving.
    pub fn is_operational(&self) -> bool {
        matches!(self, HealthStatus::Healthy | HealthStatus::Warning)
    }
}

#[derive(Debug, Clone)]
pub struct HealthCheckResult {
    pub component_name: String,
    pub status: HealthStatus,
    pub message: String,
    pub checked_at: SystemTime,
    pub detail: HashMap<String, String>,
}

impl HealthCheckResult {
    pub fn healthy(component_name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            component_name: component_name.into(),
            status: HealthStatus::Healthy,
            message: message.into(),
            checked_at: SystemTime::now(),
            detail: HashMap::new(),
        }
    }

    pub fn with_status(
        component_name: impl Into<String>,
        status: HealthStatus,
        message: impl Into<String>,
    ) -> Self {
        Self {
            component_name: component_name.into(),
            status,
            message: message.into(),
            checked_at: SystemTime::now(),
            detail: HashMap::new(),
        }
    }

    pub fn with_detail(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.detail.insert(key.into(), value.into());
        self
    }
}

#[derive(Debug, Clone)]
pub struct SystemHealthStatus {
    pub overall_status: HealthStatus,
    pub last_check: SystemTime,
    pub component_results: Vec<HealthCheckResult>,
}

/// A named check function. Registered once per component; `check_all`
/// invokes every registered check and never lets one check's panic take
/// down the registry.
type CheckFn = Box<dyn Fn() -> HealthCheckResult + Send + Sync>;

#[derive(Default)]
pub struct HealthRegistry {
    checks: Mutex<HashMap<String, CheckFn>>,
}

impl HealthRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, name: impl Into<String>, check: CheckFn) {
        self.checks.lock().unwrap().insert(name.into(), check);
    }

    /// Run every registered check. A check whose closure panics is caught
    /// and reported as `FAILED` rather than unwinding the registry.
    pub fn check_all(&self) -> SystemHealthStatus {
        let checks = self.checks.lock().unwrap();
        let mut results = Vec::with_capacity(checks.len());
        for (name, check) in checks.iter() {
            let result = panic::catch_unwind(AssertUnwindSafe(|| check())).unwrap_or_else(|_| {
                HealthCheckResult::with_status(
                    name.clone(),
                    HealthStatus::Failed,
                    "health check panicked",
                )
            });
            results.push(result);
        }
        // Stable ordering for deterministic JSON output.
        results.sort_by(|a, b| a.component_name.cmp(&b.component_name));

        let overall_status = results
            .iter()
            .map(|r| r.status)
            .max()
            .unwrap_or(HealthStatus::Warning); // empty check set is reported as WARNING.

        SystemHealthStatus {
            overall_status,
            last_check: SystemTime::now(),
            component_results: results,
        }
    }
}

/// One recorded sensor/storage/I2C operation outcome, timestamped for
/// windowed success-rate queries.
#[derive(Debug, Clone, Copy)]
struct TimedEvent {
    at: Instant,
    success: bool,
    duration: Option<Duration>,
}

const MAX_EVENTS_PER_CLASS: usize = 1000;
const EVENT_RETENTION: Duration = Duration::from_secs(24 * 3600);

/// Bounded, time-pruned history of one event class (sensor, storage, or
/// I2C). Capped at [`MAX_EVENTS_PER_CLASS`] entries and pruned of anything
/// older than [`EVENT_RETENTION`] on every push, so `/metrics` can answer
/// "last 1h" / "last 24h" success-rate queries without unbounded growth.
#[derive(Default)]
struct EventLog {
    events: Mutex<VecDeque<TimedEvent>>,
}

impl EventLog {
    fn record(&self, success: bool, duration: Option<Duration>) {
        let mut events = self.events.lock().unwrap();
        let now = Instant::now();
        while events.front().is_some_and(|e| now.duration_since(e.at) > EVENT_RETENTION) {
            events.pop_front();
        }
        if events.len() >= MAX_EVENTS_PER_CLASS {
            events.pop_front();
        }
        events.push_back(TimedEvent {
            at: now,
            success,
            duration,
        });
    }

    fn success_rate_since(&self, window: Duration) -> f64 {
        let events = self.events.lock().unwrap();
        let now = Instant::now();
        let (successes, total) = events
            .iter()
            .filter(|e| now.duration_since(e.at) <= window)
            .fold((0u64, 0u64), |(s, t), e| (s + e.success as u64, t + 1));
        success_rate(successes, total - successes)
    }

    fn avg_duration_ms_since(&self, window: Duration) -> f64 {
        let events = self.events.lock().unwrap();
        let now = Instant::now();
        let (total_ms, count) = events
            .iter()
            .filter(|e| now.duration_since(e.at) <= window)
            .filter_map(|e| e.duration)
            .fold((0u64, 0u64), |(sum, count), d| (sum + d.as_millis() as u64, count + 1));
        if count == 0 {
            0.0
        } else {
            total_ms as f64 / count as f64
        }
    }

    fn count_since(&self, window: Duration) -> u64 {
        let events = self.events.lock().unwrap();
        let now = Instant::now();
        events.iter().filter(|e| now.duration_since(e.at) <= window).count() as u64
    }
}

const ONE_HOUR: Duration = Duration::from_secs(3600);
const ONE_DAY: Duration = Duration::from_secs(24 * 3600);

/// Monotonic counters + gauges tracked across the daemon's lifetime, plus
/// a bounded recent-event history per class for windowed queries.
#[derive(Default)]
pub struct PerformanceMetrics {
    pub sensor_successes: AtomicU64,
    pub sensor_failures: AtomicU64,
    pub storage_successes: AtomicU64,
    pub storage_failures: AtomicU64,
    pub i2c_connection_failures: AtomicU64,
    sensor_events: EventLog,
    storage_events: EventLog,
    i2c_events: EventLog,
    rss_bytes: AtomicU64,
    cpu_millipercent: AtomicU64,
    start_time: Mutex<Option<Instant>>,
}

impl PerformanceMetrics {
    pub fn new() -> Self {
        let metrics = Self::default();
        *metrics.start_time.lock().unwrap() = Some(Instant::now());
        metrics
    }

    pub fn record_sensor_success(&self, duration: Duration) {
        self.sensor_successes.fetch_add(1, Ordering::Relaxed);
        self.sensor_events.record(true, Some(duration));
    }
    pub fn record_sensor_failure(&self, duration: Duration) {
        self.sensor_failures.fetch_add(1, Ordering::Relaxed);
        self.sensor_events.record(false, Some(duration));
    }
    pub fn record_storage_success(&self, duration: Duration) {
        self.storage_successes.fetch_add(1, Ordering::Relaxed);
        self.storage_events.record(true, Some(duration));
    }
    pub fn record_storage_failure(&self, duration: Duration) {
        self.storage_failures.fetch_add(1, Ordering::Relaxed);
        self.storage_events.record(false, Some(duration));
    }
    pub fn record_i2c_connection_failure(&self) {
        self.i2c_connection_failures.fetch_add(1, Ordering::Relaxed);
        self.i2c_events.record(false, None);
    }

    pub fn sensor_success_rate_1h(&self) -> f64 {
        self.sensor_events.success_rate_since(ONE_HOUR)
    }
    pub fn sensor_success_rate_24h(&self) -> f64 {
        self.sensor_events.success_rate_since(ONE_DAY)
    }
    pub fn sensor_avg_duration_ms_24h(&self) -> f64 {
        self.sensor_events.avg_duration_ms_since(ONE_DAY)
    }
    pub fn storage_success_rate_1h(&self) -> f64 {
        self.storage_events.success_rate_since(ONE_HOUR)
    }
    pub fn storage_success_rate_24h(&self) -> f64 {
        self.storage_events.success_rate_since(ONE_DAY)
    }
    pub fn storage_avg_duration_ms_24h(&self) -> f64 {
        self.storage_events.avg_duration_ms_since(ONE_DAY)
    }
    pub fn i2c_connection_failures_1h(&self) -> u64 {
        self.i2c_events.count_since(ONE_HOUR)
    }
    pub fn i2c_connection_failures_24h(&self) -> u64 {
        self.i2c_events.count_since(ONE_DAY)
    }

    pub fn set_rss_bytes(&self, bytes: u64) {
        self.rss_bytes.store(bytes, Ordering::Relaxed);
    }
    pub fn rss_bytes(&self) -> u64 {
        self.rss_bytes.load(Ordering::Relaxed)
    }

    pub fn set_cpu_percent(&self, percent: f64) {
        self.cpu_millipercent
            .store((percent * 1000.0) as u64, Ordering::Relaxed);
    }
    pub fn cpu_percent(&self) -> f64 {
        self.cpu_millipercent.load(Ordering::Relaxed) as f64 / 1000.0
    }

    pub fn uptime(&self) -> Duration {
        self.start_time
            .lock()
            .unwrap()
            .map(|t| t.elapsed())
            .unwrap_or_default()
    }

    pub fn sensor_success_rate(&self) -> f64 {
        success_rate(
            self.sensor_successes.load(Ordering::Relaxed),
            self.sensor_failures.load(Ordering::Relaxed),
        )
    }

    pub fn storage_success_rate(&self) -> f64 {
        success_rate(
            self.storage_successes.load(Ordering::Relaxed),
            self.storage_failures.load(Ordering::Relaxed),
        )
    }

    /// Refresh the RSS/CPU gauges from the current process via `sysinfo`.
    /// Called periodically (every 5 minutes) by the control loop, not on
    /// every tick.
    pub fn refresh_process_gauges(&self, system: &mut sysinfo::System) {
        system.refresh_all();
        let pid = sysinfo::Pid::from_u32(std::process::id());
        if let Some(process) = system.process(pid) {
            self.set_rss_bytes(process.memory());
            self.set_cpu_percent(process.cpu_usage() as f64);
        }
    }
}

fn success_rate(successes: u64, failures: u64) -> f64 {
    let total = successes + failures;
    if total == 0 {
        1.0
    } else {
        successes as f64 / total as f64
    }
}

/// Ring buffer of recent health-check-driven events, capped at 100.
pub struct HealthEventLog {
    events: Mutex<VecDeque<HealthCheckResult>>,
    capacity: usize,
}

impl HealthEventLog {
    pub fn new() -> Self {
        Self::with_capacity(100)
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            events: Mutex::new(VecDeque::with_capacity(capacity)),
            capacity,
        }
    }

    pub fn push(&self, event: HealthCheckResult) {
        let mut events = self.events.lock().unwrap();
        if events.len() >= self.capacity {
            events.pop_front();
        }
        events.push_back(event);
    }

    pub fn snapshot(&self) -> Vec<HealthCheckResult> {
        self.events.lock().unwrap().iter().cloned().collect()
    }
}

impl Default for HealthEventLog {
    fn default() -> Self {
        Self::new()
    }
}

/// Which alert condition fired, used as the cooldown map's key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum AlertKind {
    MaxMemory,
    MaxCpu,
    MinSensorSuccessRate,
    MinStorageSuccessRate,
    OverallCriticalOrFailed,
}

impl AlertKind {
    fn label(&self) -> &'static str {
        match self {
            AlertKind::MaxMemory => "max_memory",
            AlertKind::MaxCpu => "max_cpu",
            AlertKind::MinSensorSuccessRate => "min_sensor_success_rate",
            AlertKind::MinStorageSuccessRate => "min_storage_success_rate",
            AlertKind::OverallCriticalOrFailed => "overall_critical_or_failed",
        }
    }
}

/// Notifies an external readiness/status watcher (systemd, or nothing).
/// Modeled as a trait so "absent systemd, the operation is a no-op"
/// is satisfied by construction rather than by a runtime check
/// scattered through call sites.
pub trait ReadinessNotifier: Send + Sync {
    fn ready(&self) {}
    fn stopping(&self) {}
    fn watchdog(&self) {}
    fn status(&self, _message: &str) {}
}

/// No-op notifier, used whenever `$NOTIFY_SOCKET` is unset.
pub struct NullNotifier;
impl ReadinessNotifier for NullNotifier {}

/// `sd_notify` protocol implementation: writes datagrams to the Unix
/// socket path named by `$NOTIFY_SOCKET`, the documented wire contract
/// systemd units use (no `libsystemd` C binding needed).
pub struct SystemdNotifier {
    socket_path: std::path::PathBuf,
}

impl SystemdNotifier {
    /// Construct from the environment, or `None` if not running under
    /// systemd (`$NOTIFY_SOCKET` unset).
    pub fn from_env() -> Option<Self> {
        let path = std::env::var_os("NOTIFY_SOCKET")?;
        Some(Self {
            socket_path: std::path::PathBuf::from(path),
        })
    }

    fn send(&self, payload: &str) {
        use std::os::unix::net::UnixDatagram;
        let Ok(socket) = UnixDatagram::unbound() else {
            return;
        };
        let _ = socket.send_to(payload.as_bytes(), &self.socket_path);
    }
}

impl ReadinessNotifier for SystemdNotifier {
    fn ready(&self) {
        self.send("READY=1");
    }
    fn stopping(&self) {
        self.send("STOPPING=1");
    }
    fn watchdog(&self) {
        self.send("WATCHDOG=1");
    }
    fn status(&self, message: &str) {
        self.send(&format!("STATUS={message}"));
    }
}

/// Build a [`ReadinessNotifier`] appropriate to the environment: real
/// systemd notifications if `$NOTIFY_SOCKET` is set, otherwise a no-op.
pub fn default_notifier() -> Box<dyn ReadinessNotifier> {
    match SystemdNotifier::from_env() {
        Some(notifier) => Box::new(notifier),
        None => Box::new(NullNotifier),
    }
}

/// Coordinates checks, alert thresholds/cooldowns, the event log, and
/// systemd notification. Owns no reference back to the daemon; it pulls
/// readings from components via the closures registered in its
/// [`HealthRegistry`].
pub struct HealthMonitor {
    pub registry: HealthRegistry,
    pub metrics: PerformanceMetrics,
    pub events: HealthEventLog,
    alert_settings: AlertSettings,
    last_alert_fired: Mutex<HashMap<AlertKind, Instant>>,
    notifier: Box<dyn ReadinessNotifier>,
}

impl HealthMonitor {
    pub fn new(alert_settings: AlertSettings, notifier: Box<dyn ReadinessNotifier>) -> Self {
        Self {
            registry: HealthRegistry::new(),
            metrics: PerformanceMetrics::new(),
            events: HealthEventLog::new(),
            alert_settings,
            last_alert_fired: Mutex::new(HashMap::new()),
            notifier,
        }
    }

    /// Run every registered check, log the result, and evaluate alert
    /// thresholds with per-alert-type cooldowns.
    pub fn check_all(&self) -> SystemHealthStatus {
        let status = self.registry.check_all();
        for result in &status.component_results {
            self.events.push(result.clone());
        }
        self.evaluate_alerts(&status);
        status
    }

    fn evaluate_alerts(&self, status: &SystemHealthStatus) {
        let cooldown = Duration::from_secs(self.alert_settings.alert_cooldown_minutes * 60);

        let rss_mb = self.metrics.rss_bytes() as f64 / (1024.0 * 1024.0);
        if rss_mb > self.alert_settings.max_memory_mb {
            self.maybe_fire(
                AlertKind::MaxMemory,
                cooldown,
                &format!("RSS {rss_mb:.1}MB exceeds max_memory_mb {}", self.alert_settings.max_memory_mb),
            );
        }

        let cpu = self.metrics.cpu_percent();
        if cpu > self.alert_settings.max_cpu_percent {
            self.maybe_fire(
                AlertKind::MaxCpu,
                cooldown,
                &format!("CPU {cpu:.1}% exceeds max_cpu_percent {}", self.alert_settings.max_cpu_percent),
            );
        }

        let sensor_rate = self.metrics.sensor_success_rate();
        if sensor_rate < self.alert_settings.min_sensor_success_rate {
            self.maybe_fire(
                AlertKind::MinSensorSuccessRate,
                cooldown,
                &format!(
                    "sensor success rate {sensor_rate:.2} below min_sensor_success_rate {}",
                    self.alert_settings.min_sensor_success_rate
                ),
            );
        }

        let storage_rate = self.metrics.storage_success_rate();
        if storage_rate < self.alert_settings.min_storage_success_rate {
            self.maybe_fire(
                AlertKind::MinStorageSuccessRate,
                cooldown,
                &format!(
                    "storage success rate {storage_rate:.2} below min_storage_success_rate {}",
                    self.alert_settings.min_storage_success_rate
                ),
            );
        }

        if matches!(status.overall_status, HealthStatus::Critical | HealthStatus::Failed) {
            self.maybe_fire(
                AlertKind::OverallCriticalOrFailed,
                cooldown,
                &format!("overall system status is {}", status.overall_status.as_str()),
            );
        }
    }

    fn maybe_fire(&self, kind: AlertKind, cooldown: Duration, message: &str) {
        let mut last_fired = self.last_alert_fired.lock().unwrap();
        let now = Instant::now();
        if let Some(&previous) = last_fired.get(&kind) {
            if now.duration_since(previous) < cooldown {
                return;
            }
        }
        last_fired.insert(kind, now);
        drop(last_fired);

        tracing::warn!(alert = kind.label(), message, "health alert fired");
        self.events.push(HealthCheckResult::with_status(
            "alert",
            HealthStatus::Warning,
            message.to_string(),
        ));
        self.notifier.status(message);
    }

    pub fn notify_ready(&self) {
        self.notifier.ready();
    }
    pub fn notify_stopping(&self) {
        self.notifier.stopping();
    }
    pub fn notify_watchdog(&self) {
        self.notifier.watchdog();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn overall_status_is_worst_of_components() {
        let registry = HealthRegistry::new();
        registry.register(
            "a",
            Box::new(|| HealthCheckResult::healthy("a", "fine")),
        );
        registry.register(
            "b",
            Box::new(|| HealthCheckResult::with_status("b", HealthStatus::Critical, "bad")),
        );
        let status = registry.check_all();
        assert_eq!(status.overall_status, HealthStatus::Critical);
    }

    #[test]
    fn empty_registry_yields_warning() {
        let registry = HealthRegistry::new();
        let status = registry.check_all();
        assert_eq!(status.overall_status, HealthStatus::Warning);
    }

    #[test]
    fn panicking_check_is_reported_failed_not_propagated() {
        let registry = HealthRegistry::new();
        registry.register(
            "flaky",
            Box::new(|| panic!("boom")),
        );
        let status = registry.check_all();
        assert_eq!(status.component_results.len(), 1);
        assert_eq!(status.component_results[0].status, HealthStatus::Failed);
    }

    #[test]
    fn success_rate_is_one_with_no_attempts() {
        let metrics = PerformanceMetrics::new();
        assert_eq!(metrics.sensor_success_rate(), 1.0);
    }

    #[test]
    fn success_rate_reflects_failures() {
        let metrics = PerformanceMetrics::new();
        metrics.record_sensor_success(Duration::from_millis(5));
        metrics.record_sensor_success(Duration::from_millis(5));
        metrics.record_sensor_failure(Duration::from_millis(5));
        assert!((metrics.sensor_success_rate() - (2.0 / 3.0)).abs() < 1e-9);
    }

    #[test]
    fn windowed_success_rate_matches_lifetime_rate_for_recent_events() {
        let metrics = PerformanceMetrics::new();
        metrics.record_sensor_success(Duration::from_millis(10));
        metrics.record_sensor_success(Duration::from_millis(20));
        metrics.record_sensor_failure(Duration::from_millis(30));
        assert!((metrics.sensor_success_rate_1h() - (2.0 / 3.0)).abs() < 1e-9);
        assert!((metrics.sensor_success_rate_24h() - (2.0 / 3.0)).abs() < 1e-9);
        assert!((metrics.sensor_avg_duration_ms_24h() - 20.0).abs() < 1e-9);
    }

    #[test]
    fn i2c_failures_are_counted_in_both_windows() {
        let metrics = PerformanceMetrics::new();
        metrics.record_i2c_connection_failure();
        metrics.record_i2c_connection_failure();
        assert_eq!(metrics.i2c_connection_failures_1h(), 2);
        assert_eq!(metrics.i2c_connection_failures_24h(), 2);
    }

    #[test]
    fn event_log_caps_at_max_events_per_class() {
        let log = EventLog::default();
        for _ in 0..(MAX_EVENTS_PER_CLASS + 10) {
            log.record(true, Some(Duration::from_millis(1)));
        }
        assert_eq!(log.events.lock().unwrap().len(), MAX_EVENTS_PER_CLASS);
    }

    #[test]
    fn event_log_caps_at_capacity() {
        let log = HealthEventLog::with_capacity(3);
        for i in 0..5 {
            log.push(HealthCheckResult::healthy("c", format!("event {i}")));
        }
        assert_eq!(log.snapshot().len(), 3);
    }

    #[test]
    fn alert_respects_cooldown() {
        let mut settings = AlertSettings::default();
        settings.max_memory_mb = 1.0;
        settings.alert_cooldown_minutes = 15;
        let monitor = HealthMonitor::new(settings, Box::new(NullNotifier));
        monitor.metrics.set_rss_bytes(10 * 1024 * 1024);

        monitor.maybe_fire(
            AlertKind::MaxMemory,
            Duration::from_secs(900),
            "first",
        );
        let fired_once = monitor.last_alert_fired.lock().unwrap().len();
        monitor.maybe_fire(
            AlertKind::MaxMemory,
            Duration::from_secs(900),
            "second, should be suppressed",
        );
        let fired_twice = monitor.last_alert_fired.lock().unwrap().len();
        assert_eq!(fired_once, fired_twice);
    }

    #[test]
    fn null_notifier_is_a_no_op() {
        let notifier = NullNotifier;
        notifier.ready();
        notifier.stopping();
        notifier.watchdog();
        notifier.status("anything");
    }
}
