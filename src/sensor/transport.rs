//! I2C transport for the SCD40: connection lifecycle, retry with
//! exponential backoff, and reconnection on failure.
//!
//! Owns the I2C bus handle and a small state machine (disconnected,
//! connected, reconnecting) around an otherwise stateless wire protocol.

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Mutex;
use std::time::{Duration, Instant, SystemTime, UNIX_EPOCH};

use embedded_hal::delay::DelayNs;
use embedded_hal::i2c::I2c;
use thiserror::Error;

use crate::reading::Reading;
use crate::sensor::{command, parse_measurement_frame, to_reading};

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("failed to open I2C device: {0}")]
    Connection(String),
    #[error("I2C frame error: {0}")]
    Frame(String),
    #[error("sensor reading out of valid range")]
    Validation,
    #[error("sensor is not connected")]
    Disconnected,
}

#[derive(Debug, Clone, Copy, Default)]
pub struct TransportStats {
    pub successful_reads: u64,
    pub failed_reads: u64,
    pub reconnection_attempts: u64,
    pub last_success_time: Option<SystemTime>,
    pub last_attempt_time: Option<SystemTime>,
}

/// Delay before retry attempt `n` (1-indexed): `min(100ms * 2^(n-1), 5000ms)`.
pub fn backoff_delay(attempt: u32) -> Duration {
    let millis = 100u64.saturating_mul(1u64 << attempt.saturating_sub(1).min(16));
    Duration::from_millis(millis.min(5000))
}

/// Owns the I2C handle and connection state for one SCD40 sensor. Generic
/// over any `embedded_hal::i2c::I2c` implementor so the retry/backoff logic
/// can be exercised against `embedded-hal-mock` in tests; the daemon binary
/// instantiates this with `linux_embedded_hal::I2cdev`.
pub struct Transport<I: I2c> {
    address: u8,
    max_retries: u32,
    connected: AtomicBool,
    inner: Mutex<Inner<I>>,
    stats: Mutex<TransportStats>,
    last_error: Mutex<String>,
}

struct Inner<I: I2c> {
    i2c: Option<I>,
}

impl<I: I2c> Transport<I> {
    pub fn new(address: u8, max_retries: u32) -> Self {
        Self {
            address,
            max_retries,
            connected: AtomicBool::new(false),
            inner: Mutex::new(Inner { i2c: None }),
            stats: Mutex::new(TransportStats::default()),
            last_error: Mutex::new(String::new()),
        }
    }

    /// Take ownership of an already-opened I2C bus handle and bring the
    /// sensor into periodic measurement mode: STOP then START.
    pub fn initialize_with(&self, i2c: I, delay: &mut impl DelayNs) -> Result<(), TransportError> {
        self.record_attempt();
        let mut guard = self.inner.lock().unwrap();
        let mut i2c = i2c;
        // Best-effort stop: the sensor may already be idle.
        let _ = send_command(&mut i2c, self.address, command::STOP_PERIODIC);
        delay.delay_ms(1);
        send_command(&mut i2c, self.address, command::START_PERIODIC).map_err(|e| {
            self.set_last_error(&e.to_string());
            e
        })?;
        guard.i2c = Some(i2c);
        drop(guard);
        self.connected.store(true, Ordering::SeqCst);
        Ok(())
    }

    pub fn is_connected(&self) -> bool {
        self.connected.load(Ordering::SeqCst)
    }

    pub fn last_error(&self) -> String {
        self.last_error.lock().unwrap().clone()
    }

    pub fn stats(&self) -> TransportStats {
        *self.stats.lock().unwrap()
    }

    /// Read one measurement, retrying up to `max_retries + 1` cycles. On
    /// every failed attempt (frame error or validation error), per spec: the
    /// handle is closed, the exponential backoff is waited out, then the
    /// sensor is reinitialized via `reopen` before the next attempt — a
    /// failed attempt always leaves the bus in the same fresh state as a
    /// cold start, rather than retrying blind against a line that just
    /// produced garbage. If `reopen` can't hand back a handle (or
    /// reinitializing it fails), retrying further would just repeat the same
    /// failure, so the cycle reports failure immediately instead of
    /// continuing to count down attempts.
    pub fn read_sensor(
        &self,
        delay: &mut impl DelayNs,
        reopen: &impl Fn() -> Option<I>,
    ) -> Result<Reading, TransportError> {
        if !self.is_connected() {
            return Err(TransportError::Disconnected);
        }
        self.record_attempt();

        let attempts = self.max_retries + 1;
        let mut last_err = TransportError::Frame("no attempts made".to_string());
        for attempt in 1..=attempts {
            match self.try_read_once(delay) {
                Ok(reading) => {
                    self.record_success();
                    return Ok(reading);
                }
                Err(err) => {
                    last_err = err;
                    self.record_failure();
                    if attempt < attempts {
                        self.close(delay);
                        delay.delay_ms(backoff_delay(attempt).as_millis() as u32);
                        self.record_reconnection_attempt();
                        match reopen() {
                            Some(i2c) if self.initialize_with(i2c, delay).is_ok() => {}
                            _ => {
                                self.set_last_error(&last_err.to_string());
                                return Err(last_err);
                            }
                        }
                    }
                }
            }
        }
        self.set_last_error(&last_err.to_string());
        Err(last_err)
    }

    fn try_read_once(&self, delay: &mut impl DelayNs) -> Result<Reading, TransportError> {
        let mut guard = self.inner.lock().unwrap();
        let i2c = guard
            .i2c
            .as_mut()
            .ok_or(TransportError::Disconnected)?;

        send_command(i2c, self.address, command::READ_MEASUREMENT)?;
        delay.delay_ms(1);

        let mut frame = [0u8; 9];
        i2c.read(self.address, &mut frame)
            .map_err(|e| TransportError::Frame(format!("{e:?}")))?;
        drop(guard);

        let raw = parse_measurement_frame(frame)
            .map_err(|e| TransportError::Frame(e.to_string()))?;
        if !crate::sensor::all_fields_valid(raw) {
            return Err(TransportError::Validation);
        }

        let timestamp_us = crate::reading::now_micros();
        Ok(to_reading(raw, timestamp_us))
    }

    /// Send STOP_PERIODIC best-effort and drop the I2C handle. Terminal
    /// state on shutdown.
    pub fn close(&self, delay: &mut impl DelayNs) {
        let mut guard = self.inner.lock().unwrap();
        if let Some(i2c) = guard.i2c.as_mut() {
            let _ = send_command(i2c, self.address, command::STOP_PERIODIC);
            delay.delay_ms(1);
        }
        guard.i2c = None;
        self.connected.store(false, Ordering::SeqCst);
    }

    fn record_attempt(&self) {
        let mut stats = self.stats.lock().unwrap();
        stats.last_attempt_time = Some(SystemTime::now());
    }

    fn record_success(&self) {
        let mut stats = self.stats.lock().unwrap();
        stats.successful_reads += 1;
        stats.last_success_time = Some(SystemTime::now());
    }

    fn record_failure(&self) {
        let mut stats = self.stats.lock().unwrap();
        stats.failed_reads += 1;
    }

    fn set_last_error(&self, message: &str) {
        *self.last_error.lock().unwrap() = message.to_string();
    }

    pub fn record_reconnection_attempt(&self) {
        let mut stats = self.stats.lock().unwrap();
        stats.reconnection_attempts += 1;
    }

    pub fn mark_disconnected(&self) {
        self.connected.store(false, Ordering::SeqCst);
        let mut guard = self.inner.lock().unwrap();
        guard.i2c = None;
    }
}

fn send_command<I: I2c>(i2c: &mut I, address: u8, command: u16) -> Result<(), TransportError> {
    i2c.write(address, &command.to_be_bytes())
        .map_err(|e| TransportError::Connection(format!("{e:?}")))
}

/// Milliseconds elapsed, used only for diagnostics/logging around
/// connection attempts; not load-bearing for protocol timing.
pub fn elapsed_ms(since: Instant) -> u64 {
    since.elapsed().as_millis() as u64
}

/// Bridges `embedded_hal::delay::DelayNs` onto `std::thread::sleep` for the
/// daemon's real acquisition thread (tests use `embedded-hal-mock`'s
/// `NoopDelay` instead).
#[derive(Default)]
pub struct StdDelay;

impl DelayNs for StdDelay {
    fn delay_ns(&mut self, ns: u32) {
        std::thread::sleep(Duration::from_nanos(ns as u64));
    }
}
