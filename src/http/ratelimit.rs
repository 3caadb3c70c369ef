//! Per-IP sliding-window rate limiter: at most 60 requests/minute
//! AND 1000 requests/hour per client IP.
//!
//! Implemented as two parallel fixed windows (minute, hour) of request
//! timestamps per IP, pruned lazily on each check — the simplest structure
//! that satisfies both independent limits without pulling in a token-bucket
//! crate, in keeping with this crate's preference for small hand-rolled
//! data structures.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;
use std::time::{Duration, Instant};

const PER_MINUTE_LIMIT: usize = 60;
const PER_HOUR_LIMIT: usize = 1000;
const MINUTE: Duration = Duration::from_secs(60);
const HOUR: Duration = Duration::from_secs(3600);

struct ClientWindow {
    minute: Vec<Instant>,
    hour: Vec<Instant>,
}

impl ClientWindow {
    fn new() -> Self {
        Self {
            minute: Vec::new(),
            hour: Vec::new(),
        }
    }

    fn prune(&mut self, now: Instant) {
        self.minute.retain(|&t| now.duration_since(t) < MINUTE);
        self.hour.retain(|&t| now.duration_since(t) < HOUR);
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allow,
    /// Breached a window; carries the `Retry-After` seconds to report.
    Deny { retry_after_secs: u64 },
}

#[derive(Default)]
pub struct RateLimiter {
    clients: Mutex<HashMap<IpAddr, ClientWindow>>,
}

impl RateLimiter {
    pub fn new() -> Self {
        Self::default()
    }

    /// Record a request attempt from `ip` and decide whether it's allowed.
    /// The 61st request within 60s, or the 1001st within 3600s, is denied.
    pub fn check(&self, ip: IpAddr) -> RateLimitDecision {
        let now = Instant::now();
        let mut clients = self.clients.lock().unwrap();
        let window = clients.entry(ip).or_insert_with(ClientWindow::new);
        window.prune(now);

        if window.minute.len() >= PER_MINUTE_LIMIT || window.hour.len() >= PER_HOUR_LIMIT {
            return RateLimitDecision::Deny {
                retry_after_secs: 60,
            };
        }

        window.minute.push(now);
        window.hour.push(now);
        RateLimitDecision::Allow
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::{IpAddr, Ipv4Addr};

    fn ip() -> IpAddr {
        IpAddr::V4(Ipv4Addr::new(1, 2, 3, 4))
    }

    #[test]
    fn allows_up_to_sixty_per_minute() {
        let limiter = RateLimiter::new();
        for _ in 0..60 {
            assert_eq!(limiter.check(ip()), RateLimitDecision::Allow);
        }
        assert!(matches!(
            limiter.check(ip()),
            RateLimitDecision::Deny { retry_after_secs: 60 }
        ));
    }

    #[test]
    fn hourly_limit_denies_the_1001st_request() {
        let limiter = RateLimiter::new();
        let target = ip();
        let now = Instant::now();
        {
            let mut clients = limiter.clients.lock().unwrap();
            let window = clients.entry(target).or_insert_with(ClientWindow::new);
            // Pre-seed 1000 hour-window hits without tripping the
            // per-minute limit, by keeping the minute window empty.
            window.hour = vec![now; PER_HOUR_LIMIT];
        }
        assert!(matches!(
            limiter.check(target),
            RateLimitDecision::Deny { retry_after_secs: 60 }
        ));
    }

    #[test]
    fn different_ips_have_independent_windows() {
        let limiter = RateLimiter::new();
        let ip_a = IpAddr::V4(Ipv4Addr::new(1, 1, 1, 1));
        let ip_b = IpAddr::V4(Ipv4Addr::new(2, 2, 2, 2));
        for _ in 0..60 {
            assert_eq!(limiter.check(ip_a), RateLimitDecision::Allow);
        }
        assert_eq!(limiter.check(ip_b), RateLimitDecision::Allow);
    }
}
