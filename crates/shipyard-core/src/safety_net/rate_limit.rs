//! Fixed-window request rate limiter keyed by client IP.

use std::collections::HashMap;
use std::net::IpAddr;
use std::sync::Mutex;

use chrono::{DateTime, Duration, Utc};

/// Longest window honoured; larger settings are clamped.
const MAX_WINDOW_SECS: u64 = 366 * 24 * 60 * 60;

/// Decision for one request.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateDecision {
    Allowed { remaining: u32 },
    Blocked,
}

#[derive(Debug)]
struct Window {
    started_at: DateTime<Utc>,
    count: u32,
}

#[derive(Debug, Default)]
struct Windows {
    clients: HashMap<IpAddr, Window>,
    swept_at: Option<DateTime<Utc>>,
}

/// Counts requests per client IP. A client's window opens with its first
/// request and lasts `window`; request number `limit + 1` inside one window
/// is blocked, as is everything after it until the window closes.
///
/// Closed windows are swept from [`check`](Self::check) at most once per
/// window length, so memory follows the clients seen in the last window.
#[derive(Debug)]
pub struct RateLimiter {
    limit: u32,
    window: Duration,
    windows: Mutex<Windows>,
}

impl RateLimiter {
    pub fn new(limit: u32, window_secs: u64) -> Self {
        Self {
            limit,
            window: Duration::seconds(window_secs.min(MAX_WINDOW_SECS) as i64),
            windows: Mutex::new(Windows::default()),
        }
    }

    pub fn limit(&self) -> u32 {
        self.limit
    }

    /// Record a request from `client` at `now` and decide whether it passes.
    pub fn check(&self, client: IpAddr, now: DateTime<Utc>) -> RateDecision {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        let swept_at = *windows.swept_at.get_or_insert(now);
        if now - swept_at >= self.window {
            self.sweep(&mut windows, now);
        }
        let window = windows.clients.entry(client).or_insert(Window {
            started_at: now,
            count: 0,
        });
        if now - window.started_at >= self.window {
            window.started_at = now;
            window.count = 0;
        }
        window.count = window.count.saturating_add(1);
        if window.count > self.limit {
            RateDecision::Blocked
        } else {
            RateDecision::Allowed {
                remaining: self.limit - window.count,
            }
        }
    }

    /// Drop windows that closed before `now`.
    pub fn evict_expired(&self, now: DateTime<Utc>) {
        let mut windows = self.windows.lock().unwrap_or_else(|e| e.into_inner());
        self.sweep(&mut windows, now);
    }

    fn sweep(&self, windows: &mut Windows, now: DateTime<Utc>) {
        windows
            .clients
            .retain(|_, w| now - w.started_at < self.window);
        windows.swept_at = Some(now);
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .clients
            .len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::net::Ipv4Addr;

    fn ip(n: u32) -> IpAddr {
        IpAddr::V4(Ipv4Addr::from(0x0a00_0000 + n))
    }

    #[test]
    fn blocks_the_request_after_the_limit() {
        let limiter = RateLimiter::new(100, 300);
        let now = Utc::now();
        for i in 0..100 {
            assert!(
                matches!(limiter.check(ip(1), now), RateDecision::Allowed { .. }),
                "request {} should pass",
                i + 1
            );
        }
        assert_eq!(limiter.check(ip(1), now), RateDecision::Blocked);
    }

    #[test]
    fn distinct_clients_have_separate_windows() {
        let limiter = RateLimiter::new(100, 300);
        let now = Utc::now();
        for n in 0..100 {
            assert_eq!(
                limiter.check(ip(n), now),
                RateDecision::Allowed { remaining: 99 }
            );
        }
        assert_eq!(limiter.tracked_clients(), 100);
    }

    #[test]
    fn window_resets_after_it_closes() {
        let limiter = RateLimiter::new(2, 300);
        let start = Utc::now();
        limiter.check(ip(1), start);
        limiter.check(ip(1), start);
        assert_eq!(
            limiter.check(ip(1), start + Duration::seconds(299)),
            RateDecision::Blocked
        );
        assert_eq!(
            limiter.check(ip(1), start + Duration::seconds(300)),
            RateDecision::Allowed { remaining: 1 }
        );
    }

    #[test]
    fn evicts_closed_windows() {
        let limiter = RateLimiter::new(5, 60);
        let start = Utc::now();
        limiter.check(ip(1), start);
        limiter.check(ip(2), start + Duration::seconds(30));
        limiter.evict_expired(start + Duration::seconds(61));
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn checking_sweeps_closed_windows() {
        let limiter = RateLimiter::new(100, 300);
        let start = Utc::now();
        for n in 0..50_000 {
            limiter.check(ip(n), start);
        }
        assert_eq!(limiter.tracked_clients(), 50_000);

        // still inside the window: nothing is swept
        limiter.check(ip(60_000), start + Duration::seconds(299));
        assert_eq!(limiter.tracked_clients(), 50_001);

        let next_day = start + Duration::days(1);
        assert_eq!(
            limiter.check(ip(1), next_day),
            RateDecision::Allowed { remaining: 99 }
        );
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn sweeping_keeps_open_windows() {
        let limiter = RateLimiter::new(2, 300);
        let start = Utc::now();
        limiter.check(ip(1), start);
        limiter.check(ip(2), start + Duration::seconds(200));
        limiter.check(ip(2), start + Duration::seconds(200));

        // sweep runs here; ip(2)'s window is still open and keeps its count
        assert_eq!(
            limiter.check(ip(2), start + Duration::seconds(300)),
            RateDecision::Blocked
        );
        assert_eq!(limiter.tracked_clients(), 1);
    }
}
