//! Fixed-window request throttling per client key.
//!
//! Each client key owns a window that starts at its first acquisition and
//! admits at most `max_per_window` acquisitions. The window resets once
//! `window_start + window` has been reached, never before. State lives in a
//! `DashMap`, so the per-key update is atomic without a global lock.
//!
//! [`AuthRateLimiter`] layers a consecutive-failure counter on top, used to
//! slow brute-force signature guessing.

use std::time::{Duration, Instant};

use dashmap::DashMap;

use crate::config::RATE_LIMIT_WINDOW_MS;

#[derive(Debug, Clone, Copy)]
struct WindowState {
    window_start: Instant,
    count: u32,
    last_seen: Instant,
}

/// Per-client fixed-window limiter.
pub struct RateLimiter {
    windows: DashMap<String, WindowState>,
    max_per_window: u32,
    window: Duration,
}

impl RateLimiter {
    /// Limiter admitting `max_requests_per_second` acquisitions per 1-second window.
    pub fn new(max_requests_per_second: u32) -> Self {
        Self::with_window(
            max_requests_per_second,
            Duration::from_millis(RATE_LIMIT_WINDOW_MS),
        )
    }

    pub fn with_window(max_per_window: u32, window: Duration) -> Self {
        Self {
            windows: DashMap::new(),
            max_per_window,
            window,
        }
    }

    /// Try to take one slot for `client_key` in the current window.
    pub fn try_acquire(&self, client_key: &str) -> bool {
        self.try_acquire_at(client_key, Instant::now())
    }

    pub fn try_acquire_at(&self, client_key: &str, now: Instant) -> bool {
        let mut state = self
            .windows
            .entry(client_key.to_string())
            .or_insert(WindowState {
                window_start: now,
                count: 0,
                last_seen: now,
            });
        if now.saturating_duration_since(state.window_start) >= self.window {
            state.window_start = now;
            state.count = 0;
        }
        state.last_seen = now;
        if state.count < self.max_per_window {
            state.count += 1;
            true
        } else {
            false
        }
    }

    /// Forget `client_key`; its next acquisition opens a fresh window.
    pub fn remove_client(&self, client_key: &str) {
        self.windows.remove(client_key);
    }

    /// Drop clients not seen for `max_idle`. Returns how many were removed.
    pub fn purge_idle(&self, max_idle: Duration) -> usize {
        self.purge_idle_at(max_idle, Instant::now())
    }

    pub fn purge_idle_at(&self, max_idle: Duration, now: Instant) -> usize {
        let before = self.windows.len();
        self.windows
            .retain(|_, state| now.saturating_duration_since(state.last_seen) < max_idle);
        before.saturating_sub(self.windows.len())
    }

    pub fn tracked_clients(&self) -> usize {
        self.windows.len()
    }
}

/// Rate limiter for authentication attempts with a consecutive-failure lockout.
///
/// A lockout lasts until the key has seen no failures for the idle purge
/// period; see [`AuthRateLimiter::purge_idle`].
pub struct AuthRateLimiter {
    attempts: RateLimiter,
    failures: DashMap<String, FailureRecord>,
    max_consecutive_failures: u32,
}

#[derive(Debug, Clone, Copy)]
struct FailureRecord {
    count: u32,
    last_failure: Instant,
}

impl AuthRateLimiter {
    pub fn new(max_attempts_per_second: u32, max_consecutive_failures: u32) -> Self {
        Self {
            attempts: RateLimiter::new(max_attempts_per_second),
            failures: DashMap::new(),
            max_consecutive_failures,
        }
    }

    /// Throttle authentication attempts like [`RateLimiter::try_acquire`].
    pub fn try_acquire(&self, client_key: &str) -> bool {
        self.attempts.try_acquire(client_key)
    }

    pub fn try_acquire_at(&self, client_key: &str, now: Instant) -> bool {
        self.attempts.try_acquire_at(client_key, now)
    }

    /// Count one failed attempt. Returns `true` once the lockout threshold is
    /// reached (the Nth failure, not the N+1th).
    pub fn record_failure(&self, client_key: &str) -> bool {
        self.record_failure_at(client_key, Instant::now())
    }

    pub fn record_failure_at(&self, client_key: &str, now: Instant) -> bool {
        let mut record = self
            .failures
            .entry(client_key.to_string())
            .or_insert(FailureRecord {
                count: 0,
                last_failure: now,
            });
        record.count = record.count.saturating_add(1);
        record.last_failure = now;
        let locked = record.count >= self.max_consecutive_failures;
        if locked {
            tracing::warn!(
                client = client_key,
                failures = record.count,
                "Authentication lockout threshold reached"
            );
        }
        locked
    }

    /// A successful authentication resets the failure counter.
    pub fn record_success(&self, client_key: &str) {
        self.failures.remove(client_key);
    }

    pub fn is_locked_out(&self, client_key: &str) -> bool {
        self.failures
            .get(client_key)
            .is_some_and(|f| f.count >= self.max_consecutive_failures)
    }

    pub fn consecutive_failures(&self, client_key: &str) -> u32 {
        self.failures.get(client_key).map(|f| f.count).unwrap_or(0)
    }

    /// Discard all state for `client_key`.
    pub fn remove_client(&self, client_key: &str) {
        self.attempts.remove_client(client_key);
        self.failures.remove(client_key);
    }

    /// Drop idle attempt windows and failure records whose last failure is
    /// older than `max_idle`. Expiring a failure record lifts its lockout.
    pub fn purge_idle(&self, max_idle: Duration) -> usize {
        self.purge_idle_at(max_idle, Instant::now())
    }

    pub fn purge_idle_at(&self, max_idle: Duration, now: Instant) -> usize {
        let before = self.failures.len();
        self.failures
            .retain(|_, f| now.saturating_duration_since(f.last_failure) < max_idle);
        self.attempts.purge_idle_at(max_idle, now) + before.saturating_sub(self.failures.len())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_allows_exactly_k_then_denies() {
        let limiter = RateLimiter::new(3);
        let now = Instant::now();
        assert!(limiter.try_acquire_at("a", now));
        assert!(limiter.try_acquire_at("a", now));
        assert!(limiter.try_acquire_at("a", now));
        assert!(!limiter.try_acquire_at("a", now));
    }

    #[test]
    fn test_window_resets_exactly_at_boundary() {
        let limiter = RateLimiter::new(1);
        let start = Instant::now();
        assert!(limiter.try_acquire_at("a", start));
        assert!(!limiter.try_acquire_at("a", start + Duration::from_millis(999)));
        assert!(limiter.try_acquire_at("a", start + Duration::from_millis(1000)));
        assert!(!limiter.try_acquire_at("a", start + Duration::from_millis(1500)));
    }

    #[test]
    fn test_denied_requests_do_not_extend_window() {
        let limiter = RateLimiter::new(1);
        let start = Instant::now();
        assert!(limiter.try_acquire_at("a", start));
        for ms in [100, 500, 900] {
            assert!(!limiter.try_acquire_at("a", start + Duration::from_millis(ms)));
        }
        assert!(limiter.try_acquire_at("a", start + Duration::from_millis(1000)));
    }

    #[test]
    fn test_clients_are_independent() {
        let limiter = RateLimiter::new(1);
        let now = Instant::now();
        assert!(limiter.try_acquire_at("a", now));
        assert!(!limiter.try_acquire_at("a", now));
        assert!(limiter.try_acquire_at("b", now));
    }

    #[test]
    fn test_remove_client_grants_fresh_window() {
        let limiter = RateLimiter::new(1);
        let now = Instant::now();
        assert!(limiter.try_acquire_at("a", now));
        assert!(!limiter.try_acquire_at("a", now));
        limiter.remove_client("a");
        assert!(limiter.try_acquire_at("a", now));
    }

    #[test]
    fn test_purge_idle_removes_only_stale_clients() {
        let limiter = RateLimiter::new(5);
        let start = Instant::now();
        limiter.try_acquire_at("old", start);
        limiter.try_acquire_at("fresh", start + Duration::from_secs(50));
        let removed = limiter.purge_idle_at(Duration::from_secs(30), start + Duration::from_secs(60));
        assert_eq!(removed, 1);
        assert_eq!(limiter.tracked_clients(), 1);
    }

    #[test]
    fn test_zero_budget_denies_everything() {
        let limiter = RateLimiter::new(0);
        assert!(!limiter.try_acquire("a"));
    }

    #[test]
    fn test_record_failure_triggers_on_nth_call() {
        let limiter = AuthRateLimiter::new(10, 3);
        assert!(!limiter.record_failure("c"));
        assert!(!limiter.record_failure("c"));
        assert!(limiter.record_failure("c"));
        assert!(limiter.is_locked_out("c"));
        assert!(limiter.record_failure("c"), "stays locked past the threshold");
    }

    #[test]
    fn test_success_resets_failure_counter() {
        let limiter = AuthRateLimiter::new(10, 3);
        limiter.record_failure("c");
        limiter.record_failure("c");
        limiter.record_success("c");
        assert_eq!(limiter.consecutive_failures("c"), 0);
        assert!(!limiter.record_failure("c"));
        assert!(!limiter.is_locked_out("c"));
    }

    #[test]
    fn test_auth_remove_client_clears_failures_and_window() {
        let limiter = AuthRateLimiter::new(1, 2);
        let now = Instant::now();
        assert!(limiter.try_acquire_at("c", now));
        assert!(!limiter.try_acquire_at("c", now));
        limiter.record_failure("c");
        limiter.record_failure("c");
        limiter.remove_client("c");
        assert!(!limiter.is_locked_out("c"));
        assert!(limiter.try_acquire_at("c", now));
    }

    #[test]
    fn test_lockout_expires_after_idle_purge() {
        let limiter = AuthRateLimiter::new(10, 2);
        let start = Instant::now();
        limiter.record_failure_at("pid-7", start);
        assert!(limiter.record_failure_at("pid-7", start + Duration::from_secs(1)));

        limiter.purge_idle_at(Duration::from_secs(300), start + Duration::from_secs(200));
        assert!(limiter.is_locked_out("pid-7"), "lockout holds within the idle period");

        limiter.purge_idle_at(Duration::from_secs(300), start + Duration::from_secs(301));
        assert!(!limiter.is_locked_out("pid-7"));
        assert_eq!(limiter.consecutive_failures("pid-7"), 0);
    }
}
