//! Shared helper state, one instance per process, handed to every connection task.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::{Duration, Instant};

use crate::config::HelperConfig;
use crate::core::auth::Secret;
use crate::core::rate_limiter::{AuthRateLimiter, RateLimiter};
use crate::core::session::SessionManager;
use crate::tracker::ConnectionTracker;

pub struct HelperState {
    pub config: HelperConfig,
    pub sessions: SessionManager,
    /// Per-session request throttling.
    pub request_limiter: RateLimiter,
    /// Per-connection authentication throttling and lockout.
    pub auth_limiter: AuthRateLimiter,
    pub tracker: Arc<dyn ConnectionTracker>,
    secret: Secret,
    started_at: Instant,
    next_connection_id: AtomicU64,
}

impl HelperState {
    pub fn new(config: HelperConfig, secret: Secret, tracker: Arc<dyn ConnectionTracker>) -> Self {
        Self {
            sessions: SessionManager::new(
                config.max_concurrent_sessions,
                config.max_session_duration,
            ),
            request_limiter: RateLimiter::new(config.max_requests_per_second),
            auth_limiter: AuthRateLimiter::new(
                config.max_auth_attempts_per_second,
                config.max_consecutive_auth_failures,
            ),
            config,
            tracker,
            secret,
            started_at: Instant::now(),
            next_connection_id: AtomicU64::new(1),
        }
    }

    pub fn secret(&self) -> &Secret {
        &self.secret
    }

    pub fn uptime(&self) -> Duration {
        self.started_at.elapsed()
    }

    pub fn next_connection_id(&self) -> u64 {
        self.next_connection_id.fetch_add(1, Ordering::Relaxed)
    }
}
