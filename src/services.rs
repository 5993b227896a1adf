//! Background maintenance threads.
//!
//! `BackgroundServices` owns the periodic housekeeping that keeps the helper's
//! in-memory state bounded while no client is polling:
//! 1. Session sweeper (expired sessions)
//! 2. Rate-limit purger (idle limiter entries)
//! 3. Stale pruner (idle connections and processes in the tracker)

use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread::JoinHandle;
use std::time::Duration;

use anyhow::{Context, Result};

use crate::config;
use crate::ipc::HelperState;
use crate::tracker::sleep_until_shutdown;

pub struct BackgroundServices {
    shutdown: Arc<AtomicBool>,
}

impl BackgroundServices {
    /// Spawn all maintenance threads against `state`.
    pub fn start(state: &Arc<HelperState>) -> Result<Self> {
        let services = Self {
            shutdown: Arc::new(AtomicBool::new(false)),
        };

        services.spawn_periodic(
            "session-sweeper",
            Duration::from_secs(config::SESSION_SWEEP_INTERVAL_SECS),
            Arc::clone(state),
            sweep_sessions,
        )?;
        services.spawn_periodic(
            "rate-limit-purger",
            Duration::from_secs(config::RATE_LIMIT_PURGE_INTERVAL_SECS),
            Arc::clone(state),
            purge_rate_limits,
        )?;
        services.spawn_periodic(
            "stale-pruner",
            Duration::from_secs(config::STALE_PRUNE_INTERVAL_SECS),
            Arc::clone(state),
            prune_tracker,
        )?;

        tracing::info!("Background services started");
        Ok(services)
    }

    /// Signal every thread to exit. Threads are not joined.
    pub fn stop(&self) {
        if !self.shutdown.swap(true, Ordering::Relaxed) {
            tracing::info!("Background services stopping");
        }
    }

    pub fn is_stopped(&self) -> bool {
        self.shutdown.load(Ordering::Relaxed)
    }

    fn spawn_periodic(
        &self,
        name: &str,
        interval: Duration,
        state: Arc<HelperState>,
        task: fn(&HelperState),
    ) -> Result<JoinHandle<()>> {
        let shutdown = Arc::clone(&self.shutdown);
        std::thread::Builder::new()
            .name(name.into())
            .spawn(move || loop {
                sleep_until_shutdown(&shutdown, interval);
                if shutdown.load(Ordering::Relaxed) {
                    break;
                }
                task(&state);
            })
            .with_context(|| format!("failed to spawn {name} thread"))
    }
}

impl Drop for BackgroundServices {
    fn drop(&mut self) {
        self.stop();
    }
}

fn sweep_sessions(state: &HelperState) {
    let removed = state.sessions.sweep_expired();
    if removed > 0 {
        tracing::debug!("Swept {removed} expired session(s)");
    }
}

fn purge_rate_limits(state: &HelperState) {
    let max_idle = Duration::from_secs(config::RATE_LIMIT_IDLE_PURGE_SECS);
    let purged = state.request_limiter.purge_idle(max_idle) + state.auth_limiter.purge_idle(max_idle);
    if purged > 0 {
        tracing::debug!("Purged {purged} idle rate-limit entr(ies)");
    }
}

fn prune_tracker(state: &HelperState) {
    state.tracker.prune_stale(
        Duration::from_secs(config::STALE_CONNECTION_TIMEOUT_SECS),
        Duration::from_secs(config::STALE_PROCESS_TIMEOUT_SECS),
    );
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::HelperConfig;
    use crate::tracker::UnsupportedTracker;

    fn state_with(config: HelperConfig) -> Arc<HelperState> {
        Arc::new(HelperState::new(
            config,
            [3u8; 32],
            Arc::new(UnsupportedTracker::new()),
        ))
    }

    #[test]
    fn test_sweep_removes_expired_sessions() {
        let state = state_with(HelperConfig {
            max_session_duration: Duration::ZERO,
            ..HelperConfig::default()
        });
        state.sessions.create_session(1, "/app").unwrap();
        assert_eq!(state.sessions.active_count(), 1);
        sweep_sessions(&state);
        assert_eq!(state.sessions.active_count(), 0);
    }

    #[test]
    fn test_sweep_keeps_live_sessions() {
        let state = state_with(HelperConfig::default());
        state.sessions.create_session(1, "/app").unwrap();
        sweep_sessions(&state);
        assert_eq!(state.sessions.active_count(), 1);
    }

    #[test]
    fn test_purge_keeps_recent_limiter_entries() {
        let state = state_with(HelperConfig::default());
        assert!(state.request_limiter.try_acquire("session-a"));
        purge_rate_limits(&state);
        assert_eq!(state.request_limiter.tracked_clients(), 1);
    }

    #[test]
    fn test_prune_on_idle_tracker_is_harmless() {
        let state = state_with(HelperConfig::default());
        prune_tracker(&state);
        assert!(state.tracker.connection_stats().processes.is_empty());
    }

    #[test]
    fn test_start_and_stop_services() {
        let state = state_with(HelperConfig::default());
        let services = BackgroundServices::start(&state).unwrap();
        assert!(!services.is_stopped());
        services.stop();
        services.stop();
        assert!(services.is_stopped());
    }
}
