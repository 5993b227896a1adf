//! Authenticated session tracking.
//!
//! Sessions live in a `DashMap` keyed by session id so concurrent client
//! tasks never contend on a single lock. The live count is reserved with a
//! compare-and-swap before insertion, which keeps the ceiling exact under
//! concurrent `create_session` calls. Expiry is enforced lazily: every create
//! sweeps expired entries first, and validation evicts an expired hit.

use std::fmt::Write as _;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;

use chrono::{DateTime, Utc};
use dashmap::mapref::entry::Entry;
use dashmap::DashMap;
use rand::rngs::OsRng;
use rand::RngCore;
use serde::{Deserialize, Serialize};

use crate::config::SESSION_ID_BYTES;

/// One authenticated client context.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Session {
    /// 128-bit random token rendered as lowercase hex.
    pub session_id: String,
    pub client_pid: u32,
    pub executable_path: String,
    pub created_at_utc: DateTime<Utc>,
    /// Fixed at creation; activity does not extend it.
    pub expires_at_utc: DateTime<Utc>,
}

impl Session {
    pub fn is_expired_at(&self, now: DateTime<Utc>) -> bool {
        now >= self.expires_at_utc
    }
}

/// Capacity-limited, time-bounded session registry.
pub struct SessionManager {
    sessions: DashMap<String, Session>,
    live: AtomicUsize,
    max_sessions: usize,
    max_duration: chrono::Duration,
}

impl SessionManager {
    pub fn new(max_sessions: usize, max_duration: Duration) -> Self {
        Self {
            sessions: DashMap::new(),
            live: AtomicUsize::new(0),
            max_sessions,
            max_duration: chrono::Duration::from_std(max_duration)
                .unwrap_or(chrono::Duration::MAX),
        }
    }

    /// Create a session, or `None` when the ceiling is reached.
    pub fn create_session(&self, client_pid: u32, executable_path: &str) -> Option<Session> {
        self.create_session_at(client_pid, executable_path, Utc::now())
    }

    pub fn create_session_at(
        &self,
        client_pid: u32,
        executable_path: &str,
        now: DateTime<Utc>,
    ) -> Option<Session> {
        self.sweep_expired_at(now);

        let reserved = self
            .live
            .fetch_update(Ordering::AcqRel, Ordering::Acquire, |live| {
                (live < self.max_sessions).then_some(live + 1)
            });
        if reserved.is_err() {
            tracing::debug!(client_pid, "Session ceiling reached ({})", self.max_sessions);
            return None;
        }

        let expires_at_utc = now
            .checked_add_signed(self.max_duration)
            .unwrap_or(DateTime::<Utc>::MAX_UTC);
        loop {
            let session_id = match new_session_id() {
                Ok(id) => id,
                Err(e) => {
                    tracing::error!("Failed to generate session id: {e}");
                    self.live.fetch_sub(1, Ordering::AcqRel);
                    return None;
                }
            };
            if let Entry::Vacant(slot) = self.sessions.entry(session_id.clone()) {
                let session = Session {
                    session_id,
                    client_pid,
                    executable_path: executable_path.to_string(),
                    created_at_utc: now,
                    expires_at_utc,
                };
                slot.insert(session.clone());
                tracing::info!(
                    client_pid,
                    active = self.active_count(),
                    "Session created"
                );
                return Some(session);
            }
        }
    }

    /// Look up a live session. Expired hits are evicted and reported as `None`.
    pub fn validate_session(&self, session_id: &str) -> Option<Session> {
        self.validate_session_at(session_id, Utc::now())
    }

    pub fn validate_session_at(&self, session_id: &str, now: DateTime<Utc>) -> Option<Session> {
        let session = self.sessions.get(session_id)?.value().clone();
        if session.is_expired_at(now) {
            self.evict_if_expired(session_id, now);
            return None;
        }
        Some(session)
    }

    /// Remove a session. Returns `true` only if it existed.
    pub fn remove_session(&self, session_id: &str) -> bool {
        if self.sessions.remove(session_id).is_some() {
            self.live.fetch_sub(1, Ordering::AcqRel);
            true
        } else {
            false
        }
    }

    /// Number of live sessions. Expired entries are counted until swept.
    pub fn active_count(&self) -> usize {
        self.live.load(Ordering::Acquire)
    }

    pub fn max_sessions(&self) -> usize {
        self.max_sessions
    }

    /// Drop every expired session. Returns how many were removed.
    pub fn sweep_expired(&self) -> usize {
        self.sweep_expired_at(Utc::now())
    }

    pub fn sweep_expired_at(&self, now: DateTime<Utc>) -> usize {
        let expired: Vec<String> = self
            .sessions
            .iter()
            .filter(|entry| entry.value().is_expired_at(now))
            .map(|entry| entry.key().clone())
            .collect();
        expired
            .iter()
            .filter(|id| self.evict_if_expired(id, now))
            .count()
    }

    /// Remove every session. Used on helper shutdown.
    pub fn clear(&self) {
        let ids: Vec<String> = self.sessions.iter().map(|e| e.key().clone()).collect();
        for id in ids {
            self.remove_session(&id);
        }
    }

    fn evict_if_expired(&self, session_id: &str, now: DateTime<Utc>) -> bool {
        if self
            .sessions
            .remove_if(session_id, |_, s| s.is_expired_at(now))
            .is_some()
        {
            self.live.fetch_sub(1, Ordering::AcqRel);
            tracing::debug!("Expired session evicted");
            true
        } else {
            false
        }
    }
}

fn new_session_id() -> Result<String, rand::Error> {
    let mut bytes = [0u8; SESSION_ID_BYTES];
    OsRng.try_fill_bytes(&mut bytes)?;
    let mut id = String::with_capacity(SESSION_ID_BYTES * 2);
    for b in bytes {
        let _ = write!(id, "{b:02x}");
    }
    Ok(id)
}
