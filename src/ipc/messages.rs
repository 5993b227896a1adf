//! Request and response bodies.
//!
//! Bodies are `serde` structs encoded with `bincode` using fixed-width
//! little-endian integers and length-prefixed UTF-8 strings. Decoding is
//! bounded by [`MAX_MESSAGE_SIZE`] and rejects trailing bytes.

use bincode::Options;
use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::config::MAX_MESSAGE_SIZE;
use crate::core::traffic::{ProcessByteStats, ProcessConnectionStats};
use crate::ipc::ProtocolError;

// ---- Requests ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticateRequest {
    pub client_pid: u32,
    /// Unix seconds used in the signature.
    pub timestamp: i64,
    /// HMAC-SHA256 over `(client_pid, timestamp)`.
    pub signature: Vec<u8>,
    pub executable_path: String,
}

/// Body of session-scoped requests without further arguments
/// (`ConnectionStats`, `Heartbeat`).
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SessionRequest {
    pub session_id: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatsRequest {
    pub session_id: String,
    /// Restrict results to these PIDs. Empty means all.
    pub pid_filter: Vec<u32>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ShutdownRequest {
    pub session_id: String,
    pub reason: String,
}

// ---- Responses ----

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct AuthenticateResponse {
    pub success: bool,
    pub session_id: Option<String>,
    pub error_message: Option<String>,
    pub expires_at_utc: DateTime<Utc>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ConnectionStatsResponse {
    pub success: bool,
    pub processes: Vec<ProcessConnectionStats>,
    /// Set when per-connection detail was dropped to fit the message size cap.
    /// Per-process totals and counts are always complete.
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ProcessStatsResponse {
    pub success: bool,
    pub processes: Vec<ProcessByteStats>,
    /// Set when trailing processes were dropped to fit the message size cap.
    pub truncated: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HeartbeatResponse {
    pub alive: bool,
    pub uptime_seconds: u64,
    pub active_sessions: u32,
}

/// Body of an `Error` envelope.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub kind: String,
    pub message: String,
}

impl ConnectionStatsResponse {
    /// Shrink the snapshot until its encoded body is at most `max` bytes.
    ///
    /// Connection detail goes first, starting with the process holding the
    /// most connections. Whole processes are dropped only if the summaries
    /// alone still do not fit.
    pub fn fit_to(mut self, max: usize) -> Result<Self, ProtocolError> {
        let mut excess = encoded_len(&self)?.saturating_sub(max as u64);
        if excess == 0 {
            return Ok(self);
        }
        self.truncated = true;

        let mut busiest: Vec<usize> = (0..self.processes.len()).collect();
        busiest.sort_by_key(|&i| std::cmp::Reverse(self.processes[i].connections.len()));
        for i in busiest {
            let connections = &mut self.processes[i].connections;
            while excess > 0 {
                let Some(dropped) = connections.pop() else {
                    break;
                };
                excess = excess.saturating_sub(encoded_len(&dropped)?);
            }
            if excess == 0 {
                return Ok(self);
            }
        }
        while excess > 0 {
            let Some(dropped) = self.processes.pop() else {
                break;
            };
            excess = excess.saturating_sub(encoded_len(&dropped)?);
        }
        Ok(self)
    }
}

impl ProcessStatsResponse {
    /// Drop trailing processes until the encoded body is at most `max` bytes.
    pub fn fit_to(mut self, max: usize) -> Result<Self, ProtocolError> {
        let mut excess = encoded_len(&self)?.saturating_sub(max as u64);
        while excess > 0 {
            let Some(dropped) = self.processes.pop() else {
                break;
            };
            self.truncated = true;
            excess = excess.saturating_sub(encoded_len(&dropped)?);
        }
        Ok(self)
    }
}

/// Exact encoded size of `body`, without the message size limit.
fn encoded_len<T: Serialize>(body: &T) -> Result<u64, ProtocolError> {
    bincode::options()
        .with_fixint_encoding()
        .with_little_endian()
        .serialized_size(body)
        .map_err(|e| ProtocolError::Malformed(format!("body size failed: {e}")))
}

fn body_options() -> impl Options {
    bincode::options()
        .with_fixint_encoding()
        .with_little_endian()
        .with_limit(MAX_MESSAGE_SIZE as u64)
}

pub fn encode_body<T: Serialize>(body: &T) -> Result<Vec<u8>, ProtocolError> {
    body_options()
        .serialize(body)
        .map_err(|e| ProtocolError::Malformed(format!("body encode failed: {e}")))
}

pub fn decode_body<T: DeserializeOwned>(payload: &[u8]) -> Result<T, ProtocolError> {
    body_options()
        .deserialize(payload)
        .map_err(|e| ProtocolError::Malformed(format!("body decode failed: {e}")))
}
