//! Centralized runtime constants and configuration for the NetGuard helper.
//!
//! All limits, intervals, and thresholds are collected here so they can be
//! found and adjusted in a single place rather than scattered across modules.
//! [`HelperConfig`] bundles the values a deployment may override through
//! environment variables.

use std::path::PathBuf;
use std::time::Duration;

/// Maximum envelope payload size in bytes (1 MiB).
pub const MAX_MESSAGE_SIZE: usize = 1024 * 1024;

/// Maximum length of a request correlation id in bytes.
pub const MAX_REQUEST_ID_LEN: usize = 128;

/// Fixed envelope overhead: type tag + request id length + payload length.
pub const ENVELOPE_FIXED_HEADER_LEN: usize = 12;

/// Room reserved in a frame for the envelope header around the payload.
pub const ENVELOPE_HEADER_RESERVE: usize = ENVELOPE_FIXED_HEADER_LEN + MAX_REQUEST_ID_LEN;

/// Largest frame body accepted from the stream (the 4-byte length header excluded).
pub const MAX_FRAME_SIZE: usize = MAX_MESSAGE_SIZE + ENVELOPE_HEADER_RESERVE;

/// Maximum number of live authenticated sessions.
pub const MAX_CONCURRENT_SESSIONS: usize = 10;

/// Lifetime of a session from creation (seconds). Not renewed by activity.
pub const MAX_SESSION_DURATION_SECS: u64 = 3600;

/// Per-session request budget within one rate-limit window.
pub const MAX_REQUESTS_PER_SECOND: u32 = 50;

/// Per-connection authentication attempts within one rate-limit window.
pub const MAX_AUTH_ATTEMPTS_PER_SECOND: u32 = 5;

/// Consecutive authentication failures that lock a connection out.
pub const MAX_CONSECUTIVE_AUTH_FAILURES: u32 = 5;

/// Accepted clock skew for authentication timestamps (seconds, inclusive).
pub const AUTH_MAX_AGE_SECS: u64 = 30;

/// Length of the shared HMAC secret in bytes.
pub const SECRET_LEN: usize = 32;

/// Random bytes in a session id (rendered as 32 hex characters).
pub const SESSION_ID_BYTES: usize = 16;

/// Length of the rate-limit window (milliseconds).
pub const RATE_LIMIT_WINDOW_MS: u64 = 1000;

/// Interval at which the socket table / proc tables are re-read (milliseconds).
pub const PROCESS_SCAN_INTERVAL_MS: u64 = 500;

/// Interval at which expired sessions are swept in the background (seconds).
pub const SESSION_SWEEP_INTERVAL_SECS: u64 = 30;

/// Rate-limit entries untouched for longer than this are purged (seconds).
pub const RATE_LIMIT_IDLE_PURGE_SECS: u64 = 300;

/// Interval between idle rate-limit purges (seconds).
pub const RATE_LIMIT_PURGE_INTERVAL_SECS: u64 = 60;

/// Interval between stale connection prunes (seconds).
pub const STALE_PRUNE_INTERVAL_SECS: u64 = 10;

/// Connections with no observed traffic for longer than this are pruned (seconds).
pub const STALE_CONNECTION_TIMEOUT_SECS: u64 = 60;

/// Processes with no connections and no traffic for longer than this are dropped (seconds).
pub const STALE_PROCESS_TIMEOUT_SECS: u64 = 300;

/// Named pipe used on Windows.
pub const DEFAULT_PIPE_NAME: &str = r"\\.\pipe\netguard-helper";

/// Socket file name used on unix platforms.
pub const DEFAULT_SOCKET_NAME: &str = "helper.sock";

/// Subdirectory under the runtime directory holding the socket and secret.
pub const DEFAULT_SUBDIR: &str = "netguard";

/// Shared secret file name.
pub const DEFAULT_SECRET_FILE_NAME: &str = "helper.secret";

const ENV_ENDPOINT: &str = "NETGUARD_HELPER_ENDPOINT";
const ENV_SECRET_FILE: &str = "NETGUARD_HELPER_SECRET_FILE";
const ENV_CLIENT_PATH: &str = "NETGUARD_HELPER_CLIENT_PATH";

/// Runtime configuration of the helper process.
#[derive(Debug, Clone)]
pub struct HelperConfig {
    /// Unix socket path or Windows pipe name.
    pub endpoint: String,
    /// File holding the base64-encoded shared secret.
    pub secret_file: PathBuf,
    /// When set, only clients reporting this executable path may authenticate.
    pub allowed_client_path: Option<String>,
    pub max_concurrent_sessions: usize,
    pub max_session_duration: Duration,
    pub max_requests_per_second: u32,
    pub max_auth_attempts_per_second: u32,
    pub max_consecutive_auth_failures: u32,
    pub auth_max_age_secs: u64,
}

impl Default for HelperConfig {
    fn default() -> Self {
        Self {
            endpoint: default_endpoint(),
            secret_file: default_runtime_dir().join(DEFAULT_SECRET_FILE_NAME),
            allowed_client_path: None,
            max_concurrent_sessions: MAX_CONCURRENT_SESSIONS,
            max_session_duration: Duration::from_secs(MAX_SESSION_DURATION_SECS),
            max_requests_per_second: MAX_REQUESTS_PER_SECOND,
            max_auth_attempts_per_second: MAX_AUTH_ATTEMPTS_PER_SECOND,
            max_consecutive_auth_failures: MAX_CONSECUTIVE_AUTH_FAILURES,
            auth_max_age_secs: AUTH_MAX_AGE_SECS,
        }
    }
}

impl HelperConfig {
    /// Defaults overridden by `NETGUARD_HELPER_*` environment variables.
    pub fn from_env() -> Self {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    fn from_lookup(lookup: impl Fn(&str) -> Option<String>) -> Self {
        let mut config = Self::default();
        if let Some(endpoint) = lookup(ENV_ENDPOINT).filter(|v| !v.is_empty()) {
            config.endpoint = endpoint;
        }
        if let Some(path) = lookup(ENV_SECRET_FILE).filter(|v| !v.is_empty()) {
            config.secret_file = PathBuf::from(path);
        }
        config.allowed_client_path = lookup(ENV_CLIENT_PATH).filter(|v| !v.is_empty());
        config
    }
}

/// Directory holding the helper socket and secret.
///
/// Priority:
/// 1. `%ProgramData%\NetGuard` on Windows
/// 2. `XDG_RUNTIME_DIR/netguard` if `XDG_RUNTIME_DIR` is set
/// 3. `/tmp/netguard` as fallback
pub fn default_runtime_dir() -> PathBuf {
    if cfg!(windows) {
        return std::env::var("ProgramData")
            .map_or_else(|_| PathBuf::from(r"C:\ProgramData"), PathBuf::from)
            .join("NetGuard");
    }
    std::env::var("XDG_RUNTIME_DIR")
        .map_or_else(|_| PathBuf::from("/tmp"), PathBuf::from)
        .join(DEFAULT_SUBDIR)
}

/// Platform default IPC endpoint.
pub fn default_endpoint() -> String {
    if cfg!(windows) {
        DEFAULT_PIPE_NAME.to_string()
    } else {
        default_runtime_dir()
            .join(DEFAULT_SOCKET_NAME)
            .to_string_lossy()
            .into_owned()
    }
}
