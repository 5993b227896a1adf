//! Core logic: authentication, sessions, throttling, connection accounting.
//!
//! - [`HmacAuthenticator`] — HMAC-SHA256 challenge signing and validation
//! - [`SessionManager`] — bounded, expiring authenticated sessions
//! - [`RateLimiter`] / [`AuthRateLimiter`] — fixed-window throttling and auth lockout
//! - [`SecretStore`] — shared secret file provisioning
//! - [`ProcessMapper`] — socket ↔ PID resolution and process name caching
//! - [`ConnectionTable`] — per-connection and per-process byte accounting
//! - [`proc_net`] — Linux `/proc/net` table parsing
//! - `win_net_table` — iphlpapi FFI for TCP/UDP owner tables (Windows)

pub mod auth;
pub mod proc_net;
pub mod process_mapper;
pub mod rate_limiter;
pub mod secret;
pub mod session;
pub mod traffic;
#[cfg(windows)]
pub mod win_net_table;

pub use auth::{HmacAuthenticator, Secret};
pub use process_mapper::{ProcessMapper, Protocol};
pub use rate_limiter::{AuthRateLimiter, RateLimiter};
pub use secret::SecretStore;
pub use session::{Session, SessionManager};
pub use traffic::{
    make_connection_key, ConnectionByteStats, ConnectionTable, ObservedConnection,
    ProcessByteStats, ProcessConnectionStats,
};
