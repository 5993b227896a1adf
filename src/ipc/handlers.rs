//! Request handling, independent of the transport.
//!
//! [`handle_envelope`] turns one request envelope into an [`Outcome`]. The
//! server loop writes the reply (if any) and closes the connection when told
//! to. Order for session-scoped requests: session validation, then request
//! throttling, then the actual work.

use chrono::{DateTime, Utc};
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::config::MAX_MESSAGE_SIZE;
use crate::core::auth::HmacAuthenticator;
use crate::core::session::Session;
use crate::error::HelperError;
use crate::ipc::envelope::{Envelope, MessageType};
use crate::ipc::messages::{
    decode_body, encode_body, AuthenticateRequest, AuthenticateResponse, HeartbeatResponse,
    ProcessStatsRequest, SessionRequest, ShutdownRequest,
};
use crate::ipc::state::HelperState;

/// What the connection loop should do after a request.
#[derive(Debug, PartialEq, Eq)]
pub enum Outcome {
    Reply(Envelope),
    /// Send the reply, then close the connection.
    ReplyAndClose(Envelope),
    /// Close without replying.
    Close,
}

/// Per-connection bookkeeping.
#[derive(Debug)]
pub struct ConnectionContext {
    pub connection_id: u64,
    /// PID of the connecting process as reported by the OS, when available.
    pub peer_pid: Option<u32>,
    sessions: Vec<String>,
}

impl ConnectionContext {
    pub fn new(connection_id: u64, peer_pid: Option<u32>) -> Self {
        Self {
            connection_id,
            peer_pid,
            sessions: Vec::new(),
        }
    }

    /// Rate-limit key for unauthenticated traffic on this connection.
    pub fn client_key(&self) -> String {
        format!("conn-{}", self.connection_id)
    }

    /// Key for authentication throttling and lockout. The peer process when
    /// the OS reports it, so reconnecting does not reset the failure count;
    /// otherwise the connection.
    pub fn auth_key(&self) -> String {
        match self.peer_pid {
            Some(pid) => format!("pid-{pid}"),
            None => self.client_key(),
        }
    }

    /// Sessions created over this connection and still owned by it.
    pub fn sessions(&self) -> &[String] {
        &self.sessions
    }

    fn forget_session(&mut self, session_id: &str) {
        self.sessions.retain(|s| s != session_id);
    }

    /// Drop every session and connection-scoped limiter entry this
    /// connection created. Per-process auth failures outlive the connection.
    pub fn release(&mut self, state: &HelperState) {
        for session_id in self.sessions.drain(..) {
            state.sessions.remove_session(&session_id);
            state.request_limiter.remove_client(&session_id);
        }
        state.auth_limiter.remove_client(&self.client_key());
    }
}

pub fn handle_envelope(state: &HelperState, ctx: &mut ConnectionContext, request: Envelope) -> Outcome {
    let request_id = request.request_id.clone();
    let message_type = request.message_type;
    match dispatch(state, ctx, request) {
        Ok(outcome) => outcome,
        Err(err) => {
            tracing::debug!(
                connection = ctx.connection_id,
                %message_type,
                kind = err.kind(),
                "Request failed: {err}"
            );
            let fatal = matches!(err, HelperError::Protocol(_));
            match error_envelope(&request_id, &err) {
                Ok(reply) if fatal => Outcome::ReplyAndClose(reply),
                Ok(reply) => Outcome::Reply(reply),
                Err(_) => Outcome::Close,
            }
        }
    }
}

/// Encode `err` as an `Error` envelope.
pub fn error_envelope(request_id: &str, err: &HelperError) -> Result<Envelope, HelperError> {
    reply(MessageType::Error, request_id, &err.to_response())
}

/// Encode a reply. Failing to encode our own response is a helper fault,
/// not a client protocol violation, so it never closes the connection.
fn reply<T: Serialize>(
    message_type: MessageType,
    request_id: &str,
    body: &T,
) -> Result<Envelope, HelperError> {
    let payload = encode_body(body)
        .map_err(|e| HelperError::Io(format!("failed to encode {message_type} response: {e}")))?;
    Ok(Envelope::new(message_type, request_id, payload))
}

fn body<T: DeserializeOwned>(request: &Envelope) -> Result<T, HelperError> {
    Ok(decode_body(&request.payload)?)
}

fn dispatch(
    state: &HelperState,
    ctx: &mut ConnectionContext,
    request: Envelope,
) -> Result<Outcome, HelperError> {
    let rid = request.request_id.as_str();
    match request.message_type {
        MessageType::Authenticate => authenticate(state, ctx, rid, body(&request)?),
        MessageType::ConnectionStats => {
            let req: SessionRequest = body(&request)?;
            authorize(state, &req.session_id)?;
            let stats = state
                .tracker
                .connection_stats()
                .fit_to(MAX_MESSAGE_SIZE)
                .map_err(|e| HelperError::Io(e.to_string()))?;
            Ok(Outcome::Reply(reply(MessageType::ConnectionStats, rid, &stats)?))
        }
        MessageType::ProcessStats => {
            let req: ProcessStatsRequest = body(&request)?;
            authorize(state, &req.session_id)?;
            let stats = state
                .tracker
                .process_stats(&req.pid_filter)
                .fit_to(MAX_MESSAGE_SIZE)
                .map_err(|e| HelperError::Io(e.to_string()))?;
            Ok(Outcome::Reply(reply(MessageType::ProcessStats, rid, &stats)?))
        }
        MessageType::Heartbeat => {
            let req: SessionRequest = body(&request)?;
            authorize(state, &req.session_id)?;
            let heartbeat = HeartbeatResponse {
                alive: true,
                uptime_seconds: state.uptime().as_secs(),
                active_sessions: state.sessions.active_count() as u32,
            };
            Ok(Outcome::Reply(reply(MessageType::Heartbeat, rid, &heartbeat)?))
        }
        MessageType::Shutdown => {
            let req: ShutdownRequest = body(&request)?;
            let session = authorize(state, &req.session_id)?;
            state.sessions.remove_session(&session.session_id);
            state.request_limiter.remove_client(&session.session_id);
            ctx.forget_session(&session.session_id);
            tracing::info!(
                connection = ctx.connection_id,
                client_pid = session.client_pid,
                reason = %req.reason,
                "Client requested shutdown"
            );
            Ok(Outcome::Close)
        }
        MessageType::Error => Err(HelperError::Protocol(
            "clients may not send Error messages".into(),
        )),
    }
}

/// Validate the session, then charge one request against its budget.
fn authorize(state: &HelperState, session_id: &str) -> Result<Session, HelperError> {
    let session = state
        .sessions
        .validate_session(session_id)
        .ok_or_else(|| HelperError::Authentication("unknown or expired session".into()))?;
    if !state.request_limiter.try_acquire(session_id) {
        return Err(HelperError::RateLimited(format!(
            "request limit of {} per second exceeded",
            state.config.max_requests_per_second
        )));
    }
    Ok(session)
}

fn authenticate(
    state: &HelperState,
    ctx: &mut ConnectionContext,
    request_id: &str,
    req: AuthenticateRequest,
) -> Result<Outcome, HelperError> {
    let key = ctx.auth_key();
    if !state.auth_limiter.try_acquire(&key) {
        return Err(HelperError::RateLimited(
            "too many authentication attempts".into(),
        ));
    }
    if state.auth_limiter.is_locked_out(&key) {
        let response = failed_auth("too many failed authentication attempts");
        return Ok(Outcome::ReplyAndClose(reply(
            MessageType::Authenticate,
            request_id,
            &response,
        )?));
    }

    if let Err(reason) = verify_client(state, ctx, &req) {
        let locked = state.auth_limiter.record_failure(&key);
        tracing::warn!(
            connection = ctx.connection_id,
            client_pid = req.client_pid,
            peer_pid = ?ctx.peer_pid,
            failures = state.auth_limiter.consecutive_failures(&key),
            "Authentication rejected: {reason}"
        );
        let response = failed_auth(reason);
        let envelope = reply(MessageType::Authenticate, request_id, &response)?;
        return Ok(if locked {
            Outcome::ReplyAndClose(envelope)
        } else {
            Outcome::Reply(envelope)
        });
    }

    let session = state
        .sessions
        .create_session(req.client_pid, &req.executable_path)
        .ok_or_else(|| {
            HelperError::Capacity(format!(
                "session limit of {} reached",
                state.sessions.max_sessions()
            ))
        })?;
    state.auth_limiter.record_success(&key);
    ctx.sessions.push(session.session_id.clone());
    tracing::info!(
        connection = ctx.connection_id,
        client_pid = session.client_pid,
        expires_at = %session.expires_at_utc,
        "Client authenticated"
    );

    let response = AuthenticateResponse {
        success: true,
        session_id: Some(session.session_id),
        error_message: None,
        expires_at_utc: session.expires_at_utc,
    };
    Ok(Outcome::Reply(reply(
        MessageType::Authenticate,
        request_id,
        &response,
    )?))
}

fn verify_client(
    state: &HelperState,
    ctx: &ConnectionContext,
    req: &AuthenticateRequest,
) -> Result<(), &'static str> {
    if ctx.peer_pid.is_some_and(|peer| peer != req.client_pid) {
        return Err("client pid does not match the connecting process");
    }
    if let Some(allowed) = &state.config.allowed_client_path {
        if &req.executable_path != allowed {
            return Err("client executable is not allowed");
        }
    }
    if !HmacAuthenticator::validate(
        req.client_pid,
        req.timestamp,
        &req.signature,
        state.secret(),
        state.config.auth_max_age_secs,
    ) {
        return Err("invalid or expired signature");
    }
    Ok(())
}

fn failed_auth(reason: &str) -> AuthenticateResponse {
    AuthenticateResponse {
        success: false,
        session_id: None,
        error_message: Some(reason.to_string()),
        expires_at_utc: DateTime::<Utc>::default(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use crate::config::{HelperConfig, SECRET_LEN};
    use crate::core::auth::unix_now;
    use crate::core::process_mapper::Protocol;
    use crate::ipc::messages::{
        ConnectionStatsResponse, ErrorResponse, ProcessStatsResponse,
    };
    use crate::tracker::{ConnectionTracker, TrackerCore};

    const SECRET: [u8; SECRET_LEN] = [0x42; SECRET_LEN];

    /// Tracker whose table is filled directly by the test.
    struct FixedTracker {
        core: TrackerCore,
    }

    impl ConnectionTracker for FixedTracker {
        fn name(&self) -> &'static str {
            "fixed"
        }

        fn start(&self) -> anyhow::Result<()> {
            self.core.start_with(self.name(), || Ok(Vec::new()))
        }

        fn core(&self) -> &TrackerCore {
            &self.core
        }
    }

    fn state_with(config: HelperConfig) -> HelperState {
        let tracker = FixedTracker {
            core: TrackerCore::new(),
        };
        tracker.start().unwrap();
        tracker.core.table.record_bytes(
            500,
            Protocol::Tcp,
            "10.0.0.2:50000".parse().unwrap(),
            "1.1.1.1:443".parse().unwrap(),
            1000,
            2000,
        );
        tracker.core.table.record_bytes(
            600,
            Protocol::Udp,
            "10.0.0.2:5353".parse().unwrap(),
            "224.0.0.251:5353".parse().unwrap(),
            10,
            0,
        );
        HelperState::new(config, SECRET, Arc::new(tracker))
    }

    fn test_state() -> HelperState {
        state_with(HelperConfig::default())
    }

    fn auth_envelope(pid: u32, secret: &[u8], exe: &str) -> Envelope {
        let timestamp = unix_now();
        let req = AuthenticateRequest {
            client_pid: pid,
            timestamp,
            signature: HmacAuthenticator::sign(pid, timestamp, secret),
            executable_path: exe.into(),
        };
        Envelope::new(MessageType::Authenticate, "auth", encode_body(&req).unwrap())
    }

    fn session_envelope(message_type: MessageType, session_id: &str) -> Envelope {
        let req = SessionRequest {
            session_id: session_id.into(),
        };
        Envelope::new(message_type, "r", encode_body(&req).unwrap())
    }

    fn expect_reply(outcome: Outcome) -> Envelope {
        match outcome {
            Outcome::Reply(env) => env,
            other => panic!("expected Reply, got {other:?}"),
        }
    }

    fn expect_error(outcome: Outcome) -> ErrorResponse {
        let env = expect_reply(outcome);
        assert_eq!(env.message_type, MessageType::Error);
        decode_body(&env.payload).unwrap()
    }

    fn login(state: &HelperState, ctx: &mut ConnectionContext) -> String {
        let env = expect_reply(handle_envelope(
            state,
            ctx,
            auth_envelope(100, &SECRET, "/opt/netguard/app"),
        ));
        let resp: AuthenticateResponse = decode_body(&env.payload).unwrap();
        assert!(resp.success, "{:?}", resp.error_message);
        resp.session_id.unwrap()
    }

    #[test]
    fn test_authenticate_success_creates_session() {
        let state = test_state();
        let mut ctx = ConnectionContext::new(1, Some(100));
        let env = expect_reply(handle_envelope(
            &state,
            &mut ctx,
            auth_envelope(100, &SECRET, "/opt/netguard/app"),
        ));
        assert_eq!(env.message_type, MessageType::Authenticate);
        assert_eq!(env.request_id, "auth");
        let resp: AuthenticateResponse = decode_body(&env.payload).unwrap();
        assert!(resp.success);
        assert!(resp.error_message.is_none());
        let sid = resp.session_id.unwrap();
        assert_eq!(sid.len(), 32);
        assert!(resp.expires_at_utc > Utc::now());
        assert_eq!(ctx.sessions(), &[sid]);
        assert_eq!(state.sessions.active_count(), 1);
    }

    #[test]
    fn test_authenticate_wrong_secret_fails() {
        let state = test_state();
        let mut ctx = ConnectionContext::new(1, None);
        let env = expect_reply(handle_envelope(
            &state,
            &mut ctx,
            auth_envelope(100, &[1u8; SECRET_LEN], "/app"),
        ));
        let resp: AuthenticateResponse = decode_body(&env.payload).unwrap();
        assert!(!resp.success);
        assert!(resp.session_id.is_none());
        assert!(resp.error_message.unwrap().contains("signature"));
        assert_eq!(state.sessions.active_count(), 0);
    }

    #[test]
    fn test_authenticate_peer_pid_mismatch_fails() {
        let state = test_state();
        let mut ctx = ConnectionContext::new(1, Some(999));
        let env = expect_reply(handle_envelope(
            &state,
            &mut ctx,
            auth_envelope(100, &SECRET, "/app"),
        ));
        let resp: AuthenticateResponse = decode_body(&env.payload).unwrap();
        assert!(!resp.success);
        assert!(resp.error_message.unwrap().contains("pid"));
    }

    #[test]
    fn test_authenticate_enforces_allowed_client_path() {
        let config = HelperConfig {
            allowed_client_path: Some("/opt/netguard/app".into()),
            ..HelperConfig::default()
        };
        let state = state_with(config);
        let mut ctx = ConnectionContext::new(1, None);
        let env = expect_reply(handle_envelope(
            &state,
            &mut ctx,
            auth_envelope(100, &SECRET, "/tmp/evil"),
        ));
        let resp: AuthenticateResponse = decode_body(&env.payload).unwrap();
        assert!(!resp.success);
        login(&state, &mut ctx);
    }

    #[test]
    fn test_lockout_closes_connection_on_nth_failure() {
        let config = HelperConfig {
            max_consecutive_auth_failures: 3,
            ..HelperConfig::default()
        };
        let state = state_with(config);
        let mut ctx = ConnectionContext::new(7, None);
        let bad = || auth_envelope(100, &[9u8; SECRET_LEN], "/app");
        assert!(matches!(handle_envelope(&state, &mut ctx, bad()), Outcome::Reply(_)));
        assert!(matches!(handle_envelope(&state, &mut ctx, bad()), Outcome::Reply(_)));
        assert!(matches!(
            handle_envelope(&state, &mut ctx, bad()),
            Outcome::ReplyAndClose(_)
        ));
    }

    #[test]
    fn test_lockout_survives_reconnect_from_same_process() {
        let config = HelperConfig {
            max_consecutive_auth_failures: 2,
            ..HelperConfig::default()
        };
        let state = state_with(config);
        let bad = || auth_envelope(100, &[9u8; SECRET_LEN], "/app");

        let mut first = ConnectionContext::new(1, Some(100));
        handle_envelope(&state, &mut first, bad());
        assert!(matches!(
            handle_envelope(&state, &mut first, bad()),
            Outcome::ReplyAndClose(_)
        ));
        first.release(&state);

        let mut second = ConnectionContext::new(2, Some(100));
        match handle_envelope(&state, &mut second, auth_envelope(100, &SECRET, "/app")) {
            Outcome::ReplyAndClose(env) => {
                let resp: AuthenticateResponse = decode_body(&env.payload).unwrap();
                assert!(!resp.success);
                assert!(resp.session_id.is_none());
            }
            other => panic!("expected ReplyAndClose, got {other:?}"),
        }
        assert_eq!(state.sessions.active_count(), 0);

        let mut other_process = ConnectionContext::new(3, Some(200));
        let env = expect_reply(handle_envelope(
            &state,
            &mut other_process,
            auth_envelope(200, &SECRET, "/app"),
        ));
        let resp: AuthenticateResponse = decode_body(&env.payload).unwrap();
        assert!(resp.success);
    }

    #[test]
    fn test_unknown_peer_lockout_is_per_connection() {
        let config = HelperConfig {
            max_consecutive_auth_failures: 1,
            ..HelperConfig::default()
        };
        let state = state_with(config);
        let mut first = ConnectionContext::new(1, None);
        assert!(matches!(
            handle_envelope(&state, &mut first, auth_envelope(100, &[9u8; SECRET_LEN], "/app")),
            Outcome::ReplyAndClose(_)
        ));
        first.release(&state);

        let mut second = ConnectionContext::new(2, None);
        login(&state, &mut second);
    }

    #[test]
    fn test_auth_attempts_are_throttled() {
        let config = HelperConfig {
            max_auth_attempts_per_second: 1,
            ..HelperConfig::default()
        };
        let state = state_with(config);
        let mut ctx = ConnectionContext::new(1, None);
        handle_envelope(&state, &mut ctx, auth_envelope(100, &[9u8; SECRET_LEN], "/app"));
        let err = expect_error(handle_envelope(
            &state,
            &mut ctx,
            auth_envelope(100, &SECRET, "/app"),
        ));
        assert_eq!(err.kind, "RateLimited");
    }

    #[test]
    fn test_session_ceiling_reports_capacity() {
        let config = HelperConfig {
            max_concurrent_sessions: 1,
            ..HelperConfig::default()
        };
        let state = state_with(config);
        let mut ctx = ConnectionContext::new(1, None);
        login(&state, &mut ctx);
        let err = expect_error(handle_envelope(
            &state,
            &mut ctx,
            auth_envelope(100, &SECRET, "/app"),
        ));
        assert_eq!(err.kind, "Capacity");
    }

    #[test]
    fn test_stats_require_valid_session() {
        let state = test_state();
        let mut ctx = ConnectionContext::new(1, None);
        let err = expect_error(handle_envelope(
            &state,
            &mut ctx,
            session_envelope(MessageType::ConnectionStats, "deadbeef"),
        ));
        assert_eq!(err.kind, "Authentication");
    }

    #[test]
    fn test_connection_stats_returns_tracker_snapshot() {
        let state = test_state();
        let mut ctx = ConnectionContext::new(1, None);
        let sid = login(&state, &mut ctx);
        let env = expect_reply(handle_envelope(
            &state,
            &mut ctx,
            session_envelope(MessageType::ConnectionStats, &sid),
        ));
        assert_eq!(env.message_type, MessageType::ConnectionStats);
        let resp: ConnectionStatsResponse = decode_body(&env.payload).unwrap();
        assert!(resp.success);
        assert_eq!(resp.processes.len(), 2);
        assert_eq!(resp.processes[0].process_id, 500);
        assert_eq!(resp.processes[0].total_bytes_received, 2000);
    }

    #[test]
    fn test_process_stats_applies_pid_filter() {
        let state = test_state();
        let mut ctx = ConnectionContext::new(1, None);
        let sid = login(&state, &mut ctx);
        let req = ProcessStatsRequest {
            session_id: sid,
            pid_filter: vec![600],
        };
        let env = expect_reply(handle_envelope(
            &state,
            &mut ctx,
            Envelope::new(MessageType::ProcessStats, "p", encode_body(&req).unwrap()),
        ));
        let resp: ProcessStatsResponse = decode_body(&env.payload).unwrap();
        assert_eq!(resp.processes.len(), 1);
        assert_eq!(resp.processes[0].process_id, 600);
        assert_eq!(resp.processes[0].total_bytes_sent, 10);
    }

    #[test]
    fn test_oversized_snapshot_is_truncated_not_fatal() {
        let state = test_state();
        let remote: std::net::SocketAddr = "[2001:db8::2]:443".parse().unwrap();
        for port in 0..12_000u16 {
            state.tracker.core().table.record_bytes(
                700,
                Protocol::Tcp,
                std::net::SocketAddr::new("2001:db8::1".parse().unwrap(), 10_000 + port),
                remote,
                1,
                1,
            );
        }
        let mut ctx = ConnectionContext::new(1, None);
        let sid = login(&state, &mut ctx);

        let env = expect_reply(handle_envelope(
            &state,
            &mut ctx,
            session_envelope(MessageType::ConnectionStats, &sid),
        ));
        assert_eq!(env.message_type, MessageType::ConnectionStats);
        assert!(env.payload.len() <= MAX_MESSAGE_SIZE);
        let resp: ConnectionStatsResponse = decode_body(&env.payload).unwrap();
        assert!(resp.success);
        assert!(resp.truncated);
        let busy = resp.processes.iter().find(|p| p.process_id == 700).unwrap();
        assert_eq!(busy.active_connection_count, 12_000);
        assert_eq!(busy.total_bytes_sent, 12_000);
        assert!(busy.connections.len() < 12_000);
        assert_eq!(resp.processes.len(), 3);

        // The connection and session are still usable afterwards.
        assert_eq!(ctx.sessions(), &[sid.clone()]);
        let env = expect_reply(handle_envelope(
            &state,
            &mut ctx,
            session_envelope(MessageType::Heartbeat, &sid),
        ));
        assert_eq!(env.message_type, MessageType::Heartbeat);
    }

    #[test]
    fn test_heartbeat_reports_sessions() {
        let state = test_state();
        let mut ctx = ConnectionContext::new(1, None);
        let sid = login(&state, &mut ctx);
        let env = expect_reply(handle_envelope(
            &state,
            &mut ctx,
            session_envelope(MessageType::Heartbeat, &sid),
        ));
        let resp: HeartbeatResponse = decode_body(&env.payload).unwrap();
        assert!(resp.alive);
        assert_eq!(resp.active_sessions, 1);
    }

    #[test]
    fn test_requests_are_rate_limited_per_session() {
        let config = HelperConfig {
            max_requests_per_second: 2,
            ..HelperConfig::default()
        };
        let state = state_with(config);
        let mut ctx = ConnectionContext::new(1, None);
        let sid = login(&state, &mut ctx);
        for _ in 0..2 {
            expect_reply(handle_envelope(
                &state,
                &mut ctx,
                session_envelope(MessageType::Heartbeat, &sid),
            ));
        }
        let err = expect_error(handle_envelope(
            &state,
            &mut ctx,
            session_envelope(MessageType::Heartbeat, &sid),
        ));
        assert_eq!(err.kind, "RateLimited");
    }

    #[test]
    fn test_shutdown_removes_session_and_closes() {
        let state = test_state();
        let mut ctx = ConnectionContext::new(1, None);
        let sid = login(&state, &mut ctx);
        let req = ShutdownRequest {
            session_id: sid.clone(),
            reason: "app exit".into(),
        };
        let outcome = handle_envelope(
            &state,
            &mut ctx,
            Envelope::new(MessageType::Shutdown, "s", encode_body(&req).unwrap()),
        );
        assert_eq!(outcome, Outcome::Close);
        assert!(state.sessions.validate_session(&sid).is_none());
        assert!(ctx.sessions().is_empty());
    }

    #[test]
    fn test_malformed_body_is_fatal() {
        let state = test_state();
        let mut ctx = ConnectionContext::new(1, None);
        let outcome = handle_envelope(
            &state,
            &mut ctx,
            Envelope::new(MessageType::Heartbeat, "bad", vec![0xFF]),
        );
        match outcome {
            Outcome::ReplyAndClose(env) => {
                let err: ErrorResponse = decode_body(&env.payload).unwrap();
                assert_eq!(err.kind, "Protocol");
                assert_eq!(env.request_id, "bad");
            }
            other => panic!("expected ReplyAndClose, got {other:?}"),
        }
    }

    #[test]
    fn test_client_error_message_is_fatal() {
        let state = test_state();
        let mut ctx = ConnectionContext::new(1, None);
        let outcome = handle_envelope(&state, &mut ctx, Envelope::new(MessageType::Error, "e", vec![]));
        assert!(matches!(outcome, Outcome::ReplyAndClose(_)));
    }

    #[test]
    fn test_release_drops_connection_sessions() {
        let state = test_state();
        let mut ctx = ConnectionContext::new(1, None);
        let sid = login(&state, &mut ctx);
        let mut other = ConnectionContext::new(2, None);
        let other_sid = login(&state, &mut other);

        ctx.release(&state);
        assert!(state.sessions.validate_session(&sid).is_none());
        assert!(state.sessions.validate_session(&other_sid).is_some());
        assert_eq!(state.sessions.active_count(), 1);
    }
}
