//! Client side of the helper protocol, used by the unprivileged app.
//!
//! [`HelperClient`] owns one stream, signs the authentication challenge with
//! the shared secret, and correlates every reply with its request id. The
//! connection state is published through a `watch` channel so the app can
//! switch between live stats and its "elevation required" view.

use serde::de::DeserializeOwned;
use serde::Serialize;
use tokio::io::{AsyncRead, AsyncWrite};
use tokio::sync::watch;

use crate::core::auth::{unix_now, HmacAuthenticator};
use crate::error::HelperError;
use crate::ipc::envelope::{Envelope, MessageType};
use crate::ipc::messages::{
    decode_body, encode_body, AuthenticateRequest, AuthenticateResponse, ConnectionStatsResponse,
    ErrorResponse, HeartbeatResponse, ProcessStatsRequest, ProcessStatsResponse, SessionRequest,
    ShutdownRequest,
};
use crate::ipc::transport::{read_envelope, write_envelope};
use crate::ipc::ProtocolError;

pub struct HelperClient<S> {
    stream: S,
    session_id: Option<String>,
    next_request: u64,
    connected: watch::Sender<bool>,
}

impl<S> HelperClient<S>
where
    S: AsyncRead + AsyncWrite + Unpin,
{
    /// Wrap an already connected stream.
    pub fn from_stream(stream: S) -> Self {
        let (connected, _) = watch::channel(true);
        Self {
            stream,
            session_id: None,
            next_request: 1,
            connected,
        }
    }

    /// Connection state notifications: `true` while the helper is reachable.
    pub fn subscribe(&self) -> watch::Receiver<bool> {
        self.connected.subscribe()
    }

    pub fn is_connected(&self) -> bool {
        *self.connected.borrow()
    }

    pub fn session_id(&self) -> Option<&str> {
        self.session_id.as_deref()
    }

    /// Authenticate as the current process.
    pub async fn authenticate(
        &mut self,
        secret: &[u8],
        executable_path: &str,
    ) -> Result<AuthenticateResponse, HelperError> {
        let client_pid = std::process::id();
        let timestamp = unix_now();
        let request = AuthenticateRequest {
            client_pid,
            timestamp,
            signature: HmacAuthenticator::sign(client_pid, timestamp, secret),
            executable_path: executable_path.to_string(),
        };
        let response: AuthenticateResponse =
            self.call(MessageType::Authenticate, &request).await?;
        if !response.success {
            return Err(HelperError::Authentication(
                response
                    .error_message
                    .unwrap_or_else(|| "authentication failed".into()),
            ));
        }
        self.session_id.clone_from(&response.session_id);
        Ok(response)
    }

    pub async fn connection_stats(&mut self) -> Result<ConnectionStatsResponse, HelperError> {
        let request = SessionRequest {
            session_id: self.require_session()?,
        };
        self.call(MessageType::ConnectionStats, &request).await
    }

    pub async fn process_stats(
        &mut self,
        pid_filter: &[u32],
    ) -> Result<ProcessStatsResponse, HelperError> {
        let request = ProcessStatsRequest {
            session_id: self.require_session()?,
            pid_filter: pid_filter.to_vec(),
        };
        self.call(MessageType::ProcessStats, &request).await
    }

    pub async fn heartbeat(&mut self) -> Result<HeartbeatResponse, HelperError> {
        let request = SessionRequest {
            session_id: self.require_session()?,
        };
        self.call(MessageType::Heartbeat, &request).await
    }

    /// End the session. The helper closes the stream without replying.
    pub async fn shutdown(mut self, reason: &str) -> Result<(), HelperError> {
        let request = ShutdownRequest {
            session_id: self.require_session()?,
            reason: reason.to_string(),
        };
        let envelope = Envelope::new(
            MessageType::Shutdown,
            self.next_request_id(),
            encode_body(&request)?,
        );
        self.send(&envelope).await?;
        match read_envelope(&mut self.stream).await {
            Err(e) if e.is_disconnect() => {
                self.mark_disconnected();
                Ok(())
            }
            Err(e) => Err(self.fail(e)),
            Ok(reply) if reply.message_type == MessageType::Error => {
                let error: ErrorResponse = decode_body(&reply.payload)?;
                Err(HelperError::from_response(error))
            }
            Ok(reply) => Err(self.fail(ProtocolError::Malformed(format!(
                "unexpected {} reply to Shutdown",
                reply.message_type
            )))),
        }
    }

    fn require_session(&self) -> Result<String, HelperError> {
        self.session_id
            .clone()
            .ok_or_else(|| HelperError::Authentication("not authenticated".into()))
    }

    fn next_request_id(&mut self) -> String {
        let id = format!("req-{}", self.next_request);
        self.next_request += 1;
        id
    }

    async fn call<Req, Resp>(
        &mut self,
        message_type: MessageType,
        body: &Req,
    ) -> Result<Resp, HelperError>
    where
        Req: Serialize,
        Resp: DeserializeOwned,
    {
        let request_id = self.next_request_id();
        let envelope = Envelope::new(message_type, request_id.clone(), encode_body(body)?);
        self.send(&envelope).await?;

        let reply = match read_envelope(&mut self.stream).await {
            Ok(reply) => reply,
            Err(e) => return Err(self.fail(e)),
        };
        if reply.request_id != request_id {
            return Err(self.fail(ProtocolError::Malformed(format!(
                "reply id {:?} does not match request id {request_id:?}",
                reply.request_id
            ))));
        }
        if reply.message_type == MessageType::Error {
            let error: ErrorResponse = decode_body(&reply.payload)?;
            return Err(HelperError::from_response(error));
        }
        if reply.message_type != message_type {
            return Err(self.fail(ProtocolError::Malformed(format!(
                "expected {message_type} reply, got {}",
                reply.message_type
            ))));
        }
        Ok(decode_body(&reply.payload)?)
    }

    async fn send(&mut self, envelope: &Envelope) -> Result<(), HelperError> {
        match write_envelope(&mut self.stream, envelope).await {
            Ok(()) => Ok(()),
            Err(e @ ProtocolError::Io(_)) => Err(self.fail(e)),
            // Size violations are caught before anything hits the wire.
            Err(e) => Err(e.into()),
        }
    }

    /// Mark the connection dead and convert the error.
    fn fail(&self, error: ProtocolError) -> HelperError {
        self.mark_disconnected();
        error.into()
    }

    fn mark_disconnected(&self) {
        if *self.connected.borrow() {
            tracing::info!("Helper connection lost");
        }
        self.connected.send_replace(false);
    }
}

impl<S> Drop for HelperClient<S> {
    fn drop(&mut self) {
        self.connected.send_replace(false);
    }
}

#[cfg(unix)]
impl HelperClient<tokio::net::UnixStream> {
    /// Connect to the helper's unix socket.
    pub async fn connect(endpoint: &str) -> Result<Self, HelperError> {
        let stream = tokio::net::UnixStream::connect(endpoint).await?;
        Ok(Self::from_stream(stream))
    }
}

#[cfg(windows)]
impl HelperClient<tokio::net::windows::named_pipe::NamedPipeClient> {
    /// Open the helper's named pipe.
    pub async fn connect(endpoint: &str) -> Result<Self, HelperError> {
        let stream = tokio::net::windows::named_pipe::ClientOptions::new().open(endpoint)?;
        Ok(Self::from_stream(stream))
    }
}
