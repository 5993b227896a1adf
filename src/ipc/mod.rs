//! Local IPC between the unprivileged app and the elevated helper.
//!
//! - [`envelope`] — `Envelope` binary layout and message type tags
//! - [`messages`] — request/response bodies carried in envelope payloads
//! - [`transport`] — length-prefixed framing over any async byte stream
//! - [`handlers`] — per-message request handling against [`HelperState`]
//! - [`server`] — accept loop (unix socket / named pipe) and per-connection dispatch
//! - [`client`] — [`HelperClient`] used by the unprivileged side

pub mod client;
pub mod envelope;
pub mod handlers;
pub mod messages;
pub mod server;
pub mod state;
pub mod transport;

pub use client::HelperClient;
pub use envelope::{Envelope, MessageType};
pub use handlers::{ConnectionContext, Outcome};
pub use server::{handle_connection, serve};
pub use state::HelperState;
pub use transport::{read_envelope, write_envelope};

use std::io;

use thiserror::Error;

/// Framing and encoding failures. Every variant is fatal to the connection.
#[derive(Debug, Error)]
pub enum ProtocolError {
    /// A zero-length frame was announced.
    #[error("empty frame")]
    EmptyFrame,

    /// The length prefix exceeds the frame cap. Detected before allocation.
    #[error("frame too large: {size} bytes exceeds maximum {max} bytes")]
    FrameTooLarge { size: usize, max: usize },

    /// The envelope payload exceeds the message size cap.
    #[error("payload too large: {size} bytes exceeds maximum {max} bytes")]
    PayloadTooLarge { size: usize, max: usize },

    #[error("request id too long: {len} bytes exceeds maximum {max} bytes")]
    RequestIdTooLong { len: usize, max: usize },

    #[error("malformed message: {0}")]
    Malformed(String),

    #[error("unknown message type {0}")]
    UnknownMessageType(u32),

    #[error("I/O error: {0}")]
    Io(#[from] io::Error),
}

impl ProtocolError {
    /// Whether the peer simply went away (clean EOF between frames).
    pub fn is_disconnect(&self) -> bool {
        matches!(self, ProtocolError::Io(e) if matches!(
            e.kind(),
            io::ErrorKind::UnexpectedEof | io::ErrorKind::BrokenPipe | io::ErrorKind::ConnectionReset
        ))
    }
}
