//! Envelope layout.
//!
//! All integers are little-endian:
//!
//! ```text
//! | type: u32 | request_id_len: u32 | request_id: utf8 | payload_len: u32 | payload |
//! ```
//!
//! The payload is an independently encoded body (see [`messages`](super::messages)).

use bytes::{Buf, BufMut};

use crate::config::{ENVELOPE_FIXED_HEADER_LEN, MAX_MESSAGE_SIZE, MAX_REQUEST_ID_LEN};
use crate::ipc::ProtocolError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
#[repr(u32)]
pub enum MessageType {
    Authenticate = 1,
    ConnectionStats = 2,
    ProcessStats = 3,
    Heartbeat = 4,
    Shutdown = 5,
    Error = 6,
}

impl MessageType {
    pub fn as_u32(self) -> u32 {
        self as u32
    }

    pub fn from_u32(value: u32) -> Result<Self, ProtocolError> {
        Ok(match value {
            1 => MessageType::Authenticate,
            2 => MessageType::ConnectionStats,
            3 => MessageType::ProcessStats,
            4 => MessageType::Heartbeat,
            5 => MessageType::Shutdown,
            6 => MessageType::Error,
            other => return Err(ProtocolError::UnknownMessageType(other)),
        })
    }
}

impl std::fmt::Display for MessageType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        std::fmt::Debug::fmt(self, f)
    }
}

/// Framed unit on the stream: type tag, correlation id, opaque payload.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub message_type: MessageType,
    /// Caller-assigned, echoed back in the response.
    pub request_id: String,
    pub payload: Vec<u8>,
}

impl Envelope {
    pub fn new(message_type: MessageType, request_id: impl Into<String>, payload: Vec<u8>) -> Self {
        Self {
            message_type,
            request_id: request_id.into(),
            payload,
        }
    }

    pub fn encoded_len(&self) -> usize {
        ENVELOPE_FIXED_HEADER_LEN + self.request_id.len() + self.payload.len()
    }

    pub fn encode(&self) -> Result<Vec<u8>, ProtocolError> {
        if self.request_id.len() > MAX_REQUEST_ID_LEN {
            return Err(ProtocolError::RequestIdTooLong {
                len: self.request_id.len(),
                max: MAX_REQUEST_ID_LEN,
            });
        }
        if self.payload.len() > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: self.payload.len(),
                max: MAX_MESSAGE_SIZE,
            });
        }
        let mut buf = Vec::with_capacity(self.encoded_len());
        buf.put_u32_le(self.message_type.as_u32());
        buf.put_u32_le(self.request_id.len() as u32);
        buf.put_slice(self.request_id.as_bytes());
        buf.put_u32_le(self.payload.len() as u32);
        buf.put_slice(&self.payload);
        Ok(buf)
    }

    /// Decode one envelope. The input must contain exactly one envelope.
    pub fn decode(mut buf: &[u8]) -> Result<Self, ProtocolError> {
        let message_type = MessageType::from_u32(take_u32(&mut buf, "type")?)?;

        let id_len = take_u32(&mut buf, "request id length")? as usize;
        if id_len > MAX_REQUEST_ID_LEN {
            return Err(ProtocolError::RequestIdTooLong {
                len: id_len,
                max: MAX_REQUEST_ID_LEN,
            });
        }
        let id_bytes = take_bytes(&mut buf, id_len, "request id")?;
        let request_id = String::from_utf8(id_bytes)
            .map_err(|_| ProtocolError::Malformed("request id is not valid UTF-8".into()))?;

        let payload_len = take_u32(&mut buf, "payload length")? as usize;
        if payload_len > MAX_MESSAGE_SIZE {
            return Err(ProtocolError::PayloadTooLarge {
                size: payload_len,
                max: MAX_MESSAGE_SIZE,
            });
        }
        let payload = take_bytes(&mut buf, payload_len, "payload")?;

        if buf.has_remaining() {
            return Err(ProtocolError::Malformed(format!(
                "{} trailing bytes after payload",
                buf.remaining()
            )));
        }

        Ok(Self {
            message_type,
            request_id,
            payload,
        })
    }
}

fn take_u32(buf: &mut &[u8], field: &str) -> Result<u32, ProtocolError> {
    if buf.remaining() < 4 {
        return Err(ProtocolError::Malformed(format!("truncated {field}")));
    }
    Ok(buf.get_u32_le())
}

fn take_bytes(buf: &mut &[u8], len: usize, field: &str) -> Result<Vec<u8>, ProtocolError> {
    if buf.remaining() < len {
        return Err(ProtocolError::Malformed(format!(
            "truncated {field}: need {len} bytes, have {}",
            buf.remaining()
        )));
    }
    let bytes = buf[..len].to_vec();
    buf.advance(len);
    Ok(bytes)
}
