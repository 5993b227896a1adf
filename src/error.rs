//! Unified error type for the helper's request handling.
//!
//! `HelperError` is the single error type surfaced to IPC clients. It crosses
//! the wire as an `Error` envelope carrying `{ kind, message }` so the client
//! can programmatically distinguish error categories.

use crate::ipc::messages::ErrorResponse;

/// Helper-level error returned by request handlers.
///
/// Each variant maps to a distinct failure domain. Clients receive the
/// variant name as `kind` and a human-readable `message`.
#[derive(Debug, thiserror::Error)]
pub enum HelperError {
    /// Oversized or malformed frame. Fatal to the connection.
    #[error("{0}")]
    Protocol(String),

    /// Bad signature, stale timestamp, unknown or expired session.
    #[error("{0}")]
    Authentication(String),

    /// Session ceiling reached. The client may retry later.
    #[error("{0}")]
    Capacity(String),

    /// Per-request throttling. The client should back off.
    #[error("{0}")]
    RateLimited(String),

    /// Platform backend not started or unsupported.
    #[error("{0}")]
    TrackerUnavailable(String),

    /// I/O and OS-level errors.
    #[error("{0}")]
    Io(String),

    /// Invalid or missing request fields.
    #[error("{0}")]
    InvalidInput(String),
}

impl HelperError {
    /// Returns the error kind as a string matching the variant name.
    pub fn kind(&self) -> &'static str {
        match self {
            HelperError::Protocol(_) => "Protocol",
            HelperError::Authentication(_) => "Authentication",
            HelperError::Capacity(_) => "Capacity",
            HelperError::RateLimited(_) => "RateLimited",
            HelperError::TrackerUnavailable(_) => "TrackerUnavailable",
            HelperError::Io(_) => "Io",
            HelperError::InvalidInput(_) => "InvalidInput",
        }
    }

    /// Body of the `Error` envelope sent back to the client.
    pub fn to_response(&self) -> ErrorResponse {
        ErrorResponse {
            kind: self.kind().to_string(),
            message: self.to_string(),
        }
    }

    /// Rebuild a typed error from an `Error` envelope body.
    pub fn from_response(response: ErrorResponse) -> Self {
        let ErrorResponse { kind, message } = response;
        match kind.as_str() {
            "Protocol" => HelperError::Protocol(message),
            "Authentication" => HelperError::Authentication(message),
            "Capacity" => HelperError::Capacity(message),
            "RateLimited" => HelperError::RateLimited(message),
            "TrackerUnavailable" => HelperError::TrackerUnavailable(message),
            "InvalidInput" => HelperError::InvalidInput(message),
            _ => HelperError::Io(message),
        }
    }
}

// ---- From implementations for ergonomic error conversion ----

impl From<std::io::Error> for HelperError {
    fn from(err: std::io::Error) -> Self {
        HelperError::Io(err.to_string())
    }
}

impl From<crate::ipc::ProtocolError> for HelperError {
    fn from(err: crate::ipc::ProtocolError) -> Self {
        HelperError::Protocol(err.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_error_kind_returns_correct_variant_name() {
        assert_eq!(HelperError::Protocol("p".into()).kind(), "Protocol");
        assert_eq!(
            HelperError::Authentication("a".into()).kind(),
            "Authentication"
        );
        assert_eq!(HelperError::Capacity("c".into()).kind(), "Capacity");
        assert_eq!(HelperError::RateLimited("r".into()).kind(), "RateLimited");
        assert_eq!(
            HelperError::TrackerUnavailable("t".into()).kind(),
            "TrackerUnavailable"
        );
        assert_eq!(HelperError::Io("i".into()).kind(), "Io");
        assert_eq!(HelperError::InvalidInput("v".into()).kind(), "InvalidInput");
    }

    #[test]
    fn test_error_display_shows_message() {
        let err = HelperError::Authentication("session expired".into());
        assert_eq!(err.to_string(), "session expired");
    }

    #[test]
    fn test_response_round_trips_every_variant() {
        let variants = vec![
            HelperError::Protocol("a".into()),
            HelperError::Authentication("b".into()),
            HelperError::Capacity("c".into()),
            HelperError::RateLimited("d".into()),
            HelperError::TrackerUnavailable("e".into()),
            HelperError::Io("f".into()),
            HelperError::InvalidInput("g".into()),
        ];
        for err in variants {
            let response = err.to_response();
            assert_eq!(response.kind, err.kind());
            let rebuilt = HelperError::from_response(response);
            assert_eq!(rebuilt.kind(), err.kind(), "kind lost for {err:?}");
            assert_eq!(rebuilt.to_string(), err.to_string());
        }
    }

    #[test]
    fn test_unknown_kind_maps_to_io() {
        let err = HelperError::from_response(ErrorResponse {
            kind: "Mystery".into(),
            message: "boom".into(),
        });
        assert_eq!(err.kind(), "Io");
        assert_eq!(err.to_string(), "boom");
    }

    #[test]
    fn test_from_io_error_produces_io_variant() {
        let io_err = std::io::Error::new(std::io::ErrorKind::BrokenPipe, "pipe closed");
        let err: HelperError = io_err.into();
        assert_eq!(err.kind(), "Io");
        assert!(err.to_string().contains("pipe closed"));
    }
}
