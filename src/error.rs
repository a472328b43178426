//! Error taxonomy of the client.
//!
//! Only negotiation failures are returned to the caller of `start`; the
//! capture and streaming variants are reported as advisories on the
//! session snapshot so they never interfere with the connection itself.

use crate::session::SessionId;

/// Why setting up the media transport failed. The peer connection has
/// always been closed by the time one of these is observed.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum NegotiationError {
    #[error("server rejected the offer ({status}): {message}")]
    Rejected { status: u16, message: String },

    #[error("malformed answer: {0}")]
    Malformed(String),

    #[error("failed to apply session description: {0}")]
    Description(String),

    #[error("peer connection error: {0}")]
    Transport(String),

    #[error("offer request failed: {0}")]
    Request(String),
}

impl From<webrtc::Error> for NegotiationError {
    fn from(e: webrtc::Error) -> Self {
        NegotiationError::Transport(e.to_string())
    }
}

#[derive(Debug, Clone, PartialEq, thiserror::Error)]
pub enum ClientError {
    #[error(transparent)]
    Negotiation(#[from] NegotiationError),

    #[error("microphone unavailable: {0}")]
    CaptureUnavailable(String),

    #[error("audio channel unavailable: {0}")]
    ChannelUnavailable(String),

    #[error("transmit of chunk {sequence:?} failed: {message}")]
    TransmitFailure { sequence: Option<u64>, message: String },

    #[error("session {0} is no longer known to the server")]
    SessionInvalidated(SessionId),

    #[error("a session is already active")]
    AlreadyActive,

    #[error("no active session")]
    NoSession,

    #[error("connection attempt was cancelled")]
    Cancelled,

    #[error("recording: {0}")]
    Recording(String),

    #[error("server request failed: {0}")]
    Api(String),

    #[error("session controller has shut down")]
    ControllerGone,
}

/// Server replies carrying `code != 0` whose message says the session is
/// gone, e.g. `Session 42 not found`.
pub fn is_session_not_found(message: &str) -> bool {
    message.contains("Session") && message.contains("not found")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn detects_session_not_found_messages() {
        assert!(is_session_not_found("Session 42 not found"));
        assert!(is_session_not_found("Session not found: 42"));
        assert!(!is_session_not_found("session 42 not found"));
        assert!(!is_session_not_found("Session busy"));
        assert!(!is_session_not_found("file not found"));
    }

    #[test]
    fn negotiation_error_converts_into_client_error() {
        let err: ClientError = NegotiationError::Malformed("missing sessionid".into()).into();
        assert!(matches!(err, ClientError::Negotiation(NegotiationError::Malformed(_))));
        assert!(err.to_string().contains("missing sessionid"));
    }
}
