use serde::{Deserialize, Serialize};
use std::fmt;

use crate::error::ClientError;

/// Server-issued identifier of one negotiated media session. Always positive.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "i64", into = "u64")]
pub struct SessionId(u64);

impl SessionId {
    pub fn new(raw: u64) -> Option<Self> {
        (raw > 0).then_some(Self(raw))
    }

    pub fn get(self) -> u64 {
        self.0
    }
}

impl TryFrom<i64> for SessionId {
    type Error = String;

    fn try_from(raw: i64) -> Result<Self, Self::Error> {
        u64::try_from(raw)
            .ok()
            .and_then(SessionId::new)
            .ok_or_else(|| format!("session id must be a positive integer, got {}", raw))
    }
}

impl From<SessionId> for u64 {
    fn from(id: SessionId) -> u64 {
        id.0
    }
}

impl fmt::Display for SessionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Coarse transport status shown to the user. Derived from transport events only.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    #[default]
    Disconnected,
    Connecting,
    Connected,
    Failed,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum TrackKind {
    Audio,
    Video,
}

/// Everything a presentation layer needs to render the client state.
#[derive(Debug, Clone, Default)]
pub struct SessionSnapshot {
    pub status: ConnectionStatus,
    pub session: Option<SessionId>,
    pub latency_ms: Option<u32>,
    /// Microphone capture is running for the current session.
    pub recording: bool,
    pub audio_attached: bool,
    pub video_attached: bool,
    /// Capture or streaming problem, reported without touching `status`.
    pub advisory: Option<ClientError>,
}
