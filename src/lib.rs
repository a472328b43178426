//! Linux client for a WebRTC talking-avatar server.
//!
//! Negotiates a receive-only peer connection, tracks its health and
//! round-trip latency, and streams microphone audio to the server while a
//! session is active.

pub mod api;
pub mod audio;
pub mod chunk_stream;
pub mod config;
pub mod controller;
pub mod error;
pub mod event;
pub mod protocol;
pub mod rtc;
pub mod session;

pub use config::{Config, RecordingMode};
pub use controller::{Controller, ControllerHandle};
pub use error::{ClientError, NegotiationError};
pub use session::{ConnectionStatus, SessionId, SessionSnapshot};
