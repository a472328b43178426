//! Reconciles the two transport state sources into one `ConnectionStatus`.
//!
//! The peer-connection state and the ICE connection state both feed the
//! monitor. Either can report `Connected`; either alone can force
//! `Disconnected` or `Failed`, and those transitions clear the session.

use std::collections::HashSet;

use webrtc::ice_transport::ice_connection_state::RTCIceConnectionState;
use webrtc::peer_connection::peer_connection_state::RTCPeerConnectionState;

use crate::session::{ConnectionStatus, TrackKind};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum PeerState {
    New,
    Connecting,
    Connected,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCPeerConnectionState> for PeerState {
    fn from(state: RTCPeerConnectionState) -> Self {
        match state {
            RTCPeerConnectionState::Connecting => PeerState::Connecting,
            RTCPeerConnectionState::Connected => PeerState::Connected,
            RTCPeerConnectionState::Disconnected => PeerState::Disconnected,
            RTCPeerConnectionState::Failed => PeerState::Failed,
            RTCPeerConnectionState::Closed => PeerState::Closed,
            _ => PeerState::New,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum IceState {
    New,
    Checking,
    Connected,
    Completed,
    Disconnected,
    Failed,
    Closed,
}

impl From<RTCIceConnectionState> for IceState {
    fn from(state: RTCIceConnectionState) -> Self {
        match state {
            RTCIceConnectionState::Checking => IceState::Checking,
            RTCIceConnectionState::Connected => IceState::Connected,
            RTCIceConnectionState::Completed => IceState::Completed,
            RTCIceConnectionState::Disconnected => IceState::Disconnected,
            RTCIceConnectionState::Failed => IceState::Failed,
            RTCIceConnectionState::Closed => IceState::Closed,
            _ => IceState::New,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HealthSignal {
    Peer(PeerState),
    Ice(IceState),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct HealthUpdate {
    pub status: ConnectionStatus,
    /// The session must be dropped along with everything bound to it.
    pub clear_session: bool,
}

#[derive(Debug, Default)]
pub struct HealthMonitor {
    status: ConnectionStatus,
    ice_connected: bool,
    attached: HashSet<TrackKind>,
}

impl HealthMonitor {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn status(&self) -> ConnectionStatus {
        self.status
    }

    /// ICE currently reports `connected` or `completed`.
    pub fn ice_connected(&self) -> bool {
        self.ice_connected
    }

    /// Latency is only meaningful once both layers agree the path is up.
    pub fn latency_gate(&self) -> bool {
        self.status == ConnectionStatus::Connected && self.ice_connected
    }

    pub fn is_attached(&self, kind: TrackKind) -> bool {
        self.attached.contains(&kind)
    }

    pub fn begin_attempt(&mut self) {
        self.status = ConnectionStatus::Connecting;
        self.ice_connected = false;
        self.attached.clear();
    }

    pub fn fail(&mut self) {
        self.status = ConnectionStatus::Failed;
        self.ice_connected = false;
    }

    pub fn reset(&mut self) {
        self.status = ConnectionStatus::Disconnected;
        self.ice_connected = false;
        self.attached.clear();
    }

    /// Returns `true` the first time a track of `kind` arrives.
    pub fn track_attached(&mut self, kind: TrackKind) -> bool {
        self.attached.insert(kind)
    }

    /// Applies one state change. `None` means the signal carries no status
    /// information (`new`/`unspecified`).
    pub fn apply(&mut self, signal: HealthSignal) -> Option<HealthUpdate> {
        let (status, clear_session) = match signal {
            HealthSignal::Peer(state) => match state {
                PeerState::New => return None,
                PeerState::Connecting => (ConnectionStatus::Connecting, false),
                PeerState::Connected => (ConnectionStatus::Connected, false),
                PeerState::Disconnected | PeerState::Closed => (ConnectionStatus::Disconnected, true),
                PeerState::Failed => (ConnectionStatus::Failed, true),
            },
            HealthSignal::Ice(state) => {
                self.ice_connected = matches!(state, IceState::Connected | IceState::Completed);
                match state {
                    IceState::New => return None,
                    IceState::Checking => (ConnectionStatus::Connecting, false),
                    IceState::Connected | IceState::Completed => (ConnectionStatus::Connected, false),
                    IceState::Disconnected | IceState::Closed => (ConnectionStatus::Disconnected, true),
                    IceState::Failed => (ConnectionStatus::Failed, true),
                }
            }
        };
        if clear_session {
            self.ice_connected = false;
        }
        self.status = status;
        Some(HealthUpdate {
            status,
            clear_session,
        })
    }
}
