//! Media transport: negotiation, health tracking and latency sampling.

pub mod health;
pub mod latency;
pub mod negotiator;

use tokio::sync::mpsc;

use crate::event::Event;
use crate::session::TrackKind;

pub use health::{HealthMonitor, HealthUpdate, IceState, PeerState};
pub use latency::{LatencyReading, LatencyTracker, RttEntry, RttSource, SampleSchedule, SamplerHandle};
pub use negotiator::{Negotiated, Negotiator, RtcNegotiator, TransportHandle};

/// Something the transport reported through one of its callbacks.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TransportSignal {
    Peer(PeerState),
    Ice(IceState),
    TrackAttached(TrackKind),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct TransportEvent {
    /// Connection attempt that produced the signal.
    pub attempt: u64,
    pub signal: TransportSignal,
}

/// Callback sink handed to a negotiator. Every signal is tagged with the
/// attempt it belongs to, so the coordinator can drop stragglers from a
/// transport it already retired.
#[derive(Debug, Clone)]
pub struct TransportEvents {
    attempt: u64,
    tx: mpsc::Sender<Event>,
}

impl TransportEvents {
    pub fn new(attempt: u64, tx: mpsc::Sender<Event>) -> Self {
        Self { attempt, tx }
    }

    pub fn attempt(&self) -> u64 {
        self.attempt
    }

    pub async fn emit(&self, signal: TransportSignal) {
        let event = TransportEvent {
            attempt: self.attempt,
            signal,
        };
        if self.tx.send(Event::Transport(event)).await.is_err() {
            log::debug!("Coordinator gone, dropping transport signal {:?}", signal);
        }
    }
}
