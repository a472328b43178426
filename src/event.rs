//! Everything the session coordinator reacts to, funnelled through one channel.

use crate::audio::{AudioChunk, CapturePipeline};
use crate::chunk_stream::{ChunkStream, StreamEvent};
use crate::error::{ClientError, NegotiationError};
use crate::rtc::{LatencyReading, Negotiated, TransportEvent};
use crate::session::SessionId;

pub enum Event {
    Transport(TransportEvent),
    Latency(LatencyReading),
    Chunk(AudioChunk),
    Stream(StreamEvent),
    Negotiated {
        attempt: u64,
        result: Result<Negotiated, NegotiationError>,
    },
    StreamOpened {
        session: SessionId,
        result: Result<ChunkStream, ClientError>,
    },
    CaptureStarted {
        session: SessionId,
        result: Result<CapturePipeline, ClientError>,
    },
    /// A background server request for `session` failed.
    ApiFailed {
        session: SessionId,
        error: ClientError,
    },
    /// The stop grace delay for `attempt` has passed.
    GraceElapsed { attempt: u64 },
}

impl From<TransportEvent> for Event {
    fn from(event: TransportEvent) -> Self {
        Event::Transport(event)
    }
}

impl From<LatencyReading> for Event {
    fn from(reading: LatencyReading) -> Self {
        Event::Latency(reading)
    }
}

impl From<AudioChunk> for Event {
    fn from(chunk: AudioChunk) -> Self {
        Event::Chunk(chunk)
    }
}

impl From<StreamEvent> for Event {
    fn from(event: StreamEvent) -> Self {
        Event::Stream(event)
    }
}
