//! Session-scoped WebSocket that carries WAV chunks to `/ws/audio`.
//!
//! `send` is optimistic: it succeeds as soon as the chunk is queued for the
//! writer task, and never waits on the socket. The server's `{code, msg}`
//! replies arrive later on the reader task and are matched FIFO against the
//! chunks written, so every [`ChunkAck`] names the chunk it answers.

use std::collections::VecDeque;
use std::time::Duration;

use futures_util::stream::SplitSink;
use futures_util::{SinkExt, StreamExt};
use log::{debug, info, warn};
use tokio::net::TcpStream;
use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_tungstenite::tungstenite::protocol::Message;
use tokio_tungstenite::{MaybeTlsStream, WebSocketStream, connect_async};
use url::Url;

use crate::audio::AudioChunk;
use crate::error::{ClientError, is_session_not_found};
use crate::protocol::ServerReply;
use crate::session::SessionId;

/// Chunks held while the socket is still opening (about 2 s at 16 kHz).
pub const PENDING_CAPACITY: usize = 8;
/// Chunks queued for the writer before `send` starts refusing them.
pub const OUTBOUND_CAPACITY: usize = 32;
/// How long a local disconnect waits for the close handshake.
const CLOSE_TIMEOUT: Duration = Duration::from_secs(1);

type WsSink = SplitSink<WebSocketStream<MaybeTlsStream<TcpStream>>, Message>;

/// Immediate result of one `send`.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamAck {
    Sent { sequence: u64 },
    Failed(ClientError),
}

#[derive(Debug, Clone, PartialEq)]
pub enum AckOutcome {
    Accepted,
    Rejected { code: i64, message: String },
    /// The server no longer knows the session.
    SessionNotFound { message: String },
    /// The frame could not be written at all.
    NotSent { message: String },
}

/// Server reply to one chunk.
#[derive(Debug, Clone, PartialEq)]
pub struct ChunkAck {
    pub session: SessionId,
    /// `None` when the server replied more often than chunks were sent.
    pub sequence: Option<u64>,
    pub outcome: AckOutcome,
}

#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    Ack(ChunkAck),
    /// The server side went away; not sent after a local `disconnect`.
    Closed { session: SessionId, reason: String },
}

/// `http(s)://host/base` to `ws(s)://host/base/ws/audio?sessionid=N`.
pub fn stream_url(base: &Url, session: SessionId) -> Result<Url, ClientError> {
    let unavailable = |msg: String| ClientError::ChannelUnavailable(msg);
    let scheme = match base.scheme() {
        "http" | "ws" => "ws",
        "https" | "wss" => "wss",
        other => return Err(unavailable(format!("unsupported URL scheme '{}'", other))),
    };

    let mut url = base.clone();
    url.set_scheme(scheme)
        .map_err(|_| unavailable(format!("cannot use scheme '{}' for {}", scheme, base)))?;
    let path = format!("{}/ws/audio", base.path().trim_end_matches('/'));
    url.set_path(&path);
    url.set_query(Some(&format!("sessionid={}", session)));
    Ok(url)
}

pub struct ChunkStream {
    session: SessionId,
    outbound: mpsc::Sender<AudioChunk>,
    reader: JoinHandle<()>,
    writer: Option<JoinHandle<()>>,
}

impl ChunkStream {
    pub async fn connect<T>(base: &Url, session: SessionId, events: mpsc::Sender<T>) -> Result<Self, ClientError>
    where
        T: From<StreamEvent> + Send + 'static,
    {
        let url = stream_url(base, session)?;
        info!("Connecting audio channel {}", url);
        let (ws_stream, _) = connect_async(url.as_str())
            .await
            .map_err(|e| ClientError::ChannelUnavailable(e.to_string()))?;
        info!("Audio channel open for session {}", session);

        let (sink, read) = ws_stream.split();
        let (in_flight, in_flight_rx) = mpsc::unbounded_channel();
        let (outbound, outbound_rx) = mpsc::channel(OUTBOUND_CAPACITY);
        let writer = tokio::spawn(write_chunks(session, sink, outbound_rx, in_flight, events.clone()));
        let reader = tokio::spawn(read_replies(session, read, in_flight_rx, events));

        Ok(Self {
            session,
            outbound,
            reader,
            writer: Some(writer),
        })
    }

    pub fn session(&self) -> SessionId {
        self.session
    }

    /// Queues one chunk for the writer task. Fails at once when the writer
    /// is behind or gone.
    pub fn send(&self, chunk: &AudioChunk) -> StreamAck {
        let sequence = chunk.sequence;
        let message = match self.outbound.try_send(chunk.clone()) {
            Ok(()) => return StreamAck::Sent { sequence },
            Err(mpsc::error::TrySendError::Full(_)) => "send queue full",
            Err(mpsc::error::TrySendError::Closed(_)) => "audio channel writer stopped",
        };
        warn!("Failed to send chunk {}: {}", sequence, message);
        StreamAck::Failed(ClientError::TransmitFailure {
            sequence: Some(sequence),
            message: message.to_string(),
        })
    }

    /// Stops reading replies and lets the writer flush what is queued, then
    /// close the socket. Returns without waiting on the network.
    pub fn disconnect(mut self) {
        self.reader.abort();
        if let Some(writer) = self.writer.take() {
            let session = self.session;
            tokio::spawn(async move {
                let abort = writer.abort_handle();
                if tokio::time::timeout(CLOSE_TIMEOUT, writer).await.is_err() {
                    debug!("Audio channel for session {} did not close in time", session);
                    abort.abort();
                }
            });
        }
    }
}

impl Drop for ChunkStream {
    fn drop(&mut self) {
        self.reader.abort();
        if let Some(writer) = self.writer.take() {
            writer.abort();
        }
    }
}

async fn write_chunks<T>(
    session: SessionId,
    mut sink: WsSink,
    mut outbound: mpsc::Receiver<AudioChunk>,
    in_flight: mpsc::UnboundedSender<u64>,
    events: mpsc::Sender<T>,
) where
    T: From<StreamEvent> + Send + 'static,
{
    while let Some(chunk) = outbound.recv().await {
        debug!("Sending chunk {} ({} bytes)", chunk.sequence, chunk.wav.len());
        // the reader may see the reply before the write returns
        let _ = in_flight.send(chunk.sequence);
        if let Err(e) = sink.send(Message::Binary(chunk.wav)).await {
            warn!("Failed to send chunk {}: {}", chunk.sequence, e);
            let ack = ChunkAck {
                session,
                sequence: Some(chunk.sequence),
                outcome: AckOutcome::NotSent { message: e.to_string() },
            };
            let _ = events.send(StreamEvent::Ack(ack).into()).await;
            return;
        }
    }

    if let Err(e) = sink.send(Message::Close(None)).await {
        debug!("Close frame not sent: {}", e);
    }
    let _ = sink.close().await;
    info!("Audio channel closed for session {}", session);
}

async fn read_replies<S, T>(
    session: SessionId,
    mut read: S,
    mut in_flight: mpsc::UnboundedReceiver<u64>,
    events: mpsc::Sender<T>,
) where
    S: futures_util::Stream<Item = Result<Message, tokio_tungstenite::tungstenite::Error>> + Unpin,
    T: From<StreamEvent> + Send + 'static,
{
    let reason = loop {
        match read.next().await {
            Some(Ok(Message::Text(text))) => {
                let reply: ServerReply = match serde_json::from_str(&text) {
                    Ok(reply) => reply,
                    Err(e) => {
                        warn!("Unparseable audio channel reply {:?}: {}", text.as_str(), e);
                        continue;
                    }
                };
                let ack = ChunkAck {
                    session,
                    sequence: in_flight.try_recv().ok(),
                    outcome: outcome_of(reply),
                };
                if events.send(StreamEvent::Ack(ack).into()).await.is_err() {
                    return;
                }
            }
            Some(Ok(Message::Close(frame))) => break format!("server closed the channel: {:?}", frame),
            Some(Ok(_)) => {}
            Some(Err(e)) => break e.to_string(),
            None => break "connection closed".to_string(),
        }
    };
    warn!("Audio channel for session {} ended: {}", session, reason);
    let _ = events.send(StreamEvent::Closed { session, reason }.into()).await;
}

fn outcome_of(reply: ServerReply) -> AckOutcome {
    if reply.code == 0 {
        return AckOutcome::Accepted;
    }
    let message = reply.msg.unwrap_or_default();
    warn!("Audio channel reply code {}: {}", reply.code, message);
    if is_session_not_found(&message) {
        AckOutcome::SessionNotFound { message }
    } else {
        AckOutcome::Rejected {
            code: reply.code,
            message,
        }
    }
}

/// Bounded FIFO for chunks captured before the channel opened.
#[derive(Debug, Default)]
pub struct PendingChunks {
    chunks: VecDeque<AudioChunk>,
}

impl PendingChunks {
    /// Queues a chunk, returning the oldest one if it had to make room.
    pub fn push(&mut self, chunk: AudioChunk) -> Option<AudioChunk> {
        let dropped = if self.chunks.len() >= PENDING_CAPACITY {
            self.chunks.pop_front()
        } else {
            None
        };
        self.chunks.push_back(chunk);
        dropped
    }

    pub fn len(&self) -> usize {
        self.chunks.len()
    }

    pub fn is_empty(&self) -> bool {
        self.chunks.is_empty()
    }

    pub fn drain(&mut self) -> impl Iterator<Item = AudioChunk> + '_ {
        self.chunks.drain(..)
    }
}
