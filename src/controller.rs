//! Session coordinator.
//!
//! One task owns every piece of session state. Commands arrive from
//! [`ControllerHandle`]; transport callbacks, the latency sampler, the
//! capture thread and the audio channel reader all report through one
//! event channel. Capture and the audio channel run exactly while a
//! session is present.

use std::sync::Arc;
use std::time::Duration;

use bytes::{Bytes, BytesMut};
use log::{debug, error, info, warn};
use tokio::sync::{broadcast, mpsc, oneshot, watch};
use url::Url;

use crate::api::ServerApi;
use crate::audio::{AudioChunk, CaptureConstraints, CapturePipeline, Microphone, wav};
use crate::chunk_stream::{AckOutcome, ChunkAck, ChunkStream, PendingChunks, StreamAck, StreamEvent};
use crate::config::{Config, RecordingMode};
use crate::error::{ClientError, NegotiationError};
use crate::event::Event;
use crate::protocol::{HumanKind, HumanRequest, RecordAction};
use crate::rtc::health::HealthSignal;
use crate::rtc::latency::spawn_sampler;
use crate::rtc::{
    HealthMonitor, LatencyReading, LatencyTracker, Negotiated, Negotiator, SamplerHandle,
    TransportEvent, TransportEvents, TransportHandle, TransportSignal,
};
use crate::session::{ConnectionStatus, SessionId, SessionSnapshot, TrackKind};

/// Delay between `stop` and releasing the transport.
pub const STOP_GRACE: Duration = Duration::from_millis(500);
/// Upper bound on locally buffered audio in batch mode.
const MAX_UTTERANCE_SECS: usize = 60;

const COMMAND_CAPACITY: usize = 16;
const EVENT_CAPACITY: usize = 256;
const ACK_CAPACITY: usize = 64;

enum Command {
    Start {
        use_relay: bool,
        reply: oneshot::Sender<Result<SessionId, ClientError>>,
    },
    Stop,
    Shutdown {
        reply: oneshot::Sender<()>,
    },
    Invalidate(SessionId),
    TakeUtterance {
        reply: oneshot::Sender<Result<(SessionId, Bytes), ClientError>>,
    },
}

enum StreamSlot {
    Idle,
    Opening(PendingChunks),
    Open(ChunkStream),
    /// Connecting failed or the server closed it; chunks are dropped.
    Unavailable,
}

#[derive(Clone)]
pub struct ControllerHandle {
    commands: mpsc::Sender<Command>,
    snapshot: watch::Receiver<SessionSnapshot>,
    acks: broadcast::Sender<ChunkAck>,
    api: ServerApi,
}

impl ControllerHandle {
    /// Negotiates a new session. Resolves once the answer is applied.
    pub async fn start(&self, use_relay: bool) -> Result<SessionId, ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Start { use_relay, reply }).await?;
        rx.await.map_err(|_| ClientError::ControllerGone)?
    }

    /// Schedules teardown. Resources are released after [`STOP_GRACE`].
    pub async fn stop(&self) -> Result<(), ClientError> {
        self.send(Command::Stop).await
    }

    /// Releases everything and ends the controller task.
    pub async fn shutdown(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::Shutdown { reply }).await?;
        rx.await.map_err(|_| ClientError::ControllerGone)
    }

    pub fn snapshot(&self) -> SessionSnapshot {
        self.snapshot.borrow().clone()
    }

    pub fn watch(&self) -> watch::Receiver<SessionSnapshot> {
        self.snapshot.clone()
    }

    /// Resolves with the first snapshot satisfying `condition`.
    pub async fn wait_for<F>(&self, condition: F) -> Result<SessionSnapshot, ClientError>
    where
        F: FnMut(&SessionSnapshot) -> bool,
    {
        let mut rx = self.snapshot.clone();
        let snapshot = rx
            .wait_for(condition)
            .await
            .map_err(|_| ClientError::ControllerGone)?;
        Ok(snapshot.clone())
    }

    /// Server replies to streamed chunks, in arrival order.
    pub fn subscribe_acks(&self) -> broadcast::Receiver<ChunkAck> {
        self.acks.subscribe()
    }

    /// Sends text for the avatar to repeat (`Echo`) or answer (`Chat`).
    pub async fn say(&self, text: &str, kind: HumanKind, interrupt: bool) -> Result<(), ClientError> {
        let session = self.current_session()?;
        let request = HumanRequest {
            text: text.to_string(),
            kind,
            interrupt,
            sessionid: session,
        };
        let result = self.api.human(&request).await;
        self.observe(session, result).await
    }

    pub async fn interrupt(&self) -> Result<(), ClientError> {
        let session = self.current_session()?;
        let result = self.api.interrupt_talk(session).await;
        self.observe(session, result).await
    }

    pub async fn is_speaking(&self) -> Result<bool, ClientError> {
        let session = self.current_session()?;
        let result = self.api.is_speaking(session).await;
        self.observe(session, result).await
    }

    /// Batch mode: closes the current utterance, uploads it and starts the
    /// next one.
    pub async fn submit_utterance(&self) -> Result<(), ClientError> {
        let (reply, rx) = oneshot::channel();
        self.send(Command::TakeUtterance { reply }).await?;
        let (session, wav) = rx.await.map_err(|_| ClientError::ControllerGone)??;

        let result = async {
            self.api.record(session, RecordAction::EndRecord).await?;
            self.api.upload_audio(session, wav.to_vec()).await?;
            self.api.record(session, RecordAction::StartRecord).await
        }
        .await;
        self.observe(session, result).await
    }

    fn current_session(&self) -> Result<SessionId, ClientError> {
        self.snapshot.borrow().session.ok_or(ClientError::NoSession)
    }

    async fn observe<T>(&self, session: SessionId, result: Result<T, ClientError>) -> Result<T, ClientError> {
        if let Err(ClientError::SessionInvalidated(_)) = &result {
            let _ = self.commands.send(Command::Invalidate(session)).await;
        }
        result
    }

    async fn send(&self, command: Command) -> Result<(), ClientError> {
        self.commands
            .send(command)
            .await
            .map_err(|_| ClientError::ControllerGone)
    }
}

pub struct Controller {
    negotiator: Arc<dyn Negotiator>,
    microphone: Arc<dyn Microphone>,
    api: ServerApi,
    base_url: Url,
    constraints: CaptureConstraints,
    recording_mode: RecordingMode,

    commands: mpsc::Receiver<Command>,
    events_tx: mpsc::Sender<Event>,
    events: mpsc::Receiver<Event>,
    snapshot: watch::Sender<SessionSnapshot>,
    acks: broadcast::Sender<ChunkAck>,
    /// Latency gate shared with the sampler task.
    ready: watch::Sender<bool>,

    /// Bumped whenever a transport is retired; stale events carry old values.
    attempt: u64,
    pending_start: Option<oneshot::Sender<Result<SessionId, ClientError>>>,
    health: HealthMonitor,
    latency: LatencyTracker,
    session: Option<SessionId>,
    transport: Option<Arc<dyn TransportHandle>>,
    sampler: Option<SamplerHandle>,
    capture: Option<CapturePipeline>,
    stream: StreamSlot,
    utterance: BytesMut,
    stopping: bool,
    advisory: Option<ClientError>,
}

impl Controller {
    pub fn new(
        config: &Config,
        negotiator: Arc<dyn Negotiator>,
        microphone: Arc<dyn Microphone>,
        api: ServerApi,
    ) -> (Self, ControllerHandle) {
        let (commands_tx, commands) = mpsc::channel(COMMAND_CAPACITY);
        let (events_tx, events) = mpsc::channel(EVENT_CAPACITY);
        let (snapshot, snapshot_rx) = watch::channel(SessionSnapshot::default());
        let (acks, _) = broadcast::channel(ACK_CAPACITY);
        let (ready, _) = watch::channel(false);

        let handle = ControllerHandle {
            commands: commands_tx,
            snapshot: snapshot_rx,
            acks: acks.clone(),
            api: api.clone(),
        };

        let controller = Self {
            negotiator,
            microphone,
            base_url: api.base_url().clone(),
            api,
            constraints: CaptureConstraints::from(&config.audio),
            recording_mode: config.recording_mode,
            commands,
            events_tx,
            events,
            snapshot,
            acks,
            ready,
            attempt: 0,
            pending_start: None,
            health: HealthMonitor::new(),
            latency: LatencyTracker::default(),
            session: None,
            transport: None,
            sampler: None,
            capture: None,
            stream: StreamSlot::Idle,
            utterance: BytesMut::new(),
            stopping: false,
            advisory: None,
        };
        (controller, handle)
    }

    pub async fn run(mut self) {
        info!("Session controller started ({:?} recording)", self.recording_mode);
        loop {
            tokio::select! {
                command = self.commands.recv() => match command {
                    Some(Command::Shutdown { reply }) => {
                        self.shutdown().await;
                        let _ = reply.send(());
                        break;
                    }
                    Some(command) => self.handle_command(command).await,
                    None => {
                        self.shutdown().await;
                        break;
                    }
                },
                Some(event) = self.events.recv() => self.handle_event(event).await,
            }
        }
        info!("Session controller stopped");
    }

    async fn handle_command(&mut self, command: Command) {
        match command {
            Command::Start { use_relay, reply } => self.start(use_relay, reply),
            Command::Stop => self.stop(),
            Command::Invalidate(session) => self.invalidate(session).await,
            Command::TakeUtterance { reply } => {
                let _ = reply.send(self.take_utterance());
            }
            Command::Shutdown { reply } => {
                self.shutdown().await;
                let _ = reply.send(());
            }
        }
    }

    async fn handle_event(&mut self, event: Event) {
        match event {
            Event::Transport(event) => self.on_transport(event).await,
            Event::Latency(reading) => self.on_latency(reading),
            Event::Chunk(chunk) => self.on_chunk(chunk),
            Event::Stream(event) => self.on_stream(event).await,
            Event::Negotiated { attempt, result } => self.on_negotiated(attempt, result),
            Event::StreamOpened { session, result } => self.on_stream_opened(session, result),
            Event::CaptureStarted { session, result } => self.on_capture_started(session, result).await,
            Event::ApiFailed { session, error } => self.on_api_failed(session, error).await,
            Event::GraceElapsed { attempt } => {
                if attempt == self.attempt && self.stopping {
                    self.finish_stop().await;
                }
            }
        }
    }

    fn start(&mut self, use_relay: bool, reply: oneshot::Sender<Result<SessionId, ClientError>>) {
        if self.session.is_some() || self.pending_start.is_some() || self.transport.is_some() {
            warn!("Start rejected, a session is already active");
            let _ = reply.send(Err(ClientError::AlreadyActive));
            return;
        }

        self.attempt += 1;
        let attempt = self.attempt;
        info!("Connection attempt {} (relay: {})", attempt, use_relay);

        self.health.begin_attempt();
        self.latency.reset();
        self.advisory = None;
        self.stopping = false;
        self.pending_start = Some(reply);
        self.update_ready();
        self.publish();

        let negotiator = self.negotiator.clone();
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            let result = negotiator
                .negotiate(use_relay, TransportEvents::new(attempt, events.clone()))
                .await;
            let _ = events.send(Event::Negotiated { attempt, result }).await;
        });
    }

    fn on_negotiated(&mut self, attempt: u64, result: Result<Negotiated, NegotiationError>) {
        let reply = match self.pending_start.take() {
            Some(reply) if attempt == self.attempt => reply,
            other => {
                self.pending_start = other;
                if let Ok(negotiated) = result {
                    debug!("Closing transport of retired attempt {}", attempt);
                    close_in_background(negotiated.transport);
                }
                return;
            }
        };

        match result {
            Ok(Negotiated { session, transport }) => {
                self.session = Some(session);
                self.transport = Some(transport.clone());
                self.sampler = Some(spawn_sampler(
                    attempt,
                    transport,
                    self.ready.subscribe(),
                    self.events_tx.clone(),
                ));
                let _ = reply.send(Ok(session));
                self.begin_session(session);
            }
            Err(e) => {
                error!("Negotiation failed: {}", e);
                self.health.fail();
                self.update_ready();
                let _ = reply.send(Err(e.into()));
            }
        }
        self.publish();
    }

    /// Session absent to present: open the audio channel and start capture.
    fn begin_session(&mut self, session: SessionId) {
        info!("Session {} established", session);
        let events = self.events_tx.clone();

        match self.recording_mode {
            RecordingMode::Stream => {
                self.stream = StreamSlot::Opening(PendingChunks::default());
                let base = self.base_url.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    let result = ChunkStream::connect(&base, session, events.clone()).await;
                    let _ = events.send(Event::StreamOpened { session, result }).await;
                });
            }
            RecordingMode::Batch => {
                self.utterance.clear();
                let api = self.api.clone();
                let events = events.clone();
                tokio::spawn(async move {
                    if let Err(error) = api.record(session, RecordAction::StartRecord).await {
                        let _ = events.send(Event::ApiFailed { session, error }).await;
                    }
                });
            }
        }

        let microphone = self.microphone.clone();
        let constraints = self.constraints.clone();
        tokio::spawn(async move {
            let result = CapturePipeline::start(microphone, constraints, session, events.clone()).await;
            let _ = events.send(Event::CaptureStarted { session, result }).await;
        });
    }

    async fn on_transport(&mut self, event: TransportEvent) {
        if event.attempt != self.attempt {
            debug!("Discarding {:?} from retired attempt {}", event.signal, event.attempt);
            return;
        }
        match event.signal {
            TransportSignal::Peer(state) => self.apply_health(HealthSignal::Peer(state)).await,
            TransportSignal::Ice(state) => self.apply_health(HealthSignal::Ice(state)).await,
            TransportSignal::TrackAttached(kind) => {
                if self.health.track_attached(kind) {
                    info!("Remote {:?} track available", kind);
                    self.publish();
                }
            }
        }
    }

    async fn apply_health(&mut self, signal: HealthSignal) {
        let Some(update) = self.health.apply(signal) else {
            return;
        };
        self.update_ready();
        if update.clear_session {
            info!("Transport is {:?}, clearing session", update.status);
            self.retire_transport().await;
        }
        self.publish();
    }

    /// The transport dropped out from under us. The status it reported stays.
    async fn retire_transport(&mut self) {
        self.attempt += 1;
        self.stopping = false;
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(NegotiationError::Transport(format!(
                "transport {:?} during negotiation",
                self.health.status()
            ))
            .into()));
        }
        self.release_session().await;
        if let Some(transport) = self.transport.take() {
            close_in_background(transport);
        }
    }

    fn on_latency(&mut self, reading: LatencyReading) {
        if reading.attempt != self.attempt {
            debug!("Discarding RTT sample from retired attempt {}", reading.attempt);
            return;
        }
        let connected = self.health.latency_gate();
        if self.latency.offer(reading.rtt_ms, connected) {
            debug!("Latency now {} ms", reading.rtt_ms);
            self.publish();
        } else if !connected {
            debug!("Discarding RTT sample while {:?}", self.health.status());
        }
    }

    fn on_chunk(&mut self, chunk: AudioChunk) {
        if self.session != Some(chunk.session) {
            debug!("Dropping chunk {} of a past session", chunk.sequence);
            return;
        }

        if self.recording_mode == RecordingMode::Batch {
            let limit = MAX_UTTERANCE_SECS
                * self.constraints.sample_rate as usize
                * self.constraints.channels as usize
                * 2;
            if self.utterance.len() + chunk.pcm().len() > limit {
                warn!("Utterance buffer full, dropping chunk {}", chunk.sequence);
            } else {
                self.utterance.extend_from_slice(chunk.pcm());
            }
            return;
        }

        match &mut self.stream {
            StreamSlot::Opening(pending) => {
                if let Some(dropped) = pending.push(chunk) {
                    warn!("Audio channel not open yet, dropped chunk {}", dropped.sequence);
                }
            }
            StreamSlot::Open(stream) => {
                let ack = stream.send(&chunk);
                self.on_send_result(chunk.session, ack);
            }
            StreamSlot::Idle | StreamSlot::Unavailable => {
                debug!("No audio channel, dropping chunk {}", chunk.sequence);
            }
        }
    }

    fn on_send_result(&self, session: SessionId, ack: StreamAck) {
        if let StreamAck::Failed(ClientError::TransmitFailure { sequence, message }) = ack {
            let _ = self.acks.send(ChunkAck {
                session,
                sequence,
                outcome: AckOutcome::NotSent { message },
            });
        }
    }

    fn on_stream_opened(&mut self, session: SessionId, result: Result<ChunkStream, ClientError>) {
        let current = self.session == Some(session) && matches!(self.stream, StreamSlot::Opening(_));
        if !current {
            if let Ok(stream) = result {
                stream.disconnect();
            }
            return;
        }

        match result {
            Ok(stream) => {
                let queued: Vec<AudioChunk> = match &mut self.stream {
                    StreamSlot::Opening(pending) => pending.drain().collect(),
                    _ => Vec::new(),
                };
                if !queued.is_empty() {
                    debug!("Flushing {} chunk(s) captured while connecting", queued.len());
                }
                for chunk in &queued {
                    let ack = stream.send(chunk);
                    self.on_send_result(session, ack);
                }
                self.stream = StreamSlot::Open(stream);
            }
            Err(e) => {
                warn!("Audio channel unavailable: {}", e);
                self.stream = StreamSlot::Unavailable;
                self.advisory = Some(e);
                self.publish();
            }
        }
    }

    async fn on_stream(&mut self, event: StreamEvent) {
        match event {
            StreamEvent::Ack(ack) => {
                let _ = self.acks.send(ack.clone());
                if self.session != Some(ack.session) {
                    return;
                }
                if let AckOutcome::SessionNotFound { .. } = ack.outcome {
                    self.invalidate(ack.session).await;
                }
            }
            StreamEvent::Closed { session, reason } => {
                if self.session != Some(session) || !matches!(self.stream, StreamSlot::Open(_)) {
                    return;
                }
                warn!("Audio channel for session {} lost: {}", session, reason);
                self.stream = StreamSlot::Unavailable;
                self.advisory = Some(ClientError::ChannelUnavailable(reason));
                self.stop();
                self.publish();
            }
        }
    }

    async fn on_capture_started(&mut self, session: SessionId, result: Result<CapturePipeline, ClientError>) {
        if self.session != Some(session) {
            if let Ok(capture) = result {
                capture.stop().await;
            }
            return;
        }
        match result {
            Ok(capture) => self.capture = Some(capture),
            Err(e) => {
                warn!("Recording unavailable for session {}: {}", session, e);
                self.advisory = Some(e);
            }
        }
        self.publish();
    }

    async fn on_api_failed(&mut self, session: SessionId, error: ClientError) {
        if self.session != Some(session) {
            return;
        }
        if let ClientError::SessionInvalidated(_) = error {
            self.invalidate(session).await;
        } else {
            warn!("Server request failed for session {}: {}", session, error);
            self.advisory = Some(error);
            self.publish();
        }
    }

    /// The server no longer knows the session: drop capture and the channel
    /// now, then let the transport go through the normal grace period.
    async fn invalidate(&mut self, session: SessionId) {
        if self.session != Some(session) {
            return;
        }
        warn!("Server invalidated session {}", session);
        self.advisory = Some(ClientError::SessionInvalidated(session));
        self.release_session().await;
        self.publish();
        if !self.stopping {
            self.stopping = true;
            self.schedule_grace();
        }
    }

    fn stop(&mut self) {
        if let Some(reply) = self.pending_start.take() {
            info!("Cancelling connection attempt {}", self.attempt);
            let _ = reply.send(Err(ClientError::Cancelled));
            self.attempt += 1;
            self.health.reset();
            self.latency.reset();
            self.update_ready();
            self.publish();
            return;
        }
        if self.stopping {
            return;
        }
        if self.transport.is_none() {
            // a failed attempt still settles into Disconnected
            if self.health.status() != ConnectionStatus::Disconnected {
                info!("Clearing {:?} status", self.health.status());
                self.stopping = true;
                self.schedule_grace();
            }
            return;
        }

        info!("Stopping session {:?}", self.session);
        self.stopping = true;
        if let Some(sampler) = self.sampler.take() {
            sampler.cancel();
        }
        if let (RecordingMode::Batch, Some(session)) = (self.recording_mode, self.session) {
            if let Ok((_, wav)) = self.take_utterance() {
                let api = self.api.clone();
                tokio::spawn(async move {
                    let result = async {
                        api.record(session, RecordAction::EndRecord).await?;
                        api.upload_audio(session, wav.to_vec()).await
                    }
                    .await;
                    if let Err(e) = result {
                        warn!("Final utterance upload failed: {}", e);
                    }
                });
            }
        }
        self.schedule_grace();
    }

    fn schedule_grace(&self) {
        let attempt = self.attempt;
        let events = self.events_tx.clone();
        tokio::spawn(async move {
            tokio::time::sleep(STOP_GRACE).await;
            let _ = events.send(Event::GraceElapsed { attempt }).await;
        });
    }

    async fn finish_stop(&mut self) {
        self.stopping = false;
        self.attempt += 1;
        self.release_session().await;
        if let Some(transport) = self.transport.take() {
            close_in_background(transport);
        }
        self.health.reset();
        self.update_ready();
        self.publish();
        info!("Disconnected");
    }

    /// Session present to absent: capture first, then the channel.
    async fn release_session(&mut self) {
        if let Some(sampler) = self.sampler.take() {
            sampler.cancel();
        }
        self.latency.reset();
        let session = self.session.take();

        if let Some(capture) = self.capture.take() {
            capture.stop().await;
        }
        match std::mem::replace(&mut self.stream, StreamSlot::Idle) {
            StreamSlot::Open(stream) => stream.disconnect(),
            StreamSlot::Opening(pending) if !pending.is_empty() => {
                debug!("Discarding {} chunk(s) that never reached the server", pending.len());
            }
            _ => {}
        }
        self.utterance.clear();

        if let Some(session) = session {
            info!("Session {} released", session);
        }
    }

    async fn shutdown(&mut self) {
        info!("Shutting down session controller");
        if let Some(reply) = self.pending_start.take() {
            let _ = reply.send(Err(ClientError::Cancelled));
        }
        self.attempt += 1;
        self.stopping = false;
        self.release_session().await;
        if let Some(transport) = self.transport.take() {
            if tokio::time::timeout(STOP_GRACE, transport.close()).await.is_err() {
                warn!("Transport did not close within {:?}", STOP_GRACE);
            }
        }
        self.health.reset();
        self.update_ready();
        self.publish();
    }

    fn take_utterance(&mut self) -> Result<(SessionId, Bytes), ClientError> {
        if self.recording_mode != RecordingMode::Batch {
            return Err(ClientError::Recording("utterances are streamed in stream mode".into()));
        }
        let session = self.session.ok_or(ClientError::NoSession)?;
        if self.utterance.is_empty() {
            return Err(ClientError::Recording("no audio captured yet".into()));
        }
        let pcm = self.utterance.split().freeze();
        Ok((
            session,
            wav::encode_pcm_bytes(&pcm, self.constraints.sample_rate, self.constraints.channels),
        ))
    }

    fn update_ready(&self) {
        self.ready.send_replace(self.health.latency_gate());
    }

    fn publish(&self) {
        self.snapshot.send_replace(SessionSnapshot {
            status: self.health.status(),
            session: self.session,
            latency_ms: self.latency.value(),
            recording: self.capture.is_some(),
            audio_attached: self.health.is_attached(TrackKind::Audio),
            video_attached: self.health.is_attached(TrackKind::Video),
            advisory: self.advisory.clone(),
        });
    }
}

fn close_in_background(transport: Arc<dyn TransportHandle>) {
    tokio::spawn(async move {
        transport.close().await;
    });
}
