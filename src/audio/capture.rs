//! Microphone capture pipeline.
//!
//! A dedicated OS thread reads the device, buffers samples into blocks of
//! [`BLOCK_FRAMES`] frames and hands each full block to a [`ChunkSink`] as a
//! WAV-wrapped [`AudioChunk`].

use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::thread::{self, JoinHandle};

use bytes::Bytes;
use log::{debug, error, info, warn};
use tokio::sync::{mpsc, oneshot};

use super::alsa_device::CaptureDevice;
use super::speex::{Denoiser, RateConverter};
use super::wav;
use crate::config::AudioConfig;
use crate::error::ClientError;
use crate::session::SessionId;

/// Frames per delivered block (256 ms at 16 kHz).
pub const BLOCK_FRAMES: usize = 4096;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CaptureConstraints {
    pub sample_rate: u32,
    pub channels: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
}

impl From<&AudioConfig> for CaptureConstraints {
    fn from(audio: &AudioConfig) -> Self {
        Self {
            sample_rate: audio.sample_rate,
            channels: audio.channel_count,
            echo_cancellation: audio.echo_cancellation,
            noise_suppression: audio.noise_suppression,
        }
    }
}

/// One WAV-framed block of captured audio.
#[derive(Debug, Clone, PartialEq)]
pub struct AudioChunk {
    pub session: SessionId,
    /// Zero-based, per session.
    pub sequence: u64,
    pub sample_rate: u32,
    pub channels: u16,
    /// 44-byte header followed by little-endian PCM.
    pub wav: Bytes,
}

impl AudioChunk {
    pub fn pcm(&self) -> &[u8] {
        &self.wav[wav::HEADER_LEN..]
    }
}

/// An opened audio source. Lives on the capture thread only.
pub trait AudioInput {
    /// Blocks for the next batch of interleaved samples in `[-1.0, 1.0]`,
    /// appending them to `out`. Returns the number of frames appended.
    fn read(&mut self, out: &mut Vec<f32>) -> anyhow::Result<usize>;

    /// Releases the hardware.
    fn stop(&mut self) -> anyhow::Result<()>;
}

pub trait Microphone: Send + Sync {
    /// Fails with `CaptureUnavailable` when no usable device exists or
    /// access is denied.
    fn open(&self, constraints: &CaptureConstraints) -> Result<Box<dyn AudioInput>, ClientError>;
}

/// What happened to a chunk handed to a [`ChunkSink`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Delivery {
    Queued,
    /// The consumer is behind. The sequence number is reused for the next chunk.
    Dropped,
    /// The receiving side is gone.
    Closed,
}

/// Receives finished chunks on the capture thread. Must not block.
pub trait ChunkSink: Send + 'static {
    fn deliver(&self, chunk: AudioChunk) -> Delivery;
}

impl<T> ChunkSink for mpsc::Sender<T>
where
    T: From<AudioChunk> + Send + 'static,
{
    fn deliver(&self, chunk: AudioChunk) -> Delivery {
        let sequence = chunk.sequence;
        match self.try_send(chunk.into()) {
            Ok(()) => Delivery::Queued,
            Err(mpsc::error::TrySendError::Full(_)) => {
                warn!("Audio chunk {} dropped, consumer is behind", sequence);
                Delivery::Dropped
            }
            Err(mpsc::error::TrySendError::Closed(_)) => Delivery::Closed,
        }
    }
}

/// Scales one float sample to 16-bit PCM, clamping to `[-1.0, 1.0]` first.
pub fn to_pcm16(sample: f32) -> i16 {
    let s = if sample.is_nan() { 0.0 } else { sample.clamp(-1.0, 1.0) };
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Accumulates interleaved samples into fixed-size blocks.
#[derive(Debug)]
pub struct BlockFramer {
    block_len: usize,
    pending: Vec<f32>,
}

impl BlockFramer {
    pub fn new(channels: u16) -> Self {
        let block_len = BLOCK_FRAMES * channels.max(1) as usize;
        Self {
            block_len,
            pending: Vec::with_capacity(block_len),
        }
    }

    /// Feeds samples, calling `emit` once per completed block.
    pub fn push(&mut self, mut samples: &[f32], mut emit: impl FnMut(&[f32])) {
        while !samples.is_empty() {
            let take = (self.block_len - self.pending.len()).min(samples.len());
            self.pending.extend_from_slice(&samples[..take]);
            samples = &samples[take..];
            if self.pending.len() == self.block_len {
                emit(&self.pending);
                self.pending.clear();
            }
        }
    }

    /// Samples held back waiting for a full block.
    pub fn buffered(&self) -> usize {
        self.pending.len()
    }
}

/// A running capture for one session.
pub struct CapturePipeline {
    session: SessionId,
    running: Arc<AtomicBool>,
    thread: Option<JoinHandle<anyhow::Result<()>>>,
}

impl CapturePipeline {
    /// Opens the microphone on a new capture thread and starts delivering
    /// chunks to `sink`. Returns once the device is open.
    pub async fn start<S: ChunkSink>(
        microphone: Arc<dyn Microphone>,
        constraints: CaptureConstraints,
        session: SessionId,
        sink: S,
    ) -> Result<Self, ClientError> {
        let running = Arc::new(AtomicBool::new(true));
        let (ready_tx, ready_rx) = oneshot::channel::<Result<(), ClientError>>();

        let thread_running = running.clone();
        let thread = thread::Builder::new()
            .name("audio-capture".into())
            .spawn(move || -> anyhow::Result<()> {
                let mut input = match microphone.open(&constraints) {
                    Ok(input) => {
                        let _ = ready_tx.send(Ok(()));
                        input
                    }
                    Err(e) => {
                        let _ = ready_tx.send(Err(e));
                        return Ok(());
                    }
                };
                let captured = capture_loop(input.as_mut(), &constraints, session, &sink, &thread_running);
                // released whether or not the loop ended cleanly
                let released = input.stop();
                captured.and(released)
            })
            .map_err(|e| ClientError::CaptureUnavailable(format!("failed to spawn capture thread: {}", e)))?;

        let mut pipeline = Self {
            session,
            running,
            thread: Some(thread),
        };

        match ready_rx.await {
            Ok(Ok(())) => {
                info!("Capture started for session {}", session);
                Ok(pipeline)
            }
            Ok(Err(e)) => {
                pipeline.join().await;
                Err(e)
            }
            Err(_) => {
                pipeline.join().await;
                Err(ClientError::CaptureUnavailable("capture thread exited during start".into()))
            }
        }
    }

    /// Detaches the sink, waits for the capture thread to exit and releases
    /// the device. Each step runs even if an earlier one failed.
    pub async fn stop(mut self) {
        self.running.store(false, Ordering::SeqCst);
        self.join().await;
        info!("Capture stopped for session {}", self.session);
    }

    async fn join(&mut self) {
        let Some(handle) = self.thread.take() else {
            return;
        };
        match tokio::task::spawn_blocking(move || handle.join()).await {
            Ok(Ok(Ok(()))) => {}
            Ok(Ok(Err(e))) => warn!("Capture ended with error: {:#}", e),
            Ok(Err(_)) => error!("Capture thread panicked"),
            Err(e) => error!("Failed to join capture thread: {}", e),
        }
    }
}

impl Drop for CapturePipeline {
    fn drop(&mut self) {
        self.running.store(false, Ordering::SeqCst);
    }
}

fn capture_loop(
    input: &mut dyn AudioInput,
    constraints: &CaptureConstraints,
    session: SessionId,
    sink: &dyn ChunkSink,
    running: &AtomicBool,
) -> anyhow::Result<()> {
    let mut framer = BlockFramer::new(constraints.channels);
    let mut samples = Vec::with_capacity(BLOCK_FRAMES * constraints.channels as usize);
    let mut pcm = Vec::with_capacity(BLOCK_FRAMES * constraints.channels as usize);
    let mut sequence = 0u64;
    let mut sink_open = true;

    while sink_open && running.load(Ordering::SeqCst) {
        samples.clear();
        input.read(&mut samples)?;

        framer.push(&samples, |block| {
            if !sink_open || !running.load(Ordering::SeqCst) {
                return;
            }
            pcm.clear();
            pcm.extend(block.iter().copied().map(to_pcm16));
            let chunk = AudioChunk {
                session,
                sequence,
                sample_rate: constraints.sample_rate,
                channels: constraints.channels,
                wav: wav::encode(&pcm, constraints.sample_rate, constraints.channels),
            };
            debug!("Captured chunk {} ({} bytes)", sequence, chunk.wav.len());
            match sink.deliver(chunk) {
                Delivery::Queued => sequence += 1,
                Delivery::Dropped => {}
                Delivery::Closed => sink_open = false,
            }
        });
    }

    if framer.buffered() > 0 {
        debug!("Discarding {} trailing samples", framer.buffered());
    }
    Ok(())
}

/// Capture from an ALSA device, with optional Speex denoise/AGC and
/// resampling when the hardware cannot run at the requested rate.
pub struct AlsaMicrophone {
    capture_device: String,
    echo_cancel_device: Option<String>,
}

impl AlsaMicrophone {
    pub fn new(audio: &AudioConfig) -> Self {
        Self {
            capture_device: audio.capture_device.clone(),
            echo_cancel_device: audio.echo_cancel_device.clone(),
        }
    }

    /// Echo cancellation is provided by the device layer, when available.
    fn device_for(&self, constraints: &CaptureConstraints) -> &str {
        match (&self.echo_cancel_device, constraints.echo_cancellation) {
            (Some(device), true) => device,
            (None, true) => {
                warn!(
                    "Echo cancellation requested but no echo-cancel device configured, using '{}'",
                    self.capture_device
                );
                &self.capture_device
            }
            (_, false) => &self.capture_device,
        }
    }
}

impl Microphone for AlsaMicrophone {
    fn open(&self, constraints: &CaptureConstraints) -> Result<Box<dyn AudioInput>, ClientError> {
        let unavailable = |e: anyhow::Error| ClientError::CaptureUnavailable(format!("{:#}", e));

        let device_name = self.device_for(constraints);
        let device = CaptureDevice::open(device_name, constraints.sample_rate, constraints.channels as u32)
            .map_err(unavailable)?;
        let params = device.params().clone();
        if params.channels != constraints.channels as u32 {
            return Err(ClientError::CaptureUnavailable(format!(
                "device '{}' delivers {} channel(s), {} requested",
                device_name, params.channels, constraints.channels
            )));
        }

        let channels = params.channels as usize;
        let denoiser = if constraints.noise_suppression {
            Some(Denoiser::new(channels, params.period_size, params.sample_rate).map_err(unavailable)?)
        } else {
            None
        };
        let converter = if params.sample_rate != constraints.sample_rate {
            info!(
                "Resampling capture from {} Hz to {} Hz",
                params.sample_rate, constraints.sample_rate
            );
            Some(
                RateConverter::new(channels, params.sample_rate, constraints.sample_rate)
                    .map_err(unavailable)?,
            )
        } else {
            None
        };

        Ok(Box::new(AlsaInput {
            period: vec![0; params.period_size * channels],
            channels,
            device,
            denoiser,
            converter,
        }))
    }
}

struct AlsaInput {
    device: CaptureDevice,
    channels: usize,
    period: Vec<i16>,
    denoiser: Option<Denoiser>,
    converter: Option<RateConverter>,
}

impl AudioInput for AlsaInput {
    fn read(&mut self, out: &mut Vec<f32>) -> anyhow::Result<usize> {
        let frames = match self.device.read(&mut self.period) {
            Ok(frames) => frames,
            Err(e) => {
                self.device.recover(e)?;
                return Ok(0);
            }
        };

        let period = &mut self.period[..frames * self.channels];
        if let Some(denoiser) = self.denoiser.as_mut() {
            denoiser.process(period);
        }
        let pcm: &[i16] = match self.converter.as_mut() {
            Some(converter) => converter.process(period)?,
            None => period,
        };

        out.extend(pcm.iter().map(|s| *s as f32 / 32768.0));
        Ok(pcm.len() / self.channels)
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.device.halt()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::time::Duration;

    #[test]
    fn pcm16_clamps_and_scales_asymmetrically() {
        assert_eq!(to_pcm16(0.0), 0);
        assert_eq!(to_pcm16(1.0), 32767);
        assert_eq!(to_pcm16(-1.0), -32768);
        assert_eq!(to_pcm16(2.5), 32767);
        assert_eq!(to_pcm16(-7.0), -32768);
        assert_eq!(to_pcm16(0.5), 16383);
        assert_eq!(to_pcm16(-0.5), -16384);
        assert_eq!(to_pcm16(f32::NAN), 0);
    }

    #[test]
    fn framer_emits_full_blocks_only() {
        let mut framer = BlockFramer::new(1);
        let mut blocks = Vec::new();
        framer.push(&vec![0.1; 3000], |b| blocks.push(b.len()));
        assert!(blocks.is_empty());
        framer.push(&vec![0.1; 6000], |b| blocks.push(b.len()));
        assert_eq!(blocks, vec![BLOCK_FRAMES, BLOCK_FRAMES]);
        assert_eq!(framer.buffered(), 9000 - 2 * BLOCK_FRAMES);
    }

    #[test]
    fn stereo_blocks_hold_4096_frames() {
        let mut framer = BlockFramer::new(2);
        let mut count = 0;
        framer.push(&vec![0.0; BLOCK_FRAMES * 2], |b| {
            assert_eq!(b.len(), BLOCK_FRAMES * 2);
            count += 1;
        });
        assert_eq!(count, 1);
    }

    /// Produces `per_read` mono frames of a ramp on every read.
    struct RampInput {
        per_read: usize,
        next: f32,
        released: Arc<AtomicBool>,
    }

    impl AudioInput for RampInput {
        fn read(&mut self, out: &mut Vec<f32>) -> anyhow::Result<usize> {
            std::thread::sleep(Duration::from_millis(1));
            for _ in 0..self.per_read {
                out.push(self.next);
                self.next = if self.next >= 1.0 { -1.0 } else { self.next + 0.001 };
            }
            Ok(self.per_read)
        }

        fn stop(&mut self) -> anyhow::Result<()> {
            self.released.store(true, Ordering::SeqCst);
            Ok(())
        }
    }

    struct RampMicrophone {
        per_read: usize,
        released: Arc<AtomicBool>,
    }

    impl Microphone for RampMicrophone {
        fn open(&self, _: &CaptureConstraints) -> Result<Box<dyn AudioInput>, ClientError> {
            Ok(Box::new(RampInput {
                per_read: self.per_read,
                next: 0.0,
                released: self.released.clone(),
            }))
        }
    }

    struct DeniedMicrophone;

    impl Microphone for DeniedMicrophone {
        fn open(&self, _: &CaptureConstraints) -> Result<Box<dyn AudioInput>, ClientError> {
            Err(ClientError::CaptureUnavailable("Permission denied".into()))
        }
    }

    fn constraints() -> CaptureConstraints {
        CaptureConstraints {
            sample_rate: 16000,
            channels: 1,
            echo_cancellation: true,
            noise_suppression: true,
        }
    }

    #[tokio::test]
    async fn sequences_increase_without_gaps_across_fills() {
        let released = Arc::new(AtomicBool::new(false));
        // 1000 frames per read never lines up with the block size
        let mic = Arc::new(RampMicrophone {
            per_read: 1000,
            released: released.clone(),
        });
        let session = SessionId::new(42).unwrap();
        let (tx, mut rx) = mpsc::channel::<AudioChunk>(64);

        let pipeline = CapturePipeline::start(mic, constraints(), session, tx).await.unwrap();
        let mut chunks = Vec::new();
        while chunks.len() < 5 {
            chunks.push(rx.recv().await.unwrap());
        }
        pipeline.stop().await;

        for (i, chunk) in chunks.iter().enumerate() {
            assert_eq!(chunk.sequence, i as u64);
            assert_eq!(chunk.session, session);
            let header = wav::parse_header(&chunk.wav).unwrap();
            assert_eq!(header.sample_rate, 16000);
            assert_eq!(header.channels, 1);
            assert_eq!(header.data_len as usize, BLOCK_FRAMES * 2);
            assert_eq!(chunk.pcm().len(), BLOCK_FRAMES * 2);
        }
        assert!(released.load(Ordering::SeqCst));
    }

    /// Refuses every other chunk and stops capture after `limit` accepted.
    struct BusySink {
        offered: std::sync::Mutex<Vec<u64>>,
        accepted: std::sync::Mutex<Vec<u64>>,
        limit: usize,
        running: Arc<AtomicBool>,
    }

    impl ChunkSink for Arc<BusySink> {
        fn deliver(&self, chunk: AudioChunk) -> Delivery {
            let mut offered = self.offered.lock().unwrap();
            offered.push(chunk.sequence);
            if offered.len() % 2 == 0 {
                return Delivery::Dropped;
            }
            let mut accepted = self.accepted.lock().unwrap();
            accepted.push(chunk.sequence);
            if accepted.len() >= self.limit {
                self.running.store(false, Ordering::SeqCst);
            }
            Delivery::Queued
        }
    }

    #[test]
    fn dropped_chunks_do_not_leave_sequence_gaps() {
        let running = Arc::new(AtomicBool::new(true));
        let sink = Arc::new(BusySink {
            offered: Default::default(),
            accepted: Default::default(),
            limit: 4,
            running: running.clone(),
        });
        let mut input = RampInput {
            per_read: BLOCK_FRAMES,
            next: 0.0,
            released: Arc::new(AtomicBool::new(false)),
        };

        capture_loop(
            &mut input,
            &constraints(),
            SessionId::new(3).unwrap(),
            &sink,
            &running,
        )
        .unwrap();

        assert_eq!(*sink.accepted.lock().unwrap(), vec![0, 1, 2, 3]);
        assert_eq!(*sink.offered.lock().unwrap(), vec![0, 1, 1, 2, 2, 3, 3]);
    }

    #[test]
    fn full_channel_reports_a_drop() {
        let (tx, mut rx) = mpsc::channel::<AudioChunk>(1);
        let chunk = |sequence| AudioChunk {
            session: SessionId::new(3).unwrap(),
            sequence,
            sample_rate: 16000,
            channels: 1,
            wav: wav::encode(&[0; 4], 16000, 1),
        };
        assert_eq!(tx.deliver(chunk(0)), Delivery::Queued);
        assert_eq!(tx.deliver(chunk(1)), Delivery::Dropped);
        rx.close();
        assert_eq!(tx.deliver(chunk(1)), Delivery::Closed);
    }

    #[tokio::test]
    async fn stop_detaches_the_sink() {
        let released = Arc::new(AtomicBool::new(false));
        let mic = Arc::new(RampMicrophone {
            per_read: BLOCK_FRAMES,
            released: released.clone(),
        });
        let (tx, mut rx) = mpsc::channel::<AudioChunk>(256);

        let pipeline = CapturePipeline::start(mic, constraints(), SessionId::new(1).unwrap(), tx)
            .await
            .unwrap();
        rx.recv().await.unwrap();
        pipeline.stop().await;

        // the sender was dropped with the thread; what is queued is all there is
        while rx.try_recv().is_ok() {}
        assert!(rx.recv().await.is_none());
        assert!(released.load(Ordering::SeqCst));
    }

    #[tokio::test]
    async fn denied_microphone_fails_start() {
        let (tx, _rx) = mpsc::channel::<AudioChunk>(4);
        let result = CapturePipeline::start(
            Arc::new(DeniedMicrophone),
            constraints(),
            SessionId::new(1).unwrap(),
            tx,
        )
        .await;
        assert!(matches!(result, Err(ClientError::CaptureUnavailable(_))));
    }

    #[test]
    fn echo_cancellation_selects_device() {
        let mut audio = crate::config::Config::from_lookup(|_| None).unwrap().audio;
        let plain = AlsaMicrophone::new(&audio);
        assert_eq!(plain.device_for(&constraints()), "default");

        audio.echo_cancel_device = Some("echo-cancel".into());
        let aec = AlsaMicrophone::new(&audio);
        assert_eq!(aec.device_for(&constraints()), "echo-cancel");
        let mut no_aec = constraints();
        no_aec.echo_cancellation = false;
        assert_eq!(aec.device_for(&no_aec), "default");
    }
}
