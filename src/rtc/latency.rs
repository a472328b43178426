//! Round-trip latency sampling on an adaptive schedule.

use std::sync::Arc;
use std::time::Duration;

use log::{debug, warn};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::task::JoinHandle;

use super::negotiator::TransportHandle;

/// Readiness poll interval while the transport is not yet connected.
pub const READINESS_INTERVAL: Duration = Duration::from_millis(300);
pub const WARMUP_INTERVAL: Duration = Duration::from_secs(2);
pub const WARMUP_SAMPLES: u32 = 10;
pub const STEADY_INTERVAL: Duration = Duration::from_secs(5);
/// Changes of this size or smaller are treated as jitter.
pub const HYSTERESIS_MS: u32 = 5;

/// Kind of stats entry an RTT figure was read from, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RttSource {
    CandidatePair,
    Transport,
    InboundStream,
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct RttEntry {
    pub source: RttSource,
    /// Seconds.
    pub rtt: f64,
}

impl RttEntry {
    pub fn new(source: RttSource, rtt: f64) -> Self {
        Self { source, rtt }
    }
}

/// Minimum positive RTT of the highest-priority source that has one.
pub fn select_rtt(entries: &[RttEntry]) -> Option<f64> {
    [RttSource::CandidatePair, RttSource::Transport, RttSource::InboundStream]
        .into_iter()
        .find_map(|source| {
            entries
                .iter()
                .filter(|e| e.source == source && e.rtt.is_finite() && e.rtt > 0.0)
                .map(|e| e.rtt)
                .reduce(f64::min)
        })
}

pub fn to_millis(seconds: f64) -> u32 {
    (seconds * 1000.0).round().clamp(0.0, u32::MAX as f64) as u32
}

/// Holds the published latency value.
#[derive(Debug, Default)]
pub struct LatencyTracker {
    value: Option<u32>,
}

impl LatencyTracker {
    pub fn value(&self) -> Option<u32> {
        self.value
    }

    pub fn reset(&mut self) {
        self.value = None;
    }

    /// Offers a new reading. Returns whether the published value changed.
    /// Readings taken while the transport is not connected are dropped.
    pub fn offer(&mut self, rtt_ms: u32, connected: bool) -> bool {
        if !connected {
            return false;
        }
        match self.value {
            Some(current) if current.abs_diff(rtt_ms) <= HYSTERESIS_MS => false,
            _ => {
                self.value = Some(rtt_ms);
                true
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Phase {
    AwaitingConnection,
    Warmup { taken: u32 },
    Steady,
}

/// 300 ms readiness polls, then 2 s samples for the first ten, then 5 s.
#[derive(Debug, Clone)]
pub struct SampleSchedule {
    phase: Phase,
}

impl Default for SampleSchedule {
    fn default() -> Self {
        Self::new()
    }
}

impl SampleSchedule {
    pub fn new() -> Self {
        Self {
            phase: Phase::AwaitingConnection,
        }
    }

    pub fn next_delay(&self) -> Duration {
        match self.phase {
            Phase::AwaitingConnection => READINESS_INTERVAL,
            Phase::Warmup { .. } => WARMUP_INTERVAL,
            Phase::Steady => STEADY_INTERVAL,
        }
    }

    /// Record that a sample was taken.
    pub fn sampled(&mut self) {
        self.phase = match self.phase {
            Phase::AwaitingConnection => Phase::Warmup { taken: 1 },
            Phase::Warmup { taken } if taken + 1 >= WARMUP_SAMPLES => Phase::Steady,
            Phase::Warmup { taken } => Phase::Warmup { taken: taken + 1 },
            Phase::Steady => Phase::Steady,
        };
    }
}

/// One RTT measurement, tagged with the connection attempt it belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct LatencyReading {
    pub attempt: u64,
    pub rtt_ms: u32,
}

/// Cancels the sampling task when told to or when dropped.
#[derive(Debug)]
pub struct SamplerHandle {
    cancel: Option<oneshot::Sender<()>>,
    task: JoinHandle<()>,
}

impl SamplerHandle {
    pub fn cancel(mut self) {
        self.stop();
    }

    fn stop(&mut self) {
        if let Some(cancel) = self.cancel.take() {
            let _ = cancel.send(());
        }
        // also interrupts a stats read that is still in flight
        self.task.abort();
    }
}

impl Drop for SamplerHandle {
    fn drop(&mut self) {
        self.stop();
    }
}

/// Spawns the sampling loop. `ready` mirrors the coordinator's latency gate.
pub fn spawn_sampler<T>(
    attempt: u64,
    transport: Arc<dyn TransportHandle>,
    ready: watch::Receiver<bool>,
    readings: mpsc::Sender<T>,
) -> SamplerHandle
where
    T: From<LatencyReading> + Send + 'static,
{
    let (cancel_tx, mut cancel_rx) = oneshot::channel::<()>();
    let task = tokio::spawn(async move {
        let mut schedule = SampleSchedule::new();
        loop {
            tokio::select! {
                _ = &mut cancel_rx => break,
                _ = tokio::time::sleep(schedule.next_delay()) => {}
            }

            if !*ready.borrow() {
                continue;
            }

            match transport.rtt_entries().await {
                Ok(entries) => match select_rtt(&entries) {
                    Some(seconds) => {
                        let reading = LatencyReading {
                            attempt,
                            rtt_ms: to_millis(seconds),
                        };
                        debug!("RTT sample: {} ms", reading.rtt_ms);
                        if readings.send(reading.into()).await.is_err() {
                            break;
                        }
                    }
                    None => debug!("Stats report carries no round-trip time yet"),
                },
                Err(e) => warn!("Failed to read transport stats: {:#}", e),
            }
            schedule.sampled();
        }
        debug!("Latency sampler for attempt {} stopped", attempt);
    });

    SamplerHandle {
        cancel: Some(cancel_tx),
        task,
    }
}
