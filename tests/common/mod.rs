//! Fakes shared by the integration tests.
#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use futures_util::{SinkExt, StreamExt};
use livetalk_client::audio::{AudioInput, BLOCK_FRAMES, CaptureConstraints, Microphone};
use livetalk_client::rtc::{Negotiated, Negotiator, RttEntry, TransportEvents, TransportHandle};
use livetalk_client::{ClientError, Config, NegotiationError, SessionId};
use tokio::net::TcpListener;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::tungstenite::handshake::server::{ErrorResponse, Request, Response};

pub const WAIT: Duration = Duration::from_secs(5);

pub fn config(base_url: &str, mode: &str) -> Config {
    let vars: HashMap<&str, String> = [
        ("LIVETALK_API_BASE_URL", base_url.to_string()),
        ("LIVETALK_RECORDING_MODE", mode.to_string()),
        ("LIVETALK_AUDIO_NOISE_SUPPRESSION", "false".to_string()),
    ]
    .into_iter()
    .collect();
    Config::from_lookup(|key| vars.get(key).cloned()).unwrap()
}

#[derive(Default)]
pub struct FakeTransport {
    pub rtt: Mutex<Vec<RttEntry>>,
    pub closed: AtomicBool,
}

#[async_trait]
impl TransportHandle for FakeTransport {
    async fn rtt_entries(&self) -> anyhow::Result<Vec<RttEntry>> {
        Ok(self.rtt.lock().unwrap().clone())
    }

    async fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Answers every offer with `session` and hands the callback sink to the
/// test, which plays the part of the peer connection.
pub struct FakeNegotiator {
    pub session: u64,
    pub transport: Arc<FakeTransport>,
    pub delay: Duration,
    events: mpsc::UnboundedSender<TransportEvents>,
}

impl FakeNegotiator {
    pub fn new(session: u64, transport: Arc<FakeTransport>) -> (Self, mpsc::UnboundedReceiver<TransportEvents>) {
        let (events, rx) = mpsc::unbounded_channel();
        (
            Self {
                session,
                transport,
                delay: Duration::ZERO,
                events,
            },
            rx,
        )
    }
}

#[async_trait]
impl Negotiator for FakeNegotiator {
    async fn negotiate(&self, _use_relay: bool, events: TransportEvents) -> Result<Negotiated, NegotiationError> {
        tokio::time::sleep(self.delay).await;
        let _ = self.events.send(events);
        Ok(Negotiated {
            session: SessionId::new(self.session).unwrap(),
            transport: self.transport.clone(),
        })
    }
}

/// Delivers one block of a quiet sine every `period`.
pub struct ToneMicrophone {
    pub period: Duration,
    pub opened: Arc<AtomicUsize>,
    pub released: Arc<AtomicBool>,
}

impl ToneMicrophone {
    pub fn new(period: Duration) -> Self {
        Self {
            period,
            opened: Arc::new(AtomicUsize::new(0)),
            released: Arc::new(AtomicBool::new(false)),
        }
    }
}

struct ToneInput {
    period: Duration,
    phase: f32,
    released: Arc<AtomicBool>,
}

impl AudioInput for ToneInput {
    fn read(&mut self, out: &mut Vec<f32>) -> anyhow::Result<usize> {
        std::thread::sleep(self.period);
        for _ in 0..BLOCK_FRAMES {
            out.push(0.25 * self.phase.sin());
            self.phase += 0.05;
        }
        Ok(BLOCK_FRAMES)
    }

    fn stop(&mut self) -> anyhow::Result<()> {
        self.released.store(true, Ordering::SeqCst);
        Ok(())
    }
}

impl Microphone for ToneMicrophone {
    fn open(&self, _: &CaptureConstraints) -> Result<Box<dyn AudioInput>, ClientError> {
        self.opened.fetch_add(1, Ordering::SeqCst);
        self.released.store(false, Ordering::SeqCst);
        Ok(Box::new(ToneInput {
            period: self.period,
            phase: 0.0,
            released: self.released.clone(),
        }))
    }
}

pub struct DeniedMicrophone;

impl Microphone for DeniedMicrophone {
    fn open(&self, _: &CaptureConstraints) -> Result<Box<dyn AudioInput>, ClientError> {
        Err(ClientError::CaptureUnavailable("Permission denied".into()))
    }
}

/// What the fake audio socket saw.
#[derive(Debug)]
pub enum SocketEvent {
    Opened(String),
    Frame(Vec<u8>),
    Closed,
}

/// How the fake audio socket answers one binary frame.
pub enum Reply {
    Silent,
    Text(&'static str),
    Close,
}

/// A WebSocket server that answers the n-th binary frame with `reply(n)`.
/// Returns the `http://` base URL that maps onto it.
pub async fn audio_socket<F>(reply: F) -> (String, mpsc::UnboundedReceiver<SocketEvent>)
where
    F: Fn(usize) -> Reply + Send + Sync + 'static,
{
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = mpsc::unbounded_channel();
    let reply = Arc::new(reply);

    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            let tx = tx.clone();
            let reply = reply.clone();
            tokio::spawn(async move {
                let uri_tx = tx.clone();
                let callback = move |req: &Request, resp: Response| -> Result<Response, ErrorResponse> {
                    let _ = uri_tx.send(SocketEvent::Opened(req.uri().to_string()));
                    Ok(resp)
                };
                let Ok(mut ws) = tokio_tungstenite::accept_hdr_async(stream, callback).await else {
                    return;
                };
                let mut frames = 0;
                while let Some(Ok(msg)) = ws.next().await {
                    match msg {
                        Message::Binary(data) => {
                            let _ = tx.send(SocketEvent::Frame(data.to_vec()));
                            let answer = reply(frames);
                            frames += 1;
                            match answer {
                                Reply::Silent => {}
                                Reply::Text(text) => {
                                    let _ = ws.send(Message::text(text)).await;
                                }
                                Reply::Close => {
                                    let _ = ws.close(None).await;
                                    break;
                                }
                            }
                        }
                        Message::Close(_) => break,
                        _ => {}
                    }
                }
                let _ = tx.send(SocketEvent::Closed);
            });
        }
    });

    (format!("http://{}", addr), rx)
}

/// A WebSocket server that completes the handshake and then never reads,
/// so the client's writes eventually block on a full socket.
pub async fn stalled_socket() -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        while let Ok((stream, _)) = listener.accept().await {
            tokio::spawn(async move {
                let Ok(_ws) = tokio_tungstenite::accept_async(stream).await else {
                    return;
                };
                std::future::pending::<()>().await;
            });
        }
    });
    format!("http://{}", addr)
}

/// Serves `app` on an ephemeral port and returns its base URL.
pub async fn serve(app: axum::Router) -> String {
    let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        axum::serve(listener, app).await.unwrap();
    });
    format!("http://{}", addr)
}

/// Polls `condition` until it holds or [`WAIT`] passes.
pub async fn eventually<F: Fn() -> bool>(condition: F) -> bool {
    let deadline = tokio::time::Instant::now() + WAIT;
    while tokio::time::Instant::now() < deadline {
        if condition() {
            return true;
        }
        tokio::time::sleep(Duration::from_millis(10)).await;
    }
    condition()
}
