use std::sync::Arc;

use livetalk_client::api::ServerApi;
use livetalk_client::audio::AlsaMicrophone;
use livetalk_client::protocol::HumanKind;
use livetalk_client::rtc::RtcNegotiator;
use livetalk_client::{Config, Controller, ControllerHandle, RecordingMode};
use log::{error, info, warn};
use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::signal;

const HELP: &str = "commands: /start [relay], /stop, /send, /interrupt, /speaking, /status, /quit; \
other text is sent to the avatar";

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();

    let config = Config::new()?;
    info!(
        "Server {} ({:?} recording, relay: {})",
        config.api_base_url, config.recording_mode, config.webrtc.use_relay
    );

    let api = ServerApi::new(&config.api_base_url)?;
    let negotiator = Arc::new(RtcNegotiator::new(api.clone(), config.webrtc.clone()));
    let microphone = Arc::new(AlsaMicrophone::new(&config.audio));

    let (controller, handle) = Controller::new(&config, negotiator, microphone, api);
    let controller_task = tokio::spawn(controller.run());

    start_session(&handle, config.webrtc.use_relay).await;

    let mut snapshots = handle.watch();
    let mut lines = BufReader::new(tokio::io::stdin()).lines();
    println!("{}", HELP);

    loop {
        tokio::select! {
            _ = signal::ctrl_c() => {
                info!("Interrupted");
                break;
            }
            line = lines.next_line() => match line {
                Ok(Some(line)) => {
                    if !handle_line(&handle, &config, line.trim()).await {
                        break;
                    }
                }
                Ok(None) => {
                    info!("Stdin closed");
                    break;
                }
                Err(e) => {
                    error!("Failed to read stdin: {}", e);
                    break;
                }
            },
            changed = snapshots.changed() => {
                if changed.is_err() {
                    break;
                }
                let snapshot = snapshots.borrow_and_update().clone();
                info!(
                    "status={:?} session={:?} latency={:?}ms recording={} audio={} video={}",
                    snapshot.status,
                    snapshot.session.map(|s| s.get()),
                    snapshot.latency_ms,
                    snapshot.recording,
                    snapshot.audio_attached,
                    snapshot.video_attached,
                );
                if let Some(advisory) = &snapshot.advisory {
                    warn!("{}", advisory);
                }
            }
        }
    }

    if let Err(e) = handle.shutdown().await {
        warn!("Shutdown: {}", e);
    }
    let _ = controller_task.await;
    Ok(())
}

async fn start_session(handle: &ControllerHandle, use_relay: bool) {
    match handle.start(use_relay).await {
        Ok(session) => info!("Connected, session {}", session),
        Err(e) => error!("Failed to start session: {}", e),
    }
}

/// Returns `false` when the client should exit.
async fn handle_line(handle: &ControllerHandle, config: &Config, line: &str) -> bool {
    let result = match line {
        "" => Ok(()),
        "/quit" | "/exit" => return false,
        "/start" => {
            start_session(handle, config.webrtc.use_relay).await;
            Ok(())
        }
        "/start relay" => {
            start_session(handle, true).await;
            Ok(())
        }
        "/stop" => handle.stop().await,
        "/send" if config.recording_mode == RecordingMode::Batch => handle.submit_utterance().await,
        "/send" => {
            println!("audio is streamed continuously in stream mode");
            Ok(())
        }
        "/interrupt" => handle.interrupt().await,
        "/speaking" => handle.is_speaking().await.map(|speaking| println!("speaking: {}", speaking)),
        "/status" => {
            println!("{:?}", handle.snapshot());
            Ok(())
        }
        cmd if cmd.starts_with('/') => {
            println!("{}", HELP);
            Ok(())
        }
        text => handle.say(text, HumanKind::Chat, true).await,
    };
    if let Err(e) = result {
        error!("{}", e);
    }
    true
}
