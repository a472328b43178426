use serde::Deserialize;
use std::fs;
use std::path::Path;

#[derive(Deserialize)]
struct Config {
    api: Api,
    webrtc: WebRtc,
    audio: Audio,
    recording: Recording,
}

#[derive(Deserialize)]
struct Api {
    base_url: String,
}

#[derive(Deserialize)]
struct WebRtc {
    use_relay: bool,
    stun_servers: Vec<String>,
    turn_url: String,
    turn_username: String,
    turn_credential: String,
}

#[derive(Deserialize)]
struct Audio {
    sample_rate: u32,
    channel_count: u16,
    echo_cancellation: bool,
    noise_suppression: bool,
    capture_device: String,
    echo_cancel_device: String,
}

#[derive(Deserialize)]
struct Recording {
    mode: String,
}

// config.toml is read at build time; its values become the defaults for runtime env vars
fn main() {
    println!("cargo:rerun-if-changed=config.toml");

    let config_path = Path::new("config.toml");
    if !config_path.exists() {
        panic!("config.toml not found!");
    }

    let config_str = fs::read_to_string(config_path).expect("Failed to read config.toml");
    let config: Config = toml::from_str(&config_str).expect("Failed to parse config.toml");

    println!("cargo:rustc-env=DEFAULT_API_BASE_URL={}", config.api.base_url);

    println!("cargo:rustc-env=DEFAULT_USE_RELAY={}", config.webrtc.use_relay);
    println!(
        "cargo:rustc-env=DEFAULT_STUN_SERVERS={}",
        config.webrtc.stun_servers.join(",")
    );
    println!("cargo:rustc-env=DEFAULT_TURN_URL={}", config.webrtc.turn_url);
    println!("cargo:rustc-env=DEFAULT_TURN_USERNAME={}", config.webrtc.turn_username);
    println!("cargo:rustc-env=DEFAULT_TURN_CREDENTIAL={}", config.webrtc.turn_credential);

    println!("cargo:rustc-env=DEFAULT_AUDIO_SAMPLE_RATE={}", config.audio.sample_rate);
    println!("cargo:rustc-env=DEFAULT_AUDIO_CHANNEL_COUNT={}", config.audio.channel_count);
    println!(
        "cargo:rustc-env=DEFAULT_AUDIO_ECHO_CANCELLATION={}",
        config.audio.echo_cancellation
    );
    println!(
        "cargo:rustc-env=DEFAULT_AUDIO_NOISE_SUPPRESSION={}",
        config.audio.noise_suppression
    );
    println!("cargo:rustc-env=DEFAULT_CAPTURE_DEVICE={}", config.audio.capture_device);
    println!(
        "cargo:rustc-env=DEFAULT_ECHO_CANCEL_DEVICE={}",
        config.audio.echo_cancel_device
    );

    println!("cargo:rustc-env=DEFAULT_RECORDING_MODE={}", config.recording.mode);

    link_speexdsp();
}

fn link_speexdsp() {
    let target = std::env::var("TARGET").unwrap_or_default();

    if target.contains("musl") {
        // musl: link the hand-built static library, no pkg-config
        if let Ok(sysroot) = std::env::var("MUSL_SYSROOT") {
            println!("cargo:rustc-link-search=native={}/usr/lib", sysroot);
        }
        println!("cargo:rustc-link-lib=static=speexdsp");
        return;
    }

    // ALSA is linked by alsa-sys; speexdsp is found through pkg-config.
    pkg_config::Config::new()
        .probe("speexdsp")
        .expect("Failed to find speexdsp. Please install libspeexdsp-dev.");
}
