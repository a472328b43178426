use anyhow::{Context, Result, bail};
use serde::{Deserialize, Serialize};

/// How captured microphone audio reaches the server.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum RecordingMode {
    /// WAV chunks over the `/ws/audio` WebSocket while the session lives.
    Stream,
    /// Buffer an utterance locally and upload it to `/humanaudio`.
    Batch,
}

impl std::str::FromStr for RecordingMode {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "stream" => Ok(RecordingMode::Stream),
            "batch" => Ok(RecordingMode::Batch),
            other => bail!("unknown recording mode '{}', expected 'stream' or 'batch'", other),
        }
    }
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct TurnServer {
    pub url: String,
    pub username: String,
    pub credential: String,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct WebRtcConfig {
    /// Whether negotiation should use the discovery/relay servers below.
    pub use_relay: bool,
    /// STUN servers, highest priority first.
    pub stun_servers: Vec<String>,
    pub turn_server: TurnServer,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct AudioConfig {
    pub sample_rate: u32,
    pub channel_count: u16,
    pub echo_cancellation: bool,
    pub noise_suppression: bool,
    /// ALSA capture device name (e.g. "default", "plughw:0,0")
    pub capture_device: String,
    /// ALSA device that delivers echo-cancelled capture, if the host has one.
    pub echo_cancel_device: Option<String>,
}

#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    pub api_base_url: String,
    pub webrtc: WebRtcConfig,
    pub audio: AudioConfig,
    pub recording_mode: RecordingMode,
}

impl Config {
    /// Defaults baked in from config.toml, overridden by `LIVETALK_*`
    /// environment variables of the running process.
    pub fn new() -> Result<Self> {
        Self::from_lookup(|key| std::env::var(key).ok())
    }

    /// Builds the configuration from an arbitrary variable lookup, falling
    /// back to the compile-time defaults for anything the lookup lacks.
    pub fn from_lookup<F>(lookup: F) -> Result<Self>
    where
        F: Fn(&str) -> Option<String>,
    {
        let get = |key: &str, default: &'static str| -> String {
            lookup(key).unwrap_or_else(|| default.to_string())
        };

        let api_base_url = get("LIVETALK_API_BASE_URL", env!("DEFAULT_API_BASE_URL"));
        url::Url::parse(&api_base_url)
            .with_context(|| format!("LIVETALK_API_BASE_URL is not a valid URL: {}", api_base_url))?;

        let stun_servers = get("LIVETALK_STUN_SERVERS", env!("DEFAULT_STUN_SERVERS"))
            .split(',')
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(str::to_string)
            .collect();

        let echo_cancel_device = get("LIVETALK_ECHO_CANCEL_DEVICE", env!("DEFAULT_ECHO_CANCEL_DEVICE"));

        Ok(Self {
            api_base_url,
            webrtc: WebRtcConfig {
                use_relay: parse_bool(
                    "LIVETALK_USE_RELAY",
                    &get("LIVETALK_USE_RELAY", env!("DEFAULT_USE_RELAY")),
                )?,
                stun_servers,
                turn_server: TurnServer {
                    url: get("LIVETALK_TURN_URL", env!("DEFAULT_TURN_URL")),
                    username: get("LIVETALK_TURN_USERNAME", env!("DEFAULT_TURN_USERNAME")),
                    credential: get("LIVETALK_TURN_CREDENTIAL", env!("DEFAULT_TURN_CREDENTIAL")),
                },
            },
            audio: AudioConfig {
                sample_rate: get("LIVETALK_AUDIO_SAMPLE_RATE", env!("DEFAULT_AUDIO_SAMPLE_RATE"))
                    .parse()
                    .context("Failed to parse LIVETALK_AUDIO_SAMPLE_RATE")?,
                channel_count: get(
                    "LIVETALK_AUDIO_CHANNEL_COUNT",
                    env!("DEFAULT_AUDIO_CHANNEL_COUNT"),
                )
                .parse()
                .context("Failed to parse LIVETALK_AUDIO_CHANNEL_COUNT")?,
                echo_cancellation: parse_bool(
                    "LIVETALK_AUDIO_ECHO_CANCELLATION",
                    &get(
                        "LIVETALK_AUDIO_ECHO_CANCELLATION",
                        env!("DEFAULT_AUDIO_ECHO_CANCELLATION"),
                    ),
                )?,
                noise_suppression: parse_bool(
                    "LIVETALK_AUDIO_NOISE_SUPPRESSION",
                    &get(
                        "LIVETALK_AUDIO_NOISE_SUPPRESSION",
                        env!("DEFAULT_AUDIO_NOISE_SUPPRESSION"),
                    ),
                )?,
                capture_device: get("LIVETALK_CAPTURE_DEVICE", env!("DEFAULT_CAPTURE_DEVICE")),
                echo_cancel_device: Some(echo_cancel_device).filter(|d| !d.trim().is_empty()),
            },
            recording_mode: get("LIVETALK_RECORDING_MODE", env!("DEFAULT_RECORDING_MODE"))
                .parse()
                .context("Failed to parse LIVETALK_RECORDING_MODE")?,
        })
        .and_then(Self::validated)
    }

    fn validated(self) -> Result<Self> {
        if self.audio.sample_rate == 0 {
            bail!("audio sample rate must be positive");
        }
        if self.audio.channel_count == 0 {
            bail!("audio channel count must be positive");
        }
        Ok(self)
    }
}

fn parse_bool(key: &str, value: &str) -> Result<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "1" | "true" | "yes" | "on" => Ok(true),
        "0" | "false" | "no" | "off" => Ok(false),
        other => bail!("{} must be a boolean, got '{}'", key, other),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::collections::HashMap;

    fn lookup(vars: &[(&str, &str)]) -> impl Fn(&str) -> Option<String> {
        let map: HashMap<String, String> = vars
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        move |key| map.get(key).cloned()
    }

    #[test]
    fn defaults_come_from_config_toml() {
        let config = Config::from_lookup(lookup(&[])).unwrap();
        assert_eq!(config.audio.sample_rate, 16000);
        assert_eq!(config.audio.channel_count, 1);
        assert!(config.audio.echo_cancellation);
        assert!(config.audio.noise_suppression);
        assert_eq!(config.webrtc.stun_servers.len(), 5);
        assert_eq!(config.webrtc.stun_servers[0], "stun:stun.l.google.com:19302");
        assert_eq!(config.recording_mode, RecordingMode::Stream);
        assert!(config.audio.echo_cancel_device.is_none());
    }

    #[test]
    fn environment_overrides_defaults() {
        let config = Config::from_lookup(lookup(&[
            ("LIVETALK_API_BASE_URL", "http://10.0.0.5:8010"),
            ("LIVETALK_AUDIO_SAMPLE_RATE", "48000"),
            ("LIVETALK_AUDIO_CHANNEL_COUNT", "2"),
            ("LIVETALK_AUDIO_NOISE_SUPPRESSION", "false"),
            ("LIVETALK_STUN_SERVERS", "stun:a.example:3478, stun:b.example:3478"),
            ("LIVETALK_ECHO_CANCEL_DEVICE", "pipewire"),
            ("LIVETALK_RECORDING_MODE", "Batch"),
        ]))
        .unwrap();

        assert_eq!(config.api_base_url, "http://10.0.0.5:8010");
        assert_eq!(config.audio.sample_rate, 48000);
        assert_eq!(config.audio.channel_count, 2);
        assert!(!config.audio.noise_suppression);
        assert_eq!(
            config.webrtc.stun_servers,
            vec!["stun:a.example:3478".to_string(), "stun:b.example:3478".to_string()]
        );
        assert_eq!(config.audio.echo_cancel_device.as_deref(), Some("pipewire"));
        assert_eq!(config.recording_mode, RecordingMode::Batch);
    }

    #[test]
    fn rejects_malformed_values() {
        assert!(Config::from_lookup(lookup(&[("LIVETALK_AUDIO_SAMPLE_RATE", "fast")])).is_err());
        assert!(Config::from_lookup(lookup(&[("LIVETALK_USE_RELAY", "maybe")])).is_err());
        assert!(Config::from_lookup(lookup(&[("LIVETALK_AUDIO_CHANNEL_COUNT", "0")])).is_err());
        assert!(Config::from_lookup(lookup(&[("LIVETALK_API_BASE_URL", "not a url")])).is_err());
        assert!(Config::from_lookup(lookup(&[("LIVETALK_RECORDING_MODE", "tape")])).is_err());
    }
}
