//! ALSA PCM capture device.

use alsa::pcm::{Access, Format, HwParams, PCM};
use alsa::{Direction, ValueOr};
use anyhow::{Context, Result};

/// Parameters negotiated with the ALSA hardware.
#[derive(Debug, Clone)]
pub struct AlsaParams {
    /// Actual sample rate after negotiation
    pub sample_rate: u32,
    pub channels: u32,
    /// Period size in frames (one frame = channels × sample width)
    pub period_size: usize,
}

pub struct CaptureDevice {
    name: String,
    pcm: PCM,
    params: AlsaParams,
}

impl CaptureDevice {
    /// Opens `device` for interleaved S16LE capture.
    pub fn open(device: &str, sample_rate: u32, channels: u32) -> Result<Self> {
        let pcm = PCM::new(device, Direction::Capture, false)
            .with_context(|| format!("Failed to open PCM device '{}' for capture", device))?;

        {
            let hwp = HwParams::any(&pcm).context("Failed to initialize HwParams")?;
            hwp.set_access(Access::RWInterleaved)?;
            hwp.set_format(Format::S16LE)?;
            hwp.set_channels(channels)
                .with_context(|| format!("Device '{}' cannot capture {} channel(s)", device, channels))?;
            hwp.set_rate_near(sample_rate, ValueOr::Nearest)?;
            pcm.hw_params(&hwp)?;
        }

        let params = {
            let hwp = pcm.hw_params_current()?;
            AlsaParams {
                sample_rate: hwp.get_rate()?,
                channels: hwp.get_channels()?,
                period_size: hwp.get_period_size()? as usize,
            }
        };

        log::info!(
            "ALSA capture: device={}, rate={}, channels={}, period_size={}",
            device,
            params.sample_rate,
            params.channels,
            params.period_size,
        );

        Ok(Self {
            name: device.to_string(),
            pcm,
            params,
        })
    }

    pub fn params(&self) -> &AlsaParams {
        &self.params
    }

    /// Reads up to one buffer of interleaved frames. Returns frames read.
    pub fn read(&self, buf: &mut [i16]) -> alsa::Result<usize> {
        self.pcm.io_i16()?.readi(buf)
    }

    /// Re-prepares the stream after an overrun or similar read error.
    pub fn recover(&self, err: alsa::Error) -> Result<()> {
        log::warn!("ALSA capture error on '{}': {}, recovering...", self.name, err);
        self.pcm
            .prepare()
            .with_context(|| format!("Failed to recover PCM capture on '{}'", self.name))
    }

    /// Stops the hardware immediately, discarding pending frames.
    pub fn halt(&self) -> Result<()> {
        self.pcm
            .drop()
            .with_context(|| format!("Failed to stop PCM capture on '{}'", self.name))
    }
}
