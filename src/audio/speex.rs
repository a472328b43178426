//! SpeexDSP bindings: per-channel denoise/AGC and sample-rate conversion
//! for interleaved capture periods.

use std::ffi::{c_int, c_void};

/// Opaque type for SpeexPreprocessState
#[repr(C)]
pub struct SpeexPreprocessState {
    _private: [u8; 0],
}

/// Opaque type for SpeexResamplerState
#[repr(C)]
pub struct SpeexResamplerState {
    _private: [u8; 0],
}

// Preprocessor request constants
const SPEEX_PREPROCESS_SET_DENOISE: c_int = 0;
const SPEEX_PREPROCESS_SET_AGC: c_int = 2;
const SPEEX_PREPROCESS_SET_AGC_LEVEL: c_int = 6;
const SPEEX_PREPROCESS_SET_NOISE_SUPPRESS: c_int = 8;

// Resampler constants
const SPEEX_RESAMPLER_QUALITY_DEFAULT: c_int = 4;
const RESAMPLER_ERR_SUCCESS: c_int = 0;

unsafe extern "C" {
    fn speex_preprocess_state_init(frame_size: c_int, sampling_rate: c_int)
        -> *mut SpeexPreprocessState;
    fn speex_preprocess_state_destroy(st: *mut SpeexPreprocessState);
    fn speex_preprocess_run(st: *mut SpeexPreprocessState, x: *mut i16) -> c_int;
    fn speex_preprocess_ctl(
        st: *mut SpeexPreprocessState,
        request: c_int,
        ptr: *mut c_void,
    ) -> c_int;

    fn speex_resampler_init(
        nb_channels: u32,
        in_rate: u32,
        out_rate: u32,
        quality: c_int,
        err: *mut c_int,
    ) -> *mut SpeexResamplerState;
    fn speex_resampler_destroy(st: *mut SpeexResamplerState);
    fn speex_resampler_process_int(
        st: *mut SpeexResamplerState,
        channel_index: u32,
        in_: *const i16,
        in_len: *mut u32,
        out: *mut i16,
        out_len: *mut u32,
    ) -> c_int;
}

/// Noise suppression and AGC for one mono channel.
struct Preprocessor {
    state: *mut SpeexPreprocessState,
    frame_size: usize,
}

// SpeexPreprocessState is used from a single thread only
unsafe impl Send for Preprocessor {}

impl Preprocessor {
    /// Create a new preprocessor for a given frame size (in samples) and sample rate.
    pub fn new(frame_size: usize, sample_rate: u32) -> anyhow::Result<Self> {
        let state = unsafe {
            speex_preprocess_state_init(frame_size as c_int, sample_rate as c_int)
        };
        if state.is_null() {
            anyhow::bail!("Failed to initialize speex preprocessor");
        }
        Ok(Self { state, frame_size })
    }

    /// Enable or disable denoising.
    pub fn set_denoise(&mut self, enable: bool) {
        let mut val: c_int = if enable { 1 } else { 0 };
        unsafe {
            speex_preprocess_ctl(
                self.state,
                SPEEX_PREPROCESS_SET_DENOISE,
                &mut val as *mut c_int as *mut c_void,
            );
        }
    }

    /// Set noise suppress level in dB (negative value, e.g. -25).
    pub fn set_noise_suppress(&mut self, level: i32) {
        let mut val: c_int = level;
        unsafe {
            speex_preprocess_ctl(
                self.state,
                SPEEX_PREPROCESS_SET_NOISE_SUPPRESS,
                &mut val as *mut c_int as *mut c_void,
            );
        }
    }

    /// Enable or disable automatic gain control.
    pub fn set_agc(&mut self, enable: bool) {
        let mut val: c_int = if enable { 1 } else { 0 };
        unsafe {
            speex_preprocess_ctl(
                self.state,
                SPEEX_PREPROCESS_SET_AGC,
                &mut val as *mut c_int as *mut c_void,
            );
        }
    }

    /// Set AGC level (target signal level).
    pub fn set_agc_level(&mut self, level: f32) {
        let mut val: f32 = level;
        unsafe {
            speex_preprocess_ctl(
                self.state,
                SPEEX_PREPROCESS_SET_AGC_LEVEL,
                &mut val as *mut f32 as *mut c_void,
            );
        }
    }

    /// Run the preprocessor on exactly one frame of mono samples, in place.
    pub fn process(&mut self, samples: &mut [i16]) {
        if samples.len() != self.frame_size {
            return;
        }
        unsafe {
            speex_preprocess_run(self.state, samples.as_mut_ptr());
        }
    }
}

impl Drop for Preprocessor {
    fn drop(&mut self) {
        unsafe {
            speex_preprocess_state_destroy(self.state);
        }
    }
}

struct Resampler {
    state: *mut SpeexResamplerState,
}

unsafe impl Send for Resampler {}

impl Resampler {
    /// Create a new resampler.
    ///
    /// * `channels` - Number of channels
    /// * `in_rate`  - Input sample rate
    /// * `out_rate` - Output sample rate
    pub fn new(channels: u32, in_rate: u32, out_rate: u32) -> anyhow::Result<Self> {
        let mut err: c_int = 0;
        let state = unsafe {
            speex_resampler_init(
                channels,
                in_rate,
                out_rate,
                SPEEX_RESAMPLER_QUALITY_DEFAULT,
                &mut err,
            )
        };
        if err != RESAMPLER_ERR_SUCCESS || state.is_null() {
            anyhow::bail!("Failed to initialize speex resampler: err={}", err);
        }
        Ok(Self { state })
    }

    /// Resample a single channel of 16-bit PCM data.
    ///
    /// Returns `(input_samples_consumed, output_samples_produced)`.
    pub fn process_int(
        &mut self,
        channel: u32,
        input: &[i16],
        output: &mut [i16],
    ) -> anyhow::Result<(u32, u32)> {
        let mut in_len = input.len() as u32;
        let mut out_len = output.len() as u32;
        let err = unsafe {
            speex_resampler_process_int(
                self.state,
                channel,
                input.as_ptr(),
                &mut in_len,
                output.as_mut_ptr(),
                &mut out_len,
            )
        };
        if err != RESAMPLER_ERR_SUCCESS {
            anyhow::bail!("Speex resampler error: {}", err);
        }
        Ok((in_len, out_len))
    }
}

impl Drop for Resampler {
    fn drop(&mut self) {
        unsafe {
            speex_resampler_destroy(self.state);
        }
    }
}

/// One preprocessor per channel, applied to interleaved periods.
pub struct Denoiser {
    channels: usize,
    preprocessors: Vec<Preprocessor>,
    scratch: Vec<i16>,
}

impl Denoiser {
    pub fn new(channels: usize, period_frames: usize, sample_rate: u32) -> anyhow::Result<Self> {
        let mut preprocessors = Vec::with_capacity(channels);
        for _ in 0..channels {
            let mut pp = Preprocessor::new(period_frames, sample_rate)?;
            pp.set_denoise(true);
            pp.set_noise_suppress(-25);
            pp.set_agc(true);
            pp.set_agc_level(24000.0);
            preprocessors.push(pp);
        }
        Ok(Self {
            channels,
            preprocessors,
            scratch: vec![0; period_frames],
        })
    }

    /// Processes up to one period of interleaved frames in place. Short
    /// reads are zero-padded to the period size the preprocessor expects.
    pub fn process(&mut self, interleaved: &mut [i16]) {
        let frames = (interleaved.len() / self.channels).min(self.scratch.len());
        for (ch, pp) in self.preprocessors.iter_mut().enumerate() {
            self.scratch.fill(0);
            for i in 0..frames {
                self.scratch[i] = interleaved[i * self.channels + ch];
            }
            pp.process(&mut self.scratch);
            for i in 0..frames {
                interleaved[i * self.channels + ch] = self.scratch[i];
            }
        }
    }
}

/// Converts interleaved periods from the hardware rate to the requested one.
pub struct RateConverter {
    resampler: Resampler,
    channels: usize,
    in_rate: u32,
    out_rate: u32,
    input: Vec<i16>,
    output: Vec<Vec<i16>>,
    interleaved: Vec<i16>,
}

impl RateConverter {
    pub fn new(channels: usize, in_rate: u32, out_rate: u32) -> anyhow::Result<Self> {
        Ok(Self {
            resampler: Resampler::new(channels as u32, in_rate, out_rate)?,
            channels,
            in_rate,
            out_rate,
            input: Vec::new(),
            output: vec![Vec::new(); channels],
            interleaved: Vec::new(),
        })
    }

    pub fn process(&mut self, interleaved: &[i16]) -> anyhow::Result<&[i16]> {
        let frames = interleaved.len() / self.channels;
        let capacity = (frames as u64 * self.out_rate as u64 / self.in_rate as u64) as usize + 16;

        let mut produced = usize::MAX;
        for ch in 0..self.channels {
            self.input.clear();
            self.input
                .extend((0..frames).map(|i| interleaved[i * self.channels + ch]));
            let out = &mut self.output[ch];
            out.resize(capacity, 0);
            let (_, written) = self.resampler.process_int(ch as u32, &self.input, out)?;
            produced = produced.min(written as usize);
        }
        if self.channels == 0 {
            produced = 0;
        }

        self.interleaved.clear();
        for i in 0..produced {
            for ch in 0..self.channels {
                self.interleaved.push(self.output[ch][i]);
            }
        }
        Ok(&self.interleaved)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn converter_scales_frame_count() {
        let mut converter = RateConverter::new(2, 48000, 16000).unwrap();
        let input = vec![1000i16; 960 * 2];
        let mut total = 0;
        for _ in 0..10 {
            total += converter.process(&input).unwrap().len();
        }
        // 10 x 960 frames at 48 kHz is 3200 frames at 16 kHz, less filter delay
        let frames = total / 2;
        assert!(frames > 3000 && frames <= 3200, "{}", frames);
    }

    #[test]
    fn denoiser_accepts_short_periods() {
        let mut denoiser = Denoiser::new(1, 160, 16000).unwrap();
        let mut full = vec![0i16; 160];
        denoiser.process(&mut full);
        let mut short = vec![0i16; 100];
        denoiser.process(&mut short);
        assert_eq!(short.len(), 100);
    }
}
