//! audio - Microphone capture and WAV framing
//!
//! Uses ALSA for capture and SpeexDSP for noise suppression, AGC and
//! resampling. Capture runs on a dedicated OS thread.

mod alsa_device;
pub mod capture;
mod speex;
pub mod wav;

pub use capture::{
    AlsaMicrophone, AudioChunk, AudioInput, BlockFramer, CaptureConstraints, CapturePipeline,
    ChunkSink, Delivery, Microphone, BLOCK_FRAMES,
};
