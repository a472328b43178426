//! Canonical 44-byte PCM WAV container.

use anyhow::{Result, bail};
use bytes::{Buf, BufMut, Bytes, BytesMut};

pub const HEADER_LEN: usize = 44;
pub const BITS_PER_SAMPLE: u16 = 16;
const FORMAT_PCM: u16 = 1;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct WavHeader {
    pub sample_rate: u32,
    pub channels: u16,
    pub bits_per_sample: u16,
    /// Length of the `data` sub-chunk in bytes.
    pub data_len: u32,
}

pub fn header(data_len: u32, sample_rate: u32, channels: u16) -> [u8; HEADER_LEN] {
    let block_align = channels * (BITS_PER_SAMPLE / 8);
    let byte_rate = sample_rate * block_align as u32;

    let mut out = [0u8; HEADER_LEN];
    let mut buf = &mut out[..];
    buf.put_slice(b"RIFF");
    buf.put_u32_le(36 + data_len);
    buf.put_slice(b"WAVE");
    buf.put_slice(b"fmt ");
    buf.put_u32_le(16);
    buf.put_u16_le(FORMAT_PCM);
    buf.put_u16_le(channels);
    buf.put_u32_le(sample_rate);
    buf.put_u32_le(byte_rate);
    buf.put_u16_le(block_align);
    buf.put_u16_le(BITS_PER_SAMPLE);
    buf.put_slice(b"data");
    buf.put_u32_le(data_len);
    out
}

/// Wraps interleaved samples in a WAV container.
pub fn encode(samples: &[i16], sample_rate: u32, channels: u16) -> Bytes {
    let data_len = (samples.len() * 2) as u32;
    let mut out = BytesMut::with_capacity(HEADER_LEN + samples.len() * 2);
    out.put_slice(&header(data_len, sample_rate, channels));
    for s in samples {
        out.put_i16_le(*s);
    }
    out.freeze()
}

/// Wraps already little-endian encoded PCM bytes.
pub fn encode_pcm_bytes(pcm: &[u8], sample_rate: u32, channels: u16) -> Bytes {
    let mut out = BytesMut::with_capacity(HEADER_LEN + pcm.len());
    out.put_slice(&header(pcm.len() as u32, sample_rate, channels));
    out.put_slice(pcm);
    out.freeze()
}

pub fn parse_header(mut data: &[u8]) -> Result<WavHeader> {
    if data.len() < HEADER_LEN {
        bail!("WAV data too short: {} bytes", data.len());
    }
    let mut tag = [0u8; 4];

    data.copy_to_slice(&mut tag);
    if &tag != b"RIFF" {
        bail!("missing RIFF tag");
    }
    let _riff_len = data.get_u32_le();
    data.copy_to_slice(&mut tag);
    if &tag != b"WAVE" {
        bail!("missing WAVE tag");
    }
    data.copy_to_slice(&mut tag);
    if &tag != b"fmt " {
        bail!("missing fmt sub-chunk");
    }
    let fmt_len = data.get_u32_le();
    if fmt_len != 16 {
        bail!("unexpected fmt sub-chunk length {}", fmt_len);
    }
    let format = data.get_u16_le();
    if format != FORMAT_PCM {
        bail!("unsupported WAV format tag {}", format);
    }
    let channels = data.get_u16_le();
    let sample_rate = data.get_u32_le();
    let _byte_rate = data.get_u32_le();
    let _block_align = data.get_u16_le();
    let bits_per_sample = data.get_u16_le();
    data.copy_to_slice(&mut tag);
    if &tag != b"data" {
        bail!("missing data sub-chunk");
    }
    let data_len = data.get_u32_le();

    Ok(WavHeader {
        sample_rate,
        channels,
        bits_per_sample,
        data_len,
    })
}
