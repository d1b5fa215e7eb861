//! PCM16 conversion between float samples and the base64 payloads carried by
//! the session transport.
//!
//! Capture direction: `f32` → clamped `i16` → little-endian bytes → base64.
//! Playback direction: base64 → little-endian `i16` → `f32`, de-interleaved
//! into one sample vector per channel.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use thiserror::Error;

const PCM_MIME_PREFIX: &str = "audio/pcm;rate=";

#[derive(Error, Debug, Clone, PartialEq)]
pub enum CodecError {
    #[error("{len} bytes is not a whole number of {channels}-channel PCM16 frames")]
    MisalignedChunk { len: usize, channels: u16 },

    #[error("Channel count must be at least 1")]
    NoChannels,

    #[error("Base64 decode error: {0}")]
    Base64(String),
}

/// One unit of encoded audio, ready to hand to the transport.
#[derive(Debug, Clone, PartialEq)]
pub struct EncodedChunk {
    /// Base64 of little-endian PCM16 samples
    pub data: String,
    pub sample_rate_hz: u32,
    /// e.g. `audio/pcm;rate=48000`
    pub mime_type: String,
}

impl EncodedChunk {
    pub fn pcm16(data: String, sample_rate_hz: u32) -> Self {
        Self {
            data,
            sample_rate_hz,
            mime_type: pcm_mime_type(sample_rate_hz),
        }
    }
}

/// Decoded audio, one sample vector per channel.
#[derive(Debug, Clone, PartialEq)]
pub struct PlaybackBuffer {
    channels: Vec<Vec<f32>>,
    sample_rate_hz: u32,
}

impl PlaybackBuffer {
    pub fn new(channels: Vec<Vec<f32>>, sample_rate_hz: u32) -> Self {
        Self {
            channels,
            sample_rate_hz,
        }
    }

    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    pub fn channel_count(&self) -> usize {
        self.channels.len()
    }

    pub fn frame_count(&self) -> usize {
        self.channels.first().map_or(0, Vec::len)
    }

    pub fn channel(&self, index: usize) -> Option<&[f32]> {
        self.channels.get(index).map(Vec::as_slice)
    }

    pub fn duration_seconds(&self) -> f64 {
        if self.sample_rate_hz == 0 {
            return 0.0;
        }
        self.frame_count() as f64 / self.sample_rate_hz as f64
    }
}

pub fn pcm_mime_type(sample_rate_hz: u32) -> String {
    format!("{}{}", PCM_MIME_PREFIX, sample_rate_hz)
}

/// Pull the sample rate out of a `audio/pcm;rate=N` descriptor.
pub fn sample_rate_from_mime(mime_type: &str) -> Option<u32> {
    mime_type
        .split(';')
        .filter_map(|param| param.trim().strip_prefix("rate="))
        .find_map(|rate| rate.trim().parse().ok())
}

/// Quantize a single sample. Negative values scale by 32768 and non-negative
/// by 32767 so both rails stay inside the `i16` range.
fn quantize(sample: f32) -> i16 {
    let s = sample.clamp(-1.0, 1.0);
    if s < 0.0 {
        (s * 32768.0) as i16
    } else {
        (s * 32767.0) as i16
    }
}

/// Convert f32 samples to PCM 16-bit little-endian bytes.
pub fn samples_to_pcm16(samples: &[f32]) -> Vec<u8> {
    let mut pcm = Vec::with_capacity(samples.len() * 2);
    for &sample in samples {
        pcm.extend_from_slice(&quantize(sample).to_le_bytes());
    }
    pcm
}

/// Encode one capture frame for the transport. Out-of-range input is clamped,
/// never rejected.
pub fn encode_frame(samples: &[f32]) -> String {
    STANDARD.encode(samples_to_pcm16(samples))
}

/// Unpack interleaved PCM16 bytes into per-channel float samples.
pub fn pcm16_to_buffer(
    bytes: &[u8],
    sample_rate_hz: u32,
    channel_count: u16,
) -> Result<PlaybackBuffer, CodecError> {
    if channel_count == 0 {
        return Err(CodecError::NoChannels);
    }
    let channels = channel_count as usize;
    if bytes.len() % (channels * 2) != 0 {
        return Err(CodecError::MisalignedChunk {
            len: bytes.len(),
            channels: channel_count,
        });
    }

    let interleaved: Vec<i16> = bytes
        .chunks_exact(2)
        .map(|pair| i16::from_le_bytes([pair[0], pair[1]]))
        .collect();
    let frame_count = interleaved.len() / channels;

    let mut out = vec![Vec::with_capacity(frame_count); channels];
    for frame in interleaved.chunks_exact(channels) {
        for (channel, &sample) in out.iter_mut().zip(frame) {
            channel.push(sample as f32 / 32768.0);
        }
    }

    Ok(PlaybackBuffer::new(out, sample_rate_hz))
}

/// Decode a base64 audio chunk received from the transport.
pub fn decode_chunk(
    data: &str,
    sample_rate_hz: u32,
    channel_count: u16,
) -> Result<PlaybackBuffer, CodecError> {
    let bytes = STANDARD
        .decode(data.trim())
        .map_err(|e| CodecError::Base64(e.to_string()))?;
    pcm16_to_buffer(&bytes, sample_rate_hz, channel_count)
}
