//! Microphone capture: the device seam and the per-frame pipeline that turns
//! raw frames into outbound chunks.

use crate::codec::{self, EncodedChunk};
use std::any::Any;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use thiserror::Error;
use tokio::sync::mpsc;

pub mod imp_cpal;

pub use imp_cpal::CpalMicrophone;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum AudioError {
    #[error("Audio device error: {0}")]
    Device(String),
    #[error("Audio stream error: {0}")]
    Stream(String),
    #[error("Configuration error: {0}")]
    Config(String),
}

/// One callback's worth of mono samples in [-1.0, 1.0].
pub type AudioFrame = Vec<f32>;

/// A live microphone. Dropping the feed releases the device.
pub struct CaptureFeed {
    pub sample_rate_hz: u32,
    pub frames: mpsc::Receiver<AudioFrame>,
    _device: Box<dyn Any + Send>,
}

impl CaptureFeed {
    pub fn new(
        sample_rate_hz: u32,
        frames: mpsc::Receiver<AudioFrame>,
        device: impl Any + Send,
    ) -> Self {
        Self {
            sample_rate_hz,
            frames,
            _device: Box::new(device),
        }
    }
}

/// Something that can hand out a stream of fixed-size capture frames.
pub trait Microphone: Send {
    fn acquire(&mut self, frame_size: usize) -> Result<CaptureFeed, AudioError>;
}

/// Shared mute flag. Cheap to clone; readable from any thread.
#[derive(Debug, Clone, Default)]
pub struct MuteSwitch(Arc<AtomicBool>);

impl MuteSwitch {
    pub fn new(muted: bool) -> Self {
        Self(Arc::new(AtomicBool::new(muted)))
    }

    pub fn set(&self, muted: bool) {
        self.0.store(muted, Ordering::Release);
    }

    pub fn is_muted(&self) -> bool {
        self.0.load(Ordering::Acquire)
    }
}

/// Result of running one frame through the pipeline.
#[derive(Debug, Clone, PartialEq)]
pub struct CapturedFrame {
    pub chunk: EncodedChunk,
    /// Mean amplitude crossed the speech threshold
    pub speaking: bool,
}

pub fn mean_abs_amplitude(frame: &[f32]) -> f32 {
    if frame.is_empty() {
        return 0.0;
    }
    frame.iter().map(|s| s.abs()).sum::<f32>() / frame.len() as f32
}

pub struct CapturePipeline {
    sample_rate_hz: u32,
    speech_threshold: f32,
    mute: MuteSwitch,
    frames_encoded: u64,
}

impl CapturePipeline {
    pub fn new(sample_rate_hz: u32, speech_threshold: f32, mute: MuteSwitch) -> Self {
        Self {
            sample_rate_hz,
            speech_threshold,
            mute,
            frames_encoded: 0,
        }
    }

    pub fn sample_rate_hz(&self) -> u32 {
        self.sample_rate_hz
    }

    pub fn frames_encoded(&self) -> u64 {
        self.frames_encoded
    }

    /// Gate, measure and encode one frame. Muted frames are dropped before
    /// any measurement and yield `None`.
    pub fn process(&mut self, frame: &[f32]) -> Option<CapturedFrame> {
        if self.mute.is_muted() {
            return None;
        }

        let speaking = mean_abs_amplitude(frame) > self.speech_threshold;
        let chunk = EncodedChunk::pcm16(codec::encode_frame(frame), self.sample_rate_hz);
        self.frames_encoded += 1;

        log::trace!(
            "Capture: frame {} ({} samples, speaking: {})",
            self.frames_encoded,
            frame.len(),
            speaking
        );

        Some(CapturedFrame { chunk, speaking })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn pipeline(mute: &MuteSwitch) -> CapturePipeline {
        CapturePipeline::new(48000, 0.01, mute.clone())
    }

    #[test]
    fn test_mean_abs_amplitude() {
        assert_eq!(mean_abs_amplitude(&[]), 0.0);
        assert!((mean_abs_amplitude(&[0.5, -0.5, 0.0, 0.0]) - 0.25).abs() < 1e-6);
    }

    #[test]
    fn test_loud_frame_is_speech() {
        let mute = MuteSwitch::default();
        let captured = pipeline(&mute).process(&vec![0.2; 4096]).unwrap();
        assert!(captured.speaking);
        assert_eq!(captured.chunk.sample_rate_hz, 48000);
        assert_eq!(captured.chunk.mime_type, "audio/pcm;rate=48000");
    }

    #[test]
    fn test_quiet_frame_is_sent_but_not_speech() {
        let mute = MuteSwitch::default();
        let mut pipeline = pipeline(&mute);
        let captured = pipeline.process(&vec![0.001; 4096]).unwrap();
        assert!(!captured.speaking);
        assert_eq!(pipeline.frames_encoded(), 1);
    }

    #[test]
    fn test_threshold_is_exclusive() {
        let mute = MuteSwitch::default();
        let captured = pipeline(&mute).process(&[0.01]).unwrap();
        assert!(!captured.speaking);
    }

    #[test]
    fn test_muted_frames_are_dropped() {
        let mute = MuteSwitch::new(true);
        let mut pipeline = pipeline(&mute);
        for _ in 0..10 {
            assert!(pipeline.process(&vec![0.9; 4096]).is_none());
        }
        assert_eq!(pipeline.frames_encoded(), 0);

        mute.set(false);
        assert!(pipeline.process(&vec![0.9; 4096]).is_some());
    }
}
