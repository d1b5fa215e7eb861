//! Gapless scheduling of inbound synthesized audio.
//!
//! Chunks arrive with arbitrary network jitter. Each one is placed at
//! `max(cursor, now)` and the cursor advances by its duration, so playback is
//! back-to-back whenever the network keeps up and restarts from "now" when it
//! doesn't. An interruption stops everything in flight and rewinds the cursor.

use crate::audio_capture::AudioError;
use crate::codec::PlaybackBuffer;
use std::collections::HashSet;
use tokio::sync::mpsc;

pub mod cpal_output;

pub use cpal_output::CpalSpeaker;

/// Opaque id for one scheduled buffer.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct PlaybackHandle(u64);

impl PlaybackHandle {
    pub fn id(&self) -> u64 {
        self.0
    }
}

/// Output device with a monotonic clock that can play buffers at a given time.
pub trait AudioOutput: Send {
    /// Seconds elapsed on the output clock
    fn current_time(&self) -> f64;

    /// Start `buffer` at `start_at` seconds on the output clock. Natural
    /// completion must be reported on the feed's `finished` channel.
    fn schedule(
        &mut self,
        handle: PlaybackHandle,
        buffer: PlaybackBuffer,
        start_at: f64,
    ) -> Result<(), AudioError>;

    /// Silence `handle` immediately. A stopped handle is never reported finished.
    fn stop(&mut self, handle: PlaybackHandle);
}

/// An opened output device. Dropping `output` releases the device.
pub struct SpeakerFeed {
    pub output: Box<dyn AudioOutput>,
    pub finished: mpsc::UnboundedReceiver<PlaybackHandle>,
}

pub trait Speaker: Send {
    fn open(&mut self) -> Result<SpeakerFeed, AudioError>;
}

/// Where a chunk landed on the output clock.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct ScheduledChunk {
    pub handle: PlaybackHandle,
    pub start_time: f64,
    pub duration: f64,
}

impl ScheduledChunk {
    pub fn end_time(&self) -> f64 {
        self.start_time + self.duration
    }
}

pub struct PlaybackScheduler {
    output: Box<dyn AudioOutput>,
    next_start_time: f64,
    live: HashSet<PlaybackHandle>,
    next_handle: u64,
}

impl PlaybackScheduler {
    pub fn new(output: Box<dyn AudioOutput>) -> Self {
        Self {
            output,
            next_start_time: 0.0,
            live: HashSet::new(),
            next_handle: 0,
        }
    }

    pub fn next_start_time(&self) -> f64 {
        self.next_start_time
    }

    pub fn live_count(&self) -> usize {
        self.live.len()
    }

    pub fn is_playing(&self) -> bool {
        !self.live.is_empty()
    }

    /// Queue a decoded chunk directly behind whatever is already scheduled.
    pub fn enqueue(&mut self, buffer: PlaybackBuffer) -> Result<ScheduledChunk, AudioError> {
        let now = self.output.current_time();
        let start_time = self.next_start_time.max(now);
        let duration = buffer.duration_seconds();

        let handle = PlaybackHandle(self.next_handle);
        self.next_handle += 1;

        self.output.schedule(handle, buffer, start_time)?;
        self.next_start_time = start_time + duration;
        self.live.insert(handle);

        log::debug!(
            "Playback: {:?} at {:.3}s for {:.3}s (clock {:.3}s, {} live)",
            handle,
            start_time,
            duration,
            now,
            self.live.len()
        );

        Ok(ScheduledChunk {
            handle,
            start_time,
            duration,
        })
    }

    /// Record natural completion. Returns true when this drained the live set.
    /// Completions for handles that are no longer live are ignored.
    pub fn finished(&mut self, handle: PlaybackHandle) -> bool {
        if !self.live.remove(&handle) {
            log::trace!("Playback: stale completion for {:?}", handle);
            return false;
        }
        self.live.is_empty()
    }

    /// Barge-in: stop everything in flight and rewind the cursor so the next
    /// chunk starts from "now". Returns how many handles were stopped.
    pub fn interrupt(&mut self) -> usize {
        let stopped = self.live.len();
        for handle in self.live.drain() {
            self.output.stop(handle);
        }
        self.next_start_time = 0.0;

        if stopped > 0 {
            log::info!("Playback: interrupted, stopped {} buffers", stopped);
        }
        stopped
    }
}

impl Drop for PlaybackScheduler {
    fn drop(&mut self) {
        self.interrupt();
    }
}
