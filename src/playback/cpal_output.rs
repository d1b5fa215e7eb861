use super::{AudioOutput, PlaybackHandle, Speaker, SpeakerFeed};
use crate::audio_capture::AudioError;
use crate::codec::PlaybackBuffer;
use cpal::traits::{DeviceTrait, HostTrait, StreamTrait};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::mpsc as std_mpsc;
use std::sync::{Arc, Mutex};
use std::thread;
use tokio::sync::mpsc;

/// One buffer placed on the output timeline.
struct Voice {
    handle: PlaybackHandle,
    start_frame: u64,
    buffer: PlaybackBuffer,
    /// Source frames advanced per output frame
    step: f64,
    position: f64,
}

/// Sums every voice whose start frame has been reached into the device buffer.
struct Mixer {
    channels: usize,
    voices: Vec<Voice>,
}

impl Mixer {
    fn render(
        &mut self,
        data: &mut [f32],
        clock: &AtomicU64,
        finished: &mpsc::UnboundedSender<PlaybackHandle>,
    ) {
        data.fill(0.0);
        let channels = self.channels.max(1);
        let base = clock.load(Ordering::Acquire);

        self.voices.retain_mut(|voice| {
            let frame_count = voice.buffer.frame_count();
            let source_channels = voice.buffer.channel_count();

            if frame_count > 0 && source_channels > 0 {
                for (k, out) in data.chunks_mut(channels).enumerate() {
                    if base + (k as u64) < voice.start_frame {
                        continue;
                    }
                    let idx = voice.position as usize;
                    if idx >= frame_count {
                        break;
                    }
                    let frac = (voice.position - idx as f64) as f32;

                    for (c, sample) in out.iter_mut().enumerate() {
                        // Mono sources are duplicated across output channels
                        let src = voice
                            .buffer
                            .channel(c.min(source_channels - 1))
                            .unwrap_or(&[]);
                        let a = src.get(idx).copied().unwrap_or(0.0);
                        let b = src.get(idx + 1).copied().unwrap_or(a);
                        *sample += a + (b - a) * frac;
                    }
                    voice.position += voice.step;
                }
            }

            if voice.position >= frame_count as f64 {
                let _ = finished.send(voice.handle);
                false
            } else {
                true
            }
        });

        for sample in data.iter_mut() {
            *sample = sample.clamp(-1.0, 1.0);
        }
        clock.fetch_add((data.len() / channels) as u64, Ordering::AcqRel);
    }
}

/// Speaker backed by a CPAL output stream.
#[derive(Debug, Clone, Default)]
pub struct CpalSpeaker {
    /// Device name to play to (None = default device)
    pub device_name: Option<String>,
}

impl CpalSpeaker {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    fn find_device(&self) -> Result<cpal::Device, AudioError> {
        let host = cpal::default_host();
        log::debug!("Speaker: Using audio host: {:?}", host.id());

        if let Some(name) = &self.device_name {
            host.output_devices()
                .map_err(|e| AudioError::Device(e.to_string()))?
                .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
                .ok_or_else(|| AudioError::Device(format!("Output device not found: {}", name)))
        } else {
            host.default_output_device()
                .ok_or_else(|| AudioError::Device("No output device found".to_string()))
        }
    }
}

/// Handle to the mixer thread; dropping it tears the stream down.
pub struct CpalOutput {
    mixer: Arc<Mutex<Mixer>>,
    clock: Arc<AtomicU64>,
    sample_rate: u32,
    stop_tx: Option<std_mpsc::Sender<()>>,
    audio_thread: Option<thread::JoinHandle<()>>,
}

impl AudioOutput for CpalOutput {
    fn current_time(&self) -> f64 {
        self.clock.load(Ordering::Acquire) as f64 / self.sample_rate as f64
    }

    fn schedule(
        &mut self,
        handle: PlaybackHandle,
        buffer: PlaybackBuffer,
        start_at: f64,
    ) -> Result<(), AudioError> {
        if buffer.sample_rate_hz() == 0 {
            return Err(AudioError::Config("Buffer has no sample rate".to_string()));
        }
        let voice = Voice {
            handle,
            start_frame: (start_at * self.sample_rate as f64).round() as u64,
            step: buffer.sample_rate_hz() as f64 / self.sample_rate as f64,
            buffer,
            position: 0.0,
        };

        let mut mixer = self
            .mixer
            .lock()
            .map_err(|e| AudioError::Stream(format!("Mixer poisoned: {}", e)))?;
        mixer.voices.push(voice);
        Ok(())
    }

    fn stop(&mut self, handle: PlaybackHandle) {
        match self.mixer.lock() {
            Ok(mut mixer) => mixer.voices.retain(|v| v.handle != handle),
            Err(e) => log::error!("Speaker: Failed to stop {:?}: {}", handle, e),
        }
    }
}

impl Drop for CpalOutput {
    fn drop(&mut self) {
        self.stop_tx.take();
        if let Some(thread) = self.audio_thread.take() {
            if let Err(e) = thread.join() {
                log::error!("Failed to join audio thread: {:?}", e);
            }
        }
        log::debug!("Speaker: released");
    }
}

impl Speaker for CpalSpeaker {
    fn open(&mut self) -> Result<SpeakerFeed, AudioError> {
        let device = self.find_device()?;
        let supported_config = device
            .default_output_config()
            .map_err(|e| AudioError::Device(e.to_string()))?;

        if supported_config.sample_format() != cpal::SampleFormat::F32 {
            log::warn!(
                "Speaker: device prefers {:?}, requesting f32",
                supported_config.sample_format()
            );
        }

        let stream_config = supported_config.config();
        let sample_rate = stream_config.sample_rate.0;
        let channels = stream_config.channels as usize;
        log::info!("Speaker: {} channels @ {}Hz", channels, sample_rate);

        let mixer = Arc::new(Mutex::new(Mixer {
            channels,
            voices: Vec::new(),
        }));
        let clock = Arc::new(AtomicU64::new(0));
        let (finished_tx, finished_rx) = mpsc::unbounded_channel();
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();

        let mixer_clone = Arc::clone(&mixer);
        let clock_clone = Arc::clone(&clock);

        let audio_thread = thread::spawn(move || {
            let stream = device.build_output_stream(
                &stream_config,
                move |data: &mut [f32], _: &cpal::OutputCallbackInfo| match mixer_clone.lock() {
                    Ok(mut mixer) => mixer.render(data, &clock_clone, &finished_tx),
                    Err(_) => data.fill(0.0),
                },
                |err| log::error!("Speaker: Stream error: {}", err),
                None,
            );

            let stream = match stream {
                Ok(stream) => stream,
                Err(e) => {
                    let _ = ready_tx.send(Err(AudioError::Stream(e.to_string())));
                    return;
                }
            };
            if let Err(e) = stream.play() {
                let _ = ready_tx.send(Err(AudioError::Stream(e.to_string())));
                return;
            }
            let _ = ready_tx.send(Ok(()));

            let _ = stop_rx.recv();
            log::debug!("Speaker: Audio thread exiting");
        });

        match ready_rx.recv() {
            Ok(Ok(())) => {}
            Ok(Err(e)) => {
                let _ = audio_thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = audio_thread.join();
                return Err(AudioError::Device("Audio thread exited during setup".into()));
            }
        }

        Ok(SpeakerFeed {
            output: Box::new(CpalOutput {
                mixer,
                clock,
                sample_rate,
                stop_tx: Some(stop_tx),
                audio_thread: Some(audio_thread),
            }),
            finished: finished_rx,
        })
    }
}
