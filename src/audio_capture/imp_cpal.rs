use super::{AudioError, AudioFrame, CaptureFeed, Microphone};
use cpal::{
    traits::{DeviceTrait, HostTrait, StreamTrait},
    Device, FromSample, Sample, SampleFormat, SizedSample, Stream as CpalStream,
};
use std::sync::mpsc as std_mpsc;
use std::thread;
use tokio::sync::mpsc;

/// Frames buffered between the device thread and the session loop
const FRAME_QUEUE_DEPTH: usize = 32;

/// Microphone backed by a CPAL input stream.
///
/// The stream lives on its own thread (CPAL streams are not `Send` on every
/// platform); the thread exits and the device is released when the returned
/// feed is dropped.
#[derive(Debug, Clone, Default)]
pub struct CpalMicrophone {
    /// Device name to capture from (None = default device)
    pub device_name: Option<String>,
}

impl CpalMicrophone {
    pub fn new(device_name: Option<String>) -> Self {
        Self { device_name }
    }

    pub fn list_devices() -> Result<Vec<String>, AudioError> {
        let host = cpal::default_host();
        let devices = host
            .input_devices()
            .map_err(|e| AudioError::Device(format!("Failed to enumerate devices: {}", e)))?;
        Ok(devices.filter_map(|d| d.name().ok()).collect())
    }

    fn find_device(&self) -> Result<Device, AudioError> {
        let host = cpal::default_host();
        if let Some(name) = &self.device_name {
            host.input_devices()
                .map_err(|e| AudioError::Device(e.to_string()))?
                .find(|d| d.name().map(|n| n == *name).unwrap_or(false))
                .ok_or_else(|| AudioError::Device(format!("Device not found: {}", name)))
        } else {
            host.default_input_device()
                .ok_or_else(|| AudioError::Device("No default input device found".into()))
        }
    }

    fn open_stream(
        &self,
        frame_size: usize,
        tx: mpsc::Sender<AudioFrame>,
    ) -> Result<(CpalStream, u32), AudioError> {
        let device = self.find_device()?;
        let supported_config = device
            .default_input_config()
            .map_err(|e| AudioError::Config(e.to_string()))?;
        let stream_config = supported_config.config();
        let sample_rate = stream_config.sample_rate.0;

        log::info!(
            "Microphone: {:?}, {} channels @ {}Hz ({:?})",
            device.name().unwrap_or_default(),
            stream_config.channels,
            sample_rate,
            supported_config.sample_format()
        );

        let stream = match supported_config.sample_format() {
            SampleFormat::F32 => Self::build_stream::<f32>(&device, &stream_config, tx, frame_size)?,
            SampleFormat::I16 => Self::build_stream::<i16>(&device, &stream_config, tx, frame_size)?,
            SampleFormat::U16 => Self::build_stream::<u16>(&device, &stream_config, tx, frame_size)?,
            format => {
                return Err(AudioError::Config(format!(
                    "Unsupported sample format: {:?}",
                    format
                )))
            }
        };

        stream
            .play()
            .map_err(|e| AudioError::Stream(format!("Failed to start stream: {}", e)))?;

        Ok((stream, sample_rate))
    }

    fn build_stream<T>(
        device: &Device,
        config: &cpal::StreamConfig,
        tx: mpsc::Sender<AudioFrame>,
        frame_size: usize,
    ) -> Result<CpalStream, AudioError>
    where
        T: Sample + SizedSample + Send + Sync + 'static,
        f32: FromSample<T>,
    {
        let channels = config.channels as usize;
        let mut buffer = Vec::with_capacity(frame_size);

        device
            .build_input_stream(
                config,
                move |data: &[T], _: &cpal::InputCallbackInfo| {
                    // First channel only; the session is mono
                    for frame in data.chunks(channels) {
                        if let Some(sample) = frame.first() {
                            buffer.push(f32::from_sample(*sample));

                            if buffer.len() >= frame_size {
                                let full = std::mem::replace(
                                    &mut buffer,
                                    Vec::with_capacity(frame_size),
                                );
                                if tx.try_send(full).is_err() {
                                    log::debug!("Microphone: session loop behind, frame dropped");
                                }
                            }
                        }
                    }
                },
                |err| log::error!("Microphone stream error: {}", err),
                None,
            )
            .map_err(|e| AudioError::Stream(e.to_string()))
    }
}

/// Keeps the capture thread alive; dropping it stops the stream.
struct CaptureThread {
    stop_tx: Option<std_mpsc::Sender<()>>,
    thread: Option<thread::JoinHandle<()>>,
}

impl Drop for CaptureThread {
    fn drop(&mut self) {
        // Closing the channel wakes the thread
        self.stop_tx.take();
        if let Some(thread) = self.thread.take() {
            if let Err(e) = thread.join() {
                log::error!("Failed to join capture thread: {:?}", e);
            }
        }
        log::debug!("Microphone: released");
    }
}

impl Microphone for CpalMicrophone {
    fn acquire(&mut self, frame_size: usize) -> Result<CaptureFeed, AudioError> {
        let (frame_tx, frame_rx) = mpsc::channel(FRAME_QUEUE_DEPTH);
        let (ready_tx, ready_rx) = std_mpsc::channel();
        let (stop_tx, stop_rx) = std_mpsc::channel::<()>();
        let mic = self.clone();

        let thread = thread::spawn(move || {
            let stream = match mic.open_stream(frame_size, frame_tx) {
                Ok((stream, rate)) => {
                    let _ = ready_tx.send(Ok(rate));
                    stream
                }
                Err(e) => {
                    let _ = ready_tx.send(Err(e));
                    return;
                }
            };

            // Blocks until the feed is dropped
            let _ = stop_rx.recv();
            drop(stream);
        });

        let sample_rate_hz = match ready_rx.recv() {
            Ok(Ok(rate)) => rate,
            Ok(Err(e)) => {
                let _ = thread.join();
                return Err(e);
            }
            Err(_) => {
                let _ = thread.join();
                return Err(AudioError::Device("Capture thread exited during setup".into()));
            }
        };

        Ok(CaptureFeed::new(
            sample_rate_hz,
            frame_rx,
            CaptureThread {
                stop_tx: Some(stop_tx),
                thread: Some(thread),
            },
        ))
    }
}
