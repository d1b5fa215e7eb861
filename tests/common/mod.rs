//! In-memory devices and transport for driving a full `Session` without
//! hardware or network.

#![allow(dead_code)]

use async_trait::async_trait;
use live_consult::{
    audio_capture::{AudioError, AudioFrame, CaptureFeed, Microphone},
    codec::{self, PlaybackBuffer},
    config::SessionConfig,
    playback::{AudioOutput, PlaybackHandle, Speaker, SpeakerFeed},
    protocol::{AudioDefaults, InboundEvent, OutboundKind, OutboundMessage},
    tools::{ConsultationHooks, QuizState},
    transport::{Connector, Transport, TransportError, TransportLink},
    Session, SessionEvent, SessionHandle,
};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;
use tokio::sync::{broadcast, mpsc};

pub const MIC_RATE: u32 = 16000;
pub const REMOTE_RATE: u32 = 24000;

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

/// Increments a counter when the device it stands in for is released.
struct ReleaseGuard(Arc<AtomicUsize>);

impl Drop for ReleaseGuard {
    fn drop(&mut self) {
        self.0.fetch_add(1, Ordering::SeqCst);
    }
}

#[derive(Debug, Default)]
pub struct OutputLog {
    pub clock: f64,
    pub scheduled: Vec<(PlaybackHandle, f64, f64)>,
    pub stopped: Vec<PlaybackHandle>,
}

/// Shared view into every mock, held by the test.
#[derive(Clone, Default)]
pub struct Probe {
    frames_tx: Arc<Mutex<Option<mpsc::Sender<AudioFrame>>>>,
    finished_tx: Arc<Mutex<Option<mpsc::UnboundedSender<PlaybackHandle>>>>,
    inbound_tx: Arc<Mutex<Option<mpsc::UnboundedSender<InboundEvent>>>>,
    pub output: Arc<Mutex<OutputLog>>,
    pub sent: Arc<Mutex<Vec<OutboundMessage>>>,
    pub mic_acquired: Arc<AtomicUsize>,
    pub mic_released: Arc<AtomicUsize>,
    pub output_released: Arc<AtomicUsize>,
    pub connects: Arc<AtomicUsize>,
    pub transport_closed: Arc<AtomicBool>,
    pub reject_sends: Arc<AtomicBool>,
    /// Stopped from inside `connect`, i.e. while the session is connecting
    pub stop_on_connect: Arc<Mutex<Option<SessionHandle>>>,
}

impl Probe {
    /// Deliver one capture frame as if the device callback fired.
    pub fn frame(&self, samples: Vec<f32>) {
        let guard = self.frames_tx.lock().unwrap();
        guard
            .as_ref()
            .expect("microphone not acquired")
            .try_send(samples)
            .expect("frame queue full");
    }

    /// Deliver one event from the remote service.
    pub fn remote(&self, event: InboundEvent) {
        let guard = self.inbound_tx.lock().unwrap();
        guard
            .as_ref()
            .expect("not connected")
            .send(event)
            .expect("session dropped its inbound stream");
    }

    /// Try to deliver a remote event; false once the session let go of the link.
    pub fn try_remote(&self, event: InboundEvent) -> bool {
        match self.inbound_tx.lock().unwrap().as_ref() {
            Some(tx) => tx.send(event).is_ok(),
            None => false,
        }
    }

    /// Drop the remote end without a close event.
    pub fn inbound_gone(&self) {
        self.inbound_tx.lock().unwrap().take();
    }

    /// Report natural completion of a scheduled buffer.
    pub fn complete(&self, handle: PlaybackHandle) {
        let guard = self.finished_tx.lock().unwrap();
        guard
            .as_ref()
            .expect("speaker not opened")
            .send(handle)
            .expect("session dropped its playback stream");
    }

    pub fn set_clock(&self, seconds: f64) {
        self.output.lock().unwrap().clock = seconds;
    }

    pub fn scheduled(&self) -> Vec<(PlaybackHandle, f64, f64)> {
        self.output.lock().unwrap().scheduled.clone()
    }

    pub fn stopped(&self) -> Vec<PlaybackHandle> {
        self.output.lock().unwrap().stopped.clone()
    }

    pub fn sent_kinds(&self) -> Vec<OutboundKind> {
        self.sent.lock().unwrap().iter().map(|m| m.kind()).collect()
    }

    pub fn sent_of(&self, kind: OutboundKind) -> Vec<OutboundMessage> {
        self.sent
            .lock()
            .unwrap()
            .iter()
            .filter(|m| m.kind() == kind)
            .cloned()
            .collect()
    }
}

pub struct MockMicrophone {
    probe: Probe,
    error: Option<AudioError>,
}

impl Microphone for MockMicrophone {
    fn acquire(&mut self, _frame_size: usize) -> Result<CaptureFeed, AudioError> {
        if let Some(e) = &self.error {
            return Err(e.clone());
        }
        let (tx, rx) = mpsc::channel(64);
        *self.probe.frames_tx.lock().unwrap() = Some(tx);
        self.probe.mic_acquired.fetch_add(1, Ordering::SeqCst);
        Ok(CaptureFeed::new(
            MIC_RATE,
            rx,
            ReleaseGuard(self.probe.mic_released.clone()),
        ))
    }
}

struct MockOutput {
    log: Arc<Mutex<OutputLog>>,
    _release: ReleaseGuard,
}

impl AudioOutput for MockOutput {
    fn current_time(&self) -> f64 {
        self.log.lock().unwrap().clock
    }

    fn schedule(
        &mut self,
        handle: PlaybackHandle,
        buffer: PlaybackBuffer,
        start_at: f64,
    ) -> Result<(), AudioError> {
        self.log
            .lock()
            .unwrap()
            .scheduled
            .push((handle, start_at, buffer.duration_seconds()));
        Ok(())
    }

    fn stop(&mut self, handle: PlaybackHandle) {
        self.log.lock().unwrap().stopped.push(handle);
    }
}

pub struct MockSpeaker {
    probe: Probe,
}

impl Speaker for MockSpeaker {
    fn open(&mut self) -> Result<SpeakerFeed, AudioError> {
        let (tx, rx) = mpsc::unbounded_channel();
        *self.probe.finished_tx.lock().unwrap() = Some(tx);
        Ok(SpeakerFeed {
            output: Box::new(MockOutput {
                log: self.probe.output.clone(),
                _release: ReleaseGuard(self.probe.output_released.clone()),
            }),
            finished: rx,
        })
    }
}

struct MockTransport {
    sent: Arc<Mutex<Vec<OutboundMessage>>>,
    closed: Arc<AtomicBool>,
    reject: Arc<AtomicBool>,
}

impl Transport for MockTransport {
    fn send(&self, message: OutboundMessage) -> Result<(), TransportError> {
        if self.closed.load(Ordering::SeqCst) || self.reject.load(Ordering::SeqCst) {
            return Err(TransportError::Closed);
        }
        self.sent.lock().unwrap().push(message);
        Ok(())
    }

    fn close(&mut self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

pub struct MockConnector {
    probe: Probe,
    auto_open: bool,
    stall: bool,
}

#[async_trait]
impl Connector for MockConnector {
    async fn connect(&mut self, _audio: AudioDefaults) -> Result<TransportLink, TransportError> {
        self.probe.connects.fetch_add(1, Ordering::SeqCst);
        if self.stall {
            std::future::pending::<()>().await;
        }
        if let Some(handle) = self.probe.stop_on_connect.lock().unwrap().as_ref() {
            handle.stop();
        }

        let (tx, rx) = mpsc::unbounded_channel();
        if self.auto_open {
            let _ = tx.send(InboundEvent::Opened);
        }
        *self.probe.inbound_tx.lock().unwrap() = Some(tx);
        self.probe.transport_closed.store(false, Ordering::SeqCst);

        Ok(TransportLink {
            transport: Box::new(MockTransport {
                sent: self.probe.sent.clone(),
                closed: self.probe.transport_closed.clone(),
                reject: self.probe.reject_sends.clone(),
            }),
            events: rx,
        })
    }
}

/// Records every application callback in call order.
#[derive(Default)]
pub struct RecordingHooks {
    pub calls: Mutex<Vec<String>>,
    pub quiz: Mutex<Option<QuizState>>,
}

impl RecordingHooks {
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }
}

impl ConsultationHooks for RecordingHooks {
    fn on_quiz_state_change(&self, state: QuizState) {
        self.calls.lock().unwrap().push("quiz".to_string());
        *self.quiz.lock().unwrap() = Some(state);
    }

    fn on_content_proposed(&self, section: &str, content: &str, rationale: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("propose:{}:{}:{}", section, content, rationale));
    }

    fn on_section_highlighted(&self, section: &str, description: &str) {
        self.calls
            .lock()
            .unwrap()
            .push(format!("highlight:{}:{}", section, description));
    }
}

pub struct RigOptions {
    pub config: SessionConfig,
    pub mic_error: Option<AudioError>,
    pub auto_open: bool,
    /// The connector never resolves
    pub stall_connect: bool,
}

impl Default for RigOptions {
    fn default() -> Self {
        Self {
            config: SessionConfig::default(),
            mic_error: None,
            auto_open: true,
            stall_connect: false,
        }
    }
}

pub fn rig() -> (Session, Probe, Arc<RecordingHooks>) {
    rig_with(RigOptions::default())
}

pub fn rig_with(options: RigOptions) -> (Session, Probe, Arc<RecordingHooks>) {
    init_logging();
    let probe = Probe::default();
    let hooks = Arc::new(RecordingHooks::default());

    let session = Session::new(
        options.config,
        Box::new(MockMicrophone {
            probe: probe.clone(),
            error: options.mic_error,
        }),
        Box::new(MockSpeaker {
            probe: probe.clone(),
        }),
        Box::new(MockConnector {
            probe: probe.clone(),
            auto_open: options.auto_open,
            stall: options.stall_connect,
        }),
        hooks.clone(),
    );
    (session, probe, hooks)
}

/// Let the session loop handle everything queued so far, then return with
/// the session still in whatever state that left it.
pub async fn pump(session: &mut Session) {
    let _ = tokio::time::timeout(Duration::from_millis(100), session.run()).await;
}

/// `seconds` of silence as a remote audio event at the remote rate.
pub fn remote_audio(seconds: f64) -> InboundEvent {
    let samples = (seconds * REMOTE_RATE as f64).round() as usize;
    InboundEvent::AudioChunk {
        data: codec::encode_frame(&vec![0.0; samples]),
        sample_rate_hz: REMOTE_RATE,
        channels: 1,
    }
}

pub fn drain_events(events: &mut broadcast::Receiver<SessionEvent>) -> Vec<SessionEvent> {
    let mut out = Vec::new();
    while let Ok(event) = events.try_recv() {
        out.push(event);
    }
    out
}

pub fn approx(a: f64, b: f64) -> bool {
    (a - b).abs() < 1e-9
}
