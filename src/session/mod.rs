//! Session lifecycle: owns the devices and the transport for one consultation
//! and drives everything from a single dispatch loop.
//!
//! ```text
//! Idle --start()--> Connecting --opened--> Active --stop()/fatal--> Closed
//!                        \________________fatal_________________/
//! ```
//!
//! `start()` may be called again from `Closed`; the transcript survives.

use crate::audio_capture::{AudioFrame, CaptureFeed, CapturePipeline, Microphone, MuteSwitch};
use crate::codec;
use crate::config::SessionConfig;
use crate::error::{Result, SessionError};
use crate::playback::{PlaybackHandle, PlaybackScheduler, Speaker};
use crate::protocol::{AudioDefaults, InboundEvent, OutboundKind, OutboundMessage, SessionSetup};
use crate::tools::{ConsultationHooks, ToolCallRequest, ToolDispatcher};
use crate::transcript::{Sender, TranscriptAggregator, TranscriptEntry};
use crate::transport::{Connector, Transport, TransportError, TransportLink};
use std::sync::Arc;
use strum::{AsRefStr, Display};
use tokio::sync::{broadcast, mpsc};

/// Capacity of the observer channel; slow subscribers see `Lagged`.
const EVENT_CHANNEL_CAPACITY: usize = 256;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum SessionState {
    Idle,
    Connecting,
    Active,
    Closed,
}

/// Who is audibly talking right now, for UI indicators.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
pub enum SpeakerState {
    Idle,
    LocalSpeaking,
    RemoteSpeaking,
}

/// Everything an observer can learn about a running session.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    StateChanged(SessionState),
    SpeakerChanged(SpeakerState),
    TranscriptAppended(TranscriptEntry),
    /// An outbound message was lost; the session keeps going
    SendFailed { what: OutboundKind, reason: String },
    Error(String),
}

#[derive(Debug)]
enum Command {
    Stop,
}

/// Cloneable remote control for a session whose loop is running elsewhere.
#[derive(Debug, Clone)]
pub struct SessionHandle {
    commands: mpsc::UnboundedSender<Command>,
    mute: MuteSwitch,
}

impl SessionHandle {
    /// Ask the loop to stop. Harmless if the session is already closed.
    pub fn stop(&self) {
        let _ = self.commands.send(Command::Stop);
    }

    pub fn set_muted(&self, muted: bool) {
        self.mute.set(muted);
    }

    pub fn is_muted(&self) -> bool {
        self.mute.is_muted()
    }
}

/// Resources held only while the session is live. Dropping this releases the
/// microphone, the output device and the connection.
struct Live {
    capture: CaptureFeed,
    pipeline: CapturePipeline,
    scheduler: PlaybackScheduler,
    playback_finished: mpsc::UnboundedReceiver<PlaybackHandle>,
    transport: Box<dyn Transport>,
    inbound: mpsc::UnboundedReceiver<InboundEvent>,
}

enum Step {
    Command(Option<Command>),
    Inbound(Option<InboundEvent>),
    PlaybackFinished(Option<PlaybackHandle>),
    Frame(Option<AudioFrame>),
}

pub struct Session {
    config: SessionConfig,
    microphone: Box<dyn Microphone>,
    speaker: Box<dyn Speaker>,
    connector: Box<dyn Connector>,
    dispatcher: ToolDispatcher,
    transcript: TranscriptAggregator,
    mute: MuteSwitch,
    state: SessionState,
    speaker_state: SpeakerState,
    last_error: Option<SessionError>,
    events: broadcast::Sender<SessionEvent>,
    commands_tx: mpsc::UnboundedSender<Command>,
    commands_rx: mpsc::UnboundedReceiver<Command>,
    live: Option<Live>,
}

impl Session {
    pub fn new(
        config: SessionConfig,
        microphone: Box<dyn Microphone>,
        speaker: Box<dyn Speaker>,
        connector: Box<dyn Connector>,
        hooks: Arc<dyn ConsultationHooks>,
    ) -> Self {
        let (events, _) = broadcast::channel(EVENT_CHANNEL_CAPACITY);
        let (commands_tx, commands_rx) = mpsc::unbounded_channel();

        Self {
            config,
            microphone,
            speaker,
            connector,
            dispatcher: ToolDispatcher::new(hooks),
            transcript: TranscriptAggregator::new(),
            mute: MuteSwitch::default(),
            state: SessionState::Idle,
            speaker_state: SpeakerState::Idle,
            last_error: None,
            events,
            commands_tx,
            commands_rx,
            live: None,
        }
    }

    pub fn session_state(&self) -> SessionState {
        self.state
    }

    pub fn speaker_state(&self) -> SpeakerState {
        self.speaker_state
    }

    pub fn transcript(&self) -> &[TranscriptEntry] {
        self.transcript.entries()
    }

    pub fn last_error(&self) -> Option<&SessionError> {
        self.last_error.as_ref()
    }

    pub fn is_muted(&self) -> bool {
        self.mute.is_muted()
    }

    /// Valid in any state; only gates outgoing capture frames.
    pub fn set_muted(&self, muted: bool) {
        log::info!("Microphone {}", if muted { "muted" } else { "unmuted" });
        self.mute.set(muted);
    }

    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.events.subscribe()
    }

    pub fn handle(&self) -> SessionHandle {
        SessionHandle {
            commands: self.commands_tx.clone(),
            mute: self.mute.clone(),
        }
    }

    /// Acquire the microphone and output device, connect, and wait for the
    /// remote side to confirm the session. On success the session is
    /// `Active` and the greeting has been queued, unless a stop arrived
    /// through a handle while connecting, in which case it is `Closed`.
    pub async fn start(&mut self) -> Result<()> {
        if matches!(self.state, SessionState::Connecting | SessionState::Active) {
            return Err(SessionError::InvalidState(self.state));
        }

        // Stop requests aimed at a previous run don't apply to this one
        while self.commands_rx.try_recv().is_ok() {}
        self.last_error = None;
        self.dispatcher.reset();
        self.set_state(SessionState::Connecting);

        let live = match self.open().await {
            Ok(live) => live,
            Err(e) => {
                self.fail(e.clone());
                return Err(e);
            }
        };
        self.live = Some(live);

        if self.stop_requested() {
            log::info!("Stop requested while connecting, not going live");
            self.teardown();
            return Ok(());
        }
        self.set_state(SessionState::Active);

        self.send(OutboundMessage::Greeting(self.config.greeting.clone()));
        Ok(())
    }

    fn stop_requested(&mut self) -> bool {
        let mut stop = false;
        while let Ok(Command::Stop) = self.commands_rx.try_recv() {
            stop = true;
        }
        stop
    }

    async fn open(&mut self) -> Result<Live> {
        let capture = self.microphone.acquire(self.config.frame_size)?;
        log::info!("Microphone acquired @ {}Hz", capture.sample_rate_hz);

        let feed = self
            .speaker
            .open()
            .map_err(|e| SessionError::DeviceAcquisition(format!("Output device: {}", e)))?;

        // One deadline covers both the connection and the setup handshake
        let timeout = self.config.connect_timeout;
        let deadline = tokio::time::Instant::now() + timeout;

        let TransportLink {
            mut transport,
            events: mut inbound,
        } = tokio::time::timeout_at(
            deadline,
            self.connector.connect(AudioDefaults::from(&self.config)),
        )
        .await
        .map_err(|_| TransportError::Timeout(timeout))??;

        let opened = match transport.send(OutboundMessage::Setup(SessionSetup::from_config(
            &self.config,
        ))) {
            Ok(()) => tokio::time::timeout_at(deadline, wait_for_open(&mut inbound))
                .await
                .unwrap_or(Err(TransportError::Timeout(timeout))),
            Err(e) => Err(e),
        };
        if let Err(e) = opened {
            transport.close();
            return Err(e.into());
        }

        Ok(Live {
            pipeline: CapturePipeline::new(
                capture.sample_rate_hz,
                self.config.speech_threshold,
                self.mute.clone(),
            ),
            capture,
            scheduler: PlaybackScheduler::new(feed.output),
            playback_finished: feed.finished,
            transport,
            inbound,
        })
    }

    /// Drive the session until it closes. Inbound events are handled first,
    /// then stop requests, then playback completions and capture frames.
    /// Anything already received from the remote side is applied before a
    /// stop takes effect; pending capture frames are not sent after one.
    pub async fn run(&mut self) {
        loop {
            let Some(live) = self.live.as_mut() else {
                return;
            };

            let step = tokio::select! {
                biased;
                event = live.inbound.recv() => Step::Inbound(event),
                command = self.commands_rx.recv() => Step::Command(command),
                handle = live.playback_finished.recv() => Step::PlaybackFinished(handle),
                frame = live.capture.frames.recv() => Step::Frame(frame),
            };

            match step {
                Step::Inbound(Some(event)) => self.handle_inbound(event),
                Step::Inbound(None) => self.fail(TransportError::Closed.into()),
                Step::PlaybackFinished(Some(handle)) => self.handle_playback_finished(handle),
                Step::PlaybackFinished(None) => self.fail(SessionError::DeviceAcquisition(
                    "Output device stopped".to_string(),
                )),
                Step::Frame(Some(frame)) => self.handle_frame(&frame),
                Step::Frame(None) => self.fail(SessionError::DeviceAcquisition(
                    "Microphone stream ended".to_string(),
                )),
                Step::Command(Some(Command::Stop)) | Step::Command(None) => self.stop(),
            }
        }
    }

    /// End the session and release every resource. A no-op unless live.
    pub fn stop(&mut self) {
        if self.live.is_none() {
            log::debug!("stop() while {}, nothing to do", self.state);
            return;
        }
        log::info!("Stopping session");
        self.teardown();
    }

    fn handle_frame(&mut self, frame: &[f32]) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        let Some(captured) = live.pipeline.process(frame) else {
            return;
        };

        if captured.speaking {
            self.set_speaker(SpeakerState::LocalSpeaking);
        }
        self.send(OutboundMessage::AudioFrame(captured.chunk));
    }

    fn handle_inbound(&mut self, event: InboundEvent) {
        match event {
            InboundEvent::Opened => log::debug!("Duplicate open notification ignored"),
            InboundEvent::AudioChunk {
                data,
                sample_rate_hz,
                channels,
            } => self.handle_audio(&data, sample_rate_hz, channels),
            InboundEvent::PartialTranscript { sender, text } => {
                self.transcript.push_partial(sender, &text);
                if sender == Sender::Remote {
                    self.set_speaker(SpeakerState::RemoteSpeaking);
                }
            }
            InboundEvent::TurnComplete => {
                let appended = self.transcript.complete_turn().to_vec();
                for entry in appended {
                    log::info!("[{}] {}", entry.sender, entry.text);
                    self.emit(SessionEvent::TranscriptAppended(entry));
                }
                self.set_speaker(SpeakerState::Idle);
            }
            InboundEvent::Interrupted => {
                if let Some(live) = self.live.as_mut() {
                    live.scheduler.interrupt();
                }
            }
            InboundEvent::ToolCallRequest(request) => self.handle_tool_call(request),
            InboundEvent::Closed { reason } => {
                match reason {
                    Some(reason) if !reason.is_empty() => {
                        log::info!("Remote side closed the session: {}", reason)
                    }
                    _ => log::info!("Remote side closed the session"),
                }
                self.teardown();
            }
            InboundEvent::Error(message) => self.fail(SessionError::Transport(message)),
            InboundEvent::SendFailed { kind, reason } => self.report_send_failure(kind, reason),
        }
    }

    fn handle_audio(&mut self, data: &str, sample_rate_hz: u32, channels: u16) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        let buffer = match codec::decode_chunk(data, sample_rate_hz, channels) {
            Ok(buffer) => buffer,
            Err(e) => {
                log::warn!("Dropping inbound audio chunk: {}", SessionError::from(e));
                return;
            }
        };
        if let Err(e) = live.scheduler.enqueue(buffer) {
            log::warn!("Dropping inbound audio chunk, scheduling failed: {}", e);
        }
    }

    fn handle_tool_call(&mut self, request: ToolCallRequest) {
        if self.state != SessionState::Active {
            log::warn!(
                "Dropping tool call {} ({}) while {}",
                request.id,
                request.name,
                self.state
            );
            return;
        }
        if let Some(result) = self.dispatcher.dispatch(&request) {
            self.send(OutboundMessage::ToolResult(result));
        }
    }

    fn handle_playback_finished(&mut self, handle: PlaybackHandle) {
        let Some(live) = self.live.as_mut() else {
            return;
        };
        if live.scheduler.finished(handle) {
            self.set_speaker(SpeakerState::Idle);
        }
    }

    /// Fire-and-forget send. Failures are surfaced, never retried.
    fn send(&mut self, message: OutboundMessage) {
        let Some(live) = self.live.as_ref() else {
            return;
        };
        let kind = message.kind();
        if let Err(e) = live.transport.send(message) {
            self.report_send_failure(kind, e.to_string());
        }
    }

    fn report_send_failure(&self, what: OutboundKind, reason: String) {
        log::warn!("Failed to send {}: {}", what, reason);
        self.emit(SessionEvent::SendFailed { what, reason });
    }

    /// Fatal path: record the error and close. Only the first failure of a
    /// run is recorded.
    fn fail(&mut self, error: SessionError) {
        if self.state == SessionState::Closed {
            log::debug!("Ignoring error after close: {}", error);
            return;
        }
        log::error!("Session failed: {}", error);
        self.emit(SessionEvent::Error(error.to_string()));
        self.last_error = Some(error);
        self.teardown();
    }

    fn teardown(&mut self) {
        if let Some(mut live) = self.live.take() {
            live.scheduler.interrupt();
            live.transport.close();
            log::info!(
                "Released devices after {} capture frames",
                live.pipeline.frames_encoded()
            );
        }
        self.set_speaker(SpeakerState::Idle);
        self.set_state(SessionState::Closed);
    }

    fn set_state(&mut self, state: SessionState) {
        if self.state != state {
            log::info!("Session: {} -> {}", self.state, state);
            self.state = state;
            self.emit(SessionEvent::StateChanged(state));
        }
    }

    fn set_speaker(&mut self, speaker: SpeakerState) {
        if self.speaker_state != speaker {
            log::debug!("Speaker: {} -> {}", self.speaker_state, speaker);
            self.speaker_state = speaker;
            self.emit(SessionEvent::SpeakerChanged(speaker));
        }
    }

    fn emit(&self, event: SessionEvent) {
        // No subscribers is fine
        let _ = self.events.send(event);
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Some(live) = self.live.as_mut() {
            log::debug!("Session dropped while live, closing transport");
            live.transport.close();
        }
    }
}

async fn wait_for_open(
    inbound: &mut mpsc::UnboundedReceiver<InboundEvent>,
) -> std::result::Result<(), TransportError> {
    loop {
        match inbound.recv().await {
            Some(InboundEvent::Opened) => return Ok(()),
            Some(InboundEvent::Error(message)) => return Err(TransportError::Remote(message)),
            Some(InboundEvent::SendFailed { kind, reason }) => {
                return Err(TransportError::Connect(format!(
                    "failed to send {}: {}",
                    kind, reason
                )))
            }
            Some(InboundEvent::Closed { .. }) | None => return Err(TransportError::Closed),
            Some(other) => log::debug!("Ignoring {:?} before session opened", other),
        }
    }
}
