use anyhow::Context;
use clap::Parser;
use live_consult::{
    audio_capture::CpalMicrophone,
    config::{load_config, SessionConfig},
    playback::CpalSpeaker,
    tools::{ConsultationHooks, QuizState},
    transport::WebSocketConnector,
    Session, SessionEvent,
};
use std::path::PathBuf;
use std::sync::Arc;
use tokio::sync::broadcast;

#[derive(Parser, Debug)]
#[command(name = "live-consult", about = "Real-time voice consultation session")]
struct Args {
    /// Model to converse with
    #[arg(long)]
    model: Option<String>,

    /// Prebuilt voice for synthesized speech
    #[arg(long)]
    voice: Option<String>,

    /// Read the system instruction from this file
    #[arg(long)]
    instruction_file: Option<PathBuf>,

    /// Start with the microphone muted
    #[arg(long)]
    muted: bool,

    /// Capture device name (default input if omitted)
    #[arg(long)]
    input_device: Option<String>,

    /// Playback device name (default output if omitted)
    #[arg(long)]
    output_device: Option<String>,

    /// List capture devices and exit
    #[arg(long)]
    list_devices: bool,
}

/// Prints canvas and quiz updates to the terminal.
struct TerminalHooks;

impl ConsultationHooks for TerminalHooks {
    fn on_quiz_state_change(&self, state: QuizState) {
        println!(
            "📝 Quiz {}/{}: {}",
            state.current_question_index + 1,
            state.total_questions,
            state.question_text
        );
        for (i, option) in state.options.iter().enumerate() {
            println!("   {}. {}", i + 1, option);
        }
    }

    fn on_content_proposed(&self, section: &str, content: &str, rationale: &str) {
        println!("💡 Proposal for {}: {}", section, content);
        println!("   ({})", rationale);
    }

    fn on_section_highlighted(&self, section: &str, description: &str) {
        println!("🔎 {}: {}", section, description);
    }
}

fn session_config(args: &Args) -> anyhow::Result<SessionConfig> {
    let mut config = SessionConfig::default();
    if let Some(model) = &args.model {
        config.model = model.clone();
    }
    if let Some(voice) = &args.voice {
        config.voice_name = voice.clone();
    }
    if let Some(path) = &args.instruction_file {
        config.system_instruction = std::fs::read_to_string(path)
            .with_context(|| format!("Failed to read instruction file {}", path.display()))?;
    }
    Ok(config)
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    env_logger::init();
    let args = Args::parse();

    if args.list_devices {
        for name in CpalMicrophone::list_devices()? {
            println!("{}", name);
        }
        return Ok(());
    }

    log::info!("🚀 Initializing live-consult");
    let api_config = load_config().context("Failed to load API configuration")?;
    let config = session_config(&args)?;

    let mut session = Session::new(
        config,
        Box::new(CpalMicrophone::new(args.input_device.clone())),
        Box::new(CpalSpeaker::new(args.output_device.clone())),
        Box::new(WebSocketConnector::new(api_config)),
        Arc::new(TerminalHooks),
    );
    session.set_muted(args.muted);

    let mut events = session.subscribe();
    tokio::spawn(async move {
        loop {
            match events.recv().await {
                Ok(SessionEvent::TranscriptAppended(entry)) => {
                    println!("[{}] {}", entry.sender, entry.text)
                }
                Ok(SessionEvent::StateChanged(state)) => println!("● {}", state),
                Ok(SessionEvent::Error(message)) => eprintln!("❌ {}", message),
                Ok(SessionEvent::SendFailed { what, reason }) => {
                    log::warn!("Lost {} message: {}", what, reason)
                }
                Ok(SessionEvent::SpeakerChanged(_)) => {}
                Err(broadcast::error::RecvError::Lagged(skipped)) => {
                    log::warn!("Event printer lagged, skipped {} events", skipped);
                }
                Err(broadcast::error::RecvError::Closed) => break,
            }
        }
    });

    session.start().await.context("Failed to start session")?;
    println!("🎧 Session live. Press Ctrl+C to end.");

    tokio::select! {
        _ = session.run() => {}
        _ = tokio::signal::ctrl_c() => {
            log::info!("🛑 Received Ctrl+C, ending session");
        }
    }
    session.stop();

    if let Some(error) = session.last_error() {
        anyhow::bail!("Session ended with error: {}", error);
    }
    log::info!("✅ Session ended ({} transcript entries)", session.transcript().len());
    Ok(())
}
