//! JSON wire format of the live session transport.
//!
//! Outbound: `setup`, `realtimeInput`, `clientContent`, `toolResponse`.
//! Inbound: `setupComplete`, `serverContent`, `toolCall`. A single server
//! message can carry several events; they are flattened into
//! [`InboundEvent`]s in a fixed order.

use crate::codec::{self, EncodedChunk};
use crate::config::SessionConfig;
use crate::tools::{ToolCallRequest, ToolCallResult, ToolDispatcher};
use crate::transcript::Sender;
use serde::Deserialize;
use serde_json::{json, Value};
use strum::{AsRefStr, Display};
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq)]
pub enum ProtocolError {
    #[error("Invalid JSON: {0}")]
    InvalidJson(String),

    #[error("Invalid string encoding")]
    InvalidString,
}

/// Everything the session loop can receive from the transport.
#[derive(Debug, Clone, PartialEq)]
pub enum InboundEvent {
    Opened,
    AudioChunk {
        data: String,
        sample_rate_hz: u32,
        channels: u16,
    },
    PartialTranscript {
        sender: Sender,
        text: String,
    },
    TurnComplete,
    Interrupted,
    ToolCallRequest(ToolCallRequest),
    Closed {
        reason: Option<String>,
    },
    Error(String),
    /// An outbound message could not be delivered (non-fatal)
    SendFailed {
        kind: OutboundKind,
        reason: String,
    },
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr)]
#[strum(serialize_all = "snake_case")]
pub enum OutboundKind {
    Setup,
    AudioFrame,
    Greeting,
    ToolResult,
}

/// Parameters for the opening `setup` message.
#[derive(Debug, Clone, PartialEq)]
pub struct SessionSetup {
    pub model: String,
    pub voice_name: String,
    pub system_instruction: String,
    pub tools: Vec<Value>,
}

impl SessionSetup {
    pub fn from_config(config: &SessionConfig) -> Self {
        Self {
            model: config.model.clone(),
            voice_name: config.voice_name.clone(),
            system_instruction: config.system_instruction.clone(),
            tools: ToolDispatcher::declarations(),
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum OutboundMessage {
    Setup(SessionSetup),
    AudioFrame(EncodedChunk),
    Greeting(String),
    ToolResult(ToolCallResult),
}

impl OutboundMessage {
    pub fn kind(&self) -> OutboundKind {
        match self {
            OutboundMessage::Setup(_) => OutboundKind::Setup,
            OutboundMessage::AudioFrame(_) => OutboundKind::AudioFrame,
            OutboundMessage::Greeting(_) => OutboundKind::Greeting,
            OutboundMessage::ToolResult(_) => OutboundKind::ToolResult,
        }
    }

    pub fn to_json(&self) -> Value {
        match self {
            OutboundMessage::Setup(setup) => json!({
                "setup": {
                    "model": setup.model,
                    "generationConfig": {
                        "responseModalities": ["AUDIO"],
                        "speechConfig": {
                            "voiceConfig": {
                                "prebuiltVoiceConfig": { "voiceName": setup.voice_name }
                            }
                        }
                    },
                    "systemInstruction": {
                        "parts": [{ "text": setup.system_instruction }]
                    },
                    "tools": [{ "functionDeclarations": setup.tools }],
                    "inputAudioTranscription": {},
                    "outputAudioTranscription": {}
                }
            }),
            OutboundMessage::AudioFrame(chunk) => json!({
                "realtimeInput": {
                    "mediaChunks": [{
                        "mimeType": chunk.mime_type,
                        "data": chunk.data
                    }]
                }
            }),
            OutboundMessage::Greeting(text) => json!({
                "clientContent": {
                    "turns": [{ "role": "user", "parts": [{ "text": text }] }],
                    "turnComplete": true
                }
            }),
            OutboundMessage::ToolResult(result) => json!({
                "toolResponse": {
                    "functionResponses": [{
                        "id": result.id,
                        "name": result.name,
                        "response": result.payload()
                    }]
                }
            }),
        }
    }
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase")]
struct ServerMessage {
    setup_complete: Option<Value>,
    server_content: Option<ServerContent>,
    tool_call: Option<ToolCallMessage>,
    go_away: Option<Value>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ServerContent {
    input_transcription: Option<Transcription>,
    output_transcription: Option<Transcription>,
    model_turn: Option<ModelTurn>,
    turn_complete: bool,
    interrupted: bool,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct Transcription {
    text: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct ModelTurn {
    parts: Vec<Part>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct Part {
    inline_data: Option<InlineData>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct InlineData {
    mime_type: String,
    data: String,
}

#[derive(Debug, Default, Deserialize)]
#[serde(rename_all = "camelCase", default)]
struct ToolCallMessage {
    function_calls: Vec<FunctionCall>,
}

#[derive(Debug, Default, Deserialize)]
#[serde(default)]
struct FunctionCall {
    id: Option<String>,
    name: String,
    args: Value,
}

/// Defaults applied to inbound audio that doesn't describe itself.
#[derive(Debug, Clone, Copy)]
pub struct AudioDefaults {
    pub sample_rate_hz: u32,
    pub channels: u16,
}

impl From<&SessionConfig> for AudioDefaults {
    fn from(config: &SessionConfig) -> Self {
        Self {
            sample_rate_hz: config.output_sample_rate_hz,
            channels: config.output_channels,
        }
    }
}

/// Decode one server frame into events, in the order: input transcript,
/// output transcript, turn complete, audio, interrupted, tool calls.
pub fn parse_server_message(
    raw: &[u8],
    defaults: AudioDefaults,
) -> Result<Vec<InboundEvent>, ProtocolError> {
    let text = std::str::from_utf8(raw).map_err(|_| ProtocolError::InvalidString)?;
    let message: ServerMessage =
        serde_json::from_str(text).map_err(|e| ProtocolError::InvalidJson(e.to_string()))?;

    let mut events = Vec::new();

    if message.setup_complete.is_some() {
        events.push(InboundEvent::Opened);
    }

    if let Some(content) = message.server_content {
        if let Some(t) = content.input_transcription.filter(|t| !t.text.is_empty()) {
            events.push(InboundEvent::PartialTranscript {
                sender: Sender::Local,
                text: t.text,
            });
        }
        if let Some(t) = content.output_transcription.filter(|t| !t.text.is_empty()) {
            events.push(InboundEvent::PartialTranscript {
                sender: Sender::Remote,
                text: t.text,
            });
        }
        if content.turn_complete {
            events.push(InboundEvent::TurnComplete);
        }
        if let Some(turn) = content.model_turn {
            for inline in turn.parts.into_iter().filter_map(|p| p.inline_data) {
                if inline.data.is_empty() {
                    continue;
                }
                events.push(InboundEvent::AudioChunk {
                    sample_rate_hz: codec::sample_rate_from_mime(&inline.mime_type)
                        .unwrap_or(defaults.sample_rate_hz),
                    channels: defaults.channels,
                    data: inline.data,
                });
            }
        }
        if content.interrupted {
            events.push(InboundEvent::Interrupted);
        }
    }

    if let Some(tool_call) = message.tool_call {
        for call in tool_call.function_calls {
            events.push(InboundEvent::ToolCallRequest(ToolCallRequest {
                id: call
                    .id
                    .unwrap_or_else(|| uuid::Uuid::new_v4().to_string()),
                name: call.name,
                arguments: call.args,
            }));
        }
    }

    if message.go_away.is_some() {
        log::warn!("Server announced it is going away");
    }

    Ok(events)
}
