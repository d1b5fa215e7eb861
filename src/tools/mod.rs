//! Remote tool calls: a closed set of named actions, each routed to one
//! injected application callback.

use crate::error::SessionError;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use std::collections::HashSet;
use std::sync::Arc;
use strum::{AsRefStr, Display, EnumIter, EnumString, IntoEnumIterator};

/// Quiz card shown alongside the conversation.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct QuizState {
    pub current_question_index: u32,
    pub total_questions: u32,
    pub question_text: String,
    pub options: Vec<String>,
    pub topic: Option<String>,
    pub is_complete: bool,
    pub correct_answer_index: Option<u32>,
}

/// Application side effects the engine can trigger. Each call is a pure
/// notification; the engine never reads application state back.
pub trait ConsultationHooks: Send + Sync {
    fn on_quiz_state_change(&self, state: QuizState);
    fn on_content_proposed(&self, section: &str, content: &str, rationale: &str);
    fn on_section_highlighted(&self, section: &str, description: &str);
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Display, AsRefStr, EnumString, EnumIter)]
pub enum ToolName {
    #[strum(serialize = "updateQuizState")]
    UpdateQuizState,
    #[strum(serialize = "proposeCanvasEntry")]
    ProposeCanvasEntry,
    #[strum(serialize = "highlightCanvasSection")]
    HighlightCanvasSection,
}

#[derive(Debug, Clone, PartialEq)]
pub enum ToolCall {
    UpdateQuizState(QuizState),
    ProposeCanvasEntry {
        section: String,
        content: String,
        rationale: String,
    },
    HighlightCanvasSection {
        section_name: String,
        description: String,
    },
}

fn string_arg(args: &Value, key: &str) -> String {
    args.get(key)
        .and_then(|v| v.as_str())
        .unwrap_or_default()
        .to_string()
}

/// The service sends JSON numbers, which may arrive as `2` or `2.0`.
fn index_arg(args: &Value, key: &str) -> Option<u32> {
    let value = args.get(key)?;
    value
        .as_u64()
        .or_else(|| value.as_f64().filter(|f| *f >= 0.0).map(|f| f as u64))
        .map(|n| n.min(u32::MAX as u64) as u32)
}

impl ToolCall {
    /// Resolve a request name and its arguments. Missing or mistyped
    /// arguments fall back to empty values; only the name can fail.
    pub fn parse(name: &str, args: &Value) -> Result<Self, SessionError> {
        let tool: ToolName = name
            .parse()
            .map_err(|_| SessionError::UnknownTool(name.to_string()))?;

        Ok(match tool {
            ToolName::UpdateQuizState => ToolCall::UpdateQuizState(QuizState {
                current_question_index: index_arg(args, "currentQuestionIndex").unwrap_or(0),
                total_questions: index_arg(args, "totalQuestions").unwrap_or(0),
                question_text: string_arg(args, "questionText"),
                options: args
                    .get("options")
                    .and_then(|v| v.as_array())
                    .map(|items| {
                        items
                            .iter()
                            .filter_map(|i| i.as_str().map(str::to_string))
                            .collect()
                    })
                    .unwrap_or_default(),
                topic: args.get("topic").and_then(|v| v.as_str()).map(str::to_string),
                is_complete: args
                    .get("isComplete")
                    .and_then(|v| v.as_bool())
                    .unwrap_or(false),
                correct_answer_index: index_arg(args, "correctAnswerIndex"),
            }),
            ToolName::ProposeCanvasEntry => ToolCall::ProposeCanvasEntry {
                section: string_arg(args, "section"),
                content: string_arg(args, "content"),
                rationale: string_arg(args, "rationale"),
            },
            ToolName::HighlightCanvasSection => ToolCall::HighlightCanvasSection {
                section_name: string_arg(args, "sectionName"),
                description: string_arg(args, "description"),
            },
        })
    }

    pub fn name(&self) -> ToolName {
        match self {
            ToolCall::UpdateQuizState(_) => ToolName::UpdateQuizState,
            ToolCall::ProposeCanvasEntry { .. } => ToolName::ProposeCanvasEntry,
            ToolCall::HighlightCanvasSection { .. } => ToolName::HighlightCanvasSection,
        }
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallRequest {
    pub id: String,
    pub name: String,
    pub arguments: Value,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, Display)]
#[serde(rename_all = "lowercase")]
#[strum(serialize_all = "lowercase")]
pub enum ToolStatus {
    Success,
    Error,
}

#[derive(Debug, Clone, PartialEq)]
pub struct ToolCallResult {
    pub id: String,
    pub name: String,
    pub status: ToolStatus,
    pub message: String,
}

impl ToolCallResult {
    /// Body carried back to the service as the function response.
    pub fn payload(&self) -> Value {
        json!({
            "result": {
                "status": self.status,
                "message": self.message,
            }
        })
    }
}

pub struct ToolDispatcher {
    hooks: Arc<dyn ConsultationHooks>,
    answered: HashSet<String>,
}

impl ToolDispatcher {
    pub fn new(hooks: Arc<dyn ConsultationHooks>) -> Self {
        Self {
            hooks,
            answered: HashSet::new(),
        }
    }

    /// Forget answered ids; called when a new session starts.
    pub fn reset(&mut self) {
        self.answered.clear();
    }

    /// Apply the request and build its result. Returns `None` for an id that
    /// was already answered so each id gets exactly one result.
    pub fn dispatch(&mut self, request: &ToolCallRequest) -> Option<ToolCallResult> {
        if !self.answered.insert(request.id.clone()) {
            log::warn!(
                "Tool call {} ({}) already answered, dropping duplicate",
                request.id,
                request.name
            );
            return None;
        }

        let (status, message) = match ToolCall::parse(&request.name, &request.arguments) {
            Ok(call) => (ToolStatus::Success, self.apply(call)),
            Err(e) => {
                log::warn!("Tool call {} rejected: {}", request.id, e);
                (
                    ToolStatus::Error,
                    format!("Consultation parameter mismatch: unknown tool '{}'", request.name),
                )
            }
        };

        Some(ToolCallResult {
            id: request.id.clone(),
            name: request.name.clone(),
            status,
            message,
        })
    }

    fn apply(&self, call: ToolCall) -> String {
        log::info!("🛠️ Applying tool call: {}", call.name());
        match call {
            ToolCall::UpdateQuizState(state) => {
                self.hooks.on_quiz_state_change(state);
                "Strategic UI synchronized".to_string()
            }
            ToolCall::ProposeCanvasEntry {
                section,
                content,
                rationale,
            } => {
                self.hooks.on_content_proposed(&section, &content, &rationale);
                "Proposal displayed to user for approval".to_string()
            }
            ToolCall::HighlightCanvasSection {
                section_name,
                description,
            } => {
                self.hooks.on_section_highlighted(&section_name, &description);
                format!("Displaying definition for {}", section_name)
            }
        }
    }

    /// Function declarations advertised to the service in the session setup.
    pub fn declarations() -> Vec<Value> {
        ToolName::iter().map(declaration).collect()
    }
}

fn declaration(tool: ToolName) -> Value {
    match tool {
        ToolName::UpdateQuizState => json!({
            "name": tool.as_ref(),
            "description": "Updates the visual quiz card with a new question or status during the strategy session.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "currentQuestionIndex": { "type": "NUMBER" },
                    "totalQuestions": { "type": "NUMBER" },
                    "questionText": { "type": "STRING" },
                    "options": { "type": "ARRAY", "items": { "type": "STRING" } },
                    "topic": { "type": "STRING" },
                    "isComplete": { "type": "BOOLEAN" },
                    "correctAnswerIndex": {
                        "type": "NUMBER",
                        "description": "Index of the correct option (0-based)"
                    }
                },
                "required": ["currentQuestionIndex", "totalQuestions", "questionText", "options", "correctAnswerIndex"]
            }
        }),
        ToolName::ProposeCanvasEntry => json!({
            "name": tool.as_ref(),
            "description": "Proposes content for a specific section of the Business Model Canvas based on user discussion.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "section": {
                        "type": "STRING",
                        "description": "The exact name of the section (e.g., 'Problem', 'Solution', 'Customer Segments')"
                    },
                    "content": {
                        "type": "STRING",
                        "description": "The proposed text content for the section"
                    },
                    "rationale": {
                        "type": "STRING",
                        "description": "Brief explanation of why this content is being proposed"
                    }
                },
                "required": ["section", "content", "rationale"]
            }
        }),
        ToolName::HighlightCanvasSection => json!({
            "name": tool.as_ref(),
            "description": "Visually highlights and defines a specific section of the Business Model Canvas on the user's screen.",
            "parameters": {
                "type": "OBJECT",
                "properties": {
                    "sectionName": {
                        "type": "STRING",
                        "description": "Name of the section (e.g., Value Propositions)"
                    },
                    "description": {
                        "type": "STRING",
                        "description": "Educational definition or tip for this section."
                    }
                },
                "required": ["sectionName", "description"]
            }
        }),
    }
}
