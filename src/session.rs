use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::image_store::ImageReference;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    User,
    Model,
    Tool,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct ToolCallRequest {
    pub name: String,
    #[serde(default)]
    pub args: Value,
}

impl ToolCallRequest {
    pub fn new(name: impl Into<String>, args: Value) -> Self {
        Self { name: name.into(), args }
    }

    /// `name({..args})` rendering used in transcripts.
    pub fn render(&self) -> String {
        format!("{}({})", self.name, self.args)
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum ToolPayload {
    Text { text: String },
    Image { image: ImageReference, text: String },
}

impl ToolPayload {
    pub fn text(&self) -> &str {
        match self {
            ToolPayload::Text { text } | ToolPayload::Image { text, .. } => text,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
pub struct ToolResult {
    pub tool: String,
    pub ok: bool,
    pub payload: ToolPayload,
}

impl ToolResult {
    pub fn success(tool: impl Into<String>, payload: ToolPayload) -> Self {
        Self { tool: tool.into(), ok: true, payload }
    }

    pub fn failure(tool: impl Into<String>, text: impl Into<String>) -> Self {
        Self { tool: tool.into(), ok: false, payload: ToolPayload::Text { text: text.into() } }
    }

    pub fn image(&self) -> Option<&ImageReference> {
        match &self.payload {
            ToolPayload::Image { image, .. } => Some(image),
            ToolPayload::Text { .. } => None,
        }
    }
}

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum TurnContent {
    Text { text: String },
    /// The opening user turn: the target image plus the investigative prompt.
    ImagePrompt { image: ImageReference, text: String },
    ToolCall {
        #[serde(skip_serializing_if = "Option::is_none")]
        reasoning: Option<String>,
        request: ToolCallRequest,
    },
    ToolResult { result: ToolResult },
}

/// One immutable entry of the conversation history.
#[derive(Debug, Clone, Serialize)]
pub struct Turn {
    pub id: Uuid,
    pub role: Role,
    pub content: TurnContent,
    pub created_at: DateTime<Utc>,
}

impl Turn {
    pub fn new(role: Role, content: TurnContent) -> Self {
        Self { id: Uuid::new_v4(), role, content, created_at: Utc::now() }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "state", content = "reason", rename_all = "snake_case")]
pub enum SessionState {
    Idle,
    AwaitingModel,
    DispatchingTool,
    Complete,
    Failed(String),
    Aborted,
}

impl SessionState {
    pub fn is_terminal(&self) -> bool {
        matches!(self, SessionState::Complete | SessionState::Failed(_) | SessionState::Aborted)
    }

    pub fn label(&self) -> &'static str {
        match self {
            SessionState::Idle => "idle",
            SessionState::AwaitingModel => "awaiting_model",
            SessionState::DispatchingTool => "dispatching_tool",
            SessionState::Complete => "complete",
            SessionState::Failed(_) => "failed",
            SessionState::Aborted => "aborted",
        }
    }
}

/// One investigation. The history is append-only; turns are never edited.
#[derive(Debug, Clone, Serialize)]
pub struct Session {
    pub id: Uuid,
    pub image_ref: String,
    pub created_at: DateTime<Utc>,
    pub state: SessionState,
    history: Vec<Turn>,
}

impl Session {
    pub fn new(image_ref: impl Into<String>) -> Self {
        Self {
            id: Uuid::new_v4(),
            image_ref: image_ref.into(),
            created_at: Utc::now(),
            state: SessionState::Idle,
            history: Vec::new(),
        }
    }

    pub fn append(&mut self, role: Role, content: TurnContent) -> &Turn {
        self.history.push(Turn::new(role, content));
        &self.history[self.history.len() - 1]
    }

    pub fn history(&self) -> &[Turn] {
        &self.history
    }

    pub fn last_turn(&self) -> Option<&Turn> {
        self.history.last()
    }
}
