//! Message types for the Claude Code NDJSON protocol.

use serde_json::Value;

/// Canonical message types read from the agent's stdout.
#[derive(Debug, Clone, PartialEq)]
pub enum Message {
    SystemInit(SystemInit),
    Assistant(AssistantMessage),
    User(UserMessage),
    StreamEvent(StreamEvent),
    Result(TurnResult),
    Unknown { msg_type: String, payload: Value },
}

/// `system`/`init` message sent once per process.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SystemInit {
    pub session_id: String,
    pub model: String,
}

/// Complete assistant message.
#[derive(Debug, Clone, PartialEq)]
pub struct AssistantMessage {
    pub content: Vec<ContentBlock>,
}

/// Content block in an assistant message.
#[derive(Debug, Clone, PartialEq)]
pub enum ContentBlock {
    Text {
        text: String,
    },
    ToolUse {
        id: String,
        name: String,
        input: Value,
    },
}

/// User message (tool results echo).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct UserMessage {
    pub content: Vec<ToolResult>,
}

/// Tool execution result.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ToolResult {
    pub tool_use_id: String,
    pub content: String,
    pub is_error: bool,
}

/// Partial-message streaming event.
#[derive(Debug, Clone, PartialEq)]
pub enum StreamEvent {
    TextDelta(String),
    MessageStart,
    MessageStop,
    Other,
}

/// End-of-turn result.
#[derive(Debug, Clone, PartialEq)]
pub struct TurnResult {
    pub subtype: ResultSubtype,
    pub session_id: String,
    pub is_error: bool,
    pub errors: Vec<String>,
    /// Final text of the turn, when the agent reports one.
    pub result: Option<String>,
    pub duration_ms: u64,
}

impl TurnResult {
    /// Whether the result reports a real failure.
    ///
    /// `is_error` alone is not trusted: the agent sometimes sets it together
    /// with a `success` subtype and no error messages.
    pub fn is_failure(&self) -> bool {
        self.is_error && (self.subtype != ResultSubtype::Success || !self.errors.is_empty())
    }

    /// Human-readable failure message.
    pub fn error_message(&self) -> String {
        if self.errors.is_empty() {
            format!("agent turn failed ({:?})", self.subtype)
        } else {
            self.errors.join("; ")
        }
    }
}

/// Result subtype.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub enum ResultSubtype {
    #[default]
    Success,
    Error,
    Unknown(String),
}
