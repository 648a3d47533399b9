//! Bridge message types.

use serde::{Deserialize, Serialize};

/// Discriminator values accepted on the wire.
pub const MESSAGE_TYPES: [&str; 4] = ["sessionState", "chatMessage", "sendPrompt", "toolEvent"];

/// A message exchanged between the bridge server and its clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum BridgeMessage {
    /// Server to client: replicated session status.
    SessionState(SessionState),
    /// Server to client: a chat entry or streamed fragment.
    ChatMessage(ChatMessage),
    /// Client to server: submit a prompt to the host session.
    SendPrompt(SendPrompt),
    /// Server to client: tool invocation started or finished.
    ToolEvent(ToolEvent),
}

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionState {
    pub is_connected: bool,
    pub is_session_active: bool,
    pub is_busy: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub current_intent: Option<String>,
}

/// Author of a chat entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ChatRole {
    User,
    Assistant,
    System,
}

impl ChatRole {
    pub const fn as_str(self) -> &'static str {
        match self {
            Self::User => "user",
            Self::Assistant => "assistant",
            Self::System => "system",
        }
    }
}

impl std::fmt::Display for ChatRole {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChatMessage {
    pub role: ChatRole,
    pub content: String,
    #[serde(default)]
    pub is_delta: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SendPrompt {
    pub prompt: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToolEvent {
    pub tool_name: String,
    pub is_start: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub result: Option<String>,
}

impl BridgeMessage {
    pub const fn state(state: SessionState) -> Self {
        Self::SessionState(state)
    }

    pub fn chat(role: ChatRole, content: impl Into<String>, is_delta: bool) -> Self {
        Self::ChatMessage(ChatMessage {
            role,
            content: content.into(),
            is_delta,
        })
    }

    /// Streamed assistant fragment.
    pub fn chat_delta(text: impl Into<String>) -> Self {
        Self::chat(ChatRole::Assistant, text, true)
    }

    pub fn send_prompt(prompt: impl Into<String>) -> Self {
        Self::SendPrompt(SendPrompt {
            prompt: prompt.into(),
        })
    }

    pub fn tool_started(tool_name: impl Into<String>) -> Self {
        Self::ToolEvent(ToolEvent {
            tool_name: tool_name.into(),
            is_start: true,
            result: None,
        })
    }

    pub fn tool_completed(tool_name: impl Into<String>, result: Option<String>) -> Self {
        Self::ToolEvent(ToolEvent {
            tool_name: tool_name.into(),
            is_start: false,
            result,
        })
    }

    /// Wire discriminator of this message.
    pub const fn type_name(&self) -> &'static str {
        match self {
            Self::SessionState(_) => MESSAGE_TYPES[0],
            Self::ChatMessage(_) => MESSAGE_TYPES[1],
            Self::SendPrompt(_) => MESSAGE_TYPES[2],
            Self::ToolEvent(_) => MESSAGE_TYPES[3],
        }
    }
}
