//! NDJSON to session event bridge.
//!
//! Converts stream-json messages from the agent's stdout into
//! [`SessionEvent`]s.

use std::collections::HashMap;

use serde_json::Value;
use tandem_core::ndjson::{
    AssistantMessage, ContentBlock, Message, StreamEvent, TurnResult, UserMessage,
};
use tracing::{debug, warn};

use crate::agent::types::SessionEvent;

/// Tool whose input announces what the agent is currently doing.
const TODO_TOOL: &str = "TodoWrite";

/// Stateful translator for one agent process.
#[derive(Debug, Default)]
pub struct EventBridge {
    /// Pending tool calls (id -> name) for matching results.
    pending_tools: HashMap<String, String>,
}

impl EventBridge {
    pub fn new() -> Self {
        Self::default()
    }

    /// Convert one NDJSON message. Some messages produce several events.
    pub fn convert(&mut self, msg: Message) -> Vec<SessionEvent> {
        match msg {
            Message::SystemInit(init) => {
                debug!(session_id = %init.session_id, model = %init.model, "Agent initialised");
                vec![]
            }
            Message::StreamEvent(StreamEvent::TextDelta(text)) if !text.is_empty() => {
                vec![SessionEvent::ContentDelta(text)]
            }
            Message::StreamEvent(_) => vec![],
            Message::Assistant(assistant) => self.handle_assistant(assistant),
            Message::User(user) => self.handle_user(user),
            Message::Result(result) => Self::handle_result(&result),
            Message::Unknown { msg_type, .. } => {
                warn!(msg_type, "Unknown NDJSON message type");
                vec![]
            }
        }
    }

    fn handle_assistant(&mut self, msg: AssistantMessage) -> Vec<SessionEvent> {
        let mut events = Vec::new();
        for block in msg.content {
            match block {
                ContentBlock::Text { text } if !text.is_empty() => {
                    events.push(SessionEvent::ContentComplete(text));
                }
                ContentBlock::Text { .. } => {}
                ContentBlock::ToolUse { id, name, input } => {
                    if name == TODO_TOOL
                        && let Some(label) = active_todo(&input)
                    {
                        events.push(SessionEvent::IntentChanged(label));
                    }
                    self.pending_tools.insert(id, name.clone());
                    events.push(SessionEvent::ToolStarted { name });
                }
            }
        }
        events
    }

    fn handle_user(&mut self, user: UserMessage) -> Vec<SessionEvent> {
        user.content
            .into_iter()
            .map(|tr| {
                let name = self
                    .pending_tools
                    .remove(&tr.tool_use_id)
                    .unwrap_or_else(|| "unknown".to_string());
                let result = (!tr.content.is_empty()).then_some(tr.content);
                SessionEvent::ToolCompleted { name, result }
            })
            .collect()
    }

    fn handle_result(result: &TurnResult) -> Vec<SessionEvent> {
        if result.is_failure() {
            warn!(errors = ?result.errors, "Agent result indicates error");
            vec![SessionEvent::Error(result.error_message())]
        } else {
            if result.is_error {
                warn!(
                    subtype = ?result.subtype,
                    "Result has is_error=true but subtype=Success with no errors, ignoring"
                );
            }
            vec![SessionEvent::TurnIdle]
        }
    }
}

/// `activeForm` of the first in-progress todo, if any.
fn active_todo(input: &Value) -> Option<String> {
    input
        .get("todos")?
        .as_array()?
        .iter()
        .find(|todo| todo.get("status").and_then(Value::as_str) == Some("in_progress"))
        .and_then(|todo| {
            todo.get("activeForm")
                .or_else(|| todo.get("content"))
                .and_then(Value::as_str)
        })
        .map(String::from)
}
