//! NDJSON parser for the Claude Code protocol.
//!
//! Implements tolerant reader pattern: unknown fields ignored, unknown types
//! surfaced as [`Message::Unknown`].

use serde_json::{Value, json};

use super::types::*;
use crate::error::{Error, Result};

/// Parse a single NDJSON line from the agent's stdout.
pub fn parse_line(line: &str) -> Result<Message> {
    let raw: Value = serde_json::from_str(line)?;
    parse_value(&raw)
}

/// Parse a JSON value into a canonical message.
pub fn parse_value(raw: &Value) -> Result<Message> {
    let msg_type = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or_else(|| Error::NdjsonParse("Missing 'type' field".into()))?;

    match msg_type {
        "system" => Ok(parse_system(raw)),
        "assistant" => Ok(parse_assistant(raw)),
        "user" => Ok(parse_user(raw)),
        "stream_event" => Ok(parse_stream_event(raw)),
        "result" => Ok(parse_result(raw)),
        _ => Ok(Message::Unknown {
            msg_type: msg_type.to_string(),
            payload: raw.clone(),
        }),
    }
}

/// Encode a prompt as a stream-json user message line for the agent's stdin.
pub fn user_message_line(session_id: &str, prompt: &str) -> String {
    json!({
        "type": "user",
        "message": { "role": "user", "content": prompt },
        "session_id": session_id,
        "parent_tool_use_id": null,
    })
    .to_string()
}

fn str_field(raw: &Value, key: &str) -> String {
    raw.get(key)
        .and_then(Value::as_str)
        .unwrap_or_default()
        .to_string()
}

fn parse_system(raw: &Value) -> Message {
    Message::SystemInit(SystemInit {
        session_id: str_field(raw, "session_id"),
        model: str_field(raw, "model"),
    })
}

fn parse_assistant(raw: &Value) -> Message {
    let msg = raw.get("message").unwrap_or(raw);
    let content = msg
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| blocks.iter().filter_map(parse_content_block).collect())
        .unwrap_or_default();
    Message::Assistant(AssistantMessage { content })
}

fn parse_content_block(block: &Value) -> Option<ContentBlock> {
    match block.get("type")?.as_str()? {
        "text" => Some(ContentBlock::Text {
            text: block.get("text")?.as_str()?.to_string(),
        }),
        "tool_use" => Some(ContentBlock::ToolUse {
            id: block.get("id")?.as_str()?.to_string(),
            name: block.get("name")?.as_str()?.to_string(),
            input: block.get("input").cloned().unwrap_or(Value::Null),
        }),
        _ => None,
    }
}

fn parse_user(raw: &Value) -> Message {
    let msg = raw.get("message").unwrap_or(raw);
    let content = msg
        .get("content")
        .and_then(Value::as_array)
        .map(|blocks| blocks.iter().filter_map(parse_tool_result).collect())
        .unwrap_or_default();
    Message::User(UserMessage { content })
}

fn parse_tool_result(block: &Value) -> Option<ToolResult> {
    if block.get("type")?.as_str()? != "tool_result" {
        return None;
    }
    Some(ToolResult {
        tool_use_id: block.get("tool_use_id")?.as_str()?.to_string(),
        content: tool_result_text(block.get("content")),
        is_error: block
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
    })
}

/// Tool result content is either a string or an array of text blocks.
fn tool_result_text(content: Option<&Value>) -> String {
    match content {
        Some(Value::String(s)) => s.clone(),
        Some(Value::Array(parts)) => parts
            .iter()
            .filter_map(|p| p.get("text").and_then(Value::as_str))
            .collect::<Vec<_>>()
            .join("\n"),
        _ => String::new(),
    }
}

fn parse_stream_event(raw: &Value) -> Message {
    let event = raw.get("event").unwrap_or(raw);
    let stream = match event.get("type").and_then(Value::as_str).unwrap_or("") {
        "content_block_delta" => {
            let delta = event.get("delta");
            match delta.and_then(|d| d.get("type")).and_then(Value::as_str) {
                Some("text_delta") => StreamEvent::TextDelta(
                    delta
                        .and_then(|d| d.get("text"))
                        .and_then(Value::as_str)
                        .unwrap_or_default()
                        .to_string(),
                ),
                _ => StreamEvent::Other,
            }
        }
        "message_start" => StreamEvent::MessageStart,
        "message_stop" => StreamEvent::MessageStop,
        _ => StreamEvent::Other,
    };
    Message::StreamEvent(stream)
}

fn parse_result(raw: &Value) -> Message {
    let subtype = match raw.get("subtype").and_then(Value::as_str) {
        Some("success") | None => ResultSubtype::Success,
        Some("error") => ResultSubtype::Error,
        Some(other) => ResultSubtype::Unknown(other.to_string()),
    };
    let errors = raw
        .get("errors")
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(|v| v.as_str().map(String::from))
                .collect()
        })
        .unwrap_or_default();

    Message::Result(TurnResult {
        subtype,
        session_id: str_field(raw, "session_id"),
        is_error: raw
            .get("is_error")
            .and_then(Value::as_bool)
            .unwrap_or(false),
        errors,
        result: raw.get("result").and_then(Value::as_str).map(String::from),
        duration_ms: raw
            .get("duration_ms")
            .and_then(Value::as_u64)
            .unwrap_or_default(),
    })
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;

    #[test]
    fn parse_system_init() {
        let json = r#"{"type":"system","subtype":"init","session_id":"abc123","model":"claude-sonnet-4","cwd":"/home/user","tools":[]}"#;
        let Message::SystemInit(init) = parse_line(json).unwrap() else {
            panic!("expected system init");
        };
        assert_eq!(init.session_id, "abc123");
        assert_eq!(init.model, "claude-sonnet-4");
    }

    #[test]
    fn text_delta_is_extracted() {
        let json = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":0,"delta":{"type":"text_delta","text":"Hel"}}}"#;
        assert_eq!(
            parse_line(json).unwrap(),
            Message::StreamEvent(StreamEvent::TextDelta("Hel".into()))
        );
    }

    #[test]
    fn input_json_delta_is_other() {
        let json = r#"{"type":"stream_event","event":{"type":"content_block_delta","index":1,"delta":{"type":"input_json_delta","partial_json":"{"}}}"#;
        assert_eq!(
            parse_line(json).unwrap(),
            Message::StreamEvent(StreamEvent::Other)
        );
    }

    #[test]
    fn assistant_blocks_keep_order() {
        let json = r#"{"type":"assistant","message":{"content":[{"type":"text","text":"Running it."},{"type":"tool_use","id":"t1","name":"Bash","input":{"command":"ls"}},{"type":"thinking","thinking":"..."}]}}"#;
        let Message::Assistant(msg) = parse_line(json).unwrap() else {
            panic!("expected assistant");
        };
        assert_eq!(msg.content.len(), 2);
        assert!(matches!(&msg.content[0], ContentBlock::Text { text } if text == "Running it."));
        assert!(matches!(&msg.content[1], ContentBlock::ToolUse { name, .. } if name == "Bash"));
    }

    #[test]
    fn tool_result_array_content_is_joined() {
        let json = r#"{"type":"user","message":{"content":[{"type":"tool_result","tool_use_id":"t1","content":[{"type":"text","text":"a"},{"type":"text","text":"b"}]}]}}"#;
        let Message::User(user) = parse_line(json).unwrap() else {
            panic!("expected user");
        };
        assert_eq!(user.content[0].content, "a\nb");
        assert!(!user.content[0].is_error);
    }

    #[test]
    fn spurious_is_error_is_not_a_failure() {
        let json = r#"{"type":"result","subtype":"success","is_error":true,"session_id":"s"}"#;
        let Message::Result(result) = parse_line(json).unwrap() else {
            panic!("expected result");
        };
        assert!(!result.is_failure());
    }

    #[test]
    fn error_result_carries_messages() {
        let json = r#"{"type":"result","subtype":"error_during_execution","is_error":true,"errors":["boom","again"]}"#;
        let Message::Result(result) = parse_line(json).unwrap() else {
            panic!("expected result");
        };
        assert!(result.is_failure());
        assert_eq!(result.error_message(), "boom; again");
    }

    #[test]
    fn missing_type_is_parse_error() {
        assert!(matches!(
            parse_line(r#"{"session_id":"x"}"#),
            Err(Error::NdjsonParse(_))
        ));
    }

    #[test]
    fn unknown_type_returns_unknown_message() {
        let json = r#"{"type":"future_type","data":"something"}"#;
        assert!(matches!(
            parse_line(json).unwrap(),
            Message::Unknown { msg_type, .. } if msg_type == "future_type"
        ));
    }

    #[test]
    fn user_line_is_single_line_json() {
        let line = user_message_line("sess", "multi\nline");
        assert!(!line.contains('\n'));
        let value: Value = serde_json::from_str(&line).unwrap();
        assert_eq!(value["message"]["content"], "multi\nline");
        assert_eq!(value["session_id"], "sess");
    }
}
