//! Text encoding of [`BridgeMessage`].

use serde_json::Value;

use super::types::{BridgeMessage, MESSAGE_TYPES};

/// Errors decoding or encoding a bridge frame.
#[derive(Debug, thiserror::Error)]
pub enum CodecError {
    #[error("frame has no 'type' discriminator")]
    MissingType,

    #[error("unknown message type '{0}'")]
    UnknownType(String),

    #[error("malformed frame: {0}")]
    Malformed(#[from] serde_json::Error),
}

/// Serialize a message to a single-line JSON frame.
pub fn encode(message: &BridgeMessage) -> Result<String, CodecError> {
    Ok(serde_json::to_string(message)?)
}

/// Parse a JSON frame.
///
/// The discriminator is checked before the payload so an unknown `type` is
/// reported as [`CodecError::UnknownType`] rather than a generic serde error.
pub fn decode(frame: &str) -> Result<BridgeMessage, CodecError> {
    let raw: Value = serde_json::from_str(frame)?;
    let msg_type = raw
        .get("type")
        .and_then(Value::as_str)
        .ok_or(CodecError::MissingType)?;
    if !MESSAGE_TYPES.contains(&msg_type) {
        return Err(CodecError::UnknownType(msg_type.to_string()));
    }
    Ok(serde_json::from_value(raw)?)
}

#[cfg(test)]
#[allow(clippy::panic, clippy::expect_used, clippy::unwrap_used)]
mod tests {
    use super::*;
    use crate::protocol::{ChatRole, SessionState};
    use serde_json::json;

    fn round_trip(message: &BridgeMessage) -> BridgeMessage {
        decode(&encode(message).unwrap()).unwrap()
    }

    #[test]
    fn every_variant_round_trips() {
        let messages = [
            BridgeMessage::state(SessionState {
                is_connected: true,
                is_session_active: true,
                is_busy: false,
                current_intent: Some("Reading files".into()),
            }),
            BridgeMessage::chat(ChatRole::User, "héllo \"quoted\"\nnext", false),
            BridgeMessage::chat_delta(""),
            BridgeMessage::send_prompt("fix the build"),
            BridgeMessage::tool_completed("Bash", Some("ok".into())),
            BridgeMessage::tool_started("Read"),
        ];
        for message in &messages {
            assert_eq!(&round_trip(message), message);
        }
    }

    #[test]
    fn varied_field_values_round_trip() {
        let long = "x".repeat(64 * 1024);
        let texts: [&str; 6] = [
            "",
            " ",
            "emoji 🚀 and 中文",
            "tab\tquote\"back\\slash",
            "\u{0}\u{1b}[0m",
            long.as_str(),
        ];
        for text in texts {
            let intent = (!text.is_empty()).then(|| text.to_string());
            let messages = [
                BridgeMessage::state(SessionState {
                    is_connected: text.is_empty(),
                    is_session_active: !text.is_empty(),
                    is_busy: true,
                    current_intent: intent.clone(),
                }),
                BridgeMessage::chat(ChatRole::Assistant, text, false),
                BridgeMessage::chat(ChatRole::System, text, true),
                BridgeMessage::chat_delta(text),
                BridgeMessage::send_prompt(text),
                BridgeMessage::tool_started(text),
                BridgeMessage::tool_completed(text, intent),
            ];
            for message in &messages {
                let frame = encode(message).unwrap();
                assert!(!frame.contains('\n'), "frame stays on one line");
                assert_eq!(&decode(&frame).unwrap(), message);
            }
        }
    }

    #[test]
    fn wire_shape_is_camel_case() {
        let frame = encode(&BridgeMessage::state(SessionState {
            is_connected: true,
            is_session_active: false,
            is_busy: false,
            current_intent: None,
        }))
        .unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(
            value,
            json!({"type":"sessionState","isConnected":true,"isSessionActive":false,"isBusy":false})
        );

        let frame = encode(&BridgeMessage::tool_started("Edit")).unwrap();
        let value: Value = serde_json::from_str(&frame).unwrap();
        assert_eq!(value, json!({"type":"toolEvent","toolName":"Edit","isStart":true}));
    }

    #[test]
    fn null_optional_fields_decode() {
        let msg = decode(
            r#"{"type":"sessionState","isConnected":true,"isSessionActive":true,"isBusy":true,"currentIntent":null}"#,
        )
        .unwrap();
        assert!(matches!(msg, BridgeMessage::SessionState(s) if s.current_intent.is_none()));
    }

    #[test]
    fn unknown_fields_are_ignored() {
        let msg = decode(r#"{"type":"sendPrompt","prompt":"hi","clientVersion":3}"#).unwrap();
        assert_eq!(msg, BridgeMessage::send_prompt("hi"));
    }

    #[test]
    fn unknown_type_is_rejected() {
        let err = decode(r#"{"type":"ping"}"#).unwrap_err();
        assert!(matches!(err, CodecError::UnknownType(t) if t == "ping"));
    }

    #[test]
    fn missing_type_is_rejected() {
        assert!(matches!(
            decode(r#"{"prompt":"hi"}"#),
            Err(CodecError::MissingType)
        ));
    }

    #[test]
    fn known_type_with_bad_fields_is_malformed() {
        assert!(matches!(
            decode(r#"{"type":"sendPrompt","prompt":42}"#),
            Err(CodecError::Malformed(_))
        ));
        assert!(matches!(decode("not json"), Err(CodecError::Malformed(_))));
    }
}
