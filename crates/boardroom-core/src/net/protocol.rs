use thiserror::Error;

use super::messages::{ClientMessage, KNOWN_CLIENT_TYPES, ServerMessage};
use crate::error::GameError;

/// Default maximum inbound frame size in bytes.
pub const MAX_MESSAGE_SIZE: usize = 16 * 1024;

#[derive(Debug, Error)]
pub enum ProtocolError {
    #[error("empty message")]
    EmptyMessage,
    #[error("payload too large: {size} bytes (max {max})")]
    PayloadTooLarge { size: usize, max: usize },
    #[error("invalid JSON: {0}")]
    InvalidJson(#[source] serde_json::Error),
    #[error("message has no string `type` field")]
    MissingType,
    #[error("malformed `{kind}` message: {source}")]
    Malformed {
        kind: String,
        #[source]
        source: serde_json::Error,
    },
    #[error("serialize error: {0}")]
    Serialize(#[source] serde_json::Error),
}

impl From<ProtocolError> for GameError {
    fn from(e: ProtocolError) -> Self {
        GameError::Validation(e.to_string())
    }
}

/// Decode one inbound text frame.
///
/// Frames whose `type` is not a known client message decode to
/// [`ClientMessage::Unrecognized`] carrying the original text.
pub fn decode_client_message(text: &str, max_size: usize) -> Result<ClientMessage, ProtocolError> {
    if text.is_empty() {
        return Err(ProtocolError::EmptyMessage);
    }
    if text.len() > max_size {
        return Err(ProtocolError::PayloadTooLarge {
            size: text.len(),
            max: max_size,
        });
    }
    let value: serde_json::Value = serde_json::from_str(text).map_err(ProtocolError::InvalidJson)?;
    let kind = value
        .get("type")
        .and_then(|t| t.as_str())
        .ok_or(ProtocolError::MissingType)?
        .to_string();

    if !KNOWN_CLIENT_TYPES.contains(&kind.as_str()) {
        return Ok(ClientMessage::Unrecognized {
            kind,
            raw: text.to_string(),
        });
    }
    serde_json::from_value(value).map_err(|source| ProtocolError::Malformed { kind, source })
}

pub fn encode_server_message(msg: &ServerMessage) -> Result<String, ProtocolError> {
    serde_json::to_string(msg).map_err(ProtocolError::Serialize)
}

/// Decode an outbound event; used by clients and tests.
pub fn decode_server_message(text: &str) -> Result<ServerMessage, ProtocolError> {
    serde_json::from_str(text).map_err(ProtocolError::InvalidJson)
}

/// Encode a client message; used by test clients and tooling.
pub fn encode_client_message(msg: &ClientMessage) -> Result<String, ProtocolError> {
    match msg {
        ClientMessage::Unrecognized { raw, .. } => Ok(raw.clone()),
        other => serde_json::to_string(other).map_err(ProtocolError::Serialize),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::rules::ActionKind;

    fn decode(text: &str) -> Result<ClientMessage, ProtocolError> {
        decode_client_message(text, MAX_MESSAGE_SIZE)
    }

    #[test]
    fn decodes_unit_messages() {
        assert_eq!(decode(r#"{"type":"roll_dice"}"#).unwrap(), ClientMessage::RollDice);
        assert_eq!(decode(r#"{"type":"game:start"}"#).unwrap(), ClientMessage::StartGame);
        assert_eq!(
            decode(r#"{"type":"verify_host","extra":1}"#).unwrap(),
            ClientMessage::VerifyHost
        );
    }

    #[test]
    fn update_player_alias_maps_to_update_player_info() {
        let msg = decode(r#"{"type":"update_player","display_name":"Bob"}"#).unwrap();
        assert_eq!(
            msg,
            ClientMessage::UpdatePlayerInfo {
                display_name: Some("Bob".into()),
                token: None
            }
        );
    }

    #[test]
    fn player_ready_defaults_to_true() {
        let msg = decode(r#"{"type":"player_ready"}"#).unwrap();
        assert_eq!(msg, ClientMessage::PlayerReady { ready: true });
        let msg = decode(r#"{"type":"player_ready","ready":false}"#).unwrap();
        assert_eq!(msg, ClientMessage::PlayerReady { ready: false });
    }

    #[test]
    fn game_action_carries_action_kind() {
        let msg = decode(r#"{"type":"game_action","action":{"kind":"mortgage","position":1}}"#)
            .unwrap();
        assert_eq!(
            msg,
            ClientMessage::GameAction {
                action: ActionKind::Mortgage { position: 1 }
            }
        );
    }

    #[test]
    fn unknown_type_is_kept_verbatim_for_relay() {
        let text = r#"{"type":"chat","text":"hi"}"#;
        match decode(text).unwrap() {
            ClientMessage::Unrecognized { kind, raw } => {
                assert_eq!(kind, "chat");
                assert_eq!(raw, text);
            },
            other => panic!("expected Unrecognized, got {other:?}"),
        }
    }

    #[test]
    fn rejects_bad_frames() {
        assert!(matches!(decode(""), Err(ProtocolError::EmptyMessage)));
        assert!(matches!(decode("not json"), Err(ProtocolError::InvalidJson(_))));
        assert!(matches!(decode(r#"{"x":1}"#), Err(ProtocolError::MissingType)));
        assert!(matches!(
            decode(r#"{"type":"set_host"}"#),
            Err(ProtocolError::Malformed { .. })
        ));
        let big = format!(r#"{{"type":"chat","t":"{}"}}"#, "x".repeat(64));
        assert!(matches!(
            decode_client_message(&big, 32),
            Err(ProtocolError::PayloadTooLarge { .. })
        ));
    }

    #[test]
    fn encoded_server_message_is_tagged() {
        let text = encode_server_message(&ServerMessage::GameDeleted {
            game_id: "g1".into(),
        })
        .unwrap();
        assert_eq!(text, r#"{"type":"game_deleted","game_id":"g1"}"#);
    }

    #[test]
    fn protocol_errors_become_validation_errors() {
        let err: GameError = ProtocolError::MissingType.into();
        assert_eq!(err.code(), "validation");
    }
}
