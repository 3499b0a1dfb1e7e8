//! Relay channel envelope exchanged between the hub and follower clients.

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use thiserror::Error;

pub const DEFAULT_NAMESPACE: &str = "/lib-rubydebug";
pub const DEFAULT_MAX_FRAME_BYTES: usize = 256 * 1024;

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct RelayEnvelope {
    /// Set on requests that expect an ack, echoed back on the ack.
    #[serde(skip_serializing_if = "Option::is_none")]
    #[serde(default)]
    pub request_id: Option<u64>,
    #[serde(flatten)]
    pub msg: RelayMsg,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(tag = "type", content = "payload", rename_all = "kebab-case")]
pub enum RelayMsg {
    ConnectClient(ConnectClientPayload),
    DisconnectClient(DisconnectClientPayload),
    Command(CommandPayload),
    Event(EventPayload),
    Ack(AckPayload),
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct ConnectClientPayload {
    pub id: String,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct DisconnectClientPayload {}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct CommandPayload {
    pub session: String,
    pub name: String,
    #[serde(default)]
    pub args: Vec<String>,
    #[serde(default)]
    pub data: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct EventPayload {
    pub session: String,
    #[serde(rename = "type")]
    pub kind: String,
    #[serde(default)]
    pub args: Value,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize, PartialEq, Eq)]
pub struct AckPayload {
    #[serde(default)]
    pub transaction_id: Option<String>,
    #[serde(default)]
    pub error: Option<RelayError>,
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct RelayError {
    pub code: String,
    pub message: String,
}

impl RelayEnvelope {
    pub fn new(msg: RelayMsg) -> Self {
        Self {
            request_id: None,
            msg,
        }
    }

    pub fn request(request_id: u64, msg: RelayMsg) -> Self {
        Self {
            request_id: Some(request_id),
            msg,
        }
    }

    pub fn ack(request_id: Option<u64>, transaction_id: Option<String>) -> Self {
        Self {
            request_id,
            msg: RelayMsg::Ack(AckPayload {
                transaction_id,
                error: None,
            }),
        }
    }

    pub fn nack(request_id: Option<u64>, code: &str, message: impl Into<String>) -> Self {
        Self {
            request_id,
            msg: RelayMsg::Ack(AckPayload {
                transaction_id: None,
                error: Some(RelayError {
                    code: code.to_string(),
                    message: message.into(),
                }),
            }),
        }
    }

    pub fn event(session: &str, kind: String, args: Value) -> Self {
        Self::new(RelayMsg::Event(EventPayload {
            session: session.to_string(),
            kind,
            args,
        }))
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum FrameError {
    #[error("frame exceeds max size: {size} > {max}")]
    OversizedFrame { size: usize, max: usize },
    #[error("frame encode failed: {0}")]
    Encode(String),
    #[error("frame decode failed: {0}")]
    Decode(String),
}

pub fn encode_frame<T: Serialize>(value: &T, max_frame_bytes: usize) -> Result<String, FrameError> {
    let encoded = serde_json::to_string(value).map_err(|err| FrameError::Encode(err.to_string()))?;
    if encoded.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: encoded.len(),
            max: max_frame_bytes,
        });
    }
    Ok(encoded)
}

pub fn decode_frame<T: DeserializeOwned>(raw: &str, max_frame_bytes: usize) -> Result<T, FrameError> {
    let raw = raw.trim_end_matches(['\r', '\n']);
    if raw.len() > max_frame_bytes {
        return Err(FrameError::OversizedFrame {
            size: raw.len(),
            max: max_frame_bytes,
        });
    }
    serde_json::from_str(raw).map_err(|err| FrameError::Decode(err.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn command_request_has_flat_type_and_payload() {
        let envelope = RelayEnvelope::request(
            4,
            RelayMsg::Command(CommandPayload {
                session: "session-1-demo".to_string(),
                name: "break".to_string(),
                args: vec!["/tmp/x.rb:4".to_string()],
                data: None,
            }),
        );
        let frame = encode_frame(&envelope, DEFAULT_MAX_FRAME_BYTES).expect("encode");
        let value: Value = serde_json::from_str(&frame).expect("json");
        assert_eq!(value["type"], "command");
        assert_eq!(value["request_id"], 4);
        assert_eq!(value["payload"]["session"], "session-1-demo");

        let decoded: RelayEnvelope = decode_frame(&frame, DEFAULT_MAX_FRAME_BYTES).expect("decode");
        assert_eq!(decoded, envelope);
    }

    #[test]
    fn event_payload_renames_kind_to_type() {
        let envelope = RelayEnvelope::event(
            "session-1-demo",
            "status".to_string(),
            serde_json::json!({"status": "break"}),
        );
        let value = serde_json::to_value(&envelope).expect("value");
        assert_eq!(value["type"], "event");
        assert_eq!(value["payload"]["type"], "status");
        assert!(value.get("request_id").is_none());
    }

    #[test]
    fn connect_client_decodes_from_peer_json() {
        let decoded: RelayEnvelope = decode_frame(
            r#"{"request_id":1,"type":"connect-client","payload":{"id":"client-9"}}"#,
            DEFAULT_MAX_FRAME_BYTES,
        )
        .expect("decode");
        assert_eq!(
            decoded.msg,
            RelayMsg::ConnectClient(ConnectClientPayload {
                id: "client-9".to_string()
            })
        );
    }

    #[test]
    fn nack_carries_error_code() {
        let envelope = RelayEnvelope::nack(Some(3), "unknown_session", "no such session");
        match envelope.msg {
            RelayMsg::Ack(AckPayload {
                error: Some(error), ..
            }) => assert_eq!(error.code, "unknown_session"),
            other => panic!("unexpected message: {other:?}"),
        }
    }

    #[test]
    fn oversized_frames_are_rejected_both_ways() {
        let envelope = RelayEnvelope::event(
            "s",
            "output".to_string(),
            serde_json::json!({"channel": "stdout", "data": "x".repeat(256)}),
        );
        assert!(matches!(
            encode_frame(&envelope, 64),
            Err(FrameError::OversizedFrame { .. })
        ));
        assert!(matches!(
            decode_frame::<RelayEnvelope>(&"x".repeat(100), 64),
            Err(FrameError::OversizedFrame { .. })
        ));
        assert!(matches!(
            decode_frame::<RelayEnvelope>("{\"type\":\"nope\"}", 64),
            Err(FrameError::Decode(_))
        ));
    }
}
