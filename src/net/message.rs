//! Wire messages
//!
//! Every WebSocket text frame is one JSON envelope:
//!
//! ```text
//! client -> server   {"type":"request","id":7,"name":"login","payload":{...}}
//!                    {"type":"event","name":"event","payload":{"name":"throttle","payload":{"value":1}}}
//! server -> client   {"type":"response","id":7,"payload":{"confirm":true,...}}
//!                    {"type":"event","name":"update entity","payload":{...,"timestamp":...}}
//! ```
//!
//! Requests are answered with a response carrying the same id. Failed requests answer
//! `{confirm: false, reason, message}`.

use serde::{Deserialize, Serialize};
use serde_json::{json, Map, Value};

use crate::error::ProtocolError;

/// Inbound message names
pub mod names {
    pub const LOGIN: &str = "login";
    pub const CREATE_ACCOUNT: &str = "create account";
    pub const SELECT_CHARACTER: &str = "select character";
    pub const CREATE_CHARACTER: &str = "create character";
    pub const GET_CONFIG: &str = "get config";
    pub const SAVE_CONFIG: &str = "save config";
    pub const JOIN_ROOM: &str = "join room";
    pub const LEAVE_ROOM: &str = "leave room";
    pub const CHAT_MESSAGE: &str = "chat message";
    pub const ENTITY_EVENT: &str = "event";
    pub const ENTITY_REQUEST: &str = "request";

    // Outbound events
    pub const INHABIT_ENTITY: &str = "inhabit entity";
    pub const CREATE_ENTITY: &str = "create entity";
    pub const DESTROY_ENTITY: &str = "destroy entity";
    pub const UPDATE_ENTITY: &str = "update entity";
}

/// Client -> server envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Inbound {
    Request {
        id: u64,
        name: String,
        #[serde(default)]
        payload: Value,
    },
    Event {
        name: String,
        #[serde(default)]
        payload: Value,
    },
}

impl Inbound {
    pub fn parse(text: &str) -> Result<Self, ProtocolError> {
        serde_json::from_str(text).map_err(|e| ProtocolError::MalformedFrame(e.to_string()))
    }

    pub fn name(&self) -> &str {
        match self {
            Inbound::Request { name, .. } | Inbound::Event { name, .. } => name,
        }
    }

    pub fn request_id(&self) -> Option<u64> {
        match self {
            Inbound::Request { id, .. } => Some(*id),
            Inbound::Event { .. } => None,
        }
    }
}

/// Server -> client envelope
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "lowercase")]
pub enum Outbound {
    Response { id: u64, payload: Value },
    Event { name: String, payload: Value },
}

impl Outbound {
    pub fn to_text(&self) -> Result<String, serde_json::Error> {
        serde_json::to_string(self)
    }
}

/// Kinds of inbound message a session can hold a handler slot for
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum MessageKind {
    Login,
    CreateAccount,
    SelectCharacter,
    CreateCharacter,
    GetConfig,
    SaveConfig,
    JoinRoom,
    LeaveRoom,
    ChatMessage,
    EntityEvent,
    EntityRequest,
}

impl MessageKind {
    pub const ALL: [MessageKind; 11] = [
        MessageKind::Login,
        MessageKind::CreateAccount,
        MessageKind::SelectCharacter,
        MessageKind::CreateCharacter,
        MessageKind::GetConfig,
        MessageKind::SaveConfig,
        MessageKind::JoinRoom,
        MessageKind::LeaveRoom,
        MessageKind::ChatMessage,
        MessageKind::EntityEvent,
        MessageKind::EntityRequest,
    ];

    pub fn name(&self) -> &'static str {
        match self {
            MessageKind::Login => names::LOGIN,
            MessageKind::CreateAccount => names::CREATE_ACCOUNT,
            MessageKind::SelectCharacter => names::SELECT_CHARACTER,
            MessageKind::CreateCharacter => names::CREATE_CHARACTER,
            MessageKind::GetConfig => names::GET_CONFIG,
            MessageKind::SaveConfig => names::SAVE_CONFIG,
            MessageKind::JoinRoom => names::JOIN_ROOM,
            MessageKind::LeaveRoom => names::LEAVE_ROOM,
            MessageKind::ChatMessage => names::CHAT_MESSAGE,
            MessageKind::EntityEvent => names::ENTITY_EVENT,
            MessageKind::EntityRequest => names::ENTITY_REQUEST,
        }
    }

    pub fn from_name(name: &str) -> Option<Self> {
        Self::ALL.iter().copied().find(|kind| kind.name() == name)
    }
}

impl std::fmt::Display for MessageKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.name())
    }
}

/// `{confirm: true, ..extra}`
pub fn confirm(extra: Value) -> Value {
    let mut payload = match extra {
        Value::Object(map) => map,
        _ => Map::new(),
    };
    payload.insert("confirm".to_string(), Value::Bool(true));
    Value::Object(payload)
}

/// `{confirm: false, reason, message}`
pub fn failure(reason: &str, message: impl Into<String>) -> Value {
    json!({
        "confirm": false,
        "reason": reason,
        "message": message.into(),
    })
}

/// Decode a request payload, naming the message on failure
pub fn decode<T: serde::de::DeserializeOwned>(message: &str, payload: Value) -> Result<T, ProtocolError> {
    serde_json::from_value(payload).map_err(|e| ProtocolError::InvalidPayload {
        message: message.to_string(),
        reason: e.to_string(),
    })
}

#[derive(Debug, Clone, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub account: Option<String>,
    #[serde(default)]
    pub password: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct SelectCharacterRequest {
    #[serde(default)]
    pub character: Option<String>,
}

#[derive(Debug, Clone, Deserialize)]
pub struct RoomRequest {
    pub room: String,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessageRequest {
    pub room: String,
    pub message: String,
}

/// Payload of `event` / `request` traffic forwarded to the inhabited entity
#[derive(Debug, Clone, Deserialize)]
pub struct EntityCall {
    pub name: String,
    #[serde(default)]
    pub payload: Value,
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;

    #[test]
    fn test_parse_inbound() {
        let msg = Inbound::parse(r#"{"type":"request","id":3,"name":"login","payload":{"account":"a"}}"#)
            .unwrap();
        assert_eq!(msg.name(), "login");
        assert_eq!(msg.request_id(), Some(3));

        let msg = Inbound::parse(r#"{"type":"event","name":"event"}"#).unwrap();
        assert_eq!(
            msg,
            Inbound::Event {
                name: "event".to_string(),
                payload: Value::Null
            }
        );

        assert!(Inbound::parse(r#"{"type":"shout"}"#).is_err());
        assert!(Inbound::parse("not json").is_err());
    }

    #[test]
    fn test_outbound_shape() {
        let msg = Outbound::Response {
            id: 9,
            payload: confirm(json!({ "zone": "Sol" })),
        };
        assert_eq!(
            serde_json::from_str::<Value>(&msg.to_text().unwrap()).unwrap(),
            json!({ "type": "response", "id": 9, "payload": { "confirm": true, "zone": "Sol" } })
        );
    }

    #[test]
    fn test_failure_payload() {
        assert_eq!(
            failure("bad_password", "Incorrect password"),
            json!({ "confirm": false, "reason": "bad_password", "message": "Incorrect password" })
        );
    }

    #[test]
    fn test_message_kind_names() {
        for kind in MessageKind::ALL {
            assert_eq!(MessageKind::from_name(kind.name()), Some(kind));
        }
        assert_eq!(MessageKind::from_name("inhabit entity"), None);
    }

    #[test]
    fn test_decode_reports_message() {
        let err = decode::<RoomRequest>(names::JOIN_ROOM, json!({})).unwrap_err();
        assert!(err.to_string().contains("join room"));
    }
}
