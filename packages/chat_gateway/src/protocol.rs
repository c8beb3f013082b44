//! Payload schemas.
//!
//! Everything that crosses a boundary is parsed into one of these types first:
//! - [`ClientEvent`]: frames from a client to its attached instance
//! - [`ChannelPayload`]: payloads delivered by the broker
//! - [`ServerEvent`]: frames from an instance to its attached clients
//!
//! Client frames are JSON objects of the form `{"event": <name>, "data": <payload>}`.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use uuid::Uuid;

use crate::broker::{CONNECTION_COUNT_UPDATED_CHANNEL, NEW_MESSAGE_CHANNEL};

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ProtocolError {
    #[error("unknown channel: {0}")]
    UnknownChannel(String),

    #[error("invalid connection count: {0:?}")]
    InvalidCount(String),

    #[error("malformed client event: {0}")]
    MalformedEvent(String),

    #[error("empty message")]
    EmptyMessage,
}

/// Events sent FROM the client TO the gateway
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ClientEvent {
    #[serde(rename = "chat:new-message")]
    NewMessage { message: String },
}

impl ClientEvent {
    /// Parse and validate a raw client frame.
    pub fn parse(raw: &str) -> Result<Self, ProtocolError> {
        let event: ClientEvent =
            serde_json::from_str(raw).map_err(|e| ProtocolError::MalformedEvent(e.to_string()))?;
        match &event {
            ClientEvent::NewMessage { message } if message.is_empty() => {
                Err(ProtocolError::EmptyMessage)
            }
            _ => Ok(event),
        }
    }
}

/// A chat message as seen by clients.
///
/// `id`, `created_at` and `origin` are assigned by the instance that relays the broker
/// payload, not by the sender.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ChannelMessage {
    pub message: String,
    pub id: Uuid,
    pub created_at: DateTime<Utc>,
    pub origin: String,
}

impl ChannelMessage {
    pub fn new(content: String, origin: &str) -> Self {
        Self {
            message: content,
            id: Uuid::new_v4(),
            created_at: Utc::now(),
            origin: origin.to_string(),
        }
    }
}

/// Events sent FROM the gateway TO the client
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "event", content = "data")]
pub enum ServerEvent {
    #[serde(rename = "chat:new-message")]
    NewMessage(ChannelMessage),

    /// `count` is forwarded exactly as the broker delivered it.
    #[serde(rename = "chat:connection-count-updated")]
    ConnectionCountUpdated { count: String },
}

/// A validated broker payload, keyed by the channel it arrived on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ChannelPayload {
    CountUpdated(String),
    NewMessage(String),
}

impl ChannelPayload {
    pub fn parse(channel: &str, payload: &str) -> Result<Self, ProtocolError> {
        match channel {
            CONNECTION_COUNT_UPDATED_CHANNEL => {
                if payload.parse::<u64>().is_err() {
                    return Err(ProtocolError::InvalidCount(payload.to_string()));
                }
                Ok(ChannelPayload::CountUpdated(payload.to_string()))
            }
            NEW_MESSAGE_CHANNEL => Ok(ChannelPayload::NewMessage(payload.to_string())),
            other => Err(ProtocolError::UnknownChannel(other.to_string())),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_client_message() {
        let event = ClientEvent::parse(r#"{"event":"chat:new-message","data":{"message":"hello"}}"#)
            .unwrap();
        assert_eq!(
            event,
            ClientEvent::NewMessage {
                message: "hello".into()
            }
        );
    }

    #[test]
    fn test_client_message_rejections() {
        assert_eq!(
            ClientEvent::parse(r#"{"event":"chat:new-message","data":{"message":""}}"#),
            Err(ProtocolError::EmptyMessage)
        );
        for raw in [
            r#"{"event":"chat:new-message","data":{}}"#,
            r#"{"event":"chat:new-message","data":{"message":42}}"#,
            r#"{"event":"chat:typing","data":{"message":"x"}}"#,
            r#"{"message":"no envelope"}"#,
            "not json",
        ] {
            assert!(
                matches!(ClientEvent::parse(raw), Err(ProtocolError::MalformedEvent(_))),
                "expected rejection for {raw}"
            );
        }
    }

    #[test]
    fn test_server_message_wire_shape() {
        let msg = ChannelMessage::new("hello".into(), "3001");
        let json = serde_json::to_value(ServerEvent::NewMessage(msg.clone())).unwrap();
        assert_eq!(json["event"], "chat:new-message");
        assert_eq!(json["data"]["message"], "hello");
        assert_eq!(json["data"]["origin"], "3001");
        assert_eq!(json["data"]["id"], msg.id.to_string());
        assert!(json["data"]["createdAt"].is_string());
    }

    #[test]
    fn test_count_wire_shape() {
        let json = serde_json::to_value(ServerEvent::ConnectionCountUpdated {
            count: "1".into(),
        })
        .unwrap();
        assert_eq!(
            json,
            serde_json::json!({"event": "chat:connection-count-updated", "data": {"count": "1"}})
        );
    }

    #[test]
    fn test_channel_messages_get_fresh_ids() {
        let a = ChannelMessage::new("same".into(), "a");
        let b = ChannelMessage::new("same".into(), "a");
        assert_ne!(a.id, b.id);
        assert!(b.created_at >= a.created_at);
    }

    #[test]
    fn test_channel_payload_dispatch_keys() {
        assert_eq!(
            ChannelPayload::parse(CONNECTION_COUNT_UPDATED_CHANNEL, "12"),
            Ok(ChannelPayload::CountUpdated("12".into()))
        );
        assert_eq!(
            ChannelPayload::parse(NEW_MESSAGE_CHANNEL, "hi there"),
            Ok(ChannelPayload::NewMessage("hi there".into()))
        );
        assert_eq!(
            ChannelPayload::parse(CONNECTION_COUNT_UPDATED_CHANNEL, "-1"),
            Err(ProtocolError::InvalidCount("-1".into()))
        );
        assert_eq!(
            ChannelPayload::parse("chat:other", "x"),
            Err(ProtocolError::UnknownChannel("chat:other".into()))
        );
    }
}
