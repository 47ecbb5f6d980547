use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use serde::{Deserialize, Serialize};

use crate::messaging::Message;
use crate::messaging::topic::to_edge_topic;

/// Payload encoding for bytes that are not valid UTF-8.
pub const BASE64: &str = "base64";

/// Frames sent by edge clients. Topics use the edge form
/// `channels/<channel>/messages[/<subtopic>]`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ClientMessage {
    #[serde(rename = "connect")]
    Connect { username: String, password: String },

    #[serde(rename = "subscribe")]
    Subscribe { topic: String },

    #[serde(rename = "unsubscribe")]
    Unsubscribe { topic: String },

    /// `payload` is text unless `encoding` is `"base64"`.
    #[serde(rename = "publish")]
    Publish {
        topic: String,
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encoding: Option<String>,
    },
}

/// Frames sent back to edge clients.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type")]
pub enum ServerMessage {
    #[serde(rename = "connack")]
    ConnAck { client_id: String },

    #[serde(rename = "suback")]
    SubAck { topic: String },

    #[serde(rename = "unsuback")]
    UnsubAck { topic: String },

    #[serde(rename = "puback")]
    PubAck { topic: String },

    #[serde(rename = "message")]
    Message {
        topic: String,
        publisher: String,
        payload: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        encoding: Option<String>,
        created: i64,
    },

    #[serde(rename = "error")]
    Error { message: String },
}

impl ServerMessage {
    pub fn delivery(msg: &Message) -> Self {
        let (payload, encoding) = match String::from_utf8(msg.payload.clone()) {
            Ok(text) => (text, None),
            Err(_) => (STANDARD.encode(&msg.payload), Some(BASE64.to_string())),
        };
        Self::Message {
            topic: to_edge_topic(&msg.channel, &msg.subtopic),
            publisher: msg.publisher.clone(),
            payload,
            encoding,
            created: msg.created,
        }
    }

    pub fn error(err: impl ToString) -> Self {
        Self::Error {
            message: err.to_string(),
        }
    }
}

/// Turns a frame payload back into bytes.
pub fn decode_payload(payload: String, encoding: Option<&str>) -> Result<Vec<u8>, String> {
    match encoding {
        None => Ok(payload.into_bytes()),
        Some(BASE64) => STANDARD
            .decode(payload)
            .map_err(|err| format!("invalid base64 payload: {err}")),
        Some(other) => Err(format!("unsupported payload encoding '{other}'")),
    }
}
