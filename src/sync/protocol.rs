use serde::{Deserialize, Serialize};
use serde_json::Value;

use super::TransportPath;

// Relay wire protocol. Clients send JSON text frames; CBOR binary frames carry
// the same messages for peers that prefer them.

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum SyncMessage {
    Handshake {
        server_id: String,
    },
    /// Ask for every entry under `path` now and every later update
    Subscribe {
        path: TransportPath,
    },
    Put {
        id: u64,
        path: TransportPath,
        value: Option<Value>,
    },
    Get {
        id: u64,
        path: TransportPath,
    },
    Ack {
        id: u64,
    },
    Reply {
        id: u64,
        value: Option<Value>,
    },
    Update {
        path: TransportPath,
        value: Option<Value>,
    },
    Error {
        id: Option<u64>,
        message: String,
    },
}

impl SyncMessage {
    pub fn handshake(server_id: impl Into<String>) -> Self {
        SyncMessage::Handshake {
            server_id: server_id.into(),
        }
    }

    pub fn to_text(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn from_text(text: &str) -> serde_json::Result<Self> {
        serde_json::from_str(text)
    }

    pub fn to_cbor(&self) -> Result<Vec<u8>, serde_cbor::Error> {
        serde_cbor::to_vec(self)
    }

    pub fn from_cbor(bytes: &[u8]) -> Result<Self, serde_cbor::Error> {
        serde_cbor::from_slice(bytes)
    }

    /// Request id this message answers, if it is a response.
    pub fn response_id(&self) -> Option<u64> {
        match self {
            SyncMessage::Ack { id } | SyncMessage::Reply { id, .. } => Some(*id),
            SyncMessage::Error { id, .. } => *id,
            _ => None,
        }
    }
}
