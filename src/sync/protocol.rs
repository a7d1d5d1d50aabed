//! Event names and payload formats of the sync protocol.
//!
//! Events are named strings carried by the channel layer. Payloads are JSON;
//! binary CRDT data (updates, state vectors, awareness diffs) is embedded as
//! standard base64 strings. Document events and awareness events use disjoint
//! names so a broken presence path never touches document traffic.

use base64::{engine::general_purpose::STANDARD, Engine as _};
use serde::{de::DeserializeOwned, Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use super::{Guid, SyncError, WorkspaceId};

/// Protocol version reported by the relay health endpoint
pub const PROTOCOL_VERSION: u8 = 1;

/// Event identifiers understood by client and relay
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Event {
    // Document sync
    DocLoad,
    ClientUpdate,
    ServerUpdate,

    // Room membership
    ClientHandshake,
    ClientLeave,

    // Awareness
    AwarenessInit,
    AwarenessUpdate,
    ServerAwarenessBroadcast,
    NewClientAwarenessInit,
}

impl Event {
    pub const ALL: [Event; 9] = [
        Event::DocLoad,
        Event::ClientUpdate,
        Event::ServerUpdate,
        Event::ClientHandshake,
        Event::ClientLeave,
        Event::AwarenessInit,
        Event::AwarenessUpdate,
        Event::ServerAwarenessBroadcast,
        Event::NewClientAwarenessInit,
    ];

    /// Wire name of the event
    pub const fn as_str(self) -> &'static str {
        match self {
            Event::DocLoad => "doc-load",
            Event::ClientUpdate => "client-update",
            Event::ServerUpdate => "server-update",
            Event::ClientHandshake => "client-handshake",
            Event::ClientLeave => "client-leave",
            Event::AwarenessInit => "awareness-init",
            Event::AwarenessUpdate => "awareness-update",
            Event::ServerAwarenessBroadcast => "server-awareness-broadcast",
            Event::NewClientAwarenessInit => "new-client-awareness-init",
        }
    }
}

impl fmt::Display for Event {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Event {
    type Err = ProtocolError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Event::ALL
            .into_iter()
            .find(|event| event.as_str() == s)
            .ok_or_else(|| ProtocolError::UnknownEvent(s.to_string()))
    }
}

/// Protocol errors
#[derive(Debug, Clone, thiserror::Error)]
pub enum ProtocolError {
    #[error("Unknown event: {0}")]
    UnknownEvent(String),

    #[error("Invalid payload: {0}")]
    InvalidPayload(String),
}

impl From<serde_json::Error> for ProtocolError {
    fn from(err: serde_json::Error) -> Self {
        ProtocolError::InvalidPayload(err.to_string())
    }
}

impl From<ProtocolError> for SyncError {
    fn from(err: ProtocolError) -> Self {
        SyncError::Protocol(err.to_string())
    }
}

/// `doc-load` request: asks the peer for whatever the state vector is missing
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocLoadRequest {
    pub workspace_id: WorkspaceId,
    pub guid: Guid,
    /// Base64 state vector; absent means "send everything"
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub state_vector: Option<String>,
}

/// `client-update` / `server-update` payload
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DocUpdateMessage {
    pub workspace_id: WorkspaceId,
    pub guid: Guid,
    /// Base64 CRDT update
    pub update: String,
}

/// `awareness-update` / `server-awareness-broadcast` payload.
///
/// Always scoped by `workspaceId`; the room never travels as `guid` here.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AwarenessMessage {
    pub workspace_id: WorkspaceId,
    /// Base64 awareness diff
    pub awareness_update: String,
}

/// Acknowledgement of a `doc-load` request
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DocLoadAck {
    /// Base64 update the requester is missing
    Update(String),
    /// Nothing newer than the requester's state (or no such document)
    UpToDate,
    /// The peer failed to serve the request
    Error(String),
}

impl DocLoadAck {
    /// Interpret an ack payload. `null` and `false` both mean "nothing to send".
    pub fn from_value(value: Value) -> Result<Self, ProtocolError> {
        match value {
            Value::String(update) => Ok(DocLoadAck::Update(update)),
            Value::Null | Value::Bool(false) => Ok(DocLoadAck::UpToDate),
            Value::Object(map) => match map.get("error") {
                Some(Value::String(message)) => Ok(DocLoadAck::Error(message.clone())),
                Some(other) => Ok(DocLoadAck::Error(other.to_string())),
                None => Err(ProtocolError::InvalidPayload(
                    "doc-load ack object without error field".to_string(),
                )),
            },
            other => Err(ProtocolError::InvalidPayload(format!(
                "unexpected doc-load ack: {other}"
            ))),
        }
    }

    pub fn into_value(self) -> Value {
        match self {
            DocLoadAck::Update(update) => Value::String(update),
            DocLoadAck::UpToDate => Value::Null,
            DocLoadAck::Error(message) => serde_json::json!({ "error": message }),
        }
    }
}

/// Base64-encode a binary CRDT payload
pub fn encode_binary(data: &[u8]) -> String {
    STANDARD.encode(data)
}

/// Decode a base64 CRDT payload
pub fn decode_binary(text: &str) -> Result<Vec<u8>, base64::DecodeError> {
    STANDARD.decode(text)
}

/// Serialize a typed message into an event payload
pub fn to_payload<T: Serialize>(msg: &T) -> Result<Value, ProtocolError> {
    Ok(serde_json::to_value(msg)?)
}

/// Deserialize an event payload into a typed message
pub fn from_payload<T: DeserializeOwned>(payload: Value) -> Result<T, ProtocolError> {
    Ok(serde_json::from_value(payload)?)
}
