//! Messages exchanged between a server and its clients.
//!
//! The transport is not part of this crate: an [`Orchestrator`] consumes
//! inbound [`Message`]s through `receive` and produces outbound [`Envelope`]s
//! through `take_outgoing`. Messages serialize as JSON objects tagged by
//! `type`:
//!
//! ```
//! use rewind_engine::protocol::Message;
//!
//! let json = serde_json::to_string(&Message::Buffer { depth: 8 }).unwrap();
//! assert_eq!(json, r#"{"type":"BUFFER","depth":8}"#);
//! ```
//!
//! [`Orchestrator`]: crate::orchestrator::Orchestrator

use std::fmt;

use serde::{Deserialize, Serialize};
use serde_json::Value;

use rewind_ecs::prelude::{SerializedState, Tick};

// ---------------------------------------------------------------------------
// PeerId
// ---------------------------------------------------------------------------

/// Identifier of a remote replica.
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct PeerId(String);

impl PeerId {
    pub fn new(id: impl Into<String>) -> Self {
        Self(id.into())
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for PeerId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl From<&str> for PeerId {
    fn from(s: &str) -> Self {
        Self(s.to_owned())
    }
}

// ---------------------------------------------------------------------------
// EventRecord
// ---------------------------------------------------------------------------

/// An application event travelling from a client to the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    #[serde(rename = "type")]
    pub kind: String,
    /// Client tick at which the event was raised.
    pub tick: Tick,
    /// Sending client, stamped by the server on receipt.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub sid: Option<PeerId>,
    #[serde(default)]
    pub payload: Value,
}

// ---------------------------------------------------------------------------
// Message
// ---------------------------------------------------------------------------

/// One protocol message.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Message {
    /// Server to client on connect.
    Connection,
    /// Client to server: requested replay depth.
    Buffer { depth: usize },
    /// Highest tick fully incorporated by the sender, if any.
    Acknowledge { tick: Option<Tick> },
    /// Server to client: full or delta state at `tick`.
    Update { tick: Tick, state: SerializedState },
    /// Client to server: an application event.
    Event { event: EventRecord },
}

impl Message {
    /// Wire name of the message type.
    pub fn kind(&self) -> &'static str {
        match self {
            Message::Connection => "CONNECTION",
            Message::Buffer { .. } => "BUFFER",
            Message::Acknowledge { .. } => "ACKNOWLEDGE",
            Message::Update { .. } => "UPDATE",
            Message::Event { .. } => "EVENT",
        }
    }
}

/// A message addressed to (or received from) a peer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Envelope {
    pub peer: PeerId,
    pub message: Message,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn connection_has_no_payload() {
        assert_eq!(
            serde_json::to_value(Message::Connection).unwrap(),
            json!({ "type": "CONNECTION" })
        );
    }

    #[test]
    fn acknowledge_without_tick_is_null() {
        let v = serde_json::to_value(Message::Acknowledge { tick: None }).unwrap();
        assert_eq!(v, json!({ "type": "ACKNOWLEDGE", "tick": null }));
    }

    #[test]
    fn update_carries_wire_state() {
        let msg: Message = serde_json::from_value(json!({
            "type": "UPDATE",
            "tick": 4,
            "state": { "entities": [ { "hash": "a", "components": {}, "subState": "default" } ] }
        }))
        .unwrap();
        match msg {
            Message::Update { tick, state } => {
                assert_eq!(tick, 4);
                assert_eq!(state.len(), 1);
            }
            other => panic!("expected UPDATE, got {}", other.kind()),
        }
    }

    #[test]
    fn event_sid_is_omitted_until_stamped() {
        let event = EventRecord {
            kind: "JUMP".to_owned(),
            tick: 2,
            sid: None,
            payload: json!({ "height": 3 }),
        };
        let v = serde_json::to_value(Message::Event { event }).unwrap();
        assert_eq!(
            v,
            json!({ "type": "EVENT", "event": { "type": "JUMP", "tick": 2, "payload": { "height": 3 } } })
        );
    }
}
