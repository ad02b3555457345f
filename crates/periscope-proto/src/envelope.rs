//! The message envelope carried on every link.
//!
//! `{type, user_id, payload, sequence}` as a single JSON object: the body
//! enum is internally tagged with `type` and flattened into the envelope.
//! Per-link sequence numbers are assigned by the sender and preserve FIFO
//! order; frames additionally carry their own capture sequence.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use periscope_types::UserId;

use crate::command::{Command, CommandResponse};
use crate::event::AgentEvent;
use crate::frame::Frame;

/// The tagged payload of an [`Envelope`].
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EnvelopeBody {
    /// Server → agent: execute a command. `id` correlates the result.
    Cmd { id: Uuid, command: Command },
    /// Agent → server: result for a previously received `cmd`.
    CmdResult { id: Uuid, response: CommandResponse },
    /// Agent → server: one screen frame (stream or one-shot path).
    Frame { frame: Frame },
    /// Agent → server (or relay → remote): out-of-band event.
    Event { event: AgentEvent },
    /// Keepalive; any traffic, including this, refreshes link liveness.
    Ping,
    /// Keepalive reply.
    Pong,
}

/// A message on a transport link.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    /// The user whose session this message belongs to.
    pub user_id: UserId,
    /// Per-link monotonic sequence number assigned by the sender.
    pub sequence: u64,
    #[serde(flatten)]
    pub body: EnvelopeBody,
}

impl Envelope {
    /// Wrap a body for the given user. The caller assigns the sequence.
    pub fn new(user_id: UserId, sequence: u64, body: EnvelopeBody) -> Self {
        Self {
            user_id,
            sequence,
            body,
        }
    }

    /// Parse an envelope from its wire representation.
    pub fn decode(text: &str) -> Result<Self, serde_json::Error> {
        serde_json::from_str(text)
    }

    /// Serialize to the wire representation.
    pub fn encode(&self) -> String {
        // Envelope contains no map keys that can fail to serialize.
        serde_json::to_string(self).expect("envelope serializes")
    }
}
