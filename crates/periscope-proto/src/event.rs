//! Agent-originated events surfaced to the remote side.
//!
//! Events flow agent → relay → remote outside the command/response cycle:
//! AI responses, pending-action lifecycle, watchdog alerts. The relay also
//! emits [`AgentEvent::ScheduleFired`] itself when a schedule entry fires.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Lifecycle state of an AI-proposed action awaiting approval.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PendingState {
    /// Awaiting an accept/reject decision.
    Pending,
    /// Approved and applied.
    Accepted,
    /// Declined.
    Rejected,
    /// Timed out before any decision.
    Expired,
}

/// An event emitted by the agent (or, for schedule outcomes, the relay).
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "event", rename_all = "snake_case")]
pub enum AgentEvent {
    /// The AI proposed an action and awaits approval.
    PendingAction {
        id: Uuid,
        description: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        diff: Option<String>,
        created_at: DateTime<Utc>,
    },
    /// A pending action left the pending state.
    PendingResolved { id: Uuid, state: PendingState },
    /// The watchdog observed a stall; emitted once per stall episode.
    WatchdogAlert { idle_secs: u64 },
    /// A plain textual response from the AI assistant.
    AssistantResponse { text: String },
    /// Periodic stream statistics, including the backpressure drop counter.
    StreamStats { frames_sent: u64, frames_dropped: u64 },
    /// A schedule entry fired; `ok` reports the dispatch outcome.
    ScheduleFired {
        id: Uuid,
        ok: bool,
        message: String,
    },
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn event_tag_is_snake_case() {
        let event = AgentEvent::WatchdogAlert { idle_secs: 42 };
        let json = serde_json::to_value(&event).unwrap();
        assert_eq!(json["event"], "watchdog_alert");
        assert_eq!(json["idle_secs"], 42);
    }

    #[test]
    fn pending_action_roundtrip() {
        let event = AgentEvent::PendingAction {
            id: Uuid::new_v4(),
            description: "edit src/main.rs".into(),
            diff: Some("-old\n+new".into()),
            created_at: Utc::now(),
        };
        let json = serde_json::to_string(&event).unwrap();
        let back: AgentEvent = serde_json::from_str(&json).unwrap();
        assert_eq!(back, event);
    }
}
