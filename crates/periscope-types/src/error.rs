//! Error taxonomy shared across the Periscope crates.

use crate::ids::{LinkRole, UserId};

/// Errors that can occur while relaying between a remote client and an agent.
///
/// Every failure that reaches a user produces exactly one explanatory
/// notification; none of these are silently swallowed. Link-level transport
/// failures tear down links and registry slots but never destroy domain
/// state (undo stack, schedule entries, watchdog state).
#[derive(Debug, thiserror::Error)]
pub enum RelayError {
    /// Routing was attempted for an identity that was never registered.
    /// Fatal to the request, not to the session.
    #[error("unknown user: {0}")]
    UnknownUser(UserId),

    /// The counterpart link for a session is absent.
    #[error("peer unavailable: no live {0} link")]
    PeerUnavailable(LinkRole),

    /// A command was issued while the user has no active agent link.
    #[error("agent offline")]
    AgentOffline,

    /// A command was issued while the session is suspended.
    #[error("agent paused; /resume to continue")]
    AgentPaused,

    /// Malformed command arguments. Reported to the issuer, never forwarded
    /// to the agent.
    #[error("invalid command: {0}")]
    Validation(String),

    /// The capture primitive failed. Reported per-request; an active stream
    /// is not torn down.
    #[error("capture failed: {0}")]
    Capture(String),

    /// The agent did not acknowledge a command within the dispatch timeout.
    /// The command is not retried.
    #[error("no response from agent (dispatch timeout)")]
    DispatchTimeout,

    /// A link-level transport failure (socket closed, outbox saturated).
    #[error("transport error: {0}")]
    Transport(String),
}

impl RelayError {
    /// Whether this error leaves the session usable for further commands.
    ///
    /// All command-level errors do; only transport failures imply the link
    /// itself is gone.
    pub fn session_survives(&self) -> bool {
        !matches!(self, RelayError::Transport(_))
    }
}
