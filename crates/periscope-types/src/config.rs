//! Configuration types for the relay server and the local agent.
//!
//! [`RelayConfig`] is loaded from `periscope.toml` on the server and
//! carries the knobs the relay consumes (liveness, dispatch and grace
//! timers). [`AgentConfig`] is loaded from `agent.toml` on the controlled
//! machine and carries the rest: stream frame rate, watchdog quiet
//! period, undo stack depth, capture and TTS command templates.

use std::time::Duration;

use serde::{Deserialize, Serialize};

use crate::error::RelayError;
use crate::ids::UserId;

/// Default target frame rate for screen streaming.
pub const DEFAULT_STREAM_FPS: u32 = 10;

/// Highest frame rate a client may request.
pub const MAX_STREAM_FPS: u32 = 30;

fn default_listen_addr() -> String {
    "0.0.0.0:10000".to_string()
}

fn default_stream_fps() -> u32 {
    DEFAULT_STREAM_FPS
}

fn default_liveness_timeout_secs() -> u64 {
    60
}

fn default_keepalive_interval_secs() -> u64 {
    30
}

fn default_watchdog_quiet_secs() -> u64 {
    30
}

fn default_undo_max_depth() -> usize {
    10
}

fn default_dispatch_timeout_secs() -> u64 {
    30
}

fn default_command_grace_secs() -> u64 {
    300
}

fn default_pending_expiry_secs() -> u64 {
    300
}

/// A registered user identity and its agent auth token.
///
/// Registration itself (how tokens are issued) is an external setup step;
/// the relay only needs the resulting binding so `bind` can reject
/// unregistered identities.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct UserEntry {
    /// Opaque stable identifier (e.g. the chat platform user id).
    pub id: UserId,
    /// Opaque token the agent presents when connecting.
    pub token: String,
}

/// Top-level configuration for the relay server.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RelayConfig {
    /// Listen address for the WebSocket endpoint.
    #[serde(default = "default_listen_addr")]
    pub listen_addr: String,

    /// Registered users allowed to bind links.
    #[serde(default)]
    pub users: Vec<UserEntry>,

    /// A link producing no traffic (including keepalive) for this long is
    /// declared dead and closed.
    #[serde(default = "default_liveness_timeout_secs")]
    pub liveness_timeout_secs: u64,

    /// Expected interval between keepalive pings on agent links; bounds
    /// the liveness timeout from below.
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// How long to wait for an agent to acknowledge a dispatched command.
    #[serde(default = "default_dispatch_timeout_secs")]
    pub dispatch_timeout_secs: u64,

    /// How long the last control command issued to an offline agent is kept
    /// for delivery on reconnect.
    #[serde(default = "default_command_grace_secs")]
    pub command_grace_secs: u64,
}

impl Default for RelayConfig {
    fn default() -> Self {
        Self {
            listen_addr: default_listen_addr(),
            users: Vec::new(),
            liveness_timeout_secs: default_liveness_timeout_secs(),
            keepalive_interval_secs: default_keepalive_interval_secs(),
            dispatch_timeout_secs: default_dispatch_timeout_secs(),
            command_grace_secs: default_command_grace_secs(),
        }
    }
}

impl RelayConfig {
    /// Validate tuning values that would otherwise misbehave silently.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.liveness_timeout_secs <= self.keepalive_interval_secs {
            return Err(RelayError::Validation(format!(
                "liveness_timeout_secs ({}) must exceed keepalive_interval_secs ({})",
                self.liveness_timeout_secs, self.keepalive_interval_secs
            )));
        }
        if self.dispatch_timeout_secs == 0 {
            return Err(RelayError::Validation(
                "dispatch_timeout_secs must be at least 1".into(),
            ));
        }
        Ok(())
    }

    /// Liveness timeout as a [`Duration`].
    pub fn liveness_timeout(&self) -> Duration {
        Duration::from_secs(self.liveness_timeout_secs)
    }

    /// Dispatch acknowledgment timeout as a [`Duration`].
    pub fn dispatch_timeout(&self) -> Duration {
        Duration::from_secs(self.dispatch_timeout_secs)
    }

    /// Grace period for queued commands as a [`Duration`].
    pub fn command_grace(&self) -> Duration {
        Duration::from_secs(self.command_grace_secs)
    }
}

fn default_reconnect_initial_secs() -> u64 {
    5
}

fn default_reconnect_max_secs() -> u64 {
    60
}

/// Configuration for the local agent process.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    /// WebSocket URL of the relay server (e.g. `wss://relay.example.com/ws`).
    pub server_url: String,
    /// This machine's registered user identity.
    pub user_id: UserId,
    /// Auth token presented when connecting.
    pub auth_token: String,

    /// Target frame rate for screen streams started on this agent.
    #[serde(default = "default_stream_fps")]
    pub stream_fps: u32,

    /// Interval between keepalive pings sent to the relay.
    #[serde(default = "default_keepalive_interval_secs")]
    pub keepalive_interval_secs: u64,

    /// Initial reconnect backoff delay.
    #[serde(default = "default_reconnect_initial_secs")]
    pub reconnect_initial_secs: u64,

    /// Upper bound for exponential reconnect backoff.
    #[serde(default = "default_reconnect_max_secs")]
    pub reconnect_max_secs: u64,

    /// Quiet period for the watchdog stall detector.
    #[serde(default = "default_watchdog_quiet_secs")]
    pub watchdog_quiet_secs: u64,

    /// Maximum undo stack depth.
    #[serde(default = "default_undo_max_depth")]
    pub undo_max_depth: usize,

    /// Pending actions older than this are expired.
    #[serde(default = "default_pending_expiry_secs")]
    pub pending_expiry_secs: u64,

    /// Workspace directory used for `/diff`.
    #[serde(default)]
    pub workspace_dir: Option<std::path::PathBuf>,

    /// Shell command template for one screen capture; must write a PNG/JPEG
    /// to the path substituted for `{out}`.
    #[serde(default)]
    pub capture_command: Option<String>,

    /// Shell command template for text-to-speech; `{text}` is substituted.
    #[serde(default)]
    pub tts_command: Option<String>,
}

impl AgentConfig {
    /// Validate agent tuning values.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.server_url.is_empty() {
            return Err(RelayError::Validation("server_url must be set".into()));
        }
        if self.auth_token.is_empty() {
            return Err(RelayError::Validation("auth_token must be set".into()));
        }
        if self.stream_fps == 0 || self.stream_fps > MAX_STREAM_FPS {
            return Err(RelayError::Validation(format!(
                "stream_fps must be 1-{MAX_STREAM_FPS}, got {}",
                self.stream_fps
            )));
        }
        if self.reconnect_initial_secs == 0 || self.reconnect_max_secs < self.reconnect_initial_secs
        {
            return Err(RelayError::Validation(
                "reconnect backoff range is invalid".into(),
            ));
        }
        Ok(())
    }
}
