//! The closed command set and its responses.
//!
//! Commands are decoded from the remote side (chat adapter or browser
//! WebSocket), validated by the router, and either handled at the router
//! boundary or forwarded to the agent. Dispatch is exhaustive pattern
//! matching; there is no open-ended registry.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

use periscope_types::RelayError;

use crate::frame::Frame;

/// Maximum length for relayed free-form text.
pub const MAX_RELAY_TEXT_LEN: usize = 4000;

/// Maximum length for a key combo spec.
pub const MAX_KEY_COMBO_LEN: usize = 50;

/// Scroll direction for the `/scroll` command.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
}

impl ScrollDirection {
    /// The opposite direction, used to build reverse operations.
    pub fn opposite(self) -> Self {
        match self {
            ScrollDirection::Up => ScrollDirection::Down,
            ScrollDirection::Down => ScrollDirection::Up,
        }
    }
}

fn default_one() -> u32 {
    1
}

/// A structured instruction from the remote side.
///
/// Immutable once created; consumed exactly once by the command router.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum Command {
    /// One-shot screen capture, independent of any active stream.
    Screenshot,
    /// Scroll the agent's screen.
    Scroll {
        direction: ScrollDirection,
        #[serde(default = "default_one")]
        amount: u32,
    },
    /// Approve a pending AI-proposed action (latest if no id given).
    Accept {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Uuid>,
    },
    /// Reject a pending AI-proposed action (latest if no id given).
    Reject {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        id: Option<Uuid>,
    },
    /// Relay free-form text to the AI assistant.
    RelayText { text: String },
    /// Fetch the workspace's pending diff.
    Diff,
    /// Revert the N most recent recorded actions (default 1).
    Undo {
        #[serde(default = "default_one")]
        steps: u32,
    },
    /// Speak text aloud on the agent machine.
    Tts { text: String },
    /// Schedule a command to fire at a target time.
    Schedule {
        /// `HH:MM` (next occurrence) or relative `30s` / `5m` / `2h`.
        at: String,
        command: Box<Command>,
    },
    /// Cancel an armed schedule entry.
    ScheduleCancel { id: Uuid },
    /// List armed schedule entries.
    ScheduleList,
    /// Enable or disable the stall watchdog.
    WatchdogToggle { enabled: bool },
    /// Suspend command handling for this session.
    Pause,
    /// Resume a suspended session.
    Resume,
    /// Session and agent status summary.
    Status,
    /// Send a key combination, e.g. `ctrl+s`.
    KeyCombo { combo: String },
    /// Start the continuous screen stream.
    StreamStart {
        #[serde(default, skip_serializing_if = "Option::is_none")]
        fps: Option<u32>,
    },
    /// Stop the continuous screen stream.
    StreamStop,
}

impl Command {
    /// Kind-specific argument validation.
    ///
    /// Runs after the paused/offline checks; a failure here is reported to
    /// the issuer and the command is never forwarded to the agent.
    pub fn validate(&self) -> Result<(), RelayError> {
        match self {
            Command::Scroll { amount, .. } => {
                if *amount == 0 || *amount > 100 {
                    return Err(RelayError::Validation(format!(
                        "scroll amount must be 1-100, got {amount}"
                    )));
                }
            }
            Command::RelayText { text } => {
                if text.trim().is_empty() {
                    return Err(RelayError::Validation("relay text is empty".into()));
                }
                if text.len() > MAX_RELAY_TEXT_LEN {
                    return Err(RelayError::Validation(format!(
                        "relay text exceeds {MAX_RELAY_TEXT_LEN} characters"
                    )));
                }
            }
            Command::Undo { steps } => {
                if *steps == 0 {
                    return Err(RelayError::Validation("undo requires N >= 1".into()));
                }
            }
            Command::Tts { text } => {
                if text.trim().is_empty() {
                    return Err(RelayError::Validation("tts text is empty".into()));
                }
            }
            Command::Schedule { at, command } => {
                if at.trim().is_empty() {
                    return Err(RelayError::Validation(
                        "schedule requires a target time (HH:MM, 30s, 5m, 2h)".into(),
                    ));
                }
                if matches!(
                    command.as_ref(),
                    Command::Schedule { .. } | Command::ScheduleCancel { .. }
                ) {
                    return Err(RelayError::Validation(
                        "scheduled command cannot itself be a schedule operation".into(),
                    ));
                }
                command.validate()?;
            }
            Command::KeyCombo { combo } => {
                if combo.is_empty() || combo.len() > MAX_KEY_COMBO_LEN {
                    return Err(RelayError::Validation(format!(
                        "key combo must be 1-{MAX_KEY_COMBO_LEN} characters"
                    )));
                }
                if !combo
                    .chars()
                    .all(|c| c.is_ascii_alphanumeric() || c == '+' || c == '_')
                {
                    return Err(RelayError::Validation(format!(
                        "key combo contains unsupported characters: {combo}"
                    )));
                }
            }
            Command::StreamStart { fps: Some(fps) } => {
                if *fps == 0 || *fps > periscope_types::config::MAX_STREAM_FPS {
                    return Err(RelayError::Validation(format!(
                        "stream fps must be 1-{}, got {fps}",
                        periscope_types::config::MAX_STREAM_FPS
                    )));
                }
            }
            _ => {}
        }
        Ok(())
    }

    /// Whether this command may run while the session is suspended.
    pub fn exempt_from_pause(&self) -> bool {
        matches!(self, Command::Resume | Command::Status)
    }

    /// Whether the router forwards this command to the agent, as opposed to
    /// handling it at the router/session boundary.
    pub fn routes_to_agent(&self) -> bool {
        !matches!(
            self,
            Command::Schedule { .. }
                | Command::ScheduleCancel { .. }
                | Command::ScheduleList
                | Command::Pause
                | Command::Resume
                | Command::Status
        )
    }

    /// Short name for logging.
    pub fn name(&self) -> &'static str {
        match self {
            Command::Screenshot => "screenshot",
            Command::Scroll { .. } => "scroll",
            Command::Accept { .. } => "accept",
            Command::Reject { .. } => "reject",
            Command::RelayText { .. } => "relay_text",
            Command::Diff => "diff",
            Command::Undo { .. } => "undo",
            Command::Tts { .. } => "tts",
            Command::Schedule { .. } => "schedule",
            Command::ScheduleCancel { .. } => "schedule_cancel",
            Command::ScheduleList => "schedule_list",
            Command::WatchdogToggle { .. } => "watchdog_toggle",
            Command::Pause => "pause",
            Command::Resume => "resume",
            Command::Status => "status",
            Command::KeyCombo { .. } => "key_combo",
            Command::StreamStart { .. } => "stream_start",
            Command::StreamStop => "stream_stop",
        }
    }
}

/// Response to a command.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CommandResponse {
    /// Whether the command succeeded.
    pub ok: bool,
    /// Human-readable message.
    pub message: String,
    /// Optional structured data (depends on the command).
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<serde_json::Value>,
    /// One-shot screenshot result, when the command produced a frame.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub frame: Option<Frame>,
}

impl CommandResponse {
    /// Create a success response with a message.
    pub fn ok(message: impl Into<String>) -> Self {
        Self {
            ok: true,
            message: message.into(),
            data: None,
            frame: None,
        }
    }

    /// Create a success response with message and data.
    pub fn ok_with_data(message: impl Into<String>, data: serde_json::Value) -> Self {
        Self {
            ok: true,
            message: message.into(),
            data: Some(data),
            frame: None,
        }
    }

    /// Create a success response carrying a captured frame.
    pub fn ok_with_frame(message: impl Into<String>, frame: Frame) -> Self {
        Self {
            ok: true,
            message: message.into(),
            data: None,
            frame: Some(frame),
        }
    }

    /// Create an error response.
    pub fn error(message: impl Into<String>) -> Self {
        Self {
            ok: false,
            message: message.into(),
            data: None,
            frame: None,
        }
    }
}

impl From<&RelayError> for CommandResponse {
    fn from(err: &RelayError) -> Self {
        CommandResponse::error(err.to_string())
    }
}
