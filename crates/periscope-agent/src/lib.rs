//! Periscope local agent.
//!
//! Runs on the controlled machine, keeps one authenticated link to the
//! relay, and executes the commands that arrive on it: screen capture and
//! streaming, input injection, approval of AI-proposed actions, undo of
//! recorded actions, and the stall watchdog. All side effects on the
//! machine go through the [`capture::ScreenController`] seam.

pub mod assistant;
pub mod capture;
pub mod client;
pub mod executor;
pub mod pending;
pub mod undo;
pub mod watchdog;

pub use assistant::{AssistantAdapter, ScreenAssistant};
pub use capture::{CapturePipeline, ControllerError, ExecController, ScreenController};
pub use client::AgentClient;
pub use executor::CommandExecutor;
pub use pending::{PendingAction, PendingBoard};
pub use undo::{ReverseOp, UndoStack};
pub use watchdog::Watchdog;
