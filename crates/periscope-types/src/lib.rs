//! Core types shared across all Periscope crates.
//!
//! Defines user identifiers, link roles, configuration, and the error
//! taxonomy used by the relay server and the local agent.

pub mod config;
pub mod error;
pub mod ids;

pub use config::{AgentConfig, RelayConfig, UserEntry, DEFAULT_STREAM_FPS};
pub use error::RelayError;
pub use ids::{LinkRole, UserId};
