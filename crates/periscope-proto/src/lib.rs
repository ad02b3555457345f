//! Wire protocol shared by the relay server and the local agent.
//!
//! Every message on a link is an [`Envelope`]: a user identity, a per-link
//! monotonic sequence number, and a tagged body. Commands form a closed set
//! with compile-time-checked dispatch; adding a command kind is a type
//! change, not a registry entry.

pub mod command;
pub mod envelope;
pub mod event;
pub mod frame;

pub use command::{Command, CommandResponse, ScrollDirection};
pub use envelope::{Envelope, EnvelopeBody};
pub use event::{AgentEvent, PendingState};
pub use frame::Frame;
