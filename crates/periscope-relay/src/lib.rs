//! Periscope relay server.
//!
//! Maintains one live transport link per registered user per role (remote
//! client, local agent), brokers command/response traffic between them,
//! forwards screen frames under a latest-frame-wins backpressure policy,
//! and drives the schedule store. Each user's session is an independent
//! unit of concurrency; streaming never stalls command dispatch.

pub mod dispatch;
pub mod link;
pub mod registry;
pub mod router;
pub mod scheduler;
pub mod server;

pub use dispatch::Dispatcher;
pub use link::{LinkHandle, LinkReceiver};
pub use registry::SessionRegistry;
pub use router::CommandRouter;
pub use scheduler::{ScheduleEntry, ScheduleStatus, Scheduler};
pub use server::RelayServer;
