//! Command dispatch with response correlation.
//!
//! Every command sent to an agent carries a fresh uuid; the agent echoes it
//! back in its `cmd_result`. The dispatcher parks the caller on a oneshot
//! until the matching result arrives or the dispatch timeout fires.

use std::collections::HashMap;
use std::sync::Mutex;
use std::time::Duration;

use tokio::sync::oneshot;
use tracing::{debug, warn};
use uuid::Uuid;

use periscope_proto::{Command, CommandResponse, EnvelopeBody};
use periscope_types::RelayError;

use crate::link::LinkHandle;

/// Correlates in-flight commands with their eventual responses.
pub struct Dispatcher {
    pending: Mutex<HashMap<Uuid, oneshot::Sender<CommandResponse>>>,
}

impl Dispatcher {
    pub fn new() -> Self {
        Self {
            pending: Mutex::new(HashMap::new()),
        }
    }

    /// Send `command` over `agent` and wait for the correlated result.
    ///
    /// On timeout the pending slot is dropped, so a late result is
    /// discarded rather than delivered to a caller that already gave up.
    pub async fn dispatch(
        &self,
        agent: &LinkHandle,
        command: Command,
        timeout: Duration,
    ) -> Result<CommandResponse, RelayError> {
        let id = Uuid::new_v4();
        let (tx, rx) = oneshot::channel();
        self.pending.lock().expect("pending lock").insert(id, tx);

        if let Err(err) = agent.send(EnvelopeBody::Cmd {
            id,
            command: command.clone(),
        }) {
            self.pending.lock().expect("pending lock").remove(&id);
            return Err(err);
        }
        debug!(%id, command = command.name(), "command dispatched");

        match tokio::time::timeout(timeout, rx).await {
            Ok(Ok(response)) => Ok(response),
            // Sender dropped without a result: the agent link went away.
            Ok(Err(_)) => Err(RelayError::AgentOffline),
            Err(_) => {
                self.pending.lock().expect("pending lock").remove(&id);
                warn!(%id, command = command.name(), "dispatch timed out");
                Err(RelayError::DispatchTimeout)
            }
        }
    }

    /// Deliver a `cmd_result` from the agent. Unmatched ids (timed out or
    /// from a replaced link) are dropped.
    pub fn complete(&self, id: Uuid, response: CommandResponse) {
        let waiter = self.pending.lock().expect("pending lock").remove(&id);
        match waiter {
            Some(tx) => {
                let _ = tx.send(response);
            }
            None => debug!(%id, "discarding result for unknown command id"),
        }
    }

    /// Fail every in-flight command for which no result can arrive
    /// anymore, e.g. after the agent link dropped.
    pub fn abort_all(&self) {
        self.pending.lock().expect("pending lock").clear();
    }

    /// Number of commands awaiting a result.
    pub fn in_flight(&self) -> usize {
        self.pending.lock().expect("pending lock").len()
    }
}

impl Default for Dispatcher {
    fn default() -> Self {
        Self::new()
    }
}
