//! Board of AI-proposed actions awaiting approval.
//!
//! Proposals are accepted or rejected by id, or "latest first" when the
//! remote gives no id. Unresolved proposals past the expiry age are
//! swept and reported as expired.

use std::time::{Duration, Instant};

use chrono::{DateTime, Utc};
use uuid::Uuid;

use periscope_proto::PendingState;
use periscope_types::RelayError;

/// One AI-proposed action awaiting a verdict.
#[derive(Debug, Clone)]
pub struct PendingAction {
    pub id: Uuid,
    pub description: String,
    pub diff: Option<String>,
    pub created_at: DateTime<Utc>,
    added: Instant,
}

/// Unresolved proposals, oldest first.
#[derive(Debug)]
pub struct PendingBoard {
    entries: Vec<PendingAction>,
    expiry: Duration,
}

impl PendingBoard {
    pub fn new(expiry: Duration) -> Self {
        Self {
            entries: Vec::new(),
            expiry,
        }
    }

    /// Register a new proposal.
    pub fn add(&mut self, description: impl Into<String>, diff: Option<String>) -> PendingAction {
        let action = PendingAction {
            id: Uuid::new_v4(),
            description: description.into(),
            diff,
            created_at: Utc::now(),
            added: Instant::now(),
        };
        self.entries.push(action.clone());
        action
    }

    /// Resolve a proposal: the one with `id`, or the most recent when no
    /// id is given. `state` records how it was resolved.
    pub fn resolve(
        &mut self,
        id: Option<Uuid>,
        state: PendingState,
    ) -> Result<PendingAction, RelayError> {
        let index = match id {
            Some(id) => self
                .entries
                .iter()
                .position(|a| a.id == id)
                .ok_or_else(|| RelayError::Validation(format!("no pending action {id}")))?,
            None => {
                if self.entries.is_empty() {
                    return Err(RelayError::Validation("no pending actions".into()));
                }
                self.entries.len() - 1
            }
        };
        debug_assert!(matches!(
            state,
            PendingState::Accepted | PendingState::Rejected
        ));
        Ok(self.entries.remove(index))
    }

    /// Remove and return every proposal older than the expiry age.
    pub fn sweep_expired(&mut self) -> Vec<PendingAction> {
        let expiry = self.expiry;
        let (expired, kept) = std::mem::take(&mut self.entries)
            .into_iter()
            .partition(|a| a.added.elapsed() >= expiry);
        self.entries = kept;
        expired
    }

    pub fn list(&self) -> &[PendingAction] {
        &self.entries
    }

    pub fn count(&self) -> usize {
        self.entries.len()
    }
}
