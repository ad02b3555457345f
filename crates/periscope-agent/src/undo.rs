//! Undo stack of reverse operations.
//!
//! Each recorded action carries a descriptor of the input that reverts it.
//! The stack is bounded; recording beyond the configured depth evicts the
//! oldest entry, so `/undo` can always reach the most recent actions.

use std::collections::VecDeque;

use chrono::{DateTime, Utc};

use periscope_proto::ScrollDirection;

use crate::capture::{ControllerError, ScreenController};

/// The input that reverts one recorded action.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ReverseOp {
    KeyCombo(String),
    InjectText(String),
    Scroll { direction: ScrollDirection, amount: u32 },
}

impl ReverseOp {
    /// Apply this reverse operation to the screen.
    pub async fn apply(&self, controller: &dyn ScreenController) -> Result<(), ControllerError> {
        match self {
            ReverseOp::KeyCombo(combo) => controller.key_combo(combo).await,
            ReverseOp::InjectText(text) => controller.inject_text(text).await,
            ReverseOp::Scroll { direction, amount } => {
                controller.scroll(*direction, *amount).await
            }
        }
    }
}

/// One recorded, revertible action.
#[derive(Debug, Clone)]
pub struct UndoEntry {
    pub description: String,
    pub reverse: ReverseOp,
    pub recorded_at: DateTime<Utc>,
}

/// Bounded LIFO of revertible actions.
#[derive(Debug)]
pub struct UndoStack {
    entries: VecDeque<UndoEntry>,
    max_depth: usize,
}

impl UndoStack {
    pub fn new(max_depth: usize) -> Self {
        Self {
            entries: VecDeque::with_capacity(max_depth),
            max_depth,
        }
    }

    /// Record an action. Evicts the oldest entry at capacity.
    pub fn record(&mut self, description: impl Into<String>, reverse: ReverseOp) {
        if self.entries.len() == self.max_depth {
            self.entries.pop_front();
        }
        self.entries.push_back(UndoEntry {
            description: description.into(),
            reverse,
            recorded_at: Utc::now(),
        });
    }

    /// Pop the most recent entry.
    pub fn pop(&mut self) -> Option<UndoEntry> {
        self.entries.pop_back()
    }

    pub fn depth(&self) -> usize {
        self.entries.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn stack_with(n: usize, depth: usize) -> UndoStack {
        let mut stack = UndoStack::new(depth);
        for i in 0..n {
            stack.record(format!("action {i}"), ReverseOp::KeyCombo("ctrl+z".into()));
        }
        stack
    }

    #[test]
    fn pops_in_reverse_order_of_recording() {
        let mut stack = stack_with(3, 10);
        assert_eq!(stack.pop().unwrap().description, "action 2");
        assert_eq!(stack.pop().unwrap().description, "action 1");
        assert_eq!(stack.pop().unwrap().description, "action 0");
        assert!(stack.pop().is_none());
    }

    #[test]
    fn overflow_evicts_the_oldest_entry() {
        let mut stack = stack_with(12, 10);
        assert_eq!(stack.depth(), 10);
        for expected in (2..12).rev() {
            assert_eq!(stack.pop().unwrap().description, format!("action {expected}"));
        }
        assert!(stack.pop().is_none());
    }
}
