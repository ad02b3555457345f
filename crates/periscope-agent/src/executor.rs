//! Command execution on the controlled machine.
//!
//! The executor owns the agent-side session state (undo stack, pending
//! board, watchdog, capture pipeline) and turns each relayed command into
//! screen actions. Dispatch is an exhaustive match; commands the relay
//! answers at its own boundary are refused here so a routing bug cannot
//! silently do the wrong thing.

use std::sync::{Arc, Mutex};
use std::time::Duration;

use serde_json::json;
use tokio::sync::mpsc;
use tracing::{info, warn};

use periscope_proto::{AgentEvent, Command, CommandResponse, PendingState};
use periscope_types::AgentConfig;

use crate::assistant::AssistantAdapter;
use crate::capture::{CapturePipeline, ScreenController};
use crate::pending::PendingBoard;
use crate::undo::{ReverseOp, UndoStack};
use crate::watchdog::Watchdog;

/// Key combo that approves the AI's proposed action in the session UI.
const ACCEPT_COMBO: &str = "alt+Return";

/// Key combo that dismisses the AI's proposed action.
const REJECT_COMBO: &str = "Escape";

/// Executes relayed commands against the local session.
pub struct CommandExecutor {
    controller: Arc<dyn ScreenController>,
    assistant: Arc<dyn AssistantAdapter>,
    pipeline: Arc<CapturePipeline>,
    undo: Mutex<UndoStack>,
    pending: Mutex<PendingBoard>,
    watchdog: Mutex<Watchdog>,
    events: mpsc::Sender<AgentEvent>,
    config: AgentConfig,
}

impl CommandExecutor {
    pub fn new(
        controller: Arc<dyn ScreenController>,
        assistant: Arc<dyn AssistantAdapter>,
        pipeline: Arc<CapturePipeline>,
        events: mpsc::Sender<AgentEvent>,
        config: AgentConfig,
    ) -> Self {
        Self {
            controller,
            assistant,
            pipeline,
            undo: Mutex::new(UndoStack::new(config.undo_max_depth)),
            pending: Mutex::new(PendingBoard::new(Duration::from_secs(
                config.pending_expiry_secs,
            ))),
            watchdog: Mutex::new(Watchdog::new(
                Duration::from_secs(config.watchdog_quiet_secs),
                false,
            )),
            events,
            config,
        }
    }

    /// Execute one command. Failures are folded into the response; this
    /// never takes down the link.
    pub async fn execute(&self, command: Command) -> CommandResponse {
        info!(command = command.name(), "executing");
        match command {
            Command::Screenshot => match self.pipeline.one_shot().await {
                Ok(frame) => CommandResponse::ok_with_frame("screenshot captured", frame),
                Err(err) => CommandResponse::error(format!("capture failed: {err}")),
            },

            Command::Scroll { direction, amount } => {
                if let Err(err) = self.controller.scroll(direction, amount).await {
                    return CommandResponse::error(format!("scroll failed: {err}"));
                }
                self.undo.lock().expect("undo lock").record(
                    format!("scroll {amount}"),
                    ReverseOp::Scroll {
                        direction: direction.opposite(),
                        amount,
                    },
                );
                CommandResponse::ok("scrolled")
            }

            Command::Accept { id } => self.resolve_pending(id, PendingState::Accepted).await,
            Command::Reject { id } => self.resolve_pending(id, PendingState::Rejected).await,

            Command::RelayText { text } => {
                if let Err(err) = self.assistant.relay(&text).await {
                    return CommandResponse::error(format!("relay failed: {err}"));
                }
                // Prompting restarts the quiet clock.
                self.watchdog.lock().expect("watchdog lock").activity();
                CommandResponse::ok("text relayed to the assistant")
            }

            Command::Diff => self.workspace_diff().await,

            Command::Undo { steps } => self.undo_steps(steps).await,

            Command::Tts { text } => match self.controller.speak(&text).await {
                Ok(()) => CommandResponse::ok("spoken"),
                Err(err) => CommandResponse::error(format!("tts failed: {err}")),
            },

            Command::KeyCombo { combo } => match self.controller.key_combo(&combo).await {
                Ok(()) => CommandResponse::ok(format!("sent {combo}")),
                Err(err) => CommandResponse::error(format!("key combo failed: {err}")),
            },

            Command::WatchdogToggle { enabled } => {
                self.watchdog
                    .lock()
                    .expect("watchdog lock")
                    .set_enabled(enabled);
                CommandResponse::ok(if enabled {
                    "watchdog enabled"
                } else {
                    "watchdog disabled"
                })
            }

            Command::StreamStart { fps } => {
                let fps = fps.unwrap_or(self.config.stream_fps);
                self.pipeline.start(fps);
                CommandResponse::ok(format!("streaming at {fps} fps"))
            }
            Command::StreamStop => {
                if self.pipeline.stop() {
                    CommandResponse::ok("stream stopped")
                } else {
                    CommandResponse::ok("no stream was running")
                }
            }

            other @ (Command::Schedule { .. }
            | Command::ScheduleCancel { .. }
            | Command::ScheduleList
            | Command::Pause
            | Command::Resume
            | Command::Status) => {
                warn!(command = other.name(), "misrouted session-boundary command");
                CommandResponse::error(format!("{} is handled by the relay", other.name()))
            }
        }
    }

    async fn resolve_pending(&self, id: Option<uuid::Uuid>, state: PendingState) -> CommandResponse {
        let resolved = self.pending.lock().expect("pending lock").resolve(id, state);
        let resolved = match resolved {
            Ok(action) => Some(action),
            // Without an explicit id the verdict is still keyed through,
            // even when no proposal was tracked.
            Err(_) if id.is_none() => None,
            Err(err) => return CommandResponse::from(&err),
        };

        let combo = match state {
            PendingState::Accepted => ACCEPT_COMBO,
            _ => REJECT_COMBO,
        };
        if let Err(err) = self.controller.key_combo(combo).await {
            return CommandResponse::error(format!("key combo failed: {err}"));
        }
        if state == PendingState::Accepted {
            self.undo
                .lock()
                .expect("undo lock")
                .record("accept proposed action", ReverseOp::KeyCombo("ctrl+z".into()));
        }

        match resolved {
            Some(action) => {
                let _ = self.events.try_send(AgentEvent::PendingResolved {
                    id: action.id,
                    state,
                });
                CommandResponse::ok(format!("{state:?}: {}", action.description))
            }
            None => CommandResponse::ok(format!("{state:?} sent (no tracked proposal)")),
        }
    }

    async fn workspace_diff(&self) -> CommandResponse {
        let mut cmd = tokio::process::Command::new("git");
        if let Some(dir) = &self.config.workspace_dir {
            cmd.arg("-C").arg(dir);
        }
        let output = match cmd.arg("diff").arg("HEAD").output().await {
            Ok(output) => output,
            Err(err) => return CommandResponse::error(format!("git diff failed: {err}")),
        };
        if !output.status.success() {
            let stderr = String::from_utf8_lossy(&output.stderr);
            return CommandResponse::error(format!("git diff failed: {}", stderr.trim()));
        }
        let diff = String::from_utf8_lossy(&output.stdout).into_owned();
        if diff.is_empty() {
            CommandResponse::ok("working tree clean")
        } else {
            CommandResponse::ok_with_data(
                format!("{} changed lines", diff.lines().count()),
                json!({ "diff": diff }),
            )
        }
    }

    async fn undo_steps(&self, steps: u32) -> CommandResponse {
        let mut reverted = 0u32;
        let mut failure = None;
        for _ in 0..steps {
            let Some(entry) = self.undo.lock().expect("undo lock").pop() else {
                break;
            };
            if let Err(err) = entry.reverse.apply(self.controller.as_ref()).await {
                warn!(action = %entry.description, %err, "reverse operation failed, halting undo");
                failure = Some(format!("{} ({err})", entry.description));
                break;
            }
            reverted += 1;
        }
        match failure {
            Some(failed) => CommandResponse::ok_with_data(
                format!("reverted {reverted} of {steps} requested; halted at {failed}"),
                json!({ "reverted": reverted }),
            ),
            None if reverted == 0 => CommandResponse::ok("nothing to undo"),
            None => CommandResponse::ok_with_data(
                format!("reverted {reverted} of {steps} requested"),
                json!({ "reverted": reverted }),
            ),
        }
    }

    /// Track a newly observed AI proposal and announce it.
    pub fn note_pending(&self, description: impl Into<String>, diff: Option<String>) {
        let action = self
            .pending
            .lock()
            .expect("pending lock")
            .add(description, diff);
        self.watchdog.lock().expect("watchdog lock").activity();
        let _ = self.events.try_send(AgentEvent::PendingAction {
            id: action.id,
            description: action.description,
            diff: action.diff,
            created_at: action.created_at,
        });
    }

    /// Forward a textual AI response to the remote side.
    pub fn note_response(&self, text: impl Into<String>) {
        self.watchdog.lock().expect("watchdog lock").activity();
        let _ = self
            .events
            .try_send(AgentEvent::AssistantResponse { text: text.into() });
    }

    /// Record AI output for the stall detector.
    pub fn note_activity(&self) {
        self.watchdog.lock().expect("watchdog lock").activity();
    }

    /// Check the watchdog; at most one alert per quiet episode.
    pub fn poll_watchdog(&self) -> Option<AgentEvent> {
        self.watchdog
            .lock()
            .expect("watchdog lock")
            .poll()
            .map(|idle_secs| AgentEvent::WatchdogAlert { idle_secs })
    }

    /// Expire stale proposals, reporting each as resolved-expired.
    pub fn sweep_pending(&self) -> Vec<AgentEvent> {
        self.pending
            .lock()
            .expect("pending lock")
            .sweep_expired()
            .into_iter()
            .map(|action| AgentEvent::PendingResolved {
                id: action.id,
                state: PendingState::Expired,
            })
            .collect()
    }

    pub fn pipeline(&self) -> &Arc<CapturePipeline> {
        &self.pipeline
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::assistant::ScreenAssistant;
    use crate::capture::tests::FakeController;
    use periscope_proto::ScrollDirection;
    use periscope_types::UserId;
    use std::sync::atomic::Ordering;

    fn test_config() -> AgentConfig {
        AgentConfig {
            server_url: "ws://127.0.0.1:10000".into(),
            user_id: UserId::new("u1"),
            auth_token: "tok".into(),
            stream_fps: 10,
            keepalive_interval_secs: 30,
            reconnect_initial_secs: 5,
            reconnect_max_secs: 60,
            watchdog_quiet_secs: 0,
            undo_max_depth: 10,
            pending_expiry_secs: 300,
            workspace_dir: None,
            capture_command: None,
            tts_command: None,
        }
    }

    fn executor() -> (
        CommandExecutor,
        Arc<FakeController>,
        mpsc::Receiver<AgentEvent>,
    ) {
        let controller = Arc::new(FakeController::default());
        let shared: Arc<dyn ScreenController> = controller.clone();
        let (events_tx, events_rx) = mpsc::channel(16);
        let executor = CommandExecutor::new(
            Arc::clone(&shared),
            Arc::new(ScreenAssistant::new(Arc::clone(&shared))),
            CapturePipeline::new(shared),
            events_tx,
            test_config(),
        );
        (executor, controller, events_rx)
    }

    #[tokio::test]
    async fn screenshot_returns_a_frame() {
        let (executor, _, _rx) = executor();
        let response = executor.execute(Command::Screenshot).await;
        assert!(response.ok);
        assert!(response.frame.is_some());
    }

    #[tokio::test]
    async fn undo_reverses_scrolls_in_lifo_order() {
        let (executor, controller, _rx) = executor();
        executor
            .execute(Command::Scroll {
                direction: ScrollDirection::Down,
                amount: 3,
            })
            .await;
        executor
            .execute(Command::Scroll {
                direction: ScrollDirection::Up,
                amount: 1,
            })
            .await;

        let response = executor.execute(Command::Undo { steps: 2 }).await;
        assert!(response.ok);
        assert_eq!(response.data.unwrap()["reverted"], 2);

        let scrolls = controller.scrolls.lock().unwrap().clone();
        assert_eq!(
            scrolls,
            vec![
                (ScrollDirection::Down, 3),
                (ScrollDirection::Up, 1),
                // Reverses, most recent action first.
                (ScrollDirection::Down, 1),
                (ScrollDirection::Up, 3),
            ]
        );
    }

    #[tokio::test]
    async fn undo_reports_partial_progress_on_failure() {
        let (executor, controller, _rx) = executor();
        for _ in 0..3 {
            executor
                .execute(Command::Scroll {
                    direction: ScrollDirection::Down,
                    amount: 1,
                })
                .await;
        }
        controller.fail_input.store(true, Ordering::Relaxed);

        let response = executor.execute(Command::Undo { steps: 3 }).await;
        assert!(response.ok);
        assert_eq!(response.data.unwrap()["reverted"], 0);
        assert!(response.message.contains("0 of 3"));
    }

    #[tokio::test]
    async fn undo_with_empty_stack_is_a_noop() {
        let (executor, _, _rx) = executor();
        let response = executor.execute(Command::Undo { steps: 1 }).await;
        assert!(response.ok);
        assert_eq!(response.message, "nothing to undo");
    }

    #[tokio::test]
    async fn accept_resolves_the_tracked_proposal() {
        let (executor, controller, mut rx) = executor();
        executor.note_pending("apply refactor", Some("diff".into()));
        let announced = rx.recv().await.unwrap();
        let AgentEvent::PendingAction { id, .. } = announced else {
            panic!("expected pending_action, got {announced:?}");
        };

        let response = executor.execute(Command::Accept { id: Some(id) }).await;
        assert!(response.ok);
        assert!(response.message.contains("apply refactor"));
        assert_eq!(controller.combos.lock().unwrap().as_slice(), [ACCEPT_COMBO]);

        let resolved = rx.recv().await.unwrap();
        assert!(matches!(
            resolved,
            AgentEvent::PendingResolved {
                state: PendingState::Accepted,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn reject_without_tracked_proposal_still_keys_through() {
        let (executor, controller, _rx) = executor();
        let response = executor.execute(Command::Reject { id: None }).await;
        assert!(response.ok);
        assert_eq!(controller.combos.lock().unwrap().as_slice(), [REJECT_COMBO]);
    }

    #[tokio::test]
    async fn accept_by_unknown_id_fails() {
        let (executor, _, _rx) = executor();
        let response = executor
            .execute(Command::Accept {
                id: Some(uuid::Uuid::new_v4()),
            })
            .await;
        assert!(!response.ok);
    }

    #[tokio::test]
    async fn relay_text_reaches_the_assistant() {
        let (executor, controller, _rx) = executor();
        let response = executor
            .execute(Command::RelayText {
                text: "run the tests".into(),
            })
            .await;
        assert!(response.ok);
        assert_eq!(controller.typed.lock().unwrap().as_slice(), ["run the tests"]);
    }

    #[tokio::test]
    async fn session_boundary_commands_are_refused() {
        let (executor, _, _rx) = executor();
        for command in [Command::Pause, Command::Status, Command::ScheduleList] {
            let response = executor.execute(command).await;
            assert!(!response.ok);
            assert!(response.message.contains("handled by the relay"));
        }
    }

    #[tokio::test]
    async fn watchdog_alerts_once_until_fresh_activity() {
        let (executor, _, _rx) = executor();
        executor
            .execute(Command::WatchdogToggle { enabled: true })
            .await;
        tokio::time::sleep(Duration::from_millis(1)).await;

        assert!(matches!(
            executor.poll_watchdog(),
            Some(AgentEvent::WatchdogAlert { .. })
        ));
        assert!(executor.poll_watchdog().is_none());

        executor.note_activity();
        tokio::time::sleep(Duration::from_millis(1)).await;
        assert!(executor.poll_watchdog().is_some());
    }

    #[tokio::test]
    async fn assistant_response_becomes_an_event() {
        let (executor, _, mut rx) = executor();
        executor.note_response("done, tests pass");

        let event = rx.recv().await.unwrap();
        assert_eq!(
            event,
            AgentEvent::AssistantResponse {
                text: "done, tests pass".into()
            }
        );
    }

    #[tokio::test]
    async fn stream_lifecycle_through_commands() {
        let (executor, _, _rx) = executor();
        let response = executor
            .execute(Command::StreamStart { fps: Some(20) })
            .await;
        assert!(response.ok);
        assert!(executor.pipeline().is_streaming());

        let response = executor.execute(Command::StreamStop).await;
        assert!(response.ok);
        assert!(!executor.pipeline().is_streaming());
    }
}
