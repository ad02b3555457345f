//! Command routing.
//!
//! Single entry point for every command a remote client issues. The
//! validation order is fixed: session registered, session not paused
//! (unless the command is exempt), agent reachable for agent-routed
//! commands, then kind-specific argument checks. Session-boundary
//! commands (pause/resume/status and the schedule operations) are
//! answered here; everything else is forwarded to the agent and awaited.

use std::sync::Arc;

use chrono::Utc;
use serde_json::json;
use tracing::{info, warn};
use uuid::Uuid;

use periscope_proto::{Command, CommandResponse, EnvelopeBody};
use periscope_types::{RelayConfig, RelayError, UserId};

use crate::dispatch::Dispatcher;
use crate::registry::SessionRegistry;
use crate::scheduler::{parse_fire_time, Scheduler};

/// Routes commands between the session boundary and the agent.
pub struct CommandRouter {
    registry: Arc<SessionRegistry>,
    dispatcher: Arc<Dispatcher>,
    scheduler: Arc<Scheduler>,
    config: RelayConfig,
}

impl CommandRouter {
    pub fn new(
        registry: Arc<SessionRegistry>,
        dispatcher: Arc<Dispatcher>,
        scheduler: Arc<Scheduler>,
        config: RelayConfig,
    ) -> Self {
        Self {
            registry,
            dispatcher,
            scheduler,
            config,
        }
    }

    pub fn registry(&self) -> &Arc<SessionRegistry> {
        &self.registry
    }

    pub fn dispatcher(&self) -> &Arc<Dispatcher> {
        &self.dispatcher
    }

    pub fn scheduler(&self) -> &Arc<Scheduler> {
        &self.scheduler
    }

    /// Validate and execute one command on behalf of `user`.
    pub async fn dispatch(
        &self,
        user: &UserId,
        command: Command,
    ) -> Result<CommandResponse, RelayError> {
        if self.registry.is_suspended(user).await? && !command.exempt_from_pause() {
            return Err(RelayError::AgentPaused);
        }

        if command.routes_to_agent() {
            self.dispatch_to_agent(user, command).await
        } else {
            command.validate()?;
            self.handle_local(user, command).await
        }
    }

    async fn dispatch_to_agent(
        &self,
        user: &UserId,
        command: Command,
    ) -> Result<CommandResponse, RelayError> {
        // Presence is checked before the arguments: an unreachable agent
        // is reported as offline regardless of what was asked of it.
        let agent = match self.registry.agent_link(user).await {
            Ok(agent) => agent,
            Err(RelayError::AgentOffline) => {
                // Hold the last-issued command for the reconnect grace
                // window; the issuer is still told the agent is offline.
                // A command that fails validation is never queued.
                if command.validate().is_ok() {
                    warn!(%user, command = command.name(), "agent offline, queueing command");
                    self.registry
                        .queue_command(
                            user,
                            EnvelopeBody::Cmd {
                                id: Uuid::new_v4(),
                                command,
                            },
                            self.config.command_grace(),
                        )
                        .await?;
                }
                return Err(RelayError::AgentOffline);
            }
            Err(err) => return Err(err),
        };
        command.validate()?;
        self.dispatcher
            .dispatch(&agent, command, self.config.dispatch_timeout())
            .await
    }

    async fn handle_local(
        &self,
        user: &UserId,
        command: Command,
    ) -> Result<CommandResponse, RelayError> {
        match command {
            Command::Pause => {
                self.registry.set_suspended(user, true).await?;
                info!(%user, "session paused");
                Ok(CommandResponse::ok("session paused; /resume to continue"))
            }
            Command::Resume => {
                self.registry.set_suspended(user, false).await?;
                info!(%user, "session resumed");
                Ok(CommandResponse::ok("session resumed"))
            }
            Command::Status => {
                let (remote, agent) = self.registry.lookup(user).await?;
                let suspended = self.registry.is_suspended(user).await?;
                Ok(CommandResponse::ok_with_data(
                    if agent { "agent connected" } else { "agent offline" },
                    json!({
                        "remote_connected": remote,
                        "agent_connected": agent,
                        "suspended": suspended,
                        "armed_schedules": self.scheduler.armed_count(user),
                    }),
                ))
            }
            Command::Schedule { at, command } => {
                let fire_at = parse_fire_time(&at, Utc::now())?;
                let entry = self.scheduler.add(user.clone(), fire_at, *command);
                Ok(CommandResponse::ok_with_data(
                    format!("scheduled {} for {}", entry.command.name(), entry.fire_at),
                    json!({ "id": entry.id, "fire_at": entry.fire_at }),
                ))
            }
            Command::ScheduleCancel { id } => {
                self.scheduler.cancel(user, id)?;
                Ok(CommandResponse::ok(format!("schedule entry {id} cancelled")))
            }
            Command::ScheduleList => {
                let entries = self.scheduler.list(user);
                let message = if entries.is_empty() {
                    "no armed schedule entries".to_string()
                } else {
                    format!("{} armed schedule entries", entries.len())
                };
                Ok(CommandResponse::ok_with_data(
                    message,
                    serde_json::to_value(entries).unwrap_or_default(),
                ))
            }
            // routes_to_agent() keeps everything else out of this arm.
            other => Err(RelayError::Validation(format!(
                "{} is not a session-boundary command",
                other.name()
            ))),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkHandle;
    use periscope_types::{LinkRole, UserEntry};
    use std::time::Duration;

    fn router() -> (CommandRouter, UserId) {
        let user = UserId::new("u1");
        let config = RelayConfig {
            users: vec![UserEntry {
                id: user.clone(),
                token: "tok".into(),
            }],
            dispatch_timeout_secs: 1,
            ..RelayConfig::default()
        };
        let registry = Arc::new(SessionRegistry::new());
        registry.register(user.clone(), "tok");
        let router = CommandRouter::new(
            registry,
            Arc::new(Dispatcher::new()),
            Arc::new(Scheduler::new()),
            config,
        );
        (router, user)
    }

    #[tokio::test]
    async fn unknown_user_is_rejected() {
        let (router, _) = router();
        let err = router
            .dispatch(&UserId::new("ghost"), Command::Status)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::UnknownUser(_)));
    }

    #[tokio::test]
    async fn paused_session_rejects_all_but_exempt_commands() {
        let (router, user) = router();
        router.dispatch(&user, Command::Pause).await.unwrap();

        let err = router
            .dispatch(&user, Command::Screenshot)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::AgentPaused));

        // Status and resume still work while paused.
        let status = router.dispatch(&user, Command::Status).await.unwrap();
        assert_eq!(status.data.as_ref().unwrap()["suspended"], true);
        router.dispatch(&user, Command::Resume).await.unwrap();
        let status = router.dispatch(&user, Command::Status).await.unwrap();
        assert_eq!(status.data.as_ref().unwrap()["suspended"], false);
    }

    #[tokio::test]
    async fn offline_agent_queues_the_command_and_reports_offline() {
        let (router, user) = router();
        let err = router
            .dispatch(&user, Command::Screenshot)
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::AgentOffline));

        let queued = router.registry().take_queued(&user).await.unwrap();
        assert!(matches!(
            queued,
            EnvelopeBody::Cmd {
                command: Command::Screenshot,
                ..
            }
        ));
    }

    #[tokio::test]
    async fn invalid_arguments_never_reach_the_agent() {
        let (router, user) = router();
        let (agent, mut rx) = LinkHandle::open(user.clone(), LinkRole::Agent);
        router.registry().bind(agent).await.unwrap();

        let err = router
            .dispatch(&user, Command::Undo { steps: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::Validation(_)));
        // The agent link saw no traffic.
        assert!(rx.control_rx.try_recv().is_err());
    }

    #[tokio::test]
    async fn offline_is_reported_before_argument_checks() {
        let (router, user) = router();
        // No agent bound: presence wins over the bad arguments, and the
        // invalid command is not held for reconnect delivery.
        let err = router
            .dispatch(&user, Command::Undo { steps: 0 })
            .await
            .unwrap_err();
        assert!(matches!(err, RelayError::AgentOffline));
        assert!(router.registry().take_queued(&user).await.is_none());
    }

    #[tokio::test]
    async fn agent_routed_command_round_trips_through_the_dispatcher() {
        let (router, user) = router();
        let (agent, mut rx) = LinkHandle::open(user.clone(), LinkRole::Agent);
        router.registry().bind(agent).await.unwrap();

        let dispatcher = Arc::clone(router.dispatcher());
        let responder = tokio::spawn(async move {
            let env = rx.control_rx.recv().await.unwrap();
            let EnvelopeBody::Cmd { id, command } = env.body else {
                panic!("expected cmd");
            };
            assert_eq!(command, Command::Diff);
            dispatcher.complete(id, CommandResponse::ok("clean tree"));
        });

        let response = router.dispatch(&user, Command::Diff).await.unwrap();
        assert!(response.ok);
        assert_eq!(response.message, "clean tree");
        responder.await.unwrap();
    }

    #[tokio::test]
    async fn unresponsive_agent_times_out() {
        let (router, user) = router();
        let (agent, _rx) = LinkHandle::open(user.clone(), LinkRole::Agent);
        router.registry().bind(agent).await.unwrap();

        let started = std::time::Instant::now();
        let err = router.dispatch(&user, Command::Diff).await.unwrap_err();
        assert!(matches!(err, RelayError::DispatchTimeout));
        assert!(started.elapsed() >= Duration::from_secs(1));
    }

    #[tokio::test]
    async fn schedule_lifecycle_is_handled_at_the_boundary() {
        let (router, user) = router();

        let armed = router
            .dispatch(
                &user,
                Command::Schedule {
                    at: "5m".into(),
                    command: Box::new(Command::Screenshot),
                },
            )
            .await
            .unwrap();
        let id: Uuid =
            serde_json::from_value(armed.data.as_ref().unwrap()["id"].clone()).unwrap();

        let listed = router.dispatch(&user, Command::ScheduleList).await.unwrap();
        assert_eq!(listed.data.as_ref().unwrap().as_array().unwrap().len(), 1);

        router
            .dispatch(&user, Command::ScheduleCancel { id })
            .await
            .unwrap();
        let listed = router.dispatch(&user, Command::ScheduleList).await.unwrap();
        assert!(listed.data.as_ref().unwrap().as_array().unwrap().is_empty());
    }
}
