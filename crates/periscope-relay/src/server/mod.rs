//! Relay server assembly: WebSocket endpoint plus background loops.

pub mod ws;

use std::net::SocketAddr;
use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use chrono::{DateTime, Utc};
use tokio::sync::watch;
use tracing::{info, warn};

use periscope_proto::{AgentEvent, Command, EnvelopeBody};
use periscope_types::{LinkRole, RelayConfig};

use crate::dispatch::Dispatcher;
use crate::registry::SessionRegistry;
use crate::router::CommandRouter;
use crate::scheduler::Scheduler;

/// Poll interval for the schedule firing loop.
const SCHEDULER_TICK: Duration = Duration::from_secs(1);

/// Poll interval for the link liveness monitor.
const LIVENESS_TICK: Duration = Duration::from_secs(5);

/// The assembled relay: router, registry, scheduler and endpoint.
pub struct RelayServer {
    router: Arc<CommandRouter>,
    config: RelayConfig,
}

impl RelayServer {
    /// Wire up the relay from its configuration.
    pub fn new(config: RelayConfig) -> Self {
        let registry = Arc::new(SessionRegistry::new());
        for entry in &config.users {
            registry.register(entry.id.clone(), entry.token.clone());
        }
        let router = Arc::new(CommandRouter::new(
            registry,
            Arc::new(Dispatcher::new()),
            Arc::new(Scheduler::new()),
            config.clone(),
        ));
        Self { router, config }
    }

    pub fn router(&self) -> &Arc<CommandRouter> {
        &self.router
    }

    /// Serve until the `shutdown` signal flips to `true`.
    ///
    /// Runs the WebSocket endpoint, the schedule firing loop and the link
    /// liveness monitor; background loops stop with the endpoint.
    pub async fn serve(&self, shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let addr: SocketAddr = self
            .config
            .listen_addr
            .parse()
            .with_context(|| format!("invalid listen address {:?}", self.config.listen_addr))?;

        let scheduler_loop = tokio::spawn(run_scheduler_loop(
            Arc::clone(&self.router),
            shutdown.clone(),
        ));
        let liveness_loop = tokio::spawn(run_liveness_monitor(
            Arc::clone(self.router.registry()),
            self.config.liveness_timeout(),
            shutdown.clone(),
        ));

        let app = ws::routes(ws::AppState::new(Arc::clone(&self.router), shutdown.clone()));
        info!(addr = %addr, "starting relay server");
        let listener = tokio::net::TcpListener::bind(addr)
            .await
            .with_context(|| format!("failed to bind {addr}"))?;

        let mut shutdown_rx = shutdown;
        let result = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = shutdown_rx.wait_for(|&v| v).await;
            })
            .await
            .context("relay server error");

        self.router.dispatcher().abort_all();
        let _ = scheduler_loop.await;
        let _ = liveness_loop.await;
        result
    }
}

/// Drain and dispatch due schedule entries once.
///
/// Each fired entry's command goes through the normal router path, so
/// paused sessions and offline agents produce the same errors an
/// interactive command would. The outcome is reported to the remote link
/// as a `schedule_fired` event; a missing remote just drops the report.
pub async fn fire_due_entries(router: &CommandRouter, now: DateTime<Utc>) {
    for entry in router.scheduler().due(now) {
        let command: Command = entry.command.clone();
        info!(id = %entry.id, user = %entry.user, command = command.name(), "schedule entry fired");
        let (ok, message) = match router.dispatch(&entry.user, command).await {
            Ok(response) => (response.ok, response.message),
            Err(err) => (false, err.to_string()),
        };
        if !ok {
            warn!(id = %entry.id, user = %entry.user, %message, "scheduled command failed");
        }
        let report = EnvelopeBody::Event {
            event: AgentEvent::ScheduleFired {
                id: entry.id,
                ok,
                message,
            },
        };
        let _ = router
            .registry()
            .route(&entry.user, LinkRole::Remote, report)
            .await;
    }
}

async fn run_scheduler_loop(router: Arc<CommandRouter>, mut shutdown: watch::Receiver<bool>) {
    let mut tick = tokio::time::interval(SCHEDULER_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => fire_due_entries(&router, Utc::now()).await,
            // The watch ref must not be held across the other arm's await;
            // discard it inside its own future so the loop stays Send.
            _ = async { let _ = shutdown.wait_for(|&v| v).await; } => break,
        }
    }
}

/// Close links that produced no traffic within the liveness timeout.
///
/// Closing wakes the connection tasks, whose cleanup unbinds the link;
/// presence flips to offline without waiting on TCP to notice.
async fn run_liveness_monitor(
    registry: Arc<SessionRegistry>,
    timeout: Duration,
    mut shutdown: watch::Receiver<bool>,
) {
    let mut tick = tokio::time::interval(LIVENESS_TICK);
    tick.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
    loop {
        tokio::select! {
            _ = tick.tick() => {
                for link in registry.live_links().await {
                    if link.idle() > timeout {
                        warn!(
                            user = %link.user(),
                            role = %link.role(),
                            idle_secs = link.idle().as_secs(),
                            "link exceeded liveness timeout, closing"
                        );
                        link.close();
                    }
                }
            }
            _ = async { let _ = shutdown.wait_for(|&v| v).await; } => break,
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::link::LinkHandle;
    use chrono::Duration as ChronoDuration;
    use periscope_types::UserId;

    fn router_with_user(user: &UserId) -> Arc<CommandRouter> {
        let registry = Arc::new(SessionRegistry::new());
        registry.register(user.clone(), "tok");
        Arc::new(CommandRouter::new(
            registry,
            Arc::new(Dispatcher::new()),
            Arc::new(Scheduler::new()),
            RelayConfig::default(),
        ))
    }

    #[tokio::test]
    async fn fired_entry_outcome_is_reported_to_the_remote() {
        let user = UserId::new("u1");
        let router = router_with_user(&user);
        let (remote, mut remote_rx) = LinkHandle::open(user.clone(), LinkRole::Remote);
        router.registry().bind(remote).await.unwrap();

        let now = Utc::now();
        let entry = router
            .scheduler()
            .add(user.clone(), now - ChronoDuration::seconds(1), Command::Diff);

        // No agent is connected, so the dispatch fails and the failure is
        // what gets reported.
        fire_due_entries(&router, now).await;

        let env = remote_rx.control_rx.recv().await.unwrap();
        let EnvelopeBody::Event {
            event: AgentEvent::ScheduleFired { id, ok, message },
        } = env.body
        else {
            panic!("expected schedule_fired event");
        };
        assert_eq!(id, entry.id);
        assert!(!ok);
        assert!(message.contains("offline"));
        // The entry fired exactly once.
        assert!(router.scheduler().due(now).is_empty());
    }

    #[tokio::test]
    async fn background_loops_run_spawned_and_stop_on_shutdown() {
        let user = UserId::new("u1");
        let router = router_with_user(&user);
        let (shutdown_tx, shutdown_rx) = watch::channel(false);

        let scheduler_loop =
            tokio::spawn(run_scheduler_loop(Arc::clone(&router), shutdown_rx.clone()));
        let liveness_loop = tokio::spawn(run_liveness_monitor(
            Arc::clone(router.registry()),
            Duration::from_secs(60),
            shutdown_rx,
        ));

        shutdown_tx.send(true).unwrap();
        tokio::time::timeout(Duration::from_secs(5), scheduler_loop)
            .await
            .expect("scheduler loop did not stop")
            .unwrap();
        tokio::time::timeout(Duration::from_secs(5), liveness_loop)
            .await
            .expect("liveness loop did not stop")
            .unwrap();
    }

    #[tokio::test]
    async fn entries_not_yet_due_stay_armed() {
        let user = UserId::new("u1");
        let router = router_with_user(&user);
        let now = Utc::now();
        router
            .scheduler()
            .add(user.clone(), now + ChronoDuration::minutes(5), Command::Diff);

        fire_due_entries(&router, now).await;
        assert_eq!(router.scheduler().armed_count(&user), 1);
    }
}
