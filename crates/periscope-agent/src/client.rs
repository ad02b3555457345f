//! Relay client: one authenticated WebSocket link with reconnect.
//!
//! The agent initiates the connection, authenticates via the URL token,
//! and then serves the link until it drops: executes inbound commands,
//! pushes stream frames and out-of-band events, keeps the link alive with
//! pings, and runs the periodic maintenance (watchdog poll, pending
//! expiry, stream stats). Commands execute on their own tasks, so a
//! long-running one never starves frames or keepalive. Lost links are
//! re-established with exponential backoff; session state lives in the
//! executor and survives the gap.

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use futures_util::{SinkExt, StreamExt};
use tokio::net::TcpStream;
use tokio::sync::{mpsc, watch};
use tokio_tungstenite::tungstenite::Message;
use tokio_tungstenite::{connect_async, MaybeTlsStream, WebSocketStream};
use tracing::{debug, info, warn};

use periscope_proto::{AgentEvent, Command, Envelope, EnvelopeBody};
use periscope_types::AgentConfig;
use uuid::Uuid;

use crate::executor::CommandExecutor;

/// Cadence of the watchdog poll and pending expiry sweep.
const MAINTENANCE_TICK: Duration = Duration::from_secs(1);

/// Capacity of the per-session command result channel.
const RESULT_CHANNEL_CAPACITY: usize = 16;

type WsStream = WebSocketStream<MaybeTlsStream<TcpStream>>;

/// Double the reconnect delay up to the configured ceiling.
fn next_backoff(current: Duration, max: Duration) -> Duration {
    (current * 2).min(max)
}

/// Run one command on its own task, reporting the result through
/// `results`. The link loop keeps serving frames and pings meanwhile.
fn spawn_execution(
    executor: Arc<CommandExecutor>,
    id: Uuid,
    command: Command,
    results: mpsc::Sender<EnvelopeBody>,
) {
    tokio::spawn(async move {
        let response = executor.execute(command).await;
        let _ = results.send(EnvelopeBody::CmdResult { id, response }).await;
    });
}

enum SessionEnd {
    Shutdown,
    Disconnected,
}

/// The agent's side of the relay link.
pub struct AgentClient {
    config: AgentConfig,
    executor: Arc<CommandExecutor>,
    events_rx: mpsc::Receiver<AgentEvent>,
}

impl AgentClient {
    pub fn new(
        config: AgentConfig,
        executor: Arc<CommandExecutor>,
        events_rx: mpsc::Receiver<AgentEvent>,
    ) -> Self {
        Self {
            config,
            executor,
            events_rx,
        }
    }

    fn endpoint(&self) -> String {
        format!(
            "{}/ws/agent/{}?token={}",
            self.config.server_url.trim_end_matches('/'),
            self.config.user_id,
            self.config.auth_token
        )
    }

    /// Connect and serve until `shutdown` flips.
    pub async fn run(mut self, mut shutdown: watch::Receiver<bool>) -> anyhow::Result<()> {
        let initial = Duration::from_secs(self.config.reconnect_initial_secs);
        let max = Duration::from_secs(self.config.reconnect_max_secs);
        let mut delay = initial;

        loop {
            if *shutdown.borrow() {
                return Ok(());
            }
            match connect_async(self.endpoint()).await {
                Ok((stream, _)) => {
                    info!(url = %self.config.server_url, "connected to relay");
                    delay = initial;
                    match self.run_session(stream, &mut shutdown).await {
                        SessionEnd::Shutdown => return Ok(()),
                        SessionEnd::Disconnected => {
                            // A lost link cancels the stream; the remote
                            // restarts it explicitly after reconnect.
                            self.executor.pipeline().stop();
                            warn!("link to relay lost");
                        }
                    }
                }
                Err(err) => {
                    warn!(%err, retry_in = ?delay, "connection to relay failed");
                }
            }
            tokio::select! {
                _ = tokio::time::sleep(delay) => {}
                _ = async { let _ = shutdown.wait_for(|&v| v).await; } => return Ok(()),
            }
            delay = next_backoff(delay, max);
        }
    }

    async fn run_session(
        &mut self,
        mut ws: WsStream,
        shutdown: &mut watch::Receiver<bool>,
    ) -> SessionEnd {
        let mut seq: u64 = 0;
        let mut frames_sent: u64 = 0;
        let mut keepalive =
            tokio::time::interval(Duration::from_secs(self.config.keepalive_interval_secs));
        keepalive.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        let mut maintenance = tokio::time::interval(MAINTENANCE_TICK);
        maintenance.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Skip);
        let pipeline = Arc::clone(self.executor.pipeline());
        let (results_tx, mut results_rx) = mpsc::channel(RESULT_CHANNEL_CAPACITY);

        loop {
            tokio::select! {
                _ = async { let _ = shutdown.wait_for(|&v| v).await; } => {
                    let _ = ws.close(None).await;
                    return SessionEnd::Shutdown;
                }

                msg = ws.next() => {
                    let Some(Ok(msg)) = msg else {
                        return SessionEnd::Disconnected;
                    };
                    if self.handle_message(&mut ws, &mut seq, msg, &results_tx).await.is_err() {
                        return SessionEnd::Disconnected;
                    }
                }

                result = results_rx.recv() => {
                    // results_tx outlives the loop, so recv never yields None.
                    let Some(body) = result else {
                        return SessionEnd::Disconnected;
                    };
                    if self.send(&mut ws, &mut seq, body).await.is_err() {
                        return SessionEnd::Disconnected;
                    }
                }

                frame = pipeline.next_frame() => {
                    let body = EnvelopeBody::Frame { frame };
                    if self.send(&mut ws, &mut seq, body).await.is_err() {
                        return SessionEnd::Disconnected;
                    }
                    frames_sent += 1;
                }

                event = self.events_rx.recv() => {
                    let Some(event) = event else {
                        return SessionEnd::Disconnected;
                    };
                    if self.send(&mut ws, &mut seq, EnvelopeBody::Event { event }).await.is_err() {
                        return SessionEnd::Disconnected;
                    }
                }

                _ = keepalive.tick() => {
                    if self.send(&mut ws, &mut seq, EnvelopeBody::Ping).await.is_err() {
                        return SessionEnd::Disconnected;
                    }
                    if pipeline.is_streaming() {
                        let stats = pipeline.stats();
                        let event = AgentEvent::StreamStats {
                            frames_sent,
                            frames_dropped: stats.frames_dropped,
                        };
                        if self.send(&mut ws, &mut seq, EnvelopeBody::Event { event }).await.is_err() {
                            return SessionEnd::Disconnected;
                        }
                    }
                }

                _ = maintenance.tick() => {
                    let mut events = Vec::new();
                    events.extend(self.executor.poll_watchdog());
                    events.extend(self.executor.sweep_pending());
                    for event in events {
                        if self.send(&mut ws, &mut seq, EnvelopeBody::Event { event }).await.is_err() {
                            return SessionEnd::Disconnected;
                        }
                    }
                }
            }
        }
    }

    async fn handle_message(
        &self,
        ws: &mut WsStream,
        seq: &mut u64,
        msg: Message,
        results_tx: &mpsc::Sender<EnvelopeBody>,
    ) -> anyhow::Result<()> {
        match msg {
            Message::Text(text) => {
                let env = match Envelope::decode(&text) {
                    Ok(env) => env,
                    Err(err) => {
                        debug!(%err, "discarding undecodable envelope");
                        return Ok(());
                    }
                };
                match env.body {
                    EnvelopeBody::Cmd { id, command } => {
                        spawn_execution(
                            Arc::clone(&self.executor),
                            id,
                            command,
                            results_tx.clone(),
                        );
                    }
                    EnvelopeBody::Ping => {
                        self.send(ws, seq, EnvelopeBody::Pong).await?;
                    }
                    EnvelopeBody::Pong => {}
                    other => {
                        debug!(body = ?other, "discarding envelope not meant for the agent");
                    }
                }
                Ok(())
            }
            Message::Ping(_) | Message::Pong(_) => Ok(()),
            Message::Close(_) => Err(anyhow::anyhow!("relay closed the link")),
            other => {
                debug!(?other, "ignoring non-text message");
                Ok(())
            }
        }
    }

    async fn send(
        &self,
        ws: &mut WsStream,
        seq: &mut u64,
        body: EnvelopeBody,
    ) -> anyhow::Result<()> {
        let env = Envelope::new(self.config.user_id.clone(), *seq, body);
        *seq += 1;
        ws.send(Message::Text(env.encode()))
            .await
            .context("websocket send failed")
    }
}
