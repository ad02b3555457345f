//! WebSocket endpoint for remote and agent links.
//!
//! One endpoint per role: `GET /ws/{role}/{user_id}?token=...`. The token
//! is checked before the upgrade completes; unauthenticated peers never
//! reach the link handler. Each accepted connection becomes a registry
//! link with a writer task (drains the control outbox and the frame gate)
//! and a reader loop (routes inbound envelopes).

use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{Path, Query, State, WebSocketUpgrade};
use axum::http::StatusCode;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::stream::{SplitSink, SplitStream};
use futures_util::{SinkExt, StreamExt};
use serde::Deserialize;
use tokio::sync::watch;
use tracing::{debug, info, warn};

use periscope_proto::{CommandResponse, Envelope, EnvelopeBody};
use periscope_types::{LinkRole, UserId};

use crate::link::{LinkHandle, LinkReceiver};
use crate::router::CommandRouter;

/// Shared state for the WebSocket endpoint.
#[derive(Clone)]
pub struct AppState {
    router: Arc<CommandRouter>,
    shutdown: watch::Receiver<bool>,
}

impl AppState {
    pub fn new(router: Arc<CommandRouter>, shutdown: watch::Receiver<bool>) -> Self {
        Self { router, shutdown }
    }
}

/// Build the relay's routes.
pub fn routes(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/ws/{role}/{user_id}", get(ws_upgrade))
        .with_state(state)
}

async fn health() -> &'static str {
    "ok"
}

#[derive(Debug, Deserialize)]
struct WsAuthParams {
    token: Option<String>,
}

/// `GET /ws/{role}/{user_id}` with token auth before the upgrade.
async fn ws_upgrade(
    State(state): State<AppState>,
    Path((role, user_id)): Path<(String, String)>,
    Query(params): Query<WsAuthParams>,
    ws: WebSocketUpgrade,
) -> impl IntoResponse {
    let Some(role) = LinkRole::parse(&role) else {
        return (StatusCode::BAD_REQUEST, "unknown link role").into_response();
    };
    let user = UserId::new(user_id);

    let token = params.token.unwrap_or_default();
    if let Err(err) = state.router.registry().authenticate(&user, &token) {
        warn!(%user, %role, %err, "rejecting websocket upgrade");
        return (StatusCode::UNAUTHORIZED, "authentication failed").into_response();
    }

    info!(%user, %role, "authenticated, upgrading connection");
    ws.on_upgrade(move |socket| handle_link(socket, state, user, role))
        .into_response()
}

/// Run one accepted connection until it closes.
async fn handle_link(socket: WebSocket, state: AppState, user: UserId, role: LinkRole) {
    let (link, receiver) = LinkHandle::open(user.clone(), role);
    // bind closes any replaced link of the same role.
    if let Err(err) = state.router.registry().bind(link.clone()).await {
        warn!(%user, %role, %err, "failed to bind link");
        return;
    }

    // A command issued while the agent was offline is delivered first
    // thing on reconnect.
    if role == LinkRole::Agent {
        if let Some(body) = state.router.registry().take_queued(&user).await {
            if let EnvelopeBody::Cmd { ref command, .. } = body {
                info!(%user, command = command.name(), "delivering queued command");
            }
            let _ = link.send(body);
        }
    }

    let (ws_sender, ws_receiver) = socket.split();
    let writer = tokio::spawn(run_writer(ws_sender, receiver, user.clone()));

    run_reader(ws_receiver, &state, &link).await;

    // The slot may already hold a replacement; only evict ourselves.
    link.close();
    state
        .router
        .registry()
        .unbind(&user, role, link.id())
        .await;
    let _ = writer.await;
    info!(%user, %role, id = %link.id(), "connection closed");
}

/// Drain the control outbox and the frame gate onto the socket.
///
/// Control messages always take priority; frames are only pulled when the
/// outbox is momentarily empty, so a backlogged stream cannot delay a
/// command or its result.
async fn run_writer(
    mut ws_sender: SplitSink<WebSocket, Message>,
    mut receiver: LinkReceiver,
    user: UserId,
) {
    loop {
        tokio::select! {
            biased;
            changed = receiver.closed_rx.changed() => {
                if changed.is_err() || *receiver.closed_rx.borrow() {
                    break;
                }
            }
            env = receiver.control_rx.recv() => {
                let Some(env) = env else { break };
                if ws_sender.send(Message::Text(env.encode().into())).await.is_err() {
                    break;
                }
            }
            _ = receiver.frames.ready() => {
                while let Some(frame) = receiver.frames.take() {
                    let env = Envelope::new(
                        user.clone(),
                        frame.sequence,
                        EnvelopeBody::Frame { frame },
                    );
                    if ws_sender.send(Message::Text(env.encode().into())).await.is_err() {
                        return;
                    }
                }
            }
        }
    }
    let _ = ws_sender.close().await;
}

/// Route inbound envelopes until the socket or the link closes.
async fn run_reader(mut ws_receiver: SplitStream<WebSocket>, state: &AppState, link: &LinkHandle) {
    let mut shutdown = state.shutdown.clone();
    let mut closed = link.closed_watch();
    loop {
        let msg = tokio::select! {
            msg = ws_receiver.next() => msg,
            _ = async { let _ = closed.wait_for(|&v| v).await; } => break,
            _ = async { let _ = shutdown.wait_for(|&v| v).await; } => break,
        };
        match msg {
            Some(Ok(Message::Text(text))) => {
                link.touch();
                match Envelope::decode(&text) {
                    Ok(env) => handle_envelope(state, link, env.body).await,
                    Err(err) => {
                        debug!(user = %link.user(), %err, "discarding undecodable envelope");
                    }
                }
            }
            Some(Ok(Message::Ping(_) | Message::Pong(_))) => link.touch(),
            Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
            Some(Ok(Message::Binary(_))) => {
                debug!(user = %link.user(), "discarding binary message");
            }
        }
    }
}

async fn handle_envelope(state: &AppState, link: &LinkHandle, body: EnvelopeBody) {
    let registry = state.router.registry();
    let user = link.user();
    match (link.role(), body) {
        (_, EnvelopeBody::Ping) => {
            let _ = link.send(EnvelopeBody::Pong);
        }
        (_, EnvelopeBody::Pong) => {}

        // Agent-side traffic fans out to the remote link.
        (LinkRole::Agent, EnvelopeBody::CmdResult { id, response }) => {
            state.router.dispatcher().complete(id, response);
        }
        (LinkRole::Agent, EnvelopeBody::Frame { frame }) => {
            let _ = registry.offer_frame(user, frame).await;
        }
        (LinkRole::Agent, EnvelopeBody::Event { event }) => {
            if let Err(err) = registry
                .route(user, LinkRole::Remote, EnvelopeBody::Event { event })
                .await
            {
                debug!(%user, %err, "dropping agent event");
            }
        }

        // Remote-side commands go through the router; the response (or the
        // error, folded into one) comes back on the same link.
        (LinkRole::Remote, EnvelopeBody::Cmd { id, command }) => {
            let response = match state.router.dispatch(user, command).await {
                Ok(response) => response,
                Err(err) => CommandResponse::from(&err),
            };
            let _ = link.send(EnvelopeBody::CmdResult { id, response });
        }

        (role, other) => {
            debug!(%user, %role, body = ?other, "discarding envelope not valid for this role");
        }
    }
}
