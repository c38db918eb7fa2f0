//! WebSocket upgrade handler

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        State,
    },
    response::Response,
};
use futures::{
    stream::{SplitSink, SplitStream},
    SinkExt, StreamExt,
};
use tokio::sync::mpsc;
use tokio::time::{interval, Instant};
use tracing::{debug, info, warn};
use uuid::Uuid;

use crate::app::AppState;
use crate::util::rate_limit::SessionRateLimiter;
use crate::ws::protocol::{ClientMsg, ServerMsg};

/// Keepalive ping cadence
const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(15);
/// A ping must be answered within this window
const PONG_TIMEOUT: Duration = Duration::from_secs(5);

/// WebSocket upgrade handler
pub async fn ws_handler(ws: WebSocketUpgrade, State(state): State<AppState>) -> Response {
    ws.on_upgrade(move |socket| handle_socket(socket, state))
}

/// Handle the upgraded WebSocket connection. Each connection is one opaque
/// session key; the session layer routes its commands into rooms.
async fn handle_socket(socket: WebSocket, state: AppState) {
    let session = Uuid::new_v4();
    info!(%session, "new WebSocket connection");

    let (ws_sink, ws_stream) = socket.split();

    // Rooms hold clones of this sender; the handler keeps one so the
    // channel survives between rooms
    let (outbox_tx, outbox_rx) = mpsc::unbounded_channel::<ServerMsg>();

    run_session(session, &state, ws_sink, ws_stream, outbox_tx, outbox_rx).await;

    state.rooms.disconnect(session).await;
    info!(%session, "WebSocket connection closed");
}

async fn run_session(
    session: Uuid,
    state: &AppState,
    mut ws_sink: SplitSink<WebSocket, Message>,
    mut ws_stream: SplitStream<WebSocket>,
    outbox_tx: mpsc::UnboundedSender<ServerMsg>,
    mut outbox_rx: mpsc::UnboundedReceiver<ServerMsg>,
) {
    let rate_limiter = SessionRateLimiter::new();

    let mut keepalive = interval(KEEPALIVE_INTERVAL);
    keepalive.tick().await; // the first tick completes immediately
    let mut pong_deadline: Option<Instant> = None;

    loop {
        let pong_timeout = async move {
            match pong_deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending().await,
            }
        };

        tokio::select! {
            _ = keepalive.tick() => {
                if ws_sink.send(Message::Ping(Vec::new())).await.is_err() {
                    break;
                }
                if pong_deadline.is_none() {
                    pong_deadline = Some(Instant::now() + PONG_TIMEOUT);
                }
            }

            _ = pong_timeout => {
                warn!(%session, "keepalive timed out");
                break;
            }

            outbound = outbox_rx.recv() => {
                match outbound {
                    Some(msg) => {
                        if send_msg(&mut ws_sink, &msg).await.is_err() {
                            debug!(%session, "WebSocket send failed");
                            break;
                        }
                    }
                    None => break,
                }
            }

            inbound = ws_stream.next() => {
                match inbound {
                    Some(Ok(Message::Text(text))) => {
                        if !rate_limiter.check_input() {
                            warn!(%session, "rate limited input message");
                            continue;
                        }
                        match serde_json::from_str::<ClientMsg>(&text) {
                            Ok(msg) => {
                                state.rooms.handle_message(session, msg, &outbox_tx).await;
                            }
                            Err(error) => {
                                debug!(%session, %error, "failed to parse client message");
                            }
                        }
                    }
                    Some(Ok(Message::Pong(_))) => {
                        pong_deadline = None;
                    }
                    Some(Ok(Message::Ping(_))) => {
                        // answered by the transport layer
                    }
                    Some(Ok(Message::Binary(_))) => {
                        warn!(%session, "received binary message, ignoring");
                    }
                    Some(Ok(Message::Close(_))) => {
                        info!(%session, "client initiated close");
                        break;
                    }
                    Some(Err(error)) => {
                        debug!(%session, %error, "WebSocket error");
                        break;
                    }
                    None => break,
                }
            }
        }
    }
}

/// Send a message over WebSocket
async fn send_msg(
    sink: &mut SplitSink<WebSocket, Message>,
    msg: &ServerMsg,
) -> Result<(), String> {
    let json = serde_json::to_string(msg).map_err(|e| e.to_string())?;
    sink.send(Message::Text(json))
        .await
        .map_err(|e| e.to_string())
}
