//! WebSocket upgrade handler and per-connection event loop.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::HeaderMap;
use axum::response::IntoResponse;
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::gateway::events::{ClientRequest, OutboundEvent};
use crate::gateway::handler::{self, Outcome};
use crate::gateway::limiter::Admission;
use crate::AppState;

/// Close codes (4000-range for application-level).
const CLOSE_RATE_LIMITED: u16 = 4008;
const CLOSE_REJECTED: u16 = 4003;

/// Header carrying the resolved user id, set by the upstream auth
/// terminator. Absent when session resolution failed; such connections are
/// admitted but cannot join any space.
const USER_ID_HEADER: &str = "x-user-id";

pub fn router() -> Router<AppState> {
    Router::new().route("/sync", get(ws_upgrade))
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> impl IntoResponse {
    let user_id = headers
        .get(USER_ID_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    ws.on_upgrade(move |socket| handle_connection(socket, state, addr, user_id))
}

async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    addr: SocketAddr,
    user_id: Option<String>,
) {
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Admission control before anything is registered.
    match state.limiter.check(addr.ip()).await {
        Ok(Admission::Allowed) => {}
        Ok(Admission::RateLimited { .. }) => {
            // One scheduling tick so an in-flight frame can still flush.
            tokio::task::yield_now().await;
            let _ = send_close(&mut ws_tx, CLOSE_RATE_LIMITED, "rate limited").await;
            return;
        }
        Err(err) => {
            tracing::warn!(%err, %addr, "admission check failed; closing connection");
            let _ = send_close(&mut ws_tx, CLOSE_REJECTED, "admission failed").await;
            return;
        }
    }

    let conn_id = sync_common::id::prefixed_ulid(sync_common::id::prefix::CONNECTION);
    let (out_tx, mut out_rx) = mpsc::unbounded_channel::<OutboundEvent>();
    state.registry.register(conn_id.clone(), out_tx);
    if let Some(user_id) = &user_id {
        state.presence.attach(&conn_id, user_id);
    }

    tracing::info!(
        conn_id = %conn_id,
        user_id = user_id.as_deref().unwrap_or("<untagged>"),
        %addr,
        "connection established"
    );

    // Connect-triggered presence flush, off the connection's own task.
    {
        let presence = state.presence.clone();
        tokio::spawn(async move { presence.flush().await });
    }

    loop {
        tokio::select! {
            // Client sends us a request.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let request: ClientRequest = match serde_json::from_str(&text) {
                            Ok(request) => request,
                            Err(err) => {
                                tracing::debug!(conn_id = %conn_id, %err, "unparsable request");
                                let event = OutboundEvent::Error {
                                    code: "bad-request".to_string(),
                                    message: "unparsable request".to_string(),
                                };
                                if send_event(&mut ws_tx, &event).await.is_err() {
                                    break;
                                }
                                continue;
                            }
                        };

                        match handler::handle_request(&state, &conn_id, request).await {
                            Outcome::Reply(event) => {
                                if send_event(&mut ws_tx, &event).await.is_err() {
                                    break;
                                }
                            }
                            Outcome::Done => {}
                            Outcome::Disconnect => {
                                // Deferred, silent: no error frame.
                                tokio::task::yield_now().await;
                                let _ = send_close(&mut ws_tx, CLOSE_REJECTED, "").await;
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(err)) => {
                        tracing::debug!(conn_id = %conn_id, %err, "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            // Broadcast event routed to this connection.
            event = out_rx.recv() => {
                match event {
                    Some(event) => {
                        if send_event(&mut ws_tx, &event).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    state.registry.remove(&conn_id);
    state.presence.note_disconnect();
    tracing::info!(conn_id = %conn_id, "connection closed");
}

async fn send_event(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    event: &OutboundEvent,
) -> Result<(), axum::Error> {
    let json = serde_json::to_string(event).expect("outbound events serialize");
    ws_tx.send(Message::Text(json.into())).await
}

async fn send_close(
    ws_tx: &mut futures_util::stream::SplitSink<WebSocket, Message>,
    code: u16,
    reason: &str,
) -> Result<(), axum::Error> {
    let close_msg = Message::Close(Some(axum::extract::ws::CloseFrame {
        code,
        reason: reason.to_string().into(),
    }));
    ws_tx.send(close_msg).await
}
