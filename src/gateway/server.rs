//! WebSocket upgrade handling and the per-connection event loop.

use std::net::SocketAddr;

use axum::extract::ws::{Message, WebSocket};
use axum::extract::{ConnectInfo, State, WebSocketUpgrade};
use axum::http::header::{COOKIE, ORIGIN};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::get;
use axum::Router;
use futures_util::{SinkExt, StreamExt};
use tokio::sync::mpsc;

use crate::AppState;

use super::events::{ClientEvent, ServerEvent};
use super::handler::{authenticate, dispatch};
use super::realip;
use super::session::{generate_connection_id, ConnectionSession};

/// Header carrying the proxy-reported client address.
const FORWARDED_HEADER: &str = "cf-connecting-ip";

pub fn router() -> Router<AppState> {
    Router::new()
        .route("/", get(forbidden))
        .route("/gateway", get(ws_upgrade))
}

/// The bare HTTP surface serves nothing.
async fn forbidden() -> StatusCode {
    StatusCode::FORBIDDEN
}

async fn ws_upgrade(
    ws: WebSocketUpgrade,
    State(state): State<AppState>,
    ConnectInfo(addr): ConnectInfo<SocketAddr>,
    headers: HeaderMap,
) -> Response {
    // Origin allow-list runs before any session exists.
    let origin = headers
        .get(ORIGIN)
        .and_then(|v| v.to_str().ok())
        .unwrap_or("");
    if !state.config.origin_regex.is_match(origin) {
        tracing::debug!(%origin, "handshake rejected: origin not allowed");
        return StatusCode::FORBIDDEN.into_response();
    }

    let cookie = headers
        .get(COOKIE)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);
    let forwarded = headers
        .get(FORWARDED_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    ws.on_upgrade(move |socket| handle_connection(socket, state, addr, cookie, forwarded))
}

async fn handle_connection(
    socket: WebSocket,
    state: AppState,
    addr: SocketAddr,
    cookie: Option<String>,
    forwarded: Option<String>,
) {
    let connection_id = generate_connection_id();
    let (mut ws_tx, mut ws_rx) = socket.split();

    // Resolve the origin address before registering. Only this connection's
    // task waits on the shared range fetch.
    let mut session = ConnectionSession::new(connection_id.clone());
    session.fingerprint = state
        .realip
        .resolve(Some(addr.ip()), forwarded.as_deref())
        .await
        .map(|ip| realip::fingerprint(&state.config.fingerprint_secret, &ip));

    let (tx, mut rx) = mpsc::unbounded_channel::<ServerEvent>();
    state.registry.register(session, tx);

    // One auth pass per connection lifetime.
    authenticate(&state, &connection_id, cookie.as_deref()).await;

    loop {
        tokio::select! {
            // Inbound frame from the client.
            msg = ws_rx.next() => {
                match msg {
                    Some(Ok(Message::Text(text))) => {
                        let event: ClientEvent = match serde_json::from_str(&text) {
                            Ok(event) => event,
                            Err(e) => {
                                tracing::debug!(%connection_id, ?e, "ignoring malformed event");
                                continue;
                            }
                        };

                        if let Some(ack) = dispatch(&state, &connection_id, event).await {
                            let json = serde_json::to_string(&ack).unwrap();
                            if ws_tx.send(Message::Text(json.into())).await.is_err() {
                                break;
                            }
                        }
                    }
                    Some(Ok(Message::Ping(_))) | Some(Ok(Message::Pong(_))) => continue,
                    Some(Ok(Message::Close(_))) | None => break,
                    Some(Err(e)) => {
                        tracing::debug!(%connection_id, ?e, "ws read error");
                        break;
                    }
                    _ => continue,
                }
            }

            // Outbound event queued through the registry.
            event = rx.recv() => {
                match event {
                    Some(event) => {
                        let json = serde_json::to_string(&event).unwrap();
                        if ws_tx.send(Message::Text(json.into())).await.is_err() {
                            break;
                        }
                    }
                    None => break,
                }
            }
        }
    }

    // Only a server-role disconnect is worth a log line.
    if let Some(session) = state.registry.unregister(&connection_id) {
        if session.identity.is_server() {
            tracing::info!(%connection_id, "server connection disconnected");
        }
    }
}
