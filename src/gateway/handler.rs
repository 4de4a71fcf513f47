//! Inbound event dispatch: the per-connection auth pass, the capability
//! gated event handlers, and the best-effort notification count push.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use sha2::{Digest, Sha256};

use crate::db::store::SessionStore;
use crate::gateway::events::{ClientEvent, ClientStatus, IdentityStatus, ServerEvent};
use crate::gateway::registry::ConnectionRegistry;
use crate::gateway::session::Identity;
use crate::AppState;

/// Extract the `access` cookie from a handshake `Cookie` header.
pub fn find_auth_cookie(header: Option<&str>) -> Option<String> {
    let header = header?;
    for pair in header.split("; ") {
        if let Some((key, value)) = pair.split_once('=') {
            if key == "access" {
                return Some(value.to_string());
            }
        }
    }
    None
}

/// Hash a raw session token the way the session table stores it.
pub fn hash_token(raw: &str) -> String {
    Sha256::digest(raw.as_bytes())
        .iter()
        .map(|b| format!("{b:02x}"))
        .collect()
}

/// Where a notification count push is delivered.
pub enum Delivery<'a> {
    /// One specific connection.
    Connection(&'a str),
    /// Every session subscribed to a room (a user's self-room).
    Room(&'a str),
}

/// The one-shot authentication pass, run once per connection at connect.
///
/// The shared server secret short-circuits before any store lookup; any
/// other non-empty credential is hashed and looked up. Lookup misses and
/// query errors both degrade to a guest identity.
pub async fn authenticate(state: &AppState, connection_id: &str, cookie_header: Option<&str>) {
    match find_auth_cookie(cookie_header) {
        Some(access) if access == state.config.server_key => {
            state
                .registry
                .with_session(connection_id, |s| s.identity = Identity::Server);
            tracing::info!(%connection_id, "server connection authenticated");
            state.registry.send_to(
                connection_id,
                ServerEvent::Auth {
                    success: true,
                    name: None,
                    clientid: connection_id.to_string(),
                },
            );
        }
        Some(access) if !access.is_empty() => {
            let token_hash = hash_token(&access);
            match state.store.user_by_token(&token_hash).await {
                Ok(Some(user)) => {
                    let user_id = user.id.clone();
                    let name = user.name.clone();
                    state.registry.with_session(connection_id, |s| {
                        s.identity = Identity::User(user);
                        s.rooms.insert(user_id.clone());
                    });
                    tracing::info!(%connection_id, %user_id, "connection authenticated");
                    state.registry.send_to(
                        connection_id,
                        ServerEvent::Auth {
                            success: true,
                            name,
                            clientid: connection_id.to_string(),
                        },
                    );

                    // Best-effort initial count push; runs off this task.
                    let store = state.store.clone();
                    let registry = state.registry.clone();
                    let connection_id = connection_id.to_string();
                    tokio::spawn(async move {
                        send_notification_count(
                            store.as_ref(),
                            &registry,
                            Delivery::Connection(&connection_id),
                            &user_id,
                        )
                        .await;
                    });
                }
                Ok(None) => auth_guest(&state.registry, connection_id),
                Err(e) => {
                    tracing::error!(%connection_id, %e, "session lookup failed");
                    auth_guest(&state.registry, connection_id);
                }
            }
        }
        _ => auth_guest(&state.registry, connection_id),
    }
}

fn auth_guest(registry: &ConnectionRegistry, connection_id: &str) {
    registry.send_to(
        connection_id,
        ServerEvent::AuthGuest {
            success: true,
            clientid: connection_id.to_string(),
        },
    );
}

/// Query the unread count for a user and push it to the delivery target.
/// Best-effort: query errors are logged and the push is dropped, never
/// retried or surfaced to the requester.
pub async fn send_notification_count(
    store: &dyn SessionStore,
    registry: &ConnectionRegistry,
    delivery: Delivery<'_>,
    user_id: &str,
) {
    let count = match store.unread_count(user_id).await {
        Ok(count) => count,
        Err(e) => {
            tracing::error!(%user_id, %e, "unread count query failed");
            return;
        }
    };

    let event = ServerEvent::NotificationCount {
        success: true,
        cnt: count,
    };
    match delivery {
        Delivery::Connection(id) => {
            registry.send_to(id, event);
        }
        Delivery::Room(room) => {
            registry.send_to_room(room, event);
        }
    }
}

/// Route one inbound event against the caller's current identity.
///
/// Returns the acknowledgement event to write back, if the event has an
/// acknowledgement channel. Role-check failures on events without one
/// (`notify-pls`, `hello`, `update`) are silently dropped.
pub async fn dispatch(
    state: &AppState,
    connection_id: &str,
    event: ClientEvent,
) -> Option<ServerEvent> {
    // Connection already unregistered: nothing to act on.
    let identity = state
        .registry
        .with_session(connection_id, |s| s.identity.clone())?;

    match event {
        ClientEvent::Navigate { page } => {
            state
                .registry
                .with_session(connection_id, |s| s.page = Some(page));
            None
        }

        ClientEvent::NotificationCount => {
            send_notification_count(
                state.store.as_ref(),
                &state.registry,
                Delivery::Connection(connection_id),
                identity.id(),
            )
            .await;
            None
        }

        ClientEvent::SendNotification { user } => {
            if !identity.is_server() {
                return None;
            }
            tracing::info!(%connection_id, %user, "pushing notification count");
            send_notification_count(
                state.store.as_ref(),
                &state.registry,
                Delivery::Room(&user),
                &user,
            )
            .await;
            None
        }

        ClientEvent::Unauth => {
            let previous = state.registry.with_session(connection_id, |s| {
                if s.identity.is_guest() {
                    return None;
                }
                let previous = s.identity.clone();
                if let Identity::User(user) = &previous {
                    s.rooms.remove(&user.id);
                }
                s.identity = Identity::guest(&s.connection_id);
                Some(previous)
            })?;

            match previous {
                None => Some(ServerEvent::Unauth { success: false }),
                Some(previous) => {
                    tracing::info!(
                        %connection_id,
                        previous_id = %previous.id(),
                        "connection unauthenticated"
                    );
                    auth_guest(&state.registry, connection_id);
                    Some(ServerEvent::Unauth { success: true })
                }
            }
        }

        ClientEvent::DevQuery { what } => {
            if !identity.is_developer() {
                return Some(ServerEvent::DevQuery {
                    success: false,
                    message: None,
                    clients: None,
                });
            }
            match what.as_str() {
                "status" => Some(ServerEvent::DevQuery {
                    success: true,
                    message: None,
                    clients: Some(build_status(
                        &state.registry,
                        connection_id,
                        state.config.localhost,
                    )),
                }),
                other => Some(ServerEvent::DevQuery {
                    success: false,
                    message: Some(format!("Unknown type {other}")),
                    clients: None,
                }),
            }
        }

        ClientEvent::Hello { clientid, payload } => {
            if !identity.is_server() {
                return None;
            }
            let delivered = state.registry.send_to(
                &clientid,
                ServerEvent::Hello {
                    success: true,
                    payload,
                },
            );
            if !delivered {
                tracing::info!(%clientid, "relay target not found among connected clients");
            }
            None
        }

        ClientEvent::Update { data } => {
            if !identity.is_server() {
                return None;
            }
            state.registry.broadcast(ServerEvent::Update { data });
            None
        }
    }
}

/// Build the status snapshot for the developer introspection surface.
///
/// The caller's own connection is omitted outside localhost deployments.
pub fn build_status(
    registry: &ConnectionRegistry,
    caller_id: &str,
    localhost: bool,
) -> BTreeMap<String, ClientStatus> {
    let now = Utc::now();
    let mut clients = BTreeMap::new();

    for session in registry.snapshot() {
        let own = session.connection_id == caller_id;
        if own && !localhost {
            continue;
        }

        let mut rooms: Vec<String> = session.rooms.iter().cloned().collect();
        rooms.sort();

        clients.insert(
            session.connection_id.clone(),
            ClientStatus {
                own,
                fingerprint: session.fingerprint.clone(),
                connected: session.connected_at,
                connected_since: connected_since(session.connected_at, now),
                page: session.page.clone(),
                rooms,
                user: IdentityStatus {
                    id: session.identity.id().to_string(),
                    role: session.identity.role().map(str::to_string),
                    name: session.identity.name().map(str::to_string),
                },
            },
        );
    }

    clients
}

/// Human-readable elapsed time since a connection was established.
fn connected_since(connected_at: DateTime<Utc>, now: DateTime<Utc>) -> String {
    let elapsed = now.signed_duration_since(connected_at);
    let secs = elapsed.num_seconds().max(0);

    if secs < 60 {
        format!("{secs}s ago")
    } else if secs < 3600 {
        format!("{}m {}s ago", secs / 60, secs % 60)
    } else if secs < 86400 {
        format!("{}h {}m ago", secs / 3600, (secs % 3600) / 60)
    } else {
        format!("{}d {}h ago", secs / 86400, (secs % 86400) / 3600)
    }
}
