//! Typed wire events exchanged over the WebSocket connection.
//!
//! Every frame is a JSON object tagged by its `event` field. Client events
//! with an acknowledgement channel (`unauth`, `devquery`) are answered with
//! a server event of the same name carrying at least `success`.

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

// ---------------------------------------------------------------------------
// Client → Server
// ---------------------------------------------------------------------------

/// An event received from a connected client.
#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ClientEvent {
    /// Report the client-side location.
    Navigate { page: String },
    /// Ask for the caller's own unread-notification count.
    #[serde(rename = "notif-cnt")]
    NotificationCount,
    /// Privileged: push an unread count to all of a user's sessions.
    #[serde(rename = "notify-pls")]
    SendNotification { user: String },
    /// Drop back to a guest identity.
    Unauth,
    /// Developer introspection queries.
    #[serde(rename = "devquery")]
    DevQuery { what: String },
    /// Privileged: relay an opaque payload to one specific connection.
    Hello {
        clientid: String,
        #[serde(rename = "priv")]
        payload: Value,
    },
    /// Privileged: broadcast an opaque payload to every connection.
    Update {
        #[serde(default)]
        data: Value,
    },
}

// ---------------------------------------------------------------------------
// Server → Client
// ---------------------------------------------------------------------------

/// An event emitted to a connected client.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(tag = "event", rename_all = "kebab-case")]
pub enum ServerEvent {
    /// Successful non-guest authentication.
    Auth {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        clientid: String,
    },
    /// Guest identity assigned (on connect or after `unauth`).
    AuthGuest { success: bool, clientid: String },
    /// Relayed server payload.
    Hello {
        success: bool,
        #[serde(rename = "priv")]
        payload: Value,
    },
    /// Unread-notification count push.
    #[serde(rename = "notif-cnt")]
    NotificationCount { success: bool, cnt: i64 },
    /// Acknowledgement for an `unauth` request.
    Unauth { success: bool },
    /// Acknowledgement for a `devquery` request.
    #[serde(rename = "devquery")]
    DevQuery {
        success: bool,
        #[serde(skip_serializing_if = "Option::is_none")]
        message: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        clients: Option<BTreeMap<String, ClientStatus>>,
    },
    /// Broadcast server payload.
    Update { data: Value },
}

/// One registry entry as reported by the `devquery status` surface.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ClientStatus {
    /// Whether this entry is the caller's own connection.
    #[serde(rename = "self")]
    pub own: bool,
    pub fingerprint: Option<String>,
    pub connected: DateTime<Utc>,
    pub connected_since: String,
    pub page: Option<String>,
    pub rooms: Vec<String>,
    pub user: IdentityStatus,
}

/// Identity fields in the status output.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct IdentityStatus {
    pub id: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
}
