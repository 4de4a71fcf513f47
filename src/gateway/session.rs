//! Per-connection session state.

use std::collections::HashSet;

use chrono::{DateTime, Utc};

use crate::db::store::UserRecord;

/// Display id reported for the privileged web-server connection.
pub const SERVER_ID: &str = "Web Server";

/// Role string reserved for the privileged web-server connection.
pub const SERVER_ROLE: &str = "server";

/// Role string that unlocks the status introspection surface.
pub const DEVELOPER_ROLE: &str = "developer";

/// Who a connection is acting as. A connection starts as a guest and can
/// only change identity through the one-shot auth pass at connect or an
/// explicit `unauth`.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Identity {
    Guest { id: String },
    User(UserRecord),
    Server,
}

impl Identity {
    /// Synthesize the guest identity for a connection. Pure in the
    /// connection id, so re-guesting yields the same id every time.
    pub fn guest(connection_id: &str) -> Self {
        Self::Guest {
            id: format!("Guest#{connection_id}"),
        }
    }

    pub fn id(&self) -> &str {
        match self {
            Self::Guest { id } => id,
            Self::User(user) => &user.id,
            Self::Server => SERVER_ID,
        }
    }

    pub fn role(&self) -> Option<&str> {
        match self {
            Self::Guest { .. } => None,
            Self::User(user) => user.role.as_deref(),
            Self::Server => Some(SERVER_ROLE),
        }
    }

    pub fn name(&self) -> Option<&str> {
        match self {
            Self::User(user) => user.name.as_deref(),
            _ => None,
        }
    }

    pub fn is_guest(&self) -> bool {
        matches!(self, Self::Guest { .. })
    }

    pub fn is_server(&self) -> bool {
        matches!(self, Self::Server)
    }

    pub fn is_developer(&self) -> bool {
        self.role() == Some(DEVELOPER_ROLE)
    }
}

/// State for a single live connection. Owned by the registry between
/// register and unregister; handlers only ever see short-lived borrows.
#[derive(Debug, Clone)]
pub struct ConnectionSession {
    /// Opaque unique connection identifier (`cn_` prefixed).
    pub connection_id: String,
    pub identity: Identity,
    /// Rooms this session currently subscribes to.
    pub rooms: HashSet<String>,
    /// Non-reversible digest of the resolved origin address, if resolution
    /// succeeded. Never the raw address.
    pub fingerprint: Option<String>,
    /// Captured once at registration.
    pub connected_at: DateTime<Utc>,
    /// Last client-reported location.
    pub page: Option<String>,
}

impl ConnectionSession {
    pub fn new(connection_id: String) -> Self {
        let identity = Identity::guest(&connection_id);
        Self {
            connection_id,
            identity,
            rooms: HashSet::new(),
            fingerprint: None,
            connected_at: Utc::now(),
            page: None,
        }
    }
}

/// Generate an opaque connection id.
pub fn generate_connection_id() -> String {
    use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine};
    use rand::Rng;
    let mut buf = [0u8; 12];
    rand::thread_rng().fill(&mut buf[..]);
    format!("cn_{}", URL_SAFE_NO_PAD.encode(buf))
}
