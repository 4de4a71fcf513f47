//! In-memory connection registry: the single source of truth for who is
//! online, plus targeted delivery to connections and rooms.

use dashmap::DashMap;
use parking_lot::Mutex;
use tokio::sync::mpsc;

use super::events::ServerEvent;
use super::session::ConnectionSession;

struct RegistryEntry {
    session: ConnectionSession,
    tx: mpsc::UnboundedSender<ServerEvent>,
}

/// Registry of all live connections.
///
/// Uses `DashMap` for shard-level concurrency and `parking_lot::Mutex` per
/// entry for non-poisoning, fast locking. Constructed explicitly and owned
/// by `AppState` so tests can inject their own instance.
pub struct ConnectionRegistry {
    connections: DashMap<String, Mutex<RegistryEntry>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    /// Register a connection together with its outbound event queue.
    /// Keyed by the session's connection id; one entry per live connection.
    pub fn register(&self, session: ConnectionSession, tx: mpsc::UnboundedSender<ServerEvent>) {
        let id = session.connection_id.clone();
        self.connections
            .insert(id, Mutex::new(RegistryEntry { session, tx }));
    }

    /// Remove a connection, returning its final session state.
    pub fn unregister(&self, connection_id: &str) -> Option<ConnectionSession> {
        self.connections
            .remove(connection_id)
            .map(|(_, entry)| entry.into_inner().session)
    }

    pub fn contains(&self, connection_id: &str) -> bool {
        self.connections.contains_key(connection_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Run a closure against a connection's session state under its entry
    /// lock. Returns `None` if the connection is not registered.
    pub fn with_session<R>(
        &self,
        connection_id: &str,
        f: impl FnOnce(&mut ConnectionSession) -> R,
    ) -> Option<R> {
        let entry = self.connections.get(connection_id)?;
        let mut e = entry.lock();
        Some(f(&mut e.session))
    }

    /// Subscribe a connection to a room.
    pub fn join_room(&self, connection_id: &str, room: &str) -> bool {
        self.with_session(connection_id, |s| {
            s.rooms.insert(room.to_string());
        })
        .is_some()
    }

    /// Unsubscribe a connection from a room.
    pub fn leave_room(&self, connection_id: &str, room: &str) -> bool {
        self.with_session(connection_id, |s| {
            s.rooms.remove(room);
        })
        .is_some()
    }

    /// Deliver an event to one connection. Returns `false` if the id is not
    /// registered (the caller decides whether that is worth logging).
    pub fn send_to(&self, connection_id: &str, event: ServerEvent) -> bool {
        match self.connections.get(connection_id) {
            Some(entry) => {
                // A closed receiver means the connection is tearing down;
                // the event is dropped with it.
                let _ = entry.lock().tx.send(event);
                true
            }
            None => false,
        }
    }

    /// Deliver an event to every connection subscribed to a room.
    /// Returns the number of connections reached.
    pub fn send_to_room(&self, room: &str, event: ServerEvent) -> usize {
        let mut reached = 0;
        for entry in self.connections.iter() {
            let e = entry.lock();
            if e.session.rooms.contains(room) {
                let _ = e.tx.send(event.clone());
                reached += 1;
            }
        }
        reached
    }

    /// Deliver an event to every connection.
    pub fn broadcast(&self, event: ServerEvent) -> usize {
        let mut reached = 0;
        for entry in self.connections.iter() {
            let _ = entry.lock().tx.send(event.clone());
            reached += 1;
        }
        reached
    }

    /// Point-in-time snapshot of every session. Mutations after the
    /// snapshot is taken are not visible in it.
    pub fn snapshot(&self) -> Vec<ConnectionSession> {
        self.connections
            .iter()
            .map(|entry| entry.lock().session.clone())
            .collect()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::gateway::session::Identity;

    fn register_connection(
        registry: &ConnectionRegistry,
        id: &str,
    ) -> mpsc::UnboundedReceiver<ServerEvent> {
        let (tx, rx) = mpsc::unbounded_channel();
        registry.register(ConnectionSession::new(id.to_string()), tx);
        rx
    }

    #[test]
    fn register_and_unregister() {
        let registry = ConnectionRegistry::new();
        let _rx = register_connection(&registry, "cn_a");

        assert!(registry.contains("cn_a"));
        assert_eq!(registry.len(), 1);

        let removed = registry.unregister("cn_a").unwrap();
        assert_eq!(removed.connection_id, "cn_a");
        assert!(!registry.contains("cn_a"));
        assert!(registry.with_session("cn_a", |_| ()).is_none());
    }

    #[test]
    fn unregister_unknown_returns_none() {
        let registry = ConnectionRegistry::new();
        assert!(registry.unregister("cn_missing").is_none());
    }

    #[test]
    fn send_to_unknown_connection_is_false() {
        let registry = ConnectionRegistry::new();
        let event = ServerEvent::Update {
            data: serde_json::json!({}),
        };
        assert!(!registry.send_to("cn_missing", event));
    }

    #[test]
    fn room_delivery_reaches_only_members() {
        let registry = ConnectionRegistry::new();
        let mut rx_a = register_connection(&registry, "cn_a");
        let mut rx_b = register_connection(&registry, "cn_b");

        registry.join_room("cn_a", "usr_1");

        let event = ServerEvent::NotificationCount {
            success: true,
            cnt: 2,
        };
        let reached = registry.send_to_room("usr_1", event.clone());
        assert_eq!(reached, 1);
        assert_eq!(rx_a.try_recv().unwrap(), event);
        assert!(rx_b.try_recv().is_err());

        registry.leave_room("cn_a", "usr_1");
        assert_eq!(registry.send_to_room("usr_1", event), 0);
    }

    #[test]
    fn broadcast_reaches_everyone() {
        let registry = ConnectionRegistry::new();
        let mut rx_a = register_connection(&registry, "cn_a");
        let mut rx_b = register_connection(&registry, "cn_b");

        let event = ServerEvent::Update {
            data: serde_json::json!({"v": 1}),
        };
        assert_eq!(registry.broadcast(event.clone()), 2);
        assert_eq!(rx_a.try_recv().unwrap(), event);
        assert_eq!(rx_b.try_recv().unwrap(), event);
    }

    #[test]
    fn snapshot_is_point_in_time() {
        let registry = ConnectionRegistry::new();
        let _rx = register_connection(&registry, "cn_a");

        let before = registry.snapshot();
        assert_eq!(before.len(), 1);
        assert!(before[0].identity.is_guest());

        registry.with_session("cn_a", |s| {
            s.identity = Identity::Server;
            s.page = Some("/admin".to_string());
        });

        // The earlier snapshot still shows the pre-mutation state.
        assert!(before[0].identity.is_guest());
        assert!(before[0].page.is_none());

        let after = registry.snapshot();
        assert!(after[0].identity.is_server());
        assert_eq!(after[0].page.as_deref(), Some("/admin"));
    }
}
