//! Process-wide connection registry.
//!
//! Maps every authenticated identity to its single live connection, plus a
//! side table of all open connections used for room fan-out and global
//! broadcasts. A reconnect replaces the identity entry without touching the
//! superseded socket; that socket stays open until it disconnects on its
//! own, at which point the match guard in
//! [`ConnectionRegistry::unregister`] keeps the stale disconnect from
//! clobbering the newer registration.
//!
//! The registry is constructed in `main` and injected through the shared
//! state, so tests can run isolated instances. Every mutation is a single
//! map operation under one lock acquisition; no critical section spans a
//! storage await.

use std::collections::HashMap;
use std::fmt;

use tokio::sync::mpsc::UnboundedSender;
use tokio::sync::RwLock;
use uuid::Uuid;

use palaver_shared::events::ServerEvent;
use palaver_shared::{Identity, IdentityKey};

/// Process-lifetime identifier of one accepted socket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct ConnectionId(Uuid);

impl ConnectionId {
    pub fn new() -> Self {
        Self(Uuid::new_v4())
    }

    pub fn as_uuid(&self) -> Uuid {
        self.0
    }
}

impl Default for ConnectionId {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for ConnectionId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Handle to one live connection: the identity it authenticated as and the
/// queue draining into its socket task.
#[derive(Clone)]
pub struct ConnectionHandle {
    pub id: ConnectionId,
    pub identity: Identity,
    tx: UnboundedSender<ServerEvent>,
}

impl ConnectionHandle {
    pub fn new(identity: Identity, tx: UnboundedSender<ServerEvent>) -> Self {
        Self {
            id: ConnectionId::new(),
            identity,
            tx,
        }
    }

    pub fn key(&self) -> IdentityKey {
        self.identity.key()
    }

    /// Queue an event for this connection. Returns `false` once the socket
    /// task has gone away.
    pub fn send(&self, event: ServerEvent) -> bool {
        self.tx.send(event).is_ok()
    }
}

#[derive(Default)]
struct Inner {
    /// Every open connection, keyed by its own id.
    connections: HashMap<ConnectionId, ConnectionHandle>,
    /// The one connection currently owning each identity.
    by_identity: HashMap<IdentityKey, ConnectionId>,
}

/// Registry of live connections. See the module docs for the supersession
/// and disconnect-guard semantics.
#[derive(Default)]
pub struct ConnectionRegistry {
    inner: RwLock<Inner>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a connection, unconditionally replacing any previous entry
    /// for the same identity. Returns the superseded handle, if any; the
    /// caller may force-close it but is not required to.
    pub async fn register(&self, handle: ConnectionHandle) -> Option<ConnectionHandle> {
        let mut inner = self.inner.write().await;
        let key = handle.key();
        let id = handle.id;
        inner.connections.insert(id, handle);
        let previous = inner.by_identity.insert(key, id);
        previous.and_then(|prev_id| inner.connections.get(&prev_id).cloned())
    }

    /// The handle currently registered for an identity, if it is online.
    pub async fn lookup(&self, key: &IdentityKey) -> Option<ConnectionHandle> {
        let inner = self.inner.read().await;
        inner
            .by_identity
            .get(key)
            .and_then(|id| inner.connections.get(id).cloned())
    }

    /// Drop a connection. The identity mapping is removed only while it
    /// still points at `connection_id`; otherwise a newer connection owns
    /// it and the mapping is left alone. Returns whether this connection
    /// owned the mapping, i.e. whether the identity actually went offline.
    pub async fn unregister(&self, key: &IdentityKey, connection_id: ConnectionId) -> bool {
        let mut inner = self.inner.write().await;
        inner.connections.remove(&connection_id);
        if inner.by_identity.get(key) == Some(&connection_id) {
            inner.by_identity.remove(key);
            true
        } else {
            false
        }
    }

    /// Best-effort send to one connection.
    pub async fn send_to(&self, id: ConnectionId, event: ServerEvent) -> bool {
        match self.inner.read().await.connections.get(&id) {
            Some(handle) => handle.send(event),
            None => false,
        }
    }

    /// Fan an event out to every open connection. Used for the global
    /// presence broadcasts.
    pub async fn broadcast_all(&self, event: &ServerEvent) {
        let inner = self.inner.read().await;
        for handle in inner.connections.values() {
            handle.send(event.clone());
        }
    }

    /// Number of identities currently online.
    pub async fn online_count(&self) -> usize {
        self.inner.read().await.by_identity.len()
    }

    /// The identities currently online, one per registry entry.
    pub async fn online_identities(&self) -> Vec<Identity> {
        let inner = self.inner.read().await;
        inner
            .by_identity
            .values()
            .filter_map(|id| inner.connections.get(id))
            .map(|handle| handle.identity.clone())
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use palaver_shared::UserKind;
    use tokio::sync::mpsc;

    fn identity(id: &str) -> Identity {
        Identity {
            id: id.to_string(),
            kind: UserKind::User,
            name: format!("user {id}"),
            email: None,
            profile: None,
        }
    }

    fn handle(id: &str) -> (ConnectionHandle, mpsc::UnboundedReceiver<ServerEvent>) {
        let (tx, rx) = mpsc::unbounded_channel();
        (ConnectionHandle::new(identity(id), tx), rx)
    }

    #[tokio::test]
    async fn at_most_one_entry_per_identity() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle("7");
        let (second, _rx2) = handle("7");

        assert!(registry.register(first.clone()).await.is_none());
        let superseded = registry.register(second.clone()).await.unwrap();
        assert_eq!(superseded.id, first.id);

        assert_eq!(registry.online_count().await, 1);
        assert_eq!(registry.lookup(&second.key()).await.unwrap().id, second.id);
    }

    #[tokio::test]
    async fn stale_disconnect_is_a_no_op() {
        let registry = ConnectionRegistry::new();
        let (first, _rx1) = handle("7");
        let (second, _rx2) = handle("7");
        let key = first.key();

        registry.register(first.clone()).await;
        registry.register(second.clone()).await;

        // The superseded connection's disconnect must not free the identity.
        assert!(!registry.unregister(&key, first.id).await);
        assert_eq!(registry.lookup(&key).await.unwrap().id, second.id);

        // The owning connection's disconnect does.
        assert!(registry.unregister(&key, second.id).await);
        assert!(registry.lookup(&key).await.is_none());
        assert_eq!(registry.online_count().await, 0);
    }

    #[tokio::test]
    async fn rapid_churn_never_strands_a_live_connection() {
        let registry = ConnectionRegistry::new();
        let key = identity("7").key();

        let (mut current, _rx) = handle("7");
        registry.register(current.clone()).await;

        for _ in 0..100 {
            let (next, _rx_next) = handle("7");
            registry.register(next.clone()).await;
            // Old connection disconnects after the replacement landed.
            assert!(!registry.unregister(&key, current.id).await);
            assert_eq!(registry.lookup(&key).await.unwrap().id, next.id);
            current = next;
        }
    }

    #[tokio::test]
    async fn online_identities_track_registrations() {
        let registry = ConnectionRegistry::new();
        let (a, _rx_a) = handle("1");
        let (b, _rx_b) = handle("2");

        registry.register(a.clone()).await;
        registry.register(b.clone()).await;

        let mut ids: Vec<String> = registry
            .online_identities()
            .await
            .into_iter()
            .map(|i| i.id)
            .collect();
        ids.sort();
        assert_eq!(ids, vec!["1", "2"]);

        registry.unregister(&a.key(), a.id).await;
        let ids: Vec<String> = registry
            .online_identities()
            .await
            .into_iter()
            .map(|i| i.id)
            .collect();
        assert_eq!(ids, vec!["2"]);
    }

    #[tokio::test]
    async fn send_to_reports_dead_receivers() {
        let registry = ConnectionRegistry::new();
        let (conn, rx) = handle("7");
        registry.register(conn.clone()).await;

        drop(rx);
        assert!(
            !registry
                .send_to(conn.id, ServerEvent::Error { message: "x".into() })
                .await
        );
        assert!(
            !registry
                .send_to(ConnectionId::new(), ServerEvent::Error { message: "x".into() })
                .await
        );
    }
}
