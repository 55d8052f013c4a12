//! Per-process registry of live connections grouped by session.

use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::RwLock;
use tracing::{debug, info};
use uuid::Uuid;

use super::connection::Connection;

/// Session id -> live connections. The map never leaves this type; callers get snapshots.
#[derive(Clone, Default)]
pub struct ConnectionRegistry {
    sessions: Arc<RwLock<HashMap<Uuid, Vec<Arc<Connection>>>>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Append a connection; the same user may hold several (tabs, devices).
    pub async fn add(&self, session_id: Uuid, connection: Arc<Connection>) {
        let mut sessions = self.sessions.write().await;
        let conns = sessions.entry(session_id).or_default();
        conns.push(connection.clone());
        info!(
            session_id = %session_id,
            user_id = %connection.user_id(),
            user_type = %connection.role(),
            total = conns.len(),
            "connection added"
        );
    }

    /// Remove the first connection of `user_id`. Absent user or session is a no-op.
    pub async fn remove(&self, session_id: Uuid, user_id: &str) -> Option<Arc<Connection>> {
        self.remove_where(session_id, |c| c.user_id() == user_id).await
    }

    /// Remove one specific connection, e.g. after its socket failed.
    pub async fn remove_connection(&self, session_id: Uuid, connection_id: Uuid) -> bool {
        self.remove_where(session_id, |c| c.id() == connection_id)
            .await
            .is_some()
    }

    async fn remove_where<F>(&self, session_id: Uuid, matches: F) -> Option<Arc<Connection>>
    where
        F: Fn(&Connection) -> bool,
    {
        let mut sessions = self.sessions.write().await;
        let conns = sessions.get_mut(&session_id)?;
        let removed = conns
            .iter()
            .position(|c| matches(c.as_ref()))
            .map(|idx| conns.remove(idx));
        let remaining = conns.len();
        if remaining == 0 {
            sessions.remove(&session_id);
            debug!(session_id = %session_id, "cleaned up empty session");
        }
        if let Some(conn) = &removed {
            info!(
                session_id = %session_id,
                user_id = %conn.user_id(),
                remaining,
                "connection removed"
            );
        }
        removed
    }

    /// Copy of the session's connections, taken under the read lock.
    pub async fn snapshot(&self, session_id: Uuid) -> Vec<Arc<Connection>> {
        let sessions = self.sessions.read().await;
        sessions.get(&session_id).cloned().unwrap_or_default()
    }

    pub async fn has_session(&self, session_id: Uuid) -> bool {
        self.sessions.read().await.contains_key(&session_id)
    }

    pub async fn count_by_session(&self, session_id: Uuid) -> usize {
        self.sessions
            .read()
            .await
            .get(&session_id)
            .map_or(0, Vec::len)
    }

    pub async fn count_all(&self) -> HashMap<Uuid, usize> {
        self.sessions
            .read()
            .await
            .iter()
            .map(|(id, conns)| (*id, conns.len()))
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::Role;
    use crate::services::connection::testing::connection;

    #[tokio::test]
    async fn add_creates_session_and_counts() {
        let registry = ConnectionRegistry::new();
        let session = Uuid::new_v4();
        let (a, _) = connection(session, "cust1", Role::Customer);
        let (b, _) = connection(session, "agent1", Role::Agent);
        registry.add(session, a).await;
        registry.add(session, b).await;

        assert_eq!(registry.count_by_session(session).await, 2);
        assert_eq!(registry.count_by_session(Uuid::new_v4()).await, 0);
        assert_eq!(registry.count_all().await.get(&session), Some(&2));
    }

    #[tokio::test]
    async fn same_user_may_hold_several_connections() {
        let registry = ConnectionRegistry::new();
        let session = Uuid::new_v4();
        let (tab1, _) = connection(session, "cust1", Role::Customer);
        let (tab2, _) = connection(session, "cust1", Role::Customer);
        registry.add(session, tab1.clone()).await;
        registry.add(session, tab2.clone()).await;

        let removed = registry.remove(session, "cust1").await.unwrap();
        assert_eq!(removed.id(), tab1.id());
        assert_eq!(registry.snapshot(session).await[0].id(), tab2.id());
    }

    #[tokio::test]
    async fn removing_last_connection_drops_session() {
        let registry = ConnectionRegistry::new();
        let session = Uuid::new_v4();
        let (conn, _) = connection(session, "cust1", Role::Customer);
        registry.add(session, conn.clone()).await;

        assert!(registry.remove_connection(session, conn.id()).await);
        assert!(!registry.has_session(session).await);
        assert!(registry.count_all().await.is_empty());
    }

    #[tokio::test]
    async fn remove_absent_is_noop() {
        let registry = ConnectionRegistry::new();
        let session = Uuid::new_v4();
        assert!(registry.remove(session, "ghost").await.is_none());

        let (conn, _) = connection(session, "cust1", Role::Customer);
        registry.add(session, conn).await;
        assert!(registry.remove(session, "ghost").await.is_none());
        assert_eq!(registry.count_by_session(session).await, 1);
    }

    #[tokio::test]
    async fn snapshot_is_detached_from_later_mutation() {
        let registry = ConnectionRegistry::new();
        let session = Uuid::new_v4();
        let (conn, _) = connection(session, "cust1", Role::Customer);
        registry.add(session, conn).await;

        let snapshot = registry.snapshot(session).await;
        registry.remove(session, "cust1").await;
        assert_eq!(snapshot.len(), 1);
        assert!(registry.snapshot(session).await.is_empty());
    }
}
