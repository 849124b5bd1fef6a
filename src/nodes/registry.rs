//! Dual-indexed registry of connected node sessions.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use parking_lot::RwLock;
use serde_json::Value;

/// Outbound event seam implemented by the owning connection.
#[async_trait]
pub trait EventSink: Send + Sync {
    async fn send_event(&self, event: &str, payload: Value) -> std::io::Result<()>;
}

/// A connected node (e.g. an iPhone) and the handle used to reach it.
#[derive(Clone)]
pub struct NodeSession {
    pub node_id: String,
    pub conn_id: String,
    pub display_name: String,
    pub platform: String,
    pub version: String,
    pub commands: Vec<String>,
    link: Arc<dyn EventSink>,
}

impl std::fmt::Debug for NodeSession {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("NodeSession")
            .field("node_id", &self.node_id)
            .field("conn_id", &self.conn_id)
            .field("display_name", &self.display_name)
            .field("platform", &self.platform)
            .field("version", &self.version)
            .field("commands", &self.commands)
            .finish_non_exhaustive()
    }
}

impl NodeSession {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        node_id: String,
        conn_id: String,
        display_name: String,
        platform: String,
        version: String,
        commands: Vec<String>,
        link: Arc<dyn EventSink>,
    ) -> Self {
        Self {
            node_id,
            conn_id,
            display_name,
            platform,
            version,
            commands,
            link,
        }
    }

    /// Dispatch an event to this node's underlying connection.
    pub async fn send(&self, event: &str, payload: Value) -> std::io::Result<()> {
        self.link.send_event(event, payload).await
    }
}

#[derive(Default)]
struct Indexes {
    by_node_id: HashMap<String, NodeSession>,
    by_conn_id: HashMap<String, String>,
}

/// Thread-safe store of connected node sessions, indexed both by node id and
/// by connection id. The two indexes stay mutually consistent: a conn-id
/// entry exists iff it points at the live session for that node.
#[derive(Default)]
pub struct Registry {
    inner: RwLock<Indexes>,
}

impl Registry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Add or replace a node session. A prior session for the same node id
    /// is evicted from both indexes first.
    pub fn register(&self, session: NodeSession) {
        let mut inner = self.inner.write();
        let evicted_conn = inner
            .by_node_id
            .get(&session.node_id)
            .map(|old| old.conn_id.clone());
        if let Some(old_conn) = evicted_conn {
            inner.by_conn_id.remove(&old_conn);
        }
        inner
            .by_conn_id
            .insert(session.conn_id.clone(), session.node_id.clone());
        inner.by_node_id.insert(session.node_id.clone(), session);
    }

    /// Snapshot of the session for a node id.
    pub fn get(&self, node_id: &str) -> Option<NodeSession> {
        self.inner.read().by_node_id.get(node_id).cloned()
    }

    /// Remove a session by connection id, returning the node id it served.
    pub fn unregister(&self, conn_id: &str) -> Option<String> {
        let mut inner = self.inner.write();
        let node_id = inner.by_conn_id.remove(conn_id)?;
        inner.by_node_id.remove(&node_id);
        Some(node_id)
    }

    /// Snapshot of all connected sessions. Ordering is not guaranteed.
    pub fn list(&self) -> Vec<NodeSession> {
        self.inner.read().by_node_id.values().cloned().collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    struct NullSink;

    #[async_trait]
    impl EventSink for NullSink {
        async fn send_event(&self, _event: &str, _payload: Value) -> std::io::Result<()> {
            Ok(())
        }
    }

    fn session(node_id: &str, conn_id: &str) -> NodeSession {
        NodeSession::new(
            node_id.to_string(),
            conn_id.to_string(),
            String::new(),
            "ios".to_string(),
            "1.0".to_string(),
            vec![],
            Arc::new(NullSink),
        )
    }

    #[test]
    fn register_and_get() {
        let registry = Registry::new();
        registry.register(session("n1", "c1"));

        let found = registry.get("n1").unwrap();
        assert_eq!(found.conn_id, "c1");
        assert!(registry.get("n2").is_none());
        assert_eq!(registry.list().len(), 1);
    }

    #[test]
    fn reregister_evicts_previous_session() {
        let registry = Registry::new();
        registry.register(session("n1", "c1"));
        registry.register(session("n1", "c2"));

        assert_eq!(registry.list().len(), 1);
        assert_eq!(registry.get("n1").unwrap().conn_id, "c2");

        // The stale conn-id index entry is gone.
        assert!(registry.unregister("c1").is_none());
        assert_eq!(registry.unregister("c2").unwrap(), "n1");
        assert!(registry.get("n1").is_none());
    }

    #[test]
    fn unregister_removes_both_indexes() {
        let registry = Registry::new();
        registry.register(session("n1", "c1"));

        assert_eq!(registry.unregister("c1").unwrap(), "n1");
        assert!(registry.get("n1").is_none());
        assert!(registry.list().is_empty());
        assert!(registry.unregister("c1").is_none());
    }

    #[test]
    fn indexes_stay_consistent_across_churn() {
        let registry = Registry::new();
        for round in 0..5 {
            for n in 0..4 {
                registry.register(session(&format!("n{n}"), &format!("c{round}-{n}")));
            }
        }
        let sessions = registry.list();
        assert_eq!(sessions.len(), 4);
        for s in sessions {
            // Each listed session is reachable by node id and owns the
            // conn-id mapping.
            assert_eq!(registry.get(&s.node_id).unwrap().conn_id, s.conn_id);
            assert_eq!(registry.unregister(&s.conn_id).unwrap(), s.node_id);
        }
        assert!(registry.list().is_empty());
    }
}
