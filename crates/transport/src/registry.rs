use crate::connection::{ConnId, Connection};
use dashmap::DashMap;
use std::sync::Arc;

/// Registry of open WebSocket connections
pub struct ConnectionRegistry {
    connections: DashMap<ConnId, Arc<Connection>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self {
            connections: DashMap::new(),
        }
    }

    pub fn register(&self, conn: Arc<Connection>) {
        self.connections.insert(conn.id(), conn);
    }

    /// Remove and return a connection; `None` if it was already gone
    pub fn unregister(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.connections.remove(&id).map(|(_, conn)| conn)
    }

    pub fn get(&self, id: ConnId) -> Option<Arc<Connection>> {
        self.connections.get(&id).map(|entry| entry.value().clone())
    }

    pub fn contains(&self, id: ConnId) -> bool {
        self.connections.contains_key(&id)
    }

    /// Snapshot of the ids currently registered
    pub fn ids(&self) -> Vec<ConnId> {
        self.connections.iter().map(|entry| *entry.key()).collect()
    }

    /// Get number of active connections
    pub fn count(&self) -> usize {
        self.connections.len()
    }
}

impl Default for ConnectionRegistry {
    fn default() -> Self {
        Self::new()
    }
}
