use super::session::ClientSession;
use crate::storage::ClientId;
use dashmap::DashMap;
use std::sync::Arc;
use tracing::debug;

/// Every live session on this node, keyed by client id
#[derive(Debug, Default)]
pub struct ConnectionRegistry {
    sessions: DashMap<ClientId, Arc<ClientSession>>,
}

impl ConnectionRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn register(&self, session: Arc<ClientSession>) {
        self.sessions.insert(session.id(), session);
    }

    pub fn deregister(&self, id: ClientId) -> Option<Arc<ClientSession>> {
        self.sessions.remove(&id).map(|(_, session)| session)
    }

    pub fn get(&self, id: ClientId) -> Option<Arc<ClientSession>> {
        self.sessions.get(&id).map(|entry| entry.value().clone())
    }

    pub fn len(&self) -> usize {
        self.sessions.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sessions.is_empty()
    }

    pub fn snapshot(&self) -> Vec<Arc<ClientSession>> {
        self.sessions
            .iter()
            .map(|entry| entry.value().clone())
            .collect()
    }

    /// Ask every session to stop. Sessions deregister themselves once their
    /// connection task has finished.
    pub fn close_all(&self) -> usize {
        let sessions = self.snapshot();
        for session in &sessions {
            debug!("Closing client {}", session.remote_addr());
            session.close();
        }
        sessions.len()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio_util::sync::CancellationToken;

    fn session(id: ClientId, port: u16) -> Arc<ClientSession> {
        Arc::new(ClientSession::new(
            id,
            format!("127.0.0.1:{}", port).parse().unwrap(),
            CancellationToken::new(),
        ))
    }

    #[test]
    fn test_register_and_deregister() {
        let registry = ConnectionRegistry::new();
        registry.register(session(1, 5001));
        registry.register(session(2, 5002));
        assert_eq!(registry.len(), 2);
        assert_eq!(registry.get(2).unwrap().remote_addr().port(), 5002);

        assert!(registry.deregister(1).is_some());
        assert!(registry.deregister(1).is_none());
        assert_eq!(registry.len(), 1);
        assert!(registry.get(1).is_none());
    }

    #[test]
    fn test_close_all_cancels_sessions() {
        let registry = ConnectionRegistry::new();
        let a = session(1, 5001);
        let b = session(2, 5002);
        registry.register(a.clone());
        registry.register(b.clone());

        assert_eq!(registry.close_all(), 2);
        assert!(a.is_cancelled());
        assert!(b.is_cancelled());
        // Entries stay until their connection tasks deregister
        assert_eq!(registry.len(), 2);
    }
}
