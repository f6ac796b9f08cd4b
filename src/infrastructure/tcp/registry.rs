use crate::infrastructure::tcp::client::{ClientConnection, ClientSink};
use std::future::Future;
use std::sync::Arc;
use tokio::sync::Mutex;
use tracing::debug;

/// What a [`ClientRegistry::for_each`] visitor wants done with the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Visit {
    Keep,
    Remove,
}

/// Insertion-ordered set of live clients.
///
/// The lock only guards structural changes. Visitors run on a snapshot with
/// the lock released, so network I/O never happens while it is held; removals
/// they request are applied afterwards under a fresh lock.
#[derive(Debug)]
pub struct ClientRegistry<C = ClientConnection> {
    clients: Mutex<Vec<Arc<C>>>,
}

impl<C: ClientSink> ClientRegistry<C> {
    pub fn new() -> Self {
        Self {
            clients: Mutex::new(Vec::new()),
        }
    }

    pub async fn add(&self, client: C) -> Arc<C> {
        let client = Arc::new(client);
        self.clients.lock().await.push(Arc::clone(&client));
        client
    }

    pub async fn count(&self) -> usize {
        self.clients.lock().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.clients.lock().await.is_empty()
    }

    /// Current clients in insertion order.
    pub async fn snapshot(&self) -> Vec<Arc<C>> {
        self.clients.lock().await.clone()
    }

    /// Visit every client registered when the pass starts.
    ///
    /// Clients added during the pass are kept and visited on the next one.
    /// Returns the number of clients removed.
    pub async fn for_each<F, Fut>(&self, mut visit: F) -> usize
    where
        F: FnMut(Arc<C>) -> Fut,
        Fut: Future<Output = Visit>,
    {
        let snapshot = self.snapshot().await;
        let mut doomed = Vec::new();

        for client in snapshot {
            if visit(Arc::clone(&client)).await == Visit::Remove {
                doomed.push(client);
            }
        }

        if doomed.is_empty() {
            return 0;
        }

        let mut clients = self.clients.lock().await;
        let before = clients.len();
        clients.retain(|c| !doomed.iter().any(|d| Arc::ptr_eq(c, d)));
        let removed = before - clients.len();
        debug!(removed, remaining = clients.len(), "Pruned clients");
        removed
    }

    /// Remove every client and close its connection.
    pub async fn clear(&self) -> usize {
        let drained: Vec<Arc<C>> = std::mem::take(&mut *self.clients.lock().await);
        for client in &drained {
            client.close().await;
        }
        drained.len()
    }
}

impl<C: ClientSink> Default for ClientRegistry<C> {
    fn default() -> Self {
        Self::new()
    }
}
