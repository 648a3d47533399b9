//! Connected client registry.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::{RwLock, mpsc};
use tracing::debug;
use uuid::Uuid;

/// Outbound queues of every connected client, keyed by connection id.
#[derive(Debug, Clone, Default)]
pub struct ClientRegistry {
    peers: Arc<RwLock<HashMap<Uuid, mpsc::Sender<String>>>>,
}

impl ClientRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn insert(&self, id: Uuid, tx: mpsc::Sender<String>) {
        self.peers.write().await.insert(id, tx);
    }

    pub async fn remove(&self, id: &Uuid) -> bool {
        self.peers.write().await.remove(id).is_some()
    }

    pub async fn len(&self) -> usize {
        self.peers.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.peers.read().await.is_empty()
    }

    pub async fn clear(&self) {
        self.peers.write().await.clear();
    }

    /// Queue `frame` for every client and return how many accepted it.
    ///
    /// Clients whose queue is closed or full are removed; dropping their
    /// sender ends their connection loop.
    pub async fn broadcast(&self, frame: &str) -> usize {
        let targets: Vec<(Uuid, mpsc::Sender<String>)> = self
            .peers
            .read()
            .await
            .iter()
            .map(|(id, tx)| (*id, tx.clone()))
            .collect();

        let mut delivered = 0;
        let mut dead = Vec::new();
        for (id, tx) in targets {
            match tx.try_send(frame.to_owned()) {
                Ok(()) => delivered += 1,
                Err(mpsc::error::TrySendError::Full(_)) => {
                    debug!(connection_id = %id, "Client queue full, dropping");
                    dead.push(id);
                }
                Err(mpsc::error::TrySendError::Closed(_)) => {
                    debug!(connection_id = %id, "Client queue closed, dropping");
                    dead.push(id);
                }
            }
        }

        if !dead.is_empty() {
            let mut peers = self.peers.write().await;
            for id in &dead {
                peers.remove(id);
            }
        }
        delivered
    }
}
