//! Client Manager (§4.3): the registry mapping client ids to live Clients.

use std::collections::HashMap;
use std::sync::Arc;

use tokio::sync::RwLock;
use tracing::{info, warn};

use super::client::{Client, ClientConfig, ClientError};
use super::id;

#[derive(Debug, thiserror::Error)]
pub enum ManagerError {
    #[error("client id already in use: {0}")]
    IdInUse(String),
    #[error(transparent)]
    Client(#[from] ClientError),
}

#[derive(Debug, Clone, Copy, Default, serde::Serialize)]
pub struct ManagerStats {
    pub tunnels: usize,
}

/// Owns the registry of live clients. Internally an `RwLock<HashMap>` —
/// unlike the Tunnel Agent, registry membership changes are infrequent
/// relative to lookups, so a reader-writer lock fits better than routing
/// every call through a single actor task.
pub struct ClientManager {
    clients: RwLock<HashMap<String, Arc<Client>>>,
    config: ClientConfig,
}

impl ClientManager {
    pub fn new(config: ClientConfig) -> Arc<Self> {
        Arc::new(Self {
            clients: RwLock::new(HashMap::new()),
            config,
        })
    }

    /// Register a new client. If `requested_id` is `Some` and already
    /// taken, the Manager performs exactly one regeneration of a fresh id
    /// rather than failing the request outright (§4.3) — this is distinct
    /// from the id generator's own internal retry loop in `id.rs`, which
    /// only concerns collisions within a single draw.
    pub async fn new_client(
        self: &Arc<Self>,
        requested_id: Option<String>,
    ) -> Result<Arc<Client>, ManagerError> {
        let mut clients = self.clients.write().await;

        let id = match requested_id {
            Some(requested) if !clients.contains_key(&requested) => requested,
            Some(requested) => {
                warn!(requested_id = %requested, "requested client id already in use, generating a new one");
                id::generate_unique_id(|candidate| clients.contains_key(candidate))
            }
            None => id::generate_unique_id(|candidate| clients.contains_key(candidate)),
        };

        let client = Arc::new(Client::start(id.clone(), &self.config).await?);
        clients.insert(id.clone(), Arc::clone(&client));
        drop(clients);

        self.reap_on_close(Arc::clone(&client));
        info!(client_id = %id, "client added to registry");
        Ok(client)
    }

    pub async fn get_client(&self, id: &str) -> Option<Arc<Client>> {
        self.clients.read().await.get(id).cloned()
    }

    pub async fn has_client(&self, id: &str) -> bool {
        self.clients.read().await.contains_key(id)
    }

    /// Idempotent (§4.3): removing an id that isn't registered is a no-op.
    pub async fn remove_client(&self, id: &str) {
        let removed = self.clients.write().await.remove(id);
        if let Some(client) = removed {
            client.close();
            info!(client_id = %id, "client removed from registry");
        }
    }

    pub async fn stats(&self) -> ManagerStats {
        ManagerStats {
            tunnels: self.clients.read().await.len(),
        }
    }

    pub async fn close_all(&self) {
        let clients: Vec<Arc<Client>> = self.clients.read().await.values().cloned().collect();
        for client in clients {
            client.close();
        }
    }

    /// Every registered client is watched by exactly one task that removes
    /// it from the registry the moment it closes itself (grace-period
    /// expiry), so the registry never accumulates dead entries.
    fn reap_on_close(self: &Arc<Self>, client: Arc<Client>) {
        let manager = Arc::clone(self);
        tokio::spawn(async move {
            client.on_close().await;
            manager.clients.write().await.remove(client.id());
        });
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn remove_client_is_idempotent() {
        let manager = ClientManager::new(ClientConfig::default());
        manager.new_client(Some("alpha-river".into())).await.unwrap();
        manager.remove_client("alpha-river").await;
        manager.remove_client("alpha-river").await;
        assert!(!manager.has_client("alpha-river").await);
    }

    #[tokio::test]
    async fn requested_id_collision_regenerates_once() {
        let manager = ClientManager::new(ClientConfig::default());
        let first = manager.new_client(Some("dup-id".into())).await.unwrap();
        assert_eq!(first.id(), "dup-id");

        let second = manager.new_client(Some("dup-id".into())).await.unwrap();
        assert_ne!(second.id(), "dup-id");
        assert_eq!(manager.stats().await.tunnels, 2);
    }
}
