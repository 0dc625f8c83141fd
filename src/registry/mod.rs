//! `ClientRegistry`: tracks known clients, their declared model interest,
//! liveness and participation history.
pub mod error;

use std::{
    collections::HashMap,
    time::{Duration, SystemTime},
};

use serde::{Deserialize, Serialize};
use tokio::sync::RwLock;
use tracing::info;

use crate::registry::error::RegistryError;

/// A client's self-reported hardware profile, used by resource-weighted
/// selection.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeviceProfile {
    pub has_accelerator: bool,
    pub accelerator_count: u32,
    pub os_tag: String,
}

/// Lifecycle status of a registered client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum ClientStatus {
    Active,
    Inactive,
    Banned,
}

/// A registered remote trainer.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Client {
    pub id: String,
    pub model_kind: String,
    pub device_profile: DeviceProfile,
    pub registered_at: SystemTime,
    pub last_seen_at: SystemTime,
    pub rounds_participated: u64,
    pub status: ClientStatus,
}

impl Client {
    /// The status the selector should see: clients that have gone stale
    /// are surfaced as `inactive` without mutating the stored record.
    fn effective_status(&self, staleness: Duration) -> ClientStatus {
        if self.status == ClientStatus::Active {
            let age = SystemTime::now()
                .duration_since(self.last_seen_at)
                .unwrap_or_default();
            if age > staleness {
                return ClientStatus::Inactive;
            }
        }
        self.status
    }
}

/// An optional filter applied by [`ClientRegistry::list`].
#[derive(Debug, Clone, Default)]
pub struct ClientFilter {
    pub model_kind: Option<String>,
    pub status: Option<ClientStatus>,
}

/// Tracks known clients. Safe to share behind an `Arc` across the worker
/// pool; all mutation goes through an internal lock.
pub struct ClientRegistry {
    clients: RwLock<HashMap<String, Client>>,
    staleness_threshold: Duration,
}

impl ClientRegistry {
    pub fn new(staleness_threshold: Duration) -> Self {
        Self {
            clients: RwLock::new(HashMap::new()),
            staleness_threshold,
        }
    }

    /// Upserts a client. Re-registration preserves `roundsParticipated`
    /// and `registeredAt`.
    pub async fn register(
        &self,
        client_id: &str,
        model_kind: &str,
        device_profile: DeviceProfile,
    ) {
        let now = SystemTime::now();
        let mut clients = self.clients.write().await;
        match clients.get_mut(client_id) {
            Some(existing) => {
                existing.model_kind = model_kind.to_string();
                existing.device_profile = device_profile;
                existing.last_seen_at = now;
                if existing.status == ClientStatus::Inactive {
                    existing.status = ClientStatus::Active;
                }
            }
            None => {
                clients.insert(
                    client_id.to_string(),
                    Client {
                        id: client_id.to_string(),
                        model_kind: model_kind.to_string(),
                        device_profile,
                        registered_at: now,
                        last_seen_at: now,
                        rounds_participated: 0,
                        status: ClientStatus::Active,
                    },
                );
                info!(client_id, "registered new client");
            }
        }
    }

    /// Updates `lastSeenAt` for a liveness ping.
    pub async fn touch(&self, client_id: &str) -> Result<(), RegistryError> {
        let mut clients = self.clients.write().await;
        let client = clients
            .get_mut(client_id)
            .ok_or_else(|| RegistryError::NotFound(client_id.to_string()))?;
        client.last_seen_at = SystemTime::now();
        Ok(())
    }

    /// Returns clients matching `filter`, with staleness applied to their
    /// reported status.
    pub async fn list(&self, filter: &ClientFilter) -> Vec<Client> {
        let clients = self.clients.read().await;
        clients
            .values()
            .filter(|c| {
                filter
                    .model_kind
                    .as_ref()
                    .map_or(true, |k| &c.model_kind == k)
            })
            .filter(|c| {
                filter
                    .status
                    .map_or(true, |s| c.effective_status(self.staleness_threshold) == s)
            })
            .map(|c| {
                let mut snapshot = c.clone();
                snapshot.status = c.effective_status(self.staleness_threshold);
                snapshot
            })
            .collect()
    }

    pub async fn get(&self, client_id: &str) -> Result<Client, RegistryError> {
        self.clients
            .read()
            .await
            .get(client_id)
            .cloned()
            .ok_or_else(|| RegistryError::NotFound(client_id.to_string()))
    }

    /// Increments `roundsParticipated` exactly once; called by
    /// `RoundManager` when a client's upload is accepted.
    pub async fn record_participation(&self, client_id: &str) -> Result<(), RegistryError> {
        let mut clients = self.clients.write().await;
        let client = clients
            .get_mut(client_id)
            .ok_or_else(|| RegistryError::NotFound(client_id.to_string()))?;
        client.rounds_participated += 1;
        Ok(())
    }

    pub async fn deregister(&self, client_id: &str) {
        self.clients.write().await.remove(client_id);
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn profile() -> DeviceProfile {
        DeviceProfile {
            has_accelerator: false,
            accelerator_count: 0,
            os_tag: "linux".into(),
        }
    }

    #[tokio::test]
    async fn reregistration_preserves_participation_count() {
        let registry = ClientRegistry::new(Duration::from_secs(3600));
        registry.register("c1", "pneumonia", profile()).await;
        registry.record_participation("c1").await.unwrap();
        registry.register("c1", "pneumonia", profile()).await;
        assert_eq!(registry.get("c1").await.unwrap().rounds_participated, 1);
    }

    #[tokio::test]
    async fn stale_active_client_surfaces_as_inactive() {
        let registry = ClientRegistry::new(Duration::from_millis(10));
        registry.register("c1", "pneumonia", profile()).await;
        tokio::time::sleep(Duration::from_millis(30)).await;

        let filter = ClientFilter {
            model_kind: None,
            status: Some(ClientStatus::Active),
        };
        assert!(registry.list(&filter).await.is_empty());

        let filter = ClientFilter {
            model_kind: None,
            status: Some(ClientStatus::Inactive),
        };
        assert_eq!(registry.list(&filter).await.len(), 1);
    }
}
