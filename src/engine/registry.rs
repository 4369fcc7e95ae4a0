use std::collections::BTreeMap;
use std::sync::Arc;

use tokio::sync::RwLock;

use crate::models::AccountCredential;

use super::events::StatsSnapshot;
use super::relay::{EngineStatus, RelayEngine};
use super::EngineError;

struct Entry {
    engine: Arc<RelayEngine>,
    credential: AccountCredential,
}

/// All relays of the process, keyed by leader account id.
#[derive(Default)]
pub struct RelayRegistry {
    relays: RwLock<BTreeMap<String, Entry>>,
}

impl RelayRegistry {
    pub fn new() -> Self {
        Self::default()
    }

    /// Register a relay and the leader credential it starts with.
    /// An existing relay for the same leader is replaced.
    pub async fn register(&self, engine: Arc<RelayEngine>, credential: AccountCredential) {
        let leader_id = engine.leader_id().to_string();
        let previous = self
            .relays
            .write()
            .await
            .insert(leader_id.clone(), Entry { engine, credential });
        if let Some(previous) = previous {
            tracing::warn!(leader = %leader_id, "Replacing registered relay");
            if let Err(e) = previous.engine.stop().await {
                tracing::warn!(leader = %leader_id, error = %e, "Failed to stop replaced relay");
            }
        }
    }

    pub async fn get(&self, leader_id: &str) -> Option<Arc<RelayEngine>> {
        self.relays
            .read()
            .await
            .get(leader_id)
            .map(|e| Arc::clone(&e.engine))
    }

    async fn require(&self, leader_id: &str) -> Result<(Arc<RelayEngine>, AccountCredential), EngineError> {
        self.relays
            .read()
            .await
            .get(leader_id)
            .map(|e| (Arc::clone(&e.engine), e.credential.clone()))
            .ok_or_else(|| EngineError::UnknownRelay(leader_id.to_string()))
    }

    pub async fn leader_ids(&self) -> Vec<String> {
        self.relays.read().await.keys().cloned().collect()
    }

    pub async fn len(&self) -> usize {
        self.relays.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.relays.read().await.is_empty()
    }

    pub async fn statuses(&self) -> Vec<EngineStatus> {
        let engines: Vec<Arc<RelayEngine>> = self
            .relays
            .read()
            .await
            .values()
            .map(|e| Arc::clone(&e.engine))
            .collect();
        let mut out = Vec::with_capacity(engines.len());
        for engine in engines {
            out.push(engine.status().await);
        }
        out
    }

    pub async fn stats(&self, leader_id: &str) -> Result<StatsSnapshot, EngineError> {
        let (engine, _) = self.require(leader_id).await?;
        Ok(engine.stats())
    }

    pub async fn start(&self, leader_id: &str) -> Result<(), EngineError> {
        let (engine, credential) = self.require(leader_id).await?;
        engine.start(credential).await
    }

    pub async fn stop(&self, leader_id: &str) -> Result<(), EngineError> {
        let (engine, _) = self.require(leader_id).await?;
        engine.stop().await
    }

    /// Start every registered relay; failures are logged and counted.
    pub async fn start_all(&self) -> usize {
        let mut started = 0;
        for leader_id in self.leader_ids().await {
            match self.start(&leader_id).await {
                Ok(()) => started += 1,
                Err(e) => tracing::error!(leader = %leader_id, error = %e, "Failed to start relay"),
            }
        }
        started
    }

    pub async fn stop_all(&self) {
        for leader_id in self.leader_ids().await {
            if let Err(e) = self.stop(&leader_id).await {
                tracing::warn!(leader = %leader_id, error = %e, "Failed to stop relay");
            }
        }
    }
}
