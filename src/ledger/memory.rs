use super::models::SettlementRecord;
use super::repository::{SettlementStore, TreasureMarker};
use crate::error::AppResult;
use async_trait::async_trait;
use chrono::{DateTime, Utc};
use std::collections::{HashMap, HashSet};
use uuid::Uuid;

/// In-process store used when no database is configured, and by tests
pub struct MemoryStore<R> {
    records: tokio::sync::RwLock<HashMap<Uuid, R>>,
}

impl<R: SettlementRecord> MemoryStore<R> {
    pub fn new() -> Self {
        Self {
            records: tokio::sync::RwLock::new(HashMap::new()),
        }
    }

    pub async fn get(&self, id: Uuid) -> Option<R> {
        self.records.read().await.get(&id).cloned()
    }

    pub async fn len(&self) -> usize {
        self.records.read().await.len()
    }

    pub async fn all(&self) -> Vec<R> {
        let mut records: Vec<R> = self.records.read().await.values().cloned().collect();
        records.sort_by_key(|r| r.updated_at());
        records
    }
}

impl<R: SettlementRecord> Default for MemoryStore<R> {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl<R: SettlementRecord> SettlementStore<R> for MemoryStore<R> {
    async fn find_by_status(&self, axis: R::Axis, statuses: &[R::Status]) -> AppResult<Vec<R>> {
        let records = self.records.read().await;
        let mut found: Vec<R> = records
            .values()
            .filter(|r| statuses.contains(&r.status(axis)))
            .cloned()
            .collect();
        found.sort_by_key(|r| r.updated_at());
        Ok(found)
    }

    async fn find_by_status_and_staleness(
        &self,
        axis: R::Axis,
        statuses: &[R::Status],
        threshold: DateTime<Utc>,
    ) -> AppResult<Vec<R>> {
        let records = self.records.read().await;
        let mut found: Vec<R> = records
            .values()
            .filter(|r| statuses.contains(&r.status(axis)) && r.updated_at() <= threshold)
            .cloned()
            .collect();
        found.sort_by_key(|r| r.updated_at());
        Ok(found)
    }

    async fn save(&self, record: &R) -> AppResult<()> {
        let mut records = self.records.write().await;
        records.insert(record.id(), record.clone());
        Ok(())
    }

    async fn delete(&self, record: &R) -> AppResult<()> {
        let mut records = self.records.write().await;
        records.remove(&record.id());
        Ok(())
    }
}

/// Remembers which genesis hashes have had their treasure buried
#[derive(Default)]
pub struct MemoryTreasureMarker {
    buried: tokio::sync::RwLock<HashSet<String>>,
}

impl MemoryTreasureMarker {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn is_buried(&self, genesis_hash: &str) -> bool {
        self.buried.read().await.contains(genesis_hash)
    }
}

#[async_trait]
impl TreasureMarker for MemoryTreasureMarker {
    async fn mark_genesis_hash_buried(&self, genesis_hash: &str) -> AppResult<()> {
        self.buried.write().await.insert(genesis_hash.to_string());
        Ok(())
    }
}
