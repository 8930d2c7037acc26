//! Slice membership store

use super::SliceStore;
use crate::error::StoreError;
use crate::models::{HostAddr, SliceId, SliceTable};
use async_trait::async_trait;
use std::collections::BTreeSet;
use std::path::Path;
use tokio::sync::RwLock;
use tracing::{info, warn};

/// Slice table held in memory
#[derive(Debug, Default)]
pub struct InMemorySliceStore {
    table: RwLock<SliceTable>,
}

impl InMemorySliceStore {
    /// Build from an initial table. An address listed in several slices
    /// stays only in the first one (by slice id order).
    pub fn new(table: SliceTable) -> Self {
        let mut seen = BTreeSet::new();
        let mut normalized = SliceTable::new();

        for (slice, members) in table {
            let mut kept = BTreeSet::new();
            for addr in members {
                if seen.insert(addr) {
                    kept.insert(addr);
                } else {
                    warn!(slice = %slice, addr = %addr, "Address already belongs to another slice, dropping");
                }
            }
            normalized.insert(slice, kept);
        }

        Self {
            table: RwLock::new(normalized),
        }
    }

    /// Seed the store from a JSON object of `slice -> ["10.p.s.h", ...]`
    pub async fn load(path: &Path) -> Result<Self, StoreError> {
        let data = tokio::fs::read(path).await?;
        let table: SliceTable = serde_json::from_slice(&data)?;
        info!(path = %path.display(), slices = table.len(), "Loaded slice table");
        Ok(Self::new(table))
    }
}

#[async_trait]
impl SliceStore for InMemorySliceStore {
    async fn read_all(&self) -> Result<SliceTable, StoreError> {
        Ok(self.table.read().await.clone())
    }

    async fn slice_of(&self, addr: HostAddr) -> Result<Option<SliceId>, StoreError> {
        let table = self.table.read().await;
        Ok(table
            .iter()
            .find(|(_, members)| members.contains(&addr))
            .map(|(slice, _)| slice.clone()))
    }

    async fn assign(&self, addr: HostAddr, slice: &str) -> Result<(), StoreError> {
        let mut table = self.table.write().await;
        for members in table.values_mut() {
            members.remove(&addr);
        }
        table.entry(slice.to_string()).or_default().insert(addr);
        Ok(())
    }

    async fn remove(&self, addr: HostAddr) -> Result<Option<SliceId>, StoreError> {
        let mut table = self.table.write().await;
        for (slice, members) in table.iter_mut() {
            if members.remove(&addr) {
                return Ok(Some(slice.clone()));
            }
        }
        Ok(None)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn addr(s: &str) -> HostAddr {
        s.parse().unwrap()
    }

    fn store() -> InMemorySliceStore {
        let mut table = SliceTable::new();
        table.insert(
            "blue".to_string(),
            [addr("10.0.0.2"), addr("10.2.1.2")].into_iter().collect(),
        );
        table.insert("red".to_string(), [addr("10.3.0.3")].into_iter().collect());
        InMemorySliceStore::new(table)
    }

    #[tokio::test]
    async fn test_same_slice() {
        let store = store();
        assert!(store.same_slice(addr("10.0.0.2"), addr("10.2.1.2")).await.unwrap());
        assert!(!store.same_slice(addr("10.0.0.2"), addr("10.3.0.3")).await.unwrap());
        assert!(!store.same_slice(addr("10.1.0.2"), addr("10.1.0.3")).await.unwrap());
    }

    #[tokio::test]
    async fn test_assign_keeps_membership_exclusive() {
        let store = store();
        store.assign(addr("10.3.0.3"), "blue").await.unwrap();

        let table = store.read_all().await.unwrap();
        assert!(table["blue"].contains(&addr("10.3.0.3")));
        assert!(table["red"].is_empty());
    }

    #[tokio::test]
    async fn test_relocate_moves_service_address() {
        let store = store();
        let slice = store
            .relocate(addr("10.0.0.2"), addr("10.3.0.3"))
            .await
            .unwrap();

        assert_eq!(slice.as_deref(), Some("blue"));
        assert_eq!(store.slice_of(addr("10.3.0.3")).await.unwrap().as_deref(), Some("blue"));
        assert_eq!(store.slice_of(addr("10.0.0.2")).await.unwrap(), None);
        assert!(store.same_slice(addr("10.3.0.3"), addr("10.2.1.2")).await.unwrap());
    }

    #[tokio::test]
    async fn test_duplicate_members_are_normalized() {
        let mut table = SliceTable::new();
        table.insert("a".to_string(), [addr("10.0.0.2")].into_iter().collect());
        table.insert("b".to_string(), [addr("10.0.0.2")].into_iter().collect());

        let store = InMemorySliceStore::new(table);
        assert_eq!(store.slice_of(addr("10.0.0.2")).await.unwrap().as_deref(), Some("a"));
        assert!(store.read_all().await.unwrap()["b"].is_empty());
    }
}
