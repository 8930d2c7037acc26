//! Placement table stores

use super::PlacementStore;
use crate::error::StoreError;
use crate::models::PlacementTable;
use async_trait::async_trait;
use std::path::{Path, PathBuf};
use tokio::io::AsyncWriteExt;
use tokio::sync::RwLock;
use tracing::debug;

/// Placement table held in memory
#[derive(Debug, Default)]
pub struct InMemoryPlacementStore {
    table: RwLock<PlacementTable>,
}

impl InMemoryPlacementStore {
    pub fn new(table: PlacementTable) -> Self {
        Self {
            table: RwLock::new(table),
        }
    }
}

#[async_trait]
impl PlacementStore for InMemoryPlacementStore {
    async fn read_all(&self) -> Result<PlacementTable, StoreError> {
        Ok(self.table.read().await.clone())
    }

    async fn write_all(&self, table: &PlacementTable) -> Result<(), StoreError> {
        *self.table.write().await = table.clone();
        Ok(())
    }
}

/// Placement table persisted as a JSON object of `service -> "10.p.s.h"`.
///
/// Writes go to a sibling temp file that is renamed over the target, so
/// readers in other processes see either the old or the new table.
#[derive(Debug, Clone)]
pub struct FilePlacementStore {
    path: PathBuf,
}

impl FilePlacementStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }
}

#[async_trait]
impl PlacementStore for FilePlacementStore {
    async fn read_all(&self) -> Result<PlacementTable, StoreError> {
        let data = match tokio::fs::read(&self.path).await {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "Placement file missing, using empty table");
                return Ok(PlacementTable::new());
            }
            Err(e) => return Err(e.into()),
        };

        Ok(serde_json::from_slice(&data)?)
    }

    async fn write_all(&self, table: &PlacementTable) -> Result<(), StoreError> {
        if let Some(parent) = self.path.parent() {
            if !parent.as_os_str().is_empty() {
                tokio::fs::create_dir_all(parent).await?;
            }
        }

        let json = serde_json::to_vec_pretty(table)?;

        let temp_path = self.path.with_extension("tmp");
        let mut file = tokio::fs::File::create(&temp_path).await?;
        file.write_all(&json).await?;
        file.sync_all().await?;
        drop(file);

        tokio::fs::rename(&temp_path, &self.path).await?;

        debug!(path = %self.path.display(), services = table.len(), "Placement table written");
        Ok(())
    }
}
