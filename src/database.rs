use std::collections::HashSet;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::time::SystemTime;

use bytes::Bytes;
use log::warn;
use tokio::sync::Mutex;

use crate::catalog::{Catalog, ColumnInfo, IndexInfo, TableSchema};
use crate::config::Config;
use crate::storage::disk::sidecar_path;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::{BlockStore, CommitHandle, Location, StoreStats};
use crate::tier::{
    BlobOwner, FileStreamManager, OverflowManager, SweepReport, TierReference, TierStrategy,
};

/// Blocks holding the references written by [`Database::put_value`].
pub const VALUE_PREFIX: &str = "__values/";

fn value_block(name: &str) -> String {
    format!("{VALUE_PREFIX}{name}")
}

/// High-level interface that integrates the block store, value tiers and
/// the table directory.
pub struct Database {
    blocks: Arc<BlockStore>,
    tiers: TierStrategy,
    catalog: Catalog,
    /// Serializes the reference swap of named values.
    value_lock: Mutex<()>,
}

impl Database {
    /// Create a new database at the specified path
    pub async fn create(path: &Path, config: Config) -> StorageResult<Self> {
        if path.exists() {
            return Err(StorageError::AlreadyExists(format!(
                "database file {}",
                path.display()
            )));
        }
        let blocks = Arc::new(BlockStore::create(path, config.clone()).await?);
        Self::assemble(path, config, blocks)
    }

    /// Open an existing database
    pub async fn open(path: &Path, config: Config) -> StorageResult<Self> {
        let blocks = Arc::new(BlockStore::open(path, config.clone()).await?);
        Self::assemble(path, config, blocks)
    }

    fn assemble(path: &Path, config: Config, blocks: Arc<BlockStore>) -> StorageResult<Self> {
        let blob_root: PathBuf = config
            .filestream
            .root
            .clone()
            .unwrap_or_else(|| sidecar_path(path, ".blobs"));
        let filestream = Arc::new(FileStreamManager::new(blob_root, config.filestream)?);
        let tiers = TierStrategy::new(
            config.tiers,
            OverflowManager::new(blocks.clone()),
            filestream,
        );
        let catalog = Catalog::new(blocks.clone());
        Ok(Self {
            blocks,
            tiers,
            catalog,
            value_lock: Mutex::new(()),
        })
    }

    pub fn blocks(&self) -> &Arc<BlockStore> {
        &self.blocks
    }

    pub fn tiers(&self) -> &TierStrategy {
        &self.tiers
    }

    pub fn catalog(&self) -> &Catalog {
        &self.catalog
    }

    pub fn read_block(&self, name: &str) -> StorageResult<Vec<u8>> {
        self.blocks.read_block(name)
    }

    pub async fn write_block(
        &self,
        name: &str,
        payload: impl Into<Bytes>,
    ) -> StorageResult<Location> {
        self.blocks.write_block(name, payload).await
    }

    pub async fn submit_block(
        &self,
        name: &str,
        payload: impl Into<Bytes>,
    ) -> StorageResult<CommitHandle> {
        self.blocks.submit_block(name, payload).await
    }

    pub async fn delete_block(&self, name: &str) -> StorageResult<Option<Location>> {
        self.blocks.delete_block(name).await
    }

    /// Place a value in the tier its size calls for.
    pub async fn store(&self, data: &[u8], owner: &BlobOwner) -> StorageResult<TierReference> {
        self.tiers.store(data, owner).await
    }

    pub async fn load(&self, reference: &TierReference) -> StorageResult<Vec<u8>> {
        self.tiers.load(reference).await
    }

    pub async fn delete_value(&self, reference: &TierReference) -> StorageResult<()> {
        self.tiers.delete(reference).await
    }

    /// Store a value and record its reference under `name`, replacing any
    /// previous value of that name.
    ///
    /// The value itself is written first. Only the swap of the reference is
    /// serialized, and whatever reference the swap displaced is released.
    pub async fn put_value(
        &self,
        name: &str,
        data: &[u8],
        owner: &BlobOwner,
    ) -> StorageResult<TierReference> {
        let reference = self.tiers.store(data, owner).await?;

        let swapped: StorageResult<Option<TierReference>> = async {
            let _guard = self.value_lock.lock().await;
            let previous = self.value_reference(name)?;
            self.blocks
                .write_block(&value_block(name), reference.encode()?)
                .await?;
            Ok(previous)
        }
        .await;

        match swapped {
            Ok(Some(previous)) => {
                if let Err(e) = self.tiers.delete(&previous).await {
                    warn!("failed to release old value of '{}': {}", name, e);
                }
            }
            Ok(None) => {}
            Err(e) => {
                if let Err(cleanup) = self.tiers.delete(&reference).await {
                    warn!("failed to release value for '{}': {}", name, cleanup);
                }
                return Err(e);
            }
        }
        Ok(reference)
    }

    pub async fn get_value(&self, name: &str) -> StorageResult<Vec<u8>> {
        let reference = self
            .value_reference(name)?
            .ok_or_else(|| StorageError::NotFound(format!("value '{name}'")))?;
        self.tiers.load(&reference).await
    }

    /// Delete a named value and the storage behind it.
    pub async fn remove_value(&self, name: &str) -> StorageResult<()> {
        let reference = {
            let _guard = self.value_lock.lock().await;
            let reference = self
                .value_reference(name)?
                .ok_or_else(|| StorageError::NotFound(format!("value '{name}'")))?;
            self.blocks.delete_block(&value_block(name)).await?;
            reference
        };
        self.tiers.delete(&reference).await
    }

    pub fn value_reference(&self, name: &str) -> StorageResult<Option<TierReference>> {
        match self.blocks.read_block(&value_block(name)) {
            Ok(data) => Ok(Some(TierReference::decode(&data)?)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }

    /// Names of the values written with [`Database::put_value`].
    pub fn list_values(&self) -> Vec<String> {
        self.blocks
            .list(VALUE_PREFIX)
            .into_iter()
            .map(|(name, _)| name[VALUE_PREFIX.len()..].to_string())
            .collect()
    }

    /// Sweep blob files that no named value references any more.
    pub async fn sweep_orphans(&self, now: SystemTime) -> StorageResult<SweepReport> {
        let mut referenced = HashSet::new();
        for name in self.list_values() {
            if let Some(TierReference::FileStream(pointer)) = self.value_reference(&name)? {
                referenced.insert(pointer.id);
            }
        }
        let filestream = self.tiers.filestream().clone();
        Ok(tokio::task::spawn_blocking(move || filestream.sweep_orphans(&referenced, now)).await??)
    }

    pub async fn create_table(
        &self,
        name: &str,
        columns: Vec<ColumnInfo>,
        indexes: Vec<IndexInfo>,
    ) -> StorageResult<TableSchema> {
        self.catalog.create_table(name, columns, indexes).await
    }

    pub fn load_table(&self, name: &str) -> StorageResult<TableSchema> {
        self.catalog.load_table(name)
    }

    pub async fn drop_table(&self, name: &str) -> StorageResult<()> {
        self.catalog.drop_table(name).await
    }

    /// List all tables in the database
    pub fn list_tables(&self) -> StorageResult<Vec<String>> {
        self.catalog.list_tables()
    }

    /// Make every acknowledged and queued write durable, registry included.
    /// Call before shutdown; [`Database::close`] does.
    pub async fn force_flush(&self) -> StorageResult<()> {
        self.blocks.force_flush().await
    }

    pub async fn close(&self) -> StorageResult<()> {
        self.blocks.close().await
    }

    /// Stop without flushing, as a crash would.
    pub async fn halt(&self) -> StorageResult<()> {
        self.blocks.halt().await
    }

    pub fn stats(&self) -> StoreStats {
        self.blocks.stats()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::tier::Tier;
    use anyhow::Result;
    use tempfile::tempdir;

    #[tokio::test]
    async fn test_database_creation() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("test.db");

        let db = Database::create(&path, Config::default()).await?;
        assert!(path.exists());
        db.close().await?;

        let again = Database::create(&path, Config::default()).await;
        assert!(matches!(again, Err(StorageError::AlreadyExists(_))));
        Ok(())
    }

    #[tokio::test]
    async fn test_named_values_replace_and_remove() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::create(&dir.path().join("v.db"), Config::default()).await?;
        let owner = BlobOwner::new("docs", "body", "1");

        let first = db.put_value("doc", &vec![1u8; 20_000], &owner).await?;
        assert_eq!(first.tier(), Tier::Overflow);
        let TierReference::Overflow { head, .. } = first else {
            panic!("expected an overflow reference");
        };

        let second = db.put_value("doc", b"small now", &owner).await?;
        assert_eq!(second.tier(), Tier::Inline);
        assert_eq!(db.get_value("doc").await?, b"small now");
        // The replaced overflow chain was released.
        assert!(db.tiers().overflow().read_chain(head).unwrap_err().is_not_found());

        assert_eq!(db.list_values(), vec!["doc".to_string()]);
        db.remove_value("doc").await?;
        assert!(db.get_value("doc").await.unwrap_err().is_not_found());
        db.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_concurrent_puts_release_every_displaced_value() -> Result<()> {
        let dir = tempdir()?;
        let db = Arc::new(Database::create(&dir.path().join("c.db"), Config::default()).await?);
        let owner = BlobOwner::new("docs", "body", "1");
        db.put_value("doc", &vec![0u8; 10_000], &owner).await?;

        let mut tasks = Vec::new();
        for i in 1..=8u8 {
            let db = db.clone();
            let owner = owner.clone();
            tasks.push(tokio::spawn(async move {
                db.put_value("doc", &vec![i; 10_000], &owner).await
            }));
        }
        for task in tasks {
            task.await??;
        }

        // Exactly one overflow chain survives: the one the name points at.
        let chains = db.blocks().registry().list("__overflow/");
        assert_eq!(chains.len(), 1);
        let Some(TierReference::Overflow { head, .. }) = db.value_reference("doc")? else {
            panic!("expected an overflow reference");
        };
        assert_eq!(chains[0].0, crate::tier::overflow::chain_name(head));

        let value = db.get_value("doc").await?;
        assert_eq!(value.len(), 10_000);
        assert!(value.iter().all(|b| *b == value[0]));
        db.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_sweep_keeps_referenced_blobs() -> Result<()> {
        let dir = tempdir()?;
        let db = Database::create(&dir.path().join("s.db"), Config::default()).await?;
        let owner = BlobOwner::new("media", "data", "7");

        let big = vec![3u8; 300 * 1024];
        db.put_value("kept", &big, &owner).await?;
        let orphan = db.store(&big, &owner).await?;
        assert_eq!(orphan.tier(), Tier::FileStream);

        let later = SystemTime::now() + std::time::Duration::from_secs(8 * 24 * 60 * 60);
        let report = db.sweep_orphans(later).await?;
        assert_eq!(report.referenced, 1);
        assert_eq!(report.removed.len(), 1);
        assert_eq!(db.get_value("kept").await?, big);
        assert!(db.load(&orphan).await.unwrap_err().is_corruption());
        db.close().await?;
        Ok(())
    }
}
