//! Table directory and schema persistence.
//!
//! Schemas are ordinary blocks written through the group-commit writer:
//!
//! - `__schema/tables`: the list of registered table names
//! - `__schema/<table>/columns`: column definitions
//! - `__schema/<table>/indexes`: index definitions
//!
//! Every DDL call waits until its blocks are durable before returning. The
//! in-memory cache is write-through and only ever a copy.

pub mod column_info;
pub mod index_info;
pub mod table_info;

use std::sync::Arc;

use dashmap::DashMap;
use log::{debug, info, warn};
use tokio::sync::Mutex;

use crate::storage::error::{StorageError, StorageResult};
use crate::storage::BlockStore;

pub use column_info::{ColumnInfo, DataType};
pub use index_info::{IndexInfo, IndexKind};
pub use table_info::TableSchema;

use table_info::{deserialize_table_list, serialize_table_list, validate_table_name};

pub const SCHEMA_PREFIX: &str = "__schema/";
pub const TABLE_LIST_BLOCK: &str = "__schema/tables";

pub fn columns_block(table: &str) -> String {
    format!("{SCHEMA_PREFIX}{table}/columns")
}

pub fn indexes_block(table: &str) -> String {
    format!("{SCHEMA_PREFIX}{table}/indexes")
}

pub struct Catalog {
    store: Arc<BlockStore>,
    table_cache: DashMap<String, TableSchema>,
    /// Serializes DDL so read-modify-write of the table list never races.
    ddl_lock: Mutex<()>,
}

impl Catalog {
    pub fn new(store: Arc<BlockStore>) -> Self {
        Self {
            store,
            table_cache: DashMap::new(),
            ddl_lock: Mutex::new(()),
        }
    }

    /// Register a table. Durable on return.
    pub async fn create_table(
        &self,
        name: &str,
        columns: Vec<ColumnInfo>,
        indexes: Vec<IndexInfo>,
    ) -> StorageResult<TableSchema> {
        let schema = TableSchema {
            table_name: name.to_string(),
            columns,
            indexes,
        };
        schema.validate()?;

        let _guard = self.ddl_lock.lock().await;
        let mut tables = self.list_tables()?;
        if tables.iter().any(|t| t == name) {
            return Err(StorageError::AlreadyExists(format!("table '{name}'")));
        }
        tables.push(name.to_string());

        // The schema blocks must be durable before the table is listed, so a
        // failed batch can never leave a registered table without columns.
        let schema_blocks = vec![
            self.store
                .submit_block(&columns_block(name), schema.serialize_columns()?)
                .await?,
            self.store
                .submit_block(&indexes_block(name), schema.serialize_indexes()?)
                .await?,
        ];
        for handle in schema_blocks {
            handle.await?;
        }
        self.store
            .submit_block(TABLE_LIST_BLOCK, serialize_table_list(&tables)?)
            .await?
            .await?;

        self.table_cache.insert(name.to_string(), schema.clone());
        info!(
            "created table '{}' ({} columns, {} indexes)",
            name,
            schema.columns.len(),
            schema.indexes.len()
        );
        Ok(schema)
    }

    /// Load a table's schema.
    ///
    /// For a name that was never registered, whatever schema blocks exist are
    /// returned (an empty schema if there are none). A registered table whose
    /// column block is missing or empty is a [`StorageError::SchemaInconsistency`].
    pub fn load_table(&self, name: &str) -> StorageResult<TableSchema> {
        validate_table_name(name)?;
        if let Some(schema) = self.table_cache.get(name) {
            return Ok(schema.clone());
        }

        let registered = self.list_tables()?.iter().any(|t| t == name);
        let columns = match self.read_optional(&columns_block(name))? {
            Some(data) => TableSchema::deserialize_columns(&data)?,
            None => Vec::new(),
        };
        let indexes = match self.read_optional(&indexes_block(name))? {
            Some(data) => TableSchema::deserialize_indexes(&data)?,
            None => Vec::new(),
        };
        let schema = TableSchema {
            table_name: name.to_string(),
            columns,
            indexes,
        };

        if registered {
            if schema.columns.is_empty() {
                return Err(StorageError::SchemaInconsistency {
                    table: name.to_string(),
                    reason: "registered but its column block is missing or empty".to_string(),
                });
            }
            self.table_cache.insert(name.to_string(), schema.clone());
        } else {
            debug!("table '{}' is not registered", name);
        }
        Ok(schema)
    }

    /// Remove a table and its schema blocks. Durable on return.
    pub async fn drop_table(&self, name: &str) -> StorageResult<()> {
        validate_table_name(name)?;
        let _guard = self.ddl_lock.lock().await;
        let mut tables = self.list_tables()?;
        let before = tables.len();
        tables.retain(|t| t != name);
        if tables.len() == before {
            return Err(StorageError::NotFound(format!("table '{name}'")));
        }

        // Unlist first; schema blocks of an unlisted table are inert and get
        // overwritten by the next create.
        self.store
            .submit_block(TABLE_LIST_BLOCK, serialize_table_list(&tables)?)
            .await?
            .await?;
        self.table_cache.remove(name);

        for block in [columns_block(name), indexes_block(name)] {
            let removed = match self.store.submit_delete(&block).await {
                Ok(handle) => handle.await.map(|_| ()),
                Err(e) => Err(e),
            };
            if let Err(e) = removed {
                warn!("dropped table '{}' but could not remove {}: {}", name, block, e);
            }
        }
        info!("dropped table '{}'", name);
        Ok(())
    }

    /// Registered table names in creation order.
    pub fn list_tables(&self) -> StorageResult<Vec<String>> {
        match self.read_optional(TABLE_LIST_BLOCK)? {
            Some(data) => deserialize_table_list(&data),
            None => Ok(Vec::new()),
        }
    }

    /// Forget cached schemas; the next load reads the blocks again.
    pub fn clear_cache(&self) {
        self.table_cache.clear();
    }

    /// Read a schema block. An empty block counts as absent.
    fn read_optional(&self, block: &str) -> StorageResult<Option<Vec<u8>>> {
        match self.store.read_block(block) {
            Ok(data) if data.is_empty() => Ok(None),
            Ok(data) => Ok(Some(data)),
            Err(e) if e.is_not_found() => Ok(None),
            Err(e) => Err(e),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, RegistryConfig};
    use crate::storage::disk::sidecar_path;
    use crate::storage::wal::WalManager;
    use anyhow::Result;
    use std::time::Duration;
    use tempfile::{tempdir, TempDir};

    async fn create_test_catalog() -> Result<(Catalog, Arc<BlockStore>, TempDir)> {
        let dir = tempdir()?;
        let store =
            Arc::new(BlockStore::create(&dir.path().join("test.db"), Config::default()).await?);
        Ok((Catalog::new(store.clone()), store, dir))
    }

    fn user_columns() -> Vec<ColumnInfo> {
        vec![
            ColumnInfo::new("id", DataType::Int64).not_null(),
            ColumnInfo::new("name", DataType::Varchar),
        ]
    }

    #[tokio::test]
    async fn test_create_and_load_table() -> Result<()> {
        let (catalog, store, _dir) = create_test_catalog().await?;
        let created = catalog
            .create_table(
                "users",
                user_columns(),
                vec![IndexInfo::new("users_pk", &["id"]).unique()],
            )
            .await?;

        catalog.clear_cache();
        let loaded = catalog.load_table("users")?;
        assert_eq!(loaded, created);
        assert_eq!(catalog.list_tables()?, vec!["users".to_string()]);
        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_duplicate_table_name() -> Result<()> {
        let (catalog, store, _dir) = create_test_catalog().await?;
        catalog.create_table("users", user_columns(), vec![]).await?;
        let result = catalog.create_table("users", user_columns(), vec![]).await;
        assert!(matches!(result, Err(StorageError::AlreadyExists(_))));
        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_unregistered_table_is_empty() -> Result<()> {
        let (catalog, store, _dir) = create_test_catalog().await?;
        let schema = catalog.load_table("ghost")?;
        assert!(schema.is_empty());
        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_missing_column_block_is_inconsistent() -> Result<()> {
        let (catalog, store, _dir) = create_test_catalog().await?;
        catalog.create_table("users", user_columns(), vec![]).await?;
        store.delete_block(&columns_block("users")).await?;

        catalog.clear_cache();
        assert!(matches!(
            catalog.load_table("users"),
            Err(StorageError::SchemaInconsistency { .. })
        ));
        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_column_block_unregistered() -> Result<()> {
        let (catalog, store, _dir) = create_test_catalog().await?;
        store.write_block(&columns_block("t"), Vec::new()).await?;
        store.write_block(&indexes_block("t"), Vec::new()).await?;

        let schema = catalog.load_table("t")?;
        assert_eq!(schema.table_name, "t");
        assert!(schema.is_empty());
        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_column_block_is_inconsistent() -> Result<()> {
        let (catalog, store, _dir) = create_test_catalog().await?;
        catalog.create_table("t", user_columns(), vec![]).await?;
        store.write_block(&columns_block("t"), Vec::new()).await?;

        catalog.clear_cache();
        assert!(matches!(
            catalog.load_table("t"),
            Err(StorageError::SchemaInconsistency { .. })
        ));
        store.close().await?;
        Ok(())
    }

    /// Journal batch of each record, keyed by block name.
    fn journal_batches(store: &BlockStore) -> Result<Vec<(String, u64)>> {
        let records = WalManager::read_records(&sidecar_path(store.path(), ".wal"))?;
        Ok(records
            .iter()
            .map(|r| (r.name().to_string(), r.lsn.0))
            .collect())
    }

    fn batch_of(batches: &[(String, u64)], block: &str) -> u64 {
        batches
            .iter()
            .rev()
            .find(|(name, _)| name == block)
            .map(|(_, lsn)| *lsn)
            .unwrap_or_else(|| panic!("{block} was never journaled"))
    }

    #[tokio::test]
    async fn test_table_listed_after_schema_is_durable() -> Result<()> {
        let dir = tempdir()?;
        let config = Config::default().with_registry(RegistryConfig {
            flush_threshold: 10_000,
            flush_interval: Duration::from_secs(3600),
        });
        let store = Arc::new(BlockStore::create(&dir.path().join("test.db"), config).await?);
        let catalog = Catalog::new(store.clone());

        catalog
            .create_table("users", user_columns(), vec![IndexInfo::new("pk", &["id"])])
            .await?;
        let batches = journal_batches(&store)?;
        let listed = batch_of(&batches, TABLE_LIST_BLOCK);
        assert!(batch_of(&batches, &columns_block("users")) < listed);
        assert!(batch_of(&batches, &indexes_block("users")) < listed);

        catalog.drop_table("users").await?;
        let batches = journal_batches(&store)?;
        let unlisted = batch_of(&batches, TABLE_LIST_BLOCK);
        assert!(unlisted > listed);
        assert!(batch_of(&batches, &columns_block("users")) > unlisted);
        assert!(batch_of(&batches, &indexes_block("users")) > unlisted);

        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_drop_table() -> Result<()> {
        let (catalog, store, _dir) = create_test_catalog().await?;
        catalog.create_table("a", user_columns(), vec![]).await?;
        catalog.create_table("b", user_columns(), vec![]).await?;

        catalog.drop_table("a").await?;
        assert_eq!(catalog.list_tables()?, vec!["b".to_string()]);
        assert!(!store.contains(&columns_block("a")));
        assert!(catalog.load_table("a")?.is_empty());
        assert!(catalog.drop_table("a").await.unwrap_err().is_not_found());
        store.close().await?;
        Ok(())
    }
}
