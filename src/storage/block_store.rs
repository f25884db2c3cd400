//! Named blocks in a single data file.
//!
//! `BlockStore` wires the page manager, free space manager, journal, block
//! registry and group-commit writer together and owns their background
//! tasks. Writes allocate pages up front and are committed through the
//! group-commit writer; reads resolve the name in the registry and verify the
//! stored checksum.

use std::path::{Path, PathBuf};
use std::sync::Arc;

use bytes::Bytes;
use log::{error, info};
use parking_lot::Mutex;
use tokio::sync::watch;
use tokio::task::JoinHandle;

use crate::codec::MAX_VALUE_LEN;
use crate::config::Config;
use crate::recovery::{recover, RecoveryStats};
use crate::storage::disk::{sidecar_path, PageManager};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::free_space::FreeSpaceManager;
use crate::storage::group_commit::{
    CommitHandle, CommitSink, GroupCommitWriter, OpKind, WriteOp, WriterStatsSnapshot,
};
use crate::storage::page::Extent;
use crate::storage::registry::{BlockRegistry, Location, RegistrySnapshot};
use crate::storage::shutdown::Shutdown;
use crate::storage::wal::{WalManager, WalRecord, LSN};

/// Names under this prefix belong to overflow chains and are not accepted
/// through the public block API.
pub const OVERFLOW_PREFIX: &str = "__overflow/";

/// Commits batches to the data file, the journal and the registry.
struct FileCommitSink {
    pages: Arc<PageManager>,
    fsm: Arc<FreeSpaceManager>,
    wal: Arc<WalManager>,
    registry: Arc<BlockRegistry>,
}

impl FileCommitSink {
    fn release(&self, extent: Extent, what: &str) {
        if let Err(e) = self.fsm.free_extent(extent) {
            error!("failed to release {} of {}: {}", extent, what, e);
        }
    }
}

impl CommitSink for FileCommitSink {
    fn persist(&self, lsn: LSN, ops: &[WriteOp]) -> StorageResult<()> {
        for op in ops {
            if let (OpKind::Put, Some(extent)) = (op.kind, op.extent) {
                self.pages.write_at(extent.byte_offset(), &op.payload)?;
            }
        }
        self.pages.sync()?;

        let records: Vec<WalRecord> = ops.iter().map(|op| op.to_record(lsn)).collect();
        self.wal.append(&records)?;
        self.wal.sync()
    }

    fn abort(&self, lsn: LSN) -> StorageResult<()> {
        self.wal.rollback(lsn)
    }

    fn apply(&self, lsn: LSN, ops: &[WriteOp]) -> Vec<Option<Location>> {
        let records: Vec<WalRecord> = ops.iter().map(|op| op.to_record(lsn)).collect();
        let displaced = self.registry.apply(&records);
        for (op, previous) in ops.iter().zip(&displaced) {
            if let Some(previous) = previous {
                self.release(previous.extent(), &op.name);
            }
        }
        displaced
    }

    fn discard(&self, op: &WriteOp) {
        if let Some(extent) = op.extent {
            self.release(extent, &op.name);
        }
    }

    fn checkpoint(&self) -> StorageResult<()> {
        self.registry.flush().map(|_| ())
    }
}

/// Point-in-time engine counters.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct StoreStats {
    pub blocks: usize,
    pub total_pages: u64,
    pub free_pages: u64,
    pub dirty_entries: usize,
    pub snapshots_written: u64,
    pub journal_records: usize,
    pub writer: WriterStatsSnapshot,
}

pub struct BlockStore {
    path: PathBuf,
    config: Config,
    pages: Arc<PageManager>,
    fsm: Arc<FreeSpaceManager>,
    wal: Arc<WalManager>,
    registry: Arc<BlockRegistry>,
    writer: GroupCommitWriter,
    shutdown: watch::Sender<Shutdown>,
    tasks: Mutex<Vec<JoinHandle<()>>>,
    recovery: RecoveryStats,
}

impl BlockStore {
    /// Create a new, empty data file. Fails if `path` already exists.
    pub async fn create(path: &Path, config: Config) -> StorageResult<Self> {
        config.validate()?;
        let owned = path.to_path_buf();
        let prealloc = config.preallocation_pages;
        let (pages, fsm, wal) = tokio::task::spawn_blocking(move || {
            let pages = Arc::new(PageManager::create(&owned)?);
            let fsm = Arc::new(FreeSpaceManager::new(pages.clone(), prealloc)?);
            let wal = Arc::new(WalManager::create(&sidecar_path(&owned, ".wal"))?);
            Ok::<_, StorageError>((pages, fsm, wal))
        })
        .await??;

        let header = pages.read_header()?;
        let registry = Arc::new(BlockRegistry::restore(
            config.registry.clone(),
            pages.clone(),
            fsm.clone(),
            wal.clone(),
            header,
            RegistrySnapshot::default(),
            0,
        ));

        info!("created {}", path.display());
        Ok(Self::start(
            path,
            config,
            pages,
            fsm,
            wal,
            registry,
            RecoveryStats::default(),
        ))
    }

    /// Open an existing data file, recovering its registry.
    pub async fn open(path: &Path, config: Config) -> StorageResult<Self> {
        config.validate()?;
        let owned = path.to_path_buf();
        let prealloc = config.preallocation_pages;
        let registry_config = config.registry.clone();

        let (pages, fsm, wal, registry, stats) = tokio::task::spawn_blocking(move || {
            let pages = Arc::new(PageManager::open(&owned)?);
            let (wal, journal) = WalManager::open(&sidecar_path(&owned, ".wal"))?;
            let wal = Arc::new(wal);

            let state = recover(&pages, journal)?;
            let fsm = Arc::new(FreeSpaceManager::rebuild(
                pages.clone(),
                prealloc,
                state.live_extents(),
            )?);
            let registry = Arc::new(BlockRegistry::restore(
                registry_config,
                pages.clone(),
                fsm.clone(),
                wal.clone(),
                state.header,
                state.registry,
                state.stats.records_replayed,
            ));
            if state.stats.records_replayed > 0 {
                registry.flush()?;
            }
            Ok::<_, StorageError>((pages, fsm, wal, registry, state.stats))
        })
        .await??;

        info!(
            "opened {}: {} blocks, {} free of {} pages",
            path.display(),
            registry.len(),
            fsm.free_pages(),
            fsm.total_pages()
        );
        Ok(Self::start(path, config, pages, fsm, wal, registry, stats))
    }

    fn start(
        path: &Path,
        config: Config,
        pages: Arc<PageManager>,
        fsm: Arc<FreeSpaceManager>,
        wal: Arc<WalManager>,
        registry: Arc<BlockRegistry>,
        recovery: RecoveryStats,
    ) -> Self {
        let (shutdown, shutdown_rx) = watch::channel(Shutdown::Running);
        let sink = Arc::new(FileCommitSink {
            pages: pages.clone(),
            fsm: fsm.clone(),
            wal: wal.clone(),
            registry: registry.clone(),
        });
        let (writer, writer_task) = GroupCommitWriter::start(
            config.writer.clone(),
            sink,
            shutdown_rx.clone(),
            registry.applied_lsn(),
        );
        let flusher_task = tokio::spawn(registry.clone().run_flusher(shutdown_rx));

        BlockStore {
            path: path.to_path_buf(),
            config,
            pages,
            fsm,
            wal,
            registry,
            writer,
            shutdown,
            tasks: Mutex::new(vec![writer_task, flusher_task]),
            recovery,
        }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn config(&self) -> &Config {
        &self.config
    }

    pub fn recovery_stats(&self) -> RecoveryStats {
        self.recovery
    }

    pub(crate) fn pages(&self) -> &Arc<PageManager> {
        &self.pages
    }

    pub(crate) fn registry(&self) -> &Arc<BlockRegistry> {
        &self.registry
    }

    pub(crate) fn free_space(&self) -> &Arc<FreeSpaceManager> {
        &self.fsm
    }

    pub fn location(&self, name: &str) -> StorageResult<Location> {
        self.registry.get(name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.registry.contains(name)
    }

    /// Registered block names starting with `prefix`, sorted.
    pub fn list(&self, prefix: &str) -> Vec<(String, Location)> {
        self.registry
            .list(prefix)
            .into_iter()
            .filter(|(name, _)| !name.starts_with(OVERFLOW_PREFIX))
            .collect()
    }

    /// Read a block and verify its checksum.
    pub fn read_block(&self, name: &str) -> StorageResult<Vec<u8>> {
        let mut location = self.registry.get(name)?;
        let mut retried = false;
        loop {
            let mut buf = vec![0u8; location.length as usize];
            self.pages.read_at(location.offset, &mut buf)?;
            let actual = crc32fast::hash(&buf);
            if actual == location.checksum {
                return Ok(buf);
            }

            // A concurrent rewrite may have released and reused the pages
            // between the lookup and the read.
            let current = self.registry.get(name)?;
            if retried || current == location {
                return Err(StorageError::checksum_mismatch(
                    format!("block '{name}'"),
                    location.checksum,
                    actual,
                ));
            }
            location = current;
            retried = true;
        }
    }

    /// Queue a block write and return its handle without waiting.
    pub async fn submit_block(
        &self,
        name: &str,
        payload: impl Into<Bytes>,
    ) -> StorageResult<CommitHandle> {
        validate_name(name)?;
        self.submit_put(name, payload.into()).await
    }

    /// Write a block and wait until it is durable.
    pub async fn write_block(
        &self,
        name: &str,
        payload: impl Into<Bytes>,
    ) -> StorageResult<Location> {
        self.submit_block(name, payload)
            .await?
            .await?
            .ok_or_else(|| StorageError::NotFound(format!("block '{name}' after write")))
    }

    /// Delete a block and wait until the delete is durable.
    ///
    /// Returns where the block lived; deleting an absent block is a no-op.
    pub async fn delete_block(&self, name: &str) -> StorageResult<Option<Location>> {
        validate_name(name)?;
        self.submit_delete(name).await?.await
    }

    pub(crate) async fn submit_put(
        &self,
        name: &str,
        payload: Bytes,
    ) -> StorageResult<CommitHandle> {
        if payload.len() > MAX_VALUE_LEN {
            return Err(StorageError::ValueTooLarge {
                size: payload.len(),
                max: MAX_VALUE_LEN,
            });
        }
        let extent = self
            .fsm
            .allocate_extent(Extent::pages_for(payload.len()))?;
        let op = WriteOp::put(name, payload, extent, self.registry.next_generation());
        self.writer.enqueue(op).await
    }

    /// Queue a write whose payload already fills a reserved extent.
    pub(crate) async fn submit_reserved(
        &self,
        name: &str,
        payload: Bytes,
        extent: Extent,
    ) -> StorageResult<CommitHandle> {
        let op = WriteOp::put(name, payload, extent, self.registry.next_generation());
        self.writer.enqueue(op).await
    }

    pub(crate) async fn submit_delete(&self, name: &str) -> StorageResult<CommitHandle> {
        self.writer.enqueue(WriteOp::delete(name)).await
    }

    /// Make every queued write durable and persist the registry.
    pub async fn force_flush(&self) -> StorageResult<()> {
        self.writer.force_flush().await?;
        let registry = self.registry.clone();
        tokio::task::spawn_blocking(move || registry.flush()).await??;
        Ok(())
    }

    /// Flush everything and stop the background tasks.
    pub async fn close(&self) -> StorageResult<()> {
        self.force_flush().await?;
        self.shutdown.send_replace(Shutdown::Drain);
        self.join_tasks().await?;
        info!("closed {}", self.path.display());
        Ok(())
    }

    /// Stop the background tasks without flushing, as if the process died.
    pub async fn halt(&self) -> StorageResult<()> {
        self.shutdown.send_replace(Shutdown::Halt);
        self.join_tasks().await
    }

    async fn join_tasks(&self) -> StorageResult<()> {
        let tasks: Vec<JoinHandle<()>> = self.tasks.lock().drain(..).collect();
        for task in tasks {
            task.await?;
        }
        Ok(())
    }

    pub fn stats(&self) -> StoreStats {
        StoreStats {
            blocks: self.registry.len(),
            total_pages: self.fsm.total_pages(),
            free_pages: self.fsm.free_pages(),
            dirty_entries: self.registry.dirty_count(),
            snapshots_written: self.registry.snapshots_written(),
            journal_records: self.wal.record_count(),
            writer: self.writer.stats(),
        }
    }
}

impl Drop for BlockStore {
    fn drop(&mut self) {
        if *self.shutdown.borrow() == Shutdown::Running {
            self.shutdown.send_replace(Shutdown::Drain);
        }
    }
}

fn validate_name(name: &str) -> StorageResult<()> {
    if name.is_empty() {
        return Err(StorageError::InvalidArgument(
            "block name must not be empty".to_string(),
        ));
    }
    if name.starts_with(OVERFLOW_PREFIX) {
        return Err(StorageError::InvalidArgument(format!(
            "block name '{name}' uses the reserved prefix {OVERFLOW_PREFIX}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::WriterConfig;
    use crate::storage::page::PageId;
    use anyhow::Result;
    use std::time::Duration;
    use tempfile::tempdir;

    fn config() -> Config {
        Config::default().with_preallocation_pages(8)
    }

    #[tokio::test]
    async fn test_write_read_delete() -> Result<()> {
        let dir = tempdir()?;
        let store = BlockStore::create(&dir.path().join("b.db"), config()).await?;

        let location = store.write_block("greeting", b"hello".to_vec()).await?;
        assert_eq!(location.length, 5);
        assert_eq!(store.read_block("greeting")?, b"hello");

        let rewritten = store.write_block("greeting", b"hello again".to_vec()).await?;
        assert!(rewritten.generation > location.generation);
        assert_eq!(store.read_block("greeting")?, b"hello again");
        // The first version's page went back to the free map.
        assert!(store.free_space().is_free(PageId(location.offset / 4096)));

        let removed = store.delete_block("greeting").await?;
        assert_eq!(removed, Some(rewritten));
        assert!(store.read_block("greeting").unwrap_err().is_not_found());
        assert_eq!(store.delete_block("greeting").await?, None);

        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_empty_block() -> Result<()> {
        let dir = tempdir()?;
        let store = BlockStore::create(&dir.path().join("b.db"), config()).await?;
        store.write_block("empty", Vec::new()).await?;
        assert!(store.read_block("empty")?.is_empty());
        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_reserved_and_empty_names_rejected() -> Result<()> {
        let dir = tempdir()?;
        let store = BlockStore::create(&dir.path().join("b.db"), config()).await?;
        assert!(matches!(
            store.write_block("__overflow/1", b"x".to_vec()).await,
            Err(StorageError::InvalidArgument(_))
        ));
        assert!(matches!(
            store.write_block("", b"x".to_vec()).await,
            Err(StorageError::InvalidArgument(_))
        ));
        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_corrupted_block_fails_closed() -> Result<()> {
        let dir = tempdir()?;
        let store = BlockStore::create(&dir.path().join("b.db"), config()).await?;
        let location = store.write_block("victim", vec![7u8; 3000]).await?;

        let mut byte = [0u8; 1];
        store.pages().read_at(location.offset + 1234, &mut byte)?;
        byte[0] ^= 0xFF;
        store.pages().write_at(location.offset + 1234, &byte)?;

        assert!(store.read_block("victim").unwrap_err().is_corruption());
        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_reopen_after_close() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("b.db");
        {
            let store = BlockStore::create(&path, config()).await?;
            for i in 0..20 {
                store.write_block(&format!("k{i:02}"), vec![i as u8; 100 * i]).await?;
            }
            store.delete_block("k03").await?;
            store.close().await?;
        }

        let store = BlockStore::open(&path, config()).await?;
        assert_eq!(store.list("k").len(), 19);
        assert_eq!(store.read_block("k07")?, vec![7u8; 700]);
        assert!(store.read_block("k03").unwrap_err().is_not_found());
        assert_eq!(store.recovery_stats().records_replayed, 0);
        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_halt_then_reopen_replays_journal() -> Result<()> {
        let dir = tempdir()?;
        let path = dir.path().join("b.db");
        let slow_snapshots = config().with_registry(crate::config::RegistryConfig {
            flush_threshold: 10_000,
            flush_interval: Duration::from_secs(3600),
        });
        {
            let store = BlockStore::create(&path, slow_snapshots.clone()).await?;
            store.write_block("durable", b"acknowledged".to_vec()).await?;
            assert_eq!(store.stats().snapshots_written, 0);
            store.halt().await?;
        }

        let store = BlockStore::open(&path, slow_snapshots).await?;
        assert_eq!(store.recovery_stats().records_replayed, 1);
        assert_eq!(store.read_block("durable")?, b"acknowledged");
        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_batched_durability() -> Result<()> {
        let dir = tempdir()?;
        let batch = 8usize;
        let config = config().with_writer(WriterConfig {
            batch_threshold: batch,
            batch_interval: Duration::from_secs(3600),
            ..WriterConfig::default()
        });
        let store = BlockStore::create(&dir.path().join("b.db"), config).await?;

        let writes = 50usize;
        let mut handles = Vec::new();
        for i in 0..writes {
            handles.push(store.submit_block(&format!("w{i}"), vec![1u8; 64]).await?);
        }
        store.force_flush().await?;
        for handle in handles {
            handle.await?;
        }

        let stats = store.stats();
        assert!(stats.writer.flushes <= writes.div_ceil(batch) as u64 + 1);
        for i in 0..writes {
            assert_eq!(store.read_block(&format!("w{i}"))?, vec![1u8; 64]);
        }
        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_open_missing_file() -> Result<()> {
        let dir = tempdir()?;
        let result = BlockStore::open(&dir.path().join("absent.db"), config()).await;
        assert!(matches!(result, Err(e) if e.is_not_found()));
        Ok(())
    }
}
