//! Block registry: the name → location directory.
//!
//! The registry lives in memory and is persisted as a whole ("snapshot")
//! in batches. Every mutation bumps a dirty counter; the background flusher
//! writes a snapshot once the counter reaches `flush_threshold` or every
//! `flush_interval`, whichever comes first.
//!
//! Snapshots are shadow-written: serialize outside the lock, write into a
//! freshly allocated extent, sync, publish the extent in the next header
//! slot, and only then release the previous snapshot's extent. Mutations
//! made after a snapshot are covered by the journal, which is trimmed to the
//! records newer than the snapshot once the header is durable.

use std::collections::HashMap;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use log::{debug, error, warn};
use parking_lot::{Mutex, RwLock};
use serde::{Deserialize, Serialize};
use tokio::sync::{watch, Notify};
use tokio::time::MissedTickBehavior;

use crate::codec::{ValueReader, ValueWriter};
use crate::config::RegistryConfig;
use crate::storage::disk::{FileHeader, PageManager, SnapshotPointer, PAGE_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::free_space::FreeSpaceManager;
use crate::storage::page::{Extent, PageId};
use crate::storage::shutdown::Shutdown;
use crate::storage::wal::{WalManager, WalRecord, WalRecordPayload, LSN};

const SNAPSHOT_MAGIC: u32 = 0x504E_5352; // "RSNP"
const SNAPSHOT_VERSION: u32 = 1;

/// Where a block's bytes live in the data file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Location {
    pub offset: u64,
    pub length: u64,
    pub checksum: u32,
    pub generation: u64,
}

impl Location {
    /// Pages reserved for this block.
    pub fn extent(&self) -> Extent {
        Extent::new(
            PageId(self.offset / PAGE_SIZE as u64),
            Extent::pages_for(self.length as usize),
        )
    }
}

/// Decoded registry snapshot.
#[derive(Debug, Clone, PartialEq, Default)]
pub struct RegistrySnapshot {
    pub lsn: LSN,
    pub max_generation: u64,
    pub entries: HashMap<String, Location>,
}

impl RegistrySnapshot {
    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let mut writer = ValueWriter::with_capacity(32 + self.entries.len() * 48);
        writer.write_u32(SNAPSHOT_MAGIC);
        writer.write_u32(SNAPSHOT_VERSION);
        writer.write_u64(self.lsn.0);
        writer.write_u64(self.max_generation);
        writer.write_u32(self.entries.len() as u32);

        let mut names: Vec<&String> = self.entries.keys().collect();
        names.sort();
        for name in names {
            let location = &self.entries[name];
            writer.write_str(name)?;
            writer.write_u64(location.offset);
            writer.write_u64(location.length);
            writer.write_u32(location.checksum);
            writer.write_u64(location.generation);
        }
        Ok(writer.into_inner())
    }

    pub fn decode(data: &[u8]) -> StorageResult<Self> {
        let mut reader = ValueReader::new(data);
        let magic = reader.read_u32()?;
        if magic != SNAPSHOT_MAGIC {
            return Err(StorageError::corruption(
                "registry snapshot",
                format!("bad magic {magic:08x}"),
            ));
        }
        let version = reader.read_u32()?;
        if version != SNAPSHOT_VERSION {
            return Err(StorageError::corruption(
                "registry snapshot",
                format!("unsupported version {version}"),
            ));
        }

        let lsn = LSN(reader.read_u64()?);
        let max_generation = reader.read_u64()?;
        let count = reader.read_u32()? as usize;
        let mut entries = HashMap::with_capacity(count.min(1 << 20));
        for _ in 0..count {
            let name = reader.read_string()?;
            let location = Location {
                offset: reader.read_u64()?,
                length: reader.read_u64()?,
                checksum: reader.read_u32()?,
                generation: reader.read_u64()?,
            };
            entries.insert(name, location);
        }

        Ok(RegistrySnapshot {
            lsn,
            max_generation,
            entries,
        })
    }
}

#[derive(Debug)]
struct RegistryState {
    entries: HashMap<String, Location>,
    dirty: usize,
    applied_lsn: LSN,
}

pub struct BlockRegistry {
    config: RegistryConfig,
    state: RwLock<RegistryState>,
    /// Current on-disk header; the lock also serializes snapshot writes.
    header: Mutex<FileHeader>,
    next_generation: AtomicU64,
    snapshots_written: AtomicU64,
    wake: Notify,
    pages: Arc<PageManager>,
    fsm: Arc<FreeSpaceManager>,
    wal: Arc<WalManager>,
}

impl BlockRegistry {
    /// Build a registry from recovered state.
    ///
    /// `pending` is the number of mutations not yet covered by a snapshot
    /// (for example, replayed journal records).
    #[allow(clippy::too_many_arguments)]
    pub fn restore(
        config: RegistryConfig,
        pages: Arc<PageManager>,
        fsm: Arc<FreeSpaceManager>,
        wal: Arc<WalManager>,
        header: FileHeader,
        snapshot: RegistrySnapshot,
        pending: usize,
    ) -> Self {
        let max_generation = snapshot
            .entries
            .values()
            .map(|l| l.generation)
            .max()
            .unwrap_or(0)
            .max(snapshot.max_generation);

        BlockRegistry {
            config,
            state: RwLock::new(RegistryState {
                entries: snapshot.entries,
                dirty: pending,
                applied_lsn: snapshot.lsn,
            }),
            header: Mutex::new(header),
            next_generation: AtomicU64::new(max_generation + 1),
            snapshots_written: AtomicU64::new(0),
            wake: Notify::new(),
            pages,
            fsm,
            wal,
        }
    }

    pub fn get(&self, name: &str) -> StorageResult<Location> {
        self.state
            .read()
            .entries
            .get(name)
            .copied()
            .ok_or_else(|| StorageError::NotFound(format!("block '{name}'")))
    }

    pub fn contains(&self, name: &str) -> bool {
        self.state.read().entries.contains_key(name)
    }

    /// Record a new location for `name`, returning the one it replaces.
    pub fn put(&self, name: &str, offset: u64, length: u64, checksum: u32) -> Option<Location> {
        let location = Location {
            offset,
            length,
            checksum,
            generation: self.next_generation(),
        };
        let mut state = self.state.write();
        let previous = state.entries.insert(name.to_string(), location);
        self.mark_dirty(&mut state, 1);
        previous
    }

    pub fn remove(&self, name: &str) -> Option<Location> {
        let mut state = self.state.write();
        let previous = state.entries.remove(name);
        if previous.is_some() {
            self.mark_dirty(&mut state, 1);
        }
        previous
    }

    /// Apply one committed batch of journal records.
    ///
    /// Returns, per record, the location it displaced.
    pub fn apply(&self, records: &[WalRecord]) -> Vec<Option<Location>> {
        let mut state = self.state.write();
        let mut displaced = Vec::with_capacity(records.len());
        for record in records {
            let previous = match &record.payload {
                WalRecordPayload::Put { name, location } => {
                    state.entries.insert(name.clone(), *location)
                }
                WalRecordPayload::Remove { name } => state.entries.remove(name),
            };
            displaced.push(previous);
            if record.lsn > state.applied_lsn {
                state.applied_lsn = record.lsn;
            }
        }
        self.mark_dirty(&mut state, records.len());
        displaced
    }

    fn mark_dirty(&self, state: &mut RegistryState, count: usize) {
        state.dirty += count;
        if state.dirty >= self.config.flush_threshold {
            self.wake.notify_one();
        }
    }

    pub fn next_generation(&self) -> u64 {
        self.next_generation.fetch_add(1, Ordering::SeqCst)
    }

    /// Entries whose name starts with `prefix`, sorted by name.
    pub fn list(&self, prefix: &str) -> Vec<(String, Location)> {
        let state = self.state.read();
        let mut entries: Vec<(String, Location)> = state
            .entries
            .iter()
            .filter(|(name, _)| name.starts_with(prefix))
            .map(|(name, location)| (name.clone(), *location))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    pub fn len(&self) -> usize {
        self.state.read().entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn dirty_count(&self) -> usize {
        self.state.read().dirty
    }

    pub fn applied_lsn(&self) -> LSN {
        self.state.read().applied_lsn
    }

    pub fn snapshots_written(&self) -> u64 {
        self.snapshots_written.load(Ordering::Relaxed)
    }

    /// Extent of the snapshot the on-disk header currently points at.
    pub fn snapshot_extent(&self) -> Option<Extent> {
        self.header.lock().snapshot.map(|s| s.extent)
    }

    /// Persist a full snapshot if anything changed since the last one.
    ///
    /// Returns whether a snapshot was written.
    pub fn flush(&self) -> StorageResult<bool> {
        let mut header = self.header.lock();

        let (snapshot, dirty) = {
            let state = self.state.read();
            if state.dirty == 0 {
                return Ok(false);
            }
            let snapshot = RegistrySnapshot {
                lsn: state.applied_lsn,
                max_generation: self.next_generation.load(Ordering::SeqCst),
                entries: state.entries.clone(),
            };
            (snapshot, state.dirty)
        };

        let bytes = snapshot.encode()?;
        let extent = self.fsm.allocate_extent(Extent::pages_for(bytes.len()))?;

        let data_written = self
            .pages
            .write_at(extent.byte_offset(), &bytes)
            .and_then(|_| self.pages.sync());
        if let Err(e) = data_written {
            if let Err(free_err) = self.fsm.free_extent(extent) {
                error!("failed to release unused snapshot {}: {}", extent, free_err);
            }
            return Err(e);
        }

        let pointer = SnapshotPointer {
            extent,
            len: bytes.len() as u64,
            checksum: crc32fast::hash(&bytes),
        };
        let next = header.next(pointer, snapshot.lsn.0);
        // If the header write fails its slot may still have reached the disk,
        // so the new extent is deliberately not released here.
        self.pages.write_header(&next)?;

        let previous = header.snapshot;
        *header = next;
        if let Some(previous) = previous {
            self.fsm.free_extent(previous.extent)?;
        }

        let trimmed = self.wal.checkpoint(snapshot.lsn)?;

        {
            let mut state = self.state.write();
            state.dirty = state.dirty.saturating_sub(dirty);
        }
        self.snapshots_written.fetch_add(1, Ordering::Relaxed);
        debug!(
            "registry snapshot: {} entries, {} bytes at {}, {}, {} journal records trimmed",
            snapshot.entries.len(),
            bytes.len(),
            extent,
            snapshot.lsn,
            trimmed
        );
        Ok(true)
    }

    /// Background flush loop.
    ///
    /// Exits on any shutdown signal. The final snapshot on `Drain` is written
    /// by the group-commit writer after it has emptied its queue, so that it
    /// includes every drained operation.
    pub async fn run_flusher(self: Arc<Self>, mut shutdown: watch::Receiver<Shutdown>) {
        let period = self.config.flush_interval;
        let mut ticker = tokio::time::interval_at(tokio::time::Instant::now() + period, period);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Delay);

        loop {
            tokio::select! {
                changed = shutdown.changed() => {
                    if changed.is_err() || *shutdown.borrow() != Shutdown::Running {
                        break;
                    }
                    continue;
                }
                _ = self.wake.notified() => {}
                _ = ticker.tick() => {}
            }

            if self.dirty_count() == 0 {
                continue;
            }
            let registry = self.clone();
            match tokio::task::spawn_blocking(move || registry.flush()).await {
                Ok(Ok(_)) => {}
                Ok(Err(e)) => warn!("registry flush failed: {}", e),
                Err(e) => error!("registry flush task failed: {}", e),
            }
        }
        debug!("registry flusher stopped");
    }
}
