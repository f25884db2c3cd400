//! Open-time recovery.
//!
//! Rebuilds the in-memory state of a data file after a clean shutdown or a
//! crash:
//! 1. Header: pick the newest header slot with a valid checksum
//! 2. Snapshot: load the registry snapshot it points at (checksum verified)
//! 3. Replay: apply journal records newer than the snapshot, in order
//! 4. Space: collect the live extents the free space map is rebuilt from
//!
//! Nothing is repaired. A damaged snapshot or a location that points outside
//! the file is reported as corruption and the open fails.

use log::{debug, info};

use crate::storage::disk::{FileHeader, PageManager, PAGE_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::Extent;
use crate::storage::registry::RegistrySnapshot;
use crate::storage::wal::{WalRecord, WalRecordPayload, LSN};

/// Recovery statistics.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct RecoveryStats {
    /// Entries loaded from the snapshot.
    pub snapshot_entries: usize,
    /// Journal records applied on top of the snapshot.
    pub records_replayed: usize,
    /// Journal records already covered by the snapshot.
    pub records_skipped: usize,
    /// Last LSN reflected in the recovered registry.
    pub last_lsn: LSN,
}

/// Everything the engine needs to resume.
#[derive(Debug)]
pub struct RecoveredState {
    pub header: FileHeader,
    /// Snapshot with the journal replayed on top.
    pub registry: RegistrySnapshot,
    pub stats: RecoveryStats,
}

impl RecoveredState {
    /// Extents in use: every registered block plus the current snapshot.
    pub fn live_extents(&self) -> Vec<Extent> {
        let mut extents: Vec<Extent> = self
            .registry
            .entries
            .values()
            .map(|location| location.extent())
            .collect();
        if let Some(pointer) = self.header.snapshot {
            extents.push(pointer.extent);
        }
        extents
    }
}

/// Recover the registry of `pages` using the intact records of its journal.
pub fn recover(pages: &PageManager, journal: Vec<WalRecord>) -> StorageResult<RecoveredState> {
    let header = pages.read_header()?;
    let total_pages = pages.num_pages()?;

    let mut registry = match header.snapshot {
        Some(pointer) => {
            if pointer.extent.end() > total_pages || pointer.len > pointer.extent.byte_len() {
                return Err(StorageError::corruption(
                    "registry snapshot",
                    format!(
                        "{} ({} bytes) does not fit a file of {} pages",
                        pointer.extent, pointer.len, total_pages
                    ),
                ));
            }
            let mut bytes = vec![0u8; pointer.len as usize];
            pages.read_at(pointer.extent.byte_offset(), &mut bytes)?;
            let actual = crc32fast::hash(&bytes);
            if actual != pointer.checksum {
                return Err(StorageError::checksum_mismatch(
                    "registry snapshot",
                    pointer.checksum,
                    actual,
                ));
            }
            let snapshot = RegistrySnapshot::decode(&bytes)?;
            if snapshot.lsn.0 != header.journal_seq {
                return Err(StorageError::corruption(
                    "registry snapshot",
                    format!(
                        "snapshot is at {} but the header says LSN({})",
                        snapshot.lsn, header.journal_seq
                    ),
                ));
            }
            snapshot
        }
        None => RegistrySnapshot {
            lsn: LSN(header.journal_seq),
            ..RegistrySnapshot::default()
        },
    };

    let mut stats = RecoveryStats {
        snapshot_entries: registry.entries.len(),
        ..RecoveryStats::default()
    };

    for record in journal {
        if record.lsn <= registry.lsn {
            stats.records_skipped += 1;
            continue;
        }
        match record.payload {
            WalRecordPayload::Put { name, location } => {
                registry.max_generation = registry.max_generation.max(location.generation);
                registry.entries.insert(name, location);
            }
            WalRecordPayload::Remove { name } => {
                registry.entries.remove(&name);
            }
        }
        registry.lsn = record.lsn;
        stats.records_replayed += 1;
    }
    stats.last_lsn = registry.lsn;

    let file_len = total_pages * PAGE_SIZE as u64;
    for (name, location) in &registry.entries {
        if location.offset % PAGE_SIZE as u64 != 0
            || location.offset + location.length > file_len
        {
            return Err(StorageError::corruption(
                format!("block '{name}'"),
                format!(
                    "location {}+{} lies outside the {}-byte file",
                    location.offset, location.length, file_len
                ),
            ));
        }
    }

    debug!("recovery stats: {:?}", stats);
    info!(
        "recovered {} blocks ({} from snapshot, {} journal records replayed) up to {}",
        registry.entries.len(),
        stats.snapshot_entries,
        stats.records_replayed,
        stats.last_lsn
    );

    Ok(RecoveredState {
        header,
        registry,
        stats,
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::storage::disk::SnapshotPointer;
    use crate::storage::page::PageId;
    use crate::storage::registry::Location;
    use anyhow::Result;
    use tempfile::tempdir;

    fn location(page: u64, generation: u64) -> Location {
        Location {
            offset: page * PAGE_SIZE as u64,
            length: 10,
            checksum: 0,
            generation,
        }
    }

    #[test]
    fn test_fresh_file_replays_whole_journal() -> Result<()> {
        let dir = tempdir()?;
        let pages = PageManager::create(&dir.path().join("r.db"))?;
        pages.set_len(4 * PAGE_SIZE as u64)?;

        let journal = vec![
            WalRecord::put(LSN(1), "a", location(1, 1)),
            WalRecord::put(LSN(1), "b", location(2, 2)),
            WalRecord::remove(LSN(2), "a"),
            WalRecord::put(LSN(3), "c", location(3, 5)),
        ];
        let state = recover(&pages, journal)?;

        assert_eq!(state.stats.records_replayed, 4);
        assert_eq!(state.stats.last_lsn, LSN(3));
        assert_eq!(state.registry.max_generation, 5);
        assert!(!state.registry.entries.contains_key("a"));
        assert_eq!(state.live_extents().len(), 2);
        Ok(())
    }

    #[test]
    fn test_records_covered_by_snapshot_are_skipped() -> Result<()> {
        let dir = tempdir()?;
        let pages = PageManager::create(&dir.path().join("r.db"))?;
        pages.set_len(4 * PAGE_SIZE as u64)?;

        let mut snapshot = RegistrySnapshot {
            lsn: LSN(2),
            max_generation: 2,
            ..RegistrySnapshot::default()
        };
        snapshot.entries.insert("a".into(), location(1, 1));
        let bytes = snapshot.encode()?;
        let extent = Extent::new(PageId(3), 1);
        pages.write_at(extent.byte_offset(), &bytes)?;
        let header = pages.read_header()?.next(
            SnapshotPointer {
                extent,
                len: bytes.len() as u64,
                checksum: crc32fast::hash(&bytes),
            },
            2,
        );
        pages.write_header(&header)?;

        let journal = vec![
            WalRecord::put(LSN(2), "stale", location(2, 2)),
            WalRecord::put(LSN(3), "b", location(2, 3)),
        ];
        let state = recover(&pages, journal)?;
        assert_eq!(state.stats.records_skipped, 1);
        assert_eq!(state.stats.records_replayed, 1);
        assert!(state.registry.entries.contains_key("a"));
        assert!(!state.registry.entries.contains_key("stale"));
        // Snapshot extent counts as live.
        assert!(state.live_extents().contains(&extent));
        Ok(())
    }

    #[test]
    fn test_damaged_snapshot_is_corruption() -> Result<()> {
        let dir = tempdir()?;
        let pages = PageManager::create(&dir.path().join("r.db"))?;
        pages.set_len(2 * PAGE_SIZE as u64)?;

        let bytes = RegistrySnapshot::default().encode()?;
        let extent = Extent::new(PageId(1), 1);
        pages.write_at(extent.byte_offset(), &bytes)?;
        let header = pages.read_header()?.next(
            SnapshotPointer {
                extent,
                len: bytes.len() as u64,
                checksum: crc32fast::hash(&bytes) ^ 1,
            },
            0,
        );
        pages.write_header(&header)?;

        assert!(recover(&pages, Vec::new()).unwrap_err().is_corruption());
        Ok(())
    }

    #[test]
    fn test_location_past_end_of_file_is_corruption() -> Result<()> {
        let dir = tempdir()?;
        let pages = PageManager::create(&dir.path().join("r.db"))?;
        let journal = vec![WalRecord::put(LSN(1), "far", location(40, 1))];
        assert!(recover(&pages, journal).unwrap_err().is_corruption());
        Ok(())
    }
}
