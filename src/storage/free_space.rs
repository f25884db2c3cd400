//! Free space management for the page region of the data file.
//!
//! Free pages are tracked as an ordered map of disjoint extents
//! (`start -> count`). Allocation is first-fit; when nothing fits, the file
//! grows by `max(request, preallocation_pages)` pages, reusing a free run
//! that already touches the end of the file. Freed extents are coalesced
//! with their neighbours.
//!
//! The map is not persisted. On open it is rebuilt from the extents the
//! registry knows to be live, so header pages, live extents and free extents
//! always partition the file exactly.
//!
//! Allocation, freeing and file growth all happen under one mutex, so two
//! callers can never be handed overlapping runs and two growths can never
//! interleave.

use std::collections::BTreeMap;
use std::sync::Arc;

use log::debug;
use parking_lot::Mutex;

use crate::storage::disk::{PageManager, HEADER_PAGES, PAGE_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{Extent, PageId};

#[derive(Debug)]
struct FreeState {
    free: BTreeMap<u64, u64>,
    total_pages: u64,
    free_pages: u64,
}

impl FreeState {
    fn insert_coalesced(&mut self, start: u64, count: u64) {
        let mut start = start;
        let mut count = count;

        if let Some((&prev_start, &prev_count)) = self.free.range(..start).next_back() {
            if prev_start + prev_count == start {
                self.free.remove(&prev_start);
                start = prev_start;
                count += prev_count;
            }
        }
        if let Some(&next_count) = self.free.get(&(start + count)) {
            self.free.remove(&(start + count));
            count += next_count;
        }
        self.free.insert(start, count);
    }

    fn take_first_fit(&mut self, count: u64) -> Option<u64> {
        let (&start, &run) = self.free.iter().find(|(_, &run)| run >= count)?;
        self.free.remove(&start);
        if run > count {
            self.free.insert(start + count, run - count);
        }
        self.free_pages -= count;
        Some(start)
    }

    /// Length of the free run that ends exactly at the end of the file.
    fn free_tail(&self) -> u64 {
        match self.free.iter().next_back() {
            Some((&start, &count)) if start + count == self.total_pages => count,
            _ => 0,
        }
    }
}

pub struct FreeSpaceManager {
    pages: Arc<PageManager>,
    preallocation_pages: u64,
    state: Mutex<FreeState>,
}

impl FreeSpaceManager {
    /// Free space manager for a file whose data region is entirely free.
    pub fn new(pages: Arc<PageManager>, preallocation_pages: u64) -> StorageResult<Self> {
        Self::rebuild(pages, preallocation_pages, std::iter::empty())
    }

    /// Rebuild the free map from the set of live extents.
    pub fn rebuild(
        pages: Arc<PageManager>,
        preallocation_pages: u64,
        live: impl IntoIterator<Item = Extent>,
    ) -> StorageResult<Self> {
        let total_pages = pages.num_pages()?.max(HEADER_PAGES);
        let mut live: Vec<Extent> = live.into_iter().filter(|e| e.count > 0).collect();
        live.sort();

        let mut state = FreeState {
            free: BTreeMap::new(),
            total_pages,
            free_pages: 0,
        };

        let mut cursor = HEADER_PAGES;
        for extent in live {
            if extent.start.0 < cursor {
                return Err(StorageError::AllocationConflict(format!(
                    "live {} overlaps the header or another live extent",
                    extent
                )));
            }
            if extent.end() > total_pages {
                return Err(StorageError::corruption(
                    "free space map",
                    format!("live {} lies past the end of the file ({total_pages} pages)", extent),
                ));
            }
            if extent.start.0 > cursor {
                state.insert_coalesced(cursor, extent.start.0 - cursor);
                state.free_pages += extent.start.0 - cursor;
            }
            cursor = extent.end();
        }
        if cursor < total_pages {
            state.insert_coalesced(cursor, total_pages - cursor);
            state.free_pages += total_pages - cursor;
        }

        Ok(Self {
            pages,
            preallocation_pages: preallocation_pages.max(1),
            state: Mutex::new(state),
        })
    }

    /// Allocate `count` contiguous pages, growing the file when nothing fits.
    pub fn allocate(&self, count: u64) -> StorageResult<PageId> {
        if count == 0 {
            return Err(StorageError::InvalidArgument(
                "cannot allocate zero pages".to_string(),
            ));
        }

        let mut state = self.state.lock();
        if let Some(start) = state.take_first_fit(count) {
            return Ok(PageId(start));
        }

        let shortfall = count - state.free_tail();
        let grow_by = shortfall.max(self.preallocation_pages);
        let new_total = state.total_pages + grow_by;

        // Bookkeeping is only touched once the new length is confirmed.
        self.pages.set_len(new_total * PAGE_SIZE as u64)?;
        debug!(
            "grew data file from {} to {} pages",
            state.total_pages, new_total
        );

        let old_total = state.total_pages;
        state.total_pages = new_total;
        state.insert_coalesced(old_total, grow_by);
        state.free_pages += grow_by;

        state.take_first_fit(count).map(PageId).ok_or_else(|| {
            StorageError::AllocationConflict(format!(
                "no run of {count} pages after growing the file to {new_total} pages"
            ))
        })
    }

    pub fn allocate_extent(&self, count: u64) -> StorageResult<Extent> {
        Ok(Extent::new(self.allocate(count)?, count))
    }

    /// Return `count` pages starting at `start` to the free map.
    pub fn free(&self, start: PageId, count: u64) -> StorageResult<()> {
        if count == 0 {
            return Ok(());
        }
        let extent = Extent::new(start, count);
        let mut state = self.state.lock();

        if start.0 < HEADER_PAGES || extent.end() > state.total_pages {
            return Err(StorageError::AllocationConflict(format!(
                "{} is outside the data region [{}, {})",
                extent, HEADER_PAGES, state.total_pages
            )));
        }
        if let Some((&prev_start, &prev_count)) = state.free.range(..=start.0).next_back() {
            if prev_start + prev_count > start.0 {
                return Err(StorageError::AllocationConflict(format!(
                    "{} overlaps free pages [{}, {})",
                    extent,
                    prev_start,
                    prev_start + prev_count
                )));
            }
        }
        if let Some((&next_start, _)) = state.free.range(start.0..).next() {
            if next_start < extent.end() {
                return Err(StorageError::AllocationConflict(format!(
                    "{} overlaps free pages starting at {}",
                    extent, next_start
                )));
            }
        }

        state.insert_coalesced(start.0, count);
        state.free_pages += count;
        Ok(())
    }

    pub fn free_extent(&self, extent: Extent) -> StorageResult<()> {
        self.free(extent.start, extent.count)
    }

    pub fn free_pages(&self) -> u64 {
        self.state.lock().free_pages
    }

    pub fn total_pages(&self) -> u64 {
        self.state.lock().total_pages
    }

    /// Snapshot of the free extents in page order.
    pub fn extents(&self) -> Vec<Extent> {
        self.state
            .lock()
            .free
            .iter()
            .map(|(&start, &count)| Extent::new(PageId(start), count))
            .collect()
    }

    pub fn is_free(&self, page: PageId) -> bool {
        let state = self.state.lock();
        match state.free.range(..=page.0).next_back() {
            Some((&start, &count)) => page.0 < start + count,
            None => false,
        }
    }
}
