pub mod overflow_page;

use std::fmt;

use crate::storage::PAGE_SIZE;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct PageId(pub u64);

impl PageId {
    /// Byte offset of this page inside the data file.
    pub fn offset(&self) -> u64 {
        self.0 * PAGE_SIZE as u64
    }
}

impl fmt::Display for PageId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "page {}", self.0)
    }
}

/// A contiguous run of pages.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct Extent {
    pub start: PageId,
    pub count: u64,
}

impl Extent {
    pub fn new(start: PageId, count: u64) -> Self {
        Self { start, count }
    }

    /// Smallest extent able to hold `len` bytes (at least one page).
    pub fn pages_for(len: usize) -> u64 {
        (len.max(1) as u64).div_ceil(PAGE_SIZE as u64)
    }

    /// First page past the end of the extent.
    pub fn end(&self) -> u64 {
        self.start.0 + self.count
    }

    pub fn byte_offset(&self) -> u64 {
        self.start.offset()
    }

    pub fn byte_len(&self) -> u64 {
        self.count * PAGE_SIZE as u64
    }

    pub fn contains(&self, page: PageId) -> bool {
        page.0 >= self.start.0 && page.0 < self.end()
    }

    pub fn overlaps(&self, other: &Extent) -> bool {
        self.start.0 < other.end() && other.start.0 < self.end()
    }
}

impl fmt::Display for Extent {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "pages [{}, {})", self.start.0, self.end())
    }
}

pub use overflow_page::{OverflowPage, OVERFLOW_HEADER_SIZE, OVERFLOW_PAYLOAD_CAPACITY};
