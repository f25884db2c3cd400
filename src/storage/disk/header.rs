//! Data file header.
//!
//! Page 0 holds two header slots that are written alternately (slot index is
//! `sequence % 2`). A torn header write can only damage the slot being
//! written, so the previous slot remains a valid fallback.
//!
//! ```text
//! Offset  Size  Description
//! 0       8     Magic "PGVAULT1"
//! 8       4     Format version
//! 12      4     Page size
//! 16      8     Header sequence (incremented on every header write)
//! 24      8     Snapshot first page (0 = no snapshot)
//! 32      8     Snapshot page count
//! 40      8     Snapshot length in bytes
//! 48      4     Snapshot CRC-32
//! 52      8     Last journal sequence covered by the snapshot
//! 60      4     CRC-32 of bytes 0..60
//! ```

use crate::storage::disk::PAGE_SIZE;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::{Extent, PageId};
use byteorder::{ByteOrder, LittleEndian};

pub const HEADER_SLOT_SIZE: usize = PAGE_SIZE / 2;
pub const FORMAT_VERSION: u32 = 1;

const MAGIC: &[u8; 8] = b"PGVAULT1";
const ENCODED_LEN: usize = 64;
const CHECKSUM_OFFSET: usize = 60;

/// Location of the persisted registry snapshot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct SnapshotPointer {
    pub extent: Extent,
    pub len: u64,
    pub checksum: u32,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct FileHeader {
    pub sequence: u64,
    pub snapshot: Option<SnapshotPointer>,
    pub journal_seq: u64,
}

impl FileHeader {
    /// Header of a freshly created file.
    pub fn initial() -> Self {
        FileHeader {
            sequence: 1,
            snapshot: None,
            journal_seq: 0,
        }
    }

    /// Byte offset of the slot this header is written to.
    pub fn slot_offset(&self) -> u64 {
        (self.sequence % 2) * HEADER_SLOT_SIZE as u64
    }

    /// The header that supersedes this one.
    pub fn next(&self, snapshot: SnapshotPointer, journal_seq: u64) -> Self {
        FileHeader {
            sequence: self.sequence + 1,
            snapshot: Some(snapshot),
            journal_seq,
        }
    }

    pub fn encode(&self) -> [u8; HEADER_SLOT_SIZE] {
        let mut slot = [0u8; HEADER_SLOT_SIZE];
        slot[0..8].copy_from_slice(MAGIC);
        LittleEndian::write_u32(&mut slot[8..12], FORMAT_VERSION);
        LittleEndian::write_u32(&mut slot[12..16], PAGE_SIZE as u32);
        LittleEndian::write_u64(&mut slot[16..24], self.sequence);
        if let Some(snapshot) = &self.snapshot {
            LittleEndian::write_u64(&mut slot[24..32], snapshot.extent.start.0);
            LittleEndian::write_u64(&mut slot[32..40], snapshot.extent.count);
            LittleEndian::write_u64(&mut slot[40..48], snapshot.len);
            LittleEndian::write_u32(&mut slot[48..52], snapshot.checksum);
        }
        LittleEndian::write_u64(&mut slot[52..60], self.journal_seq);
        let checksum = crc32fast::hash(&slot[..CHECKSUM_OFFSET]);
        LittleEndian::write_u32(&mut slot[CHECKSUM_OFFSET..ENCODED_LEN], checksum);
        slot
    }

    /// Decode one slot. Returns `Ok(None)` for a slot that was never written or
    /// fails its checksum, and an error for a valid slot of an incompatible file.
    pub fn decode(slot: &[u8]) -> StorageResult<Option<Self>> {
        if slot.len() < ENCODED_LEN || &slot[0..8] != MAGIC {
            return Ok(None);
        }
        let stored = LittleEndian::read_u32(&slot[CHECKSUM_OFFSET..ENCODED_LEN]);
        if stored != crc32fast::hash(&slot[..CHECKSUM_OFFSET]) {
            return Ok(None);
        }

        let version = LittleEndian::read_u32(&slot[8..12]);
        let page_size = LittleEndian::read_u32(&slot[12..16]);
        if version != FORMAT_VERSION || page_size as usize != PAGE_SIZE {
            return Err(StorageError::InvalidArgument(format!(
                "unsupported file format (version {version}, page size {page_size})"
            )));
        }

        let start = LittleEndian::read_u64(&slot[24..32]);
        let snapshot = if start == 0 {
            None
        } else {
            Some(SnapshotPointer {
                extent: Extent::new(PageId(start), LittleEndian::read_u64(&slot[32..40])),
                len: LittleEndian::read_u64(&slot[40..48]),
                checksum: LittleEndian::read_u32(&slot[48..52]),
            })
        };

        Ok(Some(FileHeader {
            sequence: LittleEndian::read_u64(&slot[16..24]),
            snapshot,
            journal_seq: LittleEndian::read_u64(&slot[52..60]),
        }))
    }

    /// Pick the newest valid slot out of the header page.
    pub fn choose(page: &[u8]) -> StorageResult<Self> {
        if page.len() < PAGE_SIZE {
            return Err(StorageError::corruption(
                "file header",
                format!("header page truncated to {} bytes", page.len()),
            ));
        }
        let a = Self::decode(&page[..HEADER_SLOT_SIZE])?;
        let b = Self::decode(&page[HEADER_SLOT_SIZE..PAGE_SIZE])?;
        match (a, b) {
            (Some(a), Some(b)) => Ok(if a.sequence >= b.sequence { a } else { b }),
            (Some(h), None) | (None, Some(h)) => Ok(h),
            (None, None) => Err(StorageError::corruption(
                "file header",
                "no valid header slot",
            )),
        }
    }
}
