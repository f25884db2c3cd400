use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use crate::storage::PAGE_SIZE;
use byteorder::{ByteOrder, LittleEndian};

// Header structure (24 bytes)
//
// [0..4]    magic "OVFL"
// [4..12]   next page id (u64::MAX terminates the chain)
// [12..16]  payload length
// [16..20]  CRC-32 over every other byte of the page
// [20..24]  reserved
pub const OVERFLOW_HEADER_SIZE: usize = 24;
pub const OVERFLOW_PAYLOAD_CAPACITY: usize = PAGE_SIZE - OVERFLOW_HEADER_SIZE;

const MAGIC: u32 = 0x4C46_564F; // "OVFL" little-endian
const MAGIC_OFFSET: usize = 0;
const NEXT_OFFSET: usize = 4;
const LEN_OFFSET: usize = 12;
const CHECKSUM_OFFSET: usize = 16;
const TERMINAL: u64 = u64::MAX;

/// Decoded view of one page of an overflow chain.
#[derive(Debug)]
pub struct OverflowPage<'a> {
    pub next: Option<PageId>,
    pub payload: &'a [u8],
}

impl<'a> OverflowPage<'a> {
    /// Build a full page image for `payload`.
    pub fn encode(next: Option<PageId>, payload: &[u8]) -> StorageResult<Vec<u8>> {
        if payload.len() > OVERFLOW_PAYLOAD_CAPACITY {
            return Err(StorageError::InvalidArgument(format!(
                "overflow payload of {} bytes exceeds page capacity {}",
                payload.len(),
                OVERFLOW_PAYLOAD_CAPACITY
            )));
        }

        let mut page = vec![0u8; PAGE_SIZE];
        LittleEndian::write_u32(&mut page[MAGIC_OFFSET..], MAGIC);
        LittleEndian::write_u64(
            &mut page[NEXT_OFFSET..],
            next.map(|p| p.0).unwrap_or(TERMINAL),
        );
        LittleEndian::write_u32(&mut page[LEN_OFFSET..], payload.len() as u32);
        page[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + payload.len()].copy_from_slice(payload);

        let checksum = page_checksum(&page);
        LittleEndian::write_u32(&mut page[CHECKSUM_OFFSET..], checksum);
        Ok(page)
    }

    /// Parse and verify a page image read from `page_id`.
    pub fn decode(page_id: PageId, data: &'a [u8]) -> StorageResult<Self> {
        let target = format!("overflow {}", page_id);
        if data.len() != PAGE_SIZE {
            return Err(StorageError::corruption(
                target,
                format!("short page: {} bytes", data.len()),
            ));
        }

        let stored = LittleEndian::read_u32(&data[CHECKSUM_OFFSET..]);
        let actual = page_checksum(data);
        if stored != actual {
            return Err(StorageError::checksum_mismatch(target, stored, actual));
        }

        let magic = LittleEndian::read_u32(&data[MAGIC_OFFSET..]);
        if magic != MAGIC {
            return Err(StorageError::corruption(
                target,
                format!("bad magic {magic:08x}"),
            ));
        }

        let len = LittleEndian::read_u32(&data[LEN_OFFSET..]) as usize;
        if len > OVERFLOW_PAYLOAD_CAPACITY {
            return Err(StorageError::corruption(
                target,
                format!("payload length {len} exceeds capacity"),
            ));
        }

        let next = match LittleEndian::read_u64(&data[NEXT_OFFSET..]) {
            TERMINAL => None,
            raw => Some(PageId(raw)),
        };

        Ok(OverflowPage {
            next,
            payload: &data[OVERFLOW_HEADER_SIZE..OVERFLOW_HEADER_SIZE + len],
        })
    }
}

fn page_checksum(page: &[u8]) -> u32 {
    let mut hasher = crc32fast::Hasher::new();
    hasher.update(&page[..CHECKSUM_OFFSET]);
    hasher.update(&page[CHECKSUM_OFFSET + 4..]);
    hasher.finalize()
}
