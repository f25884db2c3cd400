use crate::storage::disk::header::{FileHeader, HEADER_SLOT_SIZE};
use crate::storage::disk::{HEADER_PAGES, PAGE_SIZE};
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;
use parking_lot::Mutex;
use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

/// The single shared handle to the data file.
///
/// Every positional read and write goes through one mutex, so a seek and the
/// following transfer are never interleaved with another caller's.
pub struct PageManager {
    path: PathBuf,
    file: Mutex<File>,
}

impl PageManager {
    /// Create a new data file with an initial header.
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .create_new(true)
            .open(path)?;

        let manager = Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        };
        manager.set_len(HEADER_PAGES * PAGE_SIZE as u64)?;
        manager.write_header(&FileHeader::initial())?;
        Ok(manager)
    }

    pub fn open(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .read(true)
            .write(true)
            .open(path)
            .map_err(|e| match e.kind() {
                std::io::ErrorKind::NotFound => {
                    StorageError::NotFound(format!("data file {}", path.display()))
                }
                _ => StorageError::Io(e),
            })?;

        Ok(Self {
            path: path.to_path_buf(),
            file: Mutex::new(file),
        })
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn len(&self) -> StorageResult<u64> {
        Ok(self.file.lock().metadata()?.len())
    }

    pub fn is_empty(&self) -> StorageResult<bool> {
        Ok(self.len()? == 0)
    }

    pub fn num_pages(&self) -> StorageResult<u64> {
        Ok(self.len()? / PAGE_SIZE as u64)
    }

    pub fn read_at(&self, offset: u64, buf: &mut [u8]) -> StorageResult<()> {
        let mut file = self.file.lock();
        let file_size = file.metadata()?.len();
        if offset + buf.len() as u64 > file_size {
            return Err(StorageError::corruption(
                format!("data file at offset {offset}"),
                format!(
                    "read of {} bytes runs past end of file ({file_size} bytes)",
                    buf.len()
                ),
            ));
        }

        file.seek(SeekFrom::Start(offset))?;
        file.read_exact(buf)?;
        Ok(())
    }

    pub fn write_at(&self, offset: u64, data: &[u8]) -> StorageResult<()> {
        let mut file = self.file.lock();
        file.seek(SeekFrom::Start(offset))?;
        file.write_all(data)?;
        Ok(())
    }

    pub fn read_page(&self, page_id: PageId, buf: &mut [u8]) -> StorageResult<()> {
        if buf.len() != PAGE_SIZE {
            return Err(StorageError::InvalidArgument(format!(
                "buffer size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE,
                buf.len()
            )));
        }
        self.read_at(page_id.offset(), buf)
    }

    pub fn write_page(&self, page_id: PageId, data: &[u8]) -> StorageResult<()> {
        if data.len() != PAGE_SIZE {
            return Err(StorageError::InvalidArgument(format!(
                "data size must be PAGE_SIZE ({}), got {}",
                PAGE_SIZE,
                data.len()
            )));
        }
        self.write_at(page_id.offset(), data)
    }

    /// Resize the file and confirm the new length actually took effect.
    pub fn set_len(&self, new_len: u64) -> StorageResult<()> {
        let file = self.file.lock();
        file.set_len(new_len)?;
        let actual = file.metadata()?.len();
        if actual != new_len {
            return Err(StorageError::Io(std::io::Error::other(format!(
                "file resize to {new_len} bytes left it at {actual} bytes"
            ))));
        }
        Ok(())
    }

    /// Make every completed write durable.
    pub fn sync(&self) -> StorageResult<()> {
        self.file.lock().sync_data()?;
        Ok(())
    }

    pub fn read_header(&self) -> StorageResult<FileHeader> {
        let mut page = vec![0u8; PAGE_SIZE];
        self.read_at(0, &mut page)?;
        FileHeader::choose(&page)
    }

    /// Write `header` into its slot and sync.
    pub fn write_header(&self, header: &FileHeader) -> StorageResult<()> {
        let slot = header.encode();
        debug_assert_eq!(slot.len(), HEADER_SLOT_SIZE);
        self.write_at(header.slot_offset(), &slot)?;
        self.sync()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    #[test]
    fn test_create_and_open() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");

        {
            let pm = PageManager::create(&file_path)?;
            assert_eq!(pm.num_pages()?, HEADER_PAGES);
        }

        {
            let pm = PageManager::open(&file_path)?;
            assert_eq!(pm.num_pages()?, HEADER_PAGES);
            assert_eq!(pm.read_header()?, FileHeader::initial());
        }

        Ok(())
    }

    #[test]
    fn test_create_refuses_existing_file() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        PageManager::create(&file_path)?;
        assert!(PageManager::create(&file_path).is_err());
        Ok(())
    }

    #[test]
    fn test_write_and_read_page() -> Result<()> {
        let dir = tempdir()?;
        let pm = PageManager::create(&dir.path().join("test.db"))?;
        pm.set_len(3 * PAGE_SIZE as u64)?;

        let mut write_buf = vec![0u8; PAGE_SIZE];
        write_buf[0] = 42;
        write_buf[PAGE_SIZE - 1] = 24;
        pm.write_page(PageId(1), &write_buf)?;

        let mut read_buf = vec![0u8; PAGE_SIZE];
        pm.read_page(PageId(1), &mut read_buf)?;
        assert_eq!(read_buf[0], 42);
        assert_eq!(read_buf[PAGE_SIZE - 1], 24);

        Ok(())
    }

    #[test]
    fn test_read_past_end_is_corruption() -> Result<()> {
        let dir = tempdir()?;
        let pm = PageManager::create(&dir.path().join("test.db"))?;

        let mut buf = vec![0u8; PAGE_SIZE];
        let err = pm.read_page(PageId(10), &mut buf).unwrap_err();
        assert!(err.is_corruption());

        Ok(())
    }

    #[test]
    fn test_invalid_buffer_size() -> Result<()> {
        let dir = tempdir()?;
        let pm = PageManager::create(&dir.path().join("test.db"))?;

        let mut small_buf = vec![0u8; 100];
        assert!(pm.read_page(PageId(0), &mut small_buf).is_err());
        assert!(pm.write_page(PageId(0), &small_buf).is_err());

        Ok(())
    }

    #[test]
    fn test_open_nonexistent_file() -> Result<()> {
        let dir = tempdir()?;
        let result = PageManager::open(&dir.path().join("nonexistent.db"));
        assert!(matches!(result, Err(StorageError::NotFound(_))));
        Ok(())
    }

    #[test]
    fn test_header_persistence() -> Result<()> {
        let dir = tempdir()?;
        let file_path = dir.path().join("test.db");
        let snapshot = crate::storage::disk::SnapshotPointer {
            extent: crate::storage::page::Extent::new(PageId(1), 1),
            len: 12,
            checksum: 7,
        };
        let next = FileHeader::initial().next(snapshot, 3);

        {
            let pm = PageManager::create(&file_path)?;
            pm.write_header(&next)?;
        }

        let pm = PageManager::open(&file_path)?;
        assert_eq!(pm.read_header()?, next);
        Ok(())
    }
}
