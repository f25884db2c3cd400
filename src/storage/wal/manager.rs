//! Journal manager implementation.
//!
//! The journal is a single sidecar file next to the data file. Each record
//! is framed as `[len u32][crc32 u32][bincode payload]`. Appends are not
//! durable until [`WalManager::sync`]; the group-commit writer syncs once per
//! batch, after the batch's data pages.
//!
//! The records written since the last checkpoint are kept in memory so a
//! checkpoint can drop the ones a registry snapshot already covers and
//! atomically rewrite the file with the rest.

use std::fs::{File, OpenOptions};
use std::io::{Read, Seek, SeekFrom, Write};
use std::path::{Path, PathBuf};

use log::{debug, warn};
use parking_lot::Mutex;

use super::record::{WalRecord, LSN};
use crate::storage::disk::sync_parent_dir;
use crate::storage::error::{StorageError, StorageResult};

/// Frame header: payload length + payload checksum.
const FRAME_HEADER_SIZE: usize = 8;

/// Upper bound on a single framed record; anything larger is a torn length.
const MAX_RECORD_SIZE: usize = 16 * 1024 * 1024;

struct WalInner {
    file: File,
    /// Current file length.
    len: u64,
    /// Framed records since the last checkpoint, in file order.
    retained: Vec<(LSN, Vec<u8>)>,
    /// File length and retained count before the most recent append.
    last_append: Option<(LSN, u64, usize)>,
}

/// Journal manager for registry mutations.
pub struct WalManager {
    path: PathBuf,
    inner: Mutex<WalInner>,
}

impl WalManager {
    /// Create an empty journal, discarding any stale file at `path`.
    pub fn create(path: &Path) -> StorageResult<Self> {
        let file = OpenOptions::new()
            .create(true)
            .read(true)
            .write(true)
            .truncate(true)
            .open(path)?;
        file.sync_all()?;

        Ok(WalManager {
            path: path.to_path_buf(),
            inner: Mutex::new(WalInner {
                file,
                len: 0,
                retained: Vec::new(),
                last_append: None,
            }),
        })
    }

    /// Open an existing journal, returning every intact record in it.
    ///
    /// A torn or corrupt tail (from a crash during an unsynced append) is cut
    /// off; everything before it is kept.
    pub fn open(path: &Path) -> StorageResult<(Self, Vec<WalRecord>)> {
        if !path.exists() {
            return Ok((Self::create(path)?, Vec::new()));
        }

        let mut file = OpenOptions::new().read(true).write(true).open(path)?;
        let mut data = Vec::new();
        file.read_to_end(&mut data)?;

        let (frames, good_len) = split_frames(&data);
        if good_len < data.len() {
            warn!(
                "journal {} has a torn tail: keeping {} of {} bytes",
                path.display(),
                good_len,
                data.len()
            );
            file.set_len(good_len as u64)?;
            file.sync_all()?;
        }

        let mut records = Vec::with_capacity(frames.len());
        let mut retained = Vec::with_capacity(frames.len());
        for (start, end) in frames {
            let payload = &data[start + FRAME_HEADER_SIZE..end];
            let record = WalRecord::deserialize(payload)
                .map_err(|e| StorageError::corruption("journal", e.to_string()))?;
            retained.push((record.lsn, data[start..end].to_vec()));
            records.push(record);
        }

        let manager = WalManager {
            path: path.to_path_buf(),
            inner: Mutex::new(WalInner {
                file,
                len: good_len as u64,
                retained,
                last_append: None,
            }),
        };
        Ok((manager, records))
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    /// Number of records written since the last checkpoint.
    pub fn record_count(&self) -> usize {
        self.inner.lock().retained.len()
    }

    /// Append one batch worth of records. All records must share an LSN.
    pub fn append(&self, records: &[WalRecord]) -> StorageResult<()> {
        let Some(first) = records.first() else {
            return Ok(());
        };
        let lsn = first.lsn;

        let mut framed = Vec::with_capacity(records.len());
        for record in records {
            if record.lsn != lsn {
                return Err(StorageError::InvalidArgument(format!(
                    "journal batch mixes {} and {}",
                    lsn, record.lsn
                )));
            }
            let payload = record
                .serialize()
                .map_err(|e| StorageError::Codec(e.to_string()))?;
            let mut frame = Vec::with_capacity(FRAME_HEADER_SIZE + payload.len());
            frame.extend_from_slice(&(payload.len() as u32).to_le_bytes());
            frame.extend_from_slice(&crc32fast::hash(&payload).to_le_bytes());
            frame.extend_from_slice(&payload);
            framed.push(frame);
        }

        let mut inner = self.inner.lock();
        let start_len = inner.len;
        let start_count = inner.retained.len();
        inner.last_append = Some((lsn, start_len, start_count));

        let buffer: Vec<u8> = framed.iter().flatten().copied().collect();
        inner.file.seek(SeekFrom::Start(start_len))?;
        inner.file.write_all(&buffer)?;
        inner.len = start_len + buffer.len() as u64;
        inner
            .retained
            .extend(framed.into_iter().map(|frame| (lsn, frame)));
        Ok(())
    }

    /// Make every appended record durable.
    pub fn sync(&self) -> StorageResult<()> {
        self.inner.lock().file.sync_data()?;
        Ok(())
    }

    /// Undo the most recent append if it belongs to `lsn`.
    ///
    /// Used when a batch fails after its records were appended, so a later
    /// replay can never resurrect a batch whose waiters were told it failed.
    pub fn rollback(&self, lsn: LSN) -> StorageResult<()> {
        let mut inner = self.inner.lock();
        let Some((last_lsn, len, count)) = inner.last_append else {
            return Ok(());
        };
        if last_lsn != lsn {
            return Ok(());
        }
        inner.file.set_len(len)?;
        inner.file.sync_data()?;
        inner.len = len;
        inner.retained.truncate(count);
        inner.last_append = None;
        debug!("rolled back journal records of {}", lsn);
        Ok(())
    }

    /// Drop every record a snapshot at `upto` already covers.
    ///
    /// Returns the number of records removed.
    pub fn checkpoint(&self, upto: LSN) -> StorageResult<usize> {
        let mut inner = self.inner.lock();
        let before = inner.retained.len();
        let keep: Vec<(LSN, Vec<u8>)> = inner
            .retained
            .iter()
            .filter(|(lsn, _)| *lsn > upto)
            .cloned()
            .collect();
        let removed = before - keep.len();
        if removed == 0 {
            return Ok(0);
        }

        if keep.is_empty() {
            inner.file.set_len(0)?;
            inner.file.sync_data()?;
            inner.len = 0;
        } else {
            // Rewrite through a temp file so the newer records are never
            // absent from disk, even for a moment.
            let tmp_path = self.path.with_extension("wal.tmp");
            let buffer: Vec<u8> = keep.iter().flat_map(|(_, f)| f.iter().copied()).collect();
            {
                let mut tmp = OpenOptions::new()
                    .create(true)
                    .write(true)
                    .truncate(true)
                    .open(&tmp_path)?;
                tmp.write_all(&buffer)?;
                tmp.sync_all()?;
            }
            std::fs::rename(&tmp_path, &self.path)?;
            sync_parent_dir(&self.path)?;
            inner.file = OpenOptions::new().read(true).write(true).open(&self.path)?;
            inner.len = buffer.len() as u64;
        }

        // An append newer than the snapshot may still be rolled back; its
        // frames are the tail of `keep`, so re-anchor it in the new file.
        inner.last_append = match inner.last_append {
            Some((lsn, _, count)) if lsn > upto => {
                let appended = before - count;
                let kept_count = keep.len() - appended;
                let tail_len: usize = keep[kept_count..].iter().map(|(_, f)| f.len()).sum();
                Some((lsn, inner.len - tail_len as u64, kept_count))
            }
            _ => None,
        };
        inner.retained = keep;
        debug!("journal checkpoint at {} dropped {} records", upto, removed);
        Ok(removed)
    }

    /// Read all intact records from a journal file.
    pub fn read_records(path: &Path) -> StorageResult<Vec<WalRecord>> {
        let data = match std::fs::read(path) {
            Ok(data) => data,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(Vec::new()),
            Err(e) => return Err(StorageError::Io(e)),
        };
        let (frames, _) = split_frames(&data);
        frames
            .into_iter()
            .map(|(start, end)| {
                WalRecord::deserialize(&data[start + FRAME_HEADER_SIZE..end])
                    .map_err(|e| StorageError::corruption("journal", e.to_string()))
            })
            .collect()
    }
}

/// Split `data` into intact frames. Returns the `(start, end)` of each frame
/// and the length of the intact prefix.
fn split_frames(data: &[u8]) -> (Vec<(usize, usize)>, usize) {
    let mut frames = Vec::new();
    let mut offset = 0;

    while offset + FRAME_HEADER_SIZE <= data.len() {
        let len = u32::from_le_bytes([
            data[offset],
            data[offset + 1],
            data[offset + 2],
            data[offset + 3],
        ]) as usize;
        let crc = u32::from_le_bytes([
            data[offset + 4],
            data[offset + 5],
            data[offset + 6],
            data[offset + 7],
        ]);

        let end = offset + FRAME_HEADER_SIZE + len;
        if len > MAX_RECORD_SIZE || end > data.len() {
            break;
        }
        if crc32fast::hash(&data[offset + FRAME_HEADER_SIZE..end]) != crc {
            break;
        }
        frames.push((offset, end));
        offset = end;
    }

    (frames, offset)
}
