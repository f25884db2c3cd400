//! External blob files.
//!
//! Values above the overflow threshold live in their own files under the
//! blob root, bucketed by the first two byte pairs of their id:
//!
//! ```text
//! <root>/tmp/<id>.tmp          in-flight writes
//! <root>/aa/bb/<id>.blob       contents
//! <root>/aa/bb/<id>.meta       bincode-encoded FilePointer
//! ```
//!
//! A blob becomes visible only by an atomic rename of a fully synced temp
//! file, so readers never see a partial write. Blobs nobody references any
//! more are removed by [`FileStreamManager::sweep_orphans`], which never
//! touches anything younger than the retention window.

use std::collections::HashSet;
use std::fs::{self, File};
use std::io::{self, Write};
use std::path::{Path, PathBuf};
use std::time::{Duration, SystemTime, UNIX_EPOCH};

use log::{debug, info, warn};
use serde::{Deserialize, Serialize};

use crate::codec::{ValueReader, ValueWriter};
use crate::config::{FileStreamConfig, MissingBlobPolicy};
use crate::storage::disk::sync_parent_dir;
use crate::storage::error::{StorageError, StorageResult};

const TMP_DIR: &str = "tmp";
const BLOB_EXT: &str = "blob";
const META_EXT: &str = "meta";

/// Row that owns a blob.
#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct BlobOwner {
    pub table: String,
    pub column: String,
    pub row_key: String,
}

impl BlobOwner {
    pub fn new(
        table: impl Into<String>,
        column: impl Into<String>,
        row_key: impl Into<String>,
    ) -> Self {
        BlobOwner {
            table: table.into(),
            column: column.into(),
            row_key: row_key.into(),
        }
    }
}

/// Reference to an external blob file.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct FilePointer {
    /// 32 lowercase hex characters.
    pub id: String,
    /// Path below the blob root, `aa/bb/<id>.blob`.
    pub relative_path: String,
    pub size: u64,
    pub checksum: u32,
    /// Unix milliseconds.
    pub created_at: u64,
    pub owner: BlobOwner,
    pub content_type: Option<String>,
}

impl FilePointer {
    pub fn encode_into(&self, writer: &mut ValueWriter) -> StorageResult<()> {
        writer.write_id(&parse_id(&self.id)?);
        writer.write_u64(self.size);
        writer.write_u32(self.checksum);
        writer.write_u64(self.created_at);
        writer.write_str(&self.owner.table)?;
        writer.write_str(&self.owner.column)?;
        writer.write_str(&self.owner.row_key)?;
        match &self.content_type {
            Some(content_type) => {
                writer.write_bool(true);
                writer.write_str(content_type)?;
            }
            None => writer.write_bool(false),
        }
        Ok(())
    }

    pub fn decode_from(reader: &mut ValueReader<'_>) -> StorageResult<Self> {
        let id = format!("{:032x}", u128::from_be_bytes(reader.read_id()?));
        let size = reader.read_u64()?;
        let checksum = reader.read_u32()?;
        let created_at = reader.read_u64()?;
        let owner = BlobOwner {
            table: reader.read_string()?,
            column: reader.read_string()?,
            row_key: reader.read_string()?,
        };
        let content_type = if reader.read_bool()? {
            Some(reader.read_string()?)
        } else {
            None
        };
        Ok(FilePointer {
            relative_path: relative_path(&id),
            id,
            size,
            checksum,
            created_at,
            owner,
            content_type,
        })
    }

    /// How long ago the blob was written, as of `now`.
    pub fn age(&self, now: SystemTime) -> Duration {
        let created = UNIX_EPOCH + Duration::from_millis(self.created_at);
        now.duration_since(created).unwrap_or(Duration::ZERO)
    }
}

/// Answers whether a blob id is still referenced by stored data.
pub trait BlobReferences {
    fn is_referenced(&self, id: &str) -> bool;
}

impl BlobReferences for HashSet<String> {
    fn is_referenced(&self, id: &str) -> bool {
        self.contains(id)
    }
}

/// Adapts a predicate into [`BlobReferences`].
pub struct ReferencedBy<F>(pub F);

impl<F: Fn(&str) -> bool> BlobReferences for ReferencedBy<F> {
    fn is_referenced(&self, id: &str) -> bool {
        (self.0)(id)
    }
}

/// Outcome of one orphan sweep.
#[derive(Debug, Default, Clone, PartialEq, Eq)]
pub struct SweepReport {
    pub scanned: usize,
    pub referenced: usize,
    /// Unreferenced but inside the retention window.
    pub retained: usize,
    pub removed: Vec<String>,
    pub bytes_reclaimed: u64,
    pub temp_files_removed: usize,
}

#[derive(Debug, Clone)]
pub struct FileStreamManager {
    root: PathBuf,
    config: FileStreamConfig,
}

impl FileStreamManager {
    pub fn new(root: impl Into<PathBuf>, config: FileStreamConfig) -> StorageResult<Self> {
        let root = root.into();
        fs::create_dir_all(root.join(TMP_DIR))?;
        Ok(Self { root, config })
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    pub fn write_blob(
        &self,
        data: &[u8],
        owner: BlobOwner,
        content_type: Option<&str>,
    ) -> StorageResult<FilePointer> {
        let id = format!("{:032x}", rand::random::<u128>());
        let tmp_path = self.root.join(TMP_DIR).join(format!("{id}.tmp"));

        let written = write_synced(&tmp_path, data);
        let checksum = match written.and_then(|_| checksum_file(&tmp_path)) {
            Ok(checksum) => checksum,
            Err(e) => {
                let _ = fs::remove_file(&tmp_path);
                return Err(e);
            }
        };
        let expected = crc32fast::hash(data);
        if checksum != expected {
            let _ = fs::remove_file(&tmp_path);
            return Err(StorageError::checksum_mismatch(
                format!("blob {id} temp file"),
                expected,
                checksum,
            ));
        }

        let pointer = FilePointer {
            relative_path: relative_path(&id),
            id,
            size: data.len() as u64,
            checksum,
            created_at: unix_millis(SystemTime::now()),
            owner,
            content_type: content_type.map(str::to_string),
        };

        let final_path = self.root.join(&pointer.relative_path);
        if let Some(parent) = final_path.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&tmp_path, &final_path)?;
        sync_parent_dir(&final_path)?;
        self.write_sidecar(&pointer)?;

        debug!("wrote blob {} ({} bytes)", pointer.id, pointer.size);
        Ok(pointer)
    }

    pub fn read_blob(&self, pointer: &FilePointer) -> StorageResult<Vec<u8>> {
        let target = format!("blob {}", pointer.id);
        if pointer.relative_path != relative_path(&pointer.id) {
            return Err(StorageError::corruption(
                target,
                format!("unexpected path '{}'", pointer.relative_path),
            ));
        }

        let data = match fs::read(self.root.join(&pointer.relative_path)) {
            Ok(data) => data,
            Err(e) if e.kind() == io::ErrorKind::NotFound => {
                return Err(match self.config.missing_policy {
                    MissingBlobPolicy::Fail => StorageError::corruption(target, "file is missing"),
                    MissingBlobPolicy::AlertOnly => {
                        warn!(
                            "blob {} owned by {}.{}[{}] is missing",
                            pointer.id,
                            pointer.owner.table,
                            pointer.owner.column,
                            pointer.owner.row_key
                        );
                        StorageError::NotFound(target)
                    }
                });
            }
            Err(e) => return Err(e.into()),
        };

        if data.len() as u64 != pointer.size {
            return Err(StorageError::corruption(
                target,
                format!("size {} but expected {}", data.len(), pointer.size),
            ));
        }
        let actual = crc32fast::hash(&data);
        if actual != pointer.checksum {
            return Err(StorageError::checksum_mismatch(target, pointer.checksum, actual));
        }
        Ok(data)
    }

    /// Remove a blob and its sidecar. Returns false if it was already gone.
    pub fn delete_blob(&self, pointer: &FilePointer) -> StorageResult<bool> {
        let blob_path = self.root.join(relative_path(&pointer.id));
        let removed = remove_if_exists(&blob_path)?;
        remove_if_exists(&blob_path.with_extension(META_EXT))?;
        Ok(removed)
    }

    /// Every blob with a readable sidecar.
    pub fn list_blobs(&self) -> StorageResult<Vec<FilePointer>> {
        let mut pointers = Vec::new();
        for path in self.bucket_files()? {
            if path.extension().and_then(|e| e.to_str()) != Some(META_EXT) {
                continue;
            }
            match read_sidecar(&path) {
                Ok(pointer) => pointers.push(pointer),
                Err(e) => warn!("skipping unreadable sidecar {}: {}", path.display(), e),
            }
        }
        pointers.sort_by(|a, b| a.id.cmp(&b.id));
        Ok(pointers)
    }

    /// Remove unreferenced blobs older than the retention window, and stale
    /// temp files.
    pub fn sweep_orphans(
        &self,
        refs: &dyn BlobReferences,
        now: SystemTime,
    ) -> StorageResult<SweepReport> {
        let retention = self.config.retention;
        let mut report = SweepReport::default();

        for path in self.bucket_files()? {
            if path.extension().and_then(|e| e.to_str()) != Some(BLOB_EXT) {
                continue;
            }
            let Some(id) = path.file_stem().and_then(|s| s.to_str()).map(str::to_string) else {
                continue;
            };
            report.scanned += 1;

            if refs.is_referenced(&id) {
                report.referenced += 1;
                continue;
            }

            let sidecar = path.with_extension(META_EXT);
            let age = match read_sidecar(&sidecar) {
                Ok(pointer) => pointer.age(now),
                // No usable sidecar: fall back to the file's own timestamp.
                Err(_) => file_age(&path, now)?,
            };
            if age < retention {
                report.retained += 1;
                continue;
            }

            let size = fs::metadata(&path).map(|m| m.len()).unwrap_or(0);
            if remove_if_exists(&path)? {
                report.bytes_reclaimed += size;
            }
            remove_if_exists(&sidecar)?;
            report.removed.push(id);
        }

        // Sidecars whose blob is gone.
        for path in self.bucket_files()? {
            if path.extension().and_then(|e| e.to_str()) == Some(META_EXT)
                && !path.with_extension(BLOB_EXT).exists()
                && file_age(&path, now)? >= retention
            {
                remove_if_exists(&path)?;
            }
        }

        for entry in fs::read_dir(self.root.join(TMP_DIR))? {
            let path = entry?.path();
            if path.is_file() && file_age(&path, now)? >= retention && remove_if_exists(&path)? {
                report.temp_files_removed += 1;
            }
        }

        if !report.removed.is_empty() || report.temp_files_removed > 0 {
            info!(
                "blob sweep removed {} orphans ({} bytes) and {} temp files",
                report.removed.len(),
                report.bytes_reclaimed,
                report.temp_files_removed
            );
        }
        Ok(report)
    }

    fn write_sidecar(&self, pointer: &FilePointer) -> StorageResult<()> {
        let bytes = bincode::serialize(pointer).map_err(|e| StorageError::Codec(e.to_string()))?;
        let tmp_path = self
            .root
            .join(TMP_DIR)
            .join(format!("{}.{META_EXT}.tmp", pointer.id));
        write_synced(&tmp_path, &bytes)?;
        let final_path = self.root.join(&pointer.relative_path).with_extension(META_EXT);
        fs::rename(&tmp_path, &final_path)?;
        sync_parent_dir(&final_path)?;
        Ok(())
    }

    /// Files in the two-level bucket directories.
    fn bucket_files(&self) -> StorageResult<Vec<PathBuf>> {
        let mut files = Vec::new();
        for first in fs::read_dir(&self.root)? {
            let first = first?;
            if !first.file_type()?.is_dir() || first.file_name() == TMP_DIR {
                continue;
            }
            for second in fs::read_dir(first.path())? {
                let second = second?;
                if !second.file_type()?.is_dir() {
                    continue;
                }
                for file in fs::read_dir(second.path())? {
                    let file = file?;
                    if file.file_type()?.is_file() {
                        files.push(file.path());
                    }
                }
            }
        }
        Ok(files)
    }
}

pub fn relative_path(id: &str) -> String {
    let first = id.get(0..2).unwrap_or("00");
    let second = id.get(2..4).unwrap_or("00");
    format!("{first}/{second}/{id}.{BLOB_EXT}")
}

fn parse_id(id: &str) -> StorageResult<[u8; 16]> {
    if id.len() != 32 {
        return Err(StorageError::InvalidArgument(format!("malformed blob id '{id}'")));
    }
    u128::from_str_radix(id, 16)
        .map(u128::to_be_bytes)
        .map_err(|_| StorageError::InvalidArgument(format!("malformed blob id '{id}'")))
}

fn write_synced(path: &Path, data: &[u8]) -> StorageResult<()> {
    let mut file = File::create(path)?;
    file.write_all(data)?;
    file.sync_all()?;
    Ok(())
}

fn checksum_file(path: &Path) -> StorageResult<u32> {
    Ok(crc32fast::hash(&fs::read(path)?))
}

fn read_sidecar(path: &Path) -> StorageResult<FilePointer> {
    let bytes = fs::read(path)?;
    bincode::deserialize(&bytes).map_err(|e| StorageError::Codec(e.to_string()))
}

fn remove_if_exists(path: &Path) -> StorageResult<bool> {
    match fs::remove_file(path) {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e.into()),
    }
}

fn file_age(path: &Path, now: SystemTime) -> StorageResult<Duration> {
    let modified = fs::metadata(path)?.modified()?;
    Ok(now.duration_since(modified).unwrap_or(Duration::ZERO))
}

fn unix_millis(time: SystemTime) -> u64 {
    time.duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}

#[cfg(test)]
mod tests {
    use super::*;
    use anyhow::Result;
    use tempfile::tempdir;

    const DAY: Duration = Duration::from_secs(24 * 60 * 60);

    fn manager(root: &Path, policy: MissingBlobPolicy) -> Result<FileStreamManager> {
        Ok(FileStreamManager::new(
            root,
            FileStreamConfig {
                root: None,
                retention: 7 * DAY,
                missing_policy: policy,
            },
        )?)
    }

    fn owner() -> BlobOwner {
        BlobOwner::new("docs", "body", "42")
    }

    #[test]
    fn test_write_read_delete() -> Result<()> {
        let dir = tempdir()?;
        let blobs = manager(dir.path(), MissingBlobPolicy::Fail)?;
        let data = vec![0xABu8; 100_000];

        let pointer = blobs.write_blob(&data, owner(), Some("application/pdf"))?;
        assert_eq!(pointer.id.len(), 32);
        assert_eq!(pointer.size, 100_000);
        assert!(pointer.relative_path.starts_with(&pointer.id[0..2]));
        assert!(dir.path().join(&pointer.relative_path).exists());
        assert_eq!(blobs.read_blob(&pointer)?, data);

        // Nothing left behind in the temp directory.
        assert_eq!(fs::read_dir(dir.path().join(TMP_DIR))?.count(), 0);

        let listed = blobs.list_blobs()?;
        assert_eq!(listed, vec![pointer.clone()]);

        assert!(blobs.delete_blob(&pointer)?);
        assert!(!blobs.delete_blob(&pointer)?);
        assert!(blobs.list_blobs()?.is_empty());
        Ok(())
    }

    #[test]
    fn test_pointer_encoding() -> Result<()> {
        let dir = tempdir()?;
        let blobs = manager(dir.path(), MissingBlobPolicy::Fail)?;
        let pointer = blobs.write_blob(b"abc", owner(), None)?;

        let mut writer = ValueWriter::new();
        pointer.encode_into(&mut writer)?;
        let bytes = writer.into_inner();
        let decoded = FilePointer::decode_from(&mut ValueReader::new(&bytes))?;
        assert_eq!(decoded, pointer);
        Ok(())
    }

    #[test]
    fn test_corrupted_blob_byte() -> Result<()> {
        let dir = tempdir()?;
        let blobs = manager(dir.path(), MissingBlobPolicy::Fail)?;
        let pointer = blobs.write_blob(&vec![5u8; 4096], owner(), None)?;

        let path = dir.path().join(&pointer.relative_path);
        let mut data = fs::read(&path)?;
        data[2048] ^= 0x10;
        fs::write(&path, &data)?;

        assert!(blobs.read_blob(&pointer).unwrap_err().is_corruption());
        Ok(())
    }

    #[test]
    fn test_truncated_blob_is_corruption() -> Result<()> {
        let dir = tempdir()?;
        let blobs = manager(dir.path(), MissingBlobPolicy::Fail)?;
        let pointer = blobs.write_blob(&vec![5u8; 4096], owner(), None)?;
        fs::write(dir.path().join(&pointer.relative_path), [5u8; 10])?;
        assert!(blobs.read_blob(&pointer).unwrap_err().is_corruption());
        Ok(())
    }

    #[test]
    fn test_missing_blob_policy() -> Result<()> {
        let dir = tempdir()?;
        let strict = manager(dir.path(), MissingBlobPolicy::Fail)?;
        let pointer = strict.write_blob(b"gone soon", owner(), None)?;
        fs::remove_file(dir.path().join(&pointer.relative_path))?;

        assert!(strict.read_blob(&pointer).unwrap_err().is_corruption());
        let lenient = manager(dir.path(), MissingBlobPolicy::AlertOnly)?;
        assert!(lenient.read_blob(&pointer).unwrap_err().is_not_found());
        Ok(())
    }

    #[test]
    fn test_sweep_respects_references_and_retention() -> Result<()> {
        let dir = tempdir()?;
        let blobs = manager(dir.path(), MissingBlobPolicy::Fail)?;
        let kept = blobs.write_blob(b"referenced", owner(), None)?;
        let orphan = blobs.write_blob(b"orphan", owner(), None)?;

        let refs: HashSet<String> = [kept.id.clone()].into_iter().collect();

        // Young orphans survive.
        let report = blobs.sweep_orphans(&refs, SystemTime::now())?;
        assert_eq!(report.scanned, 2);
        assert_eq!(report.referenced, 1);
        assert_eq!(report.retained, 1);
        assert!(report.removed.is_empty());
        assert_eq!(blobs.read_blob(&orphan)?, b"orphan");

        // Past the retention window only the orphan goes.
        let later = SystemTime::now() + 8 * DAY;
        let report = blobs.sweep_orphans(&refs, later)?;
        assert_eq!(report.removed, vec![orphan.id.clone()]);
        assert_eq!(report.bytes_reclaimed, 6);
        assert_eq!(blobs.read_blob(&kept)?, b"referenced");
        assert!(blobs.read_blob(&orphan).unwrap_err().is_corruption());
        Ok(())
    }

    #[test]
    fn test_sweep_removes_stale_temp_files() -> Result<()> {
        let dir = tempdir()?;
        let blobs = manager(dir.path(), MissingBlobPolicy::Fail)?;
        fs::write(dir.path().join(TMP_DIR).join("crashed.tmp"), b"partial")?;

        let nothing = ReferencedBy(|_: &str| false);
        let report = blobs.sweep_orphans(&nothing, SystemTime::now())?;
        assert_eq!(report.temp_files_removed, 0);

        let report = blobs.sweep_orphans(&nothing, SystemTime::now() + 8 * DAY)?;
        assert_eq!(report.temp_files_removed, 1);
        Ok(())
    }
}
