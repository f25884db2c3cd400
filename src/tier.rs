//! Value placement by size.
//!
//! - up to `inline_threshold`: **Inline**, the bytes travel inside the
//!   reference and the caller embeds them in its own block
//! - up to `overflow_threshold`: **Overflow**, a checksummed page chain in
//!   the data file
//! - anything larger: **FileStream**, a blob file next to the data file
//!
//! A [`TierReference`] has a self-describing encoding (marker byte, then the
//! tier's fields) so it can be stored inside any block.

pub mod filestream;
pub mod overflow;

use std::sync::Arc;

use log::debug;

use crate::codec::{ValueReader, ValueWriter};
use crate::config::TierConfig;
use crate::storage::error::{StorageError, StorageResult};
use crate::storage::page::PageId;

pub use filestream::{BlobOwner, BlobReferences, FilePointer, FileStreamManager, SweepReport};
pub use overflow::OverflowManager;

const INLINE_MARKER: u8 = 1;
const OVERFLOW_MARKER: u8 = 2;
const FILESTREAM_MARKER: u8 = 3;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Tier {
    Inline,
    Overflow,
    FileStream,
}

/// Where a stored value lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum TierReference {
    Inline(Vec<u8>),
    Overflow {
        head: PageId,
        len: u64,
        checksum: u32,
    },
    FileStream(FilePointer),
}

impl TierReference {
    pub fn tier(&self) -> Tier {
        match self {
            TierReference::Inline(_) => Tier::Inline,
            TierReference::Overflow { .. } => Tier::Overflow,
            TierReference::FileStream(_) => Tier::FileStream,
        }
    }

    /// Size of the referenced value.
    pub fn len(&self) -> u64 {
        match self {
            TierReference::Inline(data) => data.len() as u64,
            TierReference::Overflow { len, .. } => *len,
            TierReference::FileStream(pointer) => pointer.size,
        }
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn encode(&self) -> StorageResult<Vec<u8>> {
        let mut writer = ValueWriter::new();
        match self {
            TierReference::Inline(data) => {
                writer.write_u8(INLINE_MARKER);
                writer.write_bytes(data)?;
            }
            TierReference::Overflow {
                head,
                len,
                checksum,
            } => {
                writer.write_u8(OVERFLOW_MARKER);
                writer.write_u64(head.0);
                writer.write_u64(*len);
                writer.write_u32(*checksum);
            }
            TierReference::FileStream(pointer) => {
                writer.write_u8(FILESTREAM_MARKER);
                pointer.encode_into(&mut writer)?;
            }
        }
        Ok(writer.into_inner())
    }

    pub fn decode(data: &[u8]) -> StorageResult<Self> {
        let mut reader = ValueReader::new(data);
        let reference = match reader.read_u8()? {
            INLINE_MARKER => TierReference::Inline(reader.read_bytes()?.to_vec()),
            OVERFLOW_MARKER => TierReference::Overflow {
                head: PageId(reader.read_u64()?),
                len: reader.read_u64()?,
                checksum: reader.read_u32()?,
            },
            FILESTREAM_MARKER => TierReference::FileStream(FilePointer::decode_from(&mut reader)?),
            other => {
                return Err(StorageError::Codec(format!(
                    "unknown tier marker {other}"
                )))
            }
        };
        if !reader.is_empty() {
            return Err(StorageError::Codec(format!(
                "{} trailing bytes after tier reference",
                reader.remaining()
            )));
        }
        Ok(reference)
    }
}

pub struct TierStrategy {
    config: TierConfig,
    overflow: OverflowManager,
    filestream: Arc<FileStreamManager>,
}

impl TierStrategy {
    pub fn new(
        config: TierConfig,
        overflow: OverflowManager,
        filestream: Arc<FileStreamManager>,
    ) -> Self {
        Self {
            config,
            overflow,
            filestream,
        }
    }

    pub fn config(&self) -> TierConfig {
        self.config
    }

    pub fn overflow(&self) -> &OverflowManager {
        &self.overflow
    }

    pub fn filestream(&self) -> &Arc<FileStreamManager> {
        &self.filestream
    }

    pub fn classify(&self, len: usize) -> Tier {
        if len <= self.config.inline_threshold {
            Tier::Inline
        } else if len <= self.config.overflow_threshold {
            Tier::Overflow
        } else {
            Tier::FileStream
        }
    }

    /// Place `data` in the tier its size calls for. Durable on return.
    pub async fn store(&self, data: &[u8], owner: &BlobOwner) -> StorageResult<TierReference> {
        let tier = self.classify(data.len());
        debug!("storing {} bytes as {:?}", data.len(), tier);
        match tier {
            Tier::Inline => Ok(TierReference::Inline(data.to_vec())),
            Tier::Overflow => {
                let head = self.overflow.write_chain(data).await?;
                Ok(TierReference::Overflow {
                    head,
                    len: data.len() as u64,
                    checksum: crc32fast::hash(data),
                })
            }
            Tier::FileStream => {
                let filestream = self.filestream.clone();
                let data = data.to_vec();
                let owner = owner.clone();
                let pointer = tokio::task::spawn_blocking(move || {
                    filestream.write_blob(&data, owner, None)
                })
                .await??;
                Ok(TierReference::FileStream(pointer))
            }
        }
    }

    pub async fn load(&self, reference: &TierReference) -> StorageResult<Vec<u8>> {
        match reference {
            TierReference::Inline(data) => Ok(data.clone()),
            TierReference::Overflow {
                head,
                len,
                checksum,
            } => {
                let overflow = self.overflow.clone();
                let head = *head;
                let data = tokio::task::spawn_blocking(move || overflow.read_chain(head)).await??;
                let target = format!("overflow value at {head}");
                if data.len() as u64 != *len {
                    return Err(StorageError::corruption(
                        target,
                        format!("chain holds {} bytes, expected {}", data.len(), len),
                    ));
                }
                let actual = crc32fast::hash(&data);
                if actual != *checksum {
                    return Err(StorageError::checksum_mismatch(target, *checksum, actual));
                }
                Ok(data)
            }
            TierReference::FileStream(pointer) => {
                let filestream = self.filestream.clone();
                let pointer = pointer.clone();
                Ok(tokio::task::spawn_blocking(move || filestream.read_blob(&pointer)).await??)
            }
        }
    }

    /// Release the storage behind a reference. Inline values own nothing.
    pub async fn delete(&self, reference: &TierReference) -> StorageResult<()> {
        match reference {
            TierReference::Inline(_) => Ok(()),
            TierReference::Overflow { head, .. } => self.overflow.delete_chain(*head).await,
            TierReference::FileStream(pointer) => {
                let filestream = self.filestream.clone();
                let pointer = pointer.clone();
                tokio::task::spawn_blocking(move || filestream.delete_blob(&pointer)).await??;
                Ok(())
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{Config, FileStreamConfig};
    use crate::storage::BlockStore;
    use anyhow::Result;
    use tempfile::{tempdir, TempDir};

    async fn strategy() -> Result<(TierStrategy, Arc<BlockStore>, TempDir)> {
        let dir = tempdir()?;
        let store =
            Arc::new(BlockStore::create(&dir.path().join("t.db"), Config::default()).await?);
        let filestream = Arc::new(FileStreamManager::new(
            dir.path().join("blobs"),
            FileStreamConfig::default(),
        )?);
        let tiers = TierStrategy::new(
            TierConfig::default(),
            OverflowManager::new(store.clone()),
            filestream,
        );
        Ok((tiers, store, dir))
    }

    #[tokio::test]
    async fn test_classify_boundaries() -> Result<()> {
        let (tiers, store, _dir) = strategy().await?;
        assert_eq!(tiers.classify(0), Tier::Inline);
        assert_eq!(tiers.classify(4096), Tier::Inline);
        assert_eq!(tiers.classify(4097), Tier::Overflow);
        assert_eq!(tiers.classify(256 * 1024), Tier::Overflow);
        assert_eq!(tiers.classify(256 * 1024 + 1), Tier::FileStream);
        store.close().await?;
        Ok(())
    }

    #[tokio::test]
    async fn test_round_trip_across_tiers() -> Result<()> {
        let (tiers, store, _dir) = strategy().await?;
        let owner = BlobOwner::new("t", "c", "1");

        for len in [0usize, 1, 4096, 4097, 50_000, 256 * 1024, 256 * 1024 + 1, 512 * 1024] {
            let data: Vec<u8> = (0..len).map(|i| (i * 7 % 256) as u8).collect();
            let reference = tiers.store(&data, &owner).await?;
            assert_eq!(reference.tier(), tiers.classify(len));
            assert_eq!(reference.len(), len as u64);

            let decoded = TierReference::decode(&reference.encode()?)?;
            assert_eq!(decoded, reference);
            assert_eq!(tiers.load(&decoded).await?, data);

            tiers.delete(&reference).await?;
        }
        store.close().await?;
        Ok(())
    }

    #[test]
    fn test_decode_rejects_garbage() {
        assert!(TierReference::decode(&[]).is_err());
        assert!(TierReference::decode(&[9]).is_err());
        // Inline marker with a negative length.
        assert!(TierReference::decode(&[1, 0xFF, 0xFF, 0xFF, 0xFF]).is_err());
        // Overflow reference cut short.
        assert!(TierReference::decode(&[2, 1, 0, 0]).is_err());
    }
}
