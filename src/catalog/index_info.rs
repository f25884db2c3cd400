use crate::codec::{ValueReader, ValueWriter};
use crate::storage::error::{StorageError, StorageResult};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u8)]
pub enum IndexKind {
    #[default]
    BTree = 0,
    Hash = 1,
}

impl IndexKind {
    pub fn from_u8(value: u8) -> StorageResult<Self> {
        match value {
            0 => Ok(IndexKind::BTree),
            1 => Ok(IndexKind::Hash),
            other => Err(StorageError::Codec(format!("unknown index kind {other}"))),
        }
    }
}

/// Information about an index
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct IndexInfo {
    /// Name of the index
    pub index_name: String,
    /// Columns that make up the index key, in key order
    pub key_columns: Vec<String>,
    /// Whether this is a unique index
    pub is_unique: bool,
    pub kind: IndexKind,
}

impl IndexInfo {
    pub fn new(index_name: impl Into<String>, key_columns: &[&str]) -> Self {
        IndexInfo {
            index_name: index_name.into(),
            key_columns: key_columns.iter().map(|c| c.to_string()).collect(),
            is_unique: false,
            kind: IndexKind::BTree,
        }
    }

    pub fn unique(mut self) -> Self {
        self.is_unique = true;
        self
    }

    pub fn with_kind(mut self, kind: IndexKind) -> Self {
        self.kind = kind;
        self
    }

    pub fn serialize(&self, writer: &mut ValueWriter) -> StorageResult<()> {
        writer.write_str(&self.index_name)?;
        writer.write_u32(self.key_columns.len() as u32);
        for column in &self.key_columns {
            writer.write_str(column)?;
        }
        writer.write_bool(self.is_unique);
        writer.write_u8(self.kind as u8);
        Ok(())
    }

    pub fn deserialize(reader: &mut ValueReader<'_>) -> StorageResult<Self> {
        let index_name = reader.read_string()?;
        let count = reader.read_u32()? as usize;
        let mut key_columns = Vec::with_capacity(count.min(reader.remaining()));
        for _ in 0..count {
            key_columns.push(reader.read_string()?);
        }
        Ok(IndexInfo {
            index_name,
            key_columns,
            is_unique: reader.read_bool()?,
            kind: IndexKind::from_u8(reader.read_u8()?)?,
        })
    }
}
