//! Table schema and its block encodings.
//!
//! A table's schema is stored as two blocks, one for the columns and one for
//! the indexes. Both start with a format tag and an entry count.

use std::collections::HashSet;

use crate::catalog::column_info::ColumnInfo;
use crate::catalog::index_info::IndexInfo;
use crate::codec::{ValueReader, ValueWriter};
use crate::storage::error::{StorageError, StorageResult};

const COLUMNS_FORMAT: u32 = 0x434F_4C31; // "COL1"
const INDEXES_FORMAT: u32 = 0x4944_5831; // "IDX1"
const TABLES_FORMAT: u32 = 0x5442_4C31; // "TBL1"

#[derive(Debug, Clone, PartialEq, Default)]
pub struct TableSchema {
    pub table_name: String,
    pub columns: Vec<ColumnInfo>,
    pub indexes: Vec<IndexInfo>,
}

impl TableSchema {
    pub fn column(&self, name: &str) -> Option<&ColumnInfo> {
        self.columns.iter().find(|c| c.column_name == name)
    }

    pub fn is_empty(&self) -> bool {
        self.columns.is_empty() && self.indexes.is_empty()
    }

    /// Reject schemas that could not be loaded back consistently.
    pub fn validate(&self) -> StorageResult<()> {
        let fail = |reason: String| StorageError::SchemaInconsistency {
            table: self.table_name.clone(),
            reason,
        };
        validate_table_name(&self.table_name)?;
        if self.columns.is_empty() {
            return Err(fail("a table needs at least one column".to_string()));
        }

        let mut names = HashSet::new();
        for column in &self.columns {
            if column.column_name.is_empty() {
                return Err(fail("empty column name".to_string()));
            }
            if !names.insert(column.column_name.as_str()) {
                return Err(fail(format!("duplicate column '{}'", column.column_name)));
            }
            column.validate_default().map_err(&fail)?;
        }

        let mut index_names = HashSet::new();
        for index in &self.indexes {
            if !index_names.insert(index.index_name.as_str()) {
                return Err(fail(format!("duplicate index '{}'", index.index_name)));
            }
            if index.key_columns.is_empty() {
                return Err(fail(format!("index '{}' has no key columns", index.index_name)));
            }
            if let Some(missing) = index.key_columns.iter().find(|c| !names.contains(c.as_str())) {
                return Err(fail(format!(
                    "index '{}' references unknown column '{}'",
                    index.index_name, missing
                )));
            }
        }
        Ok(())
    }

    pub fn serialize_columns(&self) -> StorageResult<Vec<u8>> {
        let mut writer = ValueWriter::new();
        writer.write_u32(COLUMNS_FORMAT);
        writer.write_u32(self.columns.len() as u32);
        for column in &self.columns {
            column.serialize(&mut writer)?;
        }
        Ok(writer.into_inner())
    }

    pub fn serialize_indexes(&self) -> StorageResult<Vec<u8>> {
        let mut writer = ValueWriter::new();
        writer.write_u32(INDEXES_FORMAT);
        writer.write_u32(self.indexes.len() as u32);
        for index in &self.indexes {
            index.serialize(&mut writer)?;
        }
        Ok(writer.into_inner())
    }

    pub fn deserialize_columns(data: &[u8]) -> StorageResult<Vec<ColumnInfo>> {
        let mut reader = ValueReader::new(data);
        expect_format(&mut reader, COLUMNS_FORMAT, "column block")?;
        let count = reader.read_u32()? as usize;
        let mut columns = Vec::with_capacity(count.min(reader.remaining()));
        for _ in 0..count {
            columns.push(ColumnInfo::deserialize(&mut reader)?);
        }
        expect_end(&reader, "column block")?;
        Ok(columns)
    }

    pub fn deserialize_indexes(data: &[u8]) -> StorageResult<Vec<IndexInfo>> {
        let mut reader = ValueReader::new(data);
        expect_format(&mut reader, INDEXES_FORMAT, "index block")?;
        let count = reader.read_u32()? as usize;
        let mut indexes = Vec::with_capacity(count.min(reader.remaining()));
        for _ in 0..count {
            indexes.push(IndexInfo::deserialize(&mut reader)?);
        }
        expect_end(&reader, "index block")?;
        Ok(indexes)
    }
}

/// Encode the master list of table names.
pub fn serialize_table_list(names: &[String]) -> StorageResult<Vec<u8>> {
    let mut writer = ValueWriter::new();
    writer.write_u32(TABLES_FORMAT);
    writer.write_u32(names.len() as u32);
    for name in names {
        writer.write_str(name)?;
    }
    Ok(writer.into_inner())
}

pub fn deserialize_table_list(data: &[u8]) -> StorageResult<Vec<String>> {
    let mut reader = ValueReader::new(data);
    expect_format(&mut reader, TABLES_FORMAT, "table list")?;
    let count = reader.read_u32()? as usize;
    let mut names = Vec::with_capacity(count.min(reader.remaining()));
    for _ in 0..count {
        names.push(reader.read_string()?);
    }
    expect_end(&reader, "table list")?;
    Ok(names)
}

pub fn validate_table_name(name: &str) -> StorageResult<()> {
    if name.is_empty() || name.contains('/') {
        return Err(StorageError::InvalidArgument(format!(
            "invalid table name '{name}'"
        )));
    }
    Ok(())
}

fn expect_format(reader: &mut ValueReader<'_>, format: u32, what: &str) -> StorageResult<()> {
    let found = reader.read_u32()?;
    if found != format {
        return Err(StorageError::Codec(format!(
            "{what} has format tag {found:08x}, expected {format:08x}"
        )));
    }
    Ok(())
}

fn expect_end(reader: &ValueReader<'_>, what: &str) -> StorageResult<()> {
    if !reader.is_empty() {
        return Err(StorageError::Codec(format!(
            "{} trailing bytes in {what}",
            reader.remaining()
        )));
    }
    Ok(())
}
