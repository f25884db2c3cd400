//! Column information and metadata structures.

use crate::codec::{TypeMarker, Value, ValueReader, ValueWriter};
use crate::storage::error::{StorageError, StorageResult};

/// Column type tags, stored as the codec's type marker.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum DataType {
    Int32,
    Int64,
    Double,
    Boolean,
    DateTime,
    Varchar,
    Bytes,
    Decimal,
}

impl DataType {
    pub fn marker(self) -> TypeMarker {
        match self {
            DataType::Int32 => TypeMarker::Int32,
            DataType::Int64 => TypeMarker::Int64,
            DataType::Double => TypeMarker::Double,
            DataType::Boolean => TypeMarker::Boolean,
            DataType::DateTime => TypeMarker::DateTime,
            DataType::Varchar => TypeMarker::String,
            DataType::Bytes => TypeMarker::Bytes,
            DataType::Decimal => TypeMarker::Decimal,
        }
    }

    pub fn from_marker(marker: TypeMarker) -> StorageResult<Self> {
        Ok(match marker {
            TypeMarker::Int32 => DataType::Int32,
            TypeMarker::Int64 => DataType::Int64,
            TypeMarker::Double => DataType::Double,
            TypeMarker::Boolean => DataType::Boolean,
            TypeMarker::DateTime => DataType::DateTime,
            TypeMarker::String => DataType::Varchar,
            TypeMarker::Bytes => DataType::Bytes,
            TypeMarker::Decimal => DataType::Decimal,
            TypeMarker::Null => {
                return Err(StorageError::Codec("a column cannot have type null".to_string()))
            }
        })
    }

    pub fn from_u8(value: u8) -> StorageResult<Self> {
        Self::from_marker(TypeMarker::from_u8(value)?)
    }

    /// Whether `value` can be stored in a column of this type.
    pub fn accepts(self, value: &Value) -> bool {
        value.marker() == self.marker()
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct ColumnInfo {
    pub column_name: String,
    pub column_type: DataType,
    pub nullable: bool,
    pub default_value: Option<Value>,
    /// Encoded constraint expression, if any.
    pub constraint: Option<Vec<u8>>,
}

impl ColumnInfo {
    pub fn new(column_name: impl Into<String>, column_type: DataType) -> Self {
        ColumnInfo {
            column_name: column_name.into(),
            column_type,
            nullable: true,
            default_value: None,
            constraint: None,
        }
    }

    pub fn not_null(mut self) -> Self {
        self.nullable = false;
        self
    }

    pub fn with_default(mut self, value: Value) -> Self {
        self.default_value = Some(value);
        self
    }

    pub fn with_constraint(mut self, constraint: Vec<u8>) -> Self {
        self.constraint = Some(constraint);
        self
    }

    /// Check the default value against the column type and nullability.
    pub fn validate_default(&self) -> Result<(), String> {
        match &self.default_value {
            None => Ok(()),
            Some(Value::Null) if self.nullable => Ok(()),
            Some(Value::Null) => Err(format!(
                "column '{}' is NOT NULL but defaults to null",
                self.column_name
            )),
            Some(value) if self.column_type.accepts(value) => Ok(()),
            Some(value) => Err(format!(
                "default of column '{}' is {:?}, expected {:?}",
                self.column_name,
                value.marker(),
                self.column_type
            )),
        }
    }

    pub fn serialize(&self, writer: &mut ValueWriter) -> StorageResult<()> {
        writer.write_str(&self.column_name)?;
        writer.write_u8(self.column_type.marker() as u8);
        writer.write_bool(self.nullable);
        match &self.default_value {
            Some(value) => {
                writer.write_bool(true);
                writer.write_value(value)?;
            }
            None => writer.write_bool(false),
        }
        match &self.constraint {
            Some(bytes) => {
                writer.write_bool(true);
                writer.write_bytes(bytes)
            }
            None => {
                writer.write_bool(false);
                Ok(())
            }
        }
    }

    pub fn deserialize(reader: &mut ValueReader<'_>) -> StorageResult<Self> {
        let column_name = reader.read_string()?;
        let column_type = DataType::from_u8(reader.read_u8()?)?;
        let nullable = reader.read_bool()?;
        let default_value = if reader.read_bool()? {
            Some(reader.read_value()?)
        } else {
            None
        };
        let constraint = if reader.read_bool()? {
            Some(reader.read_bytes()?.to_vec())
        } else {
            None
        };
        Ok(ColumnInfo {
            column_name,
            column_type,
            nullable,
            default_value,
            constraint,
        })
    }
}
