//! Journal record types.
//!
//! Each group-commit batch appends one record per registry mutation, all
//! tagged with the batch's log sequence number. Records newer than the last
//! registry snapshot are replayed on open.

use serde::{Deserialize, Serialize};
use std::fmt;

use crate::storage::registry::Location;

/// Log Sequence Number - one per committed batch.
/// LSNs are monotonically increasing and order batches.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct LSN(pub u64);

impl LSN {
    /// Create a new LSN with value 0.
    pub fn new() -> Self {
        LSN(0)
    }

    /// Get the next LSN.
    pub fn next(&self) -> Self {
        LSN(self.0 + 1)
    }

    /// Check if this is an invalid LSN (0).
    pub fn is_invalid(&self) -> bool {
        self.0 == 0
    }
}

impl Default for LSN {
    fn default() -> Self {
        Self::new()
    }
}

impl fmt::Display for LSN {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "LSN({})", self.0)
    }
}

/// Journal record payload variants.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub enum WalRecordPayload {
    /// A block now lives at `location`.
    Put { name: String, location: Location },
    /// A block was deleted.
    Remove { name: String },
}

/// Complete journal record.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WalRecord {
    /// Batch that produced this record.
    pub lsn: LSN,
    pub payload: WalRecordPayload,
}

impl WalRecord {
    pub fn put(lsn: LSN, name: impl Into<String>, location: Location) -> Self {
        WalRecord {
            lsn,
            payload: WalRecordPayload::Put {
                name: name.into(),
                location,
            },
        }
    }

    pub fn remove(lsn: LSN, name: impl Into<String>) -> Self {
        WalRecord {
            lsn,
            payload: WalRecordPayload::Remove { name: name.into() },
        }
    }

    pub fn name(&self) -> &str {
        match &self.payload {
            WalRecordPayload::Put { name, .. } | WalRecordPayload::Remove { name } => name,
        }
    }

    pub fn serialize(&self) -> Result<Vec<u8>, bincode::Error> {
        bincode::serialize(self)
    }

    pub fn deserialize(data: &[u8]) -> Result<Self, bincode::Error> {
        bincode::deserialize(data)
    }
}
