//! Write-ahead journal for the block registry.
//!
//! Registry mutations committed by the group-commit writer are appended here
//! and synced together with their data pages, so an acknowledged write
//! survives a crash even when the registry snapshot that includes it was
//! never written. On open, records newer than the snapshot are replayed.

pub mod manager;
pub mod record;

pub use manager::WalManager;
pub use record::{WalRecord, WalRecordPayload, LSN};
