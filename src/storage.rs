//! Storage layer: named blocks in a single page-structured data file.
//!
//! Key components:
//!
//! - **PageManager**: the shared file handle, positional page I/O and the
//!   dual-slot file header
//! - **FreeSpaceManager**: free extents of the page region, file growth
//! - **BlockRegistry**: name → location directory, persisted as snapshots
//! - **WalManager**: journal of registry mutations since the last snapshot
//! - **GroupCommitWriter**: batches writes so one sync covers many callers
//! - **BlockStore**: the pieces above wired together with their tasks

pub mod block_store;
pub mod disk;
pub mod error;
pub mod free_space;
pub mod group_commit;
pub mod page;
pub mod registry;
pub mod shutdown;
pub mod wal;

pub use block_store::{BlockStore, StoreStats};
pub use disk::{PageManager, PAGE_SIZE};
pub use error::{StorageError, StorageResult};
pub use group_commit::{CommitHandle, WriteOp};
pub use page::{Extent, PageId};
pub use registry::Location;
pub use shutdown::Shutdown;
