pub mod header;
pub mod page_manager;

pub use header::{FileHeader, SnapshotPointer};
pub use page_manager::PageManager;

/// Fixed page size of the data file.
pub const PAGE_SIZE: usize = 4096;

/// Pages at the start of the file reserved for the header.
pub const HEADER_PAGES: u64 = 1;

/// `<path><suffix>`, for files that live next to the data file.
pub fn sidecar_path(path: &std::path::Path, suffix: &str) -> std::path::PathBuf {
    let mut name = path.as_os_str().to_owned();
    name.push(suffix);
    std::path::PathBuf::from(name)
}

/// Sync the directory containing `path` so a rename into it is durable.
#[cfg(unix)]
pub fn sync_parent_dir(path: &std::path::Path) -> std::io::Result<()> {
    match path.parent() {
        Some(dir) if !dir.as_os_str().is_empty() => std::fs::File::open(dir)?.sync_all(),
        _ => Ok(()),
    }
}

#[cfg(not(unix))]
pub fn sync_parent_dir(_path: &std::path::Path) -> std::io::Result<()> {
    Ok(())
}
