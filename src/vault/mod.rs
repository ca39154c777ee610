//! Host byte-storage boundary.
//!
//! The engine never touches the filesystem directly; everything goes
//! through the `VaultFs` trait the host implements. `DiskVault` is the
//! plain-filesystem implementation used by default and in tests.

mod disk;
pub mod identity;

pub use disk::DiskVault;

use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use thiserror::Error;

#[derive(Error, Debug)]
pub enum VaultError {
    #[error("IO error: {0}")]
    Io(#[from] std::io::Error),

    #[error("Not found: {0}")]
    NotFound(String),

    #[error("Not valid UTF-8: {0}")]
    NotUtf8(String),
}

pub type Result<T> = std::result::Result<T, VaultError>;

/// Listing of one directory level
#[derive(Debug, Default, Clone)]
pub struct FolderListing {
    pub files: Vec<PathBuf>,
    pub folders: Vec<PathBuf>,
}

/// File metadata returned by `stat`
#[derive(Debug, Clone, Copy)]
pub struct FileInfo {
    pub mtime: DateTime<Utc>,
    pub size: u64,
}

/// Byte storage API implemented by the host. Paths are relative to the
/// vault root. `rename` must be atomic on the same filesystem; the
/// crash-safe manifest writes depend on it.
#[async_trait]
pub trait VaultFs: Send + Sync {
    async fn exists(&self, path: &Path) -> Result<bool>;
    async fn read(&self, path: &Path) -> Result<Vec<u8>>;
    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<()>;
    async fn remove(&self, path: &Path) -> Result<()>;
    async fn list(&self, dir: &Path) -> Result<FolderListing>;
    async fn mkdir(&self, path: &Path) -> Result<()>;
    async fn rmdir(&self, path: &Path, recursive: bool) -> Result<()>;
    async fn stat(&self, path: &Path) -> Result<FileInfo>;
    async fn rename(&self, from: &Path, to: &Path) -> Result<()>;

    async fn read_to_string(&self, path: &Path) -> Result<String> {
        let bytes = self.read(path).await?;
        String::from_utf8(bytes).map_err(|_| VaultError::NotUtf8(path.display().to_string()))
    }
}

/// Crash-safe write: write to a temp sibling, then rename over the target.
pub async fn write_atomic(fs: &dyn VaultFs, path: &Path, bytes: &[u8]) -> Result<()> {
    let tmp = tmp_sibling(path);
    fs.write(&tmp, bytes).await?;
    fs.rename(&tmp, path).await
}

fn tmp_sibling(path: &Path) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().to_string())
        .unwrap_or_else(|| "file".to_string());
    path.with_file_name(format!("{}.tmp", name))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_write_atomic_replaces_target() {
        let dir = tempfile::tempdir().unwrap();
        let vault = DiskVault::new(dir.path().to_path_buf());
        let path = Path::new("notes/a.json");

        write_atomic(&vault, path, b"first").await.unwrap();
        write_atomic(&vault, path, b"second").await.unwrap();

        assert_eq!(vault.read(path).await.unwrap(), b"second");
        // No temp file left behind
        let listing = vault.list(Path::new("notes")).await.unwrap();
        assert_eq!(listing.files.len(), 1);
    }
}
