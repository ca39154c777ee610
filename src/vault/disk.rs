//! Plain-filesystem vault implementation.

use std::fs;
use std::path::{Path, PathBuf};

use async_trait::async_trait;
use chrono::{DateTime, Utc};

use super::{FileInfo, FolderListing, Result, VaultError, VaultFs};

/// `std::fs`-backed vault rooted at a directory. All trait paths are
/// resolved relative to the root.
pub struct DiskVault {
    root: PathBuf,
}

impl DiskVault {
    pub fn new(root: PathBuf) -> Self {
        Self { root }
    }

    pub fn root(&self) -> &Path {
        &self.root
    }

    fn resolve(&self, path: &Path) -> PathBuf {
        self.root.join(path)
    }
}

#[async_trait]
impl VaultFs for DiskVault {
    async fn exists(&self, path: &Path) -> Result<bool> {
        Ok(self.resolve(path).exists())
    }

    async fn read(&self, path: &Path) -> Result<Vec<u8>> {
        let full = self.resolve(path);
        if !full.exists() {
            return Err(VaultError::NotFound(path.display().to_string()));
        }
        Ok(fs::read(&full)?)
    }

    async fn write(&self, path: &Path, bytes: &[u8]) -> Result<()> {
        let full = self.resolve(path);
        if let Some(parent) = full.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::write(&full, bytes)?;
        Ok(())
    }

    async fn remove(&self, path: &Path) -> Result<()> {
        let full = self.resolve(path);
        if !full.exists() {
            return Err(VaultError::NotFound(path.display().to_string()));
        }
        fs::remove_file(&full)?;
        Ok(())
    }

    async fn list(&self, dir: &Path) -> Result<FolderListing> {
        let full = self.resolve(dir);
        let mut listing = FolderListing::default();
        if !full.exists() {
            return Ok(listing);
        }
        for entry in fs::read_dir(&full)? {
            let entry = entry?;
            let rel = dir.join(entry.file_name());
            if entry.file_type()?.is_dir() {
                listing.folders.push(rel);
            } else {
                listing.files.push(rel);
            }
        }
        listing.files.sort();
        listing.folders.sort();
        Ok(listing)
    }

    async fn mkdir(&self, path: &Path) -> Result<()> {
        fs::create_dir_all(self.resolve(path))?;
        Ok(())
    }

    async fn rmdir(&self, path: &Path, recursive: bool) -> Result<()> {
        let full = self.resolve(path);
        if !full.exists() {
            return Ok(());
        }
        if recursive {
            fs::remove_dir_all(&full)?;
        } else {
            fs::remove_dir(&full)?;
        }
        Ok(())
    }

    async fn stat(&self, path: &Path) -> Result<FileInfo> {
        let full = self.resolve(path);
        if !full.exists() {
            return Err(VaultError::NotFound(path.display().to_string()));
        }
        let meta = fs::metadata(&full)?;
        let mtime: DateTime<Utc> = meta.modified()?.into();
        Ok(FileInfo {
            mtime,
            size: meta.len(),
        })
    }

    async fn rename(&self, from: &Path, to: &Path) -> Result<()> {
        let src = self.resolve(from);
        let dst = self.resolve(to);
        if let Some(parent) = dst.parent() {
            fs::create_dir_all(parent)?;
        }
        fs::rename(&src, &dst)?;
        Ok(())
    }
}
