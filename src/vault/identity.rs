//! Document identity resolution.
//!
//! History entries are correlated to documents through an identity marker
//! embedded in the document's YAML frontmatter. A missing file is not
//! enough to call a history orphaned — the document may have been moved
//! outside the normal rename hook, in which case the marker still
//! identifies it at its new path.

use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use async_trait::async_trait;
use uuid::Uuid;

use super::{Result, VaultFs};

/// Frontmatter key carrying the note identity marker
pub const DEFAULT_MARKER_KEY: &str = "mneme-id";

/// Outcome of correlating a history entry with its document
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum IdentityStatus {
    /// Document exists at the recorded path with a matching marker
    Valid,
    /// Document exists elsewhere with the same marker
    Moved(PathBuf),
    /// Document is gone, or the file at the recorded path belongs to
    /// a different identity
    Missing,
}

#[async_trait]
pub trait IdentityResolver: Send + Sync {
    async fn locate(&self, note_id: Uuid, recorded_path: &Path) -> Result<IdentityStatus>;
}

/// Resolver that reads identity markers from YAML frontmatter, sweeping
/// the vault's markdown files when the recorded path no longer matches.
pub struct FrontmatterIdentity {
    fs: Arc<dyn VaultFs>,
    marker_key: String,
    scan_root: PathBuf,
}

impl FrontmatterIdentity {
    pub fn new(fs: Arc<dyn VaultFs>, scan_root: PathBuf) -> Self {
        Self {
            fs,
            marker_key: DEFAULT_MARKER_KEY.to_string(),
            scan_root,
        }
    }

    pub fn with_marker_key(mut self, key: impl Into<String>) -> Self {
        self.marker_key = key.into();
        self
    }

    async fn marker_at(&self, path: &Path) -> Result<Option<String>> {
        if !self.fs.exists(path).await? {
            return Ok(None);
        }
        let content = self.fs.read_to_string(path).await?;
        Ok(parse_marker(&content, &self.marker_key))
    }

    /// Walk the scan root looking for a markdown file carrying the marker.
    async fn sweep_for_marker(&self, marker: &str) -> Result<Option<PathBuf>> {
        let mut stack = vec![self.scan_root.clone()];
        while let Some(dir) = stack.pop() {
            let listing = self.fs.list(&dir).await?;
            for file in listing.files {
                if file.extension().and_then(|e| e.to_str()) != Some("md") {
                    continue;
                }
                if let Ok(content) = self.fs.read_to_string(&file).await {
                    if parse_marker(&content, &self.marker_key).as_deref() == Some(marker) {
                        return Ok(Some(file));
                    }
                }
            }
            stack.extend(listing.folders);
        }
        Ok(None)
    }
}

#[async_trait]
impl IdentityResolver for FrontmatterIdentity {
    async fn locate(&self, note_id: Uuid, recorded_path: &Path) -> Result<IdentityStatus> {
        let marker = note_id.to_string();

        match self.marker_at(recorded_path).await? {
            Some(found) if found == marker => return Ok(IdentityStatus::Valid),
            // A different identity now owns the recorded path; the
            // document this history belonged to may still live elsewhere.
            _ => {}
        }

        match self.sweep_for_marker(&marker).await? {
            Some(path) if path != recorded_path => Ok(IdentityStatus::Moved(path)),
            Some(_) => Ok(IdentityStatus::Valid),
            None => Ok(IdentityStatus::Missing),
        }
    }
}

/// Parse the marker value out of YAML frontmatter. Returns None when the
/// content has no frontmatter fence or the key is absent.
pub fn parse_marker(content: &str, key: &str) -> Option<String> {
    let rest = content.strip_prefix("---")?;
    let end = rest.find("\n---")?;
    let yaml = &rest[..end];
    let map: HashMap<String, serde_yaml::Value> = serde_yaml::from_str(yaml).ok()?;
    match map.get(key)? {
        serde_yaml::Value::String(s) => Some(s.clone()),
        other => serde_yaml::to_string(other)
            .ok()
            .map(|s| s.trim().to_string()),
    }
}
