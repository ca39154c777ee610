//! Manifest persistence over the vault.
//!
//! One JSON file per manifest, written with the temp-then-rename pattern
//! so an interrupted write can never leave a half-written manifest.
//! Corrupt files are backed up to a `.corrupt.<timestamp>` sibling before
//! being replaced; nothing is silently discarded. Loads always hit the
//! vault — the engine never trusts a cached manifest for a mutation.

use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::migration;
use super::models::{CentralManifest, NoteEntry, NoteManifest};
use crate::concurrency::LockManager;
use crate::error::{HistoryError, Result};
use crate::vault::{write_atomic, VaultError, VaultFs};

/// Lock key serializing central-manifest read-modify-write cycles
const CENTRAL_LOCK_KEY: &str = "manifest:central";

pub struct ManifestStore {
    fs: Arc<dyn VaultFs>,
    root: PathBuf,
    locks: Arc<LockManager>,
}

impl ManifestStore {
    pub fn new(fs: Arc<dyn VaultFs>, root: PathBuf, locks: Arc<LockManager>) -> Self {
        Self { fs, root, locks }
    }

    pub fn central_path(&self) -> PathBuf {
        self.root.join("central.json")
    }

    pub fn note_dir(&self, note_id: Uuid) -> PathBuf {
        self.root.join("notes").join(note_id.to_string())
    }

    pub fn note_manifest_path(&self, note_id: Uuid) -> PathBuf {
        self.note_dir(note_id).join("manifest.json")
    }

    // ===== Central manifest =====

    pub async fn load_central(&self) -> Result<CentralManifest> {
        let path = self.central_path();
        if !self.fs.exists(&path).await? {
            return Ok(CentralManifest::default());
        }
        let raw = self.fs.read_to_string(&path).await?;
        match serde_json::from_str(&raw) {
            Ok(manifest) => Ok(manifest),
            Err(e) => {
                log::error!("Manifest store: central manifest corrupt ({}), backing up", e);
                self.backup_corrupt(&path).await?;
                let fallback = CentralManifest::default();
                self.save_central(&fallback).await?;
                Ok(fallback)
            }
        }
    }

    pub async fn save_central(&self, manifest: &CentralManifest) -> Result<()> {
        let bytes = serde_json::to_vec_pretty(manifest)?;
        write_atomic(self.fs.as_ref(), &self.central_path(), &bytes).await?;
        Ok(())
    }

    /// Register or refresh a note's central entry.
    ///
    /// Fails with `PathConflict` when a different note already claims the
    /// path, leaving the central manifest untouched.
    pub async fn upsert_note_entry(&self, note_id: Uuid, note_path: &str) -> Result<()> {
        self.locks
            .run_serialized(CENTRAL_LOCK_KEY, async {
                let mut central = self.load_central().await?;

                if let Some(existing) = central.note_at_path(note_path) {
                    if existing != note_id {
                        return Err(HistoryError::PathConflict {
                            path: note_path.to_string(),
                            existing,
                        });
                    }
                }

                let now = Utc::now();
                let manifest_path = self.note_manifest_path(note_id).display().to_string();
                central
                    .notes
                    .entry(note_id)
                    .and_modify(|entry| {
                        entry.note_path = note_path.to_string();
                        entry.last_modified = now;
                    })
                    .or_insert(NoteEntry {
                        note_path: note_path.to_string(),
                        manifest_path,
                        created_at: now,
                        last_modified: now,
                    });

                self.save_central(&central).await
            })
            .await
    }

    pub async fn remove_note_entry(&self, note_id: Uuid) -> Result<()> {
        self.locks
            .run_serialized(CENTRAL_LOCK_KEY, async {
                let mut central = self.load_central().await?;
                if central.notes.remove(&note_id).is_some() {
                    self.save_central(&central).await?;
                }
                Ok(())
            })
            .await
    }

    // ===== Note manifests =====

    /// Load a note manifest fresh from the vault. Legacy flat manifests
    /// are migrated in place and persisted back. A corrupt manifest is
    /// backed up and reported as absent — the caller starts a new one.
    pub async fn load_note(&self, note_id: Uuid) -> Result<Option<NoteManifest>> {
        let path = self.note_manifest_path(note_id);
        if !self.fs.exists(&path).await? {
            return Ok(None);
        }
        let raw = self.fs.read_to_string(&path).await?;
        let value: serde_json::Value = match serde_json::from_str(&raw) {
            Ok(value) => value,
            Err(e) => {
                log::error!(
                    "Manifest store: manifest for note {} corrupt ({}), backing up",
                    note_id,
                    e,
                );
                self.backup_corrupt(&path).await?;
                return Ok(None);
            }
        };
        match migration::deserialize_note_manifest(value) {
            Ok((mut manifest, migrated)) => {
                if migrated {
                    self.save_note(&mut manifest).await?;
                }
                Ok(Some(manifest))
            }
            Err(e) => {
                log::error!(
                    "Manifest store: manifest for note {} has unusable shape ({}), backing up",
                    note_id,
                    e,
                );
                self.backup_corrupt(&path).await?;
                Ok(None)
            }
        }
    }

    /// Persist a note manifest. `total_versions` is recomputed on every
    /// branch first — the counter is derived state, never trusted.
    pub async fn save_note(&self, manifest: &mut NoteManifest) -> Result<()> {
        manifest.recount();
        let bytes = serde_json::to_vec_pretty(manifest)?;
        write_atomic(self.fs.as_ref(), &self.note_manifest_path(manifest.note_id), &bytes)
            .await?;
        Ok(())
    }

    /// Remove a note's manifest file (the caller deals with content and
    /// the central entry).
    pub async fn remove_note_manifest(&self, note_id: Uuid) -> Result<()> {
        let path = self.note_manifest_path(note_id);
        match self.fs.remove(&path).await {
            Ok(()) | Err(VaultError::NotFound(_)) => Ok(()),
            Err(e) => Err(e.into()),
        }
    }

    async fn backup_corrupt(&self, path: &std::path::Path) -> Result<()> {
        let backup = PathBuf::from(format!(
            "{}.corrupt.{}",
            path.display(),
            Utc::now().format("%Y%m%d%H%M%S"),
        ));
        self.fs.rename(path, &backup).await?;
        log::warn!("Manifest store: corrupt file preserved at {:?}", backup);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::vault::DiskVault;

    fn store(dir: &tempfile::TempDir) -> ManifestStore {
        let fs: Arc<dyn VaultFs> = Arc::new(DiskVault::new(dir.path().to_path_buf()));
        ManifestStore::new(fs, PathBuf::from("db"), Arc::new(LockManager::new()))
    }

    #[tokio::test]
    async fn test_missing_central_is_default() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let central = store.load_central().await.unwrap();
        assert!(central.notes.is_empty());
    }

    #[tokio::test]
    async fn test_path_uniqueness_is_enforced() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let (a, b) = (Uuid::new_v4(), Uuid::new_v4());

        store.upsert_note_entry(a, "notes/x.md").await.unwrap();
        match store.upsert_note_entry(b, "notes/x.md").await {
            Err(HistoryError::PathConflict { existing, .. }) => assert_eq!(existing, a),
            other => panic!("expected PathConflict, got {:?}", other),
        }

        // Central manifest unchanged by the failed write
        let central = store.load_central().await.unwrap();
        assert_eq!(central.notes.len(), 1);
        assert_eq!(central.note_at_path("notes/x.md"), Some(a));

        // Re-registering the same note at the same path is fine
        store.upsert_note_entry(a, "notes/x.md").await.unwrap();
    }

    #[tokio::test]
    async fn test_note_manifest_roundtrip() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let note_id = Uuid::new_v4();

        let mut manifest = NoteManifest::new(note_id, "notes/a.md".into());
        store.save_note(&mut manifest).await.unwrap();

        let loaded = store.load_note(note_id).await.unwrap().unwrap();
        assert_eq!(loaded.note_id, note_id);
        assert_eq!(loaded.current_branch, "main");
    }

    #[tokio::test]
    async fn test_corrupt_note_manifest_is_backed_up() {
        let dir = tempfile::tempdir().unwrap();
        let fs: Arc<dyn VaultFs> = Arc::new(DiskVault::new(dir.path().to_path_buf()));
        let store = ManifestStore::new(
            Arc::clone(&fs),
            PathBuf::from("db"),
            Arc::new(LockManager::new()),
        );
        let note_id = Uuid::new_v4();

        let path = store.note_manifest_path(note_id);
        fs.write(&path, b"{ not json").await.unwrap();

        assert!(store.load_note(note_id).await.unwrap().is_none());
        assert!(!fs.exists(&path).await.unwrap());

        // The corrupt bytes survive under a sibling backup
        let listing = fs.list(path.parent().unwrap()).await.unwrap();
        assert!(listing
            .files
            .iter()
            .any(|f| f.to_string_lossy().contains(".corrupt.")));
    }

    #[tokio::test]
    async fn test_total_versions_recomputed_on_save() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        let note_id = Uuid::new_v4();

        let mut manifest = NoteManifest::new(note_id, "notes/a.md".into());
        let branch = manifest.ensure_branch("main");
        branch.versions.insert(
            Uuid::new_v4(),
            crate::manifest::VersionMetadata {
                version_number: 1,
                timestamp: Utc::now(),
                name: None,
                description: None,
                size: 1,
                compressed_size: None,
                uncompressed_size: None,
                content_hash: None,
                word_count: 1,
                char_count: 1,
                line_count: 1,
            },
        );
        branch.total_versions = 99;

        store.save_note(&mut manifest).await.unwrap();
        let loaded = store.load_note(note_id).await.unwrap().unwrap();
        assert_eq!(loaded.branch("main").unwrap().total_versions, 1);
    }

    #[tokio::test]
    async fn test_remove_note_manifest_is_idempotent() {
        let dir = tempfile::tempdir().unwrap();
        let store = store(&dir);
        store.remove_note_manifest(Uuid::new_v4()).await.unwrap();
    }
}
