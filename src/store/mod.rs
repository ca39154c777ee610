//! Branch-scoped content store.
//!
//! Each version's content lives as a blob beside a small JSON record
//! describing how it is stored: a full snapshot, or a patch against the
//! previous edit. Chains of patches are cut off with a fresh full
//! snapshot every `DIFF_CHAIN_LIMIT` edits, bounding reconstruction cost.
//! The record file is the commit point — a blob without its record is an
//! orphan, never corrupt state.

pub mod diff;

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::error::{HistoryError, Result};
use crate::store::diff::PatchOp;
use crate::vault::{write_atomic, VaultError, VaultFs};
use crate::worker::WorkerHandle;

/// A full snapshot is taken once a chain reaches this many patches
pub const DIFF_CHAIN_LIMIT: u32 = 20;

#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum StorageType {
    Full,
    Diff,
}

/// Record describing one stored edit.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StoredEdit {
    pub edit_id: Uuid,
    pub note_id: Uuid,
    pub branch: String,
    pub storage_type: StorageType,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub previous_edit_id: Option<Uuid>,
    /// The full snapshot this edit's chain bottoms out at
    #[serde(skip_serializing_if = "Option::is_none")]
    pub base_edit_id: Option<Uuid>,
    pub chain_length: u32,
    pub content_hash: String,
    pub created_at: DateTime<Utc>,
    pub uncompressed_size: u64,
    pub stored_size: u64,
}

/// Filesystem-safe directory component for a branch name.
pub fn branch_component(name: &str) -> String {
    let cleaned: String = name
        .chars()
        .map(|c| {
            if c.is_ascii_alphanumeric() || matches!(c, '-' | '_' | '.') {
                c
            } else {
                '_'
            }
        })
        .collect();
    if cleaned == name {
        cleaned
    } else {
        // Disambiguate names that collapse to the same cleaned form
        let mut hasher = Sha256::new();
        hasher.update(name.as_bytes());
        format!("{}-{}", cleaned, &hex::encode(hasher.finalize())[..8])
    }
}

pub struct ContentStore {
    fs: Arc<dyn VaultFs>,
    root: PathBuf,
    worker: WorkerHandle,
}

impl ContentStore {
    pub fn new(fs: Arc<dyn VaultFs>, root: PathBuf, worker: WorkerHandle) -> Self {
        Self { fs, root, worker }
    }

    pub fn note_dir(&self, note_id: Uuid) -> PathBuf {
        self.root.join("notes").join(note_id.to_string())
    }

    pub fn branch_dir(&self, note_id: Uuid, branch: &str) -> PathBuf {
        self.note_dir(note_id)
            .join("branches")
            .join(branch_component(branch))
    }

    fn edits_dir(&self, note_id: Uuid, branch: &str) -> PathBuf {
        self.branch_dir(note_id, branch).join("edits")
    }

    fn record_path(&self, note_id: Uuid, branch: &str, edit_id: Uuid) -> PathBuf {
        self.edits_dir(note_id, branch).join(format!("{}.json", edit_id))
    }

    fn blob_path(&self, note_id: Uuid, branch: &str, edit_id: Uuid) -> PathBuf {
        self.edits_dir(note_id, branch).join(format!("{}.bin", edit_id))
    }

    /// Store new content for an edit, as a patch against `previous` while
    /// the chain allows, a full snapshot otherwise.
    pub async fn store_content(
        &self,
        note_id: Uuid,
        branch: &str,
        edit_id: Uuid,
        content: &str,
        previous: Option<Uuid>,
    ) -> Result<StoredEdit> {
        let content_hash = self.worker.hash_content(content).await?;
        let created_at = Utc::now();

        let mut prepared: Option<(StoredEdit, Vec<u8>)> = None;
        if let Some(prev_id) = previous {
            match self.load_record(note_id, branch, prev_id).await? {
                Some(prev) if prev.chain_length + 1 < DIFF_CHAIN_LIMIT => {
                    let prev_content = self.reconstruct(note_id, branch, prev.clone()).await?;
                    let patch = self
                        .worker
                        .compute_diff(prev_content, content.to_string())
                        .await?;
                    let bytes = serde_json::to_vec(&patch)?;
                    let record = StoredEdit {
                        edit_id,
                        note_id,
                        branch: branch.to_string(),
                        storage_type: StorageType::Diff,
                        previous_edit_id: Some(prev_id),
                        base_edit_id: Some(prev.base_edit_id.unwrap_or(prev.edit_id)),
                        chain_length: prev.chain_length + 1,
                        content_hash: content_hash.clone(),
                        created_at,
                        uncompressed_size: content.len() as u64,
                        stored_size: bytes.len() as u64,
                    };
                    prepared = Some((record, bytes));
                }
                Some(_) => {} // chain at its limit, cut with a full snapshot
                None => {
                    log::warn!(
                        "Content store: predecessor {} of edit {} missing, storing full",
                        prev_id,
                        edit_id,
                    );
                }
            }
        }

        let (record, bytes) = match prepared {
            Some(ready) => ready,
            None => {
                let bytes = content.as_bytes().to_vec();
                (
                    StoredEdit {
                        edit_id,
                        note_id,
                        branch: branch.to_string(),
                        storage_type: StorageType::Full,
                        previous_edit_id: None,
                        base_edit_id: None,
                        chain_length: 0,
                        content_hash,
                        created_at,
                        uncompressed_size: content.len() as u64,
                        stored_size: content.len() as u64,
                    },
                    bytes,
                )
            }
        };

        write_atomic(
            self.fs.as_ref(),
            &self.blob_path(note_id, branch, edit_id),
            &bytes,
        )
        .await?;
        write_atomic(
            self.fs.as_ref(),
            &self.record_path(note_id, branch, edit_id),
            &serde_json::to_vec_pretty(&record)?,
        )
        .await?;
        Ok(record)
    }

    /// Load and reconstruct an edit's content. `Ok(None)` is a lookup
    /// miss, not a fault.
    pub async fn get_content(
        &self,
        note_id: Uuid,
        branch: &str,
        edit_id: Uuid,
    ) -> Result<Option<String>> {
        match self.load_record(note_id, branch, edit_id).await? {
            Some(record) => Ok(Some(self.reconstruct(note_id, branch, record).await?)),
            None => Ok(None),
        }
    }

    async fn reconstruct(
        &self,
        note_id: Uuid,
        branch: &str,
        record: StoredEdit,
    ) -> Result<String> {
        let mut patches: Vec<Vec<PatchOp>> = Vec::new();
        let mut visited: HashSet<Uuid> = HashSet::new();
        visited.insert(record.edit_id);
        let mut current = record;

        loop {
            let bytes = self
                .fs
                .read(&self.blob_path(note_id, branch, current.edit_id))
                .await?;
            match current.storage_type {
                StorageType::Full => {
                    let base = String::from_utf8(bytes).map_err(|_| {
                        HistoryError::IntegrityCheckFailed(format!(
                            "full blob {} is not UTF-8",
                            current.edit_id,
                        ))
                    })?;
                    if patches.is_empty() {
                        return Ok(base);
                    }
                    patches.reverse();
                    return self.worker.apply_patch_chain(base, patches).await;
                }
                StorageType::Diff => {
                    let patch: Vec<PatchOp> = serde_json::from_slice(&bytes).map_err(|e| {
                        HistoryError::IntegrityCheckFailed(format!(
                            "patch blob {} unreadable: {}",
                            current.edit_id, e,
                        ))
                    })?;
                    patches.push(patch);
                    let prev_id = current.previous_edit_id.ok_or_else(|| {
                        HistoryError::IntegrityCheckFailed(format!(
                            "diff edit {} has no predecessor",
                            current.edit_id,
                        ))
                    })?;
                    if !visited.insert(prev_id) {
                        return Err(HistoryError::IntegrityCheckFailed(format!(
                            "cycle in diff chain at {}",
                            prev_id,
                        )));
                    }
                    current = self
                        .load_record(note_id, branch, prev_id)
                        .await?
                        .ok_or_else(|| {
                            HistoryError::IntegrityCheckFailed(format!(
                                "diff chain broken at {}",
                                prev_id,
                            ))
                        })?;
                }
            }
        }
    }

    pub async fn load_record(
        &self,
        note_id: Uuid,
        branch: &str,
        edit_id: Uuid,
    ) -> Result<Option<StoredEdit>> {
        let path = self.record_path(note_id, branch, edit_id);
        if !self.fs.exists(&path).await? {
            return Ok(None);
        }
        let raw = self.fs.read_to_string(&path).await?;
        Ok(Some(serde_json::from_str(&raw)?))
    }

    /// All records for a branch. Unparseable records are logged and
    /// skipped — integrity validation reports on them separately.
    pub async fn list_records(&self, note_id: Uuid, branch: &str) -> Result<Vec<StoredEdit>> {
        let dir = self.edits_dir(note_id, branch);
        let listing = self.fs.list(&dir).await?;
        let mut records = Vec::new();
        for file in listing.files {
            if file.extension().and_then(|e| e.to_str()) != Some("json") {
                continue;
            }
            let raw = self.fs.read_to_string(&file).await?;
            match serde_json::from_str::<StoredEdit>(&raw) {
                Ok(record) => records.push(record),
                Err(e) => log::warn!("Content store: skipping unreadable record {:?}: {}", file, e),
            }
        }
        records.sort_by_key(|r| (r.created_at, r.edit_id));
        Ok(records)
    }

    /// Raw stored bytes plus record, for archive export.
    pub async fn read_raw(
        &self,
        note_id: Uuid,
        branch: &str,
        edit_id: Uuid,
    ) -> Result<(StoredEdit, Vec<u8>)> {
        let record = self
            .load_record(note_id, branch, edit_id)
            .await?
            .ok_or_else(|| {
                HistoryError::DiskReadFailed(format!("no record for edit {}", edit_id))
            })?;
        let bytes = self.fs.read(&self.blob_path(note_id, branch, edit_id)).await?;
        Ok((record, bytes))
    }

    /// Write a record and its stored bytes verbatim, for archive import.
    pub async fn put_raw(&self, record: &StoredEdit, bytes: &[u8]) -> Result<()> {
        write_atomic(
            self.fs.as_ref(),
            &self.blob_path(record.note_id, &record.branch, record.edit_id),
            bytes,
        )
        .await?;
        write_atomic(
            self.fs.as_ref(),
            &self.record_path(record.note_id, &record.branch, record.edit_id),
            &serde_json::to_vec_pretty(record)?,
        )
        .await?;
        Ok(())
    }

    /// Physically delete one edit's blob and record. Missing files are
    /// treated as already deleted.
    pub async fn delete_edit(&self, note_id: Uuid, branch: &str, edit_id: Uuid) -> Result<()> {
        for path in [
            self.record_path(note_id, branch, edit_id),
            self.blob_path(note_id, branch, edit_id),
        ] {
            match self.fs.remove(&path).await {
                Ok(()) | Err(VaultError::NotFound(_)) => {}
                Err(e) => return Err(e.into()),
            }
        }
        Ok(())
    }

    /// Physically remove a set of logically-deleted edits.
    ///
    /// Surviving edits whose patch chain passes through a doomed edit are
    /// rewritten as full snapshots first, while the doomed blobs still
    /// exist. Individual failures are logged and skipped — the manifest
    /// already dropped these ids, so nothing here can corrupt it.
    pub async fn retire_edits(&self, note_id: Uuid, branch: &str, doomed: &[Uuid]) -> usize {
        let doomed_set: HashSet<Uuid> = doomed.iter().copied().collect();
        let records = match self.list_records(note_id, branch).await {
            Ok(records) => records,
            Err(e) => {
                log::error!(
                    "Content store: cannot list records for note {} branch {}: {}",
                    note_id,
                    branch,
                    e,
                );
                return 0;
            }
        };

        for record in &records {
            if doomed_set.contains(&record.edit_id) {
                continue;
            }
            let depends_on_doomed = record
                .previous_edit_id
                .map(|prev| doomed_set.contains(&prev))
                .unwrap_or(false);
            if !depends_on_doomed {
                continue;
            }
            match self.rematerialize(note_id, branch, record.clone()).await {
                Ok(()) => log::debug!(
                    "Content store: rematerialized edit {} before pruning its chain",
                    record.edit_id,
                ),
                Err(e) => log::error!(
                    "Content store: failed to rematerialize edit {}: {}",
                    record.edit_id,
                    e,
                ),
            }
        }

        let mut deleted = 0;
        for edit_id in doomed {
            match self.delete_edit(note_id, branch, *edit_id).await {
                Ok(()) => deleted += 1,
                Err(e) => log::warn!(
                    "Content store: failed to delete blob for edit {}: {}",
                    edit_id,
                    e,
                ),
            }
        }
        deleted
    }

    /// Rewrite a diff-stored edit as a full snapshot.
    async fn rematerialize(&self, note_id: Uuid, branch: &str, record: StoredEdit) -> Result<()> {
        let content = self.reconstruct(note_id, branch, record.clone()).await?;
        let rewritten = StoredEdit {
            storage_type: StorageType::Full,
            previous_edit_id: None,
            base_edit_id: None,
            chain_length: 0,
            stored_size: content.len() as u64,
            ..record
        };
        write_atomic(
            self.fs.as_ref(),
            &self.blob_path(note_id, branch, rewritten.edit_id),
            content.as_bytes(),
        )
        .await?;
        write_atomic(
            self.fs.as_ref(),
            &self.record_path(note_id, branch, rewritten.edit_id),
            &serde_json::to_vec_pretty(&rewritten)?,
        )
        .await?;
        Ok(())
    }

    /// Check that every diff record resolves back to a full snapshot
    /// without cycles.
    pub async fn validate_chain_integrity(&self, note_id: Uuid, branch: &str) -> Result<bool> {
        let records = self.list_records(note_id, branch).await?;
        let by_id: HashMap<Uuid, &StoredEdit> =
            records.iter().map(|r| (r.edit_id, r)).collect();

        for record in &records {
            if record.storage_type == StorageType::Full {
                if record.chain_length != 0 {
                    log::warn!(
                        "Content store: full edit {} claims chain length {}",
                        record.edit_id,
                        record.chain_length,
                    );
                    return Ok(false);
                }
                continue;
            }

            let mut visited = HashSet::new();
            visited.insert(record.edit_id);
            let mut current: &StoredEdit = record;
            loop {
                let Some(prev_id) = current.previous_edit_id else {
                    log::warn!(
                        "Content store: diff edit {} has no predecessor",
                        current.edit_id,
                    );
                    return Ok(false);
                };
                if !visited.insert(prev_id) {
                    log::warn!("Content store: cycle in diff chain at {}", prev_id);
                    return Ok(false);
                }
                match by_id.get(&prev_id).copied() {
                    Some(prev) if prev.storage_type == StorageType::Full => break,
                    Some(prev) => current = prev,
                    None => {
                        log::warn!("Content store: diff chain broken at {}", prev_id);
                        return Ok(false);
                    }
                }
            }
        }
        Ok(true)
    }

    pub async fn delete_branch_dir(&self, note_id: Uuid, branch: &str) -> Result<()> {
        self.fs
            .rmdir(&self.branch_dir(note_id, branch), true)
            .await?;
        Ok(())
    }

    pub async fn delete_note_dir(&self, note_id: Uuid) -> Result<()> {
        self.fs.rmdir(&self.note_dir(note_id), true).await?;
        Ok(())
    }
}
