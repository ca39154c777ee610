//! Two-way reconciliation between the DB-side branch state and its
//! on-disk archive.
//!
//! The vault directory can change underneath the engine (external sync
//! while the plugin was disabled), and the DB can move ahead while disk
//! writes are pending. Whichever side carries the newer manifest
//! timestamp wins, outside a small clock-skew tolerance; inside the
//! tolerance the two are assumed synchronized and nothing is written.
//! Corrupt archives never clobber DB state — they are backed up and the
//! DB is re-exported over them.

use std::collections::HashMap;
use std::path::PathBuf;
use std::sync::Arc;

use chrono::Utc;
use uuid::Uuid;

use super::archive::ArchiveBundle;
use super::{disk_lock_key, PersistenceService};
use crate::error::{HistoryError, Result};
use crate::manifest::NoteManifest;
use crate::ops::note_lock_key;

/// Clock-skew tolerance for timestamp comparison
pub const RECONCILE_TOLERANCE_MS: i64 = 1000;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Neither side has data for the branch
    NothingToDo,
    /// Timestamps within tolerance, no write performed
    InSync,
    /// The archive was newer; its contents replaced the DB branch
    ImportedFromDisk,
    /// The DB was newer (or the disk side was absent/corrupt); it was
    /// re-exported
    ExportedToDisk,
}

enum ScanDecision {
    Nothing,
    InSync,
    Import(Box<ArchiveBundle>),
    Export,
}

impl PersistenceService {
    /// Reconcile one branch with its archive directory.
    pub async fn load_branch_from_disk(
        self: &Arc<Self>,
        note_id: Uuid,
        branch: &str,
    ) -> Result<ReconcileOutcome> {
        self.locks
            .run_serialized(&note_lock_key(note_id), async {
                // Never race the read against our own pending write
                self.flush(note_id, branch).await?;

                let decision = self
                    .locks
                    .run_serialized(
                        &disk_lock_key(note_id, branch),
                        self.scan_and_decide(note_id, branch),
                    )
                    .await?;

                match decision {
                    ScanDecision::Nothing => Ok(ReconcileOutcome::NothingToDo),
                    ScanDecision::InSync => Ok(ReconcileOutcome::InSync),
                    ScanDecision::Import(bundle) => {
                        self.import_bundle(note_id, branch, *bundle).await?;
                        Ok(ReconcileOutcome::ImportedFromDisk)
                    }
                    ScanDecision::Export => {
                        self.export_with_retries(note_id, branch).await?;
                        Ok(ReconcileOutcome::ExportedToDisk)
                    }
                }
            })
            .await
    }

    async fn scan_and_decide(&self, note_id: Uuid, branch: &str) -> Result<ScanDecision> {
        let manifest = self.manifests.load_note(note_id).await?;
        let db_ts = manifest
            .as_ref()
            .filter(|m| m.branch(branch).is_some())
            .map(|m| m.last_modified);

        let files = self.list_archive_files(note_id, branch).await?;
        let mut newest: Option<(PathBuf, ArchiveBundle)> = None;
        let mut stale: Vec<PathBuf> = Vec::new();
        let mut corrupt: Vec<PathBuf> = Vec::new();

        for path in files {
            let bytes = self.fs.read(&path).await?;
            match self.worker.parse_archive(bytes).await {
                Ok(bundle) => match newest.take() {
                    None => newest = Some((path, bundle)),
                    Some((kept_path, kept)) => {
                        if bundle.manifest.exported_at > kept.manifest.exported_at {
                            stale.push(kept_path);
                            newest = Some((path, bundle));
                        } else {
                            stale.push(path);
                            newest = Some((kept_path, kept));
                        }
                    }
                },
                Err(e) => {
                    log::warn!(
                        "Disk persistence: archive {:?} unreadable ({}), preserving as corrupt",
                        path,
                        e,
                    );
                    corrupt.push(path);
                }
            }
        }

        // Leftover files from an interrupted cleanup: only the newest
        // export survives
        for path in stale {
            log::info!("Disk persistence: removing conflicting archive {:?}", path);
            if let Err(e) = self.fs.remove(&path).await {
                log::warn!("Disk persistence: could not remove {:?}: {}", path, e);
            }
        }
        for path in &corrupt {
            let backup = PathBuf::from(format!(
                "{}.corrupt.{}",
                path.display(),
                Utc::now().format("%Y%m%d%H%M%S"),
            ));
            if let Err(e) = self.fs.rename(path, &backup).await {
                log::warn!("Disk persistence: could not back up {:?}: {}", path, e);
            }
        }

        Ok(match (db_ts, newest) {
            (None, None) => ScanDecision::Nothing,
            (None, Some((_, bundle))) => ScanDecision::Import(Box::new(bundle)),
            (Some(_), None) => ScanDecision::Export,
            (Some(db_ts), Some((_, bundle))) => {
                let delta_ms = (bundle.manifest.last_modified - db_ts).num_milliseconds();
                if delta_ms > RECONCILE_TOLERANCE_MS {
                    ScanDecision::Import(Box::new(bundle))
                } else if delta_ms < -RECONCILE_TOLERANCE_MS {
                    ScanDecision::Export
                } else {
                    ScanDecision::InSync
                }
            }
        })
    }

    /// Replace the DB branch with the archive's contents (file wins).
    async fn import_bundle(
        &self,
        note_id: Uuid,
        branch: &str,
        bundle: ArchiveBundle,
    ) -> Result<()> {
        log::info!(
            "Disk persistence: importing {} edit(s) into {}:{} from archive dated {}",
            bundle.edits.len(),
            note_id,
            branch,
            bundle.manifest.exported_at,
        );

        self.contents.delete_branch_dir(note_id, branch).await?;
        let blobs: HashMap<Uuid, Vec<u8>> = bundle.blobs.into_iter().collect();
        for record in &bundle.edits {
            let bytes = blobs.get(&record.edit_id).ok_or_else(|| {
                HistoryError::IntegrityCheckFailed(format!(
                    "archive missing blob for edit {}",
                    record.edit_id,
                ))
            })?;
            self.contents.put_raw(record, bytes).await?;
        }

        let mut manifest = match self.manifests.load_note(note_id).await? {
            Some(manifest) => manifest,
            None => NoteManifest::new(note_id, bundle.manifest.note_path.clone()),
        };
        manifest
            .branches
            .insert(branch.to_string(), bundle.manifest.branch.clone());
        // Adopt the archive's timestamp so an immediate re-load lands
        // inside the tolerance window
        manifest.last_modified = bundle.manifest.last_modified;
        self.manifests.save_note(&mut manifest).await?;
        self.manifests
            .upsert_note_entry(note_id, &manifest.note_path)
            .await?;
        Ok(())
    }
}
