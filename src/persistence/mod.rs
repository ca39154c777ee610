//! Debounced branch export to disk.
//!
//! Every mutation schedules an export for its (note, branch) key. Repeat
//! schedules within the debounce window coalesce into one eventual write
//! by bumping the entry's sequence — the sleeper that wakes up with a
//! stale sequence simply stands down. The in-progress set guarantees a
//! single physical writer per key; a schedule arriving mid-write defers
//! itself by re-scheduling. Failed exports retry with exponential backoff
//! and jitter; a terminal failure leaves the entry in the schedule map as
//! a loud, visible data-loss risk.

pub mod archive;
mod reconcile;

pub use reconcile::{ReconcileOutcome, RECONCILE_TOLERANCE_MS};

use std::collections::{HashMap, HashSet};
use std::path::PathBuf;
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{DateTime, Utc};
use rand::Rng;
use serde::Serialize;
use uuid::Uuid;

use crate::concurrency::LockManager;
use crate::config::SettingsHandle;
use crate::error::{HistoryError, Result};
use crate::events::{EventBus, HistoryEvent};
use crate::manifest::ManifestStore;
use crate::store::{branch_component, ContentStore};
use crate::vault::{VaultFs, VaultError};
use crate::worker::WorkerHandle;

use archive::{archive_file_name, ArchiveBundle, ArchiveManifest, ARCHIVE_EXTENSION, ARCHIVE_FORMAT_VERSION};

/// Quiet period before a scheduled export fires
pub const DEBOUNCE_WINDOW: Duration = Duration::from_millis(750);

/// Bounded retry budget for one export
pub const MAX_WRITE_ATTEMPTS: u32 = 5;

const BACKOFF_BASE: Duration = Duration::from_millis(500);
const BACKOFF_MAX: Duration = Duration::from_secs(30);
const BACKOFF_JITTER_MS: u64 = 250;

/// One pending debounced export.
#[derive(Debug, Clone, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ScheduledWrite {
    pub note_id: Uuid,
    pub branch: String,
    pub sequence: u64,
    pub timestamp: DateTime<Utc>,
    pub retry_count: u32,
}

pub struct PersistenceService {
    pub(crate) fs: Arc<dyn VaultFs>,
    pub(crate) manifests: Arc<ManifestStore>,
    pub(crate) contents: Arc<ContentStore>,
    pub(crate) worker: WorkerHandle,
    pub(crate) events: EventBus,
    pub(crate) settings: SettingsHandle,
    pub(crate) locks: Arc<LockManager>,
    pub(crate) archive_root: PathBuf,
    scheduled: StdMutex<HashMap<String, ScheduledWrite>>,
    in_progress: StdMutex<HashSet<String>>,
    debounce: Duration,
}

fn write_key(note_id: Uuid, branch: &str) -> String {
    format!("{}:{}", note_id, branch)
}

fn disk_lock_key(note_id: Uuid, branch: &str) -> String {
    format!("disk:{}:{}", note_id, branch)
}

impl PersistenceService {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        fs: Arc<dyn VaultFs>,
        manifests: Arc<ManifestStore>,
        contents: Arc<ContentStore>,
        worker: WorkerHandle,
        events: EventBus,
        settings: SettingsHandle,
        locks: Arc<LockManager>,
        archive_root: PathBuf,
    ) -> Self {
        Self {
            fs,
            manifests,
            contents,
            worker,
            events,
            settings,
            locks,
            archive_root,
            scheduled: StdMutex::new(HashMap::new()),
            in_progress: StdMutex::new(HashSet::new()),
            debounce: DEBOUNCE_WINDOW,
        }
    }

    #[cfg(test)]
    pub fn with_debounce(mut self, debounce: Duration) -> Self {
        self.debounce = debounce;
        self
    }

    pub fn note_archive_dir(&self, note_id: Uuid) -> PathBuf {
        self.archive_root.join(note_id.to_string())
    }

    pub fn branch_archive_dir(&self, note_id: Uuid, branch: &str) -> PathBuf {
        self.note_archive_dir(note_id).join(branch_component(branch))
    }

    /// Schedule (or re-schedule, coalescing) a debounced export.
    pub fn schedule(self: &Arc<Self>, note_id: Uuid, branch: &str) {
        if !self.settings.snapshot().enable_disk_persistence {
            return;
        }
        let key = write_key(note_id, branch);
        let sequence = {
            let mut scheduled = self.scheduled.lock().expect("schedule map poisoned");
            let entry = scheduled.entry(key).or_insert_with(|| ScheduledWrite {
                note_id,
                branch: branch.to_string(),
                sequence: 0,
                timestamp: Utc::now(),
                retry_count: 0,
            });
            entry.sequence += 1;
            entry.timestamp = Utc::now();
            entry.sequence
        };

        let service = Arc::clone(self);
        let branch = branch.to_string();
        let debounce = self.debounce;
        tokio::spawn(async move {
            tokio::time::sleep(debounce).await;
            service.fire(note_id, &branch, sequence).await;
        });
    }

    /// Drop any pending export for a key. Used before deletions so a
    /// late-firing write cannot resurrect deleted data. A write already
    /// in progress is not interrupted — deletion paths serialize against
    /// it through the disk lock.
    pub fn cancel(&self, note_id: Uuid, branch: &str) {
        let key = write_key(note_id, branch);
        if self
            .scheduled
            .lock()
            .expect("schedule map poisoned")
            .remove(&key)
            .is_some()
        {
            log::debug!("Disk persistence: cancelled pending write for {}", key);
        }
    }

    /// Pending writes, for shutdown flushing and diagnostics.
    pub fn scheduled_writes(&self) -> Vec<ScheduledWrite> {
        self.scheduled
            .lock()
            .expect("schedule map poisoned")
            .values()
            .cloned()
            .collect()
    }

    /// Execute a pending export for a key right now, if any.
    pub async fn flush(self: &Arc<Self>, note_id: Uuid, branch: &str) -> Result<()> {
        let key = write_key(note_id, branch);
        if self
            .scheduled
            .lock()
            .expect("schedule map poisoned")
            .remove(&key)
            .is_none()
        {
            return Ok(());
        }
        let claimed = self
            .in_progress
            .lock()
            .expect("in-progress set poisoned")
            .insert(key.clone());
        let result = self.export_with_retries(note_id, branch).await;
        if claimed {
            self.in_progress
                .lock()
                .expect("in-progress set poisoned")
                .remove(&key);
        }
        result.map(|_| ())
    }

    /// Flush every pending export. Used at shutdown.
    pub async fn flush_all(self: &Arc<Self>) -> Result<()> {
        let pending = self.scheduled_writes();
        for write in pending {
            if let Err(e) = self.flush(write.note_id, &write.branch).await {
                log::error!(
                    "Disk persistence: shutdown flush for {}:{} failed: {}",
                    write.note_id,
                    write.branch,
                    e,
                );
            }
        }
        Ok(())
    }

    /// Debounce sleeper wake-up: run the export unless superseded,
    /// cancelled, or deferred behind an in-progress write.
    async fn fire(self: &Arc<Self>, note_id: Uuid, branch: &str, sequence: u64) {
        let key = write_key(note_id, branch);
        {
            let scheduled = self.scheduled.lock().expect("schedule map poisoned");
            match scheduled.get(&key) {
                None => return, // cancelled or flushed
                Some(write) if write.sequence != sequence => return, // superseded
                Some(_) => {}
            }
        }
        {
            let mut in_progress = self.in_progress.lock().expect("in-progress set poisoned");
            if in_progress.contains(&key) {
                drop(in_progress);
                log::debug!(
                    "Disk persistence: write for {} in progress, deferring new schedule",
                    key,
                );
                self.schedule(note_id, branch);
                return;
            }
            in_progress.insert(key.clone());
        }
        self.scheduled
            .lock()
            .expect("schedule map poisoned")
            .remove(&key);

        if let Err(e) = self.export_with_retries(note_id, branch).await {
            log::error!("Disk persistence: export for {} failed: {}", key, e);
        }

        self.in_progress
            .lock()
            .expect("in-progress set poisoned")
            .remove(&key);
    }

    /// Export with exponential backoff and jitter. On terminal failure
    /// the key is re-inserted into the schedule map: the data is still
    /// only in the DB, and that risk stays visible.
    pub(crate) async fn export_with_retries(
        self: &Arc<Self>,
        note_id: Uuid,
        branch: &str,
    ) -> Result<bool> {
        let mut backoff = BACKOFF_BASE;
        let mut last_error = String::new();

        for attempt in 1..=MAX_WRITE_ATTEMPTS {
            match self.export_branch(note_id, branch).await {
                Ok(exported) => {
                    if exported {
                        self.events.emit(HistoryEvent::BranchPersisted {
                            note_id,
                            branch: branch.to_string(),
                        });
                    }
                    return Ok(exported);
                }
                Err(e) => {
                    log::warn!(
                        "Disk persistence: export attempt {}/{} for {}:{} failed: {}",
                        attempt,
                        MAX_WRITE_ATTEMPTS,
                        note_id,
                        branch,
                        e,
                    );
                    last_error = e.to_string();
                    if attempt < MAX_WRITE_ATTEMPTS {
                        let jitter = rand::thread_rng().gen_range(0..BACKOFF_JITTER_MS);
                        tokio::time::sleep(backoff + Duration::from_millis(jitter)).await;
                        backoff = (backoff * 2).min(BACKOFF_MAX);
                    }
                }
            }
        }

        let key = write_key(note_id, branch);
        {
            let mut scheduled = self.scheduled.lock().expect("schedule map poisoned");
            let entry = scheduled.entry(key.clone()).or_insert_with(|| ScheduledWrite {
                note_id,
                branch: branch.to_string(),
                sequence: 0,
                timestamp: Utc::now(),
                retry_count: 0,
            });
            entry.retry_count = MAX_WRITE_ATTEMPTS;
        }
        log::error!(
            "Disk persistence: write for {} failed terminally after {} attempts, data remains DB-only",
            key,
            MAX_WRITE_ATTEMPTS,
        );
        Err(HistoryError::DiskWriteFailed {
            attempts: MAX_WRITE_ATTEMPTS,
            message: last_error,
        })
    }

    /// One export attempt: build the archive, write it to a fresh file,
    /// read it back to verify, then drop every other archive in the
    /// branch directory. Returns false when the branch no longer exists.
    async fn export_branch(self: &Arc<Self>, note_id: Uuid, branch: &str) -> Result<bool> {
        self.locks
            .run_serialized(&disk_lock_key(note_id, branch), async {
                let Some(manifest) = self.manifests.load_note(note_id).await? else {
                    return Ok(false);
                };
                let Some(branch_data) = manifest.branch(branch) else {
                    return Ok(false);
                };

                let mut edits = Vec::with_capacity(branch_data.versions.len());
                let mut blobs = Vec::with_capacity(branch_data.versions.len());
                let mut total_bytes = 0u64;
                for version_id in branch_data.versions.keys() {
                    let (record, bytes) =
                        self.contents.read_raw(note_id, branch, *version_id).await?;
                    total_bytes += bytes.len() as u64;
                    edits.push(record);
                    blobs.push((*version_id, bytes));
                }

                let exported_at = Utc::now();
                let bundle = ArchiveBundle {
                    manifest: ArchiveManifest {
                        format_version: ARCHIVE_FORMAT_VERSION.to_string(),
                        note_id,
                        note_path: manifest.note_path.clone(),
                        branch_name: branch.to_string(),
                        exported_at,
                        last_modified: manifest.last_modified,
                        edit_count: edits.len(),
                        total_bytes,
                        branch: branch_data.clone(),
                    },
                    edits,
                    blobs,
                };

                let bytes = self.worker.build_archive(bundle).await?;
                let dir = self.branch_archive_dir(note_id, branch);
                self.fs.mkdir(&dir).await?;
                let path = dir.join(archive_file_name(exported_at, rand::random::<u32>()));

                self.fs.write(&path, &bytes).await?;

                let written = self.fs.read(&path).await?;
                if written.len() != bytes.len() {
                    let _ = self.fs.remove(&path).await;
                    return Err(HistoryError::IntegrityCheckFailed(format!(
                        "archive read-back length {} != written {}",
                        written.len(),
                        bytes.len(),
                    )));
                }

                // Single-file-per-branch invariant
                let listing = self.fs.list(&dir).await?;
                for file in listing.files {
                    if file == path {
                        continue;
                    }
                    if file.extension().and_then(|e| e.to_str()) == Some(ARCHIVE_EXTENSION) {
                        if let Err(e) = self.fs.remove(&file).await {
                            log::warn!(
                                "Disk persistence: could not remove stale archive {:?}: {}",
                                file,
                                e,
                            );
                        }
                    }
                }

                log::debug!(
                    "Disk persistence: exported {}:{} ({} bytes) to {:?}",
                    note_id,
                    branch,
                    bytes.len(),
                    path,
                );
                Ok(true)
            })
            .await
    }

    /// Remove a branch's archive directory, after cancelling any pending
    /// write and waiting out a running one.
    pub async fn remove_branch_archives(self: &Arc<Self>, note_id: Uuid, branch: &str) -> Result<()> {
        self.cancel(note_id, branch);
        self.locks
            .run_serialized(&disk_lock_key(note_id, branch), async {
                self.fs
                    .rmdir(&self.branch_archive_dir(note_id, branch), true)
                    .await?;
                Ok(())
            })
            .await
    }

    /// Remove every archive for a note. `branches` names the branches
    /// whose writes must be cancelled and serialized against.
    pub async fn remove_note_archives(
        self: &Arc<Self>,
        note_id: Uuid,
        branches: &[String],
    ) -> Result<()> {
        for branch in branches {
            self.cancel(note_id, branch);
        }
        let keys: Vec<String> = branches
            .iter()
            .map(|branch| disk_lock_key(note_id, branch))
            .collect();
        self.locks
            .run_serialized_multi(&keys, async {
                self.fs.rmdir(&self.note_archive_dir(note_id), true).await?;
                Ok(())
            })
            .await
    }

    /// Archive files currently present for a branch.
    pub(crate) async fn list_archive_files(
        &self,
        note_id: Uuid,
        branch: &str,
    ) -> Result<Vec<PathBuf>> {
        let dir = self.branch_archive_dir(note_id, branch);
        let listing = match self.fs.list(&dir).await {
            Ok(listing) => listing,
            Err(VaultError::NotFound(_)) => return Ok(Vec::new()),
            Err(e) => return Err(e.into()),
        };
        Ok(listing
            .files
            .into_iter()
            .filter(|f| f.extension().and_then(|e| e.to_str()) == Some(ARCHIVE_EXTENSION))
            .collect())
    }
}
