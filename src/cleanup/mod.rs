//! Retention enforcement and orphan detection.
//!
//! Retention runs after every saved version, deduplicated so one pass
//! per note is ever in flight. The orphan scan walks the central
//! manifest and correlates each entry with its document through the
//! identity marker — a document that merely moved gets its recorded path
//! healed; only a genuinely missing identity loses its history.

use std::collections::HashSet;
use std::path::Path;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex as StdMutex};
use std::time::Duration;

use chrono::{Duration as ChronoDuration, Utc};
use tokio::sync::mpsc;
use uuid::Uuid;

use crate::error::Result;
use crate::events::HistoryEvent;
use crate::ops::{self, note_lock_key, OpCtx};
use crate::vault::identity::{IdentityResolver, IdentityStatus};

/// Outcome of one orphan scan.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct OrphanScanReport {
    pub checked: usize,
    pub healed: usize,
    pub deleted: usize,
    /// True when the scan was skipped because another was running
    pub skipped: bool,
}

pub struct CleanupManager {
    ctx: OpCtx,
    identity: Arc<dyn IdentityResolver>,
    retention_in_flight: StdMutex<HashSet<Uuid>>,
    orphan_running: AtomicBool,
}

impl CleanupManager {
    pub fn new(ctx: OpCtx, identity: Arc<dyn IdentityResolver>) -> Self {
        Self {
            ctx,
            identity,
            retention_in_flight: StdMutex::new(HashSet::new()),
            orphan_running: AtomicBool::new(false),
        }
    }

    /// Enforce retention for one note. A second trigger while a pass is
    /// already running is a silent no-op (`Ok(None)`).
    pub async fn run_retention(&self, note_id: Uuid) -> Result<Option<usize>> {
        {
            let mut in_flight = self
                .retention_in_flight
                .lock()
                .expect("retention set poisoned");
            if !in_flight.insert(note_id) {
                log::debug!("Cleanup: retention for {} already running, skipping", note_id);
                return Ok(None);
            }
        }
        let result = self.retention_inner(note_id).await;
        self.retention_in_flight
            .lock()
            .expect("retention set poisoned")
            .remove(&note_id);
        result.map(Some)
    }

    async fn retention_inner(&self, note_id: Uuid) -> Result<usize> {
        let ctx = &self.ctx;
        let settings = ctx.settings.snapshot();

        ctx.locks
            .run_serialized(&note_lock_key(note_id), async {
                let Some(mut manifest) = ctx.manifests.load_note(note_id).await? else {
                    return Ok(0);
                };

                let now = Utc::now();
                let mut affected: Vec<(String, Vec<Uuid>)> = Vec::new();

                for (name, branch) in manifest.branches.clone() {
                    // Never touch a branch down to its last version
                    if branch.versions.len() < 2 {
                        continue;
                    }

                    let effective = settings.effective(branch.settings.as_ref());
                    let max_kept = effective.max_versions_per_note as usize;
                    let cutoff = now
                        - ChronoDuration::days(i64::from(effective.auto_cleanup_days));

                    let mut ordered: Vec<(Uuid, &crate::manifest::VersionMetadata)> = branch
                        .versions
                        .iter()
                        .map(|(id, meta)| (*id, meta))
                        .collect();
                    ordered.sort_by(|a, b| b.1.version_number.cmp(&a.1.version_number));

                    let mut kept = 0usize;
                    let mut doomed: Vec<Uuid> = Vec::new();
                    for (id, meta) in &ordered {
                        let mut keep = kept < max_kept;
                        if effective.auto_cleanup_old_versions && meta.timestamp < cutoff {
                            keep = false;
                        }
                        if keep {
                            kept += 1;
                        } else {
                            doomed.push(*id);
                        }
                    }

                    // Invariant: a note with versions always keeps at
                    // least its newest one
                    if doomed.len() == branch.versions.len() {
                        let newest = ordered[0].0;
                        doomed.retain(|id| *id != newest);
                    }
                    if doomed.is_empty() {
                        continue;
                    }

                    let mut updated = branch.clone();
                    for id in &doomed {
                        updated.versions.remove(id);
                    }
                    updated.recount();
                    manifest.branches.insert(name.clone(), updated);
                    affected.push((name, doomed));
                }

                if affected.is_empty() {
                    return Ok(0);
                }

                // One batch manifest update before any blob is touched
                manifest.touch();
                ctx.manifests.save_note(&mut manifest).await?;

                let mut total = 0usize;
                for (branch, doomed) in &affected {
                    total += doomed.len();
                    let removed = ctx.contents.retire_edits(note_id, branch, doomed).await;
                    if removed < doomed.len() {
                        log::warn!(
                            "Cleanup: {} of {} blob removals failed for {}:{} (logical state unaffected)",
                            doomed.len() - removed,
                            doomed.len(),
                            note_id,
                            branch,
                        );
                    }
                    ctx.persistence.schedule(note_id, branch);
                }

                ctx.events.emit(HistoryEvent::VersionDeleted { note_id });
                log::info!("Cleanup: retention removed {} version(s) of note {}", total, note_id);
                Ok(total)
            })
            .await
    }

    /// Scan every central-manifest entry for orphaned histories.
    /// Overlapping triggers are skipped, not queued.
    pub async fn run_orphan_scan(&self) -> Result<OrphanScanReport> {
        if self.orphan_running.swap(true, Ordering::SeqCst) {
            log::debug!("Cleanup: orphan scan already running, skipping");
            return Ok(OrphanScanReport {
                skipped: true,
                ..Default::default()
            });
        }
        let result = self.orphan_scan_inner().await;
        self.orphan_running.store(false, Ordering::SeqCst);
        result
    }

    async fn orphan_scan_inner(&self) -> Result<OrphanScanReport> {
        let ctx = &self.ctx;
        let central = ctx.manifests.load_central().await?;
        let mut report = OrphanScanReport::default();

        for (note_id, entry) in &central.notes {
            report.checked += 1;
            match self
                .identity
                .locate(*note_id, Path::new(&entry.note_path))
                .await?
            {
                IdentityStatus::Valid => {}
                IdentityStatus::Moved(new_path) => {
                    let path = new_path.to_string_lossy().to_string();
                    log::info!(
                        "Cleanup: note {} moved from {} to {}, healing recorded path",
                        note_id,
                        entry.note_path,
                        path,
                    );
                    match ops::update::update_note_path(ctx, *note_id, &path).await {
                        Ok(_) => report.healed += 1,
                        Err(e) => log::error!(
                            "Cleanup: failed to heal path for note {}: {}",
                            note_id,
                            e,
                        ),
                    }
                }
                IdentityStatus::Missing => {
                    log::info!(
                        "Cleanup: document for note {} is gone, removing its history",
                        note_id,
                    );
                    match ops::delete::delete_note_history(ctx, *note_id).await {
                        Ok(()) => report.deleted += 1,
                        Err(e) => log::error!(
                            "Cleanup: failed to delete history for note {}: {}",
                            note_id,
                            e,
                        ),
                    }
                }
            }
        }

        log::info!(
            "Cleanup: orphan scan checked {} note(s), healed {}, deleted {}",
            report.checked,
            report.healed,
            report.deleted,
        );
        Ok(report)
    }
}

/// Messages controlling the periodic orphan sweeper
#[derive(Debug)]
enum SweeperMessage {
    /// Run a scan now, regardless of the timer
    ScanNow,
    Shutdown,
}

/// Handle for the periodic orphan sweeper.
pub struct OrphanSweeper {
    sender: mpsc::Sender<SweeperMessage>,
}

impl OrphanSweeper {
    pub fn scan_now(&self) {
        let _ = self.sender.try_send(SweeperMessage::ScanNow);
    }

    pub fn shutdown(&self) {
        let _ = self.sender.try_send(SweeperMessage::Shutdown);
    }
}

/// Start a loop that runs the orphan scan on an interval.
pub fn start_orphan_sweeper(manager: Arc<CleanupManager>, interval: Duration) -> OrphanSweeper {
    let (tx, mut rx) = mpsc::channel(8);

    tokio::spawn(async move {
        log::info!("Orphan sweeper: started with interval {:?}", interval);
        loop {
            tokio::select! {
                _ = tokio::time::sleep(interval) => {
                    if let Err(e) = manager.run_orphan_scan().await {
                        log::error!("Orphan sweeper: scan failed: {}", e);
                    }
                }
                msg = rx.recv() => {
                    match msg {
                        Some(SweeperMessage::ScanNow) => {
                            if let Err(e) = manager.run_orphan_scan().await {
                                log::error!("Orphan sweeper: scan failed: {}", e);
                            }
                        }
                        Some(SweeperMessage::Shutdown) | None => {
                            log::info!("Orphan sweeper: shutting down");
                            break;
                        }
                    }
                }
            }
        }
    });

    OrphanSweeper { sender: tx }
}
