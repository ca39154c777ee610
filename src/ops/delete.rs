//! Delete protocol.
//!
//! Logical deletion (the manifest update) always lands before physical
//! blob removal, and branch/note deletion cancels pending disk writes
//! before touching anything — a late-firing export must never resurrect
//! deleted data.

use uuid::Uuid;

use super::{note_lock_key, note_queue_key, OpCtx};
use crate::concurrency::Priority;
use crate::error::{HistoryError, Result};
use crate::events::HistoryEvent;
use crate::manifest::migration::DEFAULT_BRANCH;

/// Logically delete one version, then retire its blob asynchronously.
/// Returns false when the version does not exist.
pub async fn delete_edit_entry(
    ctx: &OpCtx,
    note_id: Uuid,
    version_id: Uuid,
    branch: Option<&str>,
) -> Result<bool> {
    ctx.locks
        .run_serialized(&note_lock_key(note_id), async {
            let Some(mut manifest) = ctx.manifests.load_note(note_id).await? else {
                return Ok(false);
            };

            let branch_name = match branch {
                Some(name) => name.to_string(),
                None => match manifest.branch_containing(version_id) {
                    Some(name) => name.to_string(),
                    None => return Ok(false),
                },
            };
            let Some(branch_data) = manifest.branch(&branch_name) else {
                return Ok(false);
            };
            if !branch_data.versions.contains_key(&version_id) {
                return Ok(false);
            }

            let mut updated = branch_data.clone();
            updated.versions.remove(&version_id);
            updated.recount();
            manifest.branches.insert(branch_name.clone(), updated);
            manifest.touch();
            ctx.manifests.save_note(&mut manifest).await?;

            // Physical removal is decoupled: failures here are logged by
            // the store and never surface
            let (contents, locks) = (ctx.contents.clone(), ctx.locks.clone());
            let (key, branch_for_retire) = (note_lock_key(note_id), branch_name.clone());
            tokio::spawn(async move {
                locks
                    .run_serialized(&key, async {
                        contents
                            .retire_edits(note_id, &branch_for_retire, &[version_id])
                            .await
                    })
                    .await;
            });

            ctx.persistence.schedule(note_id, &branch_name);
            ctx.events.emit(HistoryEvent::VersionDeleted { note_id });
            Ok(true)
        })
        .await
}

/// Raw physical deletion of a stored edit. No manifest involvement.
pub async fn delete_edit(ctx: &OpCtx, note_id: Uuid, branch: &str, edit_id: Uuid) -> Result<()> {
    ctx.contents.delete_edit(note_id, branch, edit_id).await
}

/// Delete a whole branch: cancel its pending export first, then drop its
/// blobs, manifest entry and archive directory.
pub async fn delete_branch(ctx: &OpCtx, note_id: Uuid, branch: &str) -> Result<bool> {
    ctx.locks
        .run_serialized(&note_lock_key(note_id), async {
            ctx.persistence.cancel(note_id, branch);

            let Some(mut manifest) = ctx.manifests.load_note(note_id).await? else {
                return Ok(false);
            };
            if manifest.branches.remove(branch).is_none() {
                return Ok(false);
            }

            if manifest.current_branch == branch {
                manifest.current_branch = if manifest.branches.contains_key(DEFAULT_BRANCH) {
                    DEFAULT_BRANCH.to_string()
                } else {
                    match manifest.branches.keys().next() {
                        Some(name) => name.clone(),
                        None => {
                            manifest.ensure_branch(DEFAULT_BRANCH);
                            DEFAULT_BRANCH.to_string()
                        }
                    }
                };
            }
            manifest.touch();
            ctx.manifests.save_note(&mut manifest).await?;

            ctx.contents.delete_branch_dir(note_id, branch).await?;
            ctx.persistence.remove_branch_archives(note_id, branch).await?;

            log::info!("Delete: removed branch {} of note {}", branch, note_id);
            Ok(true)
        })
        .await
}

/// Delete a note's entire history: every branch's blobs, the on-disk
/// archives, the note manifest and the central entry. Admitted at
/// critical priority ahead of any queued background work for the note.
pub async fn delete_note_history(ctx: &OpCtx, note_id: Uuid) -> Result<()> {
    let queue = ctx.queue.clone();
    let ctx = ctx.clone();
    queue
        .add(vec![note_queue_key(note_id)], Priority::Critical, async move {
            ctx.locks
                .run_serialized(&note_lock_key(note_id), async {
                    let manifest = ctx.manifests.load_note(note_id).await?;
                    let branches: Vec<String> = manifest
                        .as_ref()
                        .map(|m| m.branches.keys().cloned().collect())
                        .unwrap_or_default();

                    // Cancel before deleting, never after
                    for branch in &branches {
                        ctx.persistence.cancel(note_id, branch);
                    }
                    ctx.persistence.remove_note_archives(note_id, &branches).await?;

                    ctx.contents.delete_note_dir(note_id).await?;
                    ctx.manifests.remove_note_manifest(note_id).await?;
                    ctx.manifests.remove_note_entry(note_id).await?;

                    ctx.events.emit(HistoryEvent::HistoryDeleted { note_id });
                    log::info!("Delete: removed all history for note {}", note_id);
                    Ok::<(), HistoryError>(())
                })
                .await
        })
        .await?
}
