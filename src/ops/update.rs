//! Update protocol: metadata edits, renames and path moves.
//!
//! All updates follow the same immutable pattern: load fresh, produce a
//! new manifest value, and persist only when the result actually differs
//! — a no-op update triggers no write and no event.

use uuid::Uuid;

use super::{note_lock_key, OpCtx};
use crate::error::{HistoryError, Result};
use crate::events::HistoryEvent;
use crate::manifest::NoteManifest;

/// Set a version's name and/or description. Returns false when nothing
/// changed.
pub async fn update_edit_metadata(
    ctx: &OpCtx,
    note_id: Uuid,
    version_id: Uuid,
    name: Option<String>,
    description: Option<String>,
) -> Result<bool> {
    ctx.locks
        .run_serialized(&note_lock_key(note_id), async {
            let mut manifest = ctx
                .manifests
                .load_note(note_id)
                .await?
                .ok_or(HistoryError::NoteNotFound(note_id))?;

            let branch_name = manifest
                .branch_containing(version_id)
                .ok_or_else(|| {
                    HistoryError::InvalidState(format!("version {} not found", version_id))
                })?
                .to_string();

            let branch = manifest
                .branch(&branch_name)
                .expect("branch disappeared between lookups");
            let current = &branch.versions[&version_id];

            let mut updated = current.clone();
            if let Some(name) = name.clone() {
                updated.name = Some(name);
            }
            if let Some(description) = description.clone() {
                updated.description = Some(description);
            }
            if updated == *current {
                return Ok(false);
            }

            let mut updated_branch = branch.clone();
            updated_branch.versions.insert(version_id, updated);
            manifest.branches.insert(branch_name.clone(), updated_branch);
            manifest.touch();
            ctx.manifests.save_note(&mut manifest).await?;

            ctx.persistence.schedule(note_id, &branch_name);
            ctx.events.emit(HistoryEvent::VersionUpdated {
                note_id,
                version_id,
                name,
                description,
            });
            Ok(true)
        })
        .await
}

/// Rename a version.
pub async fn rename_edit(
    ctx: &OpCtx,
    note_id: Uuid,
    version_id: Uuid,
    new_name: &str,
) -> Result<bool> {
    update_edit_metadata(ctx, note_id, version_id, Some(new_name.to_string()), None).await
}

/// Record that a note's document moved. Returns false when the path is
/// already current.
pub async fn update_note_path(ctx: &OpCtx, note_id: Uuid, new_path: &str) -> Result<bool> {
    ctx.locks
        .run_serialized(&note_lock_key(note_id), async {
            let mut manifest = ctx
                .manifests
                .load_note(note_id)
                .await?
                .ok_or(HistoryError::NoteNotFound(note_id))?;

            if manifest.note_path == new_path {
                return Ok(false);
            }

            // Path uniqueness is checked centrally before the note
            // manifest changes
            ctx.manifests.upsert_note_entry(note_id, new_path).await?;
            manifest.note_path = new_path.to_string();
            manifest.touch();
            ctx.manifests.save_note(&mut manifest).await?;

            for branch in manifest.branches.keys() {
                ctx.persistence.schedule(note_id, branch);
            }
            Ok(true)
        })
        .await
}

/// Re-key a note's entire history under a new note id. Both note locks
/// are taken in sorted order, so two opposite-direction renames cannot
/// deadlock.
pub async fn rename_note(ctx: &OpCtx, old_id: Uuid, new_id: Uuid) -> Result<()> {
    if old_id == new_id {
        return Ok(());
    }
    let keys = vec![note_lock_key(old_id), note_lock_key(new_id)];
    ctx.locks
        .run_serialized_multi(&keys, async {
            let manifest = ctx
                .manifests
                .load_note(old_id)
                .await?
                .ok_or(HistoryError::NoteNotFound(old_id))?;
            if ctx.manifests.load_note(new_id).await?.is_some() {
                return Err(HistoryError::InvalidState(format!(
                    "note {} already has history",
                    new_id,
                )));
            }

            let branches: Vec<String> = manifest.branches.keys().cloned().collect();
            for branch in &branches {
                ctx.persistence.cancel(old_id, branch);
            }

            // Re-write every stored edit under the new id; records carry
            // their note id, so a plain directory move would lie
            for branch in &branches {
                let records = ctx.contents.list_records(old_id, branch).await?;
                for record in records {
                    let (mut moved, bytes) =
                        ctx.contents.read_raw(old_id, branch, record.edit_id).await?;
                    moved.note_id = new_id;
                    ctx.contents.put_raw(&moved, &bytes).await?;
                }
            }

            let mut moved = manifest.clone();
            moved.note_id = new_id;
            moved.touch();

            ctx.manifests.remove_note_entry(old_id).await?;
            ctx.manifests
                .upsert_note_entry(new_id, &moved.note_path)
                .await?;
            ctx.manifests.save_note(&mut moved).await?;

            ctx.manifests.remove_note_manifest(old_id).await?;
            ctx.contents.delete_note_dir(old_id).await?;
            ctx.persistence.remove_note_archives(old_id, &branches).await?;

            for branch in &branches {
                ctx.persistence.schedule(new_id, branch);
            }
            log::info!("Update: moved history of note {} to {}", old_id, new_id);
            Ok(())
        })
        .await
}

/// Persist a host-modified manifest (branch switching, branch settings,
/// editor state). The path-uniqueness invariant is re-checked before the
/// save lands.
pub async fn save_edit_manifest(ctx: &OpCtx, manifest: NoteManifest) -> Result<()> {
    let note_id = manifest.note_id;
    ctx.locks
        .run_serialized(&note_lock_key(note_id), async {
            let mut manifest = manifest;
            ctx.manifests
                .upsert_note_entry(note_id, &manifest.note_path)
                .await?;
            manifest.touch();
            ctx.manifests.save_note(&mut manifest).await?;
            ctx.persistence.schedule(note_id, &manifest.current_branch);
            Ok(())
        })
        .await
}
