//! Create protocol: record a new version of a note's content.

use chrono::Utc;
use uuid::Uuid;

use super::{note_lock_key, OpCtx};
use crate::error::Result;
use crate::events::HistoryEvent;
use crate::manifest::{NoteManifest, VersionMetadata};
use crate::stats::text_stats;

/// Result of a successful create.
#[derive(Debug, Clone)]
pub struct CreatedEdit {
    pub version_id: Uuid,
    pub metadata: VersionMetadata,
    /// Versions evicted by retention during this create
    pub deleted_ids: Vec<Uuid>,
}

/// Record `content` as a new version. Returns `None` when the content is
/// identical to the branch head — no version, no blob, no event. This is
/// the at-most-once-per-distinct-content guarantee.
pub async fn create_edit(
    ctx: &OpCtx,
    note_id: Uuid,
    branch: Option<&str>,
    content: &str,
    file_path: &str,
    max_versions: Option<u32>,
) -> Result<Option<CreatedEdit>> {
    let key = note_lock_key(note_id);
    let op_id = Uuid::new_v4().to_string();
    ctx.coordinator.begin(&key, &op_id);
    let result = ctx
        .locks
        .run_serialized(
            &key,
            create_edit_inner(ctx, note_id, branch, content, file_path, max_versions),
        )
        .await;
    ctx.coordinator.complete(&key, &op_id);
    result
}

async fn create_edit_inner(
    ctx: &OpCtx,
    note_id: Uuid,
    branch: Option<&str>,
    content: &str,
    file_path: &str,
    max_versions: Option<u32>,
) -> Result<Option<CreatedEdit>> {
    // Freshest manifest, never a cached one. First save registers the
    // note centrally — the path-uniqueness check runs before any state
    // is created.
    let mut manifest = match ctx.manifests.load_note(note_id).await? {
        Some(manifest) => manifest,
        None => {
            ctx.manifests.upsert_note_entry(note_id, file_path).await?;
            NoteManifest::new(note_id, file_path.to_string())
        }
    };

    let branch_name = branch
        .map(str::to_string)
        .unwrap_or_else(|| manifest.current_branch.clone());
    let branch_data = manifest.ensure_branch(&branch_name).clone();

    // Idempotency: identical content to the head is a no-op. Heads
    // recorded before hash tracking fall back to a content comparison.
    let content_hash = ctx.worker.hash_content(content).await?;
    if let Some((head_id, head_meta)) = branch_data.head() {
        let unchanged = match &head_meta.content_hash {
            Some(existing) => *existing == content_hash,
            None => matches!(
                ctx.contents.get_content(note_id, &branch_name, head_id).await?,
                Some(head_content) if head_content == content
            ),
        };
        if unchanged {
            log::debug!(
                "Create: content of {}:{} unchanged, skipping",
                note_id,
                branch_name,
            );
            return Ok(None);
        }
    }

    let version_number = branch_data.next_version_number();
    let previous_head = branch_data.head().map(|(id, _)| id);
    let edit_id = Uuid::new_v4();
    let stats = text_stats(content);

    // The blob goes in first; the manifest save below is the commit
    // point. A blob without a manifest entry is an orphan, not state.
    let record = ctx
        .contents
        .store_content(note_id, &branch_name, edit_id, content, previous_head)
        .await?;

    let metadata = VersionMetadata {
        version_number,
        timestamp: Utc::now(),
        name: None,
        description: None,
        size: content.len() as u64,
        compressed_size: Some(record.stored_size),
        uncompressed_size: Some(record.uncompressed_size),
        content_hash: Some(record.content_hash.clone()),
        word_count: stats.word_count,
        char_count: stats.char_count,
        line_count: stats.line_count,
    };

    let mut updated_branch = branch_data;
    updated_branch.versions.insert(edit_id, metadata.clone());

    // Retention happens inside the same manifest write as the create
    let effective = ctx.settings.snapshot().effective(updated_branch.settings.as_ref());
    let max = (max_versions.unwrap_or(effective.max_versions_per_note) as usize).max(1);
    let mut deleted_ids = Vec::new();
    if updated_branch.versions.len() > max {
        let excess = updated_branch.versions.len() - max;
        for id in updated_branch.ids_oldest_first().into_iter().take(excess) {
            updated_branch.versions.remove(&id);
            deleted_ids.push(id);
        }
    }
    updated_branch.recount();

    manifest.branches.insert(branch_name.clone(), updated_branch);
    manifest.touch();
    if let Err(e) = ctx.manifests.save_note(&mut manifest).await {
        // Nothing committed; drop the orphaned blob best-effort
        let _ = ctx.contents.delete_edit(note_id, &branch_name, edit_id).await;
        return Err(e);
    }

    // Physical removal of evicted blobs is asynchronous and best-effort;
    // its failures never reach the caller
    if !deleted_ids.is_empty() {
        let (contents, locks) = (ctx.contents.clone(), ctx.locks.clone());
        let (key, branch_for_retire, doomed) =
            (note_lock_key(note_id), branch_name.clone(), deleted_ids.clone());
        tokio::spawn(async move {
            locks
                .run_serialized(&key, async {
                    contents.retire_edits(note_id, &branch_for_retire, &doomed).await
                })
                .await;
        });
    }

    ctx.persistence.schedule(note_id, &branch_name);
    ctx.events.emit(HistoryEvent::VersionSaved { note_id });

    Ok(Some(CreatedEdit {
        version_id: edit_id,
        metadata,
        deleted_ids,
    }))
}
