//! Read protocol. Lookup misses are `None`/empty, never errors, and
//! reads always re-fetch the manifest rather than trusting a cache.

use uuid::Uuid;

use super::{HistoryEntry, OpCtx};
use crate::error::Result;

/// Fetch one version's content. With no branch given, all branches are
/// scanned for the version id.
pub async fn get_edit_content(
    ctx: &OpCtx,
    note_id: Uuid,
    edit_id: Uuid,
    branch: Option<&str>,
) -> Result<Option<String>> {
    let Some(manifest) = ctx.manifests.load_note(note_id).await? else {
        return Ok(None);
    };
    let branch_name = match branch {
        Some(name) => {
            let holds = manifest
                .branch(name)
                .map(|b| b.versions.contains_key(&edit_id))
                .unwrap_or(false);
            if !holds {
                return Ok(None);
            }
            name.to_string()
        }
        None => match manifest.branch_containing(edit_id) {
            Some(name) => name.to_string(),
            None => return Ok(None),
        },
    };
    ctx.contents.get_content(note_id, &branch_name, edit_id).await
}

/// All versions of the current branch, newest first. Empty when the
/// note or branch is absent.
pub async fn get_edit_history(ctx: &OpCtx, note_id: Uuid) -> Result<Vec<HistoryEntry>> {
    let Some(manifest) = ctx.manifests.load_note(note_id).await? else {
        return Ok(Vec::new());
    };
    let Some(branch) = manifest.branch(&manifest.current_branch) else {
        return Ok(Vec::new());
    };
    let mut entries: Vec<HistoryEntry> = branch
        .versions
        .iter()
        .map(|(id, metadata)| HistoryEntry {
            version_id: *id,
            metadata: metadata.clone(),
        })
        .collect();
    entries.sort_by(|a, b| b.metadata.version_number.cmp(&a.metadata.version_number));
    Ok(entries)
}

/// Per-branch summary for one note.
#[derive(Debug, Clone)]
pub struct BranchSummary {
    pub name: String,
    pub version_count: usize,
    pub is_current: bool,
}

/// Derived overview of a note's branches — the timeline view's data
/// source.
#[derive(Debug, Clone)]
pub struct NoteOverview {
    pub note_path: String,
    pub current_branch: String,
    pub branches: Vec<BranchSummary>,
}

pub async fn get_note_overview(ctx: &OpCtx, note_id: Uuid) -> Result<Option<NoteOverview>> {
    let Some(manifest) = ctx.manifests.load_note(note_id).await? else {
        return Ok(None);
    };
    let branches = manifest
        .branches
        .iter()
        .map(|(name, branch)| BranchSummary {
            name: name.clone(),
            version_count: branch.total_versions,
            is_current: *name == manifest.current_branch,
        })
        .collect();
    Ok(Some(NoteOverview {
        note_path: manifest.note_path.clone(),
        current_branch: manifest.current_branch.clone(),
        branches,
    }))
}
