//! One-time migration of legacy note manifests.
//!
//! Early manifests had no branches: a flat `versions` map sat at the top
//! level. On load these are folded into a single default branch and
//! persisted back, so the rest of the engine only ever sees the branched
//! shape.

use std::collections::BTreeMap;

use serde::Deserialize;
use serde_json::Value;
use uuid::Uuid;

use super::models::{Branch, NoteManifest, VersionMetadata};

/// Branch name legacy histories are folded into
pub const DEFAULT_BRANCH: &str = "main";

#[derive(Deserialize)]
#[serde(rename_all = "camelCase")]
struct LegacyNoteManifest {
    note_id: Uuid,
    note_path: String,
    versions: BTreeMap<Uuid, VersionMetadata>,
    created_at: chrono::DateTime<chrono::Utc>,
    last_modified: chrono::DateTime<chrono::Utc>,
}

/// Deserialize a note manifest, migrating the legacy flat shape when
/// encountered. Returns the manifest and whether a migration happened
/// (the caller persists migrated manifests back in place).
pub fn deserialize_note_manifest(raw: Value) -> serde_json::Result<(NoteManifest, bool)> {
    if raw.get("branches").is_some() {
        let manifest: NoteManifest = serde_json::from_value(raw)?;
        return Ok((manifest, false));
    }

    let legacy: LegacyNoteManifest = serde_json::from_value(raw)?;
    log::info!(
        "Manifest migration: folding {} legacy version(s) of note {} into branch '{}'",
        legacy.versions.len(),
        legacy.note_id,
        DEFAULT_BRANCH,
    );

    let mut branch = Branch {
        versions: legacy.versions,
        ..Default::default()
    };
    branch.recount();

    let mut branches = BTreeMap::new();
    branches.insert(DEFAULT_BRANCH.to_string(), branch);

    Ok((
        NoteManifest {
            note_id: legacy.note_id,
            note_path: legacy.note_path,
            current_branch: DEFAULT_BRANCH.to_string(),
            branches,
            created_at: legacy.created_at,
            last_modified: legacy.last_modified,
        },
        true,
    ))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_legacy_manifest_is_folded_into_default_branch() {
        let note_id = Uuid::new_v4();
        let version_id = Uuid::new_v4();
        let mut versions = serde_json::Map::new();
        versions.insert(
            version_id.to_string(),
            json!({
                "versionNumber": 1,
                "timestamp": "2025-01-01T00:00:00Z",
                "size": 5,
                "wordCount": 1,
                "charCount": 5,
                "lineCount": 1
            }),
        );
        let raw = json!({
            "noteId": note_id,
            "notePath": "notes/a.md",
            "versions": versions,
            "createdAt": "2025-01-01T00:00:00Z",
            "lastModified": "2025-01-02T00:00:00Z"
        });

        let (manifest, migrated) = deserialize_note_manifest(raw).unwrap();
        assert!(migrated);
        assert_eq!(manifest.current_branch, DEFAULT_BRANCH);
        let branch = manifest.branch(DEFAULT_BRANCH).unwrap();
        assert_eq!(branch.total_versions, 1);
        assert!(branch.versions.contains_key(&version_id));
    }

    #[test]
    fn test_branched_manifest_passes_through() {
        let manifest = NoteManifest::new(Uuid::new_v4(), "notes/a.md".into());
        let raw = serde_json::to_value(&manifest).unwrap();
        let (parsed, migrated) = deserialize_note_manifest(raw).unwrap();
        assert!(!migrated);
        assert_eq!(parsed.note_id, manifest.note_id);
    }
}
