use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::config::BranchSettings;
use super::migration::DEFAULT_BRANCH;

/// Current manifest schema version
pub const MANIFEST_VERSION: &str = "2";

/// Index of all notes with recorded history.
///
/// Invariant: at most one note id maps to any given path. Enforced by
/// `ManifestStore::upsert_note_entry` on every mutating write.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CentralManifest {
    pub version: String,
    pub notes: BTreeMap<Uuid, NoteEntry>,
}

impl Default for CentralManifest {
    fn default() -> Self {
        Self {
            version: MANIFEST_VERSION.to_string(),
            notes: BTreeMap::new(),
        }
    }
}

impl CentralManifest {
    /// Find the note id currently claiming a path, if any.
    pub fn note_at_path(&self, path: &str) -> Option<Uuid> {
        self.notes
            .iter()
            .find(|(_, entry)| entry.note_path == path)
            .map(|(id, _)| *id)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct NoteEntry {
    pub note_path: String,
    pub manifest_path: String,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

/// Per-note manifest: branches and their version metadata.
#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct NoteManifest {
    pub note_id: Uuid,
    pub note_path: String,
    pub current_branch: String,
    pub branches: BTreeMap<String, Branch>,
    pub created_at: DateTime<Utc>,
    pub last_modified: DateTime<Utc>,
}

impl NoteManifest {
    pub fn new(note_id: Uuid, note_path: String) -> Self {
        let now = Utc::now();
        let mut branches = BTreeMap::new();
        branches.insert(DEFAULT_BRANCH.to_string(), Branch::default());
        Self {
            note_id,
            note_path,
            current_branch: DEFAULT_BRANCH.to_string(),
            branches,
            created_at: now,
            last_modified: now,
        }
    }

    pub fn branch(&self, name: &str) -> Option<&Branch> {
        self.branches.get(name)
    }

    pub fn branch_mut(&mut self, name: &str) -> Option<&mut Branch> {
        self.branches.get_mut(name)
    }

    pub fn ensure_branch(&mut self, name: &str) -> &mut Branch {
        self.branches.entry(name.to_string()).or_default()
    }

    /// Scan all branches for the one containing a version id.
    pub fn branch_containing(&self, version_id: Uuid) -> Option<&str> {
        self.branches
            .iter()
            .find(|(_, branch)| branch.versions.contains_key(&version_id))
            .map(|(name, _)| name.as_str())
    }

    pub fn touch(&mut self) {
        self.last_modified = Utc::now();
    }

    /// Recompute `total_versions` on every branch. Called before each
    /// persist so the counter can never drift from the version maps.
    pub fn recount(&mut self) {
        for branch in self.branches.values_mut() {
            branch.recount();
        }
    }
}

/// One named line of versions for a note.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Branch {
    pub versions: BTreeMap<Uuid, VersionMetadata>,
    pub total_versions: usize,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub settings: Option<BranchSettings>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub state: Option<EditorStateSnapshot>,
}

impl Branch {
    pub fn recount(&mut self) {
        self.total_versions = self.versions.len();
    }

    /// Head = the entry with the highest version number, timestamp as a
    /// tiebreaker.
    pub fn head(&self) -> Option<(Uuid, &VersionMetadata)> {
        self.versions
            .iter()
            .max_by_key(|(_, meta)| (meta.version_number, meta.timestamp))
            .map(|(id, meta)| (*id, meta))
    }

    pub fn next_version_number(&self) -> u64 {
        self.head().map(|(_, meta)| meta.version_number + 1).unwrap_or(1)
    }

    /// Version ids ordered oldest-first by version number.
    pub fn ids_oldest_first(&self) -> Vec<Uuid> {
        let mut ids: Vec<(Uuid, u64)> = self
            .versions
            .iter()
            .map(|(id, meta)| (*id, meta.version_number))
            .collect();
        ids.sort_by_key(|(_, number)| *number);
        ids.into_iter().map(|(id, _)| id).collect()
    }
}

/// Metadata for one recorded version. The content itself lives in the
/// content store, addressed by the same id.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct VersionMetadata {
    pub version_number: u64,
    pub timestamp: DateTime<Utc>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    pub size: u64,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub compressed_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub uncompressed_size: Option<u64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub content_hash: Option<String>,
    pub word_count: usize,
    pub char_count: usize,
    pub line_count: usize,
}

/// Opaque editor state (cursor, scroll, folds) the host may stash per
/// branch. Round-trips through archives untouched.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(transparent)]
pub struct EditorStateSnapshot(pub serde_json::Value);

#[cfg(test)]
mod tests {
    use super::*;

    fn meta(number: u64) -> VersionMetadata {
        VersionMetadata {
            version_number: number,
            timestamp: Utc::now(),
            name: None,
            description: None,
            size: 10,
            compressed_size: None,
            uncompressed_size: Some(10),
            content_hash: Some(format!("sha256:{:x}", number)),
            word_count: 2,
            char_count: 10,
            line_count: 1,
        }
    }

    #[test]
    fn test_head_is_max_version_number() {
        let mut branch = Branch::default();
        let (a, b, c) = (Uuid::new_v4(), Uuid::new_v4(), Uuid::new_v4());
        branch.versions.insert(a, meta(1));
        branch.versions.insert(b, meta(3));
        branch.versions.insert(c, meta(2));
        branch.recount();

        assert_eq!(branch.head().unwrap().0, b);
        assert_eq!(branch.next_version_number(), 4);
        assert_eq!(branch.total_versions, 3);
        assert_eq!(branch.ids_oldest_first(), vec![a, c, b]);
    }

    #[test]
    fn test_branch_containing() {
        let mut manifest = NoteManifest::new(Uuid::new_v4(), "notes/a.md".into());
        let id = Uuid::new_v4();
        manifest.ensure_branch("draft").versions.insert(id, meta(1));
        manifest.recount();

        assert_eq!(manifest.branch_containing(id), Some("draft"));
        assert_eq!(manifest.branch_containing(Uuid::new_v4()), None);
    }

    #[test]
    fn test_path_lookup() {
        let mut central = CentralManifest::default();
        let id = Uuid::new_v4();
        let now = Utc::now();
        central.notes.insert(
            id,
            NoteEntry {
                note_path: "notes/a.md".into(),
                manifest_path: "db/notes/x/manifest.json".into(),
                created_at: now,
                last_modified: now,
            },
        );
        assert_eq!(central.note_at_path("notes/a.md"), Some(id));
        assert_eq!(central.note_at_path("notes/b.md"), None);
    }
}
