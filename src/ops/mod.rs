//! The four CRUD protocols over manifests and content.
//!
//! Every mutating operation serializes per note through the lock
//! manager; reads go straight to the freshest manifest. The operation
//! modules share one context struct wired up by the engine's composition
//! root — no ambient state.

pub mod create;
pub mod delete;
pub mod read;
pub mod update;

use std::sync::Arc;

use uuid::Uuid;

use crate::concurrency::{AtomicOperationCoordinator, LockManager, QueueService};
use crate::config::SettingsHandle;
use crate::events::EventBus;
use crate::manifest::{ManifestStore, VersionMetadata};
use crate::persistence::PersistenceService;
use crate::store::ContentStore;
use crate::worker::WorkerHandle;

/// Lock key serializing all mutations for one note
pub fn note_lock_key(note_id: Uuid) -> String {
    format!("note:{}", note_id)
}

/// Queue scope key for priority admission of note-level jobs
pub fn note_queue_key(note_id: Uuid) -> String {
    format!("queue:{}", note_id)
}

/// Shared dependencies for the operation modules.
#[derive(Clone)]
pub struct OpCtx {
    pub manifests: Arc<ManifestStore>,
    pub contents: Arc<ContentStore>,
    pub locks: Arc<LockManager>,
    pub queue: Arc<QueueService>,
    pub coordinator: Arc<AtomicOperationCoordinator>,
    pub worker: WorkerHandle,
    pub persistence: Arc<PersistenceService>,
    pub settings: SettingsHandle,
    pub events: EventBus,
}

/// One version as returned by history reads.
#[derive(Debug, Clone, PartialEq)]
pub struct HistoryEntry {
    pub version_id: Uuid,
    pub metadata: VersionMetadata,
}
