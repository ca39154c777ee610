//! Engine event bus.
//!
//! Events are fanned out over a broadcast channel; the host subscribes and
//! forwards them to whatever notification API it exposes. Emission is
//! fire-and-forget — a missing subscriber is not an error.

use serde::Serialize;
use tokio::sync::broadcast;
use uuid::Uuid;

/// Number of events buffered per subscriber before lagging
const EVENT_BUFFER: usize = 64;

#[derive(Debug, Clone, Serialize, PartialEq)]
#[serde(tag = "type", rename_all = "camelCase")]
pub enum HistoryEvent {
    #[serde(rename_all = "camelCase")]
    VersionSaved {
        note_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    VersionDeleted {
        note_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    HistoryDeleted {
        note_id: Uuid,
    },
    #[serde(rename_all = "camelCase")]
    VersionUpdated {
        note_id: Uuid,
        version_id: Uuid,
        #[serde(skip_serializing_if = "Option::is_none")]
        name: Option<String>,
        #[serde(skip_serializing_if = "Option::is_none")]
        description: Option<String>,
    },
    #[serde(rename_all = "camelCase")]
    BranchPersisted {
        note_id: Uuid,
        branch: String,
    },
}

#[derive(Clone)]
pub struct EventBus {
    tx: broadcast::Sender<HistoryEvent>,
}

impl EventBus {
    pub fn new() -> Self {
        let (tx, _) = broadcast::channel(EVENT_BUFFER);
        Self { tx }
    }

    pub fn subscribe(&self) -> broadcast::Receiver<HistoryEvent> {
        self.tx.subscribe()
    }

    pub fn emit(&self, event: HistoryEvent) {
        log::debug!("Event bus: {:?}", event);
        let _ = self.tx.send(event);
    }
}

impl Default for EventBus {
    fn default() -> Self {
        Self::new()
    }
}
