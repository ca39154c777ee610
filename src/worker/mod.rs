//! Offload worker for CPU-heavy operations.
//!
//! Hashing, diff computation, patch replay and archive codec work run on
//! a dedicated thread, driven by a request enum over an mpsc channel with
//! a oneshot reply per request. Buffers are moved into requests and back
//! out of replies — ownership transfer, not sharing. A closed channel
//! (worker thread gone or never started) surfaces as `WorkerUnavailable`.

use sha2::{Digest, Sha256};
use tokio::sync::{mpsc, oneshot};

use crate::error::{HistoryError, Result};
use crate::persistence::archive::{self, ArchiveBundle, ArchiveError};
use crate::store::diff::{self, PatchError, PatchOp};

/// Request backlog before senders start waiting
const WORKER_QUEUE_DEPTH: usize = 64;

pub enum WorkerRequest {
    HashContent {
        content: Vec<u8>,
        reply: oneshot::Sender<String>,
    },
    ComputeDiff {
        old: String,
        new: String,
        reply: oneshot::Sender<Vec<PatchOp>>,
    },
    ApplyPatchChain {
        base: String,
        patches: Vec<Vec<PatchOp>>,
        reply: oneshot::Sender<std::result::Result<String, PatchError>>,
    },
    BuildArchive {
        bundle: Box<ArchiveBundle>,
        reply: oneshot::Sender<std::result::Result<Vec<u8>, ArchiveError>>,
    },
    ParseArchive {
        bytes: Vec<u8>,
        reply: oneshot::Sender<std::result::Result<ArchiveBundle, ArchiveError>>,
    },
}

#[derive(Clone)]
pub struct WorkerHandle {
    tx: mpsc::Sender<WorkerRequest>,
}

/// Start the worker thread. Dropping every handle closes the channel and
/// ends the thread.
pub fn spawn_worker() -> WorkerHandle {
    let (tx, mut rx) = mpsc::channel::<WorkerRequest>(WORKER_QUEUE_DEPTH);

    std::thread::Builder::new()
        .name("mneme-worker".to_string())
        .spawn(move || {
            while let Some(request) = rx.blocking_recv() {
                handle_request(request);
            }
            log::debug!("Worker: channel closed, thread exiting");
        })
        .expect("failed to spawn worker thread");

    WorkerHandle { tx }
}

fn handle_request(request: WorkerRequest) {
    match request {
        WorkerRequest::HashContent { content, reply } => {
            let _ = reply.send(hash_bytes(&content));
        }
        WorkerRequest::ComputeDiff { old, new, reply } => {
            let _ = reply.send(diff::compute_patch(&old, &new));
        }
        WorkerRequest::ApplyPatchChain {
            base,
            patches,
            reply,
        } => {
            let mut current = Ok(base);
            for patch in &patches {
                current = match current {
                    Ok(content) => diff::apply_patch(&content, patch),
                    err => err,
                };
            }
            let _ = reply.send(current);
        }
        WorkerRequest::BuildArchive { bundle, reply } => {
            let _ = reply.send(archive::build_archive(&bundle));
        }
        WorkerRequest::ParseArchive { bytes, reply } => {
            let _ = reply.send(archive::parse_archive(&bytes));
        }
    }
}

/// SHA-256 content address, rendered `sha256:<hex>`.
fn hash_bytes(bytes: &[u8]) -> String {
    let mut hasher = Sha256::new();
    hasher.update(bytes);
    format!("sha256:{}", hex::encode(hasher.finalize()))
}

impl WorkerHandle {
    async fn request<T>(
        &self,
        request: WorkerRequest,
        rx: oneshot::Receiver<T>,
    ) -> Result<T> {
        self.tx
            .send(request)
            .await
            .map_err(|_| HistoryError::WorkerUnavailable)?;
        rx.await.map_err(|_| HistoryError::WorkerUnavailable)
    }

    pub async fn hash_content(&self, content: &str) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.request(
            WorkerRequest::HashContent {
                content: content.as_bytes().to_vec(),
                reply,
            },
            rx,
        )
        .await
    }

    pub async fn compute_diff(&self, old: String, new: String) -> Result<Vec<PatchOp>> {
        let (reply, rx) = oneshot::channel();
        self.request(WorkerRequest::ComputeDiff { old, new, reply }, rx)
            .await
    }

    /// Replay a chain of patches (oldest first) against a full snapshot.
    pub async fn apply_patch_chain(
        &self,
        base: String,
        patches: Vec<Vec<PatchOp>>,
    ) -> Result<String> {
        let (reply, rx) = oneshot::channel();
        self.request(WorkerRequest::ApplyPatchChain { base, patches, reply }, rx)
            .await?
            .map_err(|e| HistoryError::IntegrityCheckFailed(e.to_string()))
    }

    pub async fn build_archive(&self, bundle: ArchiveBundle) -> Result<Vec<u8>> {
        let (reply, rx) = oneshot::channel();
        self.request(
            WorkerRequest::BuildArchive {
                bundle: Box::new(bundle),
                reply,
            },
            rx,
        )
        .await?
        .map_err(archive_error)
    }

    pub async fn parse_archive(&self, bytes: Vec<u8>) -> Result<ArchiveBundle> {
        let (reply, rx) = oneshot::channel();
        self.request(WorkerRequest::ParseArchive { bytes, reply }, rx)
            .await?
            .map_err(archive_error)
    }
}

fn archive_error(e: ArchiveError) -> HistoryError {
    match e {
        ArchiveError::CapacityExceeded(msg) => HistoryError::CapacityExceeded(msg),
        other => HistoryError::DiskReadFailed(other.to_string()),
    }
}
