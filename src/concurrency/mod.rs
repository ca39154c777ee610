//! Serialization primitives.
//!
//! `LockManager` is the exclusion primitive: per-key FIFO serialization of
//! mutating operations. `QueueService` adds priority admission on top of
//! its own per-key queues. `AtomicOperationCoordinator` is advisory
//! tracking only and never blocks anything.

mod atomic;
mod lock;
mod queue;

pub use atomic::AtomicOperationCoordinator;
pub use lock::LockManager;
pub use queue::{Priority, QueueService};
