//! Offline mutation queue and the coordinator that replays it.

mod coordinator;
mod queue;

pub use coordinator::{Coordinator, SyncReport, SyncState, SyncStatus};
pub use queue::{NewEntry, Operation, QueueEntry, SyncQueue};
