//! Offline-first sync core for the FieldSync job-dispatch app.

pub mod api;
pub mod cache;
pub mod config;
pub mod connectivity;
pub mod db;
pub mod engine;
pub mod error;
pub mod gateway;
pub mod sync;

pub use config::Config;
pub use connectivity::ConnectivityMonitor;
pub use engine::{MutationOutcome, SyncEngine};
pub use error::{ApiError, GatewayError, ReconciliationError, StorageError, SyncError};
