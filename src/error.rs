//! Error taxonomy shared by the store, the coordinator and the gateway.

use thiserror::Error;

use crate::api::types::JobId;

/// Local persistence is unusable. Never fatal: callers fall back to an empty
/// cache and keep talking to the network.
#[derive(Debug, Error)]
pub enum StorageError {
  #[error("storage unavailable: {0}")]
  Unavailable(String),
  #[error("sqlite: {0}")]
  Sqlite(#[from] rusqlite::Error),
  #[error("failed to encode cached document: {0}")]
  Encoding(#[from] serde_json::Error),
  #[error("storage task failed: {0}")]
  Task(#[from] tokio::task::JoinError),
}

/// Failure talking to the job API.
#[derive(Debug, Error)]
pub enum ApiError {
  #[error("network unreachable: {0}")]
  Unreachable(String),
  #[error("server error {status}: {detail}")]
  Server { status: u16, detail: String },
  #[error("session is not authorized")]
  Unauthorized,
  #[error("request rejected with {status}: {detail}")]
  Rejected { status: u16, detail: String },
  #[error("invalid response: {0}")]
  InvalidResponse(String),
  #[error("job {0} has no server id yet")]
  UnresolvedId(JobId),
}

impl ApiError {
  /// Map a non-success HTTP status onto the taxonomy.
  pub fn from_status(status: u16, detail: String) -> Self {
    match status {
      401 => Self::Unauthorized,
      408 | 429 => Self::Server { status, detail },
      s if s >= 500 => Self::Server { status, detail },
      _ => Self::Rejected { status, detail },
    }
  }

  /// Transient failures keep the queue entry for the next pass.
  /// Anything else is a permanent rejection.
  pub fn is_transient(&self) -> bool {
    matches!(
      self,
      Self::Unreachable(_) | Self::Server { .. } | Self::Unauthorized
    )
  }

  pub fn is_not_found(&self) -> bool {
    matches!(self, Self::Rejected { status: 404, .. })
  }
}

/// A queued entry targets a placeholder whose create never reached the server.
#[derive(Debug, Error)]
#[error("placeholder {placeholder} cannot be resolved: its create was dropped or is missing")]
pub struct ReconciliationError {
  pub placeholder: JobId,
}

/// Errors surfaced by the engine's read/write surface.
#[derive(Debug, Error)]
pub enum SyncError {
  #[error(transparent)]
  Storage(#[from] StorageError),
  #[error(transparent)]
  Api(#[from] ApiError),
  #[error("no authenticated session")]
  NotAuthenticated,
}

#[derive(Debug, Error)]
pub enum GatewayError {
  #[error(transparent)]
  Storage(#[from] StorageError),
  #[error("failed to precache {url}: {reason}")]
  Precache { url: String, reason: String },
  #[error("client surface: {0}")]
  Client(String),
  #[error("gateway task is not running")]
  Closed,
}
