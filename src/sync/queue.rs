//! Durable FIFO of mutations made while offline.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;
use std::sync::Arc;
use tracing::debug;

use crate::api::types::{Job, JobId};
use crate::cache::{blocking, CacheStorage};
use crate::error::StorageError;

/// Mutation kinds that can be queued
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum Operation {
  CreateJob,
  UpdateJob,
  DeleteJob,
}

impl Operation {
  pub fn as_str(&self) -> &'static str {
    match self {
      Self::CreateJob => "CREATE_JOB",
      Self::UpdateJob => "UPDATE_JOB",
      Self::DeleteJob => "DELETE_JOB",
    }
  }
}

impl fmt::Display for Operation {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.write_str(self.as_str())
  }
}

impl FromStr for Operation {
  type Err = String;

  fn from_str(s: &str) -> Result<Self, Self::Err> {
    match s {
      "CREATE_JOB" => Ok(Self::CreateJob),
      "UPDATE_JOB" => Ok(Self::UpdateJob),
      "DELETE_JOB" => Ok(Self::DeleteJob),
      other => Err(format!("unknown queue operation '{}'", other)),
    }
  }
}

/// An entry about to be enqueued (no sequence id yet).
#[derive(Debug, Clone, PartialEq)]
pub struct NewEntry {
  pub operation: Operation,
  /// Job the mutation applies to; `None` only for creates
  pub target_id: Option<JobId>,
  /// Placeholder a create introduces
  pub local_id: Option<JobId>,
  pub payload: Value,
}

impl NewEntry {
  pub fn create(local_id: JobId, payload: Value) -> Self {
    Self {
      operation: Operation::CreateJob,
      target_id: None,
      local_id: Some(local_id),
      payload,
    }
  }

  pub fn update(target_id: JobId, payload: Value) -> Self {
    Self {
      operation: Operation::UpdateJob,
      target_id: Some(target_id),
      local_id: None,
      payload,
    }
  }

  pub fn delete(target_id: JobId) -> Self {
    Self {
      operation: Operation::DeleteJob,
      target_id: Some(target_id),
      local_id: None,
      payload: Value::Null,
    }
  }
}

/// A persisted queue entry.
#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct QueueEntry {
  pub sequence_id: i64,
  pub operation: Operation,
  pub target_id: Option<JobId>,
  pub local_id: Option<JobId>,
  pub payload: Value,
  pub enqueued_at: DateTime<Utc>,
}

/// Sync queue stored inside the local store's database.
pub struct SyncQueue<S: CacheStorage> {
  storage: Arc<S>,
}

impl<S: CacheStorage> SyncQueue<S> {
  pub fn new(storage: Arc<S>) -> Self {
    Self { storage }
  }

  /// Persist an entry and return its sequence id. The entry is durable once
  /// this returns.
  pub async fn enqueue(&self, entry: NewEntry) -> Result<i64, StorageError> {
    let operation = entry.operation;
    let sequence_id = blocking(&self.storage, move |s| s.enqueue(&entry)).await?;
    debug!(sequence_id, %operation, "queued offline mutation");
    Ok(sequence_id)
  }

  /// Every pending entry in ascending sequence order, without removing any.
  pub async fn drain(&self) -> Result<Vec<QueueEntry>, StorageError> {
    blocking(&self.storage, |s| s.pending()).await
  }

  /// Remove an entry. Idempotent.
  pub async fn ack(&self, sequence_id: i64) -> Result<(), StorageError> {
    blocking(&self.storage, move |s| s.ack(sequence_id)).await
  }

  /// Rows that can no longer be decoded. They still count toward [`SyncQueue::len`].
  pub async fn undecodable(&self) -> Result<Vec<i64>, StorageError> {
    blocking(&self.storage, |s| s.undecodable()).await
  }

  pub async fn len(&self) -> Result<usize, StorageError> {
    blocking(&self.storage, |s| s.queue_len()).await
  }

  pub async fn is_empty(&self) -> Result<bool, StorageError> {
    Ok(self.len().await? == 0)
  }

  /// Ack a replayed create and rewrite its placeholder everywhere.
  pub async fn resolve_placeholder(
    &self,
    sequence_id: i64,
    placeholder: JobId,
    job: Job,
  ) -> Result<(), StorageError> {
    blocking(&self.storage, move |s| {
      s.resolve_placeholder(sequence_id, &placeholder, &job)
    })
    .await
  }

  /// Server id assigned to a placeholder by an earlier pass.
  pub async fn resolved_id(&self, placeholder: JobId) -> Result<Option<JobId>, StorageError> {
    blocking(&self.storage, move |s| s.resolved_id(&placeholder)).await
  }

  /// Placeholders whose create is still queued.
  pub async fn pending_placeholders(&self) -> Result<Vec<JobId>, StorageError> {
    let entries = self.drain().await?;
    Ok(
      entries
        .into_iter()
        .filter(|e| e.operation == Operation::CreateJob)
        .filter_map(|e| e.local_id)
        .collect(),
    )
  }
}

impl<S: CacheStorage> Clone for SyncQueue<S> {
  fn clone(&self) -> Self {
    Self {
      storage: Arc::clone(&self.storage),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::SqliteStorage;
  use serde_json::json;

  fn queue() -> SyncQueue<SqliteStorage> {
    SyncQueue::new(Arc::new(SqliteStorage::in_memory().unwrap()))
  }

  #[test]
  fn test_operation_parse() {
    for op in [Operation::CreateJob, Operation::UpdateJob, Operation::DeleteJob] {
      assert_eq!(op.as_str().parse::<Operation>().unwrap(), op);
    }
    assert!("PATCH_JOB".parse::<Operation>().is_err());
  }

  #[tokio::test]
  async fn test_drain_does_not_remove() {
    let queue = queue();
    queue
      .enqueue(NewEntry::update(JobId::Server(1), json!({"price": 10})))
      .await
      .unwrap();

    assert_eq!(queue.drain().await.unwrap().len(), 1);
    assert_eq!(queue.drain().await.unwrap().len(), 1);
  }

  #[tokio::test]
  async fn test_concurrent_enqueues_keep_per_entity_order() {
    let queue = queue();
    let mut handles = Vec::new();
    for job in 0..4i64 {
      let queue = queue.clone();
      handles.push(tokio::spawn(async move {
        for step in 0..5 {
          queue
            .enqueue(NewEntry::update(JobId::Server(job), json!({ "step": step })))
            .await
            .unwrap();
        }
      }));
    }
    for handle in handles {
      handle.await.unwrap();
    }

    let entries = queue.drain().await.unwrap();
    assert_eq!(entries.len(), 20);
    for job in 0..4i64 {
      let steps: Vec<i64> = entries
        .iter()
        .filter(|e| e.target_id == Some(JobId::Server(job)))
        .map(|e| e.payload["step"].as_i64().unwrap())
        .collect();
      assert_eq!(steps, vec![0, 1, 2, 3, 4]);
    }
  }

  #[tokio::test]
  async fn test_pending_placeholders() {
    let queue = queue();
    let local = JobId::new_placeholder();
    queue
      .enqueue(NewEntry::create(local.clone(), json!({})))
      .await
      .unwrap();
    queue.enqueue(NewEntry::delete(JobId::Server(3))).await.unwrap();

    assert_eq!(queue.pending_placeholders().await.unwrap(), vec![local]);
  }
}
