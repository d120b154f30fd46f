//! Replays the sync queue against the API once connectivity returns.
//!
//! A pass walks a snapshot of the queue in ascending sequence order and stops
//! at the first transient failure, so an entry is never replayed ahead of an
//! older entry that is still pending. Permanent rejections are dropped (acked)
//! and counted to keep a poison entry from blocking the queue forever.
//!
//! Placeholder handling:
//! - a successful create durably rewrites every queued reference to its
//!   placeholder and re-keys the cached job row
//! - the mapping outlives the pass, so a write made later against the old
//!   placeholder still reaches the server job
//! - an entry whose placeholder can no longer be resolved is dropped
//! - a create followed by a delete of the same placeholder inside one
//!   snapshot is cancelled locally: both entries, and everything targeting
//!   the placeholder in between, are acked without touching the network

use chrono::{DateTime, Utc};
use serde::Serialize;
use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use tokio::sync::watch;
use tracing::{debug, error, info, warn};

use super::queue::{Operation, QueueEntry, SyncQueue};
use crate::api::types::{Job, JobId};
use crate::api::JobApi;
use crate::cache::{CacheStorage, LocalStore};
use crate::error::{ApiError, ReconciliationError, StorageError};

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize)]
pub enum SyncState {
  #[default]
  Idle,
  Syncing,
}

/// Outcome of one replay pass
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize)]
pub struct SyncReport {
  /// Entries confirmed by the server
  pub synced: usize,
  /// Entries that failed, whether retained or dropped
  pub failed: usize,
  /// Entries abandoned after a permanent rejection or an unresolvable placeholder
  pub dropped: usize,
  /// Entries cancelled locally (create + delete of the same placeholder)
  pub cancelled: usize,
  /// Entries still queued after the pass
  pub remaining: usize,
  /// The pass stopped before reaching the end of the queue
  pub interrupted: bool,
}

/// Observable sync status for the presentation layer
#[derive(Debug, Clone, Default, PartialEq, Serialize)]
pub struct SyncStatus {
  pub state: SyncState,
  pub online: bool,
  pub pending: usize,
  /// Entries dropped since the engine started; drives the failure banner
  pub dropped_total: u64,
  pub last_report: Option<SyncReport>,
  pub last_synced_at: Option<DateTime<Utc>>,
}

enum Outcome {
  Synced,
  Cancelled,
  Dropped,
  Retry,
}

enum Target {
  Ready(JobId),
  Cancelled,
  Orphaned(JobId),
  Missing,
}

/// Bookkeeping for a single pass
struct PassContext {
  /// placeholder -> server id, for creates replayed in this pass
  resolved: HashMap<JobId, JobId>,
  /// placeholders deleted before their create was ever replayed
  doomed: HashSet<JobId>,
  cancelled: HashSet<JobId>,
}

impl PassContext {
  fn new(entries: &[QueueEntry]) -> Self {
    let creates: HashSet<&JobId> = entries
      .iter()
      .filter(|e| e.operation == Operation::CreateJob)
      .filter_map(|e| e.local_id.as_ref())
      .collect();

    let doomed = entries
      .iter()
      .filter(|e| e.operation == Operation::DeleteJob)
      .filter_map(|e| e.target_id.as_ref())
      .filter(|id| creates.contains(id))
      .cloned()
      .collect();

    Self {
      resolved: HashMap::new(),
      doomed,
      cancelled: HashSet::new(),
    }
  }

  fn target(&self, entry: &QueueEntry) -> Target {
    let Some(target) = entry.target_id.as_ref() else {
      return Target::Missing;
    };
    if !target.is_placeholder() {
      return Target::Ready(target.clone());
    }
    if self.cancelled.contains(target) {
      return Target::Cancelled;
    }
    match self.resolved.get(target) {
      Some(server_id) => Target::Ready(server_id.clone()),
      None => Target::Orphaned(target.clone()),
    }
  }
}

/// Clears the syncing flag when a pass ends, however it ends.
struct PassGuard<'a>(&'a AtomicBool);

impl Drop for PassGuard<'_> {
  fn drop(&mut self) {
    self.0.store(false, Ordering::Release);
  }
}

pub struct Coordinator<A: JobApi, S: CacheStorage> {
  api: Arc<A>,
  store: LocalStore<S>,
  queue: SyncQueue<S>,
  syncing: AtomicBool,
  status: Arc<watch::Sender<SyncStatus>>,
}

impl<A: JobApi, S: CacheStorage> Coordinator<A, S> {
  pub fn new(
    api: Arc<A>,
    store: LocalStore<S>,
    queue: SyncQueue<S>,
    status: Arc<watch::Sender<SyncStatus>>,
  ) -> Self {
    Self {
      api,
      store,
      queue,
      syncing: AtomicBool::new(false),
      status,
    }
  }

  pub fn state(&self) -> SyncState {
    if self.syncing.load(Ordering::Acquire) {
      SyncState::Syncing
    } else {
      SyncState::Idle
    }
  }

  /// Run one replay pass followed by a full resynchronization.
  ///
  /// Returns `None` without doing anything if a pass is already running.
  pub async fn run_pass(&self) -> Option<SyncReport> {
    if self
      .syncing
      .compare_exchange(false, true, Ordering::AcqRel, Ordering::Acquire)
      .is_err()
    {
      debug!("sync pass already running, trigger ignored");
      return None;
    }
    let _guard = PassGuard(&self.syncing);
    self.status.send_modify(|s| s.state = SyncState::Syncing);

    let mut report = match self.replay().await {
      Ok(report) => report,
      Err(e) => {
        error!(error = %e, "sync pass aborted, local storage failed");
        SyncReport {
          interrupted: true,
          ..SyncReport::default()
        }
      }
    };

    self.resync().await;

    report.remaining = match self.queue.len().await {
      Ok(n) => n,
      Err(e) => {
        warn!(error = %e, "could not count remaining queue entries");
        0
      }
    };

    info!(
      synced = report.synced,
      failed = report.failed,
      dropped = report.dropped,
      cancelled = report.cancelled,
      remaining = report.remaining,
      "sync pass finished"
    );

    self.status.send_modify(|s| {
      s.state = SyncState::Idle;
      s.pending = report.remaining;
      s.dropped_total += report.dropped as u64;
      if !report.interrupted {
        s.last_synced_at = Some(Utc::now());
      }
      s.last_report = Some(report.clone());
    });

    Some(report)
  }

  async fn replay(&self) -> Result<SyncReport, StorageError> {
    let mut report = SyncReport::default();

    for sequence_id in self.queue.undecodable().await? {
      warn!(sequence_id, "dropping undecodable queue entry");
      self.queue.ack(sequence_id).await?;
      report.failed += 1;
      report.dropped += 1;
    }

    let entries = self.queue.drain().await?;
    if entries.is_empty() {
      return Ok(report);
    }

    info!(entries = entries.len(), "replaying queued mutations");
    let mut ctx = PassContext::new(&entries);

    for entry in &entries {
      let outcome = match entry.operation {
        Operation::CreateJob => self.replay_create(entry, &mut ctx).await?,
        Operation::UpdateJob | Operation::DeleteJob => self.replay_mutation(entry, &ctx).await?,
      };

      match outcome {
        Outcome::Synced => report.synced += 1,
        Outcome::Cancelled => report.cancelled += 1,
        Outcome::Dropped => {
          report.failed += 1;
          report.dropped += 1;
        }
        Outcome::Retry => {
          report.failed += 1;
          report.interrupted = true;
          break;
        }
      }
    }

    Ok(report)
  }

  async fn replay_create(
    &self,
    entry: &QueueEntry,
    ctx: &mut PassContext,
  ) -> Result<Outcome, StorageError> {
    let sequence_id = entry.sequence_id;

    if let Some(local) = entry.local_id.as_ref().filter(|id| ctx.doomed.contains(*id)) {
      debug!(sequence_id, placeholder = %local, "create cancelled by a later delete");
      self.queue.ack(sequence_id).await?;
      self.forget_job(local).await;
      ctx.cancelled.insert(local.clone());
      return Ok(Outcome::Cancelled);
    }

    match self.api.create_job(&entry.payload).await {
      Ok(job) => {
        let server_id = job.id.clone();
        match entry.local_id.clone() {
          Some(local) => {
            self
              .queue
              .resolve_placeholder(sequence_id, local.clone(), job)
              .await?;
            info!(sequence_id, placeholder = %local, %server_id, "placeholder resolved");
            ctx.resolved.insert(local, server_id);
          }
          None => {
            self.queue.ack(sequence_id).await?;
            self.cache_job(job).await;
          }
        }
        Ok(Outcome::Synced)
      }
      Err(err) => {
        let outcome = self.fail(entry, err).await?;
        if matches!(outcome, Outcome::Dropped) {
          if let Some(local) = &entry.local_id {
            self.forget_job(local).await;
          }
        }
        Ok(outcome)
      }
    }
  }

  async fn replay_mutation(
    &self,
    entry: &QueueEntry,
    ctx: &PassContext,
  ) -> Result<Outcome, StorageError> {
    let sequence_id = entry.sequence_id;

    let target = match ctx.target(entry) {
      Target::Ready(id) => id,
      Target::Cancelled => {
        debug!(sequence_id, "entry targets a cancelled placeholder");
        self.queue.ack(sequence_id).await?;
        return Ok(Outcome::Cancelled);
      }
      Target::Orphaned(placeholder) => match self.queue.resolved_id(placeholder.clone()).await? {
        // Resolved by an earlier pass
        Some(server_id) => server_id,
        None => {
          let err = ReconciliationError { placeholder };
          warn!(sequence_id, operation = %entry.operation, error = %err, "dropping queued mutation");
          self.queue.ack(sequence_id).await?;
          return Ok(Outcome::Dropped);
        }
      },
      Target::Missing => {
        warn!(sequence_id, operation = %entry.operation, "queued mutation has no target, dropping");
        self.queue.ack(sequence_id).await?;
        return Ok(Outcome::Dropped);
      }
    };

    let result = if entry.operation == Operation::UpdateJob {
      self
        .api
        .update_job(&target, &entry.payload)
        .await
        .map(Some)
    } else {
      match self.api.delete_job(&target).await {
        Ok(()) => Ok(None),
        // Already gone: delete is idempotent by id
        Err(e) if e.is_not_found() => Ok(None),
        Err(e) => Err(e),
      }
    };

    match result {
      Ok(updated) => {
        self.queue.ack(sequence_id).await?;
        match updated {
          Some(job) => self.cache_job(job).await,
          None => self.forget_job(&target).await,
        }
        debug!(sequence_id, operation = %entry.operation, job = %target, "replayed");
        Ok(Outcome::Synced)
      }
      Err(err) => self.fail(entry, err).await,
    }
  }

  async fn fail(&self, entry: &QueueEntry, err: ApiError) -> Result<Outcome, StorageError> {
    let sequence_id = entry.sequence_id;
    if err.is_transient() {
      warn!(
        sequence_id,
        operation = %entry.operation,
        error = %err,
        "transient failure, stopping pass and keeping the rest of the queue"
      );
      return Ok(Outcome::Retry);
    }

    warn!(
      sequence_id,
      operation = %entry.operation,
      error = %err,
      "mutation rejected by the server, dropping entry"
    );
    self.queue.ack(sequence_id).await?;
    Ok(Outcome::Dropped)
  }

  /// Refetch canonical collections and overwrite the local store.
  ///
  /// Placeholder jobs whose create is still queued survive the overwrite, and
  /// still-queued edits are laid back on top of the fresh server copies.
  pub async fn resync(&self) {
    let retain: Vec<String> = match self.queue.pending_placeholders().await {
      Ok(ids) => ids.iter().map(ToString::to_string).collect(),
      Err(e) => {
        warn!(error = %e, "could not read queue before resync");
        Vec::new()
      }
    };

    let (jobs, today, stats, user) = futures::join!(
      self.api.list_jobs(),
      self.api.get_today_jobs(),
      self.api.get_stats(),
      self.api.get_current_user(),
    );

    match jobs {
      Ok(jobs) => {
        if let Err(e) = self.store.replace_all(jobs, retain).await {
          warn!(error = %e, "failed to store refetched jobs");
        }
      }
      Err(e) => warn!(error = %e, "resync: failed to refetch jobs"),
    }
    match today {
      Ok(jobs) => {
        for job in jobs {
          self.cache_job(job).await;
        }
      }
      Err(e) => warn!(error = %e, "resync: failed to refetch today's jobs"),
    }
    match stats {
      Ok(stats) => {
        if let Err(e) = self.store.put_singleton(stats).await {
          warn!(error = %e, "failed to store stats");
        }
      }
      Err(e) => warn!(error = %e, "resync: failed to refetch stats"),
    }
    match user {
      Ok(user) => {
        if let Err(e) = self.store.put_singleton(user).await {
          warn!(error = %e, "failed to store user profile");
        }
      }
      Err(e) => warn!(error = %e, "resync: failed to refetch user profile"),
    }

    self.overlay_pending().await;
  }

  /// Re-apply still-queued edits and deletes of server jobs to the store.
  pub async fn overlay_pending(&self) {
    let entries = match self.queue.drain().await {
      Ok(entries) => entries,
      Err(e) => {
        warn!(error = %e, "could not read queue to overlay pending edits");
        return;
      }
    };

    for entry in entries {
      let Some(target) = entry.target_id.filter(|id| !id.is_placeholder()) else {
        continue;
      };
      match entry.operation {
        Operation::UpdateJob => match self.store.get::<Job>(target.to_string()).await {
          Ok(Some(mut job)) => {
            job.apply_patch(&entry.payload);
            self.cache_job(job).await;
          }
          Ok(None) => {}
          Err(e) => warn!(error = %e, job = %target, "could not overlay pending edit"),
        },
        Operation::DeleteJob => self.forget_job(&target).await,
        Operation::CreateJob => {}
      }
    }
  }

  async fn cache_job(&self, job: Job) {
    let id = job.id.clone();
    if let Err(e) = self.store.put(job).await {
      warn!(error = %e, job = %id, "failed to cache job");
    }
  }

  async fn forget_job(&self, id: &JobId) {
    if let Err(e) = self.store.remove::<Job>(id.to_string()).await {
      warn!(error = %e, job = %id, "failed to remove cached job");
    }
  }
}
