//! The application-facing sync engine.
//!
//! One [`SyncEngine`] owns the local store, the sync queue and the
//! coordinator. Its lifecycle is bound to the session: [`SyncEngine::start`]
//! on login, [`SyncEngine::stop`] or [`SyncEngine::logout`] when it ends.

use chrono::Local;
use serde_json::Value;
use std::future::{ready, Ready};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, PoisonError};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

use crate::api::{Job, JobApi, JobId, Stats, UserProfile};
use crate::cache::{CacheResult, CacheSource, CacheStorage, LocalStore};
use crate::config::SyncConfig;
use crate::connectivity::ConnectivityMonitor;
use crate::error::{ApiError, SyncError};
use crate::sync::{Coordinator, NewEntry, QueueEntry, SyncQueue, SyncReport, SyncStatus};

/// What happened to a mutation.
#[derive(Debug, Clone, PartialEq)]
pub enum MutationOutcome {
  /// Confirmed by the server. Holds the authoritative job (`None` for deletes).
  Applied(Option<Job>),
  /// Stored for replay. Holds the optimistic local copy (`None` for deletes).
  Queued { sequence_id: i64, job: Option<Job> },
}

impl MutationOutcome {
  pub fn job(&self) -> Option<&Job> {
    match self {
      Self::Applied(job) | Self::Queued { job, .. } => job.as_ref(),
    }
  }

  pub fn is_queued(&self) -> bool {
    matches!(self, Self::Queued { .. })
  }
}

pub struct SyncEngine<A: JobApi, S: CacheStorage> {
  api: Arc<A>,
  store: LocalStore<S>,
  queue: SyncQueue<S>,
  coordinator: Arc<Coordinator<A, S>>,
  monitor: ConnectivityMonitor,
  status: Arc<watch::Sender<SyncStatus>>,
  authenticated: AtomicBool,
  retry_interval: Duration,
  worker: Mutex<Option<JoinHandle<()>>>,
}

impl<A: JobApi, S: CacheStorage> SyncEngine<A, S> {
  pub fn new(api: Arc<A>, storage: S, monitor: ConnectivityMonitor, config: &SyncConfig) -> Self {
    let storage = Arc::new(storage);
    let store = LocalStore::from_shared(Arc::clone(&storage));
    let queue = SyncQueue::new(storage);
    let (status, _) = watch::channel(SyncStatus {
      online: monitor.is_online(),
      ..SyncStatus::default()
    });
    let status = Arc::new(status);
    let coordinator = Arc::new(Coordinator::new(
      Arc::clone(&api),
      store.clone(),
      queue.clone(),
      Arc::clone(&status),
    ));

    Self {
      api,
      store,
      queue,
      coordinator,
      monitor,
      status,
      authenticated: AtomicBool::new(false),
      retry_interval: config.retry_interval(),
      worker: Mutex::new(None),
    }
  }

  /// Mark the session authenticated without background triggers.
  /// Syncing then only happens through [`SyncEngine::sync_now`].
  pub fn resume_session(&self) {
    self.authenticated.store(true, Ordering::Release);
  }

  /// Begin a session: sync on every reconnect and retry periodically while
  /// entries are waiting.
  pub async fn start(&self) {
    self.resume_session();
    self.refresh_pending().await;

    let mut online_rx = self.monitor.subscribe();
    let coordinator = Arc::clone(&self.coordinator);
    let status = Arc::clone(&self.status);
    let retry_interval = self.retry_interval;

    let handle = tokio::spawn(async move {
      let mut ticker = tokio::time::interval(retry_interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      ticker.reset();
      // Starting while online counts as a reconnect
      let mut trigger = *online_rx.borrow_and_update();

      loop {
        if trigger {
          let coordinator = Arc::clone(&coordinator);
          // Detached so stopping the engine never cancels a pass midway
          tokio::spawn(async move {
            coordinator.run_pass().await;
          });
        }

        tokio::select! {
          changed = online_rx.changed() => {
            if changed.is_err() {
              break;
            }
            let online = *online_rx.borrow_and_update();
            status.send_modify(|s| s.online = online);
            if online {
              debug!("connectivity restored, triggering sync");
            }
            trigger = online;
          }
          _ = ticker.tick() => {
            let current = status.borrow().clone();
            trigger = current.online && current.pending > 0;
          }
        }
      }
    });

    let previous = self
      .worker
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .replace(handle);
    if let Some(previous) = previous {
      previous.abort();
    }
    info!("sync engine started");
  }

  /// End the session without touching local data.
  pub fn stop(&self) {
    self.authenticated.store(false, Ordering::Release);
    let worker = self
      .worker
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
      .take();
    if let Some(worker) = worker {
      worker.abort();
      info!("sync engine stopped");
    }
  }

  /// End the session and wipe cached documents and queued mutations.
  pub async fn logout(&self) -> Result<(), SyncError> {
    self.stop();
    self.store.clear().await?;
    self.status.send_modify(|s| {
      *s = SyncStatus {
        online: s.online,
        ..SyncStatus::default()
      }
    });
    info!("local data cleared");
    Ok(())
  }

  pub fn is_authenticated(&self) -> bool {
    self.authenticated.load(Ordering::Acquire)
  }

  fn can_reach_network(&self) -> bool {
    self.is_authenticated() && self.monitor.is_online()
  }

  /// Run a pass right away. `Ok(None)` when offline or a pass is already running.
  pub async fn sync_now(&self) -> Result<Option<SyncReport>, SyncError> {
    if !self.is_authenticated() {
      return Err(SyncError::NotAuthenticated);
    }
    if !self.monitor.is_online() {
      debug!("offline, sync request ignored");
      return Ok(None);
    }
    Ok(self.coordinator.run_pass().await)
  }

  pub fn status(&self) -> SyncStatus {
    self.status.borrow().clone()
  }

  pub fn subscribe_status(&self) -> watch::Receiver<SyncStatus> {
    self.status.subscribe()
  }

  /// Entries waiting for replay, oldest first.
  pub async fn pending(&self) -> Result<Vec<QueueEntry>, SyncError> {
    Ok(self.queue.drain().await?)
  }

  async fn refresh_pending(&self) {
    match self.queue.len().await {
      Ok(pending) => self.status.send_modify(|s| s.pending = pending),
      Err(e) => warn!(error = %e, "could not count queued mutations"),
    }
  }

  async fn has_pending(&self) -> bool {
    !matches!(self.queue.is_empty().await, Ok(true))
  }

  async fn retained_placeholders(&self) -> Vec<String> {
    match self.queue.pending_placeholders().await {
      Ok(ids) => ids.iter().map(ToString::to_string).collect(),
      Err(e) => {
        warn!(error = %e, "could not read queue");
        Vec::new()
      }
    }
  }

  // Reads

  /// All jobs, network-first with offline fallback.
  pub async fn jobs(&self) -> CacheResult<Vec<Job>> {
    if !self.can_reach_network() {
      return self.store.fetch_list(Vec::new(), offline::<Vec<Job>>).await;
    }

    let retain = self.retained_placeholders().await;
    let result = self
      .store
      .fetch_list(retain, || self.api.list_jobs())
      .await;

    if result.source == CacheSource::Network && self.has_pending().await {
      // Server copy does not know about queued edits yet
      self.coordinator.overlay_pending().await;
      if let Ok(jobs) = self.store.get_all::<Job>().await {
        return result.map(|_| jobs);
      }
    }
    result
  }

  /// Jobs scheduled for today. Offline, the cached jobs are filtered by date.
  pub async fn today_jobs(&self) -> CacheResult<Vec<Job>> {
    if self.can_reach_network() {
      match self.api.get_today_jobs().await {
        Ok(jobs) => {
          for job in &jobs {
            if let Err(e) = self.store.put(job.clone()).await {
              warn!(error = %e, job = %job.id, "failed to cache job");
            }
          }
          return CacheResult::from_network(jobs);
        }
        Err(e) => debug!(error = %e, "today's jobs unavailable, serving cache"),
      }
    }

    let today = Local::now().date_naive();
    self
      .store
      .fetch_list(Vec::new(), offline::<Vec<Job>>)
      .await
      .map(|jobs| jobs.into_iter().filter(|j| j.is_scheduled_on(today)).collect())
  }

  pub async fn stats(&self) -> CacheResult<Option<Stats>> {
    if !self.can_reach_network() {
      return self.store.fetch_singleton(offline::<Stats>).await;
    }
    self.store.fetch_singleton(|| self.api.get_stats()).await
  }

  pub async fn current_user(&self) -> CacheResult<Option<UserProfile>> {
    if !self.can_reach_network() {
      return self.store.fetch_singleton(offline::<UserProfile>).await;
    }
    self.store.fetch_singleton(|| self.api.get_current_user()).await
  }

  // Writes

  /// Writes go straight to the server only when nothing is queued ahead of
  /// them and the target already has a server id.
  async fn should_write_direct(&self, target: Option<&JobId>) -> bool {
    self.monitor.is_online()
      && !target.is_some_and(JobId::is_placeholder)
      && matches!(self.queue.is_empty().await, Ok(true))
  }

  pub async fn create_job(&self, payload: Value) -> Result<MutationOutcome, SyncError> {
    self.require_session()?;

    if self.should_write_direct(None).await {
      match self.api.create_job(&payload).await {
        Ok(job) => {
          self.cache_job(&job).await;
          return Ok(MutationOutcome::Applied(Some(job)));
        }
        Err(e) if falls_back_to_queue(&e) => {
          warn!(error = %e, "create failed, queueing for later");
        }
        Err(e) => return Err(e.into()),
      }
    }

    let local = JobId::new_placeholder();
    let sequence_id = self
      .queue
      .enqueue(NewEntry::create(local.clone(), payload.clone()))
      .await?;
    let job = Job::optimistic(local, &payload);
    self.cache_job(&job).await;
    self.refresh_pending().await;

    Ok(MutationOutcome::Queued {
      sequence_id,
      job: Some(job),
    })
  }

  pub async fn update_job(&self, id: JobId, payload: Value) -> Result<MutationOutcome, SyncError> {
    self.require_session()?;
    let id = self.canonical_id(id).await;

    if self.should_write_direct(Some(&id)).await {
      match self.api.update_job(&id, &payload).await {
        Ok(job) => {
          self.cache_job(&job).await;
          return Ok(MutationOutcome::Applied(Some(job)));
        }
        Err(e) if falls_back_to_queue(&e) => {
          warn!(error = %e, job = %id, "update failed, queueing for later");
        }
        Err(e) => return Err(e.into()),
      }
    }

    let sequence_id = self
      .queue
      .enqueue(NewEntry::update(id.clone(), payload.clone()))
      .await?;

    let job = match self.store.get::<Job>(id.to_string()).await {
      Ok(Some(mut job)) => {
        job.apply_patch(&payload);
        self.cache_job(&job).await;
        Some(job)
      }
      Ok(None) => None,
      Err(e) => {
        warn!(error = %e, job = %id, "could not apply optimistic update");
        None
      }
    };
    self.refresh_pending().await;

    Ok(MutationOutcome::Queued { sequence_id, job })
  }

  pub async fn delete_job(&self, id: JobId) -> Result<MutationOutcome, SyncError> {
    self.require_session()?;
    let id = self.canonical_id(id).await;

    if self.should_write_direct(Some(&id)).await {
      match self.api.delete_job(&id).await {
        Ok(()) => {
          self.forget_job(&id).await;
          return Ok(MutationOutcome::Applied(None));
        }
        Err(e) if e.is_not_found() => {
          self.forget_job(&id).await;
          return Ok(MutationOutcome::Applied(None));
        }
        Err(e) if falls_back_to_queue(&e) => {
          warn!(error = %e, job = %id, "delete failed, queueing for later");
        }
        Err(e) => return Err(e.into()),
      }
    }

    let sequence_id = self.queue.enqueue(NewEntry::delete(id.clone())).await?;
    self.forget_job(&id).await;
    self.refresh_pending().await;

    Ok(MutationOutcome::Queued {
      sequence_id,
      job: None,
    })
  }

  /// Swap a placeholder whose create has already replayed for its server id.
  async fn canonical_id(&self, id: JobId) -> JobId {
    if !id.is_placeholder() {
      return id;
    }
    match self.queue.resolved_id(id.clone()).await {
      Ok(Some(server_id)) => {
        debug!(placeholder = %id, %server_id, "placeholder already resolved");
        server_id
      }
      Ok(None) => id,
      Err(e) => {
        warn!(error = %e, job = %id, "could not look up placeholder mapping");
        id
      }
    }
  }

  fn require_session(&self) -> Result<(), SyncError> {
    if self.is_authenticated() {
      Ok(())
    } else {
      Err(SyncError::NotAuthenticated)
    }
  }

  async fn cache_job(&self, job: &Job) {
    if let Err(e) = self.store.put(job.clone()).await {
      warn!(error = %e, job = %job.id, "failed to cache job");
    }
  }

  async fn forget_job(&self, id: &JobId) {
    if let Err(e) = self.store.remove::<Job>(id.to_string()).await {
      warn!(error = %e, job = %id, "failed to remove cached job");
    }
  }
}

impl<A: JobApi, S: CacheStorage> Drop for SyncEngine<A, S> {
  fn drop(&mut self) {
    self.stop();
  }
}

/// An expired session is not worth queueing behind; anything else transient is.
fn falls_back_to_queue(err: &ApiError) -> bool {
  err.is_transient() && !matches!(err, ApiError::Unauthorized)
}

fn offline<T>() -> Ready<Result<T, ApiError>> {
  ready(Err(ApiError::Unreachable("offline".into())))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_fallback_classification() {
    assert!(falls_back_to_queue(&ApiError::Unreachable("reset".into())));
    assert!(falls_back_to_queue(&ApiError::from_status(502, String::new())));
    assert!(!falls_back_to_queue(&ApiError::Unauthorized));
    assert!(!falls_back_to_queue(&ApiError::from_status(422, String::new())));
  }

  #[test]
  fn test_outcome_accessors() {
    let job = Job::optimistic(JobId::Server(1), &serde_json::json!({}));
    let queued = MutationOutcome::Queued {
      sequence_id: 4,
      job: Some(job.clone()),
    };
    assert!(queued.is_queued());
    assert_eq!(queued.job(), Some(&job));
    assert!(MutationOutcome::Applied(None).job().is_none());
  }
}
