//! In-memory job API with call recording and failure injection.

#![allow(dead_code)]

use async_trait::async_trait;
use serde_json::{json, Map, Value};
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex};

use fieldsync::api::{Job, JobApi, JobId, Stats, UserProfile};
use fieldsync::cache::SqliteStorage;
use fieldsync::config::SyncConfig;
use fieldsync::{ApiError, ConnectivityMonitor, SyncEngine};

#[derive(Default)]
pub struct FakeApi {
  jobs: Mutex<BTreeMap<i64, Job>>,
  next_id: Mutex<i64>,
  calls: Mutex<Vec<String>>,
  /// "METHOD id" -> status to fail with, 0 meaning unreachable
  failures: Mutex<HashMap<String, u16>>,
}

impl FakeApi {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  /// Store a job on the server side.
  pub fn seed(&self, id: i64, fields: Value) {
    let mut job = Job::optimistic(JobId::Server(id), &fields);
    job.unconfirmed = false;
    self.jobs.lock().unwrap().insert(id, job);
    let mut next = self.next_id.lock().unwrap();
    *next = (*next).max(id);
  }

  pub fn fail(&self, call: &str, status: u16) {
    self.failures.lock().unwrap().insert(call.to_string(), status);
  }

  pub fn heal(&self, call: &str) {
    self.failures.lock().unwrap().remove(call);
  }

  /// Mutation calls in the order they reached the server.
  pub fn calls(&self) -> Vec<String> {
    self.calls.lock().unwrap().clone()
  }

  pub fn count(&self, prefix: &str) -> usize {
    self.calls().iter().filter(|c| c.starts_with(prefix)).count()
  }

  pub fn job(&self, id: i64) -> Option<Job> {
    self.jobs.lock().unwrap().get(&id).cloned()
  }

  pub fn job_count(&self) -> usize {
    self.jobs.lock().unwrap().len()
  }

  fn record(&self, call: String) -> Result<(), ApiError> {
    self.calls.lock().unwrap().push(call.clone());
    match self.failures.lock().unwrap().get(&call) {
      Some(0) => Err(ApiError::Unreachable("connection reset".into())),
      Some(status) => Err(ApiError::from_status(*status, "injected failure".into())),
      None => Ok(()),
    }
  }

  fn server_id(id: &JobId) -> Result<i64, ApiError> {
    match id {
      JobId::Server(id) => Ok(*id),
      JobId::Placeholder(_) => Err(ApiError::UnresolvedId(id.clone())),
    }
  }
}

#[async_trait]
impl JobApi for FakeApi {
  async fn create_job(&self, payload: &Value) -> Result<Job, ApiError> {
    let id = *self.next_id.lock().unwrap() + 1;
    self.record(format!("POST {}", id))?;
    *self.next_id.lock().unwrap() = id;

    let mut job = Job::optimistic(JobId::Server(id), payload);
    job.unconfirmed = false;
    job.fields.entry("status").or_insert(json!("scheduled"));
    self.jobs.lock().unwrap().insert(id, job.clone());
    Ok(job)
  }

  async fn update_job(&self, id: &JobId, payload: &Value) -> Result<Job, ApiError> {
    let id = Self::server_id(id)?;
    self.record(format!("PUT {}", id))?;
    let mut jobs = self.jobs.lock().unwrap();
    let job = jobs
      .get_mut(&id)
      .ok_or_else(|| ApiError::from_status(404, "Job not found".into()))?;
    job.apply_patch(payload);
    job.unconfirmed = false;
    Ok(job.clone())
  }

  async fn delete_job(&self, id: &JobId) -> Result<(), ApiError> {
    let id = Self::server_id(id)?;
    self.record(format!("DELETE {}", id))?;
    match self.jobs.lock().unwrap().remove(&id) {
      Some(_) => Ok(()),
      None => Err(ApiError::from_status(404, "Job not found".into())),
    }
  }

  async fn list_jobs(&self) -> Result<Vec<Job>, ApiError> {
    Ok(self.jobs.lock().unwrap().values().cloned().collect())
  }

  async fn get_today_jobs(&self) -> Result<Vec<Job>, ApiError> {
    Ok(Vec::new())
  }

  async fn get_stats(&self) -> Result<Stats, ApiError> {
    let mut map = Map::new();
    map.insert("total_jobs".into(), json!(self.job_count()));
    Ok(Stats(map))
  }

  async fn get_current_user(&self) -> Result<UserProfile, ApiError> {
    let mut map = Map::new();
    map.insert("phone".into(), json!("+79990000000"));
    Ok(UserProfile(map))
  }

  async fn health(&self) -> Result<(), ApiError> {
    Ok(())
  }
}

pub type TestEngine = SyncEngine<FakeApi, SqliteStorage>;

/// An authenticated engine over an in-memory store, initially offline.
pub fn offline_engine(api: &Arc<FakeApi>) -> (TestEngine, ConnectivityMonitor) {
  engine_with(api, SqliteStorage::in_memory().unwrap(), false)
}

pub fn engine_with(
  api: &Arc<FakeApi>,
  storage: SqliteStorage,
  online: bool,
) -> (TestEngine, ConnectivityMonitor) {
  let monitor = ConnectivityMonitor::new(online);
  let engine = SyncEngine::new(
    Arc::clone(api),
    storage,
    monitor.clone(),
    &SyncConfig::default(),
  );
  engine.resume_session();
  (engine, monitor)
}
