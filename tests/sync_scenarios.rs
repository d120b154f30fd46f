mod common;

use serde_json::json;
use std::sync::Arc;

use common::{engine_with, offline_engine, FakeApi};
use fieldsync::api::{Job, JobId};
use fieldsync::cache::SqliteStorage;
use fieldsync::sync::{NewEntry, Operation, SyncQueue};
use fieldsync::MutationOutcome;

fn placeholder(outcome: &MutationOutcome) -> JobId {
  outcome.job().unwrap().id.clone()
}

#[tokio::test]
async fn offline_create_then_update_replays_against_server_id() {
  let api = FakeApi::new();
  let (engine, monitor) = offline_engine(&api);

  let created = engine
    .create_job(json!({"customer_name": "Ivan"}))
    .await
    .unwrap();
  let local = placeholder(&created);
  assert!(local.is_placeholder());
  engine
    .update_job(local.clone(), json!({"price": 500}))
    .await
    .unwrap();

  monitor.set_online(true);
  let report = engine.sync_now().await.unwrap().unwrap();

  assert_eq!(api.calls(), vec!["POST 1", "PUT 1"]);
  assert_eq!(report.synced, 2);
  assert_eq!(report.remaining, 0);

  let server = api.job(1).unwrap();
  assert_eq!(server.field("customer_name"), Some(&json!("Ivan")));
  assert_eq!(server.field("price"), Some(&json!(500)));

  // The placeholder row is gone, replaced by the server copy
  let jobs = engine.jobs().await.data;
  assert_eq!(jobs.len(), 1);
  assert_eq!(jobs[0].id, JobId::Server(1));
  assert!(!jobs[0].unconfirmed);
}

#[tokio::test]
async fn failed_edit_stays_queued_while_earlier_edit_is_acked() {
  let api = FakeApi::new();
  api.seed(1, json!({"customer_name": "Anna", "price": 100}));
  api.seed(2, json!({"customer_name": "Oleg", "price": 200}));
  api.fail("PUT 2", 500);
  let (engine, monitor) = offline_engine(&api);

  engine
    .update_job(JobId::Server(1), json!({"price": 150}))
    .await
    .unwrap();
  engine
    .update_job(JobId::Server(2), json!({"price": 250}))
    .await
    .unwrap();

  monitor.set_online(true);
  let report = engine.sync_now().await.unwrap().unwrap();

  assert_eq!(report.synced, 1);
  assert_eq!(report.failed, 1);
  assert_eq!(report.dropped, 0);
  assert_eq!(report.remaining, 1);

  let pending = engine.pending().await.unwrap();
  assert_eq!(pending.len(), 1);
  assert_eq!(pending[0].target_id, Some(JobId::Server(2)));
  assert_eq!(api.job(1).unwrap().field("price"), Some(&json!(150)));

  // Next pass delivers the retained edit
  api.heal("PUT 2");
  let report = engine.sync_now().await.unwrap().unwrap();
  assert_eq!(report.synced, 1);
  assert_eq!(report.remaining, 0);
  assert_eq!(api.job(2).unwrap().field("price"), Some(&json!(250)));
}

#[tokio::test]
async fn create_then_delete_of_unsynced_job_never_reaches_server() {
  let api = FakeApi::new();
  let (engine, monitor) = offline_engine(&api);

  let created = engine
    .create_job(json!({"customer_name": "Pyotr"}))
    .await
    .unwrap();
  let local = placeholder(&created);
  engine.delete_job(local.clone()).await.unwrap();
  assert!(engine.jobs().await.data.is_empty());

  monitor.set_online(true);
  let report = engine.sync_now().await.unwrap().unwrap();

  assert!(api.calls().is_empty());
  assert_eq!(report.cancelled, 2);
  assert_eq!(report.failed, 0);
  assert_eq!(report.remaining, 0);
  assert_eq!(api.job_count(), 0);
}

#[tokio::test]
async fn update_of_dropped_create_is_not_replayed() {
  let api = FakeApi::new();
  api.fail("POST 1", 422);
  let (engine, monitor) = offline_engine(&api);

  let created = engine.create_job(json!({"price": "bad"})).await.unwrap();
  let local = placeholder(&created);
  engine
    .update_job(local.clone(), json!({"price": 10}))
    .await
    .unwrap();
  engine.delete_job(JobId::Server(77)).await.unwrap();

  monitor.set_online(true);
  let report = engine.sync_now().await.unwrap().unwrap();

  // The create is rejected; its dependent update is dropped without a call,
  // and the unrelated delete still goes through (404 counts as done)
  assert_eq!(api.calls(), vec!["POST 1", "DELETE 77"]);
  assert_eq!(report.dropped, 2);
  assert_eq!(report.synced, 1);
  assert_eq!(report.remaining, 0);
  assert_eq!(engine.status().dropped_total, 2);
  assert!(engine.jobs().await.data.is_empty());
}

#[tokio::test]
async fn connection_loss_mid_pass_keeps_the_tail() {
  let api = FakeApi::new();
  api.seed(1, json!({}));
  api.seed(2, json!({}));
  api.fail("PUT 2", 0);
  let (engine, monitor) = offline_engine(&api);

  for (id, price) in [(1, 10), (2, 20), (1, 30)] {
    engine
      .update_job(JobId::Server(id), json!({ "price": price }))
      .await
      .unwrap();
  }

  monitor.set_online(true);
  let report = engine.sync_now().await.unwrap().unwrap();

  assert!(report.interrupted);
  assert_eq!(api.calls(), vec!["PUT 1", "PUT 2"]);
  // The later edit of job 1 must not overtake the stuck edit of job 2
  assert_eq!(report.remaining, 2);
  assert_eq!(api.job(1).unwrap().field("price"), Some(&json!(10)));
}

#[tokio::test]
async fn replaying_offline_edits_matches_applying_them_online() {
  let edits = [
    json!({"status": "in_progress"}),
    json!({"price": 1200}),
    json!({"notes": "needs a new compressor"}),
    json!({"price": 1500, "status": "completed"}),
  ];

  let online_api = FakeApi::new();
  let (online_engine, _online) = engine_with(&online_api, SqliteStorage::in_memory().unwrap(), true);
  let created = online_engine
    .create_job(json!({"customer_name": "Irina"}))
    .await
    .unwrap();
  assert!(!created.is_queued());
  for edit in &edits {
    online_engine
      .update_job(JobId::Server(1), edit.clone())
      .await
      .unwrap();
  }

  let offline_api = FakeApi::new();
  let (offline_engine, monitor) = offline_engine(&offline_api);
  let local = placeholder(
    &offline_engine
      .create_job(json!({"customer_name": "Irina"}))
      .await
      .unwrap(),
  );
  for edit in &edits {
    offline_engine
      .update_job(local.clone(), edit.clone())
      .await
      .unwrap();
  }
  monitor.set_online(true);
  offline_engine.sync_now().await.unwrap();

  assert_eq!(online_api.job(1), offline_api.job(1));
  assert_eq!(online_api.calls(), offline_api.calls());
}

#[tokio::test]
async fn concurrent_triggers_collapse_into_one_pass() {
  let api = FakeApi::new();
  let (engine, monitor) = offline_engine(&api);
  engine
    .create_job(json!({"customer_name": "Vera"}))
    .await
    .unwrap();

  monitor.set_online(true);
  let (first, second) = tokio::join!(engine.sync_now(), engine.sync_now());
  let ran = [first.unwrap(), second.unwrap()]
    .into_iter()
    .filter(Option::is_some)
    .count();

  assert_eq!(ran, 1);
  assert_eq!(api.count("POST"), 1);
}

#[tokio::test]
async fn queue_survives_restart_in_order() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("store.db");
  let api = FakeApi::new();

  let local = {
    let (engine, _monitor) = engine_with(&api, SqliteStorage::open(&path).unwrap(), false);
    let local = placeholder(
      &engine
        .create_job(json!({"customer_name": "Ivan"}))
        .await
        .unwrap(),
    );
    engine
      .update_job(local.clone(), json!({"price": 500}))
      .await
      .unwrap();
    engine.delete_job(JobId::Server(3)).await.unwrap();
    local
  };

  let (engine, monitor) = engine_with(&api, SqliteStorage::open(&path).unwrap(), false);
  let pending = engine.pending().await.unwrap();
  let operations: Vec<Operation> = pending.iter().map(|e| e.operation).collect();
  assert_eq!(
    operations,
    vec![Operation::CreateJob, Operation::UpdateJob, Operation::DeleteJob]
  );
  assert!(pending.windows(2).all(|w| w[0].sequence_id < w[1].sequence_id));
  assert_eq!(pending[0].local_id, Some(local.clone()));
  assert_eq!(pending[1].target_id, Some(local.clone()));

  // The optimistic copy survived too
  let cached = engine.jobs().await.data;
  assert_eq!(cached.len(), 1);
  assert_eq!(cached[0].id, local);
  assert_eq!(cached[0].field("price"), Some(&json!(500)));

  monitor.set_online(true);
  let report = engine.sync_now().await.unwrap().unwrap();
  assert_eq!(api.calls(), vec!["POST 1", "PUT 1", "DELETE 3"]);
  assert_eq!(report.remaining, 0);
}

#[tokio::test]
async fn placeholder_resolution_survives_a_partial_pass() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("store.db");
  let api = FakeApi::new();
  api.fail("PUT 1", 503);

  {
    let (engine, monitor) = engine_with(&api, SqliteStorage::open(&path).unwrap(), false);
    let local = placeholder(&engine.create_job(json!({"customer_name": "Ivan"})).await.unwrap());
    engine.update_job(local, json!({"price": 500})).await.unwrap();
    monitor.set_online(true);
    let report = engine.sync_now().await.unwrap().unwrap();
    assert_eq!(report.synced, 1);
    assert_eq!(report.remaining, 1);
  }

  // After a restart the remaining update already points at the server id
  let (engine, _monitor) = engine_with(&api, SqliteStorage::open(&path).unwrap(), true);
  let pending = engine.pending().await.unwrap();
  assert_eq!(pending[0].target_id, Some(JobId::Server(1)));

  api.heal("PUT 1");
  engine.sync_now().await.unwrap();
  assert_eq!(api.calls(), vec!["POST 1", "PUT 1", "PUT 1"]);
  assert_eq!(api.count("POST"), 1);
  assert_eq!(api.job(1).unwrap().field("price"), Some(&json!(500)));
}

#[tokio::test]
async fn edits_by_the_old_placeholder_reach_the_synced_job() {
  let api = FakeApi::new();
  let (engine, monitor) = offline_engine(&api);
  let local = placeholder(&engine.create_job(json!({"customer_name": "Ivan"})).await.unwrap());

  monitor.set_online(true);
  engine.sync_now().await.unwrap().unwrap();

  // The screen still shows the job under its placeholder
  let outcome = engine
    .update_job(local.clone(), json!({"price": 500}))
    .await
    .unwrap();
  assert!(!outcome.is_queued());
  assert_eq!(api.job(1).unwrap().field("price"), Some(&json!(500)));

  monitor.set_online(false);
  let outcome = engine
    .update_job(local.clone(), json!({"notes": "gate code 42"}))
    .await
    .unwrap();
  assert_eq!(outcome.job().unwrap().id, JobId::Server(1));
  engine.delete_job(local).await.unwrap();

  monitor.set_online(true);
  let report = engine.sync_now().await.unwrap().unwrap();
  assert_eq!(report.synced, 2);
  assert_eq!(report.dropped, 0);
  assert_eq!(api.calls(), vec!["POST 1", "PUT 1", "PUT 1", "DELETE 1"]);
  assert_eq!(api.job_count(), 0);
}

#[tokio::test]
async fn undecodable_entry_does_not_keep_the_queue_busy() {
  let dir = tempfile::tempdir().unwrap();
  let path = dir.path().join("store.db");
  let api = FakeApi::new();
  let (engine, _monitor) = engine_with(&api, SqliteStorage::open(&path).unwrap(), true);

  rusqlite::Connection::open(&path)
    .unwrap()
    .execute(
      "INSERT INTO sync_queue (operation, target_id, payload, enqueued_at)
       VALUES ('PATCH_JOB', '1', x'7b7d', '2024-01-01T00:00:00Z')",
      [],
    )
    .unwrap();

  let report = engine.sync_now().await.unwrap().unwrap();
  assert_eq!(report.dropped, 1);
  assert_eq!(report.remaining, 0);
  assert_eq!(engine.status().pending, 0);
  assert_eq!(engine.status().dropped_total, 1);

  // With the queue empty again, writes go straight to the server
  api.seed(1, json!({"price": 1}));
  let outcome = engine
    .update_job(JobId::Server(1), json!({"price": 2}))
    .await
    .unwrap();
  assert!(!outcome.is_queued());
  assert_eq!(api.calls(), vec!["PUT 1"]);
}

#[tokio::test]
async fn ack_is_idempotent() {
  let queue = SyncQueue::new(Arc::new(SqliteStorage::in_memory().unwrap()));
  let first = queue
    .enqueue(NewEntry::update(JobId::Server(1), json!({"price": 1})))
    .await
    .unwrap();
  let second = queue.enqueue(NewEntry::delete(JobId::Server(2))).await.unwrap();

  queue.ack(first).await.unwrap();
  queue.ack(first).await.unwrap();
  queue.ack(9_999).await.unwrap();

  let pending = queue.drain().await.unwrap();
  assert_eq!(pending.len(), 1);
  assert_eq!(pending[0].sequence_id, second);
}

#[tokio::test]
async fn offline_read_serves_last_fetched_jobs() {
  // Unknown server fields are carried through the cache untouched
  let api = FakeApi::new();
  api.seed(4, json!({"customer_name": "Lev", "address": {"city": "Kazan"}}));
  let (engine, monitor) = engine_with(&api, SqliteStorage::in_memory().unwrap(), true);

  let online: Vec<Job> = engine.jobs().await.data;
  monitor.set_online(false);
  let offline = engine.jobs().await;

  assert_eq!(offline.data, online);
  assert_eq!(offline.data[0].field("address"), Some(&json!({"city": "Kazan"})));
}
