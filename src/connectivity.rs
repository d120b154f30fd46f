//! Online/offline status as an observable value.
//!
//! The host runtime (or the health probe) reports transitions with
//! [`ConnectivityMonitor::set_online`]; the engine subscribes to the channel
//! instead of reading any ambient global.

use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::info;

use crate::api::JobApi;

#[derive(Clone)]
pub struct ConnectivityMonitor {
  tx: Arc<watch::Sender<bool>>,
}

impl ConnectivityMonitor {
  pub fn new(initially_online: bool) -> Self {
    let (tx, _rx) = watch::channel(initially_online);
    Self { tx: Arc::new(tx) }
  }

  /// Record the current status. Subscribers are only woken on an actual change.
  pub fn set_online(&self, online: bool) {
    let changed = self.tx.send_if_modified(|current| {
      if *current == online {
        false
      } else {
        *current = online;
        true
      }
    });
    if changed {
      info!(online, "connectivity changed");
    }
  }

  pub fn is_online(&self) -> bool {
    *self.tx.borrow()
  }

  pub fn subscribe(&self) -> watch::Receiver<bool> {
    self.tx.subscribe()
  }

  /// Poll the API health endpoint and feed the result into this monitor.
  pub fn spawn_probe<A: JobApi>(&self, api: Arc<A>, interval: Duration) -> JoinHandle<()> {
    let monitor = self.clone();
    tokio::spawn(async move {
      let mut ticker = tokio::time::interval(interval);
      ticker.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
      loop {
        ticker.tick().await;
        let online = api.health().await.is_ok();
        monitor.set_online(online);
      }
    })
  }
}

impl Default for ConnectivityMonitor {
  fn default() -> Self {
    Self::new(false)
  }
}
