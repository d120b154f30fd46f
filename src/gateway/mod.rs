//! Network boundary between the application surface and the network.
//!
//! The gateway runs as its own task. The application reaches it only through a
//! [`GatewayHandle`] (messages with oneshot replies) and shares nothing with the
//! sync engine except that both talk to the same API. It:
//! - routes every intercepted request (network-only for API traffic,
//!   cache-first for static GETs)
//! - manages the single active versioned asset cache
//! - turns push messages into notifications and handles notification clicks

mod cache;
mod fetch;
mod policy;
mod push;

pub use cache::{AssetStore, SqliteAssetStore};
pub use fetch::{Fetcher, HttpFetcher};
pub use policy::{Route, RoutePolicy};
pub use push::{ClickOutcome, ClientSurface, LogSurface, Notification, PushPayload, WindowClient};

use futures::future::try_join_all;
use std::sync::Arc;
use tokio::sync::{mpsc, oneshot};
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};
use url::Url;

use crate::config::GatewayConfig;
use crate::error::GatewayError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RequestMode {
  /// Top-level page navigation
  Navigate,
  Other,
}

/// An intercepted outgoing request
#[derive(Debug, Clone, PartialEq)]
pub struct GatewayRequest {
  pub method: String,
  pub url: Url,
  pub mode: RequestMode,
  pub body: Option<Vec<u8>>,
}

impl GatewayRequest {
  pub fn new(method: &str, url: Url, mode: RequestMode, body: Option<Vec<u8>>) -> Self {
    Self {
      method: method.to_string(),
      url,
      mode,
      body,
    }
  }

  pub fn get(url: Url) -> Self {
    Self::new("GET", url, RequestMode::Other, None)
  }

  pub fn navigate(url: Url) -> Self {
    Self::new("GET", url, RequestMode::Navigate, None)
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseSource {
  Network,
  Cache,
  /// Built by the gateway because neither network nor cache could answer
  Synthesized,
}

#[derive(Debug, Clone, PartialEq)]
pub struct GatewayResponse {
  pub status: u16,
  pub content_type: Option<String>,
  pub body: Vec<u8>,
  pub source: ResponseSource,
}

impl GatewayResponse {
  pub fn is_success(&self) -> bool {
    (200..300).contains(&self.status)
  }

  /// Offline answer for API calls
  pub fn offline_json(status: u16) -> Self {
    Self {
      status,
      content_type: Some("application/json".to_string()),
      body: br#"{"error":"offline"}"#.to_vec(),
      source: ResponseSource::Synthesized,
    }
  }

  /// Offline answer for everything else
  pub fn offline_text() -> Self {
    Self {
      status: 503,
      content_type: Some("text/plain".to_string()),
      body: b"Offline".to_vec(),
      source: ResponseSource::Synthesized,
    }
  }

  pub fn text(&self) -> String {
    String::from_utf8_lossy(&self.body).into_owned()
  }
}

pub struct Gateway<F: Fetcher, C: AssetStore, U: ClientSurface> {
  config: GatewayConfig,
  origin: Url,
  policy: RoutePolicy,
  fetcher: F,
  assets: Arc<C>,
  surface: U,
}

impl<F: Fetcher, C: AssetStore, U: ClientSurface> Gateway<F, C, U> {
  pub fn new(config: GatewayConfig, origin: Url, fetcher: F, assets: C, surface: U) -> Self {
    Self {
      policy: RoutePolicy::from_config(&config),
      config,
      origin,
      fetcher,
      assets: Arc::new(assets),
      surface,
    }
  }

  fn cache_name(&self) -> &str {
    &self.config.cache_version
  }

  fn resolve(&self, path: &str) -> Result<Url, GatewayError> {
    self.origin.join(path).map_err(|e| GatewayError::Precache {
      url: path.to_string(),
      reason: e.to_string(),
    })
  }

  /// Precache the static asset list into the active cache. All or nothing.
  pub async fn install(&self) -> Result<usize, GatewayError> {
    let urls = self
      .config
      .precache
      .iter()
      .map(|path| self.resolve(path))
      .collect::<Result<Vec<_>, _>>()?;

    let entries = try_join_all(urls.into_iter().map(|url| async move {
      let response = self
        .fetcher
        .fetch(&GatewayRequest::get(url.clone()))
        .await
        .map_err(|e| GatewayError::Precache {
          url: url.to_string(),
          reason: e.to_string(),
        })?;
      if !response.is_success() {
        return Err(GatewayError::Precache {
          url: url.to_string(),
          reason: format!("status {}", response.status),
        });
      }
      Ok((url.to_string(), response))
    }))
    .await?;

    let count = entries.len();
    let cache_name = self.cache_name().to_string();
    cache::blocking(&self.assets, move |a| a.put_all(&cache_name, &entries)).await?;
    info!(cache = self.cache_name(), assets = count, "precache installed");
    Ok(count)
  }

  /// Delete every cache except the active version. Returns the deleted names.
  pub async fn activate(&self) -> Result<Vec<String>, GatewayError> {
    let names = cache::blocking(&self.assets, |a| a.cache_names()).await?;
    let mut deleted = Vec::new();
    for name in names.into_iter().filter(|n| n != self.cache_name()) {
      let target = name.clone();
      let removed = cache::blocking(&self.assets, move |a| a.delete_cache(&target)).await?;
      info!(cache = %name, entries = removed, "deleted stale cache");
      deleted.push(name);
    }
    Ok(deleted)
  }

  /// Serve an intercepted request. Never fails: every failure becomes a
  /// synthesized response.
  pub async fn handle_fetch(&self, request: GatewayRequest) -> GatewayResponse {
    match self.policy.route(&request) {
      Route::NetworkOnly => match self.fetcher.fetch(&request).await {
        Ok(response) => response,
        Err(e) => {
          debug!(url = %request.url, error = %e, "api request failed offline");
          GatewayResponse::offline_json(self.config.offline_status)
        }
      },
      Route::Passthrough => match self.fetcher.fetch(&request).await {
        Ok(response) => response,
        Err(e) => {
          debug!(url = %request.url, error = %e, "request failed");
          GatewayResponse::offline_text()
        }
      },
      Route::CacheFirst => self.cache_first(request).await,
    }
  }

  async fn cache_first(&self, request: GatewayRequest) -> GatewayResponse {
    if let Some(hit) = self.lookup(request.url.as_str()).await {
      return hit;
    }

    match self.fetcher.fetch(&request).await {
      Ok(response) => {
        if response.is_success() {
          let cache_name = self.cache_name().to_string();
          let url = request.url.to_string();
          let stored = response.clone();
          if let Err(e) =
            cache::blocking(&self.assets, move |a| a.put(&cache_name, &url, &stored)).await
          {
            warn!(url = %request.url, error = %e, "failed to cache asset");
          }
        }
        response
      }
      Err(e) => {
        debug!(url = %request.url, error = %e, "asset unavailable offline");
        self.offline_fallback(&request).await
      }
    }
  }

  async fn offline_fallback(&self, request: &GatewayRequest) -> GatewayResponse {
    if self.policy.serves_shell(request) {
      match self.resolve(&self.config.shell) {
        Ok(shell) => {
          if let Some(hit) = self.lookup(shell.as_str()).await {
            return hit;
          }
        }
        Err(e) => warn!(error = %e, "invalid shell path"),
      }
    }
    GatewayResponse::offline_text()
  }

  async fn lookup(&self, url: &str) -> Option<GatewayResponse> {
    let cache_name = self.cache_name().to_string();
    let key = url.to_string();
    match cache::blocking(&self.assets, move |a| a.lookup(&cache_name, &key)).await {
      Ok(hit) => hit,
      Err(e) => {
        warn!(url, error = %e, "asset cache unavailable");
        None
      }
    }
  }

  pub async fn handle_push(&self, data: Option<Vec<u8>>) -> Result<Notification, GatewayError> {
    let payload = PushPayload::parse(data.as_deref());
    let notification = Notification::from_push(payload, &self.config.notification);
    self.surface.show_notification(&notification).await?;
    Ok(notification)
  }

  /// Focus an open application window, or open one at the root.
  pub async fn handle_notification_click(&self) -> Result<ClickOutcome, GatewayError> {
    let windows = self.surface.windows().await?;
    let existing = windows.into_iter().find(|w| {
      w.focusable
        && Url::parse(&w.url).is_ok_and(|url| url.origin() == self.origin.origin())
    });

    match existing {
      Some(window) => {
        self.surface.focus(&window.id).await?;
        Ok(ClickOutcome::Focused(window.id))
      }
      None => {
        self.surface.open_window("/").await?;
        Ok(ClickOutcome::Opened("/".to_string()))
      }
    }
  }

  async fn dispatch(&self, message: GatewayMessage) {
    // A dropped receiver only means the caller stopped waiting
    match message {
      GatewayMessage::Install { reply } => {
        let _ = reply.send(self.install().await);
      }
      GatewayMessage::Activate { reply } => {
        let _ = reply.send(self.activate().await);
      }
      GatewayMessage::Fetch { request, reply } => {
        let _ = reply.send(self.handle_fetch(request).await);
      }
      GatewayMessage::Push { data, reply } => {
        let _ = reply.send(self.handle_push(data).await);
      }
      GatewayMessage::NotificationClick { reply } => {
        let _ = reply.send(self.handle_notification_click().await);
      }
    }
  }

  /// Move the gateway onto its own task.
  pub fn spawn(self) -> (GatewayHandle, JoinHandle<()>) {
    let (tx, mut rx) = mpsc::channel::<GatewayMessage>(64);
    let gateway = Arc::new(self);

    let task = tokio::spawn(async move {
      while let Some(message) = rx.recv().await {
        let gateway = Arc::clone(&gateway);
        tokio::spawn(async move { gateway.dispatch(message).await });
      }
      debug!("gateway channel closed");
    });

    (GatewayHandle { tx }, task)
  }
}

pub enum GatewayMessage {
  Install {
    reply: oneshot::Sender<Result<usize, GatewayError>>,
  },
  Activate {
    reply: oneshot::Sender<Result<Vec<String>, GatewayError>>,
  },
  Fetch {
    request: GatewayRequest,
    reply: oneshot::Sender<GatewayResponse>,
  },
  Push {
    data: Option<Vec<u8>>,
    reply: oneshot::Sender<Result<Notification, GatewayError>>,
  },
  NotificationClick {
    reply: oneshot::Sender<Result<ClickOutcome, GatewayError>>,
  },
}

/// Message-passing access to a spawned gateway
#[derive(Clone)]
pub struct GatewayHandle {
  tx: mpsc::Sender<GatewayMessage>,
}

impl GatewayHandle {
  async fn request<T>(
    &self,
    build: impl FnOnce(oneshot::Sender<T>) -> GatewayMessage,
  ) -> Result<T, GatewayError> {
    let (reply, rx) = oneshot::channel();
    self
      .tx
      .send(build(reply))
      .await
      .map_err(|_| GatewayError::Closed)?;
    rx.await.map_err(|_| GatewayError::Closed)
  }

  pub async fn install(&self) -> Result<usize, GatewayError> {
    self.request(|reply| GatewayMessage::Install { reply }).await?
  }

  pub async fn activate(&self) -> Result<Vec<String>, GatewayError> {
    self.request(|reply| GatewayMessage::Activate { reply }).await?
  }

  pub async fn fetch(&self, request: GatewayRequest) -> Result<GatewayResponse, GatewayError> {
    self
      .request(|reply| GatewayMessage::Fetch { request, reply })
      .await
  }

  pub async fn push(&self, data: Option<Vec<u8>>) -> Result<Notification, GatewayError> {
    self.request(|reply| GatewayMessage::Push { data, reply }).await?
  }

  pub async fn notification_click(&self) -> Result<ClickOutcome, GatewayError> {
    self
      .request(|reply| GatewayMessage::NotificationClick { reply })
      .await?
  }
}
