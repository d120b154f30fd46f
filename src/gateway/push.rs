use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::config::NotificationConfig;
use crate::error::GatewayError;

/// Push delivery payload. Both fields are optional.
#[derive(Debug, Clone, Default, PartialEq, Deserialize)]
pub struct PushPayload {
  pub title: Option<String>,
  pub body: Option<String>,
}

impl PushPayload {
  /// Decode a push message body. Missing or malformed data yields an empty payload.
  pub fn parse(data: Option<&[u8]>) -> Self {
    match data {
      None => Self::default(),
      Some(bytes) => serde_json::from_slice(bytes).unwrap_or_else(|e| {
        warn!(error = %e, "malformed push payload, using defaults");
        Self::default()
      }),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Notification {
  pub title: String,
  pub body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
}

impl Notification {
  pub fn from_push(payload: PushPayload, config: &NotificationConfig) -> Self {
    Self {
      title: payload.title.unwrap_or_else(|| config.default_title.clone()),
      body: payload.body.unwrap_or_else(|| config.default_body.clone()),
      icon: config.icon.clone(),
      badge: config.badge.clone(),
      vibrate: config.vibrate.clone(),
    }
  }
}

/// An application window known to the host
#[derive(Debug, Clone, PartialEq)]
pub struct WindowClient {
  pub id: String,
  pub url: String,
  pub focusable: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ClickOutcome {
  /// An existing window was focused (its id)
  Focused(String),
  /// A new window was opened (its URL)
  Opened(String),
}

/// Host capabilities the gateway needs for notifications.
#[async_trait]
pub trait ClientSurface: Send + Sync + 'static {
  async fn show_notification(&self, notification: &Notification) -> Result<(), GatewayError>;

  async fn windows(&self) -> Result<Vec<WindowClient>, GatewayError>;

  async fn focus(&self, id: &str) -> Result<(), GatewayError>;

  async fn open_window(&self, url: &str) -> Result<(), GatewayError>;
}

/// Headless surface: notifications go to the log and there are no windows.
#[derive(Debug, Default, Clone)]
pub struct LogSurface;

#[async_trait]
impl ClientSurface for LogSurface {
  async fn show_notification(&self, notification: &Notification) -> Result<(), GatewayError> {
    info!(title = %notification.title, body = %notification.body, "notification");
    Ok(())
  }

  async fn windows(&self) -> Result<Vec<WindowClient>, GatewayError> {
    Ok(Vec::new())
  }

  async fn focus(&self, id: &str) -> Result<(), GatewayError> {
    info!(window = id, "focus window");
    Ok(())
  }

  async fn open_window(&self, url: &str) -> Result<(), GatewayError> {
    info!(url, "open window");
    Ok(())
  }
}
