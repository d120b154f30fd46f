use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;
use url::Url;

use crate::db::Database;

#[derive(Debug, Clone, Deserialize)]
pub struct Config {
  pub api: ApiConfig,
  #[serde(default)]
  pub sync: SyncConfig,
  #[serde(default)]
  pub storage: StorageConfig,
  #[serde(default)]
  pub gateway: GatewayConfig,
}

#[derive(Debug, Clone, Deserialize)]
pub struct ApiConfig {
  /// Base URL of the job API (e.g. "https://dispatch.example.com")
  pub url: String,
  #[serde(default = "default_timeout_secs")]
  pub timeout_secs: u64,
}

impl ApiConfig {
  pub fn timeout(&self) -> Duration {
    Duration::from_secs(self.timeout_secs)
  }
}

#[derive(Debug, Clone, Deserialize)]
pub struct SyncConfig {
  /// Periodic retry while entries stay queued
  #[serde(default = "default_retry_secs")]
  pub retry_interval_secs: u64,
  /// How often the health endpoint is probed to detect connectivity
  #[serde(default = "default_probe_secs")]
  pub probe_interval_secs: u64,
}

impl Default for SyncConfig {
  fn default() -> Self {
    Self {
      retry_interval_secs: default_retry_secs(),
      probe_interval_secs: default_probe_secs(),
    }
  }
}

impl SyncConfig {
  pub fn retry_interval(&self) -> Duration {
    Duration::from_secs(self.retry_interval_secs.max(1))
  }

  pub fn probe_interval(&self) -> Duration {
    Duration::from_secs(self.probe_interval_secs.max(1))
  }
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct StorageConfig {
  /// Local store database (defaults to $XDG_DATA_HOME/fieldsync/store.db)
  pub path: Option<PathBuf>,
  /// Gateway asset cache database (defaults to $XDG_DATA_HOME/fieldsync/assets.db)
  pub asset_path: Option<PathBuf>,
}

impl StorageConfig {
  pub fn store_path(&self) -> Result<PathBuf> {
    resolve_path(self.path.as_deref(), "store.db")
  }

  pub fn asset_store_path(&self) -> Result<PathBuf> {
    resolve_path(self.asset_path.as_deref(), "assets.db")
  }
}

fn resolve_path(explicit: Option<&Path>, file_name: &str) -> Result<PathBuf> {
  match explicit {
    Some(p) => Ok(p.to_path_buf()),
    None => Database::default_path(file_name)
      .ok_or_else(|| eyre!("Could not determine data directory")),
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct GatewayConfig {
  /// Origin the application is served from (defaults to the API URL)
  pub origin: Option<String>,
  /// Name of the single active asset cache; bump it on every deployment
  pub cache_version: String,
  /// Path prefixes that are always network-only
  pub api_prefixes: Vec<String>,
  /// Hosts whose requests are always network-only
  pub api_hosts: Vec<String>,
  /// Static assets stored at install time
  pub precache: Vec<String>,
  /// Application shell served for offline navigations
  pub shell: String,
  /// Navigations under this prefix never receive the worker shell
  pub admin_prefix: String,
  /// Status code of synthesized offline responses
  pub offline_status: u16,
  pub notification: NotificationConfig,
}

impl Default for GatewayConfig {
  fn default() -> Self {
    Self {
      origin: None,
      cache_version: "fieldsync-v1".to_string(),
      api_prefixes: ["/auth", "/jobs", "/dashboard", "/admin", "/health", "/push"]
        .into_iter()
        .map(String::from)
        .collect(),
      api_hosts: Vec::new(),
      precache: ["/", "/index.html", "/manifest.json"]
        .into_iter()
        .map(String::from)
        .collect(),
      shell: "/index.html".to_string(),
      admin_prefix: "/admin".to_string(),
      offline_status: 503,
      notification: NotificationConfig::default(),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct NotificationConfig {
  pub default_title: String,
  pub default_body: String,
  pub icon: String,
  pub badge: String,
  pub vibrate: Vec<u32>,
}

impl Default for NotificationConfig {
  fn default() -> Self {
    Self {
      default_title: "FieldSync".to_string(),
      default_body: "New notification".to_string(),
      icon: "/icons/icon-192.png".to_string(),
      badge: "/icons/icon-192.png".to_string(),
      vibrate: vec![100, 50, 100],
    }
  }
}

fn default_timeout_secs() -> u64 {
  15
}

fn default_retry_secs() -> u64 {
  30
}

fn default_probe_secs() -> u64 {
  15
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./fieldsync.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/fieldsync/config.yaml
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    match path {
      Some(p) => Self::load_from_path(&p),
      None => Err(eyre!(
        "No configuration file found. Create one at ~/.config/fieldsync/config.yaml"
      )),
    }
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("fieldsync.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("fieldsync").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;

    Self::from_yaml(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  pub fn from_yaml(contents: &str) -> Result<Self> {
    let config: Config = serde_yaml::from_str(contents)?;
    Url::parse(&config.api.url).map_err(|e| eyre!("Invalid api.url '{}': {}", config.api.url, e))?;
    Ok(config)
  }

  /// Origin the gateway resolves precache paths against.
  pub fn gateway_origin(&self) -> Result<Url> {
    let raw = self.gateway.origin.as_deref().unwrap_or(&self.api.url);
    let url = Url::parse(raw).map_err(|e| eyre!("Invalid gateway origin '{}': {}", raw, e))?;
    Ok(url)
  }

  /// Get the API bearer token from the environment.
  ///
  /// Checks FIELDSYNC_TOKEN.
  pub fn get_api_token() -> Result<String> {
    std::env::var("FIELDSYNC_TOKEN")
      .map_err(|_| eyre!("API token not found. Set the FIELDSYNC_TOKEN environment variable."))
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_minimal_config_uses_defaults() {
    let config = Config::from_yaml("api:\n  url: https://dispatch.example.com\n").unwrap();

    assert_eq!(config.api.timeout(), Duration::from_secs(15));
    assert_eq!(config.sync.retry_interval(), Duration::from_secs(30));
    assert_eq!(config.gateway.cache_version, "fieldsync-v1");
    assert!(config.gateway.api_prefixes.contains(&"/push".to_string()));
    assert_eq!(config.gateway.offline_status, 503);
    assert_eq!(
      config.gateway_origin().unwrap().as_str(),
      "https://dispatch.example.com/"
    );
  }

  #[test]
  fn test_gateway_overrides() {
    let yaml = r#"
api:
  url: https://api.example.com
gateway:
  origin: https://app.example.com
  cache_version: fieldsync-v7
  precache: ["/", "/app.js"]
"#;
    let config = Config::from_yaml(yaml).unwrap();

    assert_eq!(config.gateway.cache_version, "fieldsync-v7");
    assert_eq!(config.gateway.precache, vec!["/", "/app.js"]);
    // untouched fields keep their defaults
    assert_eq!(config.gateway.shell, "/index.html");
    assert_eq!(config.gateway_origin().unwrap().host_str(), Some("app.example.com"));
  }

  #[test]
  fn test_invalid_api_url_is_rejected() {
    assert!(Config::from_yaml("api:\n  url: not a url\n").is_err());
  }

  #[test]
  fn test_missing_explicit_path() {
    let err = Config::load(Some(Path::new("/nonexistent/fieldsync.yaml"))).unwrap_err();
    assert!(err.to_string().contains("not found"));
  }
}
