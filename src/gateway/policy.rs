use url::Url;

use super::{GatewayRequest, RequestMode};
use crate::config::GatewayConfig;

/// How an intercepted request is served
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Route {
  /// API traffic: network or a synthesized offline error, never the cache
  NetworkOnly,
  /// Static GET: active cache first, then network (stored on success)
  CacheFirst,
  /// Other non-API traffic: network without caching
  Passthrough,
}

#[derive(Debug, Clone)]
pub struct RoutePolicy {
  api_prefixes: Vec<String>,
  api_hosts: Vec<String>,
  admin_prefix: String,
}

impl RoutePolicy {
  pub fn from_config(config: &GatewayConfig) -> Self {
    Self {
      api_prefixes: config.api_prefixes.clone(),
      api_hosts: config.api_hosts.clone(),
      admin_prefix: config.admin_prefix.clone(),
    }
  }

  /// First match wins: API, then GET, then everything else.
  pub fn route(&self, request: &GatewayRequest) -> Route {
    if self.is_api(&request.url) {
      Route::NetworkOnly
    } else if request.method.eq_ignore_ascii_case("GET") {
      Route::CacheFirst
    } else {
      Route::Passthrough
    }
  }

  pub fn is_api(&self, url: &Url) -> bool {
    let host_matches = url
      .host_str()
      .is_some_and(|host| self.api_hosts.iter().any(|h| host_matches(host, h)));

    host_matches
      || self
        .api_prefixes
        .iter()
        .any(|prefix| has_path_prefix(url.path(), prefix))
  }

  /// Offline navigations get the cached shell, except in the admin area.
  pub fn serves_shell(&self, request: &GatewayRequest) -> bool {
    request.mode == RequestMode::Navigate
      && !has_path_prefix(request.url.path(), &self.admin_prefix)
  }
}

/// Segment-aware prefix match: `/jobs` covers `/jobs` and `/jobs/7`, not `/jobsite`.
fn has_path_prefix(path: &str, prefix: &str) -> bool {
  let prefix = prefix.trim_end_matches('/');
  if prefix.is_empty() {
    return true;
  }
  match path.strip_prefix(prefix) {
    Some(rest) => rest.is_empty() || rest.starts_with('/'),
    None => false,
  }
}

fn host_matches(host: &str, pattern: &str) -> bool {
  host == pattern || host.ends_with(&format!(".{}", pattern))
}
