use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::{Method, StatusCode};
use serde::de::DeserializeOwned;
use serde_json::Value;
use tracing::debug;

use crate::config::ApiConfig;
use crate::error::ApiError;

use super::api_types::ApiErrorBody;
use super::types::{Job, JobId, Stats, UserProfile};

/// Remote job/user API consumed by the sync core.
///
/// Update and delete are idempotent by id; create is not and must only be
/// replayed through the queue.
#[async_trait]
pub trait JobApi: Send + Sync + 'static {
  async fn create_job(&self, payload: &Value) -> Result<Job, ApiError>;

  async fn update_job(&self, id: &JobId, payload: &Value) -> Result<Job, ApiError>;

  async fn delete_job(&self, id: &JobId) -> Result<(), ApiError>;

  async fn list_jobs(&self) -> Result<Vec<Job>, ApiError>;

  async fn get_today_jobs(&self) -> Result<Vec<Job>, ApiError>;

  async fn get_stats(&self) -> Result<Stats, ApiError>;

  async fn get_current_user(&self) -> Result<UserProfile, ApiError>;

  /// Cheap reachability check used by the connectivity probe
  async fn health(&self) -> Result<(), ApiError>;
}

/// HTTP implementation of [`JobApi`]
#[derive(Clone)]
pub struct HttpJobApi {
  client: reqwest::Client,
  base_url: String,
  token: Option<String>,
}

impl HttpJobApi {
  pub fn new(config: &ApiConfig, token: Option<String>) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(config.timeout())
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      client,
      base_url: config.url.trim_end_matches('/').to_string(),
      token,
    })
  }

  /// Issue a request and fail on any non-success status.
  async fn execute(
    &self,
    method: Method,
    path: &str,
    body: Option<&Value>,
  ) -> Result<reqwest::Response, ApiError> {
    let url = format!("{}{}", self.base_url, path);
    debug!(%method, %url, "api request");

    let mut request = self.client.request(method, &url);
    if let Some(token) = &self.token {
      request = request.bearer_auth(token);
    }
    if let Some(body) = body {
      request = request.json(body);
    }

    let response = request
      .send()
      .await
      .map_err(|e| ApiError::Unreachable(e.to_string()))?;

    let status = response.status();
    if !status.is_success() {
      return Err(error_from_response(status, response).await);
    }
    Ok(response)
  }

  async fn send<T: DeserializeOwned>(
    &self,
    method: Method,
    path: &str,
    body: Option<&Value>,
  ) -> Result<T, ApiError> {
    self
      .execute(method, path, body)
      .await?
      .json::<T>()
      .await
      .map_err(|e| ApiError::InvalidResponse(e.to_string()))
  }
}

async fn error_from_response(status: StatusCode, response: reqwest::Response) -> ApiError {
  let detail = response
    .json::<ApiErrorBody>()
    .await
    .ok()
    .and_then(|body| body.message())
    .unwrap_or_else(|| "Request failed".to_string());
  ApiError::from_status(status.as_u16(), detail)
}

/// Placeholders never leave the client.
fn server_id(id: &JobId) -> Result<i64, ApiError> {
  match id {
    JobId::Server(id) => Ok(*id),
    JobId::Placeholder(_) => Err(ApiError::UnresolvedId(id.clone())),
  }
}

#[async_trait]
impl JobApi for HttpJobApi {
  async fn create_job(&self, payload: &Value) -> Result<Job, ApiError> {
    self.send(Method::POST, "/jobs", Some(payload)).await
  }

  async fn update_job(&self, id: &JobId, payload: &Value) -> Result<Job, ApiError> {
    let id = server_id(id)?;
    self
      .send(Method::PUT, &format!("/jobs/{}", id), Some(payload))
      .await
  }

  async fn delete_job(&self, id: &JobId) -> Result<(), ApiError> {
    let id = server_id(id)?;
    // Response body is informational only
    self
      .execute(Method::DELETE, &format!("/jobs/{}", id), None)
      .await?;
    Ok(())
  }

  async fn list_jobs(&self) -> Result<Vec<Job>, ApiError> {
    self.send(Method::GET, "/jobs", None).await
  }

  async fn get_today_jobs(&self) -> Result<Vec<Job>, ApiError> {
    self.send(Method::GET, "/jobs/today", None).await
  }

  async fn get_stats(&self) -> Result<Stats, ApiError> {
    self.send(Method::GET, "/dashboard/stats", None).await
  }

  async fn get_current_user(&self) -> Result<UserProfile, ApiError> {
    self.send(Method::GET, "/auth/me", None).await
  }

  async fn health(&self) -> Result<(), ApiError> {
    self.execute(Method::GET, "/health", None).await?;
    Ok(())
  }
}
