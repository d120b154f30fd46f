use async_trait::async_trait;
use color_eyre::{eyre::eyre, Result};
use reqwest::header::CONTENT_TYPE;
use reqwest::Method;
use std::time::Duration;

use super::{GatewayRequest, GatewayResponse, ResponseSource};
use crate::error::ApiError;

/// The real network, as seen from the gateway.
///
/// Any HTTP response is `Ok`, whatever its status; `Err` means the request
/// never completed.
#[async_trait]
pub trait Fetcher: Send + Sync + 'static {
  async fn fetch(&self, request: &GatewayRequest) -> Result<GatewayResponse, ApiError>;
}

pub struct HttpFetcher {
  client: reqwest::Client,
}

impl HttpFetcher {
  pub fn new(timeout: Duration) -> Result<Self> {
    let client = reqwest::Client::builder()
      .timeout(timeout)
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;
    Ok(Self { client })
  }
}

#[async_trait]
impl Fetcher for HttpFetcher {
  async fn fetch(&self, request: &GatewayRequest) -> Result<GatewayResponse, ApiError> {
    let method = Method::from_bytes(request.method.to_ascii_uppercase().as_bytes())
      .map_err(|e| ApiError::InvalidResponse(format!("bad method: {}", e)))?;

    let mut builder = self.client.request(method, request.url.clone());
    if let Some(body) = &request.body {
      builder = builder.body(body.clone());
    }

    let response = builder
      .send()
      .await
      .map_err(|e| ApiError::Unreachable(e.to_string()))?;

    let status = response.status().as_u16();
    let content_type = response
      .headers()
      .get(CONTENT_TYPE)
      .and_then(|v| v.to_str().ok())
      .map(String::from);
    let body = response
      .bytes()
      .await
      .map_err(|e| ApiError::Unreachable(e.to_string()))?
      .to_vec();

    Ok(GatewayResponse {
      status,
      content_type,
      body,
      source: ResponseSource::Network,
    })
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use url::Url;
  use wiremock::matchers::{method, path};
  use wiremock::{Mock, MockServer, ResponseTemplate};

  #[tokio::test]
  async fn test_error_status_is_still_a_response() {
    let server = MockServer::start().await;
    Mock::given(method("GET"))
      .and(path("/missing.js"))
      .respond_with(ResponseTemplate::new(404).set_body_string("nope"))
      .mount(&server)
      .await;

    let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
    let url = Url::parse(&format!("{}/missing.js", server.uri())).unwrap();
    let response = fetcher.fetch(&GatewayRequest::get(url)).await.unwrap();

    assert_eq!(response.status, 404);
    assert!(!response.is_success());
    assert_eq!(response.body, b"nope");
  }

  #[tokio::test]
  async fn test_unreachable_is_an_error() {
    let server = MockServer::start().await;
    let url = Url::parse(&format!("{}/app.js", server.uri())).unwrap();
    drop(server);

    let fetcher = HttpFetcher::new(Duration::from_secs(5)).unwrap();
    assert!(fetcher.fetch(&GatewayRequest::get(url)).await.is_err());
  }
}
