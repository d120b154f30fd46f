//! Wire types for API responses that are not domain documents.

use serde::Deserialize;
use serde_json::Value;

/// Error body returned by the API: `{"detail": ...}`. Validation failures
/// carry a list of problems instead of a string.
#[derive(Debug, Deserialize)]
pub struct ApiErrorBody {
  #[serde(default)]
  pub detail: Value,
}

impl ApiErrorBody {
  pub fn message(&self) -> Option<String> {
    match &self.detail {
      Value::Null => None,
      Value::String(s) => Some(s.clone()),
      other => Some(other.to_string()),
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn test_string_detail() {
    let body: ApiErrorBody = serde_json::from_str(r#"{"detail": "Job not found"}"#).unwrap();
    assert_eq!(body.message().as_deref(), Some("Job not found"));
  }

  #[test]
  fn test_validation_detail_is_flattened() {
    let body: ApiErrorBody =
      serde_json::from_str(r#"{"detail": [{"loc": ["body", "price"], "msg": "bad"}]}"#).unwrap();
    assert!(body.message().unwrap().contains("price"));
  }

  #[test]
  fn test_missing_detail() {
    let body: ApiErrorBody = serde_json::from_str("{}").unwrap();
    assert!(body.message().is_none());
  }
}
