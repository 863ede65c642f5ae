//! Error taxonomy for remote operations.

use serde_json::Value;
use thiserror::Error;

/// Failure of a request against the projects API.
///
/// `Clone` so that a single in-flight fetch result can be handed to every
/// subscriber waiting on it.
#[derive(Debug, Clone, PartialEq, Error)]
pub enum ApiError {
  /// Transport failure, including timeouts.
  #[error("network error: {0}")]
  Network(String),

  /// 4xx with field-level detail, surfaced verbatim.
  #[error("validation failed ({status}): {detail}")]
  Validation { status: u16, detail: Value },

  #[error("not found: {0}")]
  NotFound(String),

  /// Optimistic-concurrency token mismatch.
  #[error("conflict: {detail}")]
  Conflict {
    detail: String,
    current_version: Option<u64>,
  },

  /// 5xx, treated as transient.
  #[error("server error ({status}): {body}")]
  Server { status: u16, body: String },

  /// Successful response whose body does not have the expected shape.
  #[error("failed to decode response: {0}")]
  Decode(String),
}

impl ApiError {
  /// Map a non-success HTTP status and its body to an error.
  pub fn from_status(status: u16, body: Value) -> Self {
    match status {
      404 => ApiError::NotFound(detail_text(&body)),
      409 => ApiError::Conflict {
        detail: detail_text(&body),
        current_version: body.get("current_version").and_then(Value::as_u64),
      },
      400..=499 => ApiError::Validation {
        status,
        detail: body,
      },
      _ => ApiError::Server {
        status,
        body: detail_text(&body),
      },
    }
  }

  /// The caller must reload authoritative state before retrying.
  pub fn requires_refresh(&self) -> bool {
    matches!(self, ApiError::Conflict { .. })
  }

  /// Worth a manual retry without changing the request.
  pub fn is_transient(&self) -> bool {
    matches!(self, ApiError::Network(_) | ApiError::Server { .. })
  }
}

impl From<reqwest::Error> for ApiError {
  fn from(e: reqwest::Error) -> Self {
    if e.is_decode() {
      ApiError::Decode(e.to_string())
    } else {
      ApiError::Network(e.to_string())
    }
  }
}

impl From<serde_json::Error> for ApiError {
  fn from(e: serde_json::Error) -> Self {
    ApiError::Decode(e.to_string())
  }
}

fn detail_text(body: &Value) -> String {
  match body.get("detail") {
    Some(Value::String(s)) => s.clone(),
    Some(other) => other.to_string(),
    None if body.is_null() => String::new(),
    None => body.to_string(),
  }
}
