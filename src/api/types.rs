//! Wire types for the projects API.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

/// A project as returned by the server.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
  pub id: u64,
  pub title: String,
  #[serde(default)]
  pub description: String,
  pub owner: String,
  #[serde(default)]
  pub progress: f64,
  #[serde(default)]
  pub tags: Vec<String>,
  pub health: String,
  pub status: String,
  pub last_updated: Option<DateTime<Utc>>,
  /// Optimistic-concurrency token, bumped on every server-side write
  #[serde(default)]
  pub version: u64,
  #[serde(default)]
  pub is_deleted: bool,
}

/// Limit/offset page of projects.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ProjectPage {
  pub count: u64,
  pub limit: Option<u64>,
  pub offset: Option<u64>,
  pub results: Vec<Project>,
}

/// Arguments of the project list query.
///
/// Unset fields are omitted from both the request and the cache key.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectFilters {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub limit: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub offset: Option<u64>,
  /// Free-text search over title, description and tags
  #[serde(skip_serializing_if = "Option::is_none")]
  pub search: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub owner: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tags: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub health: Option<String>,
  /// Sort field, `-` prefix for descending (e.g. `-last_updated`)
  #[serde(skip_serializing_if = "Option::is_none")]
  pub ordering: Option<String>,
}

/// Pagination arguments of the deleted-projects query.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct PageParams {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub limit: Option<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub offset: Option<u64>,
}

/// Field changes for create and partial update.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ProjectChanges {
  #[serde(skip_serializing_if = "Option::is_none")]
  pub title: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub owner: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub progress: Option<f64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tags: Option<Vec<String>>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub health: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
}

impl ProjectChanges {
  pub fn is_empty(&self) -> bool {
    *self == Self::default()
  }
}

/// Body of the bulk-update endpoint.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct BulkUpdate {
  pub ids: Vec<u64>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub status: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub owner: Option<String>,
  #[serde(skip_serializing_if = "Option::is_none")]
  pub health: Option<String>,
  /// Single tag appended to every matching project
  #[serde(skip_serializing_if = "Option::is_none")]
  pub tag: Option<String>,
}

/// Response of the bulk-update and bulk-recover endpoints.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BulkResult {
  pub updated_count: u64,
  pub requested_ids: Vec<u64>,
  pub found_ids: Vec<u64>,
}

/// Flatten a serializable argument struct into query-string pairs.
pub fn query_pairs<T: Serialize>(args: &T) -> Vec<(String, String)> {
  match serde_json::to_value(args) {
    Ok(Value::Object(map)) => map
      .into_iter()
      .filter_map(|(k, v)| match v {
        Value::Null => None,
        Value::String(s) => Some((k, s)),
        other => Some((k, other.to_string())),
      })
      .collect(),
    _ => Vec::new(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn test_project_from_server_payload() {
    let project: Project = serde_json::from_value(json!({
      "id": 5,
      "title": "Website Redesign",
      "description": "",
      "owner": "Alex",
      "progress": 42.5,
      "tags": ["web"],
      "health": "good",
      "status": "active",
      "last_updated": "2024-03-01T10:00:00.123456Z",
      "version": 3,
      "is_deleted": false
    }))
    .expect("project");
    assert_eq!(project.version, 3);
    assert!(project.last_updated.is_some());
  }

  #[test]
  fn test_query_pairs_skip_unset() {
    let filters = ProjectFilters {
      limit: Some(9),
      search: Some("web site".into()),
      ..Default::default()
    };
    let mut pairs = query_pairs(&filters);
    pairs.sort();
    assert_eq!(
      pairs,
      vec![
        ("limit".to_string(), "9".to_string()),
        ("search".to_string(), "web site".to_string())
      ]
    );
  }

  #[test]
  fn test_changes_without_fields_are_empty() {
    assert!(ProjectChanges::default().is_empty());
    let changes = ProjectChanges {
      progress: Some(0.0),
      ..Default::default()
    };
    assert!(!changes.is_empty());
    assert_eq!(serde_json::to_value(&changes).expect("json"), json!({"progress": 0.0}));
  }
}
