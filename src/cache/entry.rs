//! Cache entry types shared by the store and its readers.

use chrono::{DateTime, Utc};
use futures::future::BoxFuture;
use serde_json::Value;
use std::collections::BTreeSet;
use std::sync::Arc;

use super::key::{QueryKey, Tag};
use crate::api::ApiError;

/// Result of a successful fetch: the data plus the tags its producer declares.
#[derive(Debug, Clone, PartialEq)]
pub struct Fetched {
  pub data: Value,
  pub tags: BTreeSet<Tag>,
}

impl Fetched {
  pub fn new(data: Value, tags: impl IntoIterator<Item = Tag>) -> Self {
    Self {
      data,
      tags: tags.into_iter().collect(),
    }
  }
}

pub type FetchFuture = BoxFuture<'static, Result<Fetched, ApiError>>;

/// Factory producing a fresh fetch future each time the entry needs data.
pub type Fetcher = Arc<dyn Fn() -> FetchFuture + Send + Sync>;

/// Lifecycle status of an entry.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum QueryStatus {
  /// Never fetched, or the first fetch was cancelled
  Idle,
  /// First fetch in progress, no data yet
  Loading,
  /// Holds data from the last successful fetch (or a patch of it)
  Success,
  /// Last fetch failed; earlier data, if any, is kept
  Error,
}

/// Point-in-time view of a cache entry.
#[derive(Debug, Clone)]
pub struct QueryEntry {
  pub key: QueryKey,
  pub status: QueryStatus,
  pub data: Option<Value>,
  pub tags: BTreeSet<Tag>,
  pub last_fetched_at: Option<DateTime<Utc>>,
  pub subscriber_count: usize,
  pub error: Option<ApiError>,
  /// Known to be out of date; refetched on next access
  pub stale: bool,
  /// A fetch is in flight (initial load or background refresh)
  pub fetching: bool,
}

impl QueryEntry {
  pub(crate) fn new(key: QueryKey) -> Self {
    Self {
      key,
      status: QueryStatus::Idle,
      data: None,
      tags: BTreeSet::new(),
      last_fetched_at: None,
      subscriber_count: 0,
      error: None,
      stale: false,
      fetching: false,
    }
  }

  pub fn is_success(&self) -> bool {
    self.status == QueryStatus::Success
  }

  pub fn is_error(&self) -> bool {
    self.status == QueryStatus::Error
  }

  /// Whether the data is older than `stale_time` (if one is set).
  pub fn is_expired(&self, stale_time: Option<std::time::Duration>) -> bool {
    match (stale_time, self.last_fetched_at) {
      (Some(limit), Some(at)) => (Utc::now() - at)
        .to_std()
        .map(|age| age > limit)
        .unwrap_or(false),
      _ => false,
    }
  }
}
