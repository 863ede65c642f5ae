//! Typed view over a cache subscription.
//!
//! A `Query<T>` decodes the shared cache entry for one key into `T` and keeps
//! a local copy of its state, so readers can render without touching the
//! cache lock.
//!
//! # Example
//!
//! ```ignore
//! let mut query = api.projects(&filters);
//! query.ready().await;
//!
//! loop {
//!     match query.state() {
//!         QueryState::Loading => render_spinner(),
//!         QueryState::Success(page) => render_page(page),
//!         QueryState::Error { error, data } => render_error(error, data.as_ref()),
//!         QueryState::Idle => {}
//!     }
//!     if !query.changed().await {
//!         break;
//!     }
//! }
//! ```

use serde::de::DeserializeOwned;
use serde::Deserialize;
use serde_json::Value;

use crate::api::ApiError;
use crate::cache::{QueryEntry, QueryKey, QueryStatus, Subscription};

/// The state of a query
#[derive(Debug, Clone, PartialEq)]
pub enum QueryState<T> {
  /// No data and no fetch in progress
  Idle,
  /// First fetch in progress
  Loading,
  Success(T),
  /// Last fetch failed; data from an earlier fetch is kept if there was one
  Error { error: ApiError, data: Option<T> },
}

impl<T> QueryState<T> {
  pub fn is_loading(&self) -> bool {
    matches!(self, QueryState::Loading)
  }

  pub fn is_success(&self) -> bool {
    matches!(self, QueryState::Success(_))
  }

  pub fn is_error(&self) -> bool {
    matches!(self, QueryState::Error { .. })
  }

  pub fn data(&self) -> Option<&T> {
    match self {
      QueryState::Success(data) => Some(data),
      QueryState::Error { data, .. } => data.as_ref(),
      _ => None,
    }
  }

  pub fn error(&self) -> Option<&ApiError> {
    match self {
      QueryState::Error { error, .. } => Some(error),
      _ => None,
    }
  }
}

impl<T: DeserializeOwned> QueryState<T> {
  fn from_entry(entry: Option<&QueryEntry>) -> Self {
    let Some(entry) = entry else {
      return QueryState::Idle;
    };
    let decoded = entry.data.as_ref().map(decode::<T>).transpose();

    match (entry.status, decoded) {
      (_, Err(error)) => QueryState::Error { error, data: None },
      (QueryStatus::Idle, _) => QueryState::Idle,
      (QueryStatus::Loading, _) => QueryState::Loading,
      (QueryStatus::Success, Ok(Some(data))) => QueryState::Success(data),
      (QueryStatus::Success, Ok(None)) => QueryState::Idle,
      (QueryStatus::Error, Ok(data)) => QueryState::Error {
        error: entry
          .error
          .clone()
          .unwrap_or_else(|| ApiError::Network("fetch failed".to_string())),
        data,
      },
    }
  }
}

fn decode<T: DeserializeOwned>(value: &Value) -> Result<T, ApiError> {
  <T as Deserialize>::deserialize(value).map_err(ApiError::from)
}

/// Subscribed, typed query.
///
/// Dropping the query releases its subscription.
pub struct Query<T> {
  subscription: Subscription,
  state: QueryState<T>,
  stale: bool,
  fetching: bool,
}

impl<T: DeserializeOwned> Query<T> {
  pub fn new(mut subscription: Subscription) -> Self {
    subscription.mark_seen();
    let mut query = Self {
      subscription,
      state: QueryState::Idle,
      stale: false,
      fetching: false,
    };
    query.refresh();
    query
  }

  pub fn key(&self) -> &QueryKey {
    self.subscription.key()
  }

  /// Get the current state of the query.
  pub fn state(&self) -> &QueryState<T> {
    &self.state
  }

  pub fn data(&self) -> Option<&T> {
    self.state.data()
  }

  pub fn is_loading(&self) -> bool {
    self.state.is_loading()
  }

  pub fn is_success(&self) -> bool {
    self.state.is_success()
  }

  pub fn is_error(&self) -> bool {
    self.state.is_error()
  }

  pub fn error(&self) -> Option<&ApiError> {
    self.state.error()
  }

  /// The entry was invalidated and has not been refetched yet.
  pub fn is_stale(&self) -> bool {
    self.stale
  }

  /// A fetch is running, including background refreshes of existing data.
  pub fn is_fetching(&self) -> bool {
    self.fetching
  }

  /// Pick up cache writes since the last poll.
  ///
  /// Returns `true` if the state changed. Call this from a render tick.
  pub fn poll(&mut self) -> bool {
    if !self.subscription.has_changed() {
      return false;
    }
    self.subscription.mark_seen();
    self.refresh();
    true
  }

  /// Wait for the current fetch to settle.
  pub async fn ready(&mut self) -> &QueryState<T> {
    self.subscription.ready().await;
    self.subscription.mark_seen();
    self.refresh();
    &self.state
  }

  /// Wait for the next cache write. Returns `false` once the entry is gone.
  pub async fn changed(&mut self) -> bool {
    if !self.subscription.changed().await {
      return false;
    }
    self.refresh();
    true
  }

  /// Force a background refetch. Existing data stays visible meanwhile.
  pub fn refetch(&self) {
    self.subscription.refetch();
  }

  fn refresh(&mut self) {
    let entry = self.subscription.entry();
    self.stale = entry.as_ref().is_some_and(|e| e.stale);
    self.fetching = entry.as_ref().is_some_and(|e| e.fetching);
    self.state = QueryState::from_entry(entry.as_ref());
  }
}

impl<T: std::fmt::Debug> std::fmt::Debug for Query<T> {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Query")
      .field("key", self.subscription.key())
      .field("state", &self.state)
      .field("stale", &self.stale)
      .finish_non_exhaustive()
  }
}
