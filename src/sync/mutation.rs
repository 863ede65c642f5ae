//! Optimistic mutations with all-or-nothing rollback.
//!
//! A mutation runs in four steps:
//! 1. find the cached keys whose tags intersect the mutation's affected tags
//! 2. patch each of them locally, keeping an undo token per patch
//! 3. await the remote operation
//! 4. commit (merge the response, invalidate tags) or undo every patch in
//!    reverse order and hand the error back to the caller

use serde_json::Value;
use std::collections::BTreeSet;
use std::future::Future;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use tracing::{debug, info, warn};

use super::invalidator::{InvalidationReport, Invalidator};
use crate::api::ApiError;
use crate::cache::{QueryCache, QueryKey, Tag, UndoToken};

/// Local transformation applied to each affected entry. Returns whether the
/// entry's data changed.
pub type PatchFn = Box<dyn Fn(&QueryKey, &mut Value) -> bool + Send + Sync>;

/// Declarative description of one write.
pub struct Mutation {
  name: &'static str,
  affected_tags: BTreeSet<Tag>,
  patch: Option<PatchFn>,
  primary: Option<QueryKey>,
  expected_version: Option<u64>,
}

impl Mutation {
  pub fn new(name: &'static str, affected_tags: impl IntoIterator<Item = Tag>) -> Self {
    Self {
      name,
      affected_tags: affected_tags.into_iter().collect(),
      patch: None,
      primary: None,
      expected_version: None,
    }
  }

  /// Patch applied optimistically to every affected cached entry.
  pub fn with_patch<F>(mut self, patch: F) -> Self
  where
    F: Fn(&QueryKey, &mut Value) -> bool + Send + Sync + 'static,
  {
    self.patch = Some(Box::new(patch));
    self
  }

  /// Entry that receives the server's canonical response on success.
  pub fn with_primary(mut self, key: QueryKey) -> Self {
    self.primary = Some(key);
    self
  }

  /// Version token the remote operation is guarded with.
  pub fn expecting_version(mut self, version: Option<u64>) -> Self {
    self.expected_version = version;
    self
  }

  pub fn name(&self) -> &'static str {
    self.name
  }

  pub fn affected_tags(&self) -> &BTreeSet<Tag> {
    &self.affected_tags
  }

  pub fn expected_version(&self) -> Option<u64> {
    self.expected_version
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MutationStatus {
  Applying,
  Inflight,
  Committed,
  RolledBack,
}

/// Bookkeeping for a mutation between its optimistic patch and its outcome.
///
/// Dropping a record that never reached a terminal state rolls it back, so a
/// caller abandoning the mutation future cannot leave patches behind.
struct PendingMutation {
  id: u64,
  name: &'static str,
  target_keys: BTreeSet<QueryKey>,
  undo: Vec<UndoToken>,
  status: MutationStatus,
  cache: QueryCache,
}

impl PendingMutation {
  fn commit(&mut self) {
    self.undo.clear();
    self.status = MutationStatus::Committed;
  }

  fn rollback(&mut self) {
    // Most recent patch first.
    while let Some(token) = self.undo.pop() {
      let key = token.key().clone();
      if !self.cache.undo(token) {
        debug!(mutation = self.id, key = %key, "entry gone before rollback");
      }
    }
    self.status = MutationStatus::RolledBack;
  }
}

impl Drop for PendingMutation {
  fn drop(&mut self) {
    if matches!(self.status, MutationStatus::Applying | MutationStatus::Inflight) {
      warn!(mutation = self.id, name = self.name, "mutation abandoned, rolling back");
      self.rollback();
    }
  }
}

/// What happened to the primary entry after a successful mutation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum MergeOutcome {
  /// No primary entry, no cached data, or nothing to merge
  Skipped,
  /// Response installed in the primary entry
  Merged,
  /// Response fields differ from the cached shape; entry left for refetch
  Diverged {
    extra: Vec<String>,
    missing: Vec<String>,
  },
}

#[derive(Debug, Clone)]
pub struct MutationOutcome {
  /// Body returned by the remote operation
  pub response: Value,
  /// Keys that received an optimistic patch
  pub patched: BTreeSet<QueryKey>,
  pub merge: MergeOutcome,
  pub invalidation: InvalidationReport,
}

/// Runs mutations against the cache.
#[derive(Clone)]
pub struct MutationExecutor {
  cache: QueryCache,
  invalidator: Invalidator,
  next_id: Arc<AtomicU64>,
}

impl MutationExecutor {
  pub fn new(cache: QueryCache, invalidator: Invalidator) -> Self {
    Self {
      cache,
      invalidator,
      next_id: Arc::new(AtomicU64::new(1)),
    }
  }

  /// Apply `mutation` optimistically, then await `remote`.
  ///
  /// On failure every patch is undone before the error is returned; there is
  /// no automatic retry.
  pub async fn run<Fut>(&self, mutation: Mutation, remote: Fut) -> Result<MutationOutcome, ApiError>
  where
    Fut: Future<Output = Result<Value, ApiError>>,
  {
    let mut pending = PendingMutation {
      id: self.next_id.fetch_add(1, Ordering::Relaxed),
      name: mutation.name,
      target_keys: self.cache.keys_tagged(&mutation.affected_tags),
      undo: Vec::new(),
      status: MutationStatus::Applying,
      cache: self.cache.clone(),
    };

    let mut patched = BTreeSet::new();
    if let Some(patch) = &mutation.patch {
      for key in &pending.target_keys {
        if let Some(token) = self.cache.patch(key, |data| patch(key, data)) {
          patched.insert(key.clone());
          pending.undo.push(token);
        }
      }
    }
    pending.status = MutationStatus::Inflight;
    debug!(
      mutation = pending.id,
      name = pending.name,
      targets = pending.target_keys.len(),
      patched = patched.len(),
      expected_version = ?mutation.expected_version,
      "mutation in flight"
    );

    match remote.await {
      Ok(response) => {
        pending.commit();
        let merge = self.merge_primary(&mutation, &response);
        let invalidation = self.invalidator.invalidate(&mutation.affected_tags);
        info!(mutation = pending.id, name = pending.name, "mutation committed");
        Ok(MutationOutcome {
          response,
          patched,
          merge,
          invalidation,
        })
      }
      Err(error) => {
        pending.rollback();
        warn!(
          mutation = pending.id,
          name = pending.name,
          error = %error,
          undone = patched.len(),
          "mutation rolled back"
        );
        Err(error)
      }
    }
  }

  fn merge_primary(&self, mutation: &Mutation, response: &Value) -> MergeOutcome {
    let Some(key) = &mutation.primary else {
      return MergeOutcome::Skipped;
    };
    let Value::Object(incoming) = response else {
      return MergeOutcome::Skipped;
    };

    let mut outcome = MergeOutcome::Skipped;
    let token = self.cache.patch(key, |data| {
      let Value::Object(current) = data else {
        return false;
      };
      let extra: Vec<String> = incoming
        .keys()
        .filter(|k| !current.contains_key(*k))
        .cloned()
        .collect();
      let missing: Vec<String> = current
        .keys()
        .filter(|k| !incoming.contains_key(*k))
        .cloned()
        .collect();
      if !extra.is_empty() || !missing.is_empty() {
        outcome = MergeOutcome::Diverged { extra, missing };
        return false;
      }
      outcome = MergeOutcome::Merged;
      if *current == *incoming {
        return false;
      }
      *current = incoming.clone();
      true
    });
    // Committed merge; the snapshot is not needed.
    drop(token);

    if let MergeOutcome::Diverged { extra, missing } = &outcome {
      warn!(
        key = %key,
        extra = ?extra,
        missing = ?missing,
        "server response shape differs from cached entry, not merging"
      );
      self.cache.mark_stale([key]);
    }
    outcome
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::api::patches::remove_from_page;
  use crate::cache::{CacheOptions, QueryEntry};
  use crate::testing::counting_fetcher;
  use serde_json::json;

  struct Fixture {
    cache: QueryCache,
    executor: MutationExecutor,
    _subs: Vec<crate::cache::Subscription>,
  }

  async fn fixture(entries: Vec<(QueryKey, Value, Vec<Tag>)>) -> Fixture {
    let cache = QueryCache::new(CacheOptions::default());
    let executor = MutationExecutor::new(cache.clone(), Invalidator::new(cache.clone()));
    let mut subs = Vec::new();
    for (key, data, tags) in entries {
      let (fetcher, _) = counting_fetcher(data, tags);
      let sub = cache.subscribe(key, fetcher);
      sub.ready().await;
      subs.push(sub);
    }
    Fixture {
      cache,
      executor,
      _subs: subs,
    }
  }

  fn page(ids: &[u64]) -> Value {
    json!({
      "count": ids.len(),
      "limit": 9,
      "offset": 0,
      "results": ids.iter().map(|id| json!({"id": id, "title": format!("p{id}")})).collect::<Vec<_>>(),
    })
  }

  fn list_tags(ids: &[u64]) -> Vec<Tag> {
    let mut tags: Vec<Tag> = ids.iter().map(|id| Tag::project(*id)).collect();
    tags.push(Tag::project_list());
    tags
  }

  fn data_and_tags(entries: &[QueryEntry]) -> Vec<(QueryKey, Option<Value>, BTreeSet<Tag>)> {
    entries
      .iter()
      .map(|e| (e.key.clone(), e.data.clone(), e.tags.clone()))
      .collect()
  }

  fn delete_mutation(id: u64) -> Mutation {
    Mutation::new(
      "delete_project",
      [Tag::project(id), Tag::project_list(), Tag::project_deleted_list()],
    )
    .with_patch(move |key, data| key.endpoint() == "projects" && remove_from_page(data, id))
  }

  #[tokio::test]
  async fn test_failed_delete_restores_list() {
    let list = QueryKey::from_value("projects", json!({"offset": 0}));
    let fx = fixture(vec![(list.clone(), page(&[1, 2, 3]), list_tags(&[1, 2, 3]))]).await;

    let cache = fx.cache.clone();
    let key = list.clone();
    let result = fx
      .executor
      .run(delete_mutation(2), async move {
        // The optimistic patch is visible while the request is pending.
        let data = cache.entry(&key).and_then(|e| e.data).expect("data");
        assert_eq!(data["count"], json!(2));
        assert_eq!(data["results"].as_array().map(Vec::len), Some(2));
        Err(ApiError::Network("timed out".into()))
      })
      .await;

    assert_eq!(result.err(), Some(ApiError::Network("timed out".into())));
    let data = fx.cache.entry(&list).and_then(|e| e.data).expect("data");
    assert_eq!(data, page(&[1, 2, 3]));
  }

  #[tokio::test]
  async fn test_rollback_restores_every_entry_exactly() {
    let first = QueryKey::from_value("projects", json!({"offset": 0}));
    let second = QueryKey::from_value("projects", json!({"offset": 0, "search": "p"}));
    let detail = QueryKey::new("project", &2u64);
    let fx = fixture(vec![
      (first.clone(), page(&[1, 2, 3]), list_tags(&[1, 2, 3])),
      (second.clone(), page(&[2, 5]), list_tags(&[2, 5])),
      (detail.clone(), json!({"id": 2, "title": "p2"}), vec![Tag::project(2)]),
    ])
    .await;
    let before = data_and_tags(&fx.cache.entries());

    let mutation = Mutation::new("update_project", [Tag::project(2), Tag::project_list()])
      .with_patch(|_, data| {
        if let Some(obj) = data.as_object_mut() {
          obj.insert("touched".into(), json!(true));
          return true;
        }
        false
      });
    let result = fx
      .executor
      .run(mutation, async { Err(ApiError::Server { status: 502, body: String::new() }) })
      .await;

    assert!(matches!(result, Err(ApiError::Server { status: 502, .. })));
    assert_eq!(data_and_tags(&fx.cache.entries()), before);
    assert!(fx.cache.tag_index_consistent());
  }

  #[tokio::test]
  async fn test_lists_are_patched_independently() {
    let first = QueryKey::from_value("projects", json!({"offset": 0}));
    let second = QueryKey::from_value("projects", json!({"offset": 9}));
    let fx = fixture(vec![
      (first.clone(), page(&[1, 2, 3]), list_tags(&[1, 2, 3])),
      (second.clone(), page(&[10, 11]), list_tags(&[10, 11])),
    ])
    .await;

    let outcome = fx
      .executor
      .run(delete_mutation(2), async { Ok(Value::Null) })
      .await
      .expect("committed");

    assert_eq!(outcome.patched, BTreeSet::from([first.clone()]));
    assert_eq!(outcome.merge, MergeOutcome::Skipped);
    let untouched = fx.cache.entry(&second).and_then(|e| e.data).expect("data");
    assert_eq!(untouched["count"], json!(2));
    assert_eq!(untouched["results"][0]["id"], json!(10));
  }

  #[tokio::test]
  async fn test_success_invalidates_affected_tags() {
    let list = QueryKey::from_value("projects", json!({"offset": 0}));
    let fx = fixture(vec![(list.clone(), page(&[1, 2]), list_tags(&[1, 2]))]).await;

    let outcome = fx
      .executor
      .run(
        Mutation::new("create_project", [Tag::project_list()]),
        async { Ok(json!({"id": 3})) },
      )
      .await
      .expect("committed");

    assert_eq!(outcome.invalidation.refetched, BTreeSet::from([list]));
  }

  #[tokio::test]
  async fn test_conflict_rolls_back_and_requests_refresh() {
    let detail = QueryKey::new("project", &4u64);
    let fx = fixture(vec![(
      detail.clone(),
      json!({"id": 4, "title": "old", "version": 3}),
      vec![Tag::project(4)],
    )])
    .await;

    let mutation = Mutation::new("update_project", [Tag::project(4)])
      .with_patch(|_, data| {
        data["title"] = json!("new");
        true
      })
      .expecting_version(Some(2));
    let err = fx
      .executor
      .run(mutation, async {
        Err(ApiError::Conflict {
          detail: "ETag mismatch".into(),
          current_version: Some(3),
        })
      })
      .await
      .expect_err("conflict");

    assert!(err.requires_refresh());
    let data = fx.cache.entry(&detail).and_then(|e| e.data).expect("data");
    assert_eq!(data["title"], json!("old"));
  }

  #[tokio::test]
  async fn test_matching_response_is_merged() {
    let detail = QueryKey::new("project", &4u64);
    let fx = fixture(vec![(
      detail.clone(),
      json!({"id": 4, "title": "old", "version": 1}),
      vec![Tag::project(4)],
    )])
    .await;

    let mutation = Mutation::new("update_project", [Tag::project(4)]).with_primary(detail.clone());
    let outcome = fx
      .executor
      .run(mutation, async { Ok(json!({"id": 4, "title": "new", "version": 2})) })
      .await
      .expect("committed");

    assert_eq!(outcome.merge, MergeOutcome::Merged);
    let data = fx.cache.entry(&detail).and_then(|e| e.data).expect("data");
    assert_eq!(data["version"], json!(2));
  }

  #[tokio::test]
  async fn test_divergent_response_is_flagged_not_merged() {
    let detail = QueryKey::new("project", &4u64);
    let fx = fixture(vec![(
      detail.clone(),
      json!({"id": 4, "title": "old"}),
      vec![Tag::project(4)],
    )])
    .await;

    let mutation = Mutation::new("update_project", [Tag::project(4)]).with_primary(detail.clone());
    let outcome = fx
      .executor
      .run(mutation, async { Ok(json!({"id": 4, "title": "new", "etag": "W/2"})) })
      .await
      .expect("committed");

    assert_eq!(
      outcome.merge,
      MergeOutcome::Diverged {
        extra: vec!["etag".to_string()],
        missing: vec![],
      }
    );
    let data = fx.cache.entry(&detail).and_then(|e| e.data).expect("data");
    assert_eq!(data["title"], json!("old"));
  }

  #[tokio::test]
  async fn test_abandoned_mutation_rolls_back() {
    let list = QueryKey::from_value("projects", json!({"offset": 0}));
    let fx = fixture(vec![(list.clone(), page(&[1, 2]), list_tags(&[1, 2]))]).await;

    let run = fx
      .executor
      .run(delete_mutation(1), futures::future::pending::<Result<Value, ApiError>>());
    let timed_out = tokio::time::timeout(std::time::Duration::from_millis(10), run).await;

    assert!(timed_out.is_err());
    let data = fx.cache.entry(&list).and_then(|e| e.data).expect("data");
    assert_eq!(data, page(&[1, 2]));
  }
}
