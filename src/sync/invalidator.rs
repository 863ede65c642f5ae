//! Applies tag invalidations to the cache.

use std::collections::BTreeSet;
use tracing::debug;

use crate::cache::{QueryCache, QueryKey, Tag};

/// Keys touched by one invalidation.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct InvalidationReport {
  /// Entries with subscribers, refetched in the background
  pub refetched: BTreeSet<QueryKey>,
  /// Entries nobody watches, left stale for their next subscription
  pub marked_stale: BTreeSet<QueryKey>,
}

impl InvalidationReport {
  pub fn is_empty(&self) -> bool {
    self.refetched.is_empty() && self.marked_stale.is_empty()
  }
}

/// Single entry point for tag sets coming from mutations and the push stream.
///
/// Calls are applied synchronously, so invalidations land in arrival order.
#[derive(Clone)]
pub struct Invalidator {
  cache: QueryCache,
}

impl Invalidator {
  pub fn new(cache: QueryCache) -> Self {
    Self { cache }
  }

  pub fn invalidate<'a, I>(&self, tags: I) -> InvalidationReport
  where
    I: IntoIterator<Item = &'a Tag>,
  {
    let tags: Vec<Tag> = tags.into_iter().copied().collect();

    let mut marked_stale = self.cache.keys_tagged(&tags);
    let refetched = self.cache.mark_stale(&marked_stale);
    marked_stale.retain(|key| !refetched.contains(key));
    let report = InvalidationReport {
      refetched,
      marked_stale,
    };

    debug!(
      tags = ?tags.iter().map(Tag::to_string).collect::<Vec<_>>(),
      refetched = report.refetched.len(),
      marked_stale = report.marked_stale.len(),
      "tags invalidated"
    );
    report
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cache::CacheOptions;
  use crate::testing::counting_fetcher;
  use serde_json::json;
  use std::sync::atomic::Ordering;

  #[tokio::test]
  async fn test_invalidating_tag_marks_exactly_tagged_entries() {
    let cache = QueryCache::new(CacheOptions::default());
    let invalidator = Invalidator::new(cache.clone());

    let list = QueryKey::from_value("projects", json!({"offset": 0}));
    let detail = QueryKey::new("project", &1u64);
    let other = QueryKey::new("project", &2u64);

    for (key, tags) in [
      (&list, vec![Tag::project_list(), Tag::project(1)]),
      (&detail, vec![Tag::project(1)]),
      (&other, vec![Tag::project(2)]),
    ] {
      let (fetcher, _) = counting_fetcher(json!({}), tags);
      cache.subscribe(key.clone(), fetcher).ready().await;
    }

    let report = invalidator.invalidate(&[Tag::project(1)]);
    assert_eq!(report.marked_stale, BTreeSet::from([list.clone(), detail.clone()]));
    assert!(report.refetched.is_empty());

    for entry in cache.entries() {
      assert_eq!(entry.stale, entry.key != other, "{}", entry.key);
    }
  }

  #[tokio::test]
  async fn test_active_entries_refetch_inactive_wait() {
    let cache = QueryCache::new(CacheOptions::default());
    let invalidator = Invalidator::new(cache.clone());

    let list = QueryKey::from_value("projects", json!({"offset": 0}));
    let (list_fetcher, list_calls) = counting_fetcher(json!([]), [Tag::project_list()]);
    let active = cache.subscribe(list.clone(), list_fetcher);
    active.ready().await;

    let detail = QueryKey::new("project", &7u64);
    let (detail_fetcher, detail_calls) = counting_fetcher(json!({"id": 7}), [Tag::project(7)]);
    cache.subscribe(detail.clone(), detail_fetcher).ready().await;

    let report = invalidator.invalidate(&[Tag::project(7), Tag::project_list()]);
    assert_eq!(report.refetched, BTreeSet::from([list.clone()]));
    assert_eq!(report.marked_stale, BTreeSet::from([detail.clone()]));

    let list_entry = cache.entry(&list).expect("list");
    assert!(list_entry.stale);
    assert!(list_entry.fetching);

    active.ready().await;
    assert_eq!(list_calls.load(Ordering::SeqCst), 2);
    assert_eq!(detail_calls.load(Ordering::SeqCst), 1);
    assert!(cache.entry(&detail).is_some_and(|e| e.stale));
    assert!(cache.entry(&list).is_some_and(|e| !e.stale));
  }

  #[tokio::test]
  async fn test_invalidation_survives_last_subscriber_leaving() {
    let cache = QueryCache::new(CacheOptions::default());
    let invalidator = Invalidator::new(cache.clone());
    let list = QueryKey::from_value("projects", json!({"offset": 0}));
    let (fetcher, calls) = counting_fetcher(json!([]), [Tag::project_list()]);

    let sub = cache.subscribe(list.clone(), fetcher.clone());
    sub.ready().await;

    let report = invalidator.invalidate(&[Tag::project_list()]);
    assert_eq!(report.refetched, BTreeSet::from([list.clone()]));
    drop(sub);

    let entry = cache.entry(&list).expect("entry");
    assert!(entry.stale);
    assert!(!entry.fetching);

    let again = cache.subscribe(list.clone(), fetcher);
    let entry = again.ready().await.expect("entry");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
    assert!(!entry.stale);
  }

  #[tokio::test]
  async fn test_unknown_tags_touch_nothing() {
    let cache = QueryCache::new(CacheOptions::default());
    let report = Invalidator::new(cache).invalidate(&[Tag::project_deleted_list()]);
    assert!(report.is_empty());
  }
}
