//! In-memory query cache with shared fetches, patches and eviction.

use chrono::Utc;
use futures::future::{BoxFuture, FutureExt, Shared};
use std::collections::{BTreeSet, HashMap};
use std::sync::{Arc, Mutex, MutexGuard, PoisonError, Weak};
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::AbortHandle;
use tracing::{debug, trace, warn};

use super::entry::{Fetched, Fetcher, QueryEntry, QueryStatus};
use super::key::{QueryKey, Tag};
use super::tags::TagIndex;
use crate::api::ApiError;

/// Tunables for the cache.
#[derive(Debug, Clone)]
pub struct CacheOptions {
  /// How long an unsubscribed entry is kept before it is purged
  pub eviction_grace: Duration,
  /// Age after which data is refetched on the next subscription
  pub stale_time: Option<Duration>,
}

impl Default for CacheOptions {
  fn default() -> Self {
    Self {
      eviction_grace: Duration::from_secs(300),
      stale_time: None,
    }
  }
}

/// Snapshot of an entry taken before a patch, used to restore it.
#[derive(Debug, Clone)]
pub struct UndoToken {
  key: QueryKey,
  status: QueryStatus,
  data: Option<serde_json::Value>,
  tags: BTreeSet<Tag>,
}

impl UndoToken {
  pub fn key(&self) -> &QueryKey {
    &self.key
  }
}

type InFlightFuture = Shared<BoxFuture<'static, ()>>;

struct InFlight {
  id: u64,
  done: InFlightFuture,
  task: AbortHandle,
}

struct Slot {
  entry: QueryEntry,
  fetcher: Option<Fetcher>,
  inflight: Option<InFlight>,
  /// Invalidated while a fetch was running; fetch again when it lands
  refetch_after_flight: bool,
  eviction: Option<AbortHandle>,
  eviction_epoch: u64,
  revision: u64,
  notify: watch::Sender<u64>,
}

impl Slot {
  fn new(key: QueryKey) -> Self {
    let (notify, _) = watch::channel(0);
    Self {
      entry: QueryEntry::new(key),
      fetcher: None,
      inflight: None,
      refetch_after_flight: false,
      eviction: None,
      eviction_epoch: 0,
      revision: 0,
      notify,
    }
  }

  fn needs_fetch(&self, stale_time: Option<Duration>) -> bool {
    match self.entry.status {
      QueryStatus::Idle | QueryStatus::Error => true,
      QueryStatus::Loading => false,
      QueryStatus::Success => self.entry.stale || self.entry.is_expired(stale_time),
    }
  }

  fn bump(&mut self) {
    self.revision += 1;
    self.notify.send_replace(self.revision);
  }

  fn cancel_timers(&mut self) {
    if let Some(flight) = self.inflight.take() {
      flight.task.abort();
    }
    if let Some(eviction) = self.eviction.take() {
      eviction.abort();
    }
  }
}

#[derive(Default)]
struct CacheState {
  entries: HashMap<QueryKey, Slot>,
  tags: TagIndex,
  next_fetch_id: u64,
}

struct Inner {
  state: Mutex<CacheState>,
  options: CacheOptions,
}

/// Process-wide store of query results for one client session.
///
/// Cheap to clone; all clones share the same entries. Every operation takes
/// the state lock for a single synchronous step and never holds it across an
/// `.await`. Must be used from within a tokio runtime, since fetches and
/// eviction timers run as spawned tasks.
#[derive(Clone)]
pub struct QueryCache {
  inner: Arc<Inner>,
}

impl QueryCache {
  pub fn new(options: CacheOptions) -> Self {
    Self {
      inner: Arc::new(Inner {
        state: Mutex::new(CacheState::default()),
        options,
      }),
    }
  }

  pub fn options(&self) -> &CacheOptions {
    &self.inner.options
  }

  fn lock(&self) -> MutexGuard<'_, CacheState> {
    self
      .inner
      .state
      .lock()
      .unwrap_or_else(PoisonError::into_inner)
  }

  /// Register interest in `key`, fetching if the entry is absent or stale.
  ///
  /// Concurrent subscribers share a single in-flight fetch. The latest
  /// `fetcher` is remembered for later background refetches.
  pub fn subscribe(&self, key: QueryKey, fetcher: Fetcher) -> Subscription {
    let mut state = self.lock();
    let CacheState {
      entries,
      next_fetch_id,
      ..
    } = &mut *state;
    let slot = entries
      .entry(key.clone())
      .or_insert_with(|| Slot::new(key.clone()));

    slot.entry.subscriber_count += 1;
    slot.fetcher = Some(fetcher);
    if let Some(eviction) = slot.eviction.take() {
      trace!(key = %key, "eviction cancelled by new subscriber");
      eviction.abort();
    }

    let changes = slot.notify.subscribe();
    if slot.inflight.is_none() && slot.needs_fetch(self.inner.options.stale_time) {
      self.start_fetch(slot, next_fetch_id);
    }

    debug!(
      key = %key,
      fingerprint = %key.fingerprint(),
      subscribers = slot.entry.subscriber_count,
      "subscribed"
    );

    Subscription {
      cache: self.clone(),
      key,
      changes,
      active: true,
    }
  }

  /// Start a fetch for `slot`. Caller holds the state lock.
  fn start_fetch(&self, slot: &mut Slot, next_fetch_id: &mut u64) {
    let Some(fetcher) = slot.fetcher.clone() else {
      return;
    };

    *next_fetch_id += 1;
    let id = *next_fetch_id;
    let key = slot.entry.key.clone();
    let weak: Weak<Inner> = Arc::downgrade(&self.inner);
    let request = fetcher();

    let done: InFlightFuture = async move {
      let result = request.await;
      if let Some(inner) = weak.upgrade() {
        QueryCache { inner }.finish_fetch(&key, id, result);
      }
    }
    .boxed()
    .shared();

    let task = tokio::spawn(done.clone()).abort_handle();
    slot.inflight = Some(InFlight { id, done, task });
    slot.entry.fetching = true;
    if slot.entry.data.is_none() {
      slot.entry.status = QueryStatus::Loading;
    }
    debug!(
      key = %slot.entry.key,
      fingerprint = %slot.entry.key.fingerprint(),
      fetch = id,
      "fetch started"
    );
    slot.bump();
  }

  fn finish_fetch(&self, key: &QueryKey, id: u64, result: Result<Fetched, ApiError>) {
    let mut state = self.lock();
    let CacheState {
      entries,
      tags,
      next_fetch_id,
    } = &mut *state;
    let Some(slot) = entries.get_mut(key) else {
      return;
    };
    match &slot.inflight {
      Some(flight) if flight.id == id => {}
      // Cancelled or superseded; the entry no longer expects this result.
      _ => return,
    }
    slot.inflight = None;
    slot.entry.fetching = false;

    match result {
      Ok(fetched) => {
        let old_tags = std::mem::replace(&mut slot.entry.tags, fetched.tags);
        tags.reindex(key, &old_tags, &slot.entry.tags);
        slot.entry.data = Some(fetched.data);
        slot.entry.status = QueryStatus::Success;
        slot.entry.error = None;
        slot.entry.stale = false;
        slot.entry.last_fetched_at = Some(Utc::now());
        debug!(key = %key, fetch = id, tags = slot.entry.tags.len(), "fetch succeeded");
      }
      Err(error) => {
        warn!(key = %key, fetch = id, error = %error, "fetch failed");
        slot.entry.status = QueryStatus::Error;
        slot.entry.error = Some(error);
      }
    }

    if std::mem::take(&mut slot.refetch_after_flight) {
      slot.entry.stale = true;
      if slot.entry.subscriber_count > 0 {
        self.start_fetch(slot, next_fetch_id);
      }
    }
    slot.bump();
  }

  fn release(&self, key: &QueryKey) {
    let mut state = self.lock();
    let Some(slot) = state.entries.get_mut(key) else {
      return;
    };
    slot.entry.subscriber_count = slot.entry.subscriber_count.saturating_sub(1);
    debug!(key = %key, subscribers = slot.entry.subscriber_count, "unsubscribed");
    if slot.entry.subscriber_count > 0 {
      return;
    }

    if let Some(flight) = slot.inflight.take() {
      debug!(key = %key, fetch = flight.id, "fetch cancelled, no subscribers left");
      flight.task.abort();
      slot.entry.fetching = false;
      if slot.entry.status == QueryStatus::Loading {
        slot.entry.status = QueryStatus::Idle;
      }
      if std::mem::take(&mut slot.refetch_after_flight) {
        slot.entry.stale = true;
      }
      slot.bump();
    }

    slot.eviction_epoch += 1;
    let epoch = slot.eviction_epoch;
    let grace = self.inner.options.eviction_grace;
    match tokio::runtime::Handle::try_current() {
      Ok(runtime) => {
        let weak = Arc::downgrade(&self.inner);
        let key = key.clone();
        let timer = runtime.spawn(async move {
          tokio::time::sleep(grace).await;
          if let Some(inner) = weak.upgrade() {
            QueryCache { inner }.evict(&key, epoch);
          }
        });
        slot.eviction = Some(timer.abort_handle());
      }
      Err(_) => {
        drop(state);
        self.evict(key, epoch);
      }
    }
  }

  /// Purge `key` if nobody subscribed since the timer for `epoch` started.
  fn evict(&self, key: &QueryKey, epoch: u64) {
    let mut state = self.lock();
    let still_idle = state
      .entries
      .get(key)
      .is_some_and(|slot| slot.entry.subscriber_count == 0 && slot.eviction_epoch == epoch);
    if !still_idle {
      return;
    }
    if let Some(mut slot) = state.entries.remove(key) {
      slot.cancel_timers();
      state.tags.remove(key, &slot.entry.tags);
      debug!(key = %key, fingerprint = %key.fingerprint(), "entry evicted");
    }
  }

  /// Apply `mutator` to a copy of the entry's data.
  ///
  /// When the mutator reports a change, the copy replaces the data and a
  /// token to restore the previous state is returned. Entries without data
  /// are left alone.
  pub fn patch<F>(&self, key: &QueryKey, mutator: F) -> Option<UndoToken>
  where
    F: FnOnce(&mut serde_json::Value) -> bool,
  {
    let mut state = self.lock();
    let slot = state.entries.get_mut(key)?;
    let mut draft = slot.entry.data.clone()?;
    if !mutator(&mut draft) {
      return None;
    }

    let token = UndoToken {
      key: key.clone(),
      status: slot.entry.status,
      data: slot.entry.data.replace(draft),
      tags: slot.entry.tags.clone(),
    };
    trace!(key = %key, "entry patched");
    slot.bump();
    Some(token)
  }

  /// Restore the entry captured by `token`. Returns false if it was evicted.
  pub fn undo(&self, token: UndoToken) -> bool {
    let mut state = self.lock();
    let CacheState { entries, tags, .. } = &mut *state;
    let Some(slot) = entries.get_mut(&token.key) else {
      return false;
    };
    tags.reindex(&token.key, &slot.entry.tags, &token.tags);
    slot.entry.tags = token.tags;
    slot.entry.data = token.data;
    slot.entry.status = token.status;
    trace!(key = %token.key, "patch undone");
    slot.bump();
    true
  }

  /// Flag entries as out of date without dropping their data.
  ///
  /// Entries that currently have subscribers are refetched in the background
  /// and stay stale until that fetch succeeds; the rest wait for their next
  /// subscription. Returns the keys that were refetched.
  pub fn mark_stale<'a, I>(&self, keys: I) -> BTreeSet<QueryKey>
  where
    I: IntoIterator<Item = &'a QueryKey>,
  {
    let mut state = self.lock();
    let CacheState {
      entries,
      next_fetch_id,
      ..
    } = &mut *state;
    let mut refetched = BTreeSet::new();
    for key in keys {
      let Some(slot) = entries.get_mut(key) else {
        continue;
      };
      slot.entry.stale = true;
      if slot.entry.subscriber_count > 0 {
        self.refetch_slot(slot, next_fetch_id);
        refetched.insert(key.clone());
      }
      slot.bump();
    }
    refetched
  }

  /// Fetch `key` again in the background, keeping its data visible meanwhile.
  ///
  /// Returns false when the entry is unknown.
  pub fn refetch(&self, key: &QueryKey) -> bool {
    let mut state = self.lock();
    let CacheState {
      entries,
      next_fetch_id,
      ..
    } = &mut *state;
    match entries.get_mut(key) {
      Some(slot) => {
        self.refetch_slot(slot, next_fetch_id);
        true
      }
      None => false,
    }
  }

  fn refetch_slot(&self, slot: &mut Slot, next_fetch_id: &mut u64) {
    if slot.inflight.is_some() {
      slot.refetch_after_flight = true;
    } else {
      self.start_fetch(slot, next_fetch_id);
    }
  }

  /// Cached keys whose declared tags include any of `tags`.
  pub fn keys_tagged<'a, I>(&self, tags: I) -> BTreeSet<QueryKey>
  where
    I: IntoIterator<Item = &'a Tag>,
  {
    self.lock().tags.invalidate(tags)
  }

  pub fn entry(&self, key: &QueryKey) -> Option<QueryEntry> {
    self.lock().entries.get(key).map(|slot| slot.entry.clone())
  }

  /// All entries, ordered by key.
  pub fn entries(&self) -> Vec<QueryEntry> {
    let state = self.lock();
    let mut entries: Vec<QueryEntry> = state.entries.values().map(|s| s.entry.clone()).collect();
    entries.sort_by(|a, b| a.key.cmp(&b.key));
    entries
  }

  pub fn subscriber_count(&self, key: &QueryKey) -> usize {
    self
      .lock()
      .entries
      .get(key)
      .map_or(0, |slot| slot.entry.subscriber_count)
  }

  pub fn len(&self) -> usize {
    self.lock().entries.len()
  }

  pub fn is_empty(&self) -> bool {
    self.len() == 0
  }

  /// Drop every entry, cancelling fetches and eviction timers.
  pub fn clear(&self) {
    let mut state = self.lock();
    for (_, mut slot) in state.entries.drain() {
      slot.cancel_timers();
    }
    state.tags.clear();
    debug!("cache cleared");
  }

  fn inflight(&self, key: &QueryKey) -> Option<InFlightFuture> {
    self
      .lock()
      .entries
      .get(key)
      .and_then(|slot| slot.inflight.as_ref().map(|f| f.done.clone()))
  }

  /// Compare the incremental tag index with one rebuilt from entries.
  #[cfg(test)]
  pub(crate) fn tag_index_consistent(&self) -> bool {
    let state = self.lock();
    let rebuilt =
      TagIndex::rebuild_from(state.entries.iter().map(|(k, s)| (k, &s.entry.tags)));
    state.tags.same_as(&rebuilt)
  }
}

/// Handle for one subscriber of a cache entry.
///
/// Dropping the handle unsubscribes.
pub struct Subscription {
  cache: QueryCache,
  key: QueryKey,
  changes: watch::Receiver<u64>,
  active: bool,
}

impl Subscription {
  pub fn key(&self) -> &QueryKey {
    &self.key
  }

  /// Current snapshot of the entry.
  pub fn entry(&self) -> Option<QueryEntry> {
    self.cache.entry(&self.key)
  }

  /// Wait for the in-flight fetch (if any) to settle, then snapshot.
  pub async fn ready(&self) -> Option<QueryEntry> {
    if let Some(done) = self.cache.inflight(&self.key) {
      done.await;
    }
    self.entry()
  }

  /// Wait until the entry is written again. Returns false once the cache
  /// has dropped the entry (for example on session shutdown).
  pub async fn changed(&mut self) -> bool {
    self.changes.changed().await.is_ok()
  }

  /// Whether the entry was written since the last `mark_seen`.
  pub fn has_changed(&self) -> bool {
    self.changes.has_changed().unwrap_or(false)
  }

  pub fn mark_seen(&mut self) {
    self.changes.borrow_and_update();
  }

  /// Trigger a background refetch of this entry.
  pub fn refetch(&self) {
    self.cache.refetch(&self.key);
  }

  pub fn unsubscribe(mut self) {
    self.release();
  }

  fn release(&mut self) {
    if std::mem::take(&mut self.active) {
      self.cache.release(&self.key);
    }
  }
}

impl Drop for Subscription {
  fn drop(&mut self) {
    self.release();
  }
}

impl std::fmt::Debug for Subscription {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Subscription")
      .field("key", &self.key)
      .field("active", &self.active)
      .finish_non_exhaustive()
  }
}
