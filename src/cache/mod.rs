//! Client-side query cache.
//!
//! This module keeps the results of remote reads and tracks who is looking
//! at them:
//! - Entries are keyed by endpoint + canonical arguments
//! - Each result declares tags; a derived index maps tags back to keys
//! - Concurrent subscribers to one key share a single in-flight fetch
//! - Unsubscribed entries are purged after a grace period
//! - Optimistic patches return undo tokens holding the prior snapshot

mod entry;
mod key;
mod store;
mod tags;

pub use entry::{FetchFuture, Fetched, Fetcher, QueryEntry, QueryStatus};
pub use key::{QueryKey, ResourceKind, Tag, TagId};
pub use store::{CacheOptions, QueryCache, Subscription, UndoToken};
pub use tags::TagIndex;
