//! Keeping cached views consistent with the remote store.
//!
//! Writes go through [`MutationExecutor`]; server pushes arrive through
//! [`EventStream`]. Both end up as tag sets handed to the [`Invalidator`].

mod event;
mod invalidator;
mod mutation;
mod stream;

pub use event::PushEvent;
pub use invalidator::{InvalidationReport, Invalidator};
pub use mutation::{MergeOutcome, Mutation, MutationExecutor, MutationOutcome, MutationStatus, PatchFn};
pub use stream::{
  Backoff, ConnectionState, EventStream, MessageStream, PushSource, StreamOptions, StreamStats,
};
