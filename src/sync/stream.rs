//! Push connection with reconnect/backoff.
//!
//! The connection cycles `Connecting → Open → Closed → Connecting …` until it
//! is disposed. Each failure schedules a reconnect after the current backoff
//! delay, which doubles up to a ceiling; a successful open resets it.

use futures::future::BoxFuture;
use futures::stream::BoxStream;
use futures::StreamExt;
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, trace, warn};

use super::event::PushEvent;
use super::invalidator::Invalidator;
use crate::api::ApiError;

/// Stream of raw message payloads from an open push connection.
pub type MessageStream = BoxStream<'static, Result<String, ApiError>>;

/// Something that can open a push connection.
pub trait PushSource: Send + Sync + 'static {
  fn connect(&self) -> BoxFuture<'static, Result<MessageStream, ApiError>>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ConnectionState {
  Connecting,
  Open,
  Closed,
}

/// Exponential reconnect delay, capped at a ceiling.
#[derive(Debug, Clone)]
pub struct Backoff {
  base: Duration,
  ceiling: Duration,
  current: Duration,
}

impl Backoff {
  pub fn new(base: Duration, ceiling: Duration) -> Self {
    Self {
      base,
      ceiling,
      current: base,
    }
  }

  /// Delay for the next reconnect; doubles the one after it.
  pub fn next_delay(&mut self) -> Duration {
    let delay = self.current.min(self.ceiling);
    self.current = self.current.saturating_mul(2).min(self.ceiling);
    delay
  }

  pub fn reset(&mut self) {
    self.current = self.base;
  }
}

#[derive(Debug, Clone)]
pub struct StreamOptions {
  pub backoff_base: Duration,
  pub backoff_ceiling: Duration,
}

impl Default for StreamOptions {
  fn default() -> Self {
    Self {
      backoff_base: Duration::from_millis(1000),
      backoff_ceiling: Duration::from_millis(15000),
    }
  }
}

/// Counters for the push connection.
#[derive(Debug, Default)]
pub struct StreamStats {
  pub messages: AtomicU64,
  pub malformed: AtomicU64,
  pub reconnects: AtomicU64,
}

/// Connection bookkeeping owned by the run loop.
#[derive(Debug)]
struct Connection {
  state: watch::Sender<ConnectionState>,
  backoff: Backoff,
  /// Connect attempts since the last successful open
  attempt: u32,
}

impl Connection {
  fn transition(&self, next: ConnectionState) {
    self.state.send_if_modified(|state| {
      let changed = *state != next;
      *state = next;
      changed
    });
  }
}

/// Handle to a running push connection.
///
/// Dropping the handle without calling [`EventStream::dispose`] aborts the
/// connection task.
pub struct EventStream {
  state: watch::Receiver<ConnectionState>,
  shutdown: watch::Sender<bool>,
  stats: Arc<StreamStats>,
  task: Option<JoinHandle<()>>,
}

impl EventStream {
  /// Start connecting in a background task.
  pub fn spawn(
    source: Arc<dyn PushSource>,
    invalidator: Invalidator,
    options: StreamOptions,
  ) -> Self {
    let (state_tx, state_rx) = watch::channel(ConnectionState::Closed);
    let (shutdown_tx, shutdown_rx) = watch::channel(false);
    let stats = Arc::new(StreamStats::default());

    let connection = Connection {
      state: state_tx,
      backoff: Backoff::new(options.backoff_base, options.backoff_ceiling),
      attempt: 0,
    };
    let task = tokio::spawn(run(
      source,
      invalidator,
      connection,
      shutdown_rx,
      Arc::clone(&stats),
    ));

    Self {
      state: state_rx,
      shutdown: shutdown_tx,
      stats,
      task: Some(task),
    }
  }

  pub fn state(&self) -> ConnectionState {
    *self.state.borrow()
  }

  /// Watch connection state transitions.
  pub fn state_changes(&self) -> watch::Receiver<ConnectionState> {
    self.state.clone()
  }

  pub fn stats(&self) -> &StreamStats {
    &self.stats
  }

  /// Stop for good: cancels any pending reconnect and closes the transport.
  pub async fn dispose(mut self) {
    let _ = self.shutdown.send(true);
    if let Some(task) = self.task.take() {
      if let Err(e) = task.await {
        if !e.is_cancelled() {
          warn!(error = %e, "push stream task ended abnormally");
        }
      }
    }
  }
}

impl Drop for EventStream {
  fn drop(&mut self) {
    if let Some(task) = self.task.take() {
      task.abort();
    }
  }
}

async fn run(
  source: Arc<dyn PushSource>,
  invalidator: Invalidator,
  mut connection: Connection,
  mut shutdown: watch::Receiver<bool>,
  stats: Arc<StreamStats>,
) {
  'session: loop {
    connection.attempt += 1;
    connection.transition(ConnectionState::Connecting);
    debug!(attempt = connection.attempt, "connecting push stream");

    let connected = tokio::select! {
      biased;
      _ = shutdown.changed() => break 'session,
      result = source.connect() => result,
    };

    match connected {
      Ok(mut messages) => {
        connection.transition(ConnectionState::Open);
        connection.backoff.reset();
        info!(attempt = connection.attempt, "push stream open");
        connection.attempt = 0;

        loop {
          let next = tokio::select! {
            biased;
            _ = shutdown.changed() => None,
            message = messages.next() => Some(message),
          };
          match next {
            None => break 'session,
            Some(Some(Ok(raw))) => handle_message(&raw, &invalidator, &stats),
            Some(Some(Err(e))) => {
              warn!(error = %e, "push stream failed");
              break;
            }
            Some(None) => {
              info!("push stream closed by server");
              break;
            }
          }
        }
      }
      Err(e) => {
        warn!(attempt = connection.attempt, error = %e, "push stream connect failed");
      }
    }

    connection.transition(ConnectionState::Closed);
    let delay = connection.backoff.next_delay();
    stats.reconnects.fetch_add(1, Ordering::Relaxed);
    info!(delay_ms = delay.as_millis() as u64, "push stream reconnect scheduled");

    tokio::select! {
      biased;
      _ = shutdown.changed() => break 'session,
      _ = tokio::time::sleep(delay) => {}
    }
  }

  connection.transition(ConnectionState::Closed);
  debug!("push stream disposed");
}

fn handle_message(raw: &str, invalidator: &Invalidator, stats: &StreamStats) {
  stats.messages.fetch_add(1, Ordering::Relaxed);
  match PushEvent::parse(raw) {
    Ok(event) => {
      let tags = event.tags();
      if tags.is_empty() {
        trace!(event = ?event, "push message ignored");
        return;
      }
      invalidator.invalidate(&tags);
    }
    Err(e) => {
      stats.malformed.fetch_add(1, Ordering::Relaxed);
      warn!(error = %e, "discarding malformed push message");
    }
  }
}
