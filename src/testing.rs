//! Fakes shared by the unit tests.

use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use reqwest::Method;
use serde_json::Value;
use std::collections::HashMap;
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use tokio::sync::{mpsc, Notify};

use crate::api::{ApiError, ApiRequest, ApiResponse, Transport};
use crate::cache::{Fetched, Fetcher, Tag};
use crate::sync::{MessageStream, PushSource};

/// Fetcher that always succeeds with `data`, counting how often it is called.
pub fn counting_fetcher(
  data: Value,
  tags: impl IntoIterator<Item = Tag>,
) -> (Fetcher, Arc<AtomicUsize>) {
  let calls = Arc::new(AtomicUsize::new(0));
  let tags: Vec<Tag> = tags.into_iter().collect();
  let counter = Arc::clone(&calls);
  let fetcher: Fetcher = Arc::new(move || {
    counter.fetch_add(1, Ordering::SeqCst);
    let fetched = Fetched::new(data.clone(), tags.clone());
    async move { Ok::<_, ApiError>(fetched) }.boxed()
  });
  (fetcher, calls)
}

/// Like `counting_fetcher`, but every fetch waits for a permit on the gate.
pub fn gated_fetcher(
  data: Value,
  tags: impl IntoIterator<Item = Tag>,
) -> (Fetcher, Arc<Notify>, Arc<AtomicUsize>) {
  let calls = Arc::new(AtomicUsize::new(0));
  let gate = Arc::new(Notify::new());
  let tags: Vec<Tag> = tags.into_iter().collect();
  let counter = Arc::clone(&calls);
  let permits = Arc::clone(&gate);
  let fetcher: Fetcher = Arc::new(move || {
    counter.fetch_add(1, Ordering::SeqCst);
    let fetched = Fetched::new(data.clone(), tags.clone());
    let permits = Arc::clone(&permits);
    async move {
      permits.notified().await;
      Ok::<_, ApiError>(fetched)
    }
    .boxed()
  });
  (fetcher, gate, calls)
}

pub fn failing_fetcher(error: ApiError) -> Fetcher {
  Arc::new(move || {
    let error = error.clone();
    async move { Err::<Fetched, _>(error) }.boxed()
  })
}

/// Push source whose first `failures` connects fail, then succeed with a
/// stream fed by `send`.
pub struct ScriptedPush {
  failures: usize,
  attempts: Mutex<Vec<tokio::time::Instant>>,
  sender: Mutex<Option<mpsc::UnboundedSender<Result<String, ApiError>>>>,
}

impl ScriptedPush {
  pub fn failing(failures: usize) -> Arc<Self> {
    Arc::new(Self {
      failures,
      attempts: Mutex::new(Vec::new()),
      sender: Mutex::new(None),
    })
  }

  pub fn connect_times(&self) -> Vec<tokio::time::Instant> {
    self.attempts.lock().expect("attempts").clone()
  }

  pub fn send(&self, message: &str) {
    if let Some(sender) = self.sender.lock().expect("sender").as_ref() {
      let _ = sender.send(Ok(message.to_string()));
    }
  }

  /// End the open stream as if the server went away.
  pub fn drop_connection(&self) {
    self.sender.lock().expect("sender").take();
  }
}

impl PushSource for ScriptedPush {
  fn connect(&self) -> BoxFuture<'static, Result<MessageStream, ApiError>> {
    let attempt = {
      let mut attempts = self.attempts.lock().expect("attempts");
      attempts.push(tokio::time::Instant::now());
      attempts.len()
    };
    if attempt <= self.failures {
      return async { Err::<MessageStream, _>(ApiError::Network("connection refused".into())) }.boxed();
    }

    let (tx, rx) = mpsc::unbounded_channel();
    *self.sender.lock().expect("sender") = Some(tx);
    let stream: MessageStream =
      futures::stream::unfold(rx, |mut rx| async move { rx.recv().await.map(|m| (m, rx)) }).boxed();
    async move { Ok::<_, ApiError>(stream) }.boxed()
  }
}

/// Transport answering from a route table and recording every request.
///
/// Unknown routes answer 404. State-changing requests can be held until the
/// test releases them, to observe optimistic state.
#[derive(Default)]
pub struct FakeTransport {
  routes: Mutex<HashMap<(Method, String), Result<ApiResponse, ApiError>>>,
  requests: Mutex<Vec<ApiRequest>>,
  hold: Mutex<Option<Arc<Notify>>>,
}

impl FakeTransport {
  pub fn new() -> Arc<Self> {
    Arc::new(Self::default())
  }

  pub fn respond(&self, method: Method, path: &str, status: u16, body: Value) {
    self
      .routes
      .lock()
      .expect("routes")
      .insert((method, path.to_string()), Ok(ApiResponse { status, body }));
  }

  pub fn fail(&self, method: Method, path: &str, error: ApiError) {
    self
      .routes
      .lock()
      .expect("routes")
      .insert((method, path.to_string()), Err(error));
  }

  /// Hold state-changing requests until the returned gate is notified.
  pub fn hold_writes(&self) -> Arc<Notify> {
    let gate = Arc::new(Notify::new());
    *self.hold.lock().expect("hold") = Some(Arc::clone(&gate));
    gate
  }

  pub fn requests(&self) -> Vec<ApiRequest> {
    self.requests.lock().expect("requests").clone()
  }

  pub fn count(&self, method: &Method, path: &str) -> usize {
    self
      .requests()
      .iter()
      .filter(|r| r.method == *method && r.path == path)
      .count()
  }
}

impl Transport for FakeTransport {
  fn send(&self, request: ApiRequest) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    self.requests.lock().expect("requests").push(request.clone());
    let response = self
      .routes
      .lock()
      .expect("routes")
      .get(&(request.method.clone(), request.path.clone()))
      .cloned()
      .unwrap_or(Ok(ApiResponse {
        status: 404,
        body: serde_json::json!({"detail": "Not found."}),
      }));
    let hold = if request.is_state_changing() {
      self.hold.lock().expect("hold").clone()
    } else {
      None
    };

    async move {
      if let Some(gate) = hold {
        gate.notified().await;
      }
      response
    }
    .boxed()
  }
}
