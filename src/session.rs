//! One client session: cache, sync components and the API bound together.

use color_eyre::Result;
use std::sync::Arc;
use tracing::info;

use crate::api::{HttpTransport, ProjectApi, Transport};
use crate::cache::QueryCache;
use crate::config::Config;
use crate::sync::{EventStream, Invalidator, MutationExecutor, PushSource, StreamOptions};

pub struct Session {
  cache: QueryCache,
  invalidator: Invalidator,
  api: ProjectApi,
  push: Arc<dyn PushSource>,
  stream_options: StreamOptions,
  stream: Option<EventStream>,
}

impl Session {
  /// Build a session talking HTTP to the configured server.
  pub fn connect(config: &Config) -> Result<Self> {
    let transport = HttpTransport::new(&config.api, &config.stream.path)?;
    info!(base_url = %config.api.base_url, "session created");
    Ok(Self::with_transport(
      Arc::new(transport.clone()),
      Arc::new(transport),
      config,
    ))
  }

  pub fn with_transport(
    transport: Arc<dyn Transport>,
    push: Arc<dyn PushSource>,
    config: &Config,
  ) -> Self {
    let cache = QueryCache::new(config.cache.options());
    let invalidator = Invalidator::new(cache.clone());
    let executor = MutationExecutor::new(cache.clone(), invalidator.clone());
    let api = ProjectApi::new(transport, cache.clone(), executor);
    Self {
      cache,
      invalidator,
      api,
      push,
      stream_options: config.stream.options(),
      stream: None,
    }
  }

  pub fn api(&self) -> &ProjectApi {
    &self.api
  }

  pub fn cache(&self) -> &QueryCache {
    &self.cache
  }

  pub fn invalidator(&self) -> &Invalidator {
    &self.invalidator
  }

  /// Open the push connection. A no-op if it is already running.
  pub fn start_stream(&mut self) -> &EventStream {
    self.stream.get_or_insert_with(|| {
      EventStream::spawn(
        Arc::clone(&self.push),
        self.invalidator.clone(),
        self.stream_options.clone(),
      )
    })
  }

  pub fn stream(&self) -> Option<&EventStream> {
    self.stream.as_ref()
  }

  /// Close the push connection and drop every cached entry.
  pub async fn shutdown(mut self) {
    if let Some(stream) = self.stream.take() {
      stream.dispose().await;
    }
    self.cache.clear();
    info!("session closed");
  }
}
