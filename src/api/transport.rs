//! HTTP transport: request/response with JSON bodies, plus the push stream.

use color_eyre::{eyre::eyre, Result};
use futures::future::BoxFuture;
use futures::{FutureExt, StreamExt};
use reqwest::cookie::{CookieStore, Jar};
use reqwest::header::ACCEPT;
use reqwest::Method;
use serde_json::Value;
use std::sync::Arc;
use std::time::Duration;
use tokio::sync::OnceCell;
use tracing::{debug, trace};
use url::Url;

use super::error::ApiError;
use super::sse::SseDecoder;
use crate::config::ApiConfig;
use crate::sync::{MessageStream, PushSource};

const CSRF_COOKIE: &str = "csrftoken";
const CSRF_PATH: &str = "csrf/";

/// A request relative to the API base URL.
#[derive(Debug, Clone)]
pub struct ApiRequest {
  pub method: Method,
  pub path: String,
  pub query: Vec<(String, String)>,
  pub body: Option<Value>,
  pub headers: Vec<(&'static str, String)>,
}

impl ApiRequest {
  pub fn new(method: Method, path: impl Into<String>) -> Self {
    Self {
      method,
      path: path.into(),
      query: Vec::new(),
      body: None,
      headers: Vec::new(),
    }
  }

  pub fn get(path: impl Into<String>) -> Self {
    Self::new(Method::GET, path)
  }

  pub fn post(path: impl Into<String>, body: Value) -> Self {
    Self::new(Method::POST, path).with_body(body)
  }

  pub fn patch(path: impl Into<String>, body: Value) -> Self {
    Self::new(Method::PATCH, path).with_body(body)
  }

  pub fn delete(path: impl Into<String>) -> Self {
    Self::new(Method::DELETE, path)
  }

  pub fn with_query(mut self, query: Vec<(String, String)>) -> Self {
    self.query = query;
    self
  }

  pub fn with_body(mut self, body: Value) -> Self {
    self.body = Some(body);
    self
  }

  pub fn with_header(mut self, name: &'static str, value: impl Into<String>) -> Self {
    self.headers.push((name, value.into()));
    self
  }

  /// Whether the request changes server state (and needs the CSRF header).
  pub fn is_state_changing(&self) -> bool {
    !matches!(self.method, Method::GET | Method::HEAD | Method::OPTIONS)
  }
}

/// Status code and decoded body. Empty bodies decode to `Null`.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResponse {
  pub status: u16,
  pub body: Value,
}

impl ApiResponse {
  pub fn into_result(self) -> Result<Value, ApiError> {
    if (200..300).contains(&self.status) {
      Ok(self.body)
    } else {
      Err(ApiError::from_status(self.status, self.body))
    }
  }
}

/// Sends requests to the projects API.
pub trait Transport: Send + Sync + 'static {
  fn send(&self, request: ApiRequest) -> BoxFuture<'static, Result<ApiResponse, ApiError>>;
}

struct HttpInner {
  client: reqwest::Client,
  base: Url,
  jar: Arc<Jar>,
  timeout: Duration,
  stream_path: String,
  /// CSRF bootstrap call; completed before any other request
  csrf: OnceCell<()>,
}

/// reqwest-backed transport with cookie-based CSRF handshake.
#[derive(Clone)]
pub struct HttpTransport {
  inner: Arc<HttpInner>,
}

impl HttpTransport {
  pub fn new(config: &ApiConfig, stream_path: &str) -> Result<Self> {
    let base = Url::parse(&config.base_url)
      .map_err(|e| eyre!("Invalid API base URL {}: {}", config.base_url, e))?;
    let jar = Arc::new(Jar::default());
    let client = reqwest::Client::builder()
      .cookie_provider(Arc::clone(&jar))
      .connect_timeout(Duration::from_secs(config.timeout_secs))
      .build()
      .map_err(|e| eyre!("Failed to create HTTP client: {}", e))?;

    Ok(Self {
      inner: Arc::new(HttpInner {
        client,
        base,
        jar,
        timeout: Duration::from_secs(config.timeout_secs),
        stream_path: stream_path.to_string(),
        csrf: OnceCell::new(),
      }),
    })
  }
}

impl HttpInner {
  fn url(&self, path: &str) -> Result<Url, ApiError> {
    self
      .base
      .join(path)
      .map_err(|e| ApiError::Network(format!("invalid request path {path}: {e}")))
  }

  /// Fetch the CSRF cookie once per transport.
  async fn handshake(&self) -> Result<(), ApiError> {
    self
      .csrf
      .get_or_try_init(|| async {
        let url = self.url(CSRF_PATH)?;
        let response = self.client.get(url).timeout(self.timeout).send().await?;
        let status = response.status().as_u16();
        if !response.status().is_success() {
          return Err(ApiError::from_status(status, Value::Null));
        }
        debug!(
          found = self.cookie(CSRF_COOKIE).is_some(),
          "csrf handshake complete"
        );
        Ok(())
      })
      .await?;
    Ok(())
  }

  fn cookie(&self, name: &str) -> Option<String> {
    let header = self.jar.cookies(&self.base)?;
    let cookies = header.to_str().ok()?;
    cookies.split("; ").find_map(|pair| {
      pair
        .strip_prefix(name)
        .and_then(|rest| rest.strip_prefix('='))
        .map(String::from)
    })
  }

  async fn send(&self, request: ApiRequest) -> Result<ApiResponse, ApiError> {
    self.handshake().await?;
    let url = self.url(&request.path)?;

    let mut builder = self
      .client
      .request(request.method.clone(), url)
      .timeout(self.timeout)
      .query(&request.query);
    if request.is_state_changing() {
      // Read per request; the server may rotate the cookie.
      if let Some(token) = self.cookie(CSRF_COOKIE) {
        builder = builder
          .header("X-CSRFToken", token)
          .header("X-Requested-With", "XMLHttpRequest");
      }
    }
    for (name, value) in request.headers {
      builder = builder.header(name, value);
    }
    if let Some(body) = &request.body {
      builder = builder.json(body);
    }

    let response = builder.send().await?;
    let status = response.status().as_u16();
    let bytes = response.bytes().await?;
    let body = if bytes.is_empty() {
      Value::Null
    } else {
      serde_json::from_slice(&bytes)
        .unwrap_or_else(|_| Value::String(String::from_utf8_lossy(&bytes).into_owned()))
    };
    trace!(method = %request.method, path = %request.path, status, "response received");
    Ok(ApiResponse { status, body })
  }

  async fn open_stream(&self) -> Result<MessageStream, ApiError> {
    self.handshake().await?;
    let url = self.url(&self.stream_path)?;
    let response = self
      .client
      .get(url)
      .header(ACCEPT, "text/event-stream")
      .send()
      .await?;
    if !response.status().is_success() {
      return Err(ApiError::from_status(response.status().as_u16(), Value::Null));
    }

    let mut decoder = SseDecoder::new();
    let messages = response
      .bytes_stream()
      .map(move |chunk| match chunk {
        Ok(bytes) => decoder.push(&bytes).into_iter().map(Ok).collect::<Vec<_>>(),
        Err(e) => vec![Err(ApiError::from(e))],
      })
      .flat_map(futures::stream::iter)
      .boxed();
    Ok(messages)
  }
}

impl Transport for HttpTransport {
  fn send(&self, request: ApiRequest) -> BoxFuture<'static, Result<ApiResponse, ApiError>> {
    let inner = Arc::clone(&self.inner);
    async move { inner.send(request).await }.boxed()
  }
}

impl PushSource for HttpTransport {
  fn connect(&self) -> BoxFuture<'static, Result<MessageStream, ApiError>> {
    let inner = Arc::clone(&self.inner);
    async move { inner.open_stream().await }.boxed()
  }
}
