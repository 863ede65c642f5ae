use color_eyre::{eyre::eyre, Result};
use serde::Deserialize;
use std::path::{Path, PathBuf};
use std::time::Duration;

use crate::cache::CacheOptions;
use crate::sync::StreamOptions;

const API_URL_ENV: &str = "PROJDASH_API_URL";

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(default)]
pub struct Config {
  pub api: ApiConfig,
  pub cache: CacheConfig,
  pub stream: StreamConfig,
  pub log: LogConfig,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct ApiConfig {
  /// Base URL of the REST API, with trailing slash
  pub base_url: String,
  /// Per-request timeout
  pub timeout_secs: u64,
}

impl Default for ApiConfig {
  fn default() -> Self {
    Self {
      base_url: "http://localhost:8000/api/v1/".to_string(),
      timeout_secs: 30,
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct CacheConfig {
  /// How long an unsubscribed entry survives before eviction
  pub eviction_grace_secs: u64,
  /// Age after which data is refetched on resubscribe (unset: only when invalidated)
  pub stale_time_secs: Option<u64>,
}

impl Default for CacheConfig {
  fn default() -> Self {
    Self {
      eviction_grace_secs: 300,
      stale_time_secs: None,
    }
  }
}

impl CacheConfig {
  pub fn options(&self) -> CacheOptions {
    CacheOptions {
      eviction_grace: Duration::from_secs(self.eviction_grace_secs),
      stale_time: self.stale_time_secs.map(Duration::from_secs),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct StreamConfig {
  /// Push endpoint, relative to the API base URL
  pub path: String,
  pub backoff_base_ms: u64,
  pub backoff_ceiling_ms: u64,
}

impl Default for StreamConfig {
  fn default() -> Self {
    Self {
      path: "projects/stream/".to_string(),
      backoff_base_ms: 1000,
      backoff_ceiling_ms: 15000,
    }
  }
}

impl StreamConfig {
  pub fn options(&self) -> StreamOptions {
    StreamOptions {
      backoff_base: Duration::from_millis(self.backoff_base_ms),
      backoff_ceiling: Duration::from_millis(self.backoff_ceiling_ms),
    }
  }
}

#[derive(Debug, Clone, Deserialize)]
#[serde(default)]
pub struct LogConfig {
  /// Filter directives used when RUST_LOG is unset
  pub filter: String,
  /// Log file directory (defaults to the user data directory)
  pub directory: Option<PathBuf>,
}

impl Default for LogConfig {
  fn default() -> Self {
    Self {
      filter: "projdash=info".to_string(),
      directory: None,
    }
  }
}

impl Config {
  /// Load configuration from file.
  ///
  /// Search order:
  /// 1. Explicit path if provided
  /// 2. ./projdash.yaml (current directory)
  /// 3. $XDG_CONFIG_HOME/projdash/config.yaml
  ///
  /// Without a file the defaults apply. `PROJDASH_API_URL` overrides the
  /// API base URL either way.
  pub fn load(explicit_path: Option<&Path>) -> Result<Self> {
    let path = if let Some(p) = explicit_path {
      if p.exists() {
        Some(p.to_path_buf())
      } else {
        return Err(eyre!("Config file not found: {}", p.display()));
      }
    } else {
      Self::find_config_file()
    };

    let mut config = match path {
      Some(p) => Self::load_from_path(&p)?,
      None => Config::default(),
    };
    if let Ok(url) = std::env::var(API_URL_ENV) {
      config.api.base_url = url;
    }
    config.api.base_url = with_trailing_slash(config.api.base_url);
    Ok(config)
  }

  fn find_config_file() -> Option<PathBuf> {
    // Check current directory
    let local = PathBuf::from("projdash.yaml");
    if local.exists() {
      return Some(local);
    }

    // Check XDG config directory
    if let Some(config_dir) = dirs::config_dir() {
      let xdg_path = config_dir.join("projdash").join("config.yaml");
      if xdg_path.exists() {
        return Some(xdg_path);
      }
    }

    None
  }

  fn load_from_path(path: &Path) -> Result<Self> {
    let contents = std::fs::read_to_string(path)
      .map_err(|e| eyre!("Failed to read config file {}: {}", path.display(), e))?;
    Self::parse(&contents)
      .map_err(|e| eyre!("Failed to parse config file {}: {}", path.display(), e))
  }

  fn parse(contents: &str) -> Result<Self, serde_yaml::Error> {
    // An empty file is valid and means "all defaults".
    if contents.trim().is_empty() {
      return Ok(Config::default());
    }
    serde_yaml::from_str(contents)
  }

  /// Directory for log files.
  pub fn log_directory(&self) -> PathBuf {
    self.log.directory.clone().unwrap_or_else(|| {
      dirs::data_local_dir()
        .unwrap_or_else(std::env::temp_dir)
        .join("projdash")
    })
  }
}

/// URL joins drop the last path segment unless the base ends with `/`.
fn with_trailing_slash(mut url: String) -> String {
  if !url.ends_with('/') {
    url.push('/');
  }
  url
}
