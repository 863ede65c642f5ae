//! Tracing setup for the binary.
//!
//! Logs go to a daily rolling file so stdout stays free for dashboard output.

use color_eyre::{eyre::eyre, Result};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, layer::SubscriberExt, util::SubscriberInitExt, EnvFilter};

use crate::config::Config;

const LOG_FILE_PREFIX: &str = "projdash.log";

/// Install the global subscriber.
///
/// `RUST_LOG` wins over the configured filter. Keep the returned guard alive
/// for the life of the program; dropping it flushes pending lines.
pub fn init(config: &Config) -> Result<WorkerGuard> {
  let directory = config.log_directory();
  std::fs::create_dir_all(&directory)
    .map_err(|e| eyre!("Failed to create log directory {}: {}", directory.display(), e))?;

  let appender = tracing_appender::rolling::daily(&directory, LOG_FILE_PREFIX);
  let (writer, guard) = tracing_appender::non_blocking(appender);

  let filter = EnvFilter::try_from_default_env()
    .or_else(|_| EnvFilter::try_new(&config.log.filter))
    .map_err(|e| eyre!("Invalid log filter {:?}: {}", config.log.filter, e))?;

  tracing_subscriber::registry()
    .with(filter)
    .with(fmt::layer().with_writer(writer).with_ansi(false).with_target(true))
    .try_init()
    .map_err(|e| eyre!("Failed to install tracing subscriber: {}", e))?;

  Ok(guard)
}
