use std::path::PathBuf;

use anyhow::Context;
use serde::{Deserialize, Serialize};
use tracing::level_filters::LevelFilter;
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{
  Registry, layer::SubscriberExt, util::SubscriberInitExt,
};

/// `LOG_LEVEL`
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogLevel {
  Error,
  Warn,
  #[default]
  Info,
  Debug,
  Trace,
}

impl From<LogLevel> for tracing::Level {
  fn from(level: LogLevel) -> Self {
    match level {
      LogLevel::Error => tracing::Level::ERROR,
      LogLevel::Warn => tracing::Level::WARN,
      LogLevel::Info => tracing::Level::INFO,
      LogLevel::Debug => tracing::Level::DEBUG,
      LogLevel::Trace => tracing::Level::TRACE,
    }
  }
}

/// `LOG_FORMAT`
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum LogFormat {
  #[default]
  Pretty,
  Json,
}

#[derive(Debug, Clone, Default)]
pub struct LogConfig {
  pub level: LogLevel,
  pub format: LogFormat,
  /// `LOG_FILE`. When set, logs are written here in addition to stdout.
  pub file: Option<PathBuf>,
}

/// Initializes the global `tracing` subscriber. Returns a guard that must be
/// held for the lifetime of the process when `config.file` is set, otherwise
/// the background file-writer thread is dropped immediately.
pub fn init(
  config: &LogConfig,
) -> anyhow::Result<Option<WorkerGuard>> {
  let log_level: tracing::Level = config.level.into();
  let registry =
    Registry::default().with(LevelFilter::from(log_level));

  let (file_layer, guard) = match &config.file {
    Some(path) => {
      let dir = path
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| std::path::Path::new("."));
      let file_name = path
        .file_name()
        .context("LOG_FILE must name a file, not a directory")?;
      let appender = tracing_appender::rolling::never(dir, file_name);
      let (writer, guard) = tracing_appender::non_blocking(appender);
      let layer = tracing_subscriber::fmt::layer()
        .with_writer(writer)
        .with_ansi(false);
      (Some(layer), Some(guard))
    }
    None => (None, None),
  };

  match config.format {
    LogFormat::Pretty => registry
      .with(tracing_subscriber::fmt::layer().pretty().with_target(true))
      .with(file_layer)
      .try_init(),
    LogFormat::Json => registry
      .with(tracing_subscriber::fmt::layer().json())
      .with(file_layer)
      .try_init(),
  }
  .context("failed to init logger")?;

  Ok(guard)
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn level_maps_to_tracing_level() {
    let level: tracing::Level = LogLevel::Debug.into();
    assert_eq!(level, tracing::Level::DEBUG);
  }
}
