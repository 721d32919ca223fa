use std::sync::OnceLock;

use axum::http::HeaderValue;
use logger::{LogConfig, LogFormat, LogLevel};
use serde::Deserialize;
use tower_http::cors::CorsLayer;

/// Process configuration, populated once from the environment at startup.
///
/// Field names map directly onto env var names via `envy`'s default
/// (uppercased) matching.
#[derive(Debug, Deserialize)]
pub struct Config {
  pub database_url: String,

  pub redis_url: String,

  #[serde(default = "default_cache_ttl")]
  pub cache_ttl: u64,

  #[serde(default = "default_max_file_size")]
  pub max_file_size: u64,

  #[serde(default)]
  pub use_s3: bool,
  #[serde(default)]
  pub s3_bucket: Option<String>,
  #[serde(default)]
  pub s3_region: Option<String>,
  #[serde(default = "default_media_folder")]
  pub media_folder: String,

  #[serde(default)]
  pub smtp_host: Option<String>,
  #[serde(default)]
  pub smtp_port: Option<u16>,
  #[serde(default)]
  pub smtp_username: Option<String>,
  #[serde(default)]
  pub smtp_password: Option<String>,

  pub secret_key: String,

  /// Gates stricter validation (currently: webhook subscription targets
  /// must be a public `https://` URL, no loopback hosts) meant for
  /// deployments reachable by real third-party callers.
  #[serde(default)]
  pub production: bool,

  #[serde(default)]
  pub log_level: LogLevel,
  #[serde(default)]
  pub log_format: LogFormat,
  #[serde(default)]
  pub log_file: Option<std::path::PathBuf>,

  #[serde(default = "default_port")]
  pub port: u16,
  #[serde(default = "default_bind_ip")]
  pub bind_ip: String,

  #[serde(default = "default_rate_limit")]
  pub rate_limit_default: u32,
  #[serde(default = "default_rate_limit_window")]
  pub rate_limit_window_seconds: u64,

  #[serde(default)]
  pub job_worker_concurrency: Option<usize>,

  #[serde(default = "default_webhook_timeout")]
  pub webhook_delivery_timeout_seconds: u64,
  #[serde(default = "default_webhook_max_retries")]
  pub webhook_max_retries_default: u32,
  #[serde(default = "default_webhook_backoff")]
  pub webhook_retry_backoff_seconds: u64,

  #[serde(default)]
  pub cors_allowed_origins: Vec<String>,

  #[serde(default = "default_source_name")]
  pub source_name: String,
}

fn default_source_name() -> String {
  "relay".to_string()
}

fn default_cache_ttl() -> u64 {
  60
}
fn default_max_file_size() -> u64 {
  25 * 1024 * 1024
}
fn default_media_folder() -> String {
  "./media".to_string()
}
fn default_port() -> u16 {
  8000
}
fn default_bind_ip() -> String {
  "0.0.0.0".to_string()
}
fn default_rate_limit() -> u32 {
  100
}
fn default_rate_limit_window() -> u64 {
  60
}
fn default_webhook_timeout() -> u64 {
  10
}
fn default_webhook_max_retries() -> u32 {
  3
}
fn default_webhook_backoff() -> u64 {
  1
}

impl Config {
  pub fn log_config(&self) -> LogConfig {
    LogConfig {
      level: self.log_level,
      format: self.log_format,
      file: self.log_file.clone(),
    }
  }

  pub fn worker_concurrency(&self) -> usize {
    self
      .job_worker_concurrency
      .unwrap_or_else(|| std::thread::available_parallelism().map(|n| n.get()).unwrap_or(4))
  }
}

/// Permissive by default (any origin), matching deployments that sit
/// behind their own edge proxy. Set `CORS_ALLOWED_ORIGINS` to restrict it.
pub fn cors_layer() -> CorsLayer {
  let config = config();
  let allowed_origins = if config.cors_allowed_origins.is_empty() {
    vec![HeaderValue::from_static("*")]
  } else {
    config
      .cors_allowed_origins
      .iter()
      .filter_map(|origin| {
        HeaderValue::from_str(origin)
          .inspect_err(|e| tracing::warn!(origin, error = %e, "invalid CORS origin, skipping"))
          .ok()
      })
      .collect()
  };
  CorsLayer::new()
    .allow_origin(allowed_origins)
    .allow_methods(tower_http::cors::Any)
    .allow_headers(tower_http::cors::Any)
}

pub fn config() -> &'static Config {
  static CONFIG: OnceLock<Config> = OnceLock::new();
  CONFIG.get_or_init(|| {
    dotenvy::dotenv().ok();
    match envy::from_env::<Config>() {
      Ok(config) => config,
      Err(e) => {
        eprintln!("FATAL: invalid configuration | {e:#}");
        std::process::exit(1)
      }
    }
  })
}
