use std::sync::OnceLock;

use rate_limit::{RateLimit, RateLimiter};
use sqlx::{PgPool, postgres::PgPoolOptions};
use store::Store;

use crate::{config::config, ws::Fabric};

static DB_POOL: OnceLock<PgPool> = OnceLock::new();

pub fn db_pool() -> &'static PgPool {
  DB_POOL.get().unwrap_or_else(|| {
    error!(
      "FATAL: db_pool accessed before initialized | Ensure init_db_pool() is called during startup | Exiting..."
    );
    std::process::exit(1)
  })
}

/// Must be called in app startup sequence, before anything touches the
/// database.
pub async fn init_db_pool() {
  let pool = match PgPoolOptions::new()
    .max_connections(20)
    .connect(&config().database_url)
    .await
  {
    Ok(pool) => pool,
    Err(e) => {
      error!("FATAL: failed to connect to database | {e:#} | Exiting...");
      std::process::exit(1)
    }
  };
  if DB_POOL.set(pool).is_err() {
    error!("FATAL: db_pool initialized more than once");
    std::process::exit(1)
  }
}

static STORE: OnceLock<Store> = OnceLock::new();

pub fn store() -> &'static Store {
  STORE.get().unwrap_or_else(|| {
    error!(
      "FATAL: store accessed before initialized | Ensure init_store() is called during startup | Exiting..."
    );
    std::process::exit(1)
  })
}

pub async fn init_store() {
  let store = match Store::connect(&config().redis_url).await {
    Ok(store) => store,
    Err(e) => {
      error!("FATAL: failed to connect to shared store | {e:#} | Exiting...");
      std::process::exit(1)
    }
  };
  if STORE.set(store).is_err() {
    error!("FATAL: store initialized more than once");
    std::process::exit(1)
  }
}

pub fn fabric() -> &'static Fabric {
  static FABRIC: OnceLock<Fabric> = OnceLock::new();
  FABRIC.get_or_init(Fabric::default)
}

pub fn rate_limiter() -> &'static RateLimiter {
  static RATE_LIMITER: OnceLock<RateLimiter> = OnceLock::new();
  RATE_LIMITER.get_or_init(|| {
    let config = config();
    RateLimiter::new(
      store().clone(),
      RateLimit::new(
        config.rate_limit_default,
        config.rate_limit_window_seconds,
      ),
    )
  })
}

pub fn http_client() -> &'static reqwest::Client {
  static HTTP_CLIENT: OnceLock<reqwest::Client> = OnceLock::new();
  HTTP_CLIENT.get_or_init(|| {
    reqwest::Client::builder()
      .timeout(std::time::Duration::from_secs(
        config().webhook_delivery_timeout_seconds,
      ))
      .build()
      .expect("failed to build webhook http client")
  })
}
