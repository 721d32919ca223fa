use std::sync::Arc;

use crate::{
  config::config,
  db, queue,
  state::{db_pool, fabric, store},
};

/// Runs once at boot, before the HTTP listener binds: migrations, then the
/// worker pool. Order matters — jobs enqueued by a handler must find the
/// schema already in place.
pub async fn run() {
  if let Err(e) = db::run_migrations(db_pool()).await {
    error!("FATAL: migration failed | {e:#} | Exiting...");
    std::process::exit(1)
  }

  let pool = Arc::new(queue::worker::WorkerPool::new(store().clone(), config().worker_concurrency()));
  pool.spawn();

  info!(
    concurrency = config().worker_concurrency(),
    "job worker pool started"
  );
}

/// Announces an orderly shutdown on every channel so connected clients can
/// distinguish it from a dropped connection.
pub async fn broadcast_shutdown() {
  fabric()
    .broadcast_to_all_channels("server.shutdown", serde_json::json!({}))
    .await;
}
