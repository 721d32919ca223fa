#[macro_use]
extern crate tracing;

mod api;
mod config;
mod db;
mod error;
mod queue;
mod rate_limit_mw;
mod resource;
mod startup;
mod state;
mod webhook;
mod ws;

use config::config;

#[tokio::main]
async fn main() -> anyhow::Result<()> {
  let config = config();
  // Held for the process lifetime: dropping it early silently stops the
  // file writer thread.
  let _guard = logger::init(&config.log_config())?;

  info!("relay core version: v{}", env!("CARGO_PKG_VERSION"));

  state::init_db_pool().await;
  state::init_store().await;

  startup::run().await;

  let listener = match tokio::net::TcpListener::bind((config.bind_ip.as_str(), config.port)).await {
    Ok(listener) => listener,
    Err(e) => {
      error!("FATAL: failed to bind {}:{} | {e:#} | Exiting...", config.bind_ip, config.port);
      std::process::exit(1)
    }
  };

  info!("listening on {}:{}", config.bind_ip, config.port);

  axum::serve(
    listener,
    api::app().into_make_service_with_connect_info::<std::net::SocketAddr>(),
  )
  .with_graceful_shutdown(shutdown_signal())
  .await?;

  Ok(())
}

async fn shutdown_signal() {
  let ctrl_c = async {
    tokio::signal::ctrl_c().await.expect("failed to install SIGINT handler");
  };

  #[cfg(unix)]
  let terminate = async {
    tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate())
      .expect("failed to install SIGTERM handler")
      .recv()
      .await;
  };

  #[cfg(not(unix))]
  let terminate = std::future::pending::<()>();

  tokio::select! {
    _ = ctrl_c => {},
    _ = terminate => {},
  }

  info!("shutdown signal received, notifying connected clients");
  startup::broadcast_shutdown().await;
}
