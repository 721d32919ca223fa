use axum::{Json, Router, routing::get};
use serde_json::{Value, json};

pub fn router() -> Router {
  Router::new().route("/", get(welcome)).route("/health", get(health))
}

async fn welcome() -> Json<Value> {
  Json(json!({
    "name": crate::config::config().source_name,
    "version": env!("CARGO_PKG_VERSION"),
    "docs": Value::Null,
  }))
}

async fn health() -> Json<Value> {
  Json(json!({ "status": "ok" }))
}
