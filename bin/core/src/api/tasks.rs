//! `/tasks` submits and polls background jobs directly, independent of the
//! resource engine's own fan-out-triggered enqueues.

use axum::{
  Json, Router,
  extract::Path,
  http::StatusCode,
  routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};

use crate::{error::not_found, queue, state::store};

pub fn router() -> Router {
  Router::new()
    .route("/{family}/{function}", post(enqueue))
    .route("/{id}/status", get(status))
}

#[derive(Debug, Deserialize)]
struct EnqueueBody {
  args: Value,
  #[serde(default)]
  delay_seconds: Option<i64>,
  #[serde(default)]
  deadline: Option<i64>,
  #[serde(default = "default_max_retries")]
  max_retries: u32,
  #[serde(default = "default_base_backoff")]
  base_backoff_seconds: i64,
  #[serde(default)]
  idempotency_key: Option<String>,
  #[serde(default = "default_channel")]
  channel: String,
}

fn default_max_retries() -> u32 {
  3
}
fn default_base_backoff() -> i64 {
  1
}
fn default_channel() -> String {
  "tasks".to_string()
}

async fn enqueue(
  Path((family, function)): Path<(String, String)>,
  Json(body): Json<EnqueueBody>,
) -> serror::Result<(StatusCode, Json<Value>)> {
  let function_name = format!("{family}.{function}");
  let job_id = queue::enqueue(store(), queue::EnqueueRequest {
    function_name,
    args: body.args,
    delay_seconds: body.delay_seconds,
    deadline: body.deadline,
    max_retries: body.max_retries,
    base_backoff_seconds: body.base_backoff_seconds,
    idempotency_key: body.idempotency_key,
    channel: body.channel,
  })
  .await
  .map_err(|e| anyhow::anyhow!("{e}"))?;
  Ok((StatusCode::ACCEPTED, Json(json!({ "task_id": job_id }))))
}

async fn status(Path(id): Path<String>) -> serror::Result<Json<Value>> {
  let status = queue::get_status(store(), &id)
    .await
    .map_err(|e| anyhow::anyhow!("{e}"))?
    .ok_or_else(|| not_found(format!("task {id}")))?;
  Ok(Json(status))
}
