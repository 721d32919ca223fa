pub mod jobs;
pub mod worker;

use serde::{Deserialize, Serialize};
use serde_json::Value;
use store::Store;
use uuid::Uuid;

pub(crate) const QUEUE_KEY: &str = "queue:jobs";
const DELAYED_KEY: &str = "queue:delayed";
const DEAD_LETTER_KEY: &str = "queue:dead_letter";
const MAX_BACKOFF_SECONDS: i64 = 3600;

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Job {
  pub id: String,
  pub function_name: String,
  pub args: Value,
  pub attempt: u32,
  pub max_retries: u32,
  /// Base for exponential backoff: `base * 2^attempt`, capped at one hour.
  pub base_backoff_seconds: i64,
  pub enqueued_at: i64,
  pub deadline: Option<i64>,
  /// WS channel job-progress notifications are published against, so a
  /// client connected to e.g. `/ws/media` gets this job's `task_notification`
  /// frames. Defaults to `"tasks"` for jobs with no particular resource kind.
  pub channel: String,
}

impl Job {
  fn backoff_seconds(&self) -> i64 {
    let exp = self.base_backoff_seconds.saturating_mul(1i64 << self.attempt.min(16));
    exp.min(MAX_BACKOFF_SECONDS)
  }

  pub fn is_past_deadline(&self, now: i64) -> bool {
    self.deadline.is_some_and(|deadline| now > deadline)
  }
}

pub struct EnqueueRequest {
  pub function_name: String,
  pub args: Value,
  /// Delay, in seconds, before the job becomes eligible for dispatch.
  pub delay_seconds: Option<i64>,
  /// Absolute unix timestamp after which the job is abandoned rather than
  /// retried.
  pub deadline: Option<i64>,
  pub max_retries: u32,
  pub base_backoff_seconds: i64,
  /// When set, a second `enqueue` with the same key while the first is
  /// still pending or in flight is a no-op.
  pub idempotency_key: Option<String>,
  /// See [`Job::channel`].
  pub channel: String,
}

/// Submits a job. Returns the job id, which may be an existing id if
/// `idempotency_key` matched a job already queued.
pub async fn enqueue(store: &Store, request: EnqueueRequest) -> anyhow::Result<String> {
  if let Some(key) = &request.idempotency_key
    && let Some(existing_id) = store.get_string(&idempotency_key(key)).await?
  {
    return Ok(existing_id);
  }

  let id = Uuid::new_v4().to_string();
  let now = now_secs();
  let job = Job {
    id: id.clone(),
    function_name: request.function_name,
    args: request.args,
    attempt: 0,
    max_retries: request.max_retries,
    base_backoff_seconds: request.base_backoff_seconds,
    enqueued_at: now,
    deadline: request.deadline,
    channel: request.channel,
  };

  let payload = serde_json::to_string(&job)?;

  match request.delay_seconds {
    Some(delay) if delay > 0 => {
      store.zadd(DELAYED_KEY, &payload, (now + delay) as f64).await?;
    }
    _ => {
      store.lpush(QUEUE_KEY, &payload).await?;
    }
  }

  if let Some(key) = request.idempotency_key {
    // Idempotency window matches the deadline when set, else one hour.
    let ttl = request.deadline.map(|d| (d - now).max(1) as u64).unwrap_or(3600);
    store.set_json(&idempotency_key(&key), &id, Some(ttl)).await?;
  }

  publish_progress(store, &id, &job.channel, "queued", None).await;
  Ok(id)
}

/// Moves any delayed job whose ready-time has passed onto the main queue.
/// Called periodically by the worker pool's scheduler loop.
pub async fn promote_ready_delayed_jobs(store: &Store) -> anyhow::Result<usize> {
  let now = now_secs() as f64;
  let ready = store.zrangebyscore(DELAYED_KEY, f64::MIN, now).await?;
  let count = ready.len();
  if count > 0 {
    store.zremrangebyscore(DELAYED_KEY, f64::MIN, now).await?;
    for payload in ready {
      store.lpush(QUEUE_KEY, &payload).await?;
    }
  }
  Ok(count)
}

pub async fn requeue_with_backoff(store: &Store, mut job: Job) -> anyhow::Result<()> {
  let delay = job.backoff_seconds();
  job.attempt += 1;
  let payload = serde_json::to_string(&job)?;
  store.zadd(DELAYED_KEY, &payload, (now_secs() + delay) as f64).await
}

pub async fn dead_letter(store: &Store, job: &Job, error: &str) -> anyhow::Result<()> {
  let entry = serde_json::json!({ "job": job, "error": error, "failed_at": now_secs() });
  store.lpush(DEAD_LETTER_KEY, &entry.to_string()).await
}

pub async fn publish_progress(
  store: &Store,
  job_id: &str,
  channel: &str,
  status: &str,
  detail: Option<Value>,
) {
  let payload = serde_json::json!({ "job_id": job_id, "status": status, "detail": detail });
  let topic = format!("task_notifications:{channel}:{job_id}");
  if let Err(e) = store.publish(&topic, &payload.to_string()).await {
    tracing::debug!(subsystem = "queue", error = %e, job_id, channel, "failed to publish job progress");
  }
  // Retained for polling (`GET /tasks/{id}/status`) independent of whether
  // anyone was subscribed at the moment the notification fired.
  if let Err(e) = store.set_json(&status_key(job_id), &payload, Some(86400)).await {
    tracing::debug!(subsystem = "queue", error = %e, job_id, "failed to persist job status");
  }
}

/// Last known status for a job, for callers that poll rather than
/// subscribe to `task_notifications:<id>`.
pub async fn get_status(store: &Store, job_id: &str) -> anyhow::Result<Option<Value>> {
  store.get_json(&status_key(job_id)).await
}

fn status_key(job_id: &str) -> String {
  format!("queue:status:{job_id}")
}

fn idempotency_key(key: &str) -> String {
  format!("queue:idempotency:{key}")
}

fn now_secs() -> i64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .map(|d| d.as_secs() as i64)
    .unwrap_or(0)
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn backoff_grows_exponentially_and_caps() {
    let job = Job {
      id: "1".into(),
      function_name: "noop".into(),
      args: Value::Null,
      attempt: 0,
      max_retries: 5,
      base_backoff_seconds: 1,
      enqueued_at: 0,
      deadline: None,
      channel: "tasks".into(),
    };
    assert_eq!(job.backoff_seconds(), 1);
    let mut later = job.clone();
    later.attempt = 20;
    assert_eq!(later.backoff_seconds(), MAX_BACKOFF_SECONDS);
  }

  #[test]
  fn deadline_detection() {
    let job = Job {
      id: "1".into(),
      function_name: "noop".into(),
      args: Value::Null,
      attempt: 0,
      max_retries: 5,
      base_backoff_seconds: 1,
      enqueued_at: 0,
      deadline: Some(100),
      channel: "tasks".into(),
    };
    assert!(!job.is_past_deadline(50));
    assert!(job.is_past_deadline(200));
  }
}
