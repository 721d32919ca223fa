pub mod delivery;
pub mod signature;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::{FromRow, PgPool};
use store::Store;
use uuid::Uuid;
use validations::{StringValidator, StringValidatorMatches};

use crate::{
  config::config,
  error::{bad_request, db_error, not_found},
  queue,
};

/// The fixed catalog this server ever emits. A subscription's `events` list
/// must be a subset of these; unknown event names are rejected at
/// subscription-creation time, not silently ignored.
pub const EVENT_CATALOG: &[&str] = &[
  "user.created",
  "user.updated",
  "user.deleted",
  "task.queued",
  "task.running",
  "task.succeeded",
  "task.failed",
  "media.created",
  "media.updated",
  "media.deleted",
  "email.sent",
  "role.created",
  "role.updated",
  "role.deleted",
  "permissions.changed",
  "test.ping",
];

#[derive(Debug, Clone, FromRow, Serialize)]
pub struct Subscription {
  pub id: i64,
  pub target_url: String,
  pub events: Vec<String>,
  #[serde(skip_serializing)]
  pub secret: String,
  pub filter_map: Option<Value>,
  pub max_retries: i32,
  pub base_backoff_seconds: i64,
  pub timeout_seconds: i64,
  pub static_headers: Option<Value>,
  pub active: bool,
  pub total_deliveries: i64,
  pub successful_deliveries: i64,
  pub failed_deliveries: i64,
  pub last_delivery_at: Option<DateTime<Utc>>,
  pub last_success_at: Option<DateTime<Utc>>,
  pub last_failure_at: Option<DateTime<Utc>>,
  pub created_at: DateTime<Utc>,
}

impl Subscription {
  fn max_retries_u32(&self) -> u32 {
    self.max_retries.max(0) as u32
  }
}

#[derive(Debug, Deserialize)]
pub struct SubscriptionInput {
  pub target_url: String,
  pub events: Vec<String>,
  pub secret: String,
  #[serde(default)]
  pub filter_map: Option<Value>,
  #[serde(default = "default_max_retries")]
  pub max_retries: i32,
  #[serde(default = "default_base_backoff")]
  pub base_backoff_seconds: i64,
  #[serde(default = "default_timeout")]
  pub timeout_seconds: i64,
  #[serde(default)]
  pub static_headers: Option<Value>,
}

fn default_max_retries() -> i32 {
  3
}
fn default_base_backoff() -> i64 {
  1
}
fn default_timeout() -> i64 {
  10
}

#[derive(Debug, Deserialize, Default)]
pub struct SubscriptionUpdate {
  pub target_url: Option<String>,
  pub events: Option<Vec<String>>,
  pub secret: Option<String>,
  pub filter_map: Option<Value>,
  pub max_retries: Option<i32>,
  pub base_backoff_seconds: Option<i64>,
  pub timeout_seconds: Option<i64>,
  pub static_headers: Option<Value>,
  pub active: Option<bool>,
}

pub fn validate_events(events: &[String]) -> anyhow::Result<()> {
  for event in events {
    if !EVENT_CATALOG.contains(&event.as_str()) {
      anyhow::bail!("unknown webhook event: {event}");
    }
  }
  Ok(())
}

/// In production, a subscription target must be a public `https://` URL —
/// anything else could only ever be reached from inside this deployment's
/// own network. In dev, plain `http://` and loopback hosts are allowed so
/// the subscriber can be run locally.
fn validate_target_url(url: &str) -> anyhow::Result<()> {
  let matches = if config().production {
    StringValidatorMatches::PublicHttpsUrl
  } else {
    StringValidatorMatches::HttpUrl
  };
  StringValidator::default().min_length(1).matches(matches).validate(url)
}

pub async fn create_subscription(
  pool: &PgPool,
  input: SubscriptionInput,
) -> serror::Result<Subscription> {
  validate_events(&input.events).map_err(bad_request)?;
  validate_target_url(&input.target_url).map_err(bad_request)?;
  sqlx::query_as::<_, Subscription>(
    "INSERT INTO webhook_subscriptions
       (target_url, events, secret, filter_map, max_retries, base_backoff_seconds, timeout_seconds, static_headers)
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8)
     RETURNING *",
  )
  .bind(input.target_url)
  .bind(input.events)
  .bind(input.secret)
  .bind(input.filter_map)
  .bind(input.max_retries)
  .bind(input.base_backoff_seconds)
  .bind(input.timeout_seconds)
  .bind(input.static_headers)
  .fetch_one(pool)
  .await
  .map_err(db_error)
}

pub async fn list_subscriptions(pool: &PgPool) -> serror::Result<Vec<Subscription>> {
  sqlx::query_as::<_, Subscription>("SELECT * FROM webhook_subscriptions ORDER BY id ASC")
    .fetch_all(pool)
    .await
    .map_err(db_error)
}

pub async fn get_subscription(pool: &PgPool, id: i64) -> serror::Result<Subscription> {
  sqlx::query_as::<_, Subscription>("SELECT * FROM webhook_subscriptions WHERE id = $1")
    .bind(id)
    .fetch_one(pool)
    .await
    .map_err(db_error)
}

pub async fn update_subscription(
  pool: &PgPool,
  id: i64,
  update: SubscriptionUpdate,
) -> serror::Result<Subscription> {
  if let Some(events) = &update.events {
    validate_events(events).map_err(bad_request)?;
  }
  if let Some(target_url) = &update.target_url {
    validate_target_url(target_url).map_err(bad_request)?;
  }
  let existing = get_subscription(pool, id).await?;
  sqlx::query_as::<_, Subscription>(
    "UPDATE webhook_subscriptions SET
       target_url = $1, events = $2, secret = $3, filter_map = $4,
       max_retries = $5, base_backoff_seconds = $6, timeout_seconds = $7,
       static_headers = $8, active = $9
     WHERE id = $10
     RETURNING *",
  )
  .bind(update.target_url.unwrap_or(existing.target_url))
  .bind(update.events.unwrap_or(existing.events))
  .bind(update.secret.unwrap_or(existing.secret))
  .bind(update.filter_map.or(existing.filter_map))
  .bind(update.max_retries.unwrap_or(existing.max_retries))
  .bind(update.base_backoff_seconds.unwrap_or(existing.base_backoff_seconds))
  .bind(update.timeout_seconds.unwrap_or(existing.timeout_seconds))
  .bind(update.static_headers.or(existing.static_headers))
  .bind(update.active.unwrap_or(existing.active))
  .bind(id)
  .fetch_one(pool)
  .await
  .map_err(db_error)
}

pub async fn delete_subscription(pool: &PgPool, id: i64) -> serror::Result<()> {
  let result = sqlx::query("DELETE FROM webhook_subscriptions WHERE id = $1")
    .bind(id)
    .execute(pool)
    .await
    .map_err(db_error)?;
  if result.rows_affected() == 0 {
    return Err(not_found(format!("webhook subscription {id}")));
  }
  Ok(())
}

pub async fn list_deliveries(
  pool: &PgPool,
  subscription_id: Option<i64>,
  limit: i64,
) -> serror::Result<Vec<serde_json::Value>> {
  let rows: Vec<(serde_json::Value,)> = match subscription_id {
    Some(id) => sqlx::query_as(
      "SELECT to_jsonb(d) FROM webhook_deliveries d WHERE subscription_id = $1 ORDER BY created_at DESC LIMIT $2",
    )
    .bind(id)
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(db_error)?,
    None => sqlx::query_as(
      "SELECT to_jsonb(d) FROM webhook_deliveries d ORDER BY created_at DESC LIMIT $1",
    )
    .bind(limit)
    .fetch_all(pool)
    .await
    .map_err(db_error)?,
  };
  Ok(rows.into_iter().map(|(row,)| row).collect())
}

/// Matches `event` against every active subscription's event list, applies
/// the filter map (strict top-level key equality — deep-path filters are
/// not supported), and enqueues one delivery job per surviving subscription.
pub async fn trigger_event(
  pool: &PgPool,
  store: &Store,
  event: &str,
  kind: &str,
  payload: Value,
) -> anyhow::Result<()> {
  let subscriptions = sqlx::query_as::<_, Subscription>(
    "SELECT * FROM webhook_subscriptions WHERE active AND $1 = ANY(events)",
  )
  .bind(event)
  .fetch_all(pool)
  .await
  .map_err(db_error)?;

  // Assigned once here, not at delivery time, so every subscriber notified
  // for this occurrence shares the same event_id and timestamp.
  let event_id = Uuid::new_v4().to_string();
  let timestamp = Utc::now().to_rfc3339();

  for subscription in subscriptions {
    if !matches_filter(&subscription.filter_map, &payload) {
      continue;
    }
    queue::enqueue(store, queue::EnqueueRequest {
      function_name: "webhook.deliver".to_string(),
      args: serde_json::json!({
        "subscription_id": subscription.id,
        "event": event,
        "event_id": event_id,
        "timestamp": timestamp,
        "payload": { "kind": kind, "data": payload.clone() },
      }),
      delay_seconds: None,
      deadline: None,
      max_retries: subscription.max_retries_u32(),
      base_backoff_seconds: subscription.base_backoff_seconds,
      idempotency_key: None,
      channel: "tasks".to_string(),
    })
    .await?;
  }

  Ok(())
}

/// Top-level equality only: `{"status": "active"}` matches when
/// `payload.status == "active"`. Nested paths are not evaluated against
/// nested payload values, only direct top-level fields.
fn matches_filter(filter_map: &Option<Value>, payload: &Value) -> bool {
  let Some(Value::Object(filters)) = filter_map else {
    return true;
  };
  let Some(payload) = payload.as_object() else {
    return filters.is_empty();
  };
  filters.iter().all(|(key, expected)| payload.get(key) == Some(expected))
}

#[cfg(test)]
mod test {
  use super::*;
  use serde_json::json;

  #[test]
  fn no_filter_matches_everything() {
    assert!(matches_filter(&None, &json!({ "status": "active" })));
  }

  #[test]
  fn filter_requires_top_level_equality() {
    let filter = Some(json!({ "status": "active" }));
    assert!(matches_filter(&filter, &json!({ "status": "active", "id": 1 })));
    assert!(!matches_filter(&filter, &json!({ "status": "inactive" })));
  }

  #[test]
  fn validate_events_rejects_unknown() {
    assert!(validate_events(&["user.created".to_string()]).is_ok());
    assert!(validate_events(&["not.a.real.event".to_string()]).is_err());
  }
}
