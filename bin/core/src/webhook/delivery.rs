use chrono::Utc;
use serde::Serialize;
use serde_json::Value;
use sqlx::PgPool;

use super::{Subscription, signature};
use crate::error::db_error;

const MAX_BACKOFF_SECONDS: i64 = 3600;

#[derive(Debug, Clone, Serialize)]
pub struct DeliveryOutcome {
  pub success: bool,
  pub status_code: Option<i32>,
  pub duration_ms: i64,
  pub will_retry: bool,
}

/// The un-persisted `POST /webhooks/test` operation's response shape —
/// distinct from [`DeliveryOutcome`] because a test send never retries and
/// reports the subscriber's raw response for debugging.
#[derive(Debug, Clone, Serialize)]
pub struct TestOutcome {
  pub success: bool,
  pub status_code: Option<i32>,
  pub response_body: Option<String>,
  pub duration_ms: i64,
  pub error_message: Option<String>,
}

/// Performs one delivery attempt against a subscription already loaded and
/// matched by the caller, records it, and updates the subscription's
/// rolling counters. Retries, if any, are the caller's (the job queue's)
/// responsibility — this only reports whether a retry should happen.
pub async fn deliver(
  pool: &PgPool,
  client: &reqwest::Client,
  subscription_id: i64,
  event: &str,
  event_id: &str,
  timestamp: &str,
  payload: Value,
) -> anyhow::Result<DeliveryOutcome> {
  let subscription = super::get_subscription(pool, subscription_id)
    .await
    .map_err(|e| anyhow::anyhow!("{e}"))?;

  let body = serde_json::json!({
    "event_type": event,
    "event_id": event_id,
    "timestamp": timestamp,
    "source": crate::config::config().source_name,
    "version": "1.0",
    "data": payload,
  });
  let canonical = signature::canonicalize(&body);
  let sig = signature::sign(&subscription.secret, &canonical);

  let mut request = client
    .post(&subscription.target_url)
    .timeout(std::time::Duration::from_secs(subscription.timeout_seconds as u64))
    .header("Content-Type", "application/json")
    .header("X-Webhook-Signature", sig)
    .header("X-Webhook-Event", event)
    .header("X-Webhook-Delivery", event_id);

  if let Some(headers) = &subscription.static_headers
    && let Some(map) = headers.as_object()
  {
    for (key, value) in map {
      if let Some(value) = value.as_str() {
        request = request.header(key.as_str(), value);
      }
    }
  }

  let started = std::time::Instant::now();
  let send_result = request.body(canonical.clone()).send().await;
  let duration_ms = started.elapsed().as_millis() as i64;

  let (success, status_code, response_body) = match &send_result {
    Ok(response) => {
      let status = response.status();
      (status.is_success(), Some(status.as_u16() as i32), None)
    }
    Err(e) => (false, None, Some(e.to_string())),
  };

  // A 4xx means the subscriber rejected the request; retrying it verbatim
  // won't help, so it goes straight to failed_final. 5xx and connection
  // errors/timeouts are assumed transient on the subscriber's end.
  let retryable = match status_code {
    Some(code) => !(400..500).contains(&code),
    None => true,
  };

  let attempt = record_delivery(
    pool,
    &subscription,
    event,
    event_id,
    &body,
    status_code,
    response_body.as_deref(),
    duration_ms,
    success,
    retryable,
  )
  .await?;

  update_subscription_counters(pool, subscription_id, success).await?;

  Ok(DeliveryOutcome {
    success,
    status_code,
    duration_ms,
    will_retry: !success && retryable && attempt < subscription.max_retries_u32(),
  })
}

#[allow(clippy::too_many_arguments)]
async fn record_delivery(
  pool: &PgPool,
  subscription: &Subscription,
  event: &str,
  event_id: &str,
  payload: &Value,
  status_code: Option<i32>,
  response_body: Option<&str>,
  duration_ms: i64,
  success: bool,
  retryable: bool,
) -> anyhow::Result<u32> {
  let attempt_row: (i64,) = sqlx::query_as(
    "SELECT count(*) FROM webhook_deliveries WHERE subscription_id = $1 AND event_id = $2",
  )
  .bind(subscription.id)
  .bind(event_id.parse::<uuid::Uuid>().unwrap_or_else(|_| uuid::Uuid::nil()))
  .fetch_one(pool)
  .await
  .map_err(db_error)?;
  let attempt = attempt_row.0 as u32 + 1;
  let will_retry = !success && retryable && attempt < subscription.max_retries_u32();
  let next_retry_at = will_retry.then(|| {
    let exp = subscription.base_backoff_seconds.saturating_mul(1i64 << (attempt - 1).min(16));
    Utc::now() + chrono::Duration::seconds(exp.min(MAX_BACKOFF_SECONDS))
  });

  sqlx::query(
    "INSERT INTO webhook_deliveries
       (subscription_id, event, event_id, payload, url, status_code, response_body, duration_ms, attempt, success, will_retry, next_retry_at)
     VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9, $10, $11, $12)",
  )
  .bind(subscription.id)
  .bind(event)
  .bind(event_id.parse::<uuid::Uuid>().unwrap_or_else(|_| uuid::Uuid::nil()))
  .bind(payload)
  .bind(&subscription.target_url)
  .bind(status_code)
  .bind(response_body)
  .bind(duration_ms)
  .bind(attempt as i32)
  .bind(success)
  .bind(will_retry)
  .bind(next_retry_at)
  .execute(pool)
  .await
  .map_err(db_error)?;

  Ok(attempt)
}

async fn update_subscription_counters(
  pool: &PgPool,
  subscription_id: i64,
  success: bool,
) -> anyhow::Result<()> {
  if success {
    sqlx::query(
      "UPDATE webhook_subscriptions SET
         total_deliveries = total_deliveries + 1,
         successful_deliveries = successful_deliveries + 1,
         last_delivery_at = now(),
         last_success_at = now()
       WHERE id = $1",
    )
  } else {
    sqlx::query(
      "UPDATE webhook_subscriptions SET
         total_deliveries = total_deliveries + 1,
         failed_deliveries = failed_deliveries + 1,
         last_delivery_at = now(),
         last_failure_at = now()
       WHERE id = $1",
    )
  }
  .bind(subscription_id)
  .execute(pool)
  .await
  .map_err(db_error)?;
  Ok(())
}

/// The synchronous, un-persisted `POST /webhooks/test` operation: sends one
/// request and reports the result without touching delivery history.
pub async fn test_delivery(
  client: &reqwest::Client,
  url: &str,
  secret: &str,
  timeout_seconds: u64,
  headers: &std::collections::HashMap<String, String>,
) -> anyhow::Result<TestOutcome> {
  let body = serde_json::json!({
    "event_type": "test.ping",
    "event_id": uuid::Uuid::new_v4().to_string(),
    "timestamp": chrono::Utc::now().to_rfc3339(),
    "source": crate::config::config().source_name,
    "version": "1.0",
    "data": {},
  });
  let canonical = signature::canonicalize(&body);
  let sig = signature::sign(secret, &canonical);

  let mut request = client
    .post(url)
    .timeout(std::time::Duration::from_secs(timeout_seconds))
    .header("Content-Type", "application/json")
    .header("X-Webhook-Signature", sig)
    .header("X-Webhook-Event", "test.ping");
  for (key, value) in headers {
    request = request.header(key.as_str(), value.as_str());
  }

  let started = std::time::Instant::now();
  let send_result = request.body(canonical).send().await;
  let duration_ms = started.elapsed().as_millis() as i64;

  let (success, status_code, response_body, error_message) = match send_result {
    Ok(response) => {
      let status = response.status();
      let body = response.text().await.ok();
      (status.is_success(), Some(status.as_u16() as i32), body, None)
    }
    Err(e) => (false, None, None, Some(e.to_string())),
  };

  Ok(TestOutcome { success, status_code, response_body, duration_ms, error_message })
}
