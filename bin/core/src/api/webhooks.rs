use axum::{
  Json, Router,
  extract::{Path, Query, State},
  http::StatusCode,
  routing::{get, patch, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::PgPool;

use crate::{
  state::http_client,
  webhook::{self, Subscription, SubscriptionInput, SubscriptionUpdate, delivery},
};

pub fn router(pool: PgPool) -> Router {
  Router::new()
    .route("/subscriptions", get(list_subscriptions).post(create_subscription))
    .route("/subscriptions/{id}", patch(update_subscription).delete(delete_subscription))
    .route("/subscriptions/{id}/stats", get(subscription_stats))
    .route("/deliveries", get(list_deliveries))
    .route("/test", post(test_webhook))
    .with_state(pool)
}

async fn create_subscription(
  State(pool): State<PgPool>,
  Json(input): Json<SubscriptionInput>,
) -> serror::Result<(StatusCode, Json<Subscription>)> {
  let subscription = webhook::create_subscription(&pool, input).await?;
  Ok((StatusCode::CREATED, Json(subscription)))
}

async fn list_subscriptions(State(pool): State<PgPool>) -> serror::Result<Json<Vec<Subscription>>> {
  let subscriptions = webhook::list_subscriptions(&pool).await?;
  Ok(Json(subscriptions))
}

async fn update_subscription(
  State(pool): State<PgPool>,
  Path(id): Path<i64>,
  Json(update): Json<SubscriptionUpdate>,
) -> serror::Result<Json<Subscription>> {
  let subscription = webhook::update_subscription(&pool, id, update).await?;
  Ok(Json(subscription))
}

async fn delete_subscription(
  State(pool): State<PgPool>,
  Path(id): Path<i64>,
) -> serror::Result<StatusCode> {
  webhook::delete_subscription(&pool, id).await?;
  Ok(StatusCode::NO_CONTENT)
}

async fn subscription_stats(
  State(pool): State<PgPool>,
  Path(id): Path<i64>,
) -> serror::Result<Json<Value>> {
  let subscription = webhook::get_subscription(&pool, id).await?;
  Ok(Json(json!({
    "id": subscription.id,
    "total_deliveries": subscription.total_deliveries,
    "successful_deliveries": subscription.successful_deliveries,
    "failed_deliveries": subscription.failed_deliveries,
    "last_delivery_at": subscription.last_delivery_at,
    "last_success_at": subscription.last_success_at,
    "last_failure_at": subscription.last_failure_at,
  })))
}

#[derive(Debug, Deserialize)]
struct DeliveriesQuery {
  subscription_id: Option<i64>,
  #[serde(default = "default_limit")]
  limit: i64,
}

fn default_limit() -> i64 {
  50
}

async fn list_deliveries(
  State(pool): State<PgPool>,
  Query(query): Query<DeliveriesQuery>,
) -> serror::Result<Json<Vec<Value>>> {
  let deliveries = webhook::list_deliveries(&pool, query.subscription_id, query.limit).await?;
  Ok(Json(deliveries))
}

#[derive(Debug, Deserialize)]
struct TestRequest {
  url: String,
  secret: String,
  #[serde(default = "default_timeout")]
  timeout_seconds: u64,
  #[serde(default)]
  headers: std::collections::HashMap<String, String>,
}

fn default_timeout() -> u64 {
  10
}

async fn test_webhook(Json(request): Json<TestRequest>) -> serror::Result<Json<delivery::TestOutcome>> {
  let outcome = delivery::test_delivery(
    http_client(),
    &request.url,
    &request.secret,
    request.timeout_seconds,
    &request.headers,
  )
  .await?;
  Ok(Json(outcome))
}
