//! Generic CRUD engine. Each resource kind implements [`ResourceKind`] and
//! gets create/get/update/delete/filter for free — no per-kind handler
//! duplicates the SQL or the broadcast/webhook fan-out.

pub mod kinds;

use anyhow::Context;
use reqwest::StatusCode;
use serde::{Serialize, de::DeserializeOwned};
use serde_json::Value;
use serror::AddStatusCode;
use sqlx::{PgPool, QueryBuilder, Row};

use crate::{
  db::{
    ResourceRow,
    filter::{FilterRequest, push_predicate},
  },
  error::{bad_request, db_error, not_found},
  state::{db_pool, fabric, store},
  webhook,
  ws::ChangeKind,
};

/// Implemented once per resource kind (users, posts, media, ...). `Input` is
/// what `POST` accepts, `Update` is what `PATCH` accepts (all fields
/// optional), `Output` is what every read and broadcast emits.
pub trait ResourceKind: Sized {
  const KIND: &'static str;

  /// Prefix used for this kind's webhook events (`{EVENT_PREFIX}.created`,
  /// etc.), per the fixed entries in `webhook::EVENT_CATALOG`. Distinct from
  /// `KIND`, which names the DB row/WS channel and is often plural where the
  /// event catalog is singular (`"users"` vs `"user.created"`).
  const EVENT_PREFIX: &'static str;

  /// Column names eligible for `filter`/`filter/paginated`. Anything not
  /// listed here is dropped to a no-op predicate rather than erroring.
  const FIELDS: &'static [&'static str];

  type Input: DeserializeOwned + Send;
  type Update: DeserializeOwned + Send;
  type Output: Serialize + DeserializeOwned + Send + Unpin;

  /// Validate and normalize user input into the stored JSON attributes.
  /// Runs before the row is inserted.
  fn validate_create(input: Self::Input) -> anyhow::Result<Value>;

  /// Merge `update` onto the existing stored attributes, validating the
  /// result. Runs before the row is updated.
  fn merge_update(
    existing: &Value,
    update: Self::Update,
  ) -> anyhow::Result<Value>;

  /// Project a stored row into the public output shape.
  fn project(row: ResourceRow) -> anyhow::Result<Self::Output>;
}

pub async fn get_by_id<T: ResourceKind>(
  pool: &PgPool,
  id: i64,
) -> serror::Result<T::Output> {
  let row = sqlx::query_as::<_, ResourceRow>(
    "SELECT id, kind, attributes, created_at, updated_at FROM resources WHERE kind = $1 AND id = $2",
  )
  .bind(T::KIND)
  .bind(id)
  .fetch_optional(pool)
  .await
  .map_err(db_error)?
  .ok_or_else(|| not_found(format!("{} {id}", T::KIND)))?;
  T::project(row).map_err(|e| e.status_code(StatusCode::INTERNAL_SERVER_ERROR))
}

pub async fn get_all<T: ResourceKind>(
  pool: &PgPool,
  skip: i64,
  limit: i64,
) -> serror::Result<Vec<T::Output>> {
  if !(1..=1000).contains(&limit) {
    return Err(bad_request("limit must be in [1, 1000]"));
  }
  let rows = sqlx::query_as::<_, ResourceRow>(
    "SELECT id, kind, attributes, created_at, updated_at FROM resources
     WHERE kind = $1 ORDER BY id ASC OFFSET $2 LIMIT $3",
  )
  .bind(T::KIND)
  .bind(skip)
  .bind(limit)
  .fetch_all(pool)
  .await
  .map_err(db_error)?;
  project_all::<T>(rows)
}

pub async fn count<T: ResourceKind>(pool: &PgPool) -> serror::Result<i64> {
  let row = sqlx::query("SELECT count(*) AS n FROM resources WHERE kind = $1")
    .bind(T::KIND)
    .fetch_one(pool)
    .await
    .map_err(db_error)?;
  Ok(row.try_get::<i64, _>("n").map_err(db_error)?)
}

pub async fn create<T: ResourceKind>(
  pool: &PgPool,
  input: T::Input,
) -> serror::Result<T::Output> {
  let attributes = T::validate_create(input)
    .map_err(|e| e.status_code(StatusCode::BAD_REQUEST))?;

  let row = sqlx::query_as::<_, ResourceRow>(
    "INSERT INTO resources (kind, attributes) VALUES ($1, $2)
     RETURNING id, kind, attributes, created_at, updated_at",
  )
  .bind(T::KIND)
  .bind(&attributes)
  .fetch_one(pool)
  .await
  .map_err(db_error)?;

  let output = T::project(row).map_err(|e| e.status_code(StatusCode::INTERNAL_SERVER_ERROR))?;
  fan_out::<T>(ChangeKind::Created, &output).await;
  invalidate_cache::<T>().await;
  Ok(output)
}

pub async fn update<T: ResourceKind>(
  pool: &PgPool,
  id: i64,
  update: T::Update,
) -> serror::Result<T::Output> {
  let existing = sqlx::query_as::<_, ResourceRow>(
    "SELECT id, kind, attributes, created_at, updated_at FROM resources WHERE kind = $1 AND id = $2",
  )
  .bind(T::KIND)
  .bind(id)
  .fetch_optional(pool)
  .await
  .map_err(db_error)?
  .ok_or_else(|| not_found(format!("{} {id}", T::KIND)))?;

  let attributes = T::merge_update(&existing.attributes, update)
    .map_err(|e| e.status_code(StatusCode::BAD_REQUEST))?;

  let row = sqlx::query_as::<_, ResourceRow>(
    "UPDATE resources SET attributes = $1, updated_at = now()
     WHERE kind = $2 AND id = $3
     RETURNING id, kind, attributes, created_at, updated_at",
  )
  .bind(&attributes)
  .bind(T::KIND)
  .bind(id)
  .fetch_one(pool)
  .await
  .map_err(db_error)?;

  let output = T::project(row).map_err(|e| e.status_code(StatusCode::INTERNAL_SERVER_ERROR))?;
  fan_out::<T>(ChangeKind::Updated, &output).await;
  invalidate_cache::<T>().await;
  Ok(output)
}

pub async fn delete<T: ResourceKind>(
  pool: &PgPool,
  id: i64,
) -> serror::Result<T::Output> {
  let row = sqlx::query_as::<_, ResourceRow>(
    "DELETE FROM resources WHERE kind = $1 AND id = $2
     RETURNING id, kind, attributes, created_at, updated_at",
  )
  .bind(T::KIND)
  .bind(id)
  .fetch_optional(pool)
  .await
  .map_err(db_error)?
  .ok_or_else(|| not_found(format!("{} {id}", T::KIND)))?;

  let output = T::project(row).map_err(|e| e.status_code(StatusCode::INTERNAL_SERVER_ERROR))?;
  fan_out::<T>(ChangeKind::Deleted, &output).await;
  invalidate_cache::<T>().await;
  Ok(output)
}

pub async fn filter<T: ResourceKind>(
  pool: &PgPool,
  request: &FilterRequest,
) -> serror::Result<Vec<T::Output>> {
  request.validate().map_err(bad_request)?;

  let mut builder = QueryBuilder::new(
    "SELECT id, kind, attributes, created_at, updated_at FROM resources",
  );
  builder.push(" WHERE kind = ").push_bind(T::KIND).push(" AND ");
  push_predicate(&mut builder, &request.query, T::FIELDS);

  if let Some(order_by) = request.order_by.as_deref().filter(|f| T::FIELDS.contains(f)) {
    let direction = match request.direction {
      crate::db::filter::SortDirection::Asc => "ASC",
      crate::db::filter::SortDirection::Desc => "DESC",
    };
    builder.push(format!(" ORDER BY attributes ->> '{order_by}' {direction}"));
  } else {
    builder.push(" ORDER BY id ASC");
  }

  builder.push(" LIMIT ").push_bind(request.limit);
  builder.push(" OFFSET ").push_bind(request.offset);

  let rows = builder
    .build_query_as::<ResourceRow>()
    .fetch_all(pool)
    .await
    .map_err(db_error)?;
  project_all::<T>(rows)
}

pub async fn count_filtered<T: ResourceKind>(
  pool: &PgPool,
  request: &FilterRequest,
) -> serror::Result<i64> {
  let mut builder = QueryBuilder::new("SELECT count(*) AS n FROM resources");
  builder.push(" WHERE kind = ").push_bind(T::KIND).push(" AND ");
  push_predicate(&mut builder, &request.query, T::FIELDS);
  let row = builder.build().fetch_one(pool).await.map_err(db_error)?;
  Ok(row.try_get::<i64, _>("n").map_err(db_error)?)
}

fn project_all<T: ResourceKind>(rows: Vec<ResourceRow>) -> serror::Result<Vec<T::Output>> {
  rows
    .into_iter()
    .map(T::project)
    .collect::<anyhow::Result<Vec<_>>>()
    .map_err(|e| e.status_code(StatusCode::INTERNAL_SERVER_ERROR))
    .map_err(Into::into)
}

/// Forwards a mutation to the channel fabric and the webhook dispatcher.
/// Failures in either are logged, never surfaced: broadcast/webhook
/// delivery never rolls back the write that already committed.
async fn fan_out<T: ResourceKind>(kind: ChangeKind, output: &T::Output) {
  let payload = match serde_json::to_value(output) {
    Ok(value) => value,
    Err(e) => {
      tracing::warn!(subsystem = "resource_engine", error = %e, "failed to serialize output for fan-out");
      return;
    }
  };

  fabric().broadcast_change(T::KIND, kind, payload.clone()).await;

  let event = format!("{}.{}", T::EVENT_PREFIX, kind.as_event_suffix());
  if let Err(e) = webhook::trigger_event(db_pool(), store(), &event, T::KIND, payload).await {
    tracing::warn!(subsystem = "webhook", error = %e, event, "failed to trigger webhook event");
  }
}

async fn invalidate_cache<T: ResourceKind>() {
  let pattern = format!("{}:*", T::KIND);
  if let Err(e) = store().del_pattern(&pattern).await {
    tracing::debug!(subsystem = "resource_engine", error = %e, pattern, "cache invalidation skipped");
  }
}
