//! One router per resource kind, built generically over [`ResourceKind`] so
//! adding a kind never means writing another set of CRUD handlers.

use axum::{
  Json, Router,
  extract::{Path, Query, State},
  http::StatusCode,
  routing::{get, post},
};
use serde::Deserialize;
use serde_json::{Value, json};
use sqlx::PgPool;

use crate::{db::filter::FilterRequest, resource::ResourceKind};

#[derive(Debug, Deserialize)]
struct ListQuery {
  #[serde(default)]
  skip: i64,
  #[serde(default = "default_limit")]
  limit: i64,
}

fn default_limit() -> i64 {
  100
}

pub fn router<T: ResourceKind + 'static>(pool: PgPool) -> Router {
  Router::new()
    .route("/", get(list::<T>).post(create::<T>))
    .route("/filter", post(filter::<T>))
    .route("/filter/paginated", post(filter_paginated::<T>))
    .route("/{id}", get(get_one::<T>).patch(update::<T>).delete(delete_one::<T>))
    .with_state(pool)
}

async fn list<T: ResourceKind>(
  State(pool): State<PgPool>,
  Query(query): Query<ListQuery>,
) -> serror::Result<Json<Vec<T::Output>>> {
  let items = crate::resource::get_all::<T>(&pool, query.skip, query.limit).await?;
  Ok(Json(items))
}

async fn get_one<T: ResourceKind>(
  State(pool): State<PgPool>,
  Path(id): Path<i64>,
) -> serror::Result<Json<T::Output>> {
  let item = crate::resource::get_by_id::<T>(&pool, id).await?;
  Ok(Json(item))
}

async fn create<T: ResourceKind>(
  State(pool): State<PgPool>,
  Json(input): Json<T::Input>,
) -> serror::Result<(StatusCode, Json<T::Output>)> {
  let item = crate::resource::create::<T>(&pool, input).await?;
  Ok((StatusCode::CREATED, Json(item)))
}

async fn update<T: ResourceKind>(
  State(pool): State<PgPool>,
  Path(id): Path<i64>,
  Json(update): Json<T::Update>,
) -> serror::Result<Json<T::Output>> {
  let item = crate::resource::update::<T>(&pool, id, update).await?;
  Ok(Json(item))
}

async fn delete_one<T: ResourceKind>(
  State(pool): State<PgPool>,
  Path(id): Path<i64>,
) -> serror::Result<StatusCode> {
  crate::resource::delete::<T>(&pool, id).await?;
  Ok(StatusCode::NO_CONTENT)
}

async fn filter<T: ResourceKind>(
  State(pool): State<PgPool>,
  Json(request): Json<FilterRequest>,
) -> serror::Result<Json<Vec<T::Output>>> {
  let items = crate::resource::filter::<T>(&pool, &request).await?;
  Ok(Json(items))
}

async fn filter_paginated<T: ResourceKind>(
  State(pool): State<PgPool>,
  Json(request): Json<FilterRequest>,
) -> serror::Result<Json<Value>> {
  let items = crate::resource::filter::<T>(&pool, &request).await?;
  let total = crate::resource::count_filtered::<T>(&pool, &request).await?;
  Ok(Json(json!({
    "items": items,
    "total": total,
    "limit": request.limit,
    "offset": request.offset,
  })))
}
