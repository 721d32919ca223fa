mod health;
mod resource;
mod tasks;
mod webhooks;

use axum::{
  Router,
  http::{HeaderName, HeaderValue},
};
use tower_http::{set_header::SetResponseHeaderLayer, trace::TraceLayer};

use crate::{
  config::cors_layer,
  resource::kinds::{Media, Users},
  state::db_pool,
};

/// Builds the full HTTP surface: the generic resource routers, the webhook
/// admin API, the task queue entrypoint, and `/ws`, wrapped in the same
/// security headers and CORS policy on every response.
pub fn app() -> Router {
  let pool = db_pool().clone();

  Router::new()
    .merge(health::router())
    .nest("/users", resource::router::<Users>(pool.clone()))
    .nest("/media", resource::router::<Media>(pool.clone()))
    .nest("/webhooks", webhooks::router(pool.clone()))
    .nest("/tasks", tasks::router())
    .nest("/ws", crate::ws::router())
    .route_layer(axum::middleware::from_fn(crate::rate_limit_mw::rate_limit))
    .layer(TraceLayer::new_for_http())
    .layer(cors_layer())
    .layer(SetResponseHeaderLayer::overriding(
      HeaderName::from_static("x-content-type-options"),
      HeaderValue::from_static("nosniff"),
    ))
    .layer(SetResponseHeaderLayer::overriding(
      HeaderName::from_static("x-frame-options"),
      HeaderValue::from_static("DENY"),
    ))
    .layer(SetResponseHeaderLayer::overriding(
      HeaderName::from_static("x-xss-protection"),
      HeaderValue::from_static("1; mode=block"),
    ))
    .layer(SetResponseHeaderLayer::overriding(
      HeaderName::from_static("referrer-policy"),
      HeaderValue::from_static("strict-origin-when-cross-origin"),
    ))
}
