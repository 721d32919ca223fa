use axum::{
  extract::{ConnectInfo, Request},
  http::{HeaderValue, StatusCode},
  middleware::Next,
  response::{IntoResponse, Response},
};
use rate_limit::get_ip_from_headers;
use serde_json::json;
use std::net::SocketAddr;

use crate::state::rate_limiter;

const BYPASS_PREFIXES: &[&str] = &["/health", "/"];

/// Applies the sliding-window rate limit to every request, identified by
/// client IP. Health checks and the welcome route are excluded so
/// orchestrators polling `/health` never trip it.
pub async fn rate_limit(request: Request, next: Next) -> Response {
  let path = request.uri().path().to_string();
  if BYPASS_PREFIXES.contains(&path.as_str()) {
    return next.run(request).await;
  }

  let identity = match get_ip_from_headers(request.headers()) {
    Ok(ip) => ip.to_string(),
    Err(_) => match request.extensions().get::<ConnectInfo<SocketAddr>>() {
      Some(ConnectInfo(addr)) => addr.ip().to_string(),
      None => "unknown".to_string(),
    },
  };

  let admission = rate_limiter().check(&identity, None).await;

  let mut response = if admission.allowed {
    next.run(request).await
  } else {
    (
      StatusCode::TOO_MANY_REQUESTS,
      axum::Json(json!({
        "error": "rate_limited",
        "message": "Too many requests",
        "limit": admission.limit,
        "current_usage": admission.limit.saturating_sub(admission.remaining),
        "retry_after": admission.retry_after,
        "reset_at": admission.reset_at,
      })),
    )
      .into_response()
  };

  let headers = response.headers_mut();
  headers.insert("X-RateLimit-Limit", HeaderValue::from(admission.limit));
  headers.insert("X-RateLimit-Remaining", HeaderValue::from(admission.remaining));
  headers.insert("X-RateLimit-Reset", HeaderValue::from(admission.reset_at));
  if let Some(retry_after) = admission.retry_after {
    headers.insert("Retry-After", HeaderValue::from(retry_after));
  }

  response
}
