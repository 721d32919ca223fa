use std::net::IpAddr;

use anyhow::anyhow;
use axum::http::{HeaderMap, StatusCode};
use serror::AddStatusCode;
use store::Store;

/// A single rate-limit rule: at most `limit` admissions per `window_secs`.
#[derive(Debug, Clone, Copy)]
pub struct RateLimit {
  pub limit: u32,
  pub window_secs: u64,
}

impl RateLimit {
  pub fn new(limit: u32, window_secs: u64) -> Self {
    Self { limit, window_secs }
  }
}

/// Result of a single admission check.
#[derive(Debug, Clone, Copy)]
pub struct Admission {
  pub allowed: bool,
  pub limit: u32,
  pub remaining: u32,
  /// Unix seconds at which the current window fully drains.
  pub reset_at: i64,
  /// Populated only when `allowed` is false.
  pub retry_after: Option<u64>,
}

impl Admission {
  pub fn into_result(self) -> serror::Result<Admission> {
    if self.allowed {
      Ok(self)
    } else {
      Err(
        anyhow!(
          "Too many requests. Retry after {:?} seconds",
          self.retry_after
        )
        .status_code(StatusCode::TOO_MANY_REQUESTS),
      )
    }
  }
}

/// A sliding-window admission gate backed by the shared store, so every
/// process in the deployment enforces the same limit for a given identity.
///
/// Identity is caller-supplied (an IP, an API key, a user id) rather than
/// hardcoded, matching the pluggable-identity extension point: this crate
/// has no notion of who a caller is, only what key to count attempts under.
pub struct RateLimiter {
  store: Store,
  default_rule: RateLimit,
}

impl RateLimiter {
  pub fn new(store: Store, default_rule: RateLimit) -> Self {
    Self { store, default_rule }
  }

  /// Checks and records one admission attempt for `identity` under `rule`
  /// (or the limiter's default rule, if `rule` is `None`).
  ///
  /// On store failure this logs a warning and fails open: the request is
  /// admitted, because a rate limiter that is down should never itself take
  /// the service down.
  pub async fn check(
    &self,
    identity: &str,
    rule: Option<RateLimit>,
  ) -> Admission {
    let rule = rule.unwrap_or(self.default_rule);
    match self.check_inner(identity, rule).await {
      Ok(admission) => admission,
      Err(e) => {
        tracing::warn!(
          subsystem = "rate_limit",
          error = %e,
          identity,
          "store unavailable, failing open"
        );
        Admission {
          allowed: true,
          limit: rule.limit,
          remaining: rule.limit,
          reset_at: now_secs() + rule.window_secs as i64,
          retry_after: None,
        }
      }
    }
  }

  async fn check_inner(
    &self,
    identity: &str,
    rule: RateLimit,
  ) -> anyhow::Result<Admission> {
    let key = format!("ratelimit:{identity}");
    let now_ms = now_millis();
    let window_ms = rule.window_secs as i64 * 1000;
    let window_start = now_ms - window_ms;

    self.store.zremrangebyscore(&key, 0.0, window_start as f64).await?;
    let count = self.store.zcard(&key).await? as u32;

    let reset_at = now_secs() + rule.window_secs as i64;

    if count >= rule.limit {
      return Ok(Admission {
        allowed: false,
        limit: rule.limit,
        remaining: 0,
        reset_at,
        retry_after: Some(rule.window_secs),
      });
    }

    let member = uuid::Uuid::new_v4().to_string();
    self.store.zadd(&key, &member, now_ms as f64).await?;
    self.store.expire(&key, rule.window_secs as i64).await?;

    Ok(Admission {
      allowed: true,
      limit: rule.limit,
      remaining: rule.limit - count - 1,
      reset_at,
      retry_after: None,
    })
  }
}

fn now_millis() -> i64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .unwrap_or_default()
    .as_millis() as i64
}

fn now_secs() -> i64 {
  std::time::SystemTime::now()
    .duration_since(std::time::UNIX_EPOCH)
    .unwrap_or_default()
    .as_secs() as i64
}

pub fn get_ip_from_headers(
  headers: &HeaderMap,
) -> serror::Result<IpAddr> {
  // Check X-Forwarded-For header (first IP in chain)
  if let Some(forwarded) = headers.get("x-forwarded-for")
    && let Ok(forwarded_str) = forwarded.to_str()
    && let Some(ip) = forwarded_str.split(',').next()
  {
    return ip.trim().parse().status_code(StatusCode::UNAUTHORIZED);
  }

  // Check X-Real-IP header
  if let Some(real_ip) = headers.get("x-real-ip")
    && let Ok(ip) = real_ip.to_str()
  {
    return ip.trim().parse().status_code(StatusCode::UNAUTHORIZED);
  }

  Err(
    anyhow!("'x-forwarded-for' and 'x-real-ip' are both missing")
      .status_code(StatusCode::UNAUTHORIZED),
  )
}

#[cfg(test)]
mod test {
  use super::*;
  use axum::http::HeaderValue;

  #[test]
  fn ip_from_x_forwarded_for_takes_first_hop() {
    let mut headers = HeaderMap::new();
    headers.insert(
      "x-forwarded-for",
      HeaderValue::from_static("203.0.113.5, 70.41.3.18"),
    );
    let ip = get_ip_from_headers(&headers).unwrap();
    assert_eq!(ip, "203.0.113.5".parse::<IpAddr>().unwrap());
  }

  #[test]
  fn missing_headers_is_rejected() {
    let headers = HeaderMap::new();
    assert!(get_ip_from_headers(&headers).is_err());
  }

  #[test]
  fn admission_into_result_rejects_when_denied() {
    let admission = Admission {
      allowed: false,
      limit: 10,
      remaining: 0,
      reset_at: now_secs() + 60,
      retry_after: Some(60),
    };
    assert!(admission.into_result().is_err());
  }
}
