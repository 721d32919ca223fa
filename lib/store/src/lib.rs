//! Thin wrapper around a Redis-compatible connection, shared across the
//! rate limiter, job queue, and webhook engine for anything that needs
//! state visible to every process in the deployment.

use anyhow::Context;
use redis::{AsyncCommands, aio::ConnectionManager};
use serde::{Serialize, de::DeserializeOwned};

/// Cheaply clonable handle to the shared store. `ConnectionManager`
/// transparently reconnects and pipelines commands internally, so callers
/// never need to hold a lock around it. The plain `Client` is kept alongside
/// it only to open dedicated pub/sub connections, which `ConnectionManager`
/// does not support.
#[derive(Clone)]
pub struct Store {
  client: redis::Client,
  manager: ConnectionManager,
}

impl Store {
  pub async fn connect(url: &str) -> anyhow::Result<Store> {
    let client = redis::Client::open(url)
      .context("failed to parse redis connection url")?;
    let manager = client
      .get_connection_manager()
      .await
      .context("failed to establish redis connection")?;
    Ok(Store { client, manager })
  }

  fn conn(&self) -> ConnectionManager {
    self.manager.clone()
  }

  pub async fn get_string(
    &self,
    key: &str,
  ) -> anyhow::Result<Option<String>> {
    self
      .conn()
      .get(key)
      .await
      .context("redis GET failed")
  }

  pub async fn get_json<T: DeserializeOwned>(
    &self,
    key: &str,
  ) -> anyhow::Result<Option<T>> {
    let Some(raw) = self.get_string(key).await? else {
      return Ok(None);
    };
    let value = serde_json::from_str(&raw)
      .context("failed to deserialize stored value")?;
    Ok(Some(value))
  }

  pub async fn set_json<T: Serialize>(
    &self,
    key: &str,
    value: &T,
    ttl_secs: Option<u64>,
  ) -> anyhow::Result<()> {
    let raw = serde_json::to_string(value)
      .context("failed to serialize value for storage")?;
    match ttl_secs {
      Some(ttl) => {
        self
          .conn()
          .set_ex::<_, _, ()>(key, raw, ttl)
          .await
          .context("redis SET EX failed")?;
      }
      None => {
        self
          .conn()
          .set::<_, _, ()>(key, raw)
          .await
          .context("redis SET failed")?;
      }
    }
    Ok(())
  }

  pub async fn del(&self, key: &str) -> anyhow::Result<()> {
    self
      .conn()
      .del::<_, ()>(key)
      .await
      .context("redis DEL failed")
  }

  /// Deletes every key matching `pattern` (e.g. `"users:*"`), scanning in
  /// batches rather than blocking the server with `KEYS`. Used to invalidate
  /// a kind's cached reads after a write.
  pub async fn del_pattern(&self, pattern: &str) -> anyhow::Result<()> {
    let mut conn = self.conn();
    let mut cursor: u64 = 0;
    loop {
      let (next_cursor, keys): (u64, Vec<String>) = redis::cmd("SCAN")
        .arg(cursor)
        .arg("MATCH")
        .arg(pattern)
        .arg("COUNT")
        .arg(200)
        .query_async(&mut conn)
        .await
        .context("redis SCAN failed")?;
      if !keys.is_empty() {
        conn.del::<_, ()>(keys).await.context("redis DEL failed")?;
      }
      if next_cursor == 0 {
        break;
      }
      cursor = next_cursor;
    }
    Ok(())
  }

  pub async fn expire(
    &self,
    key: &str,
    ttl_secs: i64,
  ) -> anyhow::Result<()> {
    self
      .conn()
      .expire::<_, ()>(key, ttl_secs)
      .await
      .context("redis EXPIRE failed")
  }

  pub async fn incr(&self, key: &str, by: i64) -> anyhow::Result<i64> {
    self
      .conn()
      .incr(key, by)
      .await
      .context("redis INCR failed")
  }

  /// Adds `member` to the sorted set at `key` with `score`. Used for
  /// sliding-window rate-limit buckets and delayed job scheduling.
  pub async fn zadd(
    &self,
    key: &str,
    member: &str,
    score: f64,
  ) -> anyhow::Result<()> {
    self
      .conn()
      .zadd::<_, _, _, ()>(key, member, score)
      .await
      .context("redis ZADD failed")
  }

  /// Removes members scored in `[min, max]`, returning the number removed.
  pub async fn zremrangebyscore(
    &self,
    key: &str,
    min: f64,
    max: f64,
  ) -> anyhow::Result<i64> {
    self
      .conn()
      .zrembyscore(key, min, max)
      .await
      .context("redis ZREMRANGEBYSCORE failed")
  }

  /// Returns every member scored in `[min, max]`.
  pub async fn zrangebyscore(
    &self,
    key: &str,
    min: f64,
    max: f64,
  ) -> anyhow::Result<Vec<String>> {
    self
      .conn()
      .zrangebyscore(key, min, max)
      .await
      .context("redis ZRANGEBYSCORE failed")
  }

  pub async fn zcard(&self, key: &str) -> anyhow::Result<i64> {
    self
      .conn()
      .zcard(key)
      .await
      .context("redis ZCARD failed")
  }

  /// Pushes a job payload onto the head of the FIFO queue at `key`.
  pub async fn lpush(
    &self,
    key: &str,
    value: &str,
  ) -> anyhow::Result<()> {
    self
      .conn()
      .lpush::<_, _, ()>(key, value)
      .await
      .context("redis LPUSH failed")
  }

  /// Pops a job payload off the tail of the FIFO queue at `key`, blocking up
  /// to `timeout_secs` for one to become available.
  pub async fn brpop(
    &self,
    key: &str,
    timeout_secs: f64,
  ) -> anyhow::Result<Option<String>> {
    let result: Option<(String, String)> = self
      .conn()
      .brpop(key, timeout_secs)
      .await
      .context("redis BRPOP failed")?;
    Ok(result.map(|(_, payload)| payload))
  }

  pub async fn llen(&self, key: &str) -> anyhow::Result<i64> {
    self
      .conn()
      .llen(key)
      .await
      .context("redis LLEN failed")
  }

  /// Publishes `payload` to `channel`. Used to fan task-progress updates out
  /// to whichever process holds the websocket connection for a given task.
  pub async fn publish(
    &self,
    channel: &str,
    payload: &str,
  ) -> anyhow::Result<()> {
    self
      .conn()
      .publish::<_, _, ()>(channel, payload)
      .await
      .context("redis PUBLISH failed")
  }

  /// Opens a dedicated pub/sub connection subscribed to `channel`. Each
  /// subscriber needs its own connection; this is not multiplexed through
  /// the shared `ConnectionManager`.
  pub async fn subscribe(
    &self,
    channel: &str,
  ) -> anyhow::Result<redis::aio::PubSub> {
    let mut pubsub = self
      .client
      .get_async_pubsub()
      .await
      .context("failed to open pubsub connection")?;
    pubsub
      .subscribe(channel)
      .await
      .context("failed to subscribe to channel")?;
    Ok(pubsub)
  }

  /// Like [`Store::subscribe`] but matches every channel name against
  /// `pattern` (e.g. `"task_notifications:*"`).
  pub async fn psubscribe(
    &self,
    pattern: &str,
  ) -> anyhow::Result<redis::aio::PubSub> {
    let mut pubsub = self
      .client
      .get_async_pubsub()
      .await
      .context("failed to open pubsub connection")?;
    pubsub
      .psubscribe(pattern)
      .await
      .context("failed to psubscribe to pattern")?;
    Ok(pubsub)
  }
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn store_is_clone_and_send() {
    fn assert_bounds<T: Clone + Send + Sync>() {}
    assert_bounds::<Store>();
  }
}
