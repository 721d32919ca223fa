//! Channel broadcast fabric. Each named channel is a `broadcast` topic,
//! which gives every subscriber the drop-oldest backpressure behavior for
//! free: a client too slow to keep up gets a `Lagged` error instead of
//! blocking the broadcaster, and simply misses the oldest frames it hadn't
//! read yet.

use std::{
  collections::{HashMap, HashSet},
  sync::Arc,
  time::{SystemTime, UNIX_EPOCH},
};

use axum::{
  Json, Router,
  extract::{
    Path, Query,
    ws::{self, CloseFrame, Utf8Bytes, WebSocket, WebSocketUpgrade},
  },
  response::IntoResponse,
  routing::get,
};
use cache::CloneCache;
use futures_util::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};
use tokio::sync::{Mutex, broadcast};

use crate::state::{fabric, store};

const BROADCAST_CAPACITY: usize = 256;
const ALLOWED_CHANNELS: &[&str] = &["users", "posts", "media", "tasks"];
/// WebSocket close code 1008 (policy violation), used when a client opens a
/// connection against a channel name this server doesn't serve.
const CLOSE_POLICY_VIOLATION: u16 = 1008;

#[derive(Debug, Clone, Copy)]
pub enum ChangeKind {
  Created,
  Updated,
  Deleted,
}

impl ChangeKind {
  pub fn as_event_suffix(self) -> &'static str {
    match self {
      ChangeKind::Created => "created",
      ChangeKind::Updated => "updated",
      ChangeKind::Deleted => "deleted",
    }
  }
}

#[derive(Debug, Serialize)]
#[serde(tag = "type", rename_all = "snake_case")]
enum Envelope {
  Connection { message: String, channel: String, client_id: String, timestamp: i64 },
  Created { model: String, channel: String, timestamp: i64, data: Value },
  Updated { model: String, channel: String, timestamp: i64, data: Value },
  Deleted { model: String, channel: String, timestamp: i64, data: Value },
  Custom { event: String, channel: String, timestamp: i64, data: Value },
  TaskNotification { task_id: String, channel: String, timestamp: i64, data: Value },
  Pong { message: String },
  Stats { data: StatsSummary },
  Echo { original: Value },
}

#[derive(Debug, Clone, Serialize)]
pub struct StatsSummary {
  pub total_channels: usize,
  pub channels: HashMap<String, usize>,
  pub total_connections: usize,
}

struct Topic {
  sender: broadcast::Sender<Arc<Value>>,
  client_ids: Mutex<HashSet<String>>,
}

impl Topic {
  fn new() -> Self {
    let (sender, _) = broadcast::channel(BROADCAST_CAPACITY);
    Topic { sender, client_ids: Mutex::new(HashSet::new()) }
  }
}

/// Multiplexed named broadcast channels, looked up by name. Topics are
/// created lazily on first use and never removed — churn is bounded by the
/// number of distinct channel names, which is small and static.
#[derive(Default)]
pub struct Fabric {
  topics: CloneCache<String, Arc<Topic>>,
}

impl Fabric {
  async fn topic(&self, channel: &str) -> Arc<Topic> {
    if let Some(topic) = self.topics.get(&channel.to_string()).await {
      return topic;
    }
    let topic = Arc::new(Topic::new());
    self.topics.insert(channel.to_string(), topic.clone()).await;
    topic
  }

  async fn send(&self, channel: &str, envelope: &Envelope) {
    let topic = self.topic(channel).await;
    let payload = match serde_json::to_value(envelope) {
      Ok(value) => value,
      Err(e) => {
        tracing::warn!(subsystem = "ws", error = %e, "failed to serialize envelope");
        return;
      }
    };
    // No receivers is not an error: channels persist whether or not anyone
    // is currently connected.
    let _ = topic.sender.send(Arc::new(payload));
  }

  pub async fn broadcast_change(&self, kind: &str, change: ChangeKind, data: Value) {
    let timestamp = now_millis() as i64;
    let envelope = match change {
      ChangeKind::Created => {
        Envelope::Created { model: kind.to_string(), channel: kind.to_string(), timestamp, data }
      }
      ChangeKind::Updated => {
        Envelope::Updated { model: kind.to_string(), channel: kind.to_string(), timestamp, data }
      }
      ChangeKind::Deleted => {
        Envelope::Deleted { model: kind.to_string(), channel: kind.to_string(), timestamp, data }
      }
    };
    self.send(kind, &envelope).await;
  }

  pub async fn broadcast_custom(&self, channel: &str, event: &str, data: Value) {
    let envelope = Envelope::Custom {
      event: event.to_string(),
      channel: channel.to_string(),
      timestamp: now_millis() as i64,
      data,
    };
    self.send(channel, &envelope).await;
  }

  pub async fn broadcast_to_all_channels(&self, event: &str, data: Value) {
    for channel in self.topics.get_keys().await {
      self.broadcast_custom(&channel, event, data.clone()).await;
    }
  }

  pub async fn stats(&self) -> StatsSummary {
    let entries = self.topics.get_entries().await;
    let channels: HashMap<String, usize> = entries
      .iter()
      .map(|(channel, topic)| (channel.clone(), topic.sender.receiver_count()))
      .collect();
    StatsSummary {
      total_channels: channels.len(),
      total_connections: channels.values().sum(),
      channels,
    }
  }
}

pub fn router() -> Router {
  Router::new().route("/stats", get(stats)).route("/{channel}", get(handler))
}

async fn stats() -> Json<StatsSummary> {
  Json(fabric().stats().await)
}

#[derive(Debug, Deserialize)]
struct ConnectionParams {
  client_id: Option<String>,
}

async fn handler(
  Path(channel): Path<String>,
  Query(params): Query<ConnectionParams>,
  ws: WebSocketUpgrade,
) -> impl IntoResponse {
  if !ALLOWED_CHANNELS.contains(&channel.as_str()) {
    return ws.on_upgrade(reject_unknown_channel);
  }
  ws.on_upgrade(move |socket| handle_connection(socket, channel, params.client_id))
}

/// An unknown channel name still completes the WS handshake — the protocol
/// violation is reported in-band as a close frame, not as a bare HTTP 404,
/// so clients that only speak WebSocket see a clean, identifiable failure.
async fn reject_unknown_channel(mut socket: WebSocket) {
  let _ = socket
    .send(ws::Message::Close(Some(CloseFrame {
      code: CLOSE_POLICY_VIOLATION,
      reason: Utf8Bytes::from("unknown channel".to_string()),
    })))
    .await;
}

async fn handle_connection(socket: WebSocket, channel: String, requested_client_id: Option<String>) {
  let topic = fabric().topic(&channel).await;
  let client_id = unique_client_id(&topic, requested_client_id).await;

  let connection_envelope = Envelope::Connection {
    message: "connected".to_string(),
    channel: channel.clone(),
    client_id: client_id.clone(),
    timestamp: now_millis() as i64,
  };
  let connection_json = match serde_json::to_value(&connection_envelope) {
    Ok(value) => value,
    Err(_) => return,
  };

  let (mut sender, mut receiver) = socket.split();
  if sender.send(ws::Message::text(connection_json.to_string())).await.is_err() {
    topic.client_ids.lock().await.remove(&client_id);
    return;
  }

  let mut broadcasts = topic.sender.subscribe();
  let task_pattern = format!("task_notifications:{channel}:*");
  let mut task_subscription = store().psubscribe(&task_pattern).await.ok();

  let outgoing = async {
    loop {
      let task_message = async {
        match &mut task_subscription {
          Some(pubsub) => pubsub.on_message().next().await,
          None => std::future::pending().await,
        }
      };
      tokio::select! {
        msg = broadcasts.recv() => {
          match msg {
            Ok(value) => {
              if sender.send(ws::Message::text(value.to_string())).await.is_err() {
                break;
              }
            }
            Err(broadcast::error::RecvError::Lagged(skipped)) => {
              tracing::debug!(subsystem = "ws", channel, skipped, "client fell behind, dropped oldest frames");
            }
            Err(broadcast::error::RecvError::Closed) => break,
          }
        }
        msg = task_message => {
          let Some(msg) = msg else { continue };
          let payload: String = msg.get_payload().unwrap_or_default();
          let data = serde_json::from_str(&payload).unwrap_or(Value::String(payload));
          let prefix = format!("task_notifications:{channel}:");
          let task_id = msg.get_channel_name().trim_start_matches(&prefix).to_string();
          let envelope = Envelope::TaskNotification {
            task_id,
            channel: channel.clone(),
            timestamp: now_millis() as i64,
            data,
          };
          let Ok(value) = serde_json::to_value(&envelope) else { continue };
          if sender.send(ws::Message::text(value.to_string())).await.is_err() {
            break;
          }
        }
      }
    }
  };

  let incoming = async {
    while let Some(frame) = receiver.next().await {
      match frame {
        Ok(ws::Message::Text(text)) => {
          let reply = handle_control_message(&text).await;
          if sender.send(ws::Message::text(reply.to_string())).await.is_err() {
            break;
          }
        }
        Ok(ws::Message::Close(_)) => break,
        Ok(_) => {}
        Err(_) => break,
      }
    }
  };

  tokio::join!(outgoing, incoming);
  drop(task_subscription);
  topic.client_ids.lock().await.remove(&client_id);
}

async fn handle_control_message(text: &str) -> Value {
  let parsed: Value = serde_json::from_str(text).unwrap_or(Value::Null);
  match parsed.get("type").and_then(Value::as_str) {
    Some("ping") => {
      serde_json::to_value(Envelope::Pong { message: "pong".to_string() }).unwrap_or(Value::Null)
    }
    Some("get_stats") => {
      let data = fabric().stats().await;
      serde_json::to_value(Envelope::Stats { data }).unwrap_or(Value::Null)
    }
    _ => serde_json::to_value(Envelope::Echo { original: parsed }).unwrap_or(Value::Null),
  }
}

/// Honors a caller-supplied `client_id` query parameter when present and
/// not already taken, falling back to a generated one otherwise. Either way,
/// a collision gets a numeric suffix rather than being rejected.
async fn unique_client_id(topic: &Topic, requested: Option<String>) -> String {
  let base = requested.unwrap_or_else(|| format!("client-{}", now_millis()));
  let mut ids = topic.client_ids.lock().await;
  if ids.insert(base.clone()) {
    return base;
  }
  let mut suffix = 1u32;
  loop {
    let candidate = format!("{base}-{suffix}");
    if ids.insert(candidate.clone()) {
      return candidate;
    }
    suffix += 1;
  }
}

fn now_millis() -> u128 {
  SystemTime::now().duration_since(UNIX_EPOCH).unwrap_or_default().as_millis()
}

#[cfg(test)]
mod test {
  use super::*;

  #[tokio::test]
  async fn unknown_channel_has_no_topic_until_used() {
    let fabric = Fabric::default();
    assert_eq!(fabric.stats().await.total_channels, 0);
    fabric.broadcast_custom("users", "test.ping", json!({})).await;
    assert_eq!(fabric.stats().await.total_channels, 1);
  }

  #[tokio::test]
  async fn client_id_disambiguates_on_collision() {
    let topic = Topic::new();
    let a = unique_client_id(&topic, None).await;
    let b = unique_client_id(&topic, None).await;
    assert_ne!(a, b);
  }

  #[tokio::test]
  async fn requested_client_id_is_honored_then_disambiguated() {
    let topic = Topic::new();
    let a = unique_client_id(&topic, Some("fixed".to_string())).await;
    assert_eq!(a, "fixed");
    let b = unique_client_id(&topic, Some("fixed".to_string())).await;
    assert_eq!(b, "fixed-1");
  }
}
