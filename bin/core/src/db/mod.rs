pub mod filter;

use chrono::{DateTime, Utc};
use serde::Serialize;
use sqlx::PgPool;

/// Row shape shared by every resource kind. Kind-specific typing lives only
/// at the adapter layer, above `attributes`.
#[derive(Debug, Clone, sqlx::FromRow, Serialize)]
pub struct ResourceRow {
  pub id: i64,
  pub kind: String,
  pub attributes: serde_json::Value,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

pub async fn run_migrations(pool: &PgPool) -> anyhow::Result<()> {
  sqlx::migrate!("./migrations").run(pool).await?;
  Ok(())
}
