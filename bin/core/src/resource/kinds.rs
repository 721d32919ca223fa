use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use validations::{StringValidator, StringValidatorMatches};

use super::ResourceKind;
use crate::db::ResourceRow;

/// A user identity federated from an external auth provider. Grounds the
/// scenario where `POST /users/` accepts `{provider, provider_user_id,
/// email}` and a later `PATCH` toggles `role`.
pub struct Users;

#[derive(Debug, Deserialize)]
pub struct UserInput {
  pub provider: String,
  pub provider_user_id: String,
  pub email: String,
  #[serde(default = "default_role")]
  pub role: String,
}

fn default_role() -> String {
  "member".to_string()
}

#[derive(Debug, Default, Deserialize)]
pub struct UserUpdate {
  pub email: Option<String>,
  pub role: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct UserOutput {
  pub id: i64,
  pub provider: String,
  pub provider_user_id: String,
  pub email: String,
  pub role: String,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl ResourceKind for Users {
  const KIND: &'static str = "users";
  const EVENT_PREFIX: &'static str = "user";
  const FIELDS: &'static [&'static str] = &["provider", "provider_user_id", "email", "role"];

  type Input = UserInput;
  type Update = UserUpdate;
  type Output = UserOutput;

  fn validate_create(input: Self::Input) -> anyhow::Result<Value> {
    StringValidator::default()
      .min_length(1)
      .max_length(320)
      .matches(StringValidatorMatches::Username)
      .validate(&input.email)?;
    Ok(serde_json::json!({
      "provider": input.provider,
      "provider_user_id": input.provider_user_id,
      "email": input.email,
      "role": input.role,
    }))
  }

  fn merge_update(existing: &Value, update: Self::Update) -> anyhow::Result<Value> {
    let mut attributes = existing.clone();
    let Some(map) = attributes.as_object_mut() else {
      anyhow::bail!("stored user attributes are not an object");
    };
    if let Some(email) = update.email {
      StringValidator::default()
        .min_length(1)
        .max_length(320)
        .matches(StringValidatorMatches::Username)
        .validate(&email)?;
      map.insert("email".to_string(), Value::String(email));
    }
    if let Some(role) = update.role {
      map.insert("role".to_string(), Value::String(role));
    }
    Ok(attributes)
  }

  fn project(row: ResourceRow) -> anyhow::Result<Self::Output> {
    let attrs: UserAttributes = serde_json::from_value(row.attributes)?;
    Ok(UserOutput {
      id: row.id,
      provider: attrs.provider,
      provider_user_id: attrs.provider_user_id,
      email: attrs.email,
      role: attrs.role,
      created_at: row.created_at,
      updated_at: row.updated_at,
    })
  }
}

#[derive(Debug, Deserialize)]
struct UserAttributes {
  provider: String,
  provider_user_id: String,
  email: String,
  role: String,
}

/// A media upload record. The engine stores only metadata; file bytes live
/// on disk or S3 per `Config::use_s3`, referenced by `storage_path`.
pub struct Media;

#[derive(Debug, Deserialize)]
pub struct MediaInput {
  pub file_name: String,
  pub content_type: String,
  pub size_bytes: i64,
  pub storage_path: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct MediaUpdate {
  pub file_name: Option<String>,
  pub thumbnail_path: Option<String>,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct MediaOutput {
  pub id: i64,
  pub file_name: String,
  pub content_type: String,
  pub size_bytes: i64,
  pub storage_path: String,
  pub thumbnail_path: Option<String>,
  pub created_at: DateTime<Utc>,
  pub updated_at: DateTime<Utc>,
}

impl ResourceKind for Media {
  const KIND: &'static str = "media";
  const EVENT_PREFIX: &'static str = "media";
  const FIELDS: &'static [&'static str] = &["file_name", "content_type", "storage_path"];

  type Input = MediaInput;
  type Update = MediaUpdate;
  type Output = MediaOutput;

  fn validate_create(input: Self::Input) -> anyhow::Result<Value> {
    if input.size_bytes <= 0 {
      anyhow::bail!("size_bytes must be positive");
    }
    if input.size_bytes as u64 > crate::config::config().max_file_size {
      anyhow::bail!("file exceeds MAX_FILE_SIZE");
    }
    Ok(serde_json::json!({
      "file_name": input.file_name,
      "content_type": input.content_type,
      "size_bytes": input.size_bytes,
      "storage_path": input.storage_path,
      "thumbnail_path": Value::Null,
    }))
  }

  fn merge_update(existing: &Value, update: Self::Update) -> anyhow::Result<Value> {
    let mut attributes = existing.clone();
    let Some(map) = attributes.as_object_mut() else {
      anyhow::bail!("stored media attributes are not an object");
    };
    if let Some(file_name) = update.file_name {
      map.insert("file_name".to_string(), Value::String(file_name));
    }
    if let Some(thumbnail_path) = update.thumbnail_path {
      map.insert("thumbnail_path".to_string(), Value::String(thumbnail_path));
    }
    Ok(attributes)
  }

  fn project(row: ResourceRow) -> anyhow::Result<Self::Output> {
    let attrs: MediaAttributes = serde_json::from_value(row.attributes)?;
    Ok(MediaOutput {
      id: row.id,
      file_name: attrs.file_name,
      content_type: attrs.content_type,
      size_bytes: attrs.size_bytes,
      storage_path: attrs.storage_path,
      thumbnail_path: attrs.thumbnail_path,
      created_at: row.created_at,
      updated_at: row.updated_at,
    })
  }
}

#[derive(Debug, Deserialize)]
struct MediaAttributes {
  file_name: String,
  content_type: String,
  size_bytes: i64,
  storage_path: String,
  thumbnail_path: Option<String>,
}

#[cfg(test)]
mod test {
  use super::*;

  #[test]
  fn media_rejects_oversized_input_without_config() {
    // Exercises the zero-size rejection, which doesn't depend on `config()`.
    let input = MediaInput {
      file_name: "a.png".into(),
      content_type: "image/png".into(),
      size_bytes: 0,
      storage_path: "/media/a.png".into(),
    };
    assert!(Media::validate_create(input).is_err());
  }
}
