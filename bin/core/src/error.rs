use anyhow::anyhow;
use reqwest::StatusCode;
use serror::AddStatusCode;

pub type ApiResult<T> = serror::Result<T>;

pub fn not_found(what: impl std::fmt::Display) -> serror::Error {
  anyhow!("{what} not found").status_code(StatusCode::NOT_FOUND)
}

pub fn bad_request(msg: impl std::fmt::Display) -> serror::Error {
  anyhow!("{msg}").status_code(StatusCode::BAD_REQUEST)
}

pub fn conflict(msg: impl std::fmt::Display) -> serror::Error {
  anyhow!("{msg}").status_code(StatusCode::CONFLICT)
}

pub fn unavailable(msg: impl std::fmt::Display) -> serror::Error {
  anyhow!("{msg}").status_code(StatusCode::SERVICE_UNAVAILABLE)
}

/// Maps a database failure onto the taxonomy of §7: unique-constraint
/// violations are conflicts, anything else is either a connectivity
/// hiccup (retryable, surfaced as 503) or an internal bug (500).
pub fn db_error(e: sqlx::Error) -> serror::Error {
  match &e {
    sqlx::Error::RowNotFound => not_found("resource"),
    sqlx::Error::Database(db_err) if db_err.is_unique_violation() => {
      conflict("resource already exists")
    }
    sqlx::Error::Io(_) | sqlx::Error::PoolTimedOut => {
      unavailable(format!("database unavailable: {e}"))
    }
    _ => anyhow::Error::new(e)
      .context("database error")
      .status_code(StatusCode::INTERNAL_SERVER_ERROR),
  }
}
