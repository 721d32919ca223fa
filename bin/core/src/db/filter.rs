//! Translates the recursive filter query of §4.1 into a Postgres boolean
//! expression over a kind's `attributes` JSONB column, generated from a
//! per-kind field whitelist rather than dynamic reflection.

use serde::Deserialize;
use sqlx::{Postgres, QueryBuilder};

#[derive(Debug, Clone, Copy, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "snake_case")]
pub enum Operator {
  Eq,
  Ne,
  Gt,
  Gte,
  Lt,
  Lte,
  Contains,
  Icontains,
  Startswith,
  Endswith,
  In,
  NotIn,
  IsNull,
  IsNotNull,
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GroupOp {
  #[default]
  And,
  Or,
}

#[derive(Debug, Clone, Deserialize)]
pub struct Condition {
  pub field: String,
  pub operator: Operator,
  #[serde(default)]
  pub value: serde_json::Value,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct Group {
  #[serde(default)]
  pub conditions: Vec<Query>,
  #[serde(default)]
  pub operator: GroupOp,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum Query {
  Leaf(Condition),
  Group(Group),
}

impl Default for Query {
  fn default() -> Self {
    Query::Group(Group::default())
  }
}

#[derive(Debug, Clone, Copy, Deserialize, Default, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum SortDirection {
  #[default]
  Asc,
  Desc,
}

#[derive(Debug, Clone, Deserialize, Default)]
pub struct FilterRequest {
  #[serde(default)]
  pub query: Query,
  pub order_by: Option<String>,
  #[serde(default)]
  pub direction: SortDirection,
  #[serde(default = "default_limit")]
  pub limit: i64,
  #[serde(default)]
  pub offset: i64,
}

fn default_limit() -> i64 {
  100
}

impl FilterRequest {
  pub fn validate(&self) -> anyhow::Result<()> {
    if !(1..=1000).contains(&self.limit) {
      anyhow::bail!("limit must be in [1, 1000]");
    }
    if self.offset < 0 {
      anyhow::bail!("offset must be >= 0");
    }
    Ok(())
  }
}

/// Appends the translated query's boolean expression to `builder`, with no
/// leading `WHERE` — the caller owns the surrounding clause, since a kind's
/// own `kind = $1` predicate usually needs to be ANDed in first. Unknown
/// field names (not present in `fields`) are dropped to a no-op `TRUE`
/// predicate with a warning, per §4.1's edge-case rule — they never fail
/// the whole query.
pub fn push_predicate(
  builder: &mut QueryBuilder<'_, Postgres>,
  query: &Query,
  fields: &[&str],
) {
  push_query(builder, query, fields);
}

fn push_query(
  builder: &mut QueryBuilder<'_, Postgres>,
  query: &Query,
  fields: &[&str],
) {
  match query {
    Query::Leaf(condition) => push_condition(builder, condition, fields),
    Query::Group(group) => push_group(builder, group, fields),
  }
}

fn push_group(
  builder: &mut QueryBuilder<'_, Postgres>,
  group: &Group,
  fields: &[&str],
) {
  if group.conditions.is_empty() {
    builder.push("TRUE");
    return;
  }
  let joiner = match group.operator {
    GroupOp::And => " AND ",
    GroupOp::Or => " OR ",
  };
  builder.push("(");
  for (i, sub) in group.conditions.iter().enumerate() {
    if i > 0 {
      builder.push(joiner);
    }
    push_query(builder, sub, fields);
  }
  builder.push(")");
}

fn push_condition(
  builder: &mut QueryBuilder<'_, Postgres>,
  condition: &Condition,
  fields: &[&str],
) {
  if !fields.contains(&condition.field.as_str()) {
    tracing::warn!(
      subsystem = "resource_engine",
      field = condition.field,
      "unknown filter field, dropping to no-op predicate"
    );
    builder.push("TRUE");
    return;
  }

  let column = format!("attributes ->> '{}'", condition.field);

  match condition.operator {
    Operator::Eq => {
      builder.push(column).push(" = ").push_bind(text(&condition.value));
    }
    Operator::Ne => {
      builder.push(column).push(" != ").push_bind(text(&condition.value));
    }
    Operator::Gt => {
      builder.push(column).push("::numeric > ").push_bind(number(&condition.value));
    }
    Operator::Gte => {
      builder.push(column).push("::numeric >= ").push_bind(number(&condition.value));
    }
    Operator::Lt => {
      builder.push(column).push("::numeric < ").push_bind(number(&condition.value));
    }
    Operator::Lte => {
      builder.push(column).push("::numeric <= ").push_bind(number(&condition.value));
    }
    Operator::Contains => {
      builder
        .push(column)
        .push(" LIKE ")
        .push_bind(format!("%{}%", text(&condition.value)));
    }
    Operator::Icontains => {
      builder
        .push(column)
        .push(" ILIKE ")
        .push_bind(format!("%{}%", text(&condition.value)));
    }
    Operator::Startswith => {
      builder
        .push(column)
        .push(" LIKE ")
        .push_bind(format!("{}%", text(&condition.value)));
    }
    Operator::Endswith => {
      builder
        .push(column)
        .push(" LIKE ")
        .push_bind(format!("%{}", text(&condition.value)));
    }
    Operator::In => {
      let values = list(&condition.value);
      if values.is_empty() {
        builder.push("FALSE");
      } else {
        builder.push(column).push(" = ANY(").push_bind(values).push(")");
      }
    }
    Operator::NotIn => {
      let values = list(&condition.value);
      if values.is_empty() {
        builder.push("TRUE");
      } else {
        builder
          .push(column)
          .push(" != ALL(")
          .push_bind(values)
          .push(")");
      }
    }
    Operator::IsNull => {
      builder.push(column).push(" IS NULL");
    }
    Operator::IsNotNull => {
      builder.push(column).push(" IS NOT NULL");
    }
  }
}

fn text(value: &serde_json::Value) -> String {
  match value {
    serde_json::Value::String(s) => s.clone(),
    other => other.to_string(),
  }
}

fn number(value: &serde_json::Value) -> String {
  match value {
    serde_json::Value::Number(n) => n.to_string(),
    other => text(other),
  }
}

fn list(value: &serde_json::Value) -> Vec<String> {
  match value {
    serde_json::Value::Array(items) => items.iter().map(text).collect(),
    _ => Vec::new(),
  }
}

#[cfg(test)]
mod test {
  use super::*;

  const FIELDS: &[&str] = &["email", "role"];

  #[test]
  fn unknown_field_becomes_noop() {
    let mut builder = QueryBuilder::new("SELECT 1");
    let condition = Query::Leaf(Condition {
      field: "nonexistent".into(),
      operator: Operator::Eq,
      value: serde_json::json!("x"),
    });
    push_predicate(&mut builder, &condition, FIELDS);
    assert!(builder.sql().contains("TRUE"));
  }

  #[test]
  fn empty_group_is_match_all() {
    let mut builder = QueryBuilder::new("SELECT 1");
    push_predicate(&mut builder, &Query::default(), FIELDS);
    assert!(builder.sql().contains("TRUE"));
  }

  #[test]
  fn nested_group_combines_with_or() {
    let mut builder = QueryBuilder::new("SELECT 1");
    let query = Query::Group(Group {
      conditions: vec![
        Query::Leaf(Condition {
          field: "email".into(),
          operator: Operator::Icontains,
          value: serde_json::json!("gmail"),
        }),
        Query::Leaf(Condition {
          field: "role".into(),
          operator: Operator::Eq,
          value: serde_json::json!("vip"),
        }),
      ],
      operator: GroupOp::Or,
    });
    push_predicate(&mut builder, &query, FIELDS);
    assert!(builder.sql().contains(" OR "));
  }

  #[test]
  fn limit_out_of_range_rejected() {
    let request = FilterRequest {
      limit: 5000,
      ..Default::default()
    };
    assert!(request.validate().is_err());
  }
}
