//! Runtime settings stored in the database (`settings` table).

use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::SqlitePool;

use crate::error::{AppResult, OptionExt};

pub const MAX_LOCK_TIME: &str = "MAX_LOCK_TIME";
pub const INTERNAL_TLDS: &str = "INTERNAL_TLDS";

#[derive(Debug, Clone, Serialize, Deserialize, sqlx::FromRow)]
pub struct Setting {
    pub key: String,
    pub value: Json<Value>,
    pub description: String,
    pub public: bool,
}

pub async fn get(db: &SqlitePool, key: &str) -> AppResult<Option<Setting>> {
    let setting = sqlx::query_as::<_, Setting>("SELECT key, value, description, public FROM settings WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await?;
    Ok(setting)
}

/// Returns the stored value or `default` when the key is absent.
pub async fn get_value(db: &SqlitePool, key: &str, default: Value) -> AppResult<Value> {
    Ok(get(db, key).await?.map(|s| s.value.0).unwrap_or(default))
}

/// Upserts a value; `description`/`public` keep their stored values when `None`.
pub async fn set_value(
    db: &SqlitePool,
    key: &str,
    value: Value,
    description: Option<&str>,
    public: Option<bool>,
) -> AppResult<Setting> {
    sqlx::query(
        r#"INSERT INTO settings (key, value, description, public) VALUES (?, ?, COALESCE(?, ''), COALESCE(?, 0))
           ON CONFLICT(key) DO UPDATE SET
             value = excluded.value,
             description = COALESCE(?, settings.description),
             public = COALESCE(?, settings.public)"#,
    )
    .bind(key)
    .bind(Json(&value))
    .bind(description)
    .bind(public)
    .bind(description)
    .bind(public)
    .execute(db)
    .await?;
    get(db, key).await?.ok_or_not_found("Setting")
}

pub async fn list(db: &SqlitePool, include_private: bool) -> AppResult<Vec<Setting>> {
    let sql = if include_private {
        "SELECT key, value, description, public FROM settings ORDER BY key"
    } else {
        "SELECT key, value, description, public FROM settings WHERE public = 1 ORDER BY key"
    };
    Ok(sqlx::query_as::<_, Setting>(sql).fetch_all(db).await?)
}

/// Lock lifetime in minutes: the `MAX_LOCK_TIME` setting, else `fallback`.
pub async fn max_lock_minutes(db: &SqlitePool, fallback: i64) -> AppResult<i64> {
    let value = get_value(db, MAX_LOCK_TIME, Value::from(fallback)).await?;
    let minutes = match &value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    Ok(minutes.filter(|m| *m > 0).unwrap_or(fallback))
}

/// Email domain suffixes that identify internal users.
pub async fn internal_tlds(db: &SqlitePool) -> AppResult<Vec<String>> {
    let value = get_value(db, INTERNAL_TLDS, Value::Array(vec![])).await?;
    Ok(match value {
        Value::Array(items) => items.into_iter().filter_map(|v| v.as_str().map(|s| s.to_lowercase())).collect(),
        Value::String(s) => s.split(',').map(|p| p.trim().to_lowercase()).filter(|p| !p.is_empty()).collect(),
        _ => Vec::new(),
    })
}
