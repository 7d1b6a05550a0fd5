//! Typed key/value metadata attached to projects, folders, versions and version files.
//!
//! Entries either reference a shared [`MetadataField`] or carry a free `custom_key`. Values are
//! validated against their [`FieldType`] and stored in the structure described in [`values`].

pub mod templates;
pub mod values;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{AppError, AppResult, OptionExt};
use crate::types::ContentType;
pub use values::FieldType;

pub const MAX_KEY_LEN: usize = 128;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MetadataField {
    pub id: Uuid,
    pub key: String,
    pub field_type: String,
    pub read_only: bool,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct MetadataRow {
    id: Uuid,
    field_id: Option<Uuid>,
    key: String,
    custom_key: Option<String>,
    field_type: String,
    read_only: bool,
    value: Option<Json<Value>>,
    config: Json<Value>,
    metadata_template_field_id: Option<Uuid>,
    assigned_to_content_type: String,
    assigned_to_object_id: Uuid,
    creation_date: DateTime<Utc>,
}

/// A metadata entry as returned to clients.
#[derive(Debug, Clone, Serialize)]
pub struct Metadata {
    pub id: Uuid,
    pub field: Option<Uuid>,
    pub key: String,
    pub custom_key: Option<String>,
    pub field_type: String,
    pub read_only: bool,
    pub value: Value,
    pub config: Value,
    pub metadata_template_field: Option<Uuid>,
    pub assigned_to_content_type: String,
    pub assigned_to_object_id: Uuid,
    pub creation_date: DateTime<Utc>,
}

impl From<MetadataRow> for Metadata {
    fn from(row: MetadataRow) -> Self {
        let field_type = row.field_type.parse::<FieldType>().unwrap_or(FieldType::Text);
        Metadata {
            id: row.id,
            field: row.field_id,
            key: row.key,
            custom_key: row.custom_key,
            value: values::from_storage(field_type, row.value.as_ref().map(|j| &j.0)),
            field_type: row.field_type,
            read_only: row.read_only,
            config: row.config.0,
            metadata_template_field: row.metadata_template_field_id,
            assigned_to_content_type: row.assigned_to_content_type,
            assigned_to_object_id: row.assigned_to_object_id,
            creation_date: row.creation_date,
        }
    }
}

/// Reference to a shared field: an existing id, or a key/type pair created on demand.
#[derive(Debug, Clone, Deserialize, Serialize, PartialEq)]
#[serde(untagged)]
pub enum FieldRef {
    Id(Uuid),
    New { key: String, field_type: FieldType },
}

/// Client supplied metadata entry.
#[derive(Debug, Clone, Default, Deserialize, Serialize, PartialEq)]
pub struct MetadataInput {
    #[serde(default)]
    pub field: Option<FieldRef>,
    #[serde(default)]
    pub custom_key: Option<String>,
    #[serde(default)]
    pub field_type: Option<FieldType>,
    #[serde(default)]
    pub value: Value,
    #[serde(default)]
    pub config: Option<Value>,
    #[serde(default)]
    pub metadata_template_field: Option<Uuid>,
}

/// An entry that passed validation and is ready to be stored.
#[derive(Debug, Clone, PartialEq)]
pub struct ValidatedMetadata {
    pub field_id: Option<Uuid>,
    pub key: String,
    pub custom_key: Option<String>,
    pub field_type: FieldType,
    pub read_only: bool,
    pub stored: Value,
    pub config: Value,
    pub metadata_template_field_id: Option<Uuid>,
}

const SELECT_METADATA: &str = "SELECT m.id, m.field_id, COALESCE(f.key, m.custom_key, '') AS key, m.custom_key, \
     m.field_type, m.read_only, m.value, m.config, m.metadata_template_field_id, m.assigned_to_content_type, \
     m.assigned_to_object_id, m.creation_date FROM metadata m LEFT JOIN metadata_fields f ON f.id = m.field_id";

pub async fn list_fields(db: &SqlitePool) -> AppResult<Vec<MetadataField>> {
    Ok(sqlx::query_as::<_, MetadataField>("SELECT id, key, field_type, read_only FROM metadata_fields ORDER BY key")
        .fetch_all(db)
        .await?)
}

pub async fn find_field(db: &SqlitePool, id: Uuid) -> AppResult<Option<MetadataField>> {
    Ok(sqlx::query_as::<_, MetadataField>("SELECT id, key, field_type, read_only FROM metadata_fields WHERE id = ?")
        .bind(id)
        .fetch_optional(db)
        .await?)
}

pub async fn find_field_by_key(db: &SqlitePool, key: &str) -> AppResult<Option<MetadataField>> {
    Ok(sqlx::query_as::<_, MetadataField>("SELECT id, key, field_type, read_only FROM metadata_fields WHERE key = ?")
        .bind(key)
        .fetch_optional(db)
        .await?)
}

fn validate_key(key: &str) -> AppResult<String> {
    crate::error::validation::validate_name(key, "key", MAX_KEY_LEN)
}

/// Returns the field for `key`, creating it with `field_type` when missing.
pub async fn get_or_create_field(db: &SqlitePool, key: &str, field_type: FieldType, read_only: bool) -> AppResult<MetadataField> {
    let key = validate_key(key)?;
    if let Some(existing) = find_field_by_key(db, &key).await? {
        return Ok(existing);
    }
    sqlx::query("INSERT INTO metadata_fields (id, key, field_type, read_only) VALUES (?, ?, ?, ?) ON CONFLICT(key) DO NOTHING")
        .bind(Uuid::new_v4())
        .bind(&key)
        .bind(field_type.as_str())
        .bind(read_only)
        .execute(db)
        .await?;
    find_field_by_key(db, &key).await?.ok_or_not_found("Metadata field")
}

fn parse_field_type(raw: &str) -> AppResult<FieldType> {
    raw.parse::<FieldType>().map_err(|e| AppError::validation("field_type", e.to_string()))
}

/// Validates a single entry; fields referenced as `{key, field_type}` are created on the fly.
pub async fn validate_input(db: &SqlitePool, input: &MetadataInput) -> AppResult<ValidatedMetadata> {
    let custom_key = input.custom_key.as_deref().map(str::trim).filter(|k| !k.is_empty());
    let (field_id, key, field_type, read_only) = match (&input.field, custom_key) {
        (Some(_), Some(_)) => {
            return Err(AppError::validation("metadata", "Provide either 'field' or 'custom_key', not both."))
        }
        (None, None) => return Err(AppError::validation("metadata", "Either 'field' or 'custom_key' is required.")),
        (Some(FieldRef::Id(id)), None) => {
            let field = find_field(db, *id)
                .await?
                .ok_or_else(|| AppError::validation("field", format!("Metadata field '{}' does not exist.", id)))?;
            let ft = parse_field_type(&field.field_type)?;
            (Some(field.id), field.key, ft, field.read_only)
        }
        (Some(FieldRef::New { key, field_type }), None) => {
            let field = get_or_create_field(db, key, *field_type, false).await?;
            let ft = parse_field_type(&field.field_type)?;
            (Some(field.id), field.key, ft, field.read_only)
        }
        (None, Some(key)) => {
            let key = validate_key(key)?;
            let ft = input
                .field_type
                .ok_or_else(|| AppError::validation("field_type", "A field type is required for custom keys."))?;
            (None, key, ft, false)
        }
    };

    let config = input.config.clone().unwrap_or_else(|| Value::Object(Default::default()));
    let value = values::normalize(&input.value);
    values::validate(&key, field_type, value.as_ref(), &config)
        .map_err(|e| AppError::validation("metadata", e.to_string()))?;

    Ok(ValidatedMetadata {
        field_id,
        custom_key: if field_id.is_none() { Some(key.clone()) } else { None },
        key,
        field_type,
        read_only,
        stored: values::to_storage(field_type, value.as_ref()),
        config,
        metadata_template_field_id: input.metadata_template_field,
    })
}

/// Validates a list; later entries win over earlier ones with the same key.
pub async fn validate_inputs(db: &SqlitePool, inputs: &[MetadataInput]) -> AppResult<Vec<ValidatedMetadata>> {
    let mut out: Vec<ValidatedMetadata> = Vec::with_capacity(inputs.len());
    for input in inputs {
        let validated = validate_input(db, input).await?;
        out.retain(|existing| existing.key != validated.key);
        out.push(validated);
    }
    Ok(out)
}

/// Read-only entry written by the system (checksums, file information).
pub fn system_entry(key: &str, value: Value) -> ValidatedMetadata {
    let text = match value {
        Value::String(s) => Value::String(s),
        Value::Null => Value::Null,
        other => Value::String(other.to_string()),
    };
    ValidatedMetadata {
        field_id: None,
        key: key.to_string(),
        custom_key: Some(key.to_string()),
        field_type: FieldType::Text,
        read_only: true,
        stored: values::to_storage(FieldType::Text, values::normalize(&text).as_ref()),
        config: Value::Object(Default::default()),
        metadata_template_field_id: None,
    }
}

pub async fn list_for(db: &SqlitePool, content_type: ContentType, object_id: Uuid) -> AppResult<Vec<Metadata>> {
    let sql = format!(
        "{} WHERE m.assigned_to_content_type = ? AND m.assigned_to_object_id = ? ORDER BY key, m.creation_date",
        SELECT_METADATA
    );
    let rows = sqlx::query_as::<_, MetadataRow>(&sql)
        .bind(content_type.as_str())
        .bind(object_id)
        .fetch_all(db)
        .await?;
    Ok(rows.into_iter().map(Metadata::from).collect())
}

/// Key to client-facing value map of a target.
pub async fn values_for(db: &SqlitePool, content_type: ContentType, object_id: Uuid) -> AppResult<BTreeMap<String, Value>> {
    Ok(list_for(db, content_type, object_id).await?.into_iter().map(|m| (m.key, m.value)).collect())
}

async fn insert(db: &SqlitePool, content_type: ContentType, object_id: Uuid, entry: &ValidatedMetadata) -> AppResult<()> {
    sqlx::query(
        "INSERT INTO metadata (id, field_id, custom_key, field_type, read_only, value, config, metadata_template_field_id, \
         assigned_to_content_type, assigned_to_object_id, creation_date) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(Uuid::new_v4())
    .bind(entry.field_id)
    .bind(&entry.custom_key)
    .bind(entry.field_type.as_str())
    .bind(entry.read_only)
    .bind(Json(&entry.stored))
    .bind(Json(&entry.config))
    .bind(entry.metadata_template_field_id)
    .bind(content_type.as_str())
    .bind(object_id)
    .bind(Utc::now())
    .execute(db)
    .await?;
    Ok(())
}

async fn delete_key(db: &SqlitePool, content_type: ContentType, object_id: Uuid, key: &str, include_read_only: bool) -> AppResult<()> {
    sqlx::query(
        "DELETE FROM metadata WHERE assigned_to_content_type = ? AND assigned_to_object_id = ? \
         AND (read_only = 0 OR ?) AND COALESCE((SELECT f.key FROM metadata_fields f WHERE f.id = metadata.field_id), custom_key) = ?",
    )
    .bind(content_type.as_str())
    .bind(object_id)
    .bind(include_read_only)
    .bind(key)
    .execute(db)
    .await?;
    Ok(())
}

/// Stores user metadata on a target.
///
/// Without `retain` every editable entry of the target is replaced; with `retain` only the keys
/// in `entries` are overwritten. Read-only entries can only be written by the system.
pub async fn set_for_relation(
    db: &SqlitePool,
    content_type: ContentType,
    object_id: Uuid,
    entries: &[ValidatedMetadata],
    retain: bool,
) -> AppResult<()> {
    if !content_type.accepts_metadata() {
        return Err(AppError::bad_request(format!("Metadata cannot be assigned to {}", content_type)));
    }
    let existing = list_for(db, content_type, object_id).await?;
    for entry in entries {
        if existing.iter().any(|m| m.read_only && m.key == entry.key) {
            return Err(AppError::forbidden(format!("Metadata '{}' is read only.", entry.key)));
        }
    }

    if !retain {
        sqlx::query("DELETE FROM metadata WHERE assigned_to_content_type = ? AND assigned_to_object_id = ? AND read_only = 0")
            .bind(content_type.as_str())
            .bind(object_id)
            .execute(db)
            .await?;
    }
    for entry in entries {
        if retain {
            delete_key(db, content_type, object_id, &entry.key, false).await?;
        }
        insert(db, content_type, object_id, entry).await?;
    }
    Ok(())
}

/// Upserts system-owned read-only entries.
pub async fn set_system(db: &SqlitePool, content_type: ContentType, object_id: Uuid, entries: &[ValidatedMetadata]) -> AppResult<()> {
    for entry in entries {
        delete_key(db, content_type, object_id, &entry.key, true).await?;
        insert(db, content_type, object_id, entry).await?;
    }
    Ok(())
}

/// Duplicates all entries of one target onto another (used when versions are derived).
pub async fn copy_between(
    db: &SqlitePool,
    from: (ContentType, Uuid),
    to: (ContentType, Uuid),
) -> AppResult<()> {
    let rows = sqlx::query_as::<_, MetadataRow>(&format!(
        "{} WHERE m.assigned_to_content_type = ? AND m.assigned_to_object_id = ?",
        SELECT_METADATA
    ))
    .bind(from.0.as_str())
    .bind(from.1)
    .fetch_all(db)
    .await?;
    for row in rows {
        sqlx::query(
            "INSERT INTO metadata (id, field_id, custom_key, field_type, read_only, value, config, metadata_template_field_id, \
             assigned_to_content_type, assigned_to_object_id, creation_date) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(row.field_id)
        .bind(&row.custom_key)
        .bind(&row.field_type)
        .bind(row.read_only)
        .bind(row.value.as_ref().map(|j| Json(&j.0)))
        .bind(Json(&row.config.0))
        .bind(row.metadata_template_field_id)
        .bind(to.0.as_str())
        .bind(to.1)
        .bind(Utc::now())
        .execute(db)
        .await?;
    }
    Ok(())
}

pub async fn delete_for(db: &SqlitePool, content_type: ContentType, object_id: Uuid) -> AppResult<()> {
    sqlx::query("DELETE FROM metadata WHERE assigned_to_content_type = ? AND assigned_to_object_id = ?")
        .bind(content_type.as_str())
        .bind(object_id)
        .execute(db)
        .await?;
    Ok(())
}

/// Reads a single text value, e.g. a checksum or the original file name.
pub async fn text_value(db: &SqlitePool, content_type: ContentType, object_id: Uuid, key: &str) -> AppResult<Option<String>> {
    Ok(values_for(db, content_type, object_id)
        .await?
        .remove(key)
        .and_then(|v| v.as_str().map(str::to_string)))
}
