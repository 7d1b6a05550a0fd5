//! JSON fixtures: `[{model, pk, fields}]` dumps and loads of the configuration tables, content
//! pages and the FAQ. Content pages are keyed by slug.
//!
//! Uploaded data (datasets, versions, files, metadata on them) and the mail outbox are not part
//! of a fixture. Password hashes are never written.

use anyhow::Context;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::types::Json;
use sqlx::{Row, Sqlite, SqlitePool};
use uuid::Uuid;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Kind {
    Uuid,
    Text,
    Bool,
    Int,
    Json,
    Timestamp,
}

struct Model {
    label: &'static str,
    table: &'static str,
    pk: (&'static str, Kind),
    columns: &'static [(&'static str, Kind)],
}

/// Dump order; loading in this order satisfies every foreign key.
static MODELS: &[Model] = &[
    Model {
        label: "users.user",
        table: "users",
        pk: ("id", Kind::Uuid),
        columns: &[
            ("email", Kind::Text),
            ("username", Kind::Text),
            ("first_name", Kind::Text),
            ("last_name", Kind::Text),
            ("is_active", Kind::Bool),
            ("is_superuser", Kind::Bool),
            ("can_create_projects", Kind::Bool),
            ("can_hard_delete_datasets", Kind::Bool),
            ("is_global_metadata_template_admin", Kind::Bool),
            ("date_joined", Kind::Timestamp),
        ],
    },
    Model {
        label: "dbsettings.setting",
        table: "settings",
        pk: ("key", Kind::Text),
        columns: &[("value", Kind::Text), ("description", Kind::Text), ("public", Kind::Bool)],
    },
    Model {
        label: "metadata.metadatafield",
        table: "metadata_fields",
        pk: ("id", Kind::Uuid),
        columns: &[("key", Kind::Text), ("field_type", Kind::Text), ("read_only", Kind::Bool)],
    },
    Model {
        label: "projects.project",
        table: "projects",
        pk: ("id", Kind::Uuid),
        columns: &[
            ("name", Kind::Text),
            ("description", Kind::Json),
            ("metadata_template_id", Kind::Uuid),
            ("is_deletable", Kind::Bool),
            ("members_count", Kind::Int),
            ("metadata_templates_count", Kind::Int),
            ("created_by", Kind::Uuid),
            ("last_modified_by", Kind::Uuid),
            ("creation_date", Kind::Timestamp),
            ("last_modified_date", Kind::Timestamp),
        ],
    },
    Model {
        label: "projects.projectmembership",
        table: "project_memberships",
        pk: ("id", Kind::Uuid),
        columns: &[
            ("project_id", Kind::Uuid),
            ("member_id", Kind::Uuid),
            ("is_project_admin", Kind::Bool),
            ("can_create_folders", Kind::Bool),
            ("is_metadata_template_admin", Kind::Bool),
            ("created_by", Kind::Uuid),
            ("last_modified_by", Kind::Uuid),
            ("creation_date", Kind::Timestamp),
            ("last_modified_date", Kind::Timestamp),
        ],
    },
    Model {
        label: "folders.folder",
        table: "folders",
        pk: ("id", Kind::Uuid),
        columns: &[
            ("project_id", Kind::Uuid),
            ("name", Kind::Text),
            ("description", Kind::Json),
            ("metadata_template_id", Kind::Uuid),
            ("members_count", Kind::Int),
            ("datasets_count", Kind::Int),
            ("metadata_templates_count", Kind::Int),
            ("created_by", Kind::Uuid),
            ("last_modified_by", Kind::Uuid),
            ("creation_date", Kind::Timestamp),
            ("last_modified_date", Kind::Timestamp),
        ],
    },
    Model {
        label: "folders.folderpermission",
        table: "folder_permissions",
        pk: ("id", Kind::Uuid),
        columns: &[
            ("folder_id", Kind::Uuid),
            ("project_membership_id", Kind::Uuid),
            ("is_folder_admin", Kind::Bool),
            ("is_metadata_template_admin", Kind::Bool),
            ("can_edit", Kind::Bool),
            ("created_by", Kind::Uuid),
            ("last_modified_by", Kind::Uuid),
            ("creation_date", Kind::Timestamp),
            ("last_modified_date", Kind::Timestamp),
        ],
    },
    Model {
        label: "metadata.metadatatemplate",
        table: "metadata_templates",
        pk: ("id", Kind::Uuid),
        columns: &[
            ("name", Kind::Text),
            ("assigned_to_content_type", Kind::Text),
            ("assigned_to_object_id", Kind::Uuid),
            ("created_by", Kind::Uuid),
            ("last_modified_by", Kind::Uuid),
            ("creation_date", Kind::Timestamp),
            ("last_modified_date", Kind::Timestamp),
        ],
    },
    Model {
        label: "metadata.metadatatemplatefield",
        table: "metadata_template_fields",
        pk: ("id", Kind::Uuid),
        columns: &[
            ("metadata_template_id", Kind::Uuid),
            ("field_id", Kind::Uuid),
            ("custom_key", Kind::Text),
            ("field_type", Kind::Text),
            ("value", Kind::Json),
            ("config", Kind::Json),
            ("mandatory", Kind::Bool),
            ("creation_date", Kind::Timestamp),
        ],
    },
    Model {
        label: "cms.content",
        table: "cms_content",
        pk: ("slug", Kind::Text),
        columns: &[
            ("id", Kind::Uuid),
            ("name", Kind::Text),
            ("published", Kind::Bool),
            ("text_de", Kind::Text),
            ("text_en", Kind::Text),
            ("created_by", Kind::Uuid),
            ("last_modified_by", Kind::Uuid),
            ("creation_date", Kind::Timestamp),
            ("last_modified_date", Kind::Timestamp),
        ],
    },
    Model {
        label: "faq.faqcategory",
        table: "faq_categories",
        pk: ("id", Kind::Uuid),
        columns: &[
            ("name", Kind::Text),
            ("slug", Kind::Text),
            ("sort_order", Kind::Int),
            ("published", Kind::Bool),
            ("created_by", Kind::Uuid),
            ("last_modified_by", Kind::Uuid),
            ("creation_date", Kind::Timestamp),
            ("last_modified_date", Kind::Timestamp),
        ],
    },
    Model {
        label: "faq.faq",
        table: "faqs",
        pk: ("id", Kind::Uuid),
        columns: &[
            ("question", Kind::Text),
            ("slug", Kind::Text),
            ("answer", Kind::Text),
            ("category_id", Kind::Uuid),
            ("sort_order", Kind::Int),
            ("published", Kind::Bool),
            ("created_by", Kind::Uuid),
            ("last_modified_by", Kind::Uuid),
            ("creation_date", Kind::Timestamp),
            ("last_modified_date", Kind::Timestamp),
        ],
    },
];

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct FixtureRecord {
    pub model: String,
    pub pk: Value,
    pub fields: Map<String, Value>,
}

fn model_for(label: &str) -> Option<&'static Model> {
    MODELS.iter().find(|m| m.label == label)
}

fn read_column(row: &SqliteRow, column: &str, kind: Kind) -> anyhow::Result<Value> {
    let value = match kind {
        Kind::Uuid => row.try_get::<Option<Uuid>, _>(column)?.map(|id| Value::String(id.to_string())),
        Kind::Text => row.try_get::<Option<String>, _>(column)?.map(Value::String),
        Kind::Bool => Some(Value::Bool(row.try_get::<bool, _>(column)?)),
        Kind::Int => Some(Value::from(row.try_get::<i64, _>(column)?)),
        Kind::Json => row.try_get::<Option<Json<Value>>, _>(column)?.map(|j| j.0),
        Kind::Timestamp => row.try_get::<Option<DateTime<Utc>>, _>(column)?.map(|ts| Value::String(ts.to_rfc3339())),
    };
    Ok(value.unwrap_or(Value::Null))
}

/// Reads every configuration table into fixture records.
pub async fn dump(db: &SqlitePool) -> anyhow::Result<Vec<FixtureRecord>> {
    let mut records = Vec::new();
    for model in MODELS {
        let columns: Vec<&str> = std::iter::once(model.pk.0).chain(model.columns.iter().map(|(c, _)| *c)).collect();
        let sql = format!("SELECT {} FROM {} ORDER BY rowid", columns.join(", "), model.table);
        for row in sqlx::query(&sql).fetch_all(db).await? {
            let mut fields = Map::new();
            for (column, kind) in model.columns {
                fields.insert(column.to_string(), read_column(&row, column, *kind)?);
            }
            records.push(FixtureRecord {
                model: model.label.to_string(),
                pk: read_column(&row, model.pk.0, model.pk.1)?,
                fields,
            });
        }
    }
    Ok(records)
}

fn bind_value<'q>(
    query: sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>,
    column: &str,
    kind: Kind,
    value: &Value,
) -> anyhow::Result<sqlx::query::Query<'q, Sqlite, sqlx::sqlite::SqliteArguments<'q>>> {
    let bad = || anyhow::anyhow!("invalid value for '{}': {}", column, value);
    Ok(match (kind, value) {
        (Kind::Json, Value::Null) if column == "config" || column == "description" => {
            query.bind(Json(Value::Object(Map::new())))
        }
        (Kind::Json, Value::Null) => query.bind(Option::<Json<Value>>::None),
        (Kind::Json, other) => query.bind(Json(other.clone())),
        (Kind::Uuid, Value::Null) => query.bind(Option::<Uuid>::None),
        (Kind::Uuid, Value::String(s)) => query.bind(Uuid::parse_str(s).map_err(|_| bad())?),
        (Kind::Text, Value::Null) => query.bind(Option::<String>::None),
        (Kind::Text, Value::String(s)) => query.bind(s.clone()),
        (Kind::Bool, Value::Bool(b)) => query.bind(*b),
        (Kind::Int, Value::Number(n)) => query.bind(n.as_i64().ok_or_else(bad)?),
        (Kind::Timestamp, Value::String(s)) => {
            query.bind(DateTime::parse_from_rfc3339(s).map_err(|_| bad())?.with_timezone(&Utc))
        }
        (Kind::Timestamp, Value::Null) => query.bind(Utc::now()),
        _ => return Err(bad()),
    })
}

/// Upserts records by primary key, in file order, inside one transaction.
pub async fn load(db: &SqlitePool, records: &[FixtureRecord]) -> anyhow::Result<usize> {
    let mut tx = db.begin().await?;
    for (index, record) in records.iter().enumerate() {
        let model = model_for(&record.model)
            .with_context(|| format!("record {}: unknown model '{}'", index, record.model))?;
        let present: Vec<(&str, Kind, &Value)> = model
            .columns
            .iter()
            .filter_map(|(column, kind)| record.fields.get(*column).map(|v| (*column, *kind, v)))
            .collect();

        let mut columns = vec![model.pk.0];
        columns.extend(present.iter().map(|(c, _, _)| *c));
        let placeholders = vec!["?"; columns.len()].join(", ");
        let updates: Vec<String> = present.iter().map(|(c, _, _)| format!("{c} = excluded.{c}")).collect();
        let conflict = if updates.is_empty() {
            "DO NOTHING".to_string()
        } else {
            format!("DO UPDATE SET {}", updates.join(", "))
        };
        let sql = format!(
            "INSERT INTO {} ({}) VALUES ({}) ON CONFLICT({}) {}",
            model.table,
            columns.join(", "),
            placeholders,
            model.pk.0,
            conflict
        );

        let mut query = bind_value(sqlx::query(&sql), model.pk.0, model.pk.1, &record.pk)
            .with_context(|| format!("record {} ({})", index, record.model))?;
        for (column, kind, value) in &present {
            query = bind_value(query, column, *kind, value).with_context(|| format!("record {} ({})", index, record.model))?;
        }
        query.execute(&mut *tx).await.with_context(|| format!("record {} ({})", index, record.model))?;
    }
    tx.commit().await?;
    tracing::info!("Loaded {} fixture records", records.len());
    Ok(records.len())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn every_model_is_unique_and_resolvable() {
        for model in MODELS {
            assert!(std::ptr::eq(model_for(model.label).unwrap(), model));
        }
        assert!(model_for("uploads.uploadsdataset").is_none());
    }

    #[test]
    fn users_never_carry_password_hashes() {
        let users = model_for("users.user").unwrap();
        assert!(users.columns.iter().all(|(c, _)| *c != "password_hash"));
    }
}
