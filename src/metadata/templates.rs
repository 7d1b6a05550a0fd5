use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::SqlitePool;
use uuid::Uuid;

use super::values::{self, FieldType};
use super::{MetadataInput, ValidatedMetadata};
use crate::error::{validation::validate_name, AppError, AppResult, OptionExt};
use crate::locks::{self, Lockable};
use crate::permissions;
use crate::state::AppState;
use crate::types::ContentType;
use crate::users::User;

pub const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct MetadataTemplate {
    pub id: Uuid,
    pub name: String,
    pub assigned_to_content_type: Option<String>,
    pub assigned_to_object_id: Option<Uuid>,
    pub locked: bool,
    pub locked_by: Option<Uuid>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
    pub last_modified_by: Option<Uuid>,
    pub creation_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
}

#[derive(Debug, Clone, sqlx::FromRow)]
struct TemplateFieldRow {
    id: Uuid,
    metadata_template_id: Uuid,
    field_id: Option<Uuid>,
    key: String,
    custom_key: Option<String>,
    field_type: String,
    value: Option<Json<Value>>,
    config: Json<Value>,
    mandatory: bool,
    read_only: bool,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplateField {
    pub id: Uuid,
    pub metadata_template: Uuid,
    pub field: Option<Uuid>,
    pub key: String,
    pub custom_key: Option<String>,
    pub field_type: String,
    pub value: Value,
    pub config: Value,
    pub mandatory: bool,
    #[serde(skip)]
    read_only: bool,
    #[serde(skip)]
    stored: Option<Value>,
}

impl From<TemplateFieldRow> for TemplateField {
    fn from(row: TemplateFieldRow) -> Self {
        let ft = row.field_type.parse::<FieldType>().unwrap_or(FieldType::Text);
        let stored = row.value.map(|j| j.0);
        TemplateField {
            id: row.id,
            metadata_template: row.metadata_template_id,
            field: row.field_id,
            key: row.key,
            custom_key: row.custom_key,
            value: values::from_storage(ft, stored.as_ref()),
            field_type: row.field_type,
            config: row.config.0,
            mandatory: row.mandatory,
            read_only: row.read_only,
            stored,
        }
    }
}

#[derive(Debug, Clone, Serialize)]
pub struct MinimalObject {
    pub id: Uuid,
    pub name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct TemplateView {
    #[serde(flatten)]
    pub template: MetadataTemplate,
    pub assigned_to_content_object_name: Option<String>,
    pub project: Option<MinimalObject>,
    pub metadata_template_fields: Vec<TemplateField>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplateFieldInput {
    #[serde(flatten)]
    pub metadata: MetadataInput,
    #[serde(default)]
    pub mandatory: bool,
}

#[derive(Debug, Clone, Deserialize)]
pub struct NewTemplate {
    pub name: String,
    #[serde(default)]
    pub assigned_to_content_type: Option<ContentType>,
    #[serde(default)]
    pub assigned_to_object_id: Option<Uuid>,
    #[serde(default)]
    pub metadata_template_fields: Vec<TemplateFieldInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TemplatePatch {
    pub name: Option<String>,
    pub metadata_template_fields: Option<Vec<TemplateFieldInput>>,
}

#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct TemplateFilter {
    pub project: Option<Uuid>,
    pub folder: Option<Uuid>,
    pub global: Option<bool>,
}

/// Where a template lives.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TemplateTarget {
    Global,
    Project(Uuid),
    Folder(Uuid),
}

impl TemplateTarget {
    pub fn from_parts(content_type: Option<ContentType>, object_id: Option<Uuid>) -> AppResult<Self> {
        match (content_type, object_id) {
            (None, None) => Ok(TemplateTarget::Global),
            (Some(ContentType::Project), Some(id)) => Ok(TemplateTarget::Project(id)),
            (Some(ContentType::Folder), Some(id)) => Ok(TemplateTarget::Folder(id)),
            (Some(other), Some(_)) => Err(AppError::validation(
                "assigned_to_content_type",
                format!("Metadata templates cannot be assigned to {}.", other),
            )),
            _ => Err(AppError::validation(
                "assigned_to_content_type",
                "You must either provide a content type and an object id or none of them.",
            )),
        }
    }

    fn of(template: &MetadataTemplate) -> Self {
        let ct = template.assigned_to_content_type.as_deref().and_then(|ct| ct.parse::<ContentType>().ok());
        match (ct, template.assigned_to_object_id) {
            (Some(ContentType::Project), Some(id)) => TemplateTarget::Project(id),
            (Some(ContentType::Folder), Some(id)) => TemplateTarget::Folder(id),
            _ => TemplateTarget::Global,
        }
    }

    fn parts(&self) -> (Option<&'static str>, Option<Uuid>) {
        match self {
            TemplateTarget::Global => (None, None),
            TemplateTarget::Project(id) => (Some(ContentType::Project.as_str()), Some(*id)),
            TemplateTarget::Folder(id) => (Some(ContentType::Folder.as_str()), Some(*id)),
        }
    }
}

const SELECT_TEMPLATE: &str = "SELECT id, name, assigned_to_content_type, assigned_to_object_id, locked, locked_by, \
     locked_at, created_by, last_modified_by, creation_date, last_modified_date FROM metadata_templates";

const SELECT_FIELDS: &str = "SELECT tf.id, tf.metadata_template_id, tf.field_id, COALESCE(f.key, tf.custom_key, '') AS key, \
     tf.custom_key, tf.field_type, tf.value, tf.config, tf.mandatory, COALESCE(f.read_only, 0) AS read_only \
     FROM metadata_template_fields tf LEFT JOIN metadata_fields f ON f.id = tf.field_id";

pub async fn find(db: &SqlitePool, id: Uuid) -> AppResult<Option<MetadataTemplate>> {
    Ok(sqlx::query_as::<_, MetadataTemplate>(&format!("{} WHERE id = ?", SELECT_TEMPLATE))
        .bind(id)
        .fetch_optional(db)
        .await?)
}

pub async fn get(db: &SqlitePool, id: Uuid) -> AppResult<MetadataTemplate> {
    find(db, id).await?.ok_or_not_found("Metadata template")
}

pub async fn fields(db: &SqlitePool, template_id: Uuid) -> AppResult<Vec<TemplateField>> {
    let rows = sqlx::query_as::<_, TemplateFieldRow>(&format!(
        "{} WHERE tf.metadata_template_id = ? ORDER BY tf.creation_date, key",
        SELECT_FIELDS
    ))
    .bind(template_id)
    .fetch_all(db)
    .await?;
    Ok(rows.into_iter().map(TemplateField::from).collect())
}

async fn target_name(db: &SqlitePool, target: TemplateTarget) -> AppResult<Option<String>> {
    Ok(match target {
        TemplateTarget::Global => None,
        TemplateTarget::Project(id) => {
            sqlx::query_scalar("SELECT name FROM projects WHERE id = ?").bind(id).fetch_optional(db).await?
        }
        TemplateTarget::Folder(id) => {
            sqlx::query_scalar("SELECT name FROM folders WHERE id = ?").bind(id).fetch_optional(db).await?
        }
    })
}

async fn target_project(db: &SqlitePool, target: TemplateTarget) -> AppResult<Option<MinimalObject>> {
    let project_id: Option<Uuid> = match target {
        TemplateTarget::Global => None,
        TemplateTarget::Project(id) => Some(id),
        TemplateTarget::Folder(id) => {
            sqlx::query_scalar("SELECT project_id FROM folders WHERE id = ?").bind(id).fetch_optional(db).await?
        }
    };
    let Some(project_id) = project_id else { return Ok(None) };
    let name: Option<String> =
        sqlx::query_scalar("SELECT name FROM projects WHERE id = ?").bind(project_id).fetch_optional(db).await?;
    Ok(name.map(|name| MinimalObject { id: project_id, name }))
}

pub async fn view(db: &SqlitePool, template: MetadataTemplate) -> AppResult<TemplateView> {
    let target = TemplateTarget::of(&template);
    Ok(TemplateView {
        assigned_to_content_object_name: target_name(db, target).await?,
        project: target_project(db, target).await?,
        metadata_template_fields: fields(db, template.id).await?,
        template,
    })
}

async fn target_exists(db: &SqlitePool, target: TemplateTarget) -> AppResult<()> {
    match target {
        TemplateTarget::Global => Ok(()),
        TemplateTarget::Project(_) | TemplateTarget::Folder(_) => {
            target_name(db, target).await?.map(|_| ()).ok_or_else(|| {
                AppError::validation("assigned_to_object_id", "The object the template is assigned to does not exist.")
            })
        }
    }
}

/// Whether `user` may create or change templates at `target`.
pub async fn can_manage(db: &SqlitePool, user: &User, target: TemplateTarget) -> AppResult<bool> {
    match target {
        TemplateTarget::Global => Ok(user.is_superuser || user.is_global_metadata_template_admin),
        TemplateTarget::Project(id) => permissions::is_project_metadata_template_admin(db, user, id).await,
        TemplateTarget::Folder(id) => permissions::is_folder_metadata_template_admin(db, user, id).await,
    }
}

pub async fn can_view(db: &SqlitePool, user: &User, template: &MetadataTemplate) -> AppResult<bool> {
    match TemplateTarget::of(template) {
        TemplateTarget::Global => Ok(true),
        TemplateTarget::Project(id) => permissions::is_project_member(db, user, id).await,
        TemplateTarget::Folder(id) => permissions::can_view_in_folder(db, user, id).await,
    }
}

async fn validate_fields(db: &SqlitePool, inputs: &[TemplateFieldInput]) -> AppResult<Vec<(ValidatedMetadata, bool)>> {
    let mut out: Vec<(ValidatedMetadata, bool)> = Vec::with_capacity(inputs.len());
    for input in inputs {
        let validated = super::validate_input(db, &input.metadata).await?;
        out.retain(|(existing, _)| existing.key != validated.key);
        out.push((validated, input.mandatory));
    }
    Ok(out)
}

async fn insert_fields(db: &SqlitePool, template_id: Uuid, fields: &[(ValidatedMetadata, bool)]) -> AppResult<()> {
    for (entry, mandatory) in fields {
        sqlx::query(
            "INSERT INTO metadata_template_fields (id, metadata_template_id, field_id, custom_key, field_type, value, \
             config, mandatory, creation_date) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
        )
        .bind(Uuid::new_v4())
        .bind(template_id)
        .bind(entry.field_id)
        .bind(&entry.custom_key)
        .bind(entry.field_type.as_str())
        .bind(Json(&entry.stored))
        .bind(Json(&entry.config))
        .bind(*mandatory)
        .bind(Utc::now())
        .execute(db)
        .await?;
    }
    Ok(())
}

/// Recomputes `metadata_templates_count` of the project or folder a template is assigned to.
pub async fn refresh_count(db: &SqlitePool, target: TemplateTarget) -> AppResult<()> {
    let (table, ct, id) = match target {
        TemplateTarget::Global => return Ok(()),
        TemplateTarget::Project(id) => ("projects", ContentType::Project, id),
        TemplateTarget::Folder(id) => ("folders", ContentType::Folder, id),
    };
    let sql = format!(
        "UPDATE {} SET metadata_templates_count = (SELECT COUNT(*) FROM metadata_templates \
         WHERE assigned_to_content_type = ? AND assigned_to_object_id = ?) WHERE id = ?",
        table
    );
    sqlx::query(&sql).bind(ct.as_str()).bind(id).bind(id).execute(db).await?;
    Ok(())
}

pub async fn create(state: &AppState, user: &User, input: NewTemplate) -> AppResult<TemplateView> {
    let db = &state.db;
    let name = validate_name(&input.name, "name", MAX_NAME_LEN)?;
    let target = TemplateTarget::from_parts(input.assigned_to_content_type, input.assigned_to_object_id)?;
    target_exists(db, target).await?;
    permissions::require(
        can_manage(db, user, target).await?,
        "You are not allowed to manage metadata templates here.",
    )?;
    let fields = validate_fields(db, &input.metadata_template_fields).await?;

    let id = Uuid::new_v4();
    let now = Utc::now();
    let (ct, object_id) = target.parts();
    sqlx::query(
        "INSERT INTO metadata_templates (id, name, assigned_to_content_type, assigned_to_object_id, created_by, \
         last_modified_by, creation_date, last_modified_date) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(&name)
    .bind(ct)
    .bind(object_id)
    .bind(user.id)
    .bind(user.id)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;
    insert_fields(db, id, &fields).await?;
    refresh_count(db, target).await?;

    tracing::info!(template = %id, user = %user.id, "Created metadata template '{}'", name);
    view(db, get(db, id).await?).await
}

pub async fn update(state: &AppState, user: &User, id: Uuid, patch: TemplatePatch) -> AppResult<TemplateView> {
    let db = &state.db;
    let template = get(db, id).await?;
    permissions::require(
        can_manage(db, user, TemplateTarget::of(&template)).await?,
        "You are not allowed to manage this metadata template.",
    )?;
    locks::ensure_editable(state, Lockable::MetadataTemplate, id, user.id).await?;

    if let Some(name) = patch.name.as_deref() {
        let name = validate_name(name, "name", MAX_NAME_LEN)?;
        sqlx::query("UPDATE metadata_templates SET name = ? WHERE id = ?").bind(name).bind(id).execute(db).await?;
    }
    if let Some(inputs) = patch.metadata_template_fields.as_deref() {
        let fields = validate_fields(db, inputs).await?;
        sqlx::query("DELETE FROM metadata_template_fields WHERE metadata_template_id = ?").bind(id).execute(db).await?;
        insert_fields(db, id, &fields).await?;
    }
    sqlx::query("UPDATE metadata_templates SET last_modified_by = ?, last_modified_date = ? WHERE id = ?")
        .bind(user.id)
        .bind(Utc::now())
        .bind(id)
        .execute(db)
        .await?;
    locks::release(state, Lockable::MetadataTemplate, id, user.id).await?;
    view(db, get(db, id).await?).await
}

pub async fn delete(state: &AppState, user: &User, id: Uuid) -> AppResult<()> {
    let db = &state.db;
    let template = get(db, id).await?;
    let target = TemplateTarget::of(&template);
    permissions::require(can_manage(db, user, target).await?, "You are not allowed to delete this metadata template.")?;
    locks::ensure_editable(state, Lockable::MetadataTemplate, id, user.id).await?;

    sqlx::query("UPDATE projects SET metadata_template_id = NULL WHERE metadata_template_id = ?").bind(id).execute(db).await?;
    sqlx::query("UPDATE folders SET metadata_template_id = NULL WHERE metadata_template_id = ?").bind(id).execute(db).await?;
    sqlx::query("DELETE FROM metadata_templates WHERE id = ?").bind(id).execute(db).await?;
    refresh_count(db, target).await?;
    tracing::info!(template = %id, user = %user.id, "Deleted metadata template");
    Ok(())
}

/// Templates the user can see, narrowed by the filter.
pub async fn list(db: &SqlitePool, user: &User, filter: TemplateFilter) -> AppResult<Vec<MetadataTemplate>> {
    let mut sql = format!(
        "{} WHERE (? OR assigned_to_content_type IS NULL \
         OR (assigned_to_content_type = 'projects.project' AND assigned_to_object_id IN \
             (SELECT project_id FROM project_memberships WHERE member_id = ?)) \
         OR (assigned_to_content_type = 'folders.folder' AND assigned_to_object_id IN \
             (SELECT fp.folder_id FROM folder_permissions fp JOIN project_memberships pm \
              ON pm.id = fp.project_membership_id WHERE pm.member_id = ?)))",
        SELECT_TEMPLATE
    );
    if filter.project.is_some() {
        sql.push_str(" AND assigned_to_content_type = 'projects.project' AND assigned_to_object_id = ?");
    }
    if filter.folder.is_some() {
        sql.push_str(" AND assigned_to_content_type = 'folders.folder' AND assigned_to_object_id = ?");
    }
    match filter.global {
        Some(true) => sql.push_str(" AND assigned_to_content_type IS NULL"),
        Some(false) => sql.push_str(" AND assigned_to_content_type IS NOT NULL"),
        None => {}
    }
    sql.push_str(" ORDER BY name, creation_date");

    let mut query = sqlx::query_as::<_, MetadataTemplate>(&sql).bind(user.is_superuser).bind(user.id).bind(user.id);
    if let Some(project) = filter.project {
        query = query.bind(project);
    }
    if let Some(folder) = filter.folder {
        query = query.bind(folder);
    }
    Ok(query.fetch_all(db).await?)
}

/// Templates usable by a project: its own plus the global ones.
pub async fn available_for_project(db: &SqlitePool, project_id: Uuid) -> AppResult<Vec<MetadataTemplate>> {
    Ok(sqlx::query_as::<_, MetadataTemplate>(&format!(
        "{} WHERE assigned_to_content_type IS NULL \
         OR (assigned_to_content_type = 'projects.project' AND assigned_to_object_id = ?) ORDER BY name",
        SELECT_TEMPLATE
    ))
    .bind(project_id)
    .fetch_all(db)
    .await?)
}

/// Templates usable by a folder: its own, its project's and the global ones.
pub async fn available_for_folder(db: &SqlitePool, folder_id: Uuid) -> AppResult<Vec<MetadataTemplate>> {
    Ok(sqlx::query_as::<_, MetadataTemplate>(&format!(
        "{} WHERE assigned_to_content_type IS NULL \
         OR (assigned_to_content_type = 'folders.folder' AND assigned_to_object_id = ?) \
         OR (assigned_to_content_type = 'projects.project' AND assigned_to_object_id = \
             (SELECT project_id FROM folders WHERE id = ?)) ORDER BY name",
        SELECT_TEMPLATE
    ))
    .bind(folder_id)
    .bind(folder_id)
    .fetch_all(db)
    .await?)
}

/// Template fields as metadata entries linked back to their template field.
pub async fn as_metadata(db: &SqlitePool, template_id: Uuid) -> AppResult<Vec<ValidatedMetadata>> {
    Ok(fields(db, template_id)
        .await?
        .into_iter()
        .map(|field| {
            let field_type = field.field_type.parse::<FieldType>().unwrap_or(FieldType::Text);
            ValidatedMetadata {
                field_id: field.field,
                custom_key: if field.field.is_none() { Some(field.key.clone()) } else { None },
                key: field.key,
                field_type,
                read_only: field.read_only,
                stored: field.stored.unwrap_or_else(|| values::to_storage(field_type, None)),
                config: field.config,
                metadata_template_field_id: Some(field.id),
            }
        })
        .collect())
}

/// Keys that must carry a value for a version to count as complete.
pub async fn mandatory_keys(db: &SqlitePool, template_id: Uuid) -> AppResult<Vec<String>> {
    Ok(fields(db, template_id).await?.into_iter().filter(|f| f.mandatory).map(|f| f.key).collect())
}
