//! Folders inside a project and the per-folder permissions of project members.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{validation, AppError, AppResult, OptionExt};
use crate::locks::{self, Lockable};
use crate::metadata::{self, templates, Metadata, MetadataInput};
use crate::permissions::{self, FolderFlags, MembershipFlags};
use crate::projects;
use crate::state::AppState;
use crate::types::{double_option, ContentType, MinimalUser};
use crate::users::{self, User};

pub const MAX_NAME_LEN: usize = 255;

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Folder {
    pub id: Uuid,
    pub project_id: Uuid,
    pub name: String,
    pub description: Json<Value>,
    pub metadata_template_id: Option<Uuid>,
    pub members_count: i64,
    pub datasets_count: i64,
    pub metadata_templates_count: i64,
    pub locked: bool,
    pub locked_by: Option<Uuid>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
    pub last_modified_by: Option<Uuid>,
    pub creation_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct FolderView {
    #[serde(flatten)]
    pub folder: Folder,
    pub permission: Option<FolderFlags>,
    pub metadata: Vec<Metadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewFolder {
    pub project: Uuid,
    pub name: String,
    #[serde(default)]
    pub description: Option<Value>,
    #[serde(default)]
    pub metadata_template: Option<Uuid>,
    #[serde(default)]
    pub metadata: Vec<MetadataInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct FolderPatch {
    pub name: Option<String>,
    pub description: Option<Value>,
    #[serde(default, deserialize_with = "double_option")]
    pub metadata_template: Option<Option<Uuid>>,
    pub metadata: Option<Vec<MetadataInput>>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct FolderPermission {
    pub id: Uuid,
    pub folder_id: Uuid,
    pub project_membership_id: Uuid,
    pub member_id: Uuid,
    pub project_id: Uuid,
    pub is_folder_admin: bool,
    pub is_metadata_template_admin: bool,
    pub can_edit: bool,
    pub created_by: Option<Uuid>,
    pub last_modified_by: Option<Uuid>,
    pub creation_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
}

impl FolderPermission {
    pub fn flags(&self) -> FolderFlags {
        FolderFlags {
            is_folder_admin: self.is_folder_admin,
            is_metadata_template_admin: self.is_metadata_template_admin,
            can_edit: self.can_edit,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct FolderPermissionView {
    #[serde(flatten)]
    pub permission: FolderPermission,
    pub role: &'static str,
    pub member: Option<MinimalUser>,
}

/// One entry of the `PUT /folders/{id}/permissions` body.
#[derive(Debug, Clone, Deserialize)]
pub struct FolderUserEntry {
    pub email: String,
    #[serde(flatten)]
    pub flags: FolderFlags,
}

pub(crate) const SELECT_FOLDER: &str = "SELECT id, project_id, name, description, metadata_template_id, members_count, \
     datasets_count, metadata_templates_count, locked, locked_by, locked_at, created_by, last_modified_by, \
     creation_date, last_modified_date FROM folders";

const SELECT_PERMISSION: &str = "SELECT fp.id, fp.folder_id, fp.project_membership_id, pm.member_id, pm.project_id, \
     fp.is_folder_admin, fp.is_metadata_template_admin, fp.can_edit, fp.created_by, fp.last_modified_by, \
     fp.creation_date, fp.last_modified_date FROM folder_permissions fp \
     JOIN project_memberships pm ON pm.id = fp.project_membership_id";

fn validate_description(description: Option<Value>) -> AppResult<Value> {
    match description {
        None | Some(Value::Null) => Ok(Value::Object(Default::default())),
        Some(Value::Object(map)) => Ok(Value::Object(map)),
        Some(_) => Err(AppError::validation("description", "Description contains invalid JSON data")),
    }
}

pub async fn find(db: &SqlitePool, id: Uuid) -> AppResult<Option<Folder>> {
    Ok(sqlx::query_as::<_, Folder>(&format!("{} WHERE id = ?", SELECT_FOLDER)).bind(id).fetch_optional(db).await?)
}

pub async fn get(db: &SqlitePool, id: Uuid) -> AppResult<Folder> {
    find(db, id).await?.ok_or_not_found("Folder")
}

/// Loads a folder the user holds a permission on; everybody else gets a 404.
pub async fn get_for_viewer(db: &SqlitePool, user: &User, id: Uuid) -> AppResult<Folder> {
    let folder = get(db, id).await?;
    if !permissions::can_view_in_folder(db, user, id).await? {
        return Err(AppError::NotFound("Folder not found".to_string()));
    }
    Ok(folder)
}

pub async fn view(db: &SqlitePool, user: &User, folder: Folder) -> AppResult<FolderView> {
    Ok(FolderView {
        permission: permissions::folder_flags(db, user.id, folder.id).await?,
        metadata: metadata::list_for(db, ContentType::Folder, folder.id).await?,
        folder,
    })
}

pub async fn is_empty(db: &SqlitePool, folder_id: Uuid) -> AppResult<bool> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM uploads_datasets WHERE folder_id = ?")
        .bind(folder_id)
        .fetch_one(db)
        .await?;
    Ok(count == 0)
}

pub async fn refresh_members_count(db: &SqlitePool, folder_id: Uuid) -> AppResult<()> {
    sqlx::query("UPDATE folders SET members_count = (SELECT COUNT(*) FROM folder_permissions WHERE folder_id = ?) WHERE id = ?")
        .bind(folder_id)
        .bind(folder_id)
        .execute(db)
        .await?;
    Ok(())
}

pub async fn refresh_members_counts_for_project(db: &SqlitePool, project_id: Uuid) -> AppResult<()> {
    sqlx::query(
        "UPDATE folders SET members_count = (SELECT COUNT(*) FROM folder_permissions fp WHERE fp.folder_id = folders.id) \
         WHERE project_id = ?",
    )
    .bind(project_id)
    .execute(db)
    .await?;
    Ok(())
}

/// Recomputes `datasets_count` of the folder and `is_deletable` of its project.
pub async fn refresh_datasets_count(db: &SqlitePool, folder_id: Uuid) -> AppResult<()> {
    sqlx::query("UPDATE folders SET datasets_count = (SELECT COUNT(*) FROM uploads_datasets WHERE folder_id = ?) WHERE id = ?")
        .bind(folder_id)
        .bind(folder_id)
        .execute(db)
        .await?;
    if let Some(folder) = find(db, folder_id).await? {
        projects::refresh_is_deletable(db, folder.project_id).await?;
    }
    Ok(())
}

/// Gives a membership every folder flag, creating the permission when missing.
pub async fn grant_full_permission(db: &SqlitePool, folder_id: Uuid, membership_id: Uuid, by: Uuid) -> AppResult<()> {
    upsert_permission(db, folder_id, membership_id, FolderFlags::ALL, by).await?;
    Ok(())
}

async fn upsert_permission(
    db: &SqlitePool,
    folder_id: Uuid,
    membership_id: Uuid,
    flags: FolderFlags,
    by: Uuid,
) -> AppResult<Uuid> {
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO folder_permissions (id, folder_id, project_membership_id, is_folder_admin, is_metadata_template_admin, \
         can_edit, created_by, last_modified_by, creation_date, last_modified_date) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?) \
         ON CONFLICT(folder_id, project_membership_id) DO UPDATE SET is_folder_admin = excluded.is_folder_admin, \
         is_metadata_template_admin = excluded.is_metadata_template_admin, can_edit = excluded.can_edit, \
         last_modified_by = excluded.last_modified_by, last_modified_date = excluded.last_modified_date",
    )
    .bind(Uuid::new_v4())
    .bind(folder_id)
    .bind(membership_id)
    .bind(flags.is_folder_admin)
    .bind(flags.is_metadata_template_admin)
    .bind(flags.can_edit)
    .bind(by)
    .bind(by)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;
    refresh_members_count(db, folder_id).await?;
    let id: Uuid =
        sqlx::query_scalar("SELECT id FROM folder_permissions WHERE folder_id = ? AND project_membership_id = ?")
            .bind(folder_id)
            .bind(membership_id)
            .fetch_one(db)
            .await?;
    Ok(id)
}

async fn ensure_template_available(db: &SqlitePool, folder_id: Uuid, template_id: Uuid) -> AppResult<()> {
    if templates::available_for_folder(db, folder_id).await?.iter().any(|t| t.id == template_id) {
        Ok(())
    } else {
        Err(template_unavailable())
    }
}

fn template_unavailable() -> AppError {
    AppError::validation("metadata_template", "The metadata template is not available for this folder.")
}

pub async fn create(state: &AppState, user: &User, input: NewFolder) -> AppResult<FolderView> {
    let db = &state.db;
    projects::get_for_member(db, user, input.project).await?;
    permissions::require(
        permissions::can_create_folders(db, user, input.project).await?,
        "You are not allowed to create folders in this project.",
    )?;
    let name = validation::validate_name(&input.name, "name", MAX_NAME_LEN)?;
    let description = validate_description(input.description)?;
    let entries = metadata::validate_inputs(db, &input.metadata).await?;
    // A new folder has no templates of its own yet
    if let Some(template_id) = input.metadata_template {
        if !templates::available_for_project(db, input.project).await?.iter().any(|t| t.id == template_id) {
            return Err(template_unavailable());
        }
    }

    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO folders (id, project_id, name, description, metadata_template_id, created_by, last_modified_by, \
         creation_date, last_modified_date) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(input.project)
    .bind(&name)
    .bind(Json(&description))
    .bind(input.metadata_template)
    .bind(user.id)
    .bind(user.id)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;

    let memberships: Vec<Uuid> = sqlx::query_scalar(
        "SELECT id FROM project_memberships WHERE project_id = ? AND (member_id = ? OR is_project_admin = 1)",
    )
    .bind(input.project)
    .bind(user.id)
    .fetch_all(db)
    .await?;
    for membership_id in memberships {
        grant_full_permission(db, id, membership_id, user.id).await?;
    }
    if !entries.is_empty() {
        metadata::set_for_relation(db, ContentType::Folder, id, &entries, false).await?;
    }

    tracing::info!(folder = %id, project = %input.project, "Created folder '{}'", name);
    view(db, user, get(db, id).await?).await
}

/// Folders the user holds a permission on, optionally limited to one project.
pub async fn list(db: &SqlitePool, user: &User, project: Option<Uuid>) -> AppResult<Vec<Folder>> {
    let mut sql = format!(
        "{} WHERE (? OR id IN (SELECT fp.folder_id FROM folder_permissions fp JOIN project_memberships pm \
         ON pm.id = fp.project_membership_id WHERE pm.member_id = ?))",
        SELECT_FOLDER
    );
    if project.is_some() {
        sql.push_str(" AND project_id = ?");
    }
    sql.push_str(" ORDER BY name COLLATE NOCASE, creation_date");
    let mut query = sqlx::query_as::<_, Folder>(&sql).bind(user.is_superuser).bind(user.id);
    if let Some(project) = project {
        query = query.bind(project);
    }
    Ok(query.fetch_all(db).await?)
}

pub async fn update(state: &AppState, user: &User, id: Uuid, patch: FolderPatch) -> AppResult<FolderView> {
    let db = &state.db;
    get_for_viewer(db, user, id).await?;
    permissions::require(permissions::is_folder_admin(db, user, id).await?, "Only folder admins can edit a folder.")?;
    locks::ensure_editable(state, Lockable::Folder, id, user.id).await?;

    if let Some(name) = patch.name.as_deref() {
        let name = validation::validate_name(name, "name", MAX_NAME_LEN)?;
        sqlx::query("UPDATE folders SET name = ? WHERE id = ?").bind(name).bind(id).execute(db).await?;
    }
    if let Some(description) = patch.description {
        let description = validate_description(Some(description))?;
        sqlx::query("UPDATE folders SET description = ? WHERE id = ?").bind(Json(&description)).bind(id).execute(db).await?;
    }
    if let Some(template) = patch.metadata_template {
        if let Some(template_id) = template {
            ensure_template_available(db, id, template_id).await?;
        }
        sqlx::query("UPDATE folders SET metadata_template_id = ? WHERE id = ?").bind(template).bind(id).execute(db).await?;
    }
    if let Some(inputs) = patch.metadata.as_deref() {
        let entries = metadata::validate_inputs(db, inputs).await?;
        metadata::set_for_relation(db, ContentType::Folder, id, &entries, false).await?;
    }
    sqlx::query("UPDATE folders SET last_modified_by = ?, last_modified_date = ? WHERE id = ?")
        .bind(user.id)
        .bind(Utc::now())
        .bind(id)
        .execute(db)
        .await?;
    locks::release(state, Lockable::Folder, id, user.id).await?;
    view(db, user, get(db, id).await?).await
}

pub async fn delete(state: &AppState, user: &User, id: Uuid) -> AppResult<()> {
    let db = &state.db;
    let folder = get_for_viewer(db, user, id).await?;
    permissions::require(permissions::is_folder_admin(db, user, id).await?, "Only folder admins can delete a folder.")?;
    locks::ensure_editable(state, Lockable::Folder, id, user.id).await?;
    if !is_empty(db, id).await? {
        return Err(AppError::forbidden("The folder still contains datasets and cannot be deleted."));
    }

    metadata::delete_for(db, ContentType::Folder, id).await?;
    sqlx::query("DELETE FROM metadata_templates WHERE assigned_to_content_type = ? AND assigned_to_object_id = ?")
        .bind(ContentType::Folder.as_str())
        .bind(id)
        .execute(db)
        .await?;
    sqlx::query("DELETE FROM folders WHERE id = ?").bind(id).execute(db).await?;
    projects::refresh_is_deletable(db, folder.project_id).await?;
    tracing::info!(folder = %id, user = %user.id, "Deleted folder");
    Ok(())
}

// Folder permissions

pub async fn find_permission(db: &SqlitePool, id: Uuid) -> AppResult<Option<FolderPermission>> {
    Ok(sqlx::query_as::<_, FolderPermission>(&format!("{} WHERE fp.id = ?", SELECT_PERMISSION))
        .bind(id)
        .fetch_optional(db)
        .await?)
}

pub async fn permissions_of(db: &SqlitePool, folder_id: Uuid) -> AppResult<Vec<FolderPermission>> {
    Ok(sqlx::query_as::<_, FolderPermission>(&format!(
        "{} WHERE fp.folder_id = ? ORDER BY fp.creation_date",
        SELECT_PERMISSION
    ))
    .bind(folder_id)
    .fetch_all(db)
    .await?)
}

pub async fn permission_view(db: &SqlitePool, permission: FolderPermission) -> AppResult<FolderPermissionView> {
    Ok(FolderPermissionView {
        role: permissions::folder_role(&permission.flags()),
        member: users::minimal(db, Some(permission.member_id)).await?,
        permission,
    })
}

async fn membership_flags_of(db: &SqlitePool, permission: &FolderPermission) -> AppResult<MembershipFlags> {
    Ok(permissions::membership_flags(db, permission.member_id, permission.project_id).await?.unwrap_or_default())
}

async fn is_last_folder_admin(db: &SqlitePool, permission: &FolderPermission) -> AppResult<bool> {
    if !permission.is_folder_admin {
        return Ok(false);
    }
    let admins: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM folder_permissions WHERE folder_id = ? AND is_folder_admin = 1")
        .bind(permission.folder_id)
        .fetch_one(db)
        .await?;
    Ok(admins <= 1)
}

/// Flags a permission effectively ends up with.
///
/// Project admins keep every flag, project template admins keep the template flag and the last
/// admin of a non-empty folder stays admin.
async fn effective_flags(db: &SqlitePool, permission: &FolderPermission, requested: FolderFlags) -> AppResult<FolderFlags> {
    let membership = membership_flags_of(db, permission).await?;
    if membership.is_project_admin {
        return Ok(FolderFlags::ALL);
    }
    let mut flags = requested.normalized();
    if membership.is_metadata_template_admin {
        flags.is_metadata_template_admin = true;
    }
    if permission.is_folder_admin
        && !flags.is_folder_admin
        && is_last_folder_admin(db, permission).await?
        && !is_empty(db, permission.folder_id).await?
    {
        return Ok(FolderFlags::ALL);
    }
    Ok(flags)
}

pub async fn set_permission_flags(
    db: &SqlitePool,
    by: &User,
    permission: &FolderPermission,
    requested: FolderFlags,
) -> AppResult<FolderPermission> {
    let flags = effective_flags(db, permission, requested).await?;
    sqlx::query(
        "UPDATE folder_permissions SET is_folder_admin = ?, is_metadata_template_admin = ?, can_edit = ?, \
         last_modified_by = ?, last_modified_date = ? WHERE id = ?",
    )
    .bind(flags.is_folder_admin)
    .bind(flags.is_metadata_template_admin)
    .bind(flags.can_edit)
    .bind(by.id)
    .bind(Utc::now())
    .bind(permission.id)
    .execute(db)
    .await?;
    find_permission(db, permission.id).await?.ok_or_not_found("Folder permission")
}

pub async fn remove_permission(db: &SqlitePool, permission: &FolderPermission) -> AppResult<()> {
    if !is_empty(db, permission.folder_id).await? {
        if is_last_folder_admin(db, permission).await? {
            return Err(AppError::forbidden("The last folder admin cannot be removed."));
        }
        if membership_flags_of(db, permission).await?.is_project_admin {
            return Err(AppError::forbidden("Project admins cannot be removed from a folder."));
        }
    }
    sqlx::query("DELETE FROM folder_permissions WHERE id = ?").bind(permission.id).execute(db).await?;
    refresh_members_count(db, permission.folder_id).await?;
    Ok(())
}

/// Synchronizes the permission list of a folder with `entries`. Project admins are always kept.
pub async fn sync_permissions(
    state: &AppState,
    user: &User,
    folder_id: Uuid,
    entries: Vec<FolderUserEntry>,
) -> AppResult<Vec<FolderPermissionView>> {
    let db = &state.db;
    let folder = get_for_viewer(db, user, folder_id).await?;
    permissions::require(
        permissions::is_folder_admin(db, user, folder_id).await?,
        "Only folder admins can manage folder permissions.",
    )?;
    locks::ensure_editable(state, Lockable::Folder, folder_id, user.id).await?;

    let mut wanted: Vec<(String, FolderFlags)> = Vec::with_capacity(entries.len());
    for entry in entries {
        let email = validation::validate_email(&entry.email)?;
        wanted.retain(|(existing, _)| existing != &email);
        wanted.push((email, entry.flags.normalized()));
    }
    let admin_emails: Vec<String> = sqlx::query_scalar(
        "SELECT u.email FROM project_memberships pm JOIN users u ON u.id = pm.member_id \
         WHERE pm.project_id = ? AND pm.is_project_admin = 1",
    )
    .bind(folder.project_id)
    .fetch_all(db)
    .await?;
    for email in admin_emails {
        let email = email.to_lowercase();
        wanted.retain(|(existing, _)| existing != &email);
        wanted.push((email, FolderFlags::ALL));
    }
    wanted.sort_by_key(|(_, flags)| !flags.is_folder_admin);

    let mut keep: HashSet<Uuid> = HashSet::new();
    for (email, flags) in &wanted {
        let member = users::get_or_create_user(state, email).await?;
        let membership = match projects::membership_of(db, folder.project_id, member.id).await? {
            Some(m) => m,
            None => projects::insert_membership(db, folder.project_id, member.id, MembershipFlags::default(), user.id).await?,
        };
        let flags = if membership.is_project_admin { FolderFlags::ALL } else { *flags };
        let permission_id = upsert_permission(db, folder_id, membership.id, flags, user.id).await?;
        keep.insert(permission_id);
    }

    for permission in permissions_of(db, folder_id).await? {
        if !keep.contains(&permission.id) {
            remove_permission(db, &permission).await?;
        }
    }

    let mut views = Vec::new();
    for permission in permissions_of(db, folder_id).await? {
        views.push(permission_view(db, permission).await?);
    }
    Ok(views)
}
