//! Projects and project memberships.
//!
//! The creator of a project becomes its first admin and a default folder is created alongside.
//! Membership changes keep folder permissions, member counts and notification mails in step.

use std::collections::HashSet;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::types::Json;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{validation, AppError, AppResult, OptionExt};
use crate::folders::{self, NewFolder};
use crate::locks::{self, Lockable};
use crate::mail::{self, MembershipChange};
use crate::metadata::{self, templates, Metadata, MetadataInput};
use crate::permissions::{self, MembershipFlags};
use crate::state::AppState;
use crate::types::{double_option, ContentType, MinimalUser};
use crate::users::{self, User};

pub const MAX_NAME_LEN: usize = 255;
pub const DEFAULT_FOLDER_NAME: &str = "General";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Project {
    pub id: Uuid,
    pub name: String,
    pub description: Json<Value>,
    pub metadata_template_id: Option<Uuid>,
    pub is_deletable: bool,
    pub members_count: i64,
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
pub struct ProjectView {
    #[serde(flatten)]
    pub project: Project,
    pub folders_count: i64,
    pub membership: Option<MembershipFlags>,
    pub metadata: Vec<Metadata>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewProject {
    pub name: String,
    #[serde(default)]
    pub description: Option<Value>,
    #[serde(default)]
    pub metadata_template: Option<Uuid>,
    #[serde(default)]
    pub metadata: Vec<MetadataInput>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectPatch {
    pub name: Option<String>,
    pub description: Option<Value>,
    #[serde(default, deserialize_with = "double_option")]
    pub metadata_template: Option<Option<Uuid>>,
    pub metadata: Option<Vec<MetadataInput>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct ProjectFilter {
    pub search: Option<String>,
    pub is_deletable: Option<bool>,
    /// `me` or `others`.
    pub created_by: Option<String>,
    /// `admin` or `member`.
    pub membership: Option<String>,
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Membership {
    pub id: Uuid,
    pub project_id: Uuid,
    pub member_id: Uuid,
    pub is_project_admin: bool,
    pub can_create_folders: bool,
    pub is_metadata_template_admin: bool,
    pub created_by: Option<Uuid>,
    pub last_modified_by: Option<Uuid>,
    pub creation_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
}

impl Membership {
    pub fn flags(&self) -> MembershipFlags {
        MembershipFlags {
            is_project_admin: self.is_project_admin,
            can_create_folders: self.can_create_folders,
            is_metadata_template_admin: self.is_metadata_template_admin,
        }
    }
}

#[derive(Debug, Serialize)]
pub struct MembershipView {
    #[serde(flatten)]
    pub membership: Membership,
    pub member: Option<MinimalUser>,
}

/// One entry of the `PUT /projects/{id}/members` body.
#[derive(Debug, Clone, Deserialize)]
pub struct MemberEntry {
    pub email: String,
    #[serde(flatten)]
    pub flags: MembershipFlags,
}

pub(crate) const SELECT_PROJECT: &str = "SELECT id, name, description, metadata_template_id, is_deletable, members_count, \
     metadata_templates_count, locked, locked_by, locked_at, created_by, last_modified_by, creation_date, \
     last_modified_date FROM projects";

const SELECT_MEMBERSHIP: &str = "SELECT id, project_id, member_id, is_project_admin, can_create_folders, \
     is_metadata_template_admin, created_by, last_modified_by, creation_date, last_modified_date FROM project_memberships";

fn validate_description(description: Option<Value>) -> AppResult<Value> {
    match description {
        None | Some(Value::Null) => Ok(Value::Object(Default::default())),
        Some(Value::Object(map)) => Ok(Value::Object(map)),
        Some(_) => Err(AppError::validation("description", "Description contains invalid JSON data")),
    }
}

pub async fn find(db: &SqlitePool, id: Uuid) -> AppResult<Option<Project>> {
    Ok(sqlx::query_as::<_, Project>(&format!("{} WHERE id = ?", SELECT_PROJECT)).bind(id).fetch_optional(db).await?)
}

pub async fn get(db: &SqlitePool, id: Uuid) -> AppResult<Project> {
    find(db, id).await?.ok_or_not_found("Project")
}

/// Loads a project the user is a member of; non-members get a 404.
pub async fn get_for_member(db: &SqlitePool, user: &User, id: Uuid) -> AppResult<Project> {
    let project = get(db, id).await?;
    if !permissions::is_project_member(db, user, id).await? {
        return Err(AppError::NotFound("Project not found".to_string()));
    }
    Ok(project)
}

pub async fn view(db: &SqlitePool, user: &User, project: Project) -> AppResult<ProjectView> {
    let folders_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM folders WHERE project_id = ?")
        .bind(project.id)
        .fetch_one(db)
        .await?;
    Ok(ProjectView {
        folders_count,
        membership: permissions::membership_flags(db, user.id, project.id).await?,
        metadata: metadata::list_for(db, ContentType::Project, project.id).await?,
        project,
    })
}

pub async fn has_datasets(db: &SqlitePool, project_id: Uuid) -> AppResult<bool> {
    let count: i64 = sqlx::query_scalar(
        "SELECT COUNT(*) FROM uploads_datasets d JOIN folders f ON f.id = d.folder_id WHERE f.project_id = ?",
    )
    .bind(project_id)
    .fetch_one(db)
    .await?;
    Ok(count > 0)
}

/// `is_deletable` is true exactly when no folder of the project holds a dataset.
pub async fn refresh_is_deletable(db: &SqlitePool, project_id: Uuid) -> AppResult<()> {
    let deletable = !has_datasets(db, project_id).await?;
    sqlx::query("UPDATE projects SET is_deletable = ? WHERE id = ?").bind(deletable).bind(project_id).execute(db).await?;
    Ok(())
}

pub async fn refresh_members_count(db: &SqlitePool, project_id: Uuid) -> AppResult<()> {
    sqlx::query(
        "UPDATE projects SET members_count = (SELECT COUNT(*) FROM project_memberships WHERE project_id = ?) WHERE id = ?",
    )
    .bind(project_id)
    .bind(project_id)
    .execute(db)
    .await?;
    Ok(())
}

async fn ensure_template_available(db: &SqlitePool, project_id: Option<Uuid>, template_id: Uuid) -> AppResult<()> {
    let available = match project_id {
        Some(id) => templates::available_for_project(db, id).await?,
        None => {
            let template = templates::get(db, template_id).await?;
            if template.assigned_to_content_type.is_some() {
                Vec::new()
            } else {
                vec![template]
            }
        }
    };
    if available.iter().any(|t| t.id == template_id) {
        Ok(())
    } else {
        Err(AppError::validation("metadata_template", "The metadata template is not available for this project."))
    }
}

pub async fn create(state: &AppState, user: &User, input: NewProject) -> AppResult<ProjectView> {
    let db = &state.db;
    permissions::require(user.is_superuser || user.can_create_projects, "You are not allowed to create projects.")?;
    let name = validation::validate_name(&input.name, "name", MAX_NAME_LEN)?;
    let description = validate_description(input.description)?;
    if let Some(template_id) = input.metadata_template {
        ensure_template_available(db, None, template_id).await?;
    }
    let entries = metadata::validate_inputs(db, &input.metadata).await?;

    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO projects (id, name, description, metadata_template_id, created_by, last_modified_by, \
         creation_date, last_modified_date) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(&name)
    .bind(Json(&description))
    .bind(input.metadata_template)
    .bind(user.id)
    .bind(user.id)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;

    insert_membership(db, id, user.id, MembershipFlags::ALL, user.id).await?;
    folders::create(state, user, NewFolder { project: id, name: DEFAULT_FOLDER_NAME.to_string(), ..Default::default() })
        .await?;
    if !entries.is_empty() {
        metadata::set_for_relation(db, ContentType::Project, id, &entries, false).await?;
    }

    tracing::info!(project = %id, user = %user.id, "Created project '{}'", name);
    view(db, user, get(db, id).await?).await
}

pub async fn list(db: &SqlitePool, user: &User, filter: &ProjectFilter) -> AppResult<Vec<Project>> {
    let mut sql = format!(
        "{} WHERE (? OR id IN (SELECT project_id FROM project_memberships WHERE member_id = ?))",
        SELECT_PROJECT
    );
    let search = filter.search.as_deref().map(str::trim).filter(|s| !s.is_empty());
    if search.is_some() {
        sql.push_str(" AND name LIKE ? ESCAPE '!'");
    }
    if filter.is_deletable.is_some() {
        sql.push_str(" AND is_deletable = ?");
    }
    match filter.created_by.as_deref() {
        Some("me") => sql.push_str(" AND created_by = ?"),
        Some("others") => sql.push_str(" AND (created_by IS NULL OR created_by != ?)"),
        Some(other) => return Err(AppError::validation("created_by", format!("Unknown value '{}'.", other))),
        None => {}
    }
    match filter.membership.as_deref() {
        Some("admin") => sql.push_str(
            " AND id IN (SELECT project_id FROM project_memberships WHERE member_id = ? AND is_project_admin = 1)",
        ),
        Some("member") => sql.push_str(
            " AND id IN (SELECT project_id FROM project_memberships WHERE member_id = ? AND is_project_admin = 0)",
        ),
        Some(other) => return Err(AppError::validation("membership", format!("Unknown value '{}'.", other))),
        None => {}
    }
    sql.push_str(" ORDER BY name COLLATE NOCASE, creation_date");

    let mut query = sqlx::query_as::<_, Project>(&sql).bind(user.is_superuser).bind(user.id);
    if let Some(search) = search {
        query = query.bind(crate::search::contains_pattern(search));
    }
    if let Some(deletable) = filter.is_deletable {
        query = query.bind(deletable);
    }
    if filter.created_by.is_some() {
        query = query.bind(user.id);
    }
    if filter.membership.is_some() {
        query = query.bind(user.id);
    }
    Ok(query.fetch_all(db).await?)
}

pub async fn update(state: &AppState, user: &User, id: Uuid, patch: ProjectPatch) -> AppResult<ProjectView> {
    let db = &state.db;
    get_for_member(db, user, id).await?;
    permissions::require(permissions::is_project_admin(db, user, id).await?, "Only project admins can edit a project.")?;
    locks::ensure_editable(state, Lockable::Project, id, user.id).await?;

    if let Some(name) = patch.name.as_deref() {
        let name = validation::validate_name(name, "name", MAX_NAME_LEN)?;
        sqlx::query("UPDATE projects SET name = ? WHERE id = ?").bind(name).bind(id).execute(db).await?;
    }
    if let Some(description) = patch.description {
        let description = validate_description(Some(description))?;
        sqlx::query("UPDATE projects SET description = ? WHERE id = ?").bind(Json(&description)).bind(id).execute(db).await?;
    }
    if let Some(template) = patch.metadata_template {
        if let Some(template_id) = template {
            ensure_template_available(db, Some(id), template_id).await?;
        }
        sqlx::query("UPDATE projects SET metadata_template_id = ? WHERE id = ?").bind(template).bind(id).execute(db).await?;
    }
    if let Some(inputs) = patch.metadata.as_deref() {
        let entries = metadata::validate_inputs(db, inputs).await?;
        metadata::set_for_relation(db, ContentType::Project, id, &entries, false).await?;
    }
    sqlx::query("UPDATE projects SET last_modified_by = ?, last_modified_date = ? WHERE id = ?")
        .bind(user.id)
        .bind(Utc::now())
        .bind(id)
        .execute(db)
        .await?;
    locks::release(state, Lockable::Project, id, user.id).await?;
    view(db, user, get(db, id).await?).await
}

pub async fn delete(state: &AppState, user: &User, id: Uuid) -> AppResult<()> {
    let db = &state.db;
    get_for_member(db, user, id).await?;
    permissions::require(permissions::is_project_admin(db, user, id).await?, "Only project admins can delete a project.")?;
    locks::ensure_editable(state, Lockable::Project, id, user.id).await?;
    if has_datasets(db, id).await? {
        return Err(AppError::forbidden("The project still contains datasets and cannot be deleted."));
    }

    let folder_ids: Vec<Uuid> =
        sqlx::query_scalar("SELECT id FROM folders WHERE project_id = ?").bind(id).fetch_all(db).await?;
    for folder_id in &folder_ids {
        metadata::delete_for(db, ContentType::Folder, *folder_id).await?;
        sqlx::query("DELETE FROM metadata_templates WHERE assigned_to_content_type = ? AND assigned_to_object_id = ?")
            .bind(ContentType::Folder.as_str())
            .bind(folder_id)
            .execute(db)
            .await?;
    }
    metadata::delete_for(db, ContentType::Project, id).await?;
    sqlx::query("DELETE FROM metadata_templates WHERE assigned_to_content_type = ? AND assigned_to_object_id = ?")
        .bind(ContentType::Project.as_str())
        .bind(id)
        .execute(db)
        .await?;
    sqlx::query("DELETE FROM projects WHERE id = ?").bind(id).execute(db).await?;
    tracing::info!(project = %id, user = %user.id, "Deleted project");
    Ok(())
}

// Memberships

pub async fn find_membership(db: &SqlitePool, id: Uuid) -> AppResult<Option<Membership>> {
    Ok(sqlx::query_as::<_, Membership>(&format!("{} WHERE id = ?", SELECT_MEMBERSHIP))
        .bind(id)
        .fetch_optional(db)
        .await?)
}

pub async fn membership_of(db: &SqlitePool, project_id: Uuid, member_id: Uuid) -> AppResult<Option<Membership>> {
    Ok(sqlx::query_as::<_, Membership>(&format!("{} WHERE project_id = ? AND member_id = ?", SELECT_MEMBERSHIP))
        .bind(project_id)
        .bind(member_id)
        .fetch_optional(db)
        .await?)
}

pub async fn memberships(db: &SqlitePool, project_id: Uuid) -> AppResult<Vec<Membership>> {
    Ok(sqlx::query_as::<_, Membership>(&format!("{} WHERE project_id = ? ORDER BY creation_date", SELECT_MEMBERSHIP))
        .bind(project_id)
        .fetch_all(db)
        .await?)
}

pub async fn membership_view(db: &SqlitePool, membership: Membership) -> AppResult<MembershipView> {
    let member = users::minimal(db, Some(membership.member_id)).await?;
    Ok(MembershipView { membership, member })
}

/// Applies what holding `flags` implies for the member's folder permissions.
async fn apply_folder_implications(db: &SqlitePool, membership: &Membership, by: Uuid) -> AppResult<()> {
    if membership.is_project_admin {
        let folder_ids: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM folders WHERE project_id = ?")
            .bind(membership.project_id)
            .fetch_all(db)
            .await?;
        for folder_id in folder_ids {
            folders::grant_full_permission(db, folder_id, membership.id, by).await?;
        }
    } else if membership.is_metadata_template_admin {
        sqlx::query(
            "UPDATE folder_permissions SET is_metadata_template_admin = 1, last_modified_by = ?, last_modified_date = ? \
             WHERE project_membership_id = ?",
        )
        .bind(by)
        .bind(Utc::now())
        .bind(membership.id)
        .execute(db)
        .await?;
    }
    Ok(())
}

/// Inserts a membership (flags normalized) and applies its side effects. Sends no mail.
pub async fn insert_membership(
    db: &SqlitePool,
    project_id: Uuid,
    member_id: Uuid,
    flags: MembershipFlags,
    by: Uuid,
) -> AppResult<Membership> {
    let flags = flags.normalized();
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO project_memberships (id, project_id, member_id, is_project_admin, can_create_folders, \
         is_metadata_template_admin, created_by, last_modified_by, creation_date, last_modified_date) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(project_id)
    .bind(member_id)
    .bind(flags.is_project_admin)
    .bind(flags.can_create_folders)
    .bind(flags.is_metadata_template_admin)
    .bind(by)
    .bind(by)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;
    let membership = find_membership(db, id).await?.ok_or_not_found("Project membership")?;
    apply_folder_implications(db, &membership, by).await?;
    refresh_members_count(db, project_id).await?;
    Ok(membership)
}

async fn is_last_admin(db: &SqlitePool, membership: &Membership) -> AppResult<bool> {
    if !membership.is_project_admin {
        return Ok(false);
    }
    let admins: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM project_memberships WHERE project_id = ? AND is_project_admin = 1")
            .bind(membership.project_id)
            .fetch_one(db)
            .await?;
    Ok(admins <= 1)
}

async fn guard_last_admin(db: &SqlitePool, membership: &Membership) -> AppResult<()> {
    if is_last_admin(db, membership).await? && has_datasets(db, membership.project_id).await? {
        return Err(AppError::forbidden("The last project admin cannot be removed or downgraded."));
    }
    Ok(())
}

async fn notify(state: &AppState, member_id: Uuid, project_id: Uuid, change: MembershipChange, by: &User) -> AppResult<()> {
    if member_id == by.id {
        return Ok(());
    }
    let (Some(recipient), Some(project)) = (users::find(&state.db, member_id).await?, find(&state.db, project_id).await?)
    else {
        return Ok(());
    };
    mail::enqueue(state, mail::project_membership(&recipient, &project.name, change, by)).await?;
    Ok(())
}

/// Changes the flags of a membership, honoring the last-admin rule.
pub async fn set_membership_flags(
    state: &AppState,
    by: &User,
    membership: &Membership,
    flags: MembershipFlags,
) -> AppResult<Membership> {
    let db = &state.db;
    let flags = flags.normalized();
    if flags == membership.flags() {
        return Ok(membership.clone());
    }
    if membership.is_project_admin && !flags.is_project_admin {
        guard_last_admin(db, membership).await?;
    }
    sqlx::query(
        "UPDATE project_memberships SET is_project_admin = ?, can_create_folders = ?, is_metadata_template_admin = ?, \
         last_modified_by = ?, last_modified_date = ? WHERE id = ?",
    )
    .bind(flags.is_project_admin)
    .bind(flags.can_create_folders)
    .bind(flags.is_metadata_template_admin)
    .bind(by.id)
    .bind(Utc::now())
    .bind(membership.id)
    .execute(db)
    .await?;
    let updated = find_membership(db, membership.id).await?.ok_or_not_found("Project membership")?;
    apply_folder_implications(db, &updated, by.id).await?;
    notify(state, updated.member_id, updated.project_id, MembershipChange::Changed, by).await?;
    Ok(updated)
}

/// Deletes a membership together with the member's folder permissions in the project.
pub async fn remove_membership(state: &AppState, by: &User, membership: &Membership) -> AppResult<()> {
    let db = &state.db;
    guard_last_admin(db, membership).await?;
    sqlx::query("DELETE FROM folder_permissions WHERE project_membership_id = ?").bind(membership.id).execute(db).await?;
    sqlx::query("DELETE FROM project_memberships WHERE id = ?").bind(membership.id).execute(db).await?;
    refresh_members_count(db, membership.project_id).await?;
    folders::refresh_members_counts_for_project(db, membership.project_id).await?;
    notify(state, membership.member_id, membership.project_id, MembershipChange::Removed, by).await?;
    tracing::info!(project = %membership.project_id, member = %membership.member_id, "Removed project member");
    Ok(())
}

/// Synchronizes the member list of a project with `entries`.
///
/// Grants are applied before downgrades and removals so that handing over the admin role in a
/// single request works. The calling user is never removed by a sync.
pub async fn sync_members(state: &AppState, user: &User, project_id: Uuid, entries: Vec<MemberEntry>) -> AppResult<Vec<MembershipView>> {
    let db = &state.db;
    get_for_member(db, user, project_id).await?;
    permissions::require(
        permissions::is_project_admin(db, user, project_id).await?,
        "Only project admins can manage members.",
    )?;
    locks::ensure_editable(state, Lockable::Project, project_id, user.id).await?;

    let mut wanted: Vec<(String, MembershipFlags)> = Vec::with_capacity(entries.len());
    for entry in entries {
        let email = validation::validate_email(&entry.email)?;
        wanted.retain(|(existing, _)| existing != &email);
        wanted.push((email, entry.flags.normalized()));
    }
    wanted.sort_by_key(|(_, flags)| !flags.is_project_admin);

    let mut keep: HashSet<Uuid> = HashSet::new();
    for (email, flags) in &wanted {
        let member = users::get_or_create_user(state, email).await?;
        keep.insert(member.id);
        match membership_of(db, project_id, member.id).await? {
            Some(existing) => {
                set_membership_flags(state, user, &existing, *flags).await?;
            }
            None => {
                insert_membership(db, project_id, member.id, *flags, user.id).await?;
                notify(state, member.id, project_id, MembershipChange::Added, user).await?;
            }
        }
    }

    for membership in memberships(db, project_id).await? {
        if !keep.contains(&membership.member_id) && membership.member_id != user.id {
            remove_membership(state, user, &membership).await?;
        }
    }

    let mut views = Vec::new();
    for membership in memberships(db, project_id).await? {
        views.push(membership_view(db, membership).await?);
    }
    Ok(views)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn description_must_be_an_object() {
        assert_eq!(validate_description(None).unwrap(), json!({}));
        assert_eq!(validate_description(Some(json!({"a": 1}))).unwrap(), json!({"a": 1}));
        assert!(validate_description(Some(json!("text"))).is_err());
    }

    #[test]
    fn member_entries_default_missing_flags() {
        let entry: MemberEntry = serde_json::from_value(json!({ "email": "a@b.org", "can_create_folders": true })).unwrap();
        assert_eq!(entry.flags, MembershipFlags { can_create_folders: true, ..Default::default() });
        let admin: MemberEntry = serde_json::from_value(json!({ "email": "a@b.org", "is_project_admin": true })).unwrap();
        assert_eq!(admin.flags.normalized(), MembershipFlags::ALL);
    }
}
