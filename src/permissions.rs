//! Permission predicates shared by the handlers. Superusers pass every check.

use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::users::User;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct MembershipFlags {
    #[serde(default)]
    pub is_project_admin: bool,
    #[serde(default)]
    pub can_create_folders: bool,
    #[serde(default)]
    pub is_metadata_template_admin: bool,
}

impl MembershipFlags {
    pub const ALL: MembershipFlags =
        MembershipFlags { is_project_admin: true, can_create_folders: true, is_metadata_template_admin: true };

    /// Project admins always hold every flag.
    pub fn normalized(self) -> Self {
        if self.is_project_admin { Self::ALL } else { self }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, sqlx::FromRow)]
pub struct FolderFlags {
    #[serde(default)]
    pub is_folder_admin: bool,
    #[serde(default)]
    pub is_metadata_template_admin: bool,
    #[serde(default)]
    pub can_edit: bool,
}

impl FolderFlags {
    pub const ALL: FolderFlags = FolderFlags { is_folder_admin: true, is_metadata_template_admin: true, can_edit: true };

    /// Folder admins always hold every flag.
    pub fn normalized(self) -> Self {
        if self.is_folder_admin { Self::ALL } else { self }
    }
}

pub async fn membership_flags(db: &SqlitePool, user_id: Uuid, project_id: Uuid) -> AppResult<Option<MembershipFlags>> {
    Ok(sqlx::query_as::<_, MembershipFlags>(
        "SELECT is_project_admin, can_create_folders, is_metadata_template_admin FROM project_memberships \
         WHERE project_id = ? AND member_id = ?",
    )
    .bind(project_id)
    .bind(user_id)
    .fetch_optional(db)
    .await?)
}

pub async fn folder_flags(db: &SqlitePool, user_id: Uuid, folder_id: Uuid) -> AppResult<Option<FolderFlags>> {
    Ok(sqlx::query_as::<_, FolderFlags>(
        "SELECT fp.is_folder_admin, fp.is_metadata_template_admin, fp.can_edit FROM folder_permissions fp \
         JOIN project_memberships pm ON pm.id = fp.project_membership_id \
         WHERE fp.folder_id = ? AND pm.member_id = ?",
    )
    .bind(folder_id)
    .bind(user_id)
    .fetch_optional(db)
    .await?)
}

pub async fn is_project_member(db: &SqlitePool, user: &User, project_id: Uuid) -> AppResult<bool> {
    Ok(user.is_superuser || membership_flags(db, user.id, project_id).await?.is_some())
}

pub async fn is_project_admin(db: &SqlitePool, user: &User, project_id: Uuid) -> AppResult<bool> {
    Ok(user.is_superuser || membership_flags(db, user.id, project_id).await?.is_some_and(|m| m.is_project_admin))
}

pub async fn can_create_folders(db: &SqlitePool, user: &User, project_id: Uuid) -> AppResult<bool> {
    Ok(user.is_superuser || membership_flags(db, user.id, project_id).await?.is_some_and(|m| m.can_create_folders))
}

pub async fn is_project_metadata_template_admin(db: &SqlitePool, user: &User, project_id: Uuid) -> AppResult<bool> {
    Ok(user.is_superuser
        || membership_flags(db, user.id, project_id).await?.is_some_and(|m| m.is_metadata_template_admin))
}

pub async fn can_view_in_folder(db: &SqlitePool, user: &User, folder_id: Uuid) -> AppResult<bool> {
    Ok(user.is_superuser || folder_flags(db, user.id, folder_id).await?.is_some())
}

pub async fn can_edit_in_folder(db: &SqlitePool, user: &User, folder_id: Uuid) -> AppResult<bool> {
    Ok(user.is_superuser || folder_flags(db, user.id, folder_id).await?.is_some_and(|f| f.can_edit))
}

pub async fn is_folder_admin(db: &SqlitePool, user: &User, folder_id: Uuid) -> AppResult<bool> {
    Ok(user.is_superuser || folder_flags(db, user.id, folder_id).await?.is_some_and(|f| f.is_folder_admin))
}

pub async fn is_folder_metadata_template_admin(db: &SqlitePool, user: &User, folder_id: Uuid) -> AppResult<bool> {
    Ok(user.is_superuser
        || folder_flags(db, user.id, folder_id).await?.is_some_and(|f| f.is_metadata_template_admin))
}

/// Drafts may be deleted by their creator; anything else needs the hard delete flag.
pub fn can_delete_dataset(user: &User, created_by: Option<Uuid>, is_published: bool) -> bool {
    user.is_superuser || user.can_hard_delete_datasets || (!is_published && created_by == Some(user.id))
}

/// Turns a failed predicate into a 403 with `message`.
pub fn require(allowed: bool, message: &str) -> AppResult<()> {
    if allowed {
        Ok(())
    } else {
        Err(AppError::forbidden(message))
    }
}

/// Role label of a folder permission.
pub fn folder_role(flags: &FolderFlags) -> &'static str {
    if flags.is_folder_admin {
        "Admin"
    } else if flags.is_metadata_template_admin {
        "Metadata template admin"
    } else if flags.can_edit {
        "Editor"
    } else {
        "Viewer"
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn roles_follow_flag_precedence() {
        let all = FolderFlags { is_folder_admin: true, is_metadata_template_admin: true, can_edit: true };
        assert_eq!(folder_role(&all), "Admin");
        let mt = FolderFlags { is_folder_admin: false, is_metadata_template_admin: true, can_edit: true };
        assert_eq!(folder_role(&mt), "Metadata template admin");
        let editor = FolderFlags { can_edit: true, ..Default::default() };
        assert_eq!(folder_role(&editor), "Editor");
        assert_eq!(folder_role(&FolderFlags::default()), "Viewer");
    }
}
