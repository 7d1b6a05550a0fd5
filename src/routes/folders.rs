use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{AppError, AppResult, OptionExt};
use crate::folders::{self, FolderPatch, FolderPermission, FolderUserEntry, NewFolder};
use crate::middleware::CurrentUser;
use crate::permissions::{self, FolderFlags};
use crate::state::AppState;
use crate::types::PageQuery;

#[derive(Debug, Default, Deserialize)]
pub struct FolderQuery {
    pub project: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PermissionQuery {
    pub folder: Option<Uuid>,
}

#[derive(Debug, Deserialize)]
pub struct SyncPermissionsRequest {
    pub folder_users: Vec<FolderUserEntry>,
}

pub async fn list_folders(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(query): Query<FolderQuery>,
    Query(page): Query<PageQuery>,
) -> AppResult<impl IntoResponse> {
    let found = folders::list(&state.db, &current, query.project).await?;
    let mut views = Vec::with_capacity(found.len());
    for folder in found {
        views.push(folders::view(&state.db, &current, folder).await?);
    }
    Ok(Json(page.apply(views)))
}

pub async fn create_folder(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(input): Json<NewFolder>,
) -> AppResult<impl IntoResponse> {
    let view = folders::create(&state, &current, input).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn get_folder(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let folder = folders::get_for_viewer(&state.db, &current, id).await?;
    Ok(Json(folders::view(&state.db, &current, folder).await?))
}

pub async fn update_folder(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
    Json(patch): Json<FolderPatch>,
) -> AppResult<impl IntoResponse> {
    Ok(Json(folders::update(&state, &current, id, patch).await?))
}

pub async fn delete_folder(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    folders::delete(&state, &current, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn sync_permissions(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<SyncPermissionsRequest>,
) -> AppResult<impl IntoResponse> {
    Ok(Json(folders::sync_permissions(&state, &current, id, req.folder_users).await?))
}

pub async fn list_permissions(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(query): Query<PermissionQuery>,
    Query(page): Query<PageQuery>,
) -> AppResult<impl IntoResponse> {
    let folder_id = query.folder.ok_or_else(|| AppError::validation("folder", "This query parameter is required."))?;
    folders::get_for_viewer(&state.db, &current, folder_id).await?;
    let mut views = Vec::new();
    for permission in folders::permissions_of(&state.db, folder_id).await? {
        views.push(folders::permission_view(&state.db, permission).await?);
    }
    Ok(Json(page.apply(views)))
}

async fn visible_permission(state: &AppState, current: &CurrentUser, id: Uuid) -> AppResult<FolderPermission> {
    let permission = folders::find_permission(&state.db, id).await?.ok_or_not_found("Folder permission")?;
    if !permissions::can_view_in_folder(&state.db, current, permission.folder_id).await? {
        return Err(AppError::NotFound("Folder permission not found".to_string()));
    }
    Ok(permission)
}

pub async fn get_permission(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let permission = visible_permission(&state, &current, id).await?;
    Ok(Json(folders::permission_view(&state.db, permission).await?))
}

pub async fn update_permission(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
    Json(flags): Json<FolderFlags>,
) -> AppResult<impl IntoResponse> {
    let permission = visible_permission(&state, &current, id).await?;
    permissions::require(
        permissions::is_folder_admin(&state.db, &current, permission.folder_id).await?,
        "Only folder admins can change folder permissions.",
    )?;
    let updated = folders::set_permission_flags(&state.db, &current, &permission, flags).await?;
    Ok(Json(folders::permission_view(&state.db, updated).await?))
}

pub async fn delete_permission(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let permission = visible_permission(&state, &current, id).await?;
    permissions::require(
        permissions::is_folder_admin(&state.db, &current, permission.folder_id).await?,
        "Only folder admins can remove folder permissions.",
    )?;
    folders::remove_permission(&state.db, &permission).await?;
    tracing::info!(folder = %permission.folder_id, member = %permission.member_id, "Removed folder permission");
    Ok(StatusCode::NO_CONTENT)
}
