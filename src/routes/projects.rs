use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{AppError, AppResult, OptionExt};
use crate::folders;
use crate::metadata::templates;
use crate::middleware::CurrentUser;
use crate::permissions::{self, MembershipFlags};
use crate::projects::{self, MemberEntry, NewProject, ProjectFilter, ProjectPatch};
use crate::state::AppState;
use crate::types::PageQuery;

#[derive(Debug, Deserialize)]
pub struct SyncMembersRequest {
    pub project_users: Vec<MemberEntry>,
}

#[derive(Debug, Default, Deserialize)]
pub struct MembershipQuery {
    pub project: Option<Uuid>,
}

pub async fn list_projects(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(filter): Query<ProjectFilter>,
    Query(page): Query<PageQuery>,
) -> AppResult<impl IntoResponse> {
    let found = projects::list(&state.db, &current, &filter).await?;
    let mut views = Vec::with_capacity(found.len());
    for project in found {
        views.push(projects::view(&state.db, &current, project).await?);
    }
    Ok(Json(page.apply(views)))
}

pub async fn create_project(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(input): Json<NewProject>,
) -> AppResult<impl IntoResponse> {
    let view = projects::create(&state, &current, input).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn get_project(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let project = projects::get_for_member(&state.db, &current, id).await?;
    Ok(Json(projects::view(&state.db, &current, project).await?))
}

pub async fn update_project(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
    Json(patch): Json<ProjectPatch>,
) -> AppResult<impl IntoResponse> {
    Ok(Json(projects::update(&state, &current, id, patch).await?))
}

pub async fn delete_project(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    projects::delete(&state, &current, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn sync_members(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<SyncMembersRequest>,
) -> AppResult<impl IntoResponse> {
    Ok(Json(projects::sync_members(&state, &current, id, req.project_users).await?))
}

pub async fn project_folders(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> AppResult<impl IntoResponse> {
    projects::get_for_member(&state.db, &current, id).await?;
    let found = folders::list(&state.db, &current, Some(id)).await?;
    let mut views = Vec::with_capacity(found.len());
    for folder in found {
        views.push(folders::view(&state.db, &current, folder).await?);
    }
    Ok(Json(page.apply(views)))
}

pub async fn project_templates(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
    Query(page): Query<PageQuery>,
) -> AppResult<impl IntoResponse> {
    projects::get_for_member(&state.db, &current, id).await?;
    let found = templates::available_for_project(&state.db, id).await?;
    let mut views = Vec::with_capacity(found.len());
    for template in found {
        views.push(templates::view(&state.db, template).await?);
    }
    Ok(Json(page.apply(views)))
}

pub async fn list_memberships(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(query): Query<MembershipQuery>,
    Query(page): Query<PageQuery>,
) -> AppResult<impl IntoResponse> {
    let project_id = query.project.ok_or_else(|| AppError::validation("project", "This query parameter is required."))?;
    projects::get_for_member(&state.db, &current, project_id).await?;
    let mut views = Vec::new();
    for membership in projects::memberships(&state.db, project_id).await? {
        views.push(projects::membership_view(&state.db, membership).await?);
    }
    Ok(Json(page.apply(views)))
}

/// Loads a membership of a project the caller belongs to.
async fn visible_membership(state: &AppState, current: &CurrentUser, id: Uuid) -> AppResult<projects::Membership> {
    let membership = projects::find_membership(&state.db, id).await?.ok_or_not_found("Project membership")?;
    if !permissions::is_project_member(&state.db, current, membership.project_id).await? {
        return Err(AppError::NotFound("Project membership not found".to_string()));
    }
    Ok(membership)
}

pub async fn get_membership(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let membership = visible_membership(&state, &current, id).await?;
    Ok(Json(projects::membership_view(&state.db, membership).await?))
}

pub async fn update_membership(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
    Json(flags): Json<MembershipFlags>,
) -> AppResult<impl IntoResponse> {
    let membership = visible_membership(&state, &current, id).await?;
    permissions::require(
        permissions::is_project_admin(&state.db, &current, membership.project_id).await?,
        "Only project admins can change memberships.",
    )?;
    let updated = projects::set_membership_flags(&state, &current, &membership, flags).await?;
    Ok(Json(projects::membership_view(&state.db, updated).await?))
}

pub async fn delete_membership(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let membership = visible_membership(&state, &current, id).await?;
    let allowed = membership.member_id == current.id
        || permissions::is_project_admin(&state.db, &current, membership.project_id).await?;
    permissions::require(allowed, "Only project admins can remove other members.")?;
    projects::remove_membership(&state, &current, &membership).await?;
    Ok(StatusCode::NO_CONTENT)
}
