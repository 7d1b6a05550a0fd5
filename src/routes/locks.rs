//! `lock`, `unlock` and `status` sub-routes shared by every lockable resource.

use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    routing::{get, post},
    Json, Router,
};
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::locks::{self, Lockable};
use crate::metadata::templates;
use crate::middleware::CurrentUser;
use crate::state::AppState;
use crate::users::User;
use crate::{folders, projects, uploads};

/// Only users who can see an entity may inspect or take its lock.
async fn ensure_visible(state: &AppState, user: &User, target: Lockable, id: Uuid) -> AppResult<()> {
    match target {
        Lockable::Project => projects::get_for_member(&state.db, user, id).await.map(|_| ()),
        Lockable::Folder => folders::get_for_viewer(&state.db, user, id).await.map(|_| ()),
        Lockable::Dataset => uploads::get_dataset_for_viewer(&state.db, user, id).await.map(|_| ()),
        Lockable::MetadataTemplate => {
            let template = templates::get(&state.db, id).await?;
            if templates::can_view(&state.db, user, &template).await? {
                Ok(())
            } else {
                Err(AppError::NotFound("Metadata template not found".to_string()))
            }
        }
    }
}

async fn lock_status(state: AppState, current: CurrentUser, target: Lockable, id: Uuid) -> AppResult<impl IntoResponse> {
    ensure_visible(&state, &current, target, id).await?;
    Ok(Json(locks::status(&state, target, id).await?))
}

async fn lock(state: AppState, current: CurrentUser, target: Lockable, id: Uuid) -> AppResult<impl IntoResponse> {
    ensure_visible(&state, &current, target, id).await?;
    let status = locks::lock(&state, target, id, current.id).await?;
    Ok((StatusCode::CREATED, Json(status)))
}

async fn unlock(state: AppState, current: CurrentUser, target: Lockable, id: Uuid) -> AppResult<impl IntoResponse> {
    ensure_visible(&state, &current, target, id).await?;
    let status = locks::unlock(&state, target, id, current.id).await?;
    Ok((StatusCode::CREATED, Json(status)))
}

/// Routes `{prefix}/{id}/status`, `{prefix}/{id}/lock` and `{prefix}/{id}/unlock`.
pub fn lock_routes(prefix: &str, target: Lockable) -> Router<AppState> {
    Router::new()
        .route(
            &format!("{}/{{id}}/status", prefix),
            get(move |State(state): State<AppState>, current: CurrentUser, Path(id): Path<Uuid>| {
                lock_status(state, current, target, id)
            }),
        )
        .route(
            &format!("{}/{{id}}/lock", prefix),
            post(move |State(state): State<AppState>, current: CurrentUser, Path(id): Path<Uuid>| {
                lock(state, current, target, id)
            }),
        )
        .route(
            &format!("{}/{{id}}/unlock", prefix),
            post(move |State(state): State<AppState>, current: CurrentUser, Path(id): Path<Uuid>| {
                unlock(state, current, target, id)
            }),
        )
}
