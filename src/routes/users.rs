use axum::{
    extract::{Path, Query, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::AppResult;
use crate::middleware::CurrentUser;
use crate::state::AppState;
use crate::types::PageQuery;
use crate::users;

#[derive(Debug, Default, Deserialize)]
pub struct UserListQuery {
    pub search: Option<String>,
}

pub async fn list_users(
    State(state): State<AppState>,
    _current: CurrentUser,
    Query(query): Query<UserListQuery>,
    Query(page): Query<PageQuery>,
) -> AppResult<impl IntoResponse> {
    let found = users::list(&state.db, query.search.as_deref()).await?;
    let mut views = Vec::with_capacity(found.len());
    for user in found {
        views.push(users::view(&state.db, user).await?);
    }
    Ok(Json(page.apply(views)))
}

pub async fn me(State(state): State<AppState>, current: CurrentUser) -> AppResult<impl IntoResponse> {
    Ok(Json(users::view(&state.db, current.user).await?))
}

pub async fn get_user(
    State(state): State<AppState>,
    _current: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let user = users::get(&state.db, id).await?;
    Ok(Json(users::view(&state.db, user).await?))
}
