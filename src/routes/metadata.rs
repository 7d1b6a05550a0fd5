use axum::{
    extract::{Path, Query, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use uuid::Uuid;

use crate::error::{AppError, AppResult, OptionExt};
use crate::metadata::templates::{self, NewTemplate, TemplateFilter, TemplatePatch};
use crate::metadata;
use crate::middleware::CurrentUser;
use crate::state::AppState;
use crate::types::{self, ContentType, PageQuery};
use crate::users::User;
use crate::{folders, projects, uploads};

#[derive(Debug, Default, Deserialize)]
pub struct MetadataQuery {
    pub assigned_to_content_type: Option<String>,
    pub assigned_to_object_id: Option<String>,
}

/// Checks that the object metadata is attached to is visible to `user`.
async fn ensure_target_visible(state: &AppState, user: &User, content_type: ContentType, id: Uuid) -> AppResult<()> {
    match content_type {
        ContentType::Project => projects::get_for_member(&state.db, user, id).await.map(|_| ()),
        ContentType::Folder => folders::get_for_viewer(&state.db, user, id).await.map(|_| ()),
        ContentType::UploadsVersion => uploads::get_version_for_viewer(&state.db, user, id).await.map(|_| ()),
        ContentType::UploadsVersionFile => uploads::get_file_for_viewer(&state.db, user, id).await.map(|_| ()),
        other => Err(AppError::validation(
            "assigned_to_content_type",
            format!("Metadata cannot be assigned to {}.", other),
        )),
    }
}

pub async fn list_metadata(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(query): Query<MetadataQuery>,
    Query(page): Query<PageQuery>,
) -> AppResult<impl IntoResponse> {
    let content_type = query
        .assigned_to_content_type
        .as_deref()
        .ok_or_else(|| AppError::validation("assigned_to_content_type", "This query parameter is required."))?
        .parse::<ContentType>()?;
    let raw_id = query
        .assigned_to_object_id
        .as_deref()
        .ok_or_else(|| AppError::validation("assigned_to_object_id", "This query parameter is required."))?;
    let object_id = types::parse_uuid_param(raw_id, "assigned_to_object_id")?;

    ensure_target_visible(&state, &current, content_type, object_id).await?;
    let entries = metadata::list_for(&state.db, content_type, object_id).await?;
    Ok(Json(page.apply(entries)))
}

pub async fn list_fields(
    State(state): State<AppState>,
    _current: CurrentUser,
    Query(page): Query<PageQuery>,
) -> AppResult<impl IntoResponse> {
    Ok(Json(page.apply(metadata::list_fields(&state.db).await?)))
}

pub async fn get_field(
    State(state): State<AppState>,
    _current: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    Ok(Json(metadata::find_field(&state.db, id).await?.ok_or_not_found("Metadata field")?))
}

pub async fn list_templates(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(filter): Query<TemplateFilter>,
    Query(page): Query<PageQuery>,
) -> AppResult<impl IntoResponse> {
    let found = templates::list(&state.db, &current, filter).await?;
    let mut views = Vec::with_capacity(found.len());
    for template in found {
        views.push(templates::view(&state.db, template).await?);
    }
    Ok(Json(page.apply(views)))
}

pub async fn create_template(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(input): Json<NewTemplate>,
) -> AppResult<impl IntoResponse> {
    let view = templates::create(&state, &current, input).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn get_template(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let template = templates::get(&state.db, id).await?;
    if !templates::can_view(&state.db, &current, &template).await? {
        return Err(AppError::NotFound("Metadata template not found".to_string()));
    }
    Ok(Json(templates::view(&state.db, template).await?))
}

pub async fn update_template(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
    Json(patch): Json<TemplatePatch>,
) -> AppResult<impl IntoResponse> {
    Ok(Json(templates::update(&state, &current, id, patch).await?))
}

pub async fn delete_template(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    templates::delete(&state, &current, id).await?;
    Ok(StatusCode::NO_CONTENT)
}
