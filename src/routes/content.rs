use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use serde::Serialize;
use uuid::Uuid;

use crate::content::{self, NewCategory, NewFaq, PageInput};
use crate::error::{AppError, AppResult};
use crate::middleware::CurrentUser;
use crate::state::AppState;

#[derive(Debug, Serialize)]
pub struct SlugList {
    pub slugs: Vec<String>,
}

fn require_superuser(current: &CurrentUser) -> AppResult<()> {
    if current.is_superuser {
        Ok(())
    } else {
        Err(AppError::forbidden("Only superusers can edit content pages and the FAQ."))
    }
}

pub async fn page_slugs(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    Ok(Json(SlugList { slugs: content::published_slugs(&state.db).await? }))
}

pub async fn get_page(State(state): State<AppState>, Path(slug): Path<String>) -> AppResult<impl IntoResponse> {
    Ok(Json(content::published_page(&state.db, &slug).await?))
}

pub async fn put_page(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(slug): Path<String>,
    Json(input): Json<PageInput>,
) -> AppResult<impl IntoResponse> {
    require_superuser(&current)?;
    let page = content::upsert_page(&state.db, &slug, input, &current).await?;
    tracing::info!(user = %current.id, "Saved content page {}", page.slug);
    Ok(Json(page))
}

pub async fn list_categories(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    Ok(Json(content::list_categories(&state.db).await?))
}

pub async fn get_category(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<impl IntoResponse> {
    Ok(Json(content::get_category(&state.db, id).await?))
}

pub async fn create_category(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(input): Json<NewCategory>,
) -> AppResult<impl IntoResponse> {
    require_superuser(&current)?;
    let category = content::create_category(&state.db, input, &current).await?;
    Ok((StatusCode::CREATED, Json(category)))
}

pub async fn list_faqs(State(state): State<AppState>) -> AppResult<impl IntoResponse> {
    Ok(Json(content::list_faqs(&state.db).await?))
}

pub async fn get_faq(State(state): State<AppState>, Path(id): Path<Uuid>) -> AppResult<impl IntoResponse> {
    Ok(Json(content::get_faq(&state.db, id).await?))
}

pub async fn create_faq(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(input): Json<NewFaq>,
) -> AppResult<impl IntoResponse> {
    require_superuser(&current)?;
    let faq = content::create_faq(&state.db, input, &current).await?;
    Ok((StatusCode::CREATED, Json(faq)))
}
