use axum::{
    extract::{Path, State},
    response::IntoResponse,
    Json,
};
use serde::Deserialize;
use serde_json::Value;

use crate::error::{AppError, AppResult};
use crate::middleware::CurrentUser;
use crate::settings;
use crate::state::AppState;

#[derive(Debug, Deserialize)]
pub struct SettingInput {
    pub value: Value,
    pub description: Option<String>,
    pub public: Option<bool>,
}

pub async fn list_settings(State(state): State<AppState>, current: CurrentUser) -> AppResult<impl IntoResponse> {
    Ok(Json(settings::list(&state.db, current.is_superuser).await?))
}

pub async fn put_setting(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(key): Path<String>,
    Json(input): Json<SettingInput>,
) -> AppResult<impl IntoResponse> {
    if !current.is_superuser {
        return Err(AppError::forbidden("Only superusers can change settings."));
    }
    let key = key.trim().to_ascii_uppercase();
    if key.is_empty() || key.len() > 128 {
        return Err(AppError::validation("key", "Setting keys must have between 1 and 128 characters."));
    }
    let setting = settings::set_value(&state.db, &key, input.value, input.description.as_deref(), input.public).await?;
    tracing::info!(user = %current.id, "Changed setting {}", key);
    Ok(Json(setting))
}
