use axum::{
    extract::State,
    http::StatusCode,
    response::IntoResponse,
    Json,
};
use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};

use crate::auth::{self, TokenKind};
use crate::error::{validation, AppError, AppResult};
use crate::mail;
use crate::middleware::{ClientIp, CurrentUser, LimitedEndpoint};
use crate::state::AppState;
use crate::users::{self, UserView};

#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    pub email: String,
    pub password: String,
}

#[derive(Debug, Serialize)]
pub struct LoginResponse {
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user: UserView,
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetRequest {
    pub email: String,
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetConfirm {
    pub token: String,
    pub password: String,
}

pub async fn login(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(req): Json<LoginRequest>,
) -> AppResult<impl IntoResponse> {
    state.rate_limiter.check(LimitedEndpoint::Login, ip).await?;

    let invalid = || AppError::Unauthorized("Unable to log in with provided credentials.".into());
    let user = users::find_by_email(&state.db, req.email.trim()).await?.filter(|u| u.is_active).ok_or_else(invalid)?;
    let hash = user.password_hash.as_deref().ok_or_else(invalid)?;
    if !auth::verify_password(&req.password, hash) {
        tracing::warn!(user = %user.id, %ip, "Failed login");
        return Err(invalid());
    }

    let ttl = Duration::days(state.config.auth.token_ttl_days);
    let (token, expires_at) = auth::issue_token(&state.db, user.id, TokenKind::Session, ttl).await?;
    state.metrics.inc_logins();
    tracing::info!(user = %user.id, "Logged in");
    Ok(Json(LoginResponse { token, expires_at, user: users::view(&state.db, user).await? }))
}

pub async fn logout(State(state): State<AppState>, current: CurrentUser) -> AppResult<impl IntoResponse> {
    auth::revoke_token(&state.db, &current.token).await?;
    Ok(StatusCode::NO_CONTENT)
}

/// Always answers 202 so the endpoint does not reveal which addresses exist.
pub async fn password_reset(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(req): Json<PasswordResetRequest>,
) -> AppResult<impl IntoResponse> {
    state.rate_limiter.check(LimitedEndpoint::PasswordReset, ip).await?;

    let Ok(email) = validation::validate_email(&req.email) else {
        return Ok(StatusCode::ACCEPTED);
    };
    if let Some(user) = users::find_by_email(&state.db, &email).await?.filter(|u| u.is_active) {
        if users::is_internal(&state.db, &user.email).await? {
            tracing::info!(user = %user.id, "Password reset requested for internal user; skipped");
        } else {
            auth::revoke_user_tokens(&state.db, user.id, TokenKind::PasswordReset).await?;
            let ttl = Duration::hours(state.config.auth.password_reset_ttl_hours);
            let (token, _) = auth::issue_token(&state.db, user.id, TokenKind::PasswordReset, ttl).await?;
            mail::enqueue(&state, mail::password_reset(&user, &token)).await?;
        }
    }
    Ok(StatusCode::ACCEPTED)
}

#[derive(Debug, Deserialize)]
pub struct PasswordResetValidate {
    pub token: String,
}

#[derive(Debug, Serialize)]
pub struct PasswordResetValidateResponse {
    pub status: &'static str,
    pub username: String,
    pub email: String,
}

/// Checks a reset token without consuming it. Unknown or expired tokens are 404.
pub async fn password_reset_validate(
    State(state): State<AppState>,
    ClientIp(ip): ClientIp,
    Json(req): Json<PasswordResetValidate>,
) -> AppResult<impl IntoResponse> {
    state.rate_limiter.check(LimitedEndpoint::PasswordReset, ip).await?;

    let user = match auth::resolve_token(&state.db, req.token.trim(), TokenKind::PasswordReset).await? {
        Some(user_id) => users::find(&state.db, user_id).await?.filter(|u| u.is_active),
        None => None,
    };
    let user = user.ok_or_else(|| AppError::NotFound("The password reset link is invalid or has expired.".into()))?;
    Ok(Json(PasswordResetValidateResponse { status: "OK", username: user.username, email: user.email }))
}

pub async fn password_reset_confirm(
    State(state): State<AppState>,
    Json(req): Json<PasswordResetConfirm>,
) -> AppResult<impl IntoResponse> {
    auth::validate_password(&req.password)?;
    let user_id = auth::resolve_token(&state.db, req.token.trim(), TokenKind::PasswordReset)
        .await?
        .ok_or_else(|| AppError::validation("token", "The password reset link is invalid or has expired."))?;
    users::set_password(&state.db, user_id, &req.password).await?;
    auth::revoke_user_tokens(&state.db, user_id, TokenKind::PasswordReset).await?;
    auth::revoke_user_tokens(&state.db, user_id, TokenKind::Session).await?;
    tracing::info!(user = %user_id, "Password reset completed");
    Ok(StatusCode::NO_CONTENT)
}
