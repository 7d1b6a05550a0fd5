use axum::{
    extract::FromRequestParts,
    http::{header, request::Parts},
};

use crate::auth::{self, TokenKind};
use crate::error::AppError;
use crate::state::AppState;
use crate::users::{self, User};

/// The authenticated user behind `Authorization: Bearer <token>`.
///
/// Rejects with 401 when the header is missing, the token is unknown or expired, or the
/// account has been deactivated.
#[derive(Debug, Clone)]
pub struct CurrentUser {
    pub user: User,
    pub token: String,
}

impl std::ops::Deref for CurrentUser {
    type Target = User;

    fn deref(&self) -> &User {
        &self.user
    }
}

pub fn bearer_token(parts: &Parts) -> Option<&str> {
    let value = parts.headers.get(header::AUTHORIZATION)?.to_str().ok()?;
    let token = value.strip_prefix("Bearer ").or_else(|| value.strip_prefix("bearer "))?.trim();
    if token.is_empty() {
        None
    } else {
        Some(token)
    }
}

impl FromRequestParts<AppState> for CurrentUser {
    type Rejection = AppError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, Self::Rejection> {
        let token = bearer_token(parts)
            .ok_or_else(|| AppError::Unauthorized("Authentication credentials were not provided.".into()))?
            .to_string();
        let user_id = auth::resolve_token(&state.db, &token, TokenKind::Session)
            .await?
            .ok_or_else(|| AppError::Unauthorized("Invalid or expired token.".into()))?;
        let user = users::find(&state.db, user_id)
            .await?
            .filter(|u| u.is_active)
            .ok_or_else(|| AppError::Unauthorized("User inactive or deleted.".into()))?;
        Ok(CurrentUser { user, token })
    }
}
