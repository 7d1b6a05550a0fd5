//! Password hashing and opaque bearer tokens.

use argon2::{
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString},
    Argon2,
};
use base64::{engine::general_purpose::URL_SAFE_NO_PAD, Engine as _};
use chrono::{DateTime, Duration, Utc};
use rand_core::{OsRng, RngCore};
use sha2::{Digest, Sha256};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{AppError, AppResult};

pub const MIN_PASSWORD_LEN: usize = 8;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TokenKind {
    Session,
    PasswordReset,
}

impl TokenKind {
    fn as_str(&self) -> &'static str {
        match self {
            TokenKind::Session => "session",
            TokenKind::PasswordReset => "password_reset",
        }
    }
}

pub fn new_token() -> String {
    let mut buf = [0u8; 32];
    let mut rng = OsRng;
    rng.fill_bytes(&mut buf);
    format!("fdm_{}", URL_SAFE_NO_PAD.encode(buf))
}

/// Tokens are stored as their SHA-256 digest only.
pub fn token_digest(token: &str) -> String {
    hex::encode(Sha256::digest(token.as_bytes()))
}

pub fn hash_password(password: &str) -> anyhow::Result<String> {
    let mut rng = OsRng;
    let salt = SaltString::generate(&mut rng);
    let hash = Argon2::default()
        .hash_password(password.as_bytes(), &salt)
        .map_err(|e| anyhow::anyhow!("hashing password failed: {e}"))?;
    Ok(hash.to_string())
}

pub fn verify_password(password: &str, hash: &str) -> bool {
    match PasswordHash::new(hash) {
        Ok(parsed) => Argon2::default().verify_password(password.as_bytes(), &parsed).is_ok(),
        Err(_) => false,
    }
}

pub fn validate_password(password: &str) -> AppResult<()> {
    if password.chars().count() < MIN_PASSWORD_LEN {
        return Err(AppError::validation(
            "password",
            format!("This password is too short. It must contain at least {} characters.", MIN_PASSWORD_LEN),
        ));
    }
    Ok(())
}

/// Creates a token of `kind` for `user_id` and returns the clear text with its expiry.
pub async fn issue_token(
    db: &SqlitePool,
    user_id: Uuid,
    kind: TokenKind,
    ttl: Duration,
) -> AppResult<(String, DateTime<Utc>)> {
    let token = new_token();
    let now = Utc::now();
    let expires_at = now + ttl;
    sqlx::query(
        "INSERT INTO auth_tokens (token_hash, user_id, kind, created_at, expires_at) VALUES (?, ?, ?, ?, ?)",
    )
    .bind(token_digest(&token))
    .bind(user_id)
    .bind(kind.as_str())
    .bind(now)
    .bind(expires_at)
    .execute(db)
    .await?;
    Ok((token, expires_at))
}

/// Returns the owner of an unexpired token of `kind`.
pub async fn resolve_token(db: &SqlitePool, token: &str, kind: TokenKind) -> AppResult<Option<Uuid>> {
    let user_id: Option<Uuid> = sqlx::query_scalar(
        "SELECT user_id FROM auth_tokens WHERE token_hash = ? AND kind = ? AND expires_at > ?",
    )
    .bind(token_digest(token))
    .bind(kind.as_str())
    .bind(Utc::now())
    .fetch_optional(db)
    .await?;
    Ok(user_id)
}

pub async fn revoke_token(db: &SqlitePool, token: &str) -> AppResult<()> {
    sqlx::query("DELETE FROM auth_tokens WHERE token_hash = ?")
        .bind(token_digest(token))
        .execute(db)
        .await?;
    Ok(())
}

/// Drops every token of `kind` held by `user_id`.
pub async fn revoke_user_tokens(db: &SqlitePool, user_id: Uuid, kind: TokenKind) -> AppResult<()> {
    sqlx::query("DELETE FROM auth_tokens WHERE user_id = ? AND kind = ?")
        .bind(user_id)
        .bind(kind.as_str())
        .execute(db)
        .await?;
    Ok(())
}

pub async fn purge_expired_tokens(db: &SqlitePool) -> AppResult<u64> {
    let res = sqlx::query("DELETE FROM auth_tokens WHERE expires_at <= ?").bind(Utc::now()).execute(db).await?;
    Ok(res.rows_affected())
}
