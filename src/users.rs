//! Users, lookup by e-mail and on-demand account creation.

use chrono::{DateTime, Duration, Utc};
use serde::Serialize;
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::auth::{self, TokenKind};
use crate::error::{AppResult, OptionExt};
use crate::mail;
use crate::settings;
use crate::state::AppState;
use crate::types::MinimalUser;

const USER_COLUMNS: &str = "id, email, username, first_name, last_name, password_hash, is_active, is_superuser, \
     can_create_projects, can_hard_delete_datasets, is_global_metadata_template_admin, date_joined";

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub first_name: String,
    pub last_name: String,
    #[serde(skip)]
    pub password_hash: Option<String>,
    pub is_active: bool,
    pub is_superuser: bool,
    pub can_create_projects: bool,
    pub can_hard_delete_datasets: bool,
    pub is_global_metadata_template_admin: bool,
    pub date_joined: DateTime<Utc>,
}

impl User {
    pub fn display_name(&self) -> String {
        if !self.first_name.trim().is_empty() && !self.last_name.trim().is_empty() {
            format!("{} {}", self.first_name.trim(), self.last_name.trim())
        } else {
            self.email.clone()
        }
    }

    pub fn minimal(&self) -> MinimalUser {
        MinimalUser {
            id: self.id,
            email: self.email.clone(),
            username: self.username.clone(),
            display_name: self.display_name(),
        }
    }
}

/// Full user representation returned by the users endpoints.
#[derive(Debug, Serialize)]
pub struct UserView {
    #[serde(flatten)]
    pub user: User,
    pub display_name: String,
    pub is_internal_user: bool,
}

pub async fn view(db: &SqlitePool, user: User) -> AppResult<UserView> {
    let is_internal_user = is_internal(db, &user.email).await?;
    Ok(UserView { display_name: user.display_name(), user, is_internal_user })
}

/// Whether the address belongs to one of the `INTERNAL_TLDS` domains.
pub async fn is_internal(db: &SqlitePool, email: &str) -> AppResult<bool> {
    let email = email.to_lowercase();
    Ok(settings::internal_tlds(db).await?.iter().any(|tld| email.ends_with(tld.as_str())))
}

pub async fn find(db: &SqlitePool, id: Uuid) -> AppResult<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE id = ?", USER_COLUMNS);
    Ok(sqlx::query_as::<_, User>(&sql).bind(id).fetch_optional(db).await?)
}

pub async fn get(db: &SqlitePool, id: Uuid) -> AppResult<User> {
    find(db, id).await?.ok_or_not_found("User")
}

pub async fn find_by_email(db: &SqlitePool, email: &str) -> AppResult<Option<User>> {
    let sql = format!("SELECT {} FROM users WHERE email = ? COLLATE NOCASE", USER_COLUMNS);
    Ok(sqlx::query_as::<_, User>(&sql).bind(email.trim()).fetch_optional(db).await?)
}

pub async fn minimal(db: &SqlitePool, id: Option<Uuid>) -> AppResult<Option<MinimalUser>> {
    match id {
        Some(id) => Ok(find(db, id).await?.map(|u| u.minimal())),
        None => Ok(None),
    }
}

pub async fn list(db: &SqlitePool, search: Option<&str>) -> AppResult<Vec<User>> {
    let sql = format!(
        "SELECT {} FROM users WHERE is_active = 1 AND (? IS NULL OR email LIKE ? ESCAPE '!' \
         OR first_name LIKE ? ESCAPE '!' OR last_name LIKE ? ESCAPE '!') ORDER BY email",
        USER_COLUMNS
    );
    let pattern = search.map(|s| crate::search::contains_pattern(s.trim()));
    Ok(sqlx::query_as::<_, User>(&sql)
        .bind(search)
        .bind(&pattern)
        .bind(&pattern)
        .bind(&pattern)
        .fetch_all(db)
        .await?)
}

#[derive(Debug, Default, Clone)]
pub struct NewUser {
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub password: Option<String>,
    pub is_superuser: bool,
    pub can_create_projects: bool,
}

pub async fn create(db: &SqlitePool, new: NewUser) -> AppResult<User> {
    let email = crate::error::validation::validate_email(&new.email)?;
    let password_hash = match new.password.as_deref() {
        Some(p) => {
            auth::validate_password(p)?;
            Some(auth::hash_password(p)?)
        }
        None => None,
    };
    let id = Uuid::new_v4();
    sqlx::query(
        "INSERT INTO users (id, email, username, first_name, last_name, password_hash, is_superuser, \
         can_create_projects, can_hard_delete_datasets, is_global_metadata_template_admin, date_joined) \
         VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(&email)
    .bind(username_for(&email))
    .bind(new.first_name.trim())
    .bind(new.last_name.trim())
    .bind(password_hash)
    .bind(new.is_superuser)
    .bind(new.can_create_projects || new.is_superuser)
    .bind(new.is_superuser)
    .bind(new.is_superuser)
    .bind(Utc::now())
    .execute(db)
    .await?;
    get(db, id).await
}

/// Username derived from the local part of the address.
fn username_for(email: &str) -> String {
    let local = email.split('@').next().unwrap_or(email);
    let cleaned: String =
        local.chars().filter(|c| c.is_ascii_alphanumeric() || matches!(c, '.' | '_' | '-' | '+')).collect();
    if cleaned.is_empty() {
        "user".to_string()
    } else {
        cleaned
    }
}

/// Returns the user for `email`, creating a password-less account (and a welcome mail
/// with a password set link) when none exists yet.
pub async fn get_or_create_user(state: &AppState, email: &str) -> AppResult<User> {
    if let Some(user) = find_by_email(&state.db, email).await? {
        return Ok(user);
    }
    let user = create(&state.db, NewUser { email: email.to_string(), ..Default::default() }).await?;
    tracing::info!(user = %user.id, "Created account for {}", user.email);

    let ttl = Duration::hours(state.config.auth.password_reset_ttl_hours);
    let (token, _) = auth::issue_token(&state.db, user.id, TokenKind::PasswordReset, ttl).await?;
    mail::enqueue(state, mail::account_created(&user, &token)).await?;
    Ok(user)
}

pub async fn set_password(db: &SqlitePool, user_id: Uuid, password: &str) -> AppResult<()> {
    auth::validate_password(password)?;
    sqlx::query("UPDATE users SET password_hash = ? WHERE id = ?")
        .bind(auth::hash_password(password)?)
        .bind(user_id)
        .execute(db)
        .await?;
    Ok(())
}

/// Creates or promotes a superuser and sets its password.
pub async fn upsert_superuser(
    db: &SqlitePool,
    email: &str,
    password: &str,
    first_name: &str,
    last_name: &str,
) -> AppResult<User> {
    auth::validate_password(password)?;
    match find_by_email(db, email).await? {
        Some(existing) => {
            sqlx::query(
                "UPDATE users SET is_superuser = 1, is_active = 1, can_create_projects = 1, can_hard_delete_datasets = 1, \
                 is_global_metadata_template_admin = 1 WHERE id = ?",
            )
            .bind(existing.id)
            .execute(db)
            .await?;
            set_password(db, existing.id, password).await?;
            get(db, existing.id).await
        }
        None => {
            create(
                db,
                NewUser {
                    email: email.to_string(),
                    first_name: first_name.to_string(),
                    last_name: last_name.to_string(),
                    password: Some(password.to_string()),
                    is_superuser: true,
                    can_create_projects: true,
                },
            )
            .await
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn username_comes_from_local_part() {
        assert_eq!(username_for("jane.doe@example.org"), "jane.doe");
        assert_eq!(username_for("ä@example.org"), "user");
    }

    #[test]
    fn display_name_prefers_full_name() {
        let mut user = User {
            id: Uuid::new_v4(),
            email: "a@example.org".into(),
            username: "a".into(),
            first_name: "Ada".into(),
            last_name: "".into(),
            password_hash: None,
            is_active: true,
            is_superuser: false,
            can_create_projects: false,
            can_hard_delete_datasets: false,
            is_global_metadata_template_admin: false,
            date_joined: Utc::now(),
        };
        assert_eq!(user.display_name(), "a@example.org");
        user.last_name = "Lovelace".into();
        assert_eq!(user.display_name(), "Ada Lovelace");
    }
}
