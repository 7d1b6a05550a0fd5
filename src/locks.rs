//! Advisory edit locks on projects, folders, datasets and metadata templates.
//!
//! A lock belongs to one user and expires after `MAX_LOCK_TIME` minutes. Modifying an entity
//! locked by somebody else is refused; saving releases the caller's own lock.

use chrono::{DateTime, Duration, Utc};
use sqlx::SqlitePool;
use uuid::Uuid;

use crate::error::{AppError, AppResult, OptionExt};
use crate::settings;
use crate::state::AppState;
use crate::types::{ContentType, LockEvent, LockStatus};
use crate::users;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Lockable {
    Project,
    Folder,
    Dataset,
    MetadataTemplate,
}

impl Lockable {
    fn table(&self) -> &'static str {
        match self {
            Lockable::Project => "projects",
            Lockable::Folder => "folders",
            Lockable::Dataset => "uploads_datasets",
            Lockable::MetadataTemplate => "metadata_templates",
        }
    }

    fn label(&self) -> &'static str {
        match self {
            Lockable::Project => "Project",
            Lockable::Folder => "Folder",
            Lockable::Dataset => "Dataset",
            Lockable::MetadataTemplate => "Metadata template",
        }
    }

    pub fn content_type(&self) -> ContentType {
        match self {
            Lockable::Project => ContentType::Project,
            Lockable::Folder => ContentType::Folder,
            Lockable::Dataset => ContentType::UploadsDataset,
            Lockable::MetadataTemplate => ContentType::MetadataTemplate,
        }
    }
}

#[derive(Debug, Clone, Copy, sqlx::FromRow)]
pub struct LockState {
    pub locked: bool,
    pub locked_by: Option<Uuid>,
    pub locked_at: Option<DateTime<Utc>>,
}

impl LockState {
    pub fn is_expired(&self, now: DateTime<Utc>, max_minutes: i64) -> bool {
        match self.locked_at {
            Some(at) => now - at >= Duration::minutes(max_minutes),
            None => true,
        }
    }

    pub fn held_by_other(&self, user_id: Uuid) -> bool {
        self.locked && self.locked_by.is_some_and(|holder| holder != user_id)
    }
}

async fn load(db: &SqlitePool, target: Lockable, id: Uuid) -> AppResult<LockState> {
    let sql = format!("SELECT locked, locked_by, locked_at FROM {} WHERE id = ?", target.table());
    sqlx::query_as::<_, LockState>(&sql).bind(id).fetch_optional(db).await?.ok_or_not_found(target.label())
}

async fn store(db: &SqlitePool, target: Lockable, id: Uuid, user: Option<Uuid>) -> AppResult<()> {
    let sql = format!("UPDATE {} SET locked = ?, locked_by = ?, locked_at = ? WHERE id = ?", target.table());
    sqlx::query(&sql)
        .bind(user.is_some())
        .bind(user)
        .bind(user.map(|_| Utc::now()))
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

fn emit(state: &AppState, target: Lockable, id: Uuid, locked: bool, user: Option<Uuid>) {
    state.emit_lock_event(LockEvent { content_type: target.content_type(), pk: id, status: locked, user });
}

/// Clears the lock when it has expired and returns the current lock state.
pub async fn remove_expired_lock(state: &AppState, target: Lockable, id: Uuid) -> AppResult<LockState> {
    let current = load(&state.db, target, id).await?;
    if !current.locked {
        return Ok(current);
    }
    let max_minutes = settings::max_lock_minutes(&state.db, state.config.locks.max_lock_minutes).await?;
    if current.is_expired(Utc::now(), max_minutes) {
        store(&state.db, target, id, None).await?;
        emit(state, target, id, false, current.locked_by);
        tracing::debug!(%id, "Removed expired lock on {}", target.label());
        return Ok(LockState { locked: false, locked_by: None, locked_at: None });
    }
    Ok(current)
}

pub async fn status(state: &AppState, target: Lockable, id: Uuid) -> AppResult<LockStatus> {
    let current = remove_expired_lock(state, target, id).await?;
    to_status(&state.db, current).await
}

async fn to_status(db: &SqlitePool, current: LockState) -> AppResult<LockStatus> {
    Ok(LockStatus {
        locked: current.locked,
        locked_by: if current.locked { users::minimal(db, current.locked_by).await? } else { None },
        locked_at: if current.locked { current.locked_at } else { None },
    })
}

fn locked_by_other_error(target: Lockable) -> AppError {
    AppError::forbidden(format!("{} is locked by another user.", target.label()))
}

/// Locks (or refreshes the caller's lock on) the entity.
pub async fn lock(state: &AppState, target: Lockable, id: Uuid, user_id: Uuid) -> AppResult<LockStatus> {
    let current = remove_expired_lock(state, target, id).await?;
    if current.held_by_other(user_id) {
        return Err(locked_by_other_error(target));
    }
    store(&state.db, target, id, Some(user_id)).await?;
    emit(state, target, id, true, Some(user_id));
    to_status(&state.db, load(&state.db, target, id).await?).await
}

pub async fn unlock(state: &AppState, target: Lockable, id: Uuid, user_id: Uuid) -> AppResult<LockStatus> {
    let current = remove_expired_lock(state, target, id).await?;
    if current.held_by_other(user_id) {
        return Err(locked_by_other_error(target));
    }
    if current.locked {
        store(&state.db, target, id, None).await?;
        emit(state, target, id, false, Some(user_id));
    }
    to_status(&state.db, load(&state.db, target, id).await?).await
}

/// Fails with 403 when somebody else holds a live lock.
pub async fn ensure_editable(state: &AppState, target: Lockable, id: Uuid, user_id: Uuid) -> AppResult<()> {
    let current = remove_expired_lock(state, target, id).await?;
    if current.held_by_other(user_id) {
        return Err(locked_by_other_error(target));
    }
    Ok(())
}

/// Releases the caller's own lock after a successful save.
pub async fn release(state: &AppState, target: Lockable, id: Uuid, user_id: Uuid) -> AppResult<()> {
    let current = load(&state.db, target, id).await?;
    if current.locked && current.locked_by == Some(user_id) {
        store(&state.db, target, id, None).await?;
        emit(state, target, id, false, Some(user_id));
    }
    Ok(())
}

/// Sweeps expired locks of one entity kind. Returns how many were released.
pub async fn remove_expired_locks(state: &AppState, target: Lockable) -> AppResult<usize> {
    let sql = format!("SELECT id FROM {} WHERE locked = 1", target.table());
    let ids: Vec<Uuid> = sqlx::query_scalar(&sql).fetch_all(&state.db).await?;
    let mut released = 0;
    for id in ids {
        match remove_expired_lock(state, target, id).await {
            Ok(after) if !after.locked => released += 1,
            Ok(_) => {}
            Err(e) => tracing::error!(%id, "Removing expired lock failed: {}", e),
        }
    }
    Ok(released)
}
