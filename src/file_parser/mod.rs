//! Background processing of uploaded files.
//!
//! Each tick walks through a fixed pipeline: schedule parser tasks for new files, run a batch of
//! them, roll task results up into file statuses, move published files out of `temp/`, compute
//! metadata completeness, purge expired drafts, drop expired dataset locks and forget expired auth tokens.

pub mod mime;

use std::time::Duration;

use chrono::Utc;
use serde_json::Value;
use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use uuid::Uuid;

use crate::auth;
use crate::error::AppResult;
use crate::locks::{self, Lockable};
use crate::metadata;
use crate::state::AppState;
use crate::storage::Storage;
use crate::types::ContentType;
use crate::uploads::{self, Dataset, FileStatus, Relocation, VersionStatus};

/// Kind of work done on a version file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ParserType {
    ChecksumSha256,
    FileInformation,
}

impl ParserType {
    pub const ALL: [ParserType; 2] = [ParserType::ChecksumSha256, ParserType::FileInformation];

    pub fn as_str(&self) -> &'static str {
        match self {
            ParserType::ChecksumSha256 => "CHECKSUM_SHA256",
            ParserType::FileInformation => "FILE_INFORMATION",
        }
    }

    fn parse(value: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|t| t.as_str() == value)
    }
}

const TASK_SCHEDULED: &str = "SCHEDULED";
const TASK_IN_PROGRESS: &str = "IN_PROGRESS";
const TASK_ERROR: &str = "ERROR";
const TASK_FINISHED: &str = "FINISHED";

#[derive(Debug, sqlx::FromRow)]
struct ParserTask {
    id: Uuid,
    version_file_id: Uuid,
    #[sqlx(rename = "type")]
    parser_type: String,
}

/// Counts of what one tick did.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct TickSummary {
    pub scheduled_files: usize,
    pub tasks_finished: usize,
    pub tasks_failed: usize,
    pub files_relocated: usize,
    pub versions_checked: usize,
    pub drafts_removed: usize,
    pub locks_removed: usize,
    pub tokens_removed: u64,
}

impl TickSummary {
    fn is_idle(&self) -> bool {
        *self == TickSummary::default()
    }
}

/// Creates the parser tasks for every SCHEDULED file and moves it to IN_PROGRESS.
pub async fn determine_tasks(db: &SqlitePool) -> AppResult<usize> {
    let files: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM uploads_version_files WHERE status = ?")
        .bind(FileStatus::Scheduled.as_str())
        .fetch_all(db)
        .await?;
    for file_id in &files {
        for parser_type in ParserType::ALL {
            sqlx::query(
                "INSERT INTO file_parsers (id, version_file_id, type, status, creation_date) VALUES (?, ?, ?, ?, ?) \
                 ON CONFLICT(version_file_id, type) DO UPDATE SET status = excluded.status, error = NULL",
            )
            .bind(Uuid::new_v4())
            .bind(file_id)
            .bind(parser_type.as_str())
            .bind(TASK_SCHEDULED)
            .bind(Utc::now())
            .execute(db)
            .await?;
        }
        sqlx::query("UPDATE uploads_version_files SET status = ? WHERE id = ?")
            .bind(FileStatus::InProgress.as_str())
            .bind(file_id)
            .execute(db)
            .await?;
    }
    Ok(files.len())
}

async fn run_task(state: &AppState, parser_type: ParserType, file_id: Uuid) -> anyhow::Result<()> {
    let db = &state.db;
    let file = uploads::find_file(db, file_id).await?.ok_or_else(|| anyhow::anyhow!("version file {} is gone", file_id))?;
    let entries = match parser_type {
        ParserType::ChecksumSha256 => {
            let checksum = state.storage.checksum_sha256(&file.stored_path).await?;
            vec![metadata::system_entry(uploads::CHECKSUM_SHA256, Value::String(checksum))]
        }
        ParserType::FileInformation => {
            let size = state.storage.metadata(&file.stored_path).await?.len();
            vec![
                metadata::system_entry(uploads::FILE_NAME, Value::String(file.name.clone())),
                metadata::system_entry(uploads::FILE_SIZE, Value::String(size.to_string())),
                metadata::system_entry(uploads::FILE_RELATIVE_PATH, Value::String(file.stored_path.clone())),
            ]
        }
    };
    metadata::set_system(db, ContentType::UploadsVersionFile, file_id, &entries).await?;
    Ok(())
}

/// Runs up to `batch` scheduled tasks. Returns (finished, failed).
pub async fn run_tasks(state: &AppState, batch: i64) -> AppResult<(usize, usize)> {
    let db = &state.db;
    let tasks = sqlx::query_as::<_, ParserTask>(
        "SELECT id, version_file_id, type FROM file_parsers WHERE status = ? ORDER BY creation_date LIMIT ?",
    )
    .bind(TASK_SCHEDULED)
    .bind(batch)
    .fetch_all(db)
    .await?;

    let (mut finished, mut failed) = (0, 0);
    for task in tasks {
        set_task_status(db, task.id, TASK_IN_PROGRESS, None).await?;
        let outcome = match ParserType::parse(&task.parser_type) {
            Some(parser_type) => run_task(state, parser_type, task.version_file_id).await,
            None => Err(anyhow::anyhow!("unknown parser type {}", task.parser_type)),
        };
        match outcome {
            Ok(()) => {
                set_task_status(db, task.id, TASK_FINISHED, None).await?;
                state.metrics.inc_parser_finished();
                finished += 1;
            }
            Err(e) => {
                tracing::error!(file = %task.version_file_id, parser = %task.parser_type, "Parser task failed: {:#}", e);
                set_task_status(db, task.id, TASK_ERROR, Some(format!("{:#}", e))).await?;
                sqlx::query("UPDATE uploads_version_files SET status = ? WHERE id = ?")
                    .bind(FileStatus::Error.as_str())
                    .bind(task.version_file_id)
                    .execute(db)
                    .await?;
                state.metrics.inc_parser_failed();
                failed += 1;
            }
        }
    }
    Ok((finished, failed))
}

async fn set_task_status(db: &SqlitePool, id: Uuid, status: &str, error: Option<String>) -> AppResult<()> {
    sqlx::query("UPDATE file_parsers SET status = ?, error = ? WHERE id = ?")
        .bind(status)
        .bind(error)
        .bind(id)
        .execute(db)
        .await?;
    Ok(())
}

/// Rolls task results up into IN_PROGRESS files.
pub async fn update_file_statuses(db: &SqlitePool) -> AppResult<()> {
    sqlx::query(
        "UPDATE uploads_version_files SET status = ? WHERE status = ? AND EXISTS \
         (SELECT 1 FROM file_parsers p WHERE p.version_file_id = uploads_version_files.id AND p.status = ?)",
    )
    .bind(FileStatus::Error.as_str())
    .bind(FileStatus::InProgress.as_str())
    .bind(TASK_ERROR)
    .execute(db)
    .await?;
    sqlx::query(
        "UPDATE uploads_version_files SET status = ? WHERE status = ? \
         AND EXISTS (SELECT 1 FROM file_parsers p WHERE p.version_file_id = uploads_version_files.id) \
         AND NOT EXISTS (SELECT 1 FROM file_parsers p WHERE p.version_file_id = uploads_version_files.id AND p.status != ?)",
    )
    .bind(FileStatus::Finished.as_str())
    .bind(FileStatus::InProgress.as_str())
    .bind(TASK_FINISHED)
    .execute(db)
    .await?;
    Ok(())
}

/// Moves published files from `temp/` below their project and folder.
pub async fn move_files(state: &AppState) -> AppResult<usize> {
    let db = &state.db;
    let scheduled: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM uploads_version_files WHERE storage_relocating = ?")
        .bind(Relocation::Scheduled.as_str())
        .fetch_all(db)
        .await?;

    let mut moved = 0;
    for file_id in scheduled {
        let relocation = relocate_file(state, file_id).await;
        let status = match &relocation {
            Ok(_) => Relocation::Finished,
            Err(e) => {
                tracing::error!(file = %file_id, "Relocating file failed: {:#}", e);
                Relocation::Error
            }
        };
        sqlx::query("UPDATE uploads_version_files SET storage_relocating = ?, last_modified_date = ? WHERE id = ?")
            .bind(status.as_str())
            .bind(Utc::now())
            .bind(file_id)
            .execute(db)
            .await?;
        if let Ok(true) = relocation {
            state.metrics.inc_files_relocated();
            moved += 1;
        }
    }
    Ok(moved)
}

/// Returns whether bytes were moved.
async fn relocate_file(state: &AppState, file_id: Uuid) -> anyhow::Result<bool> {
    let db = &state.db;
    sqlx::query("UPDATE uploads_version_files SET storage_relocating = ? WHERE id = ?")
        .bind(Relocation::InProgress.as_str())
        .bind(file_id)
        .execute(db)
        .await?;
    let file = uploads::find_file(db, file_id).await?.ok_or_else(|| anyhow::anyhow!("version file {} is gone", file_id))?;
    if !Storage::is_draft_path(&file.stored_path) {
        return Ok(false);
    }
    let location: Option<(Uuid, Uuid)> = sqlx::query_as(
        "SELECT f.project_id, f.id FROM uploads_versions v JOIN uploads_datasets d ON d.id = v.dataset_id \
         JOIN folders f ON f.id = d.folder_id WHERE v.version_file_id = ? LIMIT 1",
    )
    .bind(file_id)
    .fetch_optional(db)
    .await?;
    let (project_id, folder_id) = location.ok_or_else(|| anyhow::anyhow!("version file {} has no folder", file_id))?;

    let target = Storage::published_path(project_id, folder_id, file_id, &file.name);
    state.storage.relocate(&file.stored_path, &target).await?;
    sqlx::query("UPDATE uploads_version_files SET stored_path = ? WHERE id = ?")
        .bind(&target)
        .bind(file_id)
        .execute(db)
        .await?;
    metadata::set_system(
        db,
        ContentType::UploadsVersionFile,
        file_id,
        &[metadata::system_entry(uploads::FILE_RELATIVE_PATH, Value::String(target.clone()))],
    )
    .await?;
    tracing::info!(file = %file_id, "Moved file to {}", target);
    Ok(true)
}

/// Computes `metadata_is_complete` for SCHEDULED versions.
pub async fn check_versions(db: &SqlitePool) -> AppResult<usize> {
    let ids: Vec<Uuid> = sqlx::query_scalar("SELECT id FROM uploads_versions WHERE status = ?")
        .bind(VersionStatus::Scheduled.as_str())
        .fetch_all(db)
        .await?;
    for id in &ids {
        let Some(version) = uploads::find_version(db, *id).await? else { continue };
        let (complete, status) = match uploads::metadata_is_complete(db, &version).await {
            Ok(complete) => (complete, VersionStatus::Finished),
            Err(e) => {
                tracing::error!(version = %id, "Checking metadata failed: {}", e);
                (false, VersionStatus::Error)
            }
        };
        sqlx::query("UPDATE uploads_versions SET metadata_is_complete = ?, status = ? WHERE id = ?")
            .bind(complete)
            .bind(status.as_str())
            .bind(id)
            .execute(db)
            .await?;
    }
    Ok(ids.len())
}

/// Deletes unpublished datasets past their expiry date.
pub async fn remove_expired_drafts(state: &AppState) -> AppResult<usize> {
    let expired = sqlx::query_as::<_, Dataset>(
        "SELECT id, name, display_name, folder_id, publication_date, expiry_date, locked, locked_by, locked_at, \
         created_by, last_modified_by, creation_date, last_modified_date FROM uploads_datasets \
         WHERE publication_date IS NULL AND expiry_date IS NOT NULL AND expiry_date < ?",
    )
    .bind(Utc::now())
    .fetch_all(&state.db)
    .await?;
    for dataset in &expired {
        uploads::purge_dataset(state, dataset).await?;
        tracing::info!(dataset = %dataset.id, "Removed expired draft");
    }
    match state.storage.prune_empty_temp_dirs().await {
        Ok(pruned) if pruned > 0 => tracing::debug!("Pruned {} empty upload directories", pruned),
        Ok(_) => {}
        Err(e) => tracing::warn!("Pruning upload directories failed: {:#}", e),
    }
    Ok(expired.len())
}

/// One pass over the whole pipeline.
pub async fn tick(state: &AppState) -> AppResult<TickSummary> {
    let db = &state.db;
    let mut summary = TickSummary { scheduled_files: determine_tasks(db).await?, ..Default::default() };
    let (finished, failed) = run_tasks(state, state.config.workers.parser_batch_size).await?;
    summary.tasks_finished = finished;
    summary.tasks_failed = failed;
    update_file_statuses(db).await?;
    summary.files_relocated = move_files(state).await?;
    summary.versions_checked = check_versions(db).await?;
    summary.drafts_removed = remove_expired_drafts(state).await?;
    summary.locks_removed = locks::remove_expired_locks(state, Lockable::Dataset).await?;
    summary.tokens_removed = auth::purge_expired_tokens(db).await?;
    Ok(summary)
}

/// Worker loop; stops when `cancel` fires.
pub async fn run_worker(state: AppState, cancel: CancellationToken) {
    let mut ticker = tokio::time::interval(Duration::from_millis(state.config.workers.interval_ms.max(1)));
    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = ticker.tick() => {},
        }
        match tick(&state).await {
            Ok(summary) if !summary.is_idle() => tracing::info!(?summary, "Worker tick"),
            Ok(_) => {}
            Err(e) => tracing::error!("Worker tick failed: {}", e),
        }
    }
    tracing::info!("File worker stopped");
}
