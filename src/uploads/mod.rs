//! Datasets, their versions and the uploaded files behind them.
//!
//! A dataset starts as a draft owned by its creator and becomes visible to a folder once it is
//! published. Every upload or metadata change creates a new version; versions share files.

pub mod diff;

use std::collections::HashSet;
use std::fmt;

use axum::body::Bytes;
use chrono::{DateTime, Duration, Utc};
use futures::{Stream, StreamExt};
use serde::{Deserialize, Serialize};
use sqlx::SqlitePool;
use tokio::io::AsyncWriteExt;
use uuid::Uuid;

use crate::error::{validation, AppError, AppResult, OptionExt};
use crate::file_parser::mime;
use crate::folders;
use crate::locks::{self, Lockable};
use crate::metadata::{self, templates, Metadata, MetadataInput, ValidatedMetadata};
use crate::permissions;
use crate::state::AppState;
use crate::storage::{self, Storage};
use crate::types::{BulkResult, ContentType};
use crate::users::User;

pub const MAX_NAME_LEN: usize = 255;

pub const ORIGINAL_FILE_NAME: &str = "ORIGINAL_FILE_NAME";
pub const ORIGINAL_FILE_PATH: &str = "ORIGINAL_FILE_PATH";
pub const MIME_TYPE: &str = "MIME_TYPE";
pub const CHECKSUM_SHA256: &str = "CHECKSUM_SHA256";
pub const FILE_NAME: &str = "FILE_NAME";
pub const FILE_SIZE: &str = "FILE_SIZE";
pub const FILE_RELATIVE_PATH: &str = "FILE_RELATIVE_PATH";

/// Processing status of a version.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum VersionStatus {
    Scheduled,
    InProgress,
    Error,
    Finished,
}

impl VersionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            VersionStatus::Scheduled => "SCHEDULED",
            VersionStatus::InProgress => "IN_PROGRESS",
            VersionStatus::Error => "ERROR",
            VersionStatus::Finished => "FINISHED",
        }
    }
}

/// Parser status of a version file.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FileStatus {
    Scheduled,
    Processed,
    InProgress,
    Error,
    Finished,
}

impl FileStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            FileStatus::Scheduled => "SCHEDULED",
            FileStatus::Processed => "PROCESSED",
            FileStatus::InProgress => "IN_PROGRESS",
            FileStatus::Error => "ERROR",
            FileStatus::Finished => "FINISHED",
        }
    }
}

/// State of moving a published file out of `temp/`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Relocation {
    None,
    Scheduled,
    InProgress,
    Error,
    Finished,
}

impl Relocation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Relocation::None => "NONE",
            Relocation::Scheduled => "SCHEDULED",
            Relocation::InProgress => "IN_PROGRESS",
            Relocation::Error => "ERROR",
            Relocation::Finished => "FINISHED",
        }
    }
}

impl fmt::Display for Relocation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Dataset {
    pub id: Uuid,
    pub name: Option<String>,
    pub display_name: String,
    pub folder_id: Option<Uuid>,
    pub publication_date: Option<DateTime<Utc>>,
    pub expiry_date: Option<DateTime<Utc>>,
    pub locked: bool,
    pub locked_by: Option<Uuid>,
    pub locked_at: Option<DateTime<Utc>>,
    pub created_by: Option<Uuid>,
    pub last_modified_by: Option<Uuid>,
    pub creation_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
}

impl Dataset {
    pub fn is_published(&self) -> bool {
        self.publication_date.is_some()
    }

    pub fn is_expired(&self, now: DateTime<Utc>) -> bool {
        self.expiry_date.is_some_and(|expiry| expiry < now)
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct Version {
    pub id: Uuid,
    pub name: Option<String>,
    pub dataset_id: Uuid,
    pub version_file_id: Option<Uuid>,
    pub publication_date: Option<DateTime<Utc>>,
    pub metadata_is_complete: bool,
    pub status: String,
    pub created_by: Option<Uuid>,
    pub last_modified_by: Option<Uuid>,
    pub creation_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
}

impl Version {
    pub fn is_published(&self) -> bool {
        self.publication_date.is_some()
    }
}

#[derive(Debug, Clone, Serialize, sqlx::FromRow)]
pub struct VersionFile {
    pub id: Uuid,
    pub name: String,
    pub stored_path: String,
    pub size: i64,
    pub status: String,
    pub uploaded_using_tus: bool,
    pub publication_date: Option<DateTime<Utc>>,
    pub storage_relocating: String,
    pub created_by: Option<Uuid>,
    pub creation_date: DateTime<Utc>,
    pub last_modified_date: DateTime<Utc>,
}

#[derive(Debug, Serialize)]
pub struct VersionFileView {
    #[serde(flatten)]
    pub file: VersionFile,
    pub metadata: Vec<Metadata>,
}

#[derive(Debug, Serialize)]
pub struct VersionView {
    #[serde(flatten)]
    pub version: Version,
    pub is_latest_version: bool,
    pub version_file: Option<VersionFileView>,
    pub metadata: Vec<Metadata>,
}

#[derive(Debug, Serialize)]
pub struct DatasetView {
    #[serde(flatten)]
    pub dataset: Dataset,
    pub is_published: bool,
    pub is_expired: bool,
    pub versions_count: i64,
    pub latest_version: Option<VersionView>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct DatasetInput {
    pub name: Option<String>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct NewVersionInput {
    pub name: Option<String>,
    pub metadata: Option<Vec<MetadataInput>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionPatch {
    pub name: Option<String>,
    pub metadata: Option<Vec<MetadataInput>>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct VersionFilter {
    pub dataset: Option<Uuid>,
    pub folder: Option<Uuid>,
}

/// Everything a download response needs.
#[derive(Debug, Clone)]
pub struct DownloadInfo {
    pub stored_path: String,
    pub size: u64,
    pub modified: Option<DateTime<Utc>>,
    pub mime_type: String,
    pub checksum_sha256: Option<String>,
    pub filename: String,
}

pub(crate) const SELECT_DATASET: &str = "SELECT id, name, display_name, folder_id, publication_date, expiry_date, locked, \
     locked_by, locked_at, created_by, last_modified_by, creation_date, last_modified_date FROM uploads_datasets";

pub(crate) const SELECT_VERSION: &str = "SELECT id, name, dataset_id, version_file_id, publication_date, metadata_is_complete, \
     status, created_by, last_modified_by, creation_date, last_modified_date FROM uploads_versions";

const SELECT_FILE: &str = "SELECT id, name, stored_path, size, status, uploaded_using_tus, publication_date, \
     storage_relocating, created_by, creation_date, last_modified_date FROM uploads_version_files";

fn validate_optional_name(name: Option<&str>) -> AppResult<Option<String>> {
    match name.map(str::trim).filter(|n| !n.is_empty()) {
        Some(name) => Ok(Some(validation::validate_name(name, "name", MAX_NAME_LEN)?)),
        None => Ok(None),
    }
}

// Lookups

pub async fn find_dataset(db: &SqlitePool, id: Uuid) -> AppResult<Option<Dataset>> {
    Ok(sqlx::query_as::<_, Dataset>(&format!("{} WHERE id = ?", SELECT_DATASET)).bind(id).fetch_optional(db).await?)
}

pub async fn get_dataset(db: &SqlitePool, id: Uuid) -> AppResult<Dataset> {
    find_dataset(db, id).await?.ok_or_not_found("Dataset")
}

pub async fn find_version(db: &SqlitePool, id: Uuid) -> AppResult<Option<Version>> {
    Ok(sqlx::query_as::<_, Version>(&format!("{} WHERE id = ?", SELECT_VERSION)).bind(id).fetch_optional(db).await?)
}

pub async fn find_file(db: &SqlitePool, id: Uuid) -> AppResult<Option<VersionFile>> {
    Ok(sqlx::query_as::<_, VersionFile>(&format!("{} WHERE id = ?", SELECT_FILE)).bind(id).fetch_optional(db).await?)
}

/// Versions of a dataset, newest first.
pub async fn versions_of(db: &SqlitePool, dataset_id: Uuid) -> AppResult<Vec<Version>> {
    Ok(sqlx::query_as::<_, Version>(&format!(
        "{} WHERE dataset_id = ? ORDER BY creation_date DESC, rowid DESC",
        SELECT_VERSION
    ))
    .bind(dataset_id)
    .fetch_all(db)
    .await?)
}

pub async fn latest_version(db: &SqlitePool, dataset_id: Uuid) -> AppResult<Option<Version>> {
    Ok(sqlx::query_as::<_, Version>(&format!(
        "{} WHERE dataset_id = ? ORDER BY creation_date DESC, rowid DESC LIMIT 1",
        SELECT_VERSION
    ))
    .bind(dataset_id)
    .fetch_optional(db)
    .await?)
}

// Permissions

pub async fn can_view_dataset(db: &SqlitePool, user: &User, dataset: &Dataset) -> AppResult<bool> {
    if user.is_superuser {
        return Ok(true);
    }
    match dataset.folder_id {
        Some(folder_id) if dataset.is_published() => permissions::can_view_in_folder(db, user, folder_id).await,
        _ => Ok(dataset.created_by == Some(user.id)),
    }
}

pub async fn can_edit_dataset(db: &SqlitePool, user: &User, dataset: &Dataset) -> AppResult<bool> {
    if user.is_superuser {
        return Ok(true);
    }
    match dataset.folder_id {
        Some(folder_id) if dataset.is_published() => permissions::can_edit_in_folder(db, user, folder_id).await,
        _ => Ok(dataset.created_by == Some(user.id)),
    }
}

/// Loads a dataset the user may see; anything else is a 404.
pub async fn get_dataset_for_viewer(db: &SqlitePool, user: &User, id: Uuid) -> AppResult<Dataset> {
    let dataset = get_dataset(db, id).await?;
    if !can_view_dataset(db, user, &dataset).await? {
        return Err(AppError::NotFound("Dataset not found".to_string()));
    }
    Ok(dataset)
}

async fn get_dataset_for_editor(state: &AppState, user: &User, id: Uuid) -> AppResult<Dataset> {
    let dataset = get_dataset_for_viewer(&state.db, user, id).await?;
    permissions::require(can_edit_dataset(&state.db, user, &dataset).await?, "You are not allowed to edit this dataset.")?;
    locks::ensure_editable(state, Lockable::Dataset, id, user.id).await?;
    Ok(dataset)
}

pub async fn get_version_for_viewer(db: &SqlitePool, user: &User, id: Uuid) -> AppResult<(Version, Dataset)> {
    let version = find_version(db, id).await?.ok_or_not_found("Version")?;
    let dataset = get_dataset(db, version.dataset_id).await?;
    if !can_view_dataset(db, user, &dataset).await? {
        return Err(AppError::NotFound("Version not found".to_string()));
    }
    Ok((version, dataset))
}

/// A version file is visible when any version using it is.
pub async fn get_file_for_viewer(db: &SqlitePool, user: &User, id: Uuid) -> AppResult<VersionFile> {
    let file = find_file(db, id).await?.ok_or_not_found("Version file")?;
    let dataset_ids: Vec<Uuid> =
        sqlx::query_scalar("SELECT DISTINCT dataset_id FROM uploads_versions WHERE version_file_id = ?")
            .bind(id)
            .fetch_all(db)
            .await?;
    for dataset_id in dataset_ids {
        if let Some(dataset) = find_dataset(db, dataset_id).await? {
            if can_view_dataset(db, user, &dataset).await? {
                return Ok(file);
            }
        }
    }
    Err(AppError::NotFound("Version file not found".to_string()))
}

// Views

pub async fn file_view(db: &SqlitePool, file: VersionFile) -> AppResult<VersionFileView> {
    Ok(VersionFileView { metadata: metadata::list_for(db, ContentType::UploadsVersionFile, file.id).await?, file })
}

pub async fn version_view(db: &SqlitePool, version: Version) -> AppResult<VersionView> {
    let latest = latest_version(db, version.dataset_id).await?;
    let version_file = match version.version_file_id {
        Some(file_id) => match find_file(db, file_id).await? {
            Some(file) => Some(file_view(db, file).await?),
            None => None,
        },
        None => None,
    };
    Ok(VersionView {
        is_latest_version: latest.is_some_and(|l| l.id == version.id),
        metadata: metadata::list_for(db, ContentType::UploadsVersion, version.id).await?,
        version_file,
        version,
    })
}

pub async fn dataset_view(db: &SqlitePool, dataset: Dataset) -> AppResult<DatasetView> {
    let versions_count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM uploads_versions WHERE dataset_id = ?")
        .bind(dataset.id)
        .fetch_one(db)
        .await?;
    let latest_version = match latest_version(db, dataset.id).await? {
        Some(version) => Some(version_view(db, version).await?),
        None => None,
    };
    Ok(DatasetView {
        is_published: dataset.is_published(),
        is_expired: dataset.is_expired(Utc::now()),
        versions_count,
        latest_version,
        dataset,
    })
}

/// Name shown for a dataset: its name, the original name of the latest file, or its id.
pub async fn display_name_for(db: &SqlitePool, dataset: &Dataset) -> AppResult<String> {
    if let Some(name) = dataset.name.as_deref().filter(|n| !n.trim().is_empty()) {
        return Ok(name.to_string());
    }
    if let Some(file_id) = latest_version(db, dataset.id).await?.and_then(|v| v.version_file_id) {
        if let Some(original) = metadata::text_value(db, ContentType::UploadsVersionFile, file_id, ORIGINAL_FILE_NAME).await? {
            return Ok(original);
        }
        if let Some(file) = find_file(db, file_id).await? {
            return Ok(file.name);
        }
    }
    Ok(dataset.id.to_string())
}

pub async fn refresh_display_name(db: &SqlitePool, dataset_id: Uuid) -> AppResult<()> {
    let dataset = get_dataset(db, dataset_id).await?;
    let display_name = display_name_for(db, &dataset).await?;
    sqlx::query("UPDATE uploads_datasets SET display_name = ? WHERE id = ?")
        .bind(display_name)
        .bind(dataset_id)
        .execute(db)
        .await?;
    Ok(())
}

async fn touch_dataset(db: &SqlitePool, dataset_id: Uuid, user_id: Uuid) -> AppResult<()> {
    sqlx::query("UPDATE uploads_datasets SET last_modified_by = ?, last_modified_date = ? WHERE id = ?")
        .bind(user_id)
        .bind(Utc::now())
        .bind(dataset_id)
        .execute(db)
        .await?;
    Ok(())
}

// Datasets

pub async fn create_dataset(state: &AppState, user: &User, input: DatasetInput) -> AppResult<DatasetView> {
    let db = &state.db;
    let name = validate_optional_name(input.name.as_deref())?;
    let id = Uuid::new_v4();
    let now = Utc::now();
    let expiry = now + Duration::days(state.config.uploads.draft_lifetime_days);
    sqlx::query(
        "INSERT INTO uploads_datasets (id, name, display_name, expiry_date, created_by, last_modified_by, \
         creation_date, last_modified_date) VALUES (?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(&name)
    .bind(name.clone().unwrap_or_else(|| id.to_string()))
    .bind(expiry)
    .bind(user.id)
    .bind(user.id)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;
    tracing::info!(dataset = %id, user = %user.id, "Created dataset");
    dataset_view(db, get_dataset(db, id).await?).await
}

/// Without a folder: the user's drafts. With a folder: its published datasets.
pub async fn list_datasets(db: &SqlitePool, user: &User, folder: Option<Uuid>) -> AppResult<Vec<Dataset>> {
    let order = " ORDER BY COALESCE(name, display_name) COLLATE NOCASE, creation_date DESC";
    match folder {
        Some(folder_id) => {
            folders::get_for_viewer(db, user, folder_id).await?;
            Ok(sqlx::query_as::<_, Dataset>(&format!(
                "{} WHERE folder_id = ? AND publication_date IS NOT NULL{}",
                SELECT_DATASET, order
            ))
            .bind(folder_id)
            .fetch_all(db)
            .await?)
        }
        None => Ok(sqlx::query_as::<_, Dataset>(&format!(
            "{} WHERE created_by = ? AND publication_date IS NULL{}",
            SELECT_DATASET, order
        ))
        .bind(user.id)
        .fetch_all(db)
        .await?),
    }
}

pub async fn update_dataset(state: &AppState, user: &User, id: Uuid, input: DatasetInput) -> AppResult<DatasetView> {
    let db = &state.db;
    get_dataset_for_editor(state, user, id).await?;
    let name = validate_optional_name(input.name.as_deref())?;
    sqlx::query("UPDATE uploads_datasets SET name = ? WHERE id = ?").bind(name).bind(id).execute(db).await?;
    touch_dataset(db, id, user.id).await?;
    refresh_display_name(db, id).await?;
    locks::release(state, Lockable::Dataset, id, user.id).await?;
    dataset_view(db, get_dataset(db, id).await?).await
}

/// Removes a dataset with its versions, files, metadata and stored bytes. No permission checks.
pub async fn purge_dataset(state: &AppState, dataset: &Dataset) -> AppResult<()> {
    let db = &state.db;
    let versions = versions_of(db, dataset.id).await?;
    let file_ids: HashSet<Uuid> = versions.iter().filter_map(|v| v.version_file_id).collect();
    for version in &versions {
        metadata::delete_for(db, ContentType::UploadsVersion, version.id).await?;
    }
    sqlx::query("DELETE FROM uploads_versions WHERE dataset_id = ?").bind(dataset.id).execute(db).await?;
    for file_id in file_ids {
        if let Some(file) = find_file(db, file_id).await? {
            delete_version_file(state, &file).await?;
        }
    }
    sqlx::query("DELETE FROM uploads_datasets WHERE id = ?").bind(dataset.id).execute(db).await?;
    if let Some(folder_id) = dataset.folder_id {
        folders::refresh_datasets_count(db, folder_id).await?;
    }
    Ok(())
}

/// Deletes the file record, its metadata and its bytes.
pub async fn delete_version_file(state: &AppState, file: &VersionFile) -> AppResult<()> {
    metadata::delete_for(&state.db, ContentType::UploadsVersionFile, file.id).await?;
    sqlx::query("DELETE FROM uploads_version_files WHERE id = ?").bind(file.id).execute(&state.db).await?;
    if let Err(e) = state.storage.remove(&file.stored_path).await {
        tracing::error!(file = %file.id, "Removing stored file failed: {:#}", e);
    }
    Ok(())
}

pub async fn delete_dataset(state: &AppState, user: &User, id: Uuid) -> AppResult<()> {
    let dataset = get_dataset_for_viewer(&state.db, user, id).await?;
    permissions::require(
        permissions::can_delete_dataset(user, dataset.created_by, dataset.is_published()),
        "You are not allowed to delete this dataset.",
    )?;
    locks::ensure_editable(state, Lockable::Dataset, id, user.id).await?;
    purge_dataset(state, &dataset).await?;
    tracing::info!(dataset = %id, user = %user.id, "Deleted dataset");
    Ok(())
}

pub async fn bulk_delete(state: &AppState, user: &User, ids: &[Uuid]) -> AppResult<BulkResult> {
    let db = &state.db;
    if ids.is_empty() {
        return Err(AppError::validation("uploads_datasets", "You must provide at least one uploads dataset."));
    }
    let mut datasets = Vec::with_capacity(ids.len());
    for id in ids {
        datasets.push(
            find_dataset(db, *id)
                .await?
                .ok_or_else(|| AppError::NotFound("At least one uploads dataset provided does not exist.".to_string()))?,
        );
    }
    for dataset in &datasets {
        permissions::require(
            permissions::can_delete_dataset(user, dataset.created_by, dataset.is_published()),
            "You must not delete datasets that are published or were created by somebody else.",
        )?;
    }

    let mut result = BulkResult::default();
    for dataset in datasets {
        let outcome = match locks::ensure_editable(state, Lockable::Dataset, dataset.id, user.id).await {
            Ok(()) => purge_dataset(state, &dataset).await,
            Err(e) => Err(e),
        };
        match outcome {
            Ok(()) => result.success.push(dataset.id),
            Err(e) => {
                tracing::error!(dataset = %dataset.id, "Could not delete dataset: {}", e);
                result.error.push(dataset.id);
            }
        }
    }
    Ok(result)
}

/// Metadata of the project and folder templates that apply to datasets in `folder_id`.
async fn template_metadata_for_folder(db: &SqlitePool, folder_id: Uuid) -> AppResult<Vec<ValidatedMetadata>> {
    let folder = folders::get(db, folder_id).await?;
    let project_template: Option<Uuid> =
        sqlx::query_scalar("SELECT metadata_template_id FROM projects WHERE id = ?")
            .bind(folder.project_id)
            .fetch_optional(db)
            .await?
            .flatten();
    let mut entries: Vec<ValidatedMetadata> = Vec::new();
    for template_id in [project_template, folder.metadata_template_id].into_iter().flatten() {
        for entry in templates::as_metadata(db, template_id).await? {
            entries.retain(|existing| existing.key != entry.key);
            entries.push(entry);
        }
    }
    Ok(entries)
}

async fn publish_file(db: &SqlitePool, file_id: Uuid) -> AppResult<()> {
    sqlx::query(
        "UPDATE uploads_version_files SET publication_date = ?, storage_relocating = ?, last_modified_date = ? \
         WHERE id = ? AND publication_date IS NULL",
    )
    .bind(Utc::now())
    .bind(Relocation::Scheduled.as_str())
    .bind(Utc::now())
    .bind(file_id)
    .execute(db)
    .await?;
    Ok(())
}

/// Publishes a version and schedules relocation of its file.
pub async fn publish_version(db: &SqlitePool, version: &Version) -> AppResult<()> {
    if version.is_published() {
        return Err(AppError::forbidden("This version has already been published."));
    }
    sqlx::query("UPDATE uploads_versions SET publication_date = ?, last_modified_date = ? WHERE id = ?")
        .bind(Utc::now())
        .bind(Utc::now())
        .bind(version.id)
        .execute(db)
        .await?;
    if let Some(file_id) = version.version_file_id {
        publish_file(db, file_id).await?;
    }
    Ok(())
}

/// Publishes a draft dataset into a folder.
pub async fn publish(state: &AppState, user: &User, id: Uuid, folder: Option<Uuid>) -> AppResult<DatasetView> {
    let db = &state.db;
    let dataset = get_dataset_for_viewer(db, user, id).await?;
    let folder_id = folder
        .or(dataset.folder_id)
        .ok_or_else(|| AppError::validation("folder", "You can't publish a dataset without a folder."))?;
    if folders::find(db, folder_id).await?.is_none() {
        return Err(AppError::validation("folder", "A folder with this primary key does not exist."));
    }
    permissions::require(
        permissions::can_edit_in_folder(db, user, folder_id).await?,
        "You are not allowed to publish into this folder.",
    )?;
    locks::ensure_editable(state, Lockable::Dataset, id, user.id).await?;
    if dataset.is_published() {
        return Err(AppError::forbidden("This dataset has already been published."));
    }

    let now = Utc::now();
    sqlx::query(
        "UPDATE uploads_datasets SET folder_id = ?, publication_date = ?, expiry_date = NULL, last_modified_by = ?, \
         last_modified_date = ? WHERE id = ?",
    )
    .bind(folder_id)
    .bind(now)
    .bind(user.id)
    .bind(now)
    .bind(id)
    .execute(db)
    .await?;

    let template_entries = template_metadata_for_folder(db, folder_id).await?;
    if !template_entries.is_empty() {
        if let Some(latest) = latest_version(db, id).await?.filter(|v| v.version_file_id.is_some()) {
            let existing: HashSet<String> =
                metadata::list_for(db, ContentType::UploadsVersion, latest.id).await?.into_iter().map(|m| m.key).collect();
            // Values already on the latest version win over template defaults
            let missing: Vec<ValidatedMetadata> =
                template_entries.into_iter().filter(|entry| !existing.contains(&entry.key)).collect();
            if let Err(e) = derive_version(db, user, &latest, latest.name.clone(), &missing).await {
                tracing::error!(dataset = %id, "Applying template metadata failed: {}", e);
            }
        }
    }

    let mut versions = versions_of(db, id).await?;
    versions.reverse();
    for version in versions.iter().filter(|v| !v.is_published()) {
        publish_version(db, version).await?;
    }

    folders::refresh_datasets_count(db, folder_id).await?;
    locks::release(state, Lockable::Dataset, id, user.id).await?;
    state.metrics.inc_datasets_published();
    tracing::info!(dataset = %id, folder = %folder_id, user = %user.id, "Published dataset");
    dataset_view(db, get_dataset(db, id).await?).await
}

pub async fn bulk_publish(state: &AppState, user: &User, ids: &[Uuid], folder: Uuid) -> AppResult<BulkResult> {
    let db = &state.db;
    if ids.is_empty() {
        return Err(AppError::validation("uploads_datasets", "You must provide at least one uploads dataset."));
    }
    for id in ids {
        if find_dataset(db, *id).await?.is_none() {
            return Err(AppError::NotFound("At least one uploads dataset provided does not exist.".to_string()));
        }
    }
    folders::find(db, folder).await?.ok_or_not_found("Folder")?;

    let mut result = BulkResult::default();
    for id in ids {
        match publish(state, user, *id, Some(folder)).await {
            Ok(_) => result.success.push(*id),
            Err(e) => {
                tracing::error!(dataset = %id, "Could not publish dataset: {}", e);
                result.error.push(*id);
            }
        }
    }
    Ok(result)
}

// Versions

async fn insert_version(
    db: &SqlitePool,
    user: &User,
    dataset_id: Uuid,
    file_id: Option<Uuid>,
    name: Option<String>,
) -> AppResult<Version> {
    let id = Uuid::new_v4();
    let now = Utc::now();
    sqlx::query(
        "INSERT INTO uploads_versions (id, name, dataset_id, version_file_id, status, created_by, last_modified_by, \
         creation_date, last_modified_date) VALUES (?, ?, ?, ?, ?, ?, ?, ?, ?)",
    )
    .bind(id)
    .bind(name)
    .bind(dataset_id)
    .bind(file_id)
    .bind(VersionStatus::Scheduled.as_str())
    .bind(user.id)
    .bind(user.id)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;
    find_version(db, id).await?.ok_or_not_found("Version")
}

/// New version on the same file as `base`, carrying `base`'s metadata overlaid with `entries`.
async fn derive_version(
    db: &SqlitePool,
    user: &User,
    base: &Version,
    name: Option<String>,
    entries: &[ValidatedMetadata],
) -> AppResult<Version> {
    let version = insert_version(db, user, base.dataset_id, base.version_file_id, name).await?;
    metadata::copy_between(db, (ContentType::UploadsVersion, base.id), (ContentType::UploadsVersion, version.id)).await?;
    if !entries.is_empty() {
        metadata::set_for_relation(db, ContentType::UploadsVersion, version.id, entries, true).await?;
    }
    Ok(version)
}

async fn publish_if_dataset_published(db: &SqlitePool, dataset: &Dataset, version: &Version) -> AppResult<()> {
    if dataset.is_published() && !version.is_published() {
        publish_version(db, version).await?;
    }
    Ok(())
}

/// `POST /uploads/datasets/{id}/version`: a new version of the latest file with new metadata.
pub async fn create_version(state: &AppState, user: &User, dataset_id: Uuid, input: NewVersionInput) -> AppResult<VersionView> {
    let db = &state.db;
    let dataset = get_dataset_for_editor(state, user, dataset_id).await?;
    let latest = latest_version(db, dataset_id)
        .await?
        .ok_or_else(|| AppError::forbidden("You must create at least one version first."))?;
    let file_id = latest
        .version_file_id
        .ok_or_else(|| AppError::forbidden("The latest version has no file attached to it. Please upload a file first."))?;
    let name = validate_optional_name(input.name.as_deref())?;
    let entries = match input.metadata.as_deref() {
        Some(inputs) => Some(metadata::validate_inputs(db, inputs).await?),
        None => None,
    };

    let version = insert_version(db, user, dataset_id, Some(file_id), name).await?;
    if let Some(entries) = entries {
        metadata::set_for_relation(db, ContentType::UploadsVersion, version.id, &entries, false).await?;
    }
    publish_if_dataset_published(db, &dataset, &version).await?;
    touch_dataset(db, dataset_id, user.id).await?;
    locks::release(state, Lockable::Dataset, dataset_id, user.id).await?;
    version_view(db, find_version(db, version.id).await?.ok_or_not_found("Version")?).await
}

/// `POST /uploads/datasets/{id}/restore`: makes an older version the latest again.
pub async fn restore(state: &AppState, user: &User, dataset_id: Uuid, version_id: Option<Uuid>) -> AppResult<VersionView> {
    let db = &state.db;
    let dataset = get_dataset_for_viewer(db, user, dataset_id).await?;
    permissions::require(can_edit_dataset(db, user, &dataset).await?, "You are not allowed to edit this dataset.")?;
    let version_id = version_id.ok_or_else(|| {
        AppError::validation("uploads_version", "You can't restore a version without providing a primary key.")
    })?;
    locks::ensure_editable(state, Lockable::Dataset, dataset_id, user.id).await?;

    let versions = versions_of(db, dataset_id).await?;
    if versions.len() < 2 {
        return Err(AppError::forbidden(
            "A dataset must have at least two versions before you can restore a specific version.",
        ));
    }
    let target = find_version(db, version_id)
        .await?
        .ok_or_else(|| AppError::validation("uploads_version", "The version you want to restore does not exist."))?;
    if target.dataset_id != dataset_id {
        return Err(AppError::forbidden("The version you want to restore is not part of the dataset."));
    }
    if versions.first().is_some_and(|latest| latest.id == target.id) {
        return Err(AppError::forbidden("You can't restore the latest version of a dataset."));
    }
    if target.version_file_id.is_none() {
        return Err(AppError::forbidden("The version you want to restore has no file attached to it."));
    }

    let restored = derive_version(db, user, &target, target.name.clone(), &[]).await?;
    publish_if_dataset_published(db, &dataset, &restored).await?;
    touch_dataset(db, dataset_id, user.id).await?;
    refresh_display_name(db, dataset_id).await?;
    locks::release(state, Lockable::Dataset, dataset_id, user.id).await?;
    tracing::info!(dataset = %dataset_id, version = %target.id, "Restored version");
    version_view(db, find_version(db, restored.id).await?.ok_or_not_found("Version")?).await
}

/// Streams an upload below `temp/` and attaches it to the dataset as a new version.
pub async fn upload_file<S, E>(
    state: &AppState,
    user: &User,
    dataset_id: Uuid,
    file_name: &str,
    original_path: Option<&str>,
    stream: S,
) -> AppResult<DatasetView>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: fmt::Display,
{
    let db = &state.db;
    let dataset = get_dataset_for_editor(state, user, dataset_id).await?;

    let file_id = Uuid::new_v4();
    let now = Utc::now();
    let name = storage::sanitize_file_name(file_name);
    let stored_path = Storage::draft_path(user.id, file_id, &name, now);
    let size = match write_stream(&state.storage, &stored_path, stream, state.config.uploads.max_upload_bytes).await {
        Ok(size) => size,
        Err(e) => {
            let _ = state.storage.remove(&stored_path).await;
            return Err(e);
        }
    };

    sqlx::query(
        "INSERT INTO uploads_version_files (id, name, stored_path, size, status, uploaded_using_tus, storage_relocating, \
         created_by, creation_date, last_modified_date) VALUES (?, ?, ?, ?, ?, 0, ?, ?, ?, ?)",
    )
    .bind(file_id)
    .bind(&name)
    .bind(&stored_path)
    .bind(size as i64)
    .bind(FileStatus::Scheduled.as_str())
    .bind(Relocation::None.as_str())
    .bind(user.id)
    .bind(now)
    .bind(now)
    .execute(db)
    .await?;

    let mime_type = match mime::detect_stored(&state.storage, &stored_path, &name).await {
        Ok(mime_type) => mime_type,
        Err(e) => {
            tracing::error!(file = %file_id, "Detecting the MIME type failed: {:#}", e);
            mime::from_extension(&name).unwrap_or(mime::OCTET_STREAM)
        }
    };
    let original_name = file_name.trim();
    let mut system = vec![
        metadata::system_entry(ORIGINAL_FILE_NAME, original_name.into()),
        metadata::system_entry(MIME_TYPE, mime_type.into()),
    ];
    if let Some(path) = original_path.map(str::trim).filter(|p| !p.is_empty()) {
        system.push(metadata::system_entry(ORIGINAL_FILE_PATH, path.into()));
    }
    metadata::set_system(db, ContentType::UploadsVersionFile, file_id, &system).await?;

    let previous = latest_version(db, dataset_id).await?;
    let version = insert_version(db, user, dataset_id, Some(file_id), None).await?;
    if let Some(previous) = previous {
        metadata::copy_between(db, (ContentType::UploadsVersion, previous.id), (ContentType::UploadsVersion, version.id))
            .await?;
    }
    publish_if_dataset_published(db, &dataset, &version).await?;
    touch_dataset(db, dataset_id, user.id).await?;
    refresh_display_name(db, dataset_id).await?;
    locks::release(state, Lockable::Dataset, dataset_id, user.id).await?;

    state.metrics.record_upload(size);
    tracing::info!(dataset = %dataset_id, file = %file_id, size, "Stored upload '{}'", name);
    dataset_view(db, get_dataset(db, dataset_id).await?).await
}

async fn write_stream<S, E>(storage: &Storage, relative: &str, stream: S, max_bytes: u64) -> AppResult<u64>
where
    S: Stream<Item = Result<Bytes, E>>,
    E: fmt::Display,
{
    let mut file = storage.create(relative).await?;
    let mut stream = std::pin::pin!(stream);
    let mut written: u64 = 0;
    while let Some(chunk) = stream.next().await {
        let chunk = chunk.map_err(|e| AppError::bad_request(format!("Reading the upload failed: {}", e)))?;
        written += chunk.len() as u64;
        if written > max_bytes {
            return Err(AppError::PayloadTooLarge(format!("Uploads are limited to {} bytes", max_bytes)));
        }
        file.write_all(&chunk).await?;
    }
    file.flush().await?;
    Ok(written)
}

pub async fn list_versions(db: &SqlitePool, user: &User, filter: &VersionFilter) -> AppResult<Vec<Version>> {
    match (filter.dataset, filter.folder) {
        (Some(dataset_id), _) => {
            get_dataset_for_viewer(db, user, dataset_id).await?;
            versions_of(db, dataset_id).await
        }
        (None, Some(folder_id)) => {
            folders::get_for_viewer(db, user, folder_id).await?;
            Ok(sqlx::query_as::<_, Version>(&format!(
                "{} WHERE dataset_id IN (SELECT id FROM uploads_datasets WHERE folder_id = ? AND publication_date IS NOT NULL) \
                 ORDER BY creation_date DESC, rowid DESC",
                SELECT_VERSION
            ))
            .bind(folder_id)
            .fetch_all(db)
            .await?)
        }
        (None, None) => Err(AppError::validation("dataset", "Filter by 'dataset' or 'folder'.")),
    }
}

pub async fn update_version(state: &AppState, user: &User, id: Uuid, patch: VersionPatch) -> AppResult<VersionView> {
    let db = &state.db;
    let (version, dataset) = get_version_for_viewer(db, user, id).await?;
    permissions::require(can_edit_dataset(db, user, &dataset).await?, "You are not allowed to edit this dataset.")?;
    locks::ensure_editable(state, Lockable::Dataset, dataset.id, user.id).await?;

    if let Some(inputs) = patch.metadata.as_deref() {
        let is_latest = latest_version(db, dataset.id).await?.is_some_and(|l| l.id == version.id);
        if version.is_published() && !is_latest {
            return Err(AppError::forbidden("Metadata of older published versions cannot be changed."));
        }
        let entries = metadata::validate_inputs(db, inputs).await?;
        metadata::set_for_relation(db, ContentType::UploadsVersion, version.id, &entries, false).await?;
        sqlx::query("UPDATE uploads_versions SET status = ? WHERE id = ?")
            .bind(VersionStatus::Scheduled.as_str())
            .bind(version.id)
            .execute(db)
            .await?;
    }
    if let Some(name) = patch.name.as_deref() {
        let name = validate_optional_name(Some(name))?;
        sqlx::query("UPDATE uploads_versions SET name = ? WHERE id = ?").bind(name).bind(version.id).execute(db).await?;
    }
    sqlx::query("UPDATE uploads_versions SET last_modified_by = ?, last_modified_date = ? WHERE id = ?")
        .bind(user.id)
        .bind(Utc::now())
        .bind(version.id)
        .execute(db)
        .await?;
    locks::release(state, Lockable::Dataset, dataset.id, user.id).await?;
    version_view(db, find_version(db, version.id).await?.ok_or_not_found("Version")?).await
}

/// Mandatory fields of the folder's template all carry a value on the version.
pub async fn metadata_is_complete(db: &SqlitePool, version: &Version) -> AppResult<bool> {
    let template_id: Option<Uuid> = sqlx::query_scalar(
        "SELECT f.metadata_template_id FROM uploads_datasets d JOIN folders f ON f.id = d.folder_id WHERE d.id = ?",
    )
    .bind(version.dataset_id)
    .fetch_optional(db)
    .await?
    .flatten();
    let Some(template_id) = template_id else { return Ok(true) };
    let mandatory = templates::mandatory_keys(db, template_id).await?;
    if mandatory.is_empty() {
        return Ok(true);
    }
    let current = metadata::values_for(db, ContentType::UploadsVersion, version.id).await?;
    Ok(mandatory.iter().all(|key| current.get(key).is_some_and(metadata::values::has_value)))
}

/// Suggested download name: `base` without any trailing copies of `.ext`, then `.ext` once.
pub fn suggest_filename(base: &str, extension: Option<&str>) -> String {
    let mut base = base.trim().to_string();
    let Some(ext) = extension.filter(|e| !e.is_empty()) else {
        return base;
    };
    let suffix = format!(".{}", ext.to_ascii_lowercase());
    while base.len() > suffix.len() && base.to_ascii_lowercase().ends_with(&suffix) {
        base.truncate(base.len() - suffix.len());
    }
    format!("{}.{}", base, ext)
}

pub async fn download_info(state: &AppState, version: &Version, dataset: &Dataset) -> AppResult<DownloadInfo> {
    let db = &state.db;
    let file_id = version.version_file_id.ok_or_else(|| AppError::NotFound("The version has no file".to_string()))?;
    let file = find_file(db, file_id).await?.ok_or_not_found("Version file")?;
    let meta = state
        .storage
        .metadata(&file.stored_path)
        .await
        .map_err(|_| AppError::NotFound("The requested file does not exist.".to_string()))?;
    let values = metadata::values_for(db, ContentType::UploadsVersionFile, file.id).await?;
    let text = |key: &str| values.get(key).and_then(|v| v.as_str()).map(str::to_string);

    let mime_type = match text(MIME_TYPE) {
        Some(mime_type) => mime_type,
        None => mime::detect_stored(&state.storage, &file.stored_path, &file.name).await?.to_string(),
    };
    let base = dataset
        .name
        .clone()
        .filter(|n| !n.trim().is_empty())
        .or_else(|| text(ORIGINAL_FILE_NAME))
        .unwrap_or_else(|| file.name.clone());
    let (_, extension) = storage::split_extension(&file.name);

    Ok(DownloadInfo {
        size: meta.len(),
        modified: meta.modified().ok().map(DateTime::<Utc>::from),
        checksum_sha256: text(CHECKSUM_SHA256),
        filename: suggest_filename(&base, extension),
        stored_path: file.stored_path,
        mime_type,
    })
}
