use std::fmt;
use std::str::FromStr;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Deserializer, Serialize};
use uuid::Uuid;

use crate::error::{AppError, AppResult};

/// Entities that metadata, templates and lock events can point at.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub enum ContentType {
    #[serde(rename = "projects.project")]
    Project,
    #[serde(rename = "folders.folder")]
    Folder,
    #[serde(rename = "uploads.uploadsdataset")]
    UploadsDataset,
    #[serde(rename = "uploads.uploadsversion")]
    UploadsVersion,
    #[serde(rename = "uploads.uploadsversionfile")]
    UploadsVersionFile,
    #[serde(rename = "metadata.metadatatemplate")]
    MetadataTemplate,
}

impl ContentType {
    pub fn as_str(&self) -> &'static str {
        match self {
            ContentType::Project => "projects.project",
            ContentType::Folder => "folders.folder",
            ContentType::UploadsDataset => "uploads.uploadsdataset",
            ContentType::UploadsVersion => "uploads.uploadsversion",
            ContentType::UploadsVersionFile => "uploads.uploadsversionfile",
            ContentType::MetadataTemplate => "metadata.metadatatemplate",
        }
    }

    /// Targets metadata entries may be attached to.
    pub fn accepts_metadata(&self) -> bool {
        matches!(
            self,
            ContentType::Project
                | ContentType::Folder
                | ContentType::UploadsVersion
                | ContentType::UploadsVersionFile
        )
    }
}

impl fmt::Display for ContentType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for ContentType {
    type Err = AppError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.trim() {
            "projects.project" => Ok(ContentType::Project),
            "folders.folder" => Ok(ContentType::Folder),
            "uploads.uploadsdataset" => Ok(ContentType::UploadsDataset),
            "uploads.uploadsversion" => Ok(ContentType::UploadsVersion),
            "uploads.uploadsversionfile" => Ok(ContentType::UploadsVersionFile),
            "metadata.metadatatemplate" => Ok(ContentType::MetadataTemplate),
            other => Err(AppError::bad_request(format!("Unknown content type '{}'", other))),
        }
    }
}

/// `limit`/`offset` query parameters shared by list endpoints.
#[derive(Debug, Clone, Copy, Default, Deserialize)]
pub struct PageQuery {
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

impl PageQuery {
    pub const DEFAULT_LIMIT: i64 = 100;
    pub const MAX_LIMIT: i64 = 1000;

    pub fn limit(&self) -> i64 {
        self.limit.unwrap_or(Self::DEFAULT_LIMIT).clamp(1, Self::MAX_LIMIT)
    }

    pub fn offset(&self) -> i64 {
        self.offset.unwrap_or(0).max(0)
    }

    /// Slices an already ordered, already filtered list.
    pub fn apply<T>(&self, items: Vec<T>) -> Page<T> {
        let count = items.len() as i64;
        let results = items.into_iter().skip(self.offset() as usize).take(self.limit() as usize).collect();
        Page { count, results }
    }
}

#[derive(Debug, Serialize)]
pub struct Page<T> {
    pub count: i64,
    pub results: Vec<T>,
}

/// Compact user representation embedded in other resources.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct MinimalUser {
    pub id: Uuid,
    pub email: String,
    pub username: String,
    pub display_name: String,
}

#[derive(Debug, Clone, Serialize)]
pub struct LockStatus {
    pub locked: bool,
    pub locked_by: Option<MinimalUser>,
    pub locked_at: Option<DateTime<Utc>>,
}

/// Broadcast whenever a lockable entity is locked or unlocked.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
pub struct LockEvent {
    pub content_type: ContentType,
    pub pk: Uuid,
    pub status: bool,
    pub user: Option<Uuid>,
}

/// Result of the bulk dataset operations.
#[derive(Debug, Default, Serialize)]
pub struct BulkResult {
    pub success: Vec<Uuid>,
    pub error: Vec<Uuid>,
}

/// Parses a UUID coming from a query string, reporting the parameter name on failure.
pub fn parse_uuid_param(value: &str, field: &str) -> AppResult<Uuid> {
    Uuid::parse_str(value.trim()).map_err(|_| AppError::validation(field, format!("'{}' is not a valid UUID.", value)))
}

/// Distinguishes an absent field (`None`) from an explicit `null` (`Some(None)`) in PATCH bodies.
pub fn double_option<'de, T, D>(deserializer: D) -> Result<Option<Option<T>>, D::Error>
where
    T: Deserialize<'de>,
    D: Deserializer<'de>,
{
    Option::<T>::deserialize(deserializer).map(Some)
}
