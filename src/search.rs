//! Global search across projects, folders, datasets and versions.

use serde::{Deserialize, Serialize};
use sqlx::{QueryBuilder, Sqlite, SqlitePool};

use crate::error::{AppError, AppResult};
use crate::folders::{Folder, SELECT_FOLDER};
use crate::projects::{Project, SELECT_PROJECT};
use crate::types::ContentType;
use crate::uploads::{Dataset, Version, SELECT_DATASET, SELECT_VERSION};
use crate::users::User;

pub const DEFAULT_LIMIT: i64 = 5;
pub const MAX_LIMIT: i64 = 20;
const MAX_TERM_CHARS: usize = 500;
const LIKE_ESCAPE: char = '!';

const SEARCHABLE: [ContentType; 4] =
    [ContentType::Project, ContentType::Folder, ContentType::UploadsDataset, ContentType::UploadsVersion];

#[derive(Debug, Default, Deserialize)]
pub struct SearchQuery {
    pub term: Option<String>,
    pub content_types: Option<String>,
    pub limit: Option<String>,
}

#[derive(Debug, Default, Serialize)]
pub struct SearchResults {
    pub projects: Vec<Project>,
    pub folders: Vec<Folder>,
    pub uploads_datasets: Vec<Dataset>,
    pub uploads_versions: Vec<Version>,
}

/// `%term%` with `%`, `_` and `!` matched literally; pair with `ESCAPE '!'`.
pub fn contains_pattern(term: &str) -> String {
    format!("%{}%", escape_like_pattern(term))
}

fn escape_like_pattern(value: &str) -> String {
    let mut out = String::with_capacity(value.len());
    for ch in value.chars() {
        if matches!(ch, '%' | '_' | LIKE_ESCAPE) {
            out.push(LIKE_ESCAPE);
        }
        out.push(ch);
    }
    out
}

fn sanitize_term(raw: Option<&str>) -> AppResult<String> {
    let trimmed = raw.map(str::trim).unwrap_or_default();
    if trimmed.is_empty() {
        return Err(AppError::validation("term", "You must provide a search term."));
    }
    if trimmed.chars().count() > MAX_TERM_CHARS {
        return Err(AppError::validation("term", "The search term is too long."));
    }
    Ok(trimmed.chars().filter(|ch| !ch.is_control()).collect())
}

/// Falls back to the default for anything that is not a positive number.
pub fn parse_limit(raw: Option<&str>) -> i64 {
    match raw.and_then(|l| l.trim().parse::<i64>().ok()) {
        Some(limit) if limit > 0 => limit.min(MAX_LIMIT),
        _ => DEFAULT_LIMIT,
    }
}

/// Parses the comma separated `content_types` list; absent means all searchable types.
pub fn parse_content_types(raw: Option<&str>) -> AppResult<Vec<ContentType>> {
    let Some(raw) = raw.map(str::trim).filter(|r| !r.is_empty()) else {
        return Ok(SEARCHABLE.to_vec());
    };
    let mut types = Vec::new();
    for label in raw.split(',').map(str::trim).filter(|l| !l.is_empty()) {
        let content_type = label
            .parse::<ContentType>()
            .ok()
            .filter(|ct| SEARCHABLE.contains(ct))
            .ok_or_else(|| AppError::validation("content_types", format!("'{}' is not a searchable content type.", label)))?;
        if !types.contains(&content_type) {
            types.push(content_type);
        }
    }
    Ok(types)
}

fn push_metadata_match<'a>(qb: &mut QueryBuilder<'a, Sqlite>, content_type: ContentType, id_column: &str, pattern: &'a str) {
    qb.push(
        " EXISTS (SELECT 1 FROM metadata m LEFT JOIN metadata_fields mf ON mf.id = m.field_id \
         WHERE m.assigned_to_content_type = ",
    )
    .push_bind(content_type.as_str())
    .push(format!(" AND m.assigned_to_object_id = {} AND (m.value LIKE ", id_column))
    .push_bind(pattern)
    .push(" ESCAPE '!' OR COALESCE(mf.key, m.custom_key) LIKE ")
    .push_bind(pattern)
    .push(" ESCAPE '!'))");
}

fn push_visible_folders(qb: &mut QueryBuilder<'_, Sqlite>, user: &User) {
    if user.is_superuser {
        qb.push("SELECT id FROM folders");
    } else {
        qb.push(
            "SELECT fp.folder_id FROM folder_permissions fp JOIN project_memberships pm \
             ON pm.id = fp.project_membership_id WHERE pm.member_id = ",
        )
        .push_bind(user.id);
    }
}

async fn search_projects(db: &SqlitePool, user: &User, pattern: &str, limit: i64) -> AppResult<Vec<Project>> {
    let mut qb = QueryBuilder::<Sqlite>::new(SELECT_PROJECT);
    qb.push(" WHERE (projects.name LIKE ").push_bind(pattern).push(" ESCAPE '!' OR projects.description LIKE ");
    qb.push_bind(pattern).push(" ESCAPE '!' OR");
    push_metadata_match(&mut qb, ContentType::Project, "projects.id", pattern);
    qb.push(")");
    if !user.is_superuser {
        qb.push(" AND projects.id IN (SELECT project_id FROM project_memberships WHERE member_id = ")
            .push_bind(user.id)
            .push(")");
    }
    qb.push(" ORDER BY projects.name COLLATE NOCASE LIMIT ").push_bind(limit);
    Ok(qb.build_query_as::<Project>().fetch_all(db).await?)
}

async fn search_folders(db: &SqlitePool, user: &User, pattern: &str, limit: i64) -> AppResult<Vec<Folder>> {
    let mut qb = QueryBuilder::<Sqlite>::new(SELECT_FOLDER);
    qb.push(" WHERE (folders.name LIKE ").push_bind(pattern).push(" ESCAPE '!' OR folders.description LIKE ");
    qb.push_bind(pattern).push(" ESCAPE '!' OR");
    push_metadata_match(&mut qb, ContentType::Folder, "folders.id", pattern);
    qb.push(") AND folders.id IN (");
    push_visible_folders(&mut qb, user);
    qb.push(") ORDER BY folders.name COLLATE NOCASE LIMIT ").push_bind(limit);
    Ok(qb.build_query_as::<Folder>().fetch_all(db).await?)
}

async fn search_datasets(db: &SqlitePool, user: &User, pattern: &str, limit: i64) -> AppResult<Vec<Dataset>> {
    let mut qb = QueryBuilder::<Sqlite>::new(SELECT_DATASET);
    qb.push(" WHERE uploads_datasets.publication_date IS NOT NULL AND (uploads_datasets.name LIKE ")
        .push_bind(pattern)
        .push(" ESCAPE '!' OR uploads_datasets.display_name LIKE ")
        .push_bind(pattern)
        .push(" ESCAPE '!' OR EXISTS (SELECT 1 FROM uploads_versions v WHERE v.dataset_id = uploads_datasets.id AND");
    push_metadata_match(&mut qb, ContentType::UploadsVersion, "v.id", pattern);
    qb.push(")) AND uploads_datasets.folder_id IN (");
    push_visible_folders(&mut qb, user);
    qb.push(") ORDER BY COALESCE(uploads_datasets.name, uploads_datasets.display_name) COLLATE NOCASE LIMIT ")
        .push_bind(limit);
    Ok(qb.build_query_as::<Dataset>().fetch_all(db).await?)
}

async fn search_versions(db: &SqlitePool, user: &User, pattern: &str, limit: i64) -> AppResult<Vec<Version>> {
    let mut qb = QueryBuilder::<Sqlite>::new(SELECT_VERSION);
    qb.push(" WHERE uploads_versions.publication_date IS NOT NULL AND (uploads_versions.name LIKE ")
        .push_bind(pattern)
        .push(" ESCAPE '!' OR");
    push_metadata_match(&mut qb, ContentType::UploadsVersion, "uploads_versions.id", pattern);
    qb.push(") AND uploads_versions.dataset_id IN (SELECT id FROM uploads_datasets WHERE publication_date IS NOT NULL AND folder_id IN (");
    push_visible_folders(&mut qb, user);
    qb.push(")) ORDER BY uploads_versions.creation_date DESC LIMIT ").push_bind(limit);
    Ok(qb.build_query_as::<Version>().fetch_all(db).await?)
}

pub async fn global(db: &SqlitePool, user: &User, query: &SearchQuery) -> AppResult<SearchResults> {
    let term = sanitize_term(query.term.as_deref())?;
    let content_types = parse_content_types(query.content_types.as_deref())?;
    let limit = parse_limit(query.limit.as_deref());
    let pattern = contains_pattern(&term);

    let mut results = SearchResults::default();
    for content_type in content_types {
        match content_type {
            ContentType::Project => results.projects = search_projects(db, user, &pattern, limit).await?,
            ContentType::Folder => results.folders = search_folders(db, user, &pattern, limit).await?,
            ContentType::UploadsDataset => results.uploads_datasets = search_datasets(db, user, &pattern, limit).await?,
            ContentType::UploadsVersion => results.uploads_versions = search_versions(db, user, &pattern, limit).await?,
            _ => {}
        }
    }
    tracing::debug!(user = %user.id, "Global search for '{}'", term);
    Ok(results)
}
