//! Dataset, version and version-file endpoints, including the multipart upload and the download stream.

use axum::{
    body::Body,
    extract::{multipart::MultipartError, Multipart, Path, Query, State},
    http::{header, HeaderMap, HeaderName, HeaderValue, StatusCode},
    response::{IntoResponse, Response},
    Json,
};
use chrono::{DateTime, Utc};
use serde::Deserialize;
use tokio_util::io::ReaderStream;
use uuid::Uuid;

use crate::error::{AppError, AppResult};
use crate::middleware::{ClientIp, CurrentUser, LimitedEndpoint};
use crate::state::AppState;
use crate::types::PageQuery;
use crate::uploads::{self, diff, DatasetInput, DownloadInfo, NewVersionInput, VersionFilter, VersionPatch};

pub const ORIGINAL_FILE_PATH_HEADER: &str = "original-file-path";

#[derive(Debug, Default, Deserialize)]
pub struct DatasetQuery {
    pub folder: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct BulkRequest {
    #[serde(default)]
    pub uploads_datasets: Vec<Uuid>,
    pub folder: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct PublishRequest {
    pub folder: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct RestoreRequest {
    pub uploads_version: Option<Uuid>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DownloadQuery {
    pub as_attachment: Option<bool>,
}

#[derive(Debug, Default, Deserialize)]
pub struct DiffQuery {
    pub compare: Option<String>,
}

pub async fn list_datasets(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(query): Query<DatasetQuery>,
    Query(page): Query<PageQuery>,
) -> AppResult<impl IntoResponse> {
    let found = uploads::list_datasets(&state.db, &current, query.folder).await?;
    let mut views = Vec::with_capacity(found.len());
    for dataset in found {
        views.push(uploads::dataset_view(&state.db, dataset).await?);
    }
    Ok(Json(page.apply(views)))
}

pub async fn create_dataset(
    State(state): State<AppState>,
    current: CurrentUser,
    body: Option<Json<DatasetInput>>,
) -> AppResult<impl IntoResponse> {
    let input = body.map(|Json(input)| input).unwrap_or_default();
    let view = uploads::create_dataset(&state, &current, input).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn get_dataset(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let dataset = uploads::get_dataset_for_viewer(&state.db, &current, id).await?;
    Ok(Json(uploads::dataset_view(&state.db, dataset).await?))
}

pub async fn update_dataset(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
    Json(input): Json<DatasetInput>,
) -> AppResult<impl IntoResponse> {
    Ok(Json(uploads::update_dataset(&state, &current, id, input).await?))
}

pub async fn delete_dataset(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    uploads::delete_dataset(&state, &current, id).await?;
    Ok(StatusCode::NO_CONTENT)
}

pub async fn bulk_delete(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(req): Json<BulkRequest>,
) -> AppResult<impl IntoResponse> {
    Ok(Json(uploads::bulk_delete(&state, &current, &req.uploads_datasets).await?))
}

pub async fn bulk_publish(
    State(state): State<AppState>,
    current: CurrentUser,
    Json(req): Json<BulkRequest>,
) -> AppResult<impl IntoResponse> {
    let folder = req.folder.ok_or_else(|| AppError::validation("folder", "You can't publish a dataset without a folder."))?;
    let result = uploads::bulk_publish(&state, &current, &req.uploads_datasets, folder).await?;
    Ok((StatusCode::CREATED, Json(result)))
}

pub async fn publish(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
    body: Option<Json<PublishRequest>>,
) -> AppResult<impl IntoResponse> {
    let folder = body.and_then(|Json(req)| req.folder);
    let view = uploads::publish(&state, &current, id, folder).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn create_version(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
    body: Option<Json<NewVersionInput>>,
) -> AppResult<impl IntoResponse> {
    let input = body.map(|Json(input)| input).unwrap_or_default();
    let view = uploads::create_version(&state, &current, id, input).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

pub async fn restore(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
    Json(req): Json<RestoreRequest>,
) -> AppResult<impl IntoResponse> {
    let view = uploads::restore(&state, &current, id, req.uploads_version).await?;
    Ok((StatusCode::CREATED, Json(view)))
}

fn multipart_error(e: MultipartError) -> AppError {
    if e.status() == StatusCode::PAYLOAD_TOO_LARGE {
        AppError::PayloadTooLarge(e.body_text())
    } else {
        AppError::bad_request(format!("Invalid multipart body: {}", e.body_text()))
    }
}

/// Multipart upload; the first field named `file` is stored, everything else is ignored.
pub async fn upload_file(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
    ClientIp(ip): ClientIp,
    headers: HeaderMap,
    mut multipart: Multipart,
) -> AppResult<impl IntoResponse> {
    state.rate_limiter.check(LimitedEndpoint::Upload, ip).await?;

    let original_path = headers
        .get(ORIGINAL_FILE_PATH_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(str::to_string);

    while let Some(field) = multipart.next_field().await.map_err(multipart_error)? {
        if field.name() != Some("file") {
            continue;
        }
        let file_name = field
            .file_name()
            .map(str::to_string)
            .filter(|n| !n.trim().is_empty())
            .ok_or_else(|| AppError::validation("file", "The uploaded file has no file name."))?;
        let view = uploads::upload_file(&state, &current, id, &file_name, original_path.as_deref(), field).await?;
        return Ok((StatusCode::CREATED, Json(view)));
    }
    Err(AppError::validation("file", "No file was submitted."))
}

pub async fn list_versions(
    State(state): State<AppState>,
    current: CurrentUser,
    Query(filter): Query<VersionFilter>,
    Query(page): Query<PageQuery>,
) -> AppResult<impl IntoResponse> {
    let found = uploads::list_versions(&state.db, &current, &filter).await?;
    let mut views = Vec::with_capacity(found.len());
    for version in found {
        views.push(uploads::version_view(&state.db, version).await?);
    }
    Ok(Json(page.apply(views)))
}

pub async fn get_version(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let (version, _) = uploads::get_version_for_viewer(&state.db, &current, id).await?;
    Ok(Json(uploads::version_view(&state.db, version).await?))
}

pub async fn update_version(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
    Json(patch): Json<VersionPatch>,
) -> AppResult<impl IntoResponse> {
    Ok(Json(uploads::update_version(&state, &current, id, patch).await?))
}

fn http_date(value: DateTime<Utc>) -> String {
    value.format("%a, %d %b %Y %H:%M:%S GMT").to_string()
}

/// `attachment; filename="..."; filename*=UTF-8''...` with an ASCII fallback name.
fn content_disposition(filename: &str, as_attachment: bool) -> String {
    let fallback: String = filename
        .chars()
        .map(|c| if c.is_ascii_graphic() && c != '"' && c != '\\' || c == ' ' { c } else { '_' })
        .collect();
    let mut encoded = String::with_capacity(filename.len());
    for byte in filename.bytes() {
        match byte {
            b'A'..=b'Z' | b'a'..=b'z' | b'0'..=b'9' | b'.' | b'-' | b'_' | b'~' => encoded.push(byte as char),
            _ => encoded.push_str(&format!("%{:02X}", byte)),
        }
    }
    let kind = if as_attachment { "attachment" } else { "inline" };
    format!("{}; filename=\"{}\"; filename*=UTF-8''{}", kind, fallback, encoded)
}

fn insert_header(headers: &mut HeaderMap, name: HeaderName, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}

fn file_headers(info: &DownloadInfo) -> HeaderMap {
    let mut headers = HeaderMap::new();
    insert_header(&mut headers, HeaderName::from_static("file-size"), &info.size.to_string());
    if let Some(modified) = info.modified {
        insert_header(&mut headers, HeaderName::from_static("file-last-modified"), &http_date(modified));
    }
    headers.insert(HeaderName::from_static("file-accept-ranges"), HeaderValue::from_static("bytes"));
    insert_header(&mut headers, HeaderName::from_static("file-mime-type"), &info.mime_type);
    if let Some(checksum) = info.checksum_sha256.as_deref() {
        insert_header(&mut headers, HeaderName::from_static("file-checksum-sha256"), checksum);
        insert_header(&mut headers, header::ETAG, &format!("\"{}\"", checksum));
    }
    headers
}

pub async fn download(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
    Query(query): Query<DownloadQuery>,
) -> AppResult<Response> {
    let (version, dataset) = uploads::get_version_for_viewer(&state.db, &current, id).await?;
    let info = uploads::download_info(&state, &version, &dataset).await?;
    let file = state
        .storage
        .open(&info.stored_path)
        .await
        .map_err(|_| AppError::NotFound("The requested file does not exist.".to_string()))?;

    let mut response = Body::from_stream(ReaderStream::new(file)).into_response();
    let headers = response.headers_mut();
    insert_header(headers, header::CONTENT_TYPE, &info.mime_type);
    insert_header(headers, header::CONTENT_LENGTH, &info.size.to_string());
    insert_header(
        headers,
        header::CONTENT_DISPOSITION,
        &content_disposition(&info.filename, query.as_attachment.unwrap_or(false)),
    );
    if let Some(modified) = info.modified {
        insert_header(headers, header::LAST_MODIFIED, &http_date(modified));
    }
    if let Some(checksum) = info.checksum_sha256.as_deref() {
        insert_header(headers, header::ETAG, &format!("\"{}\"", checksum));
    }
    tracing::debug!(version = %id, user = %current.id, "Streaming download '{}'", info.filename);
    Ok(response)
}

/// Headers describing the file without its body.
pub async fn download_head(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let (version, dataset) = uploads::get_version_for_viewer(&state.db, &current, id).await?;
    let info = uploads::download_info(&state, &version, &dataset).await?;
    Ok((StatusCode::OK, file_headers(&info)))
}

pub async fn diff(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
    Query(query): Query<DiffQuery>,
) -> AppResult<impl IntoResponse> {
    Ok(Json(diff::diff(&state.db, &current, id, query.compare.as_deref()).await?))
}

pub async fn get_version_file(
    State(state): State<AppState>,
    current: CurrentUser,
    Path(id): Path<Uuid>,
) -> AppResult<impl IntoResponse> {
    let file = uploads::get_file_for_viewer(&state.db, &current, id).await?;
    Ok(Json(uploads::file_view(&state.db, file).await?))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn content_disposition_encodes_non_ascii_names() {
        let value = content_disposition("Über report.pdf", true);
        assert!(value.starts_with("attachment; filename=\"_ber report.pdf\""));
        assert!(value.ends_with("filename*=UTF-8''%C3%9Cber%20report.pdf"));
        assert!(content_disposition("a.txt", false).starts_with("inline;"));
    }

    #[test]
    fn http_dates_use_gmt() {
        let date = DateTime::parse_from_rfc3339("2024-03-05T07:08:09Z").map(|d| d.with_timezone(&Utc));
        assert_eq!(http_date(date.unwrap()), "Tue, 05 Mar 2024 07:08:09 GMT");
    }
}
