//! HTTP route handlers for the FDM API.
//!
//! Every domain gets its own sub-module with thin handlers that extract the request, call into
//! the domain layer and shape the response:
//!
//! - `health`: health, readiness, metrics and version endpoints
//! - `auth`: login, logout and password reset
//! - `users`, `settings`: accounts and database settings
//! - `projects`, `folders`: projects, memberships, folders and folder permissions
//! - `metadata`: metadata fields, entries and templates
//! - `uploads`: datasets, versions, version files and downloads
//! - `locks`: lock, unlock and status for every lockable resource
//! - `events`: the lock event stream
//! - `search`: global search
//! - `content`: content pages and the FAQ, readable without a token

pub mod auth;
pub mod content;
pub mod events;
pub mod folders;
pub mod health;
pub mod locks;
pub mod metadata;
pub mod projects;
pub mod search;
pub mod settings;
pub mod uploads;
pub mod users;

use axum::extract::DefaultBodyLimit;
use axum::http::header::CONTENT_TYPE;
use axum::middleware::{from_fn, from_fn_with_state};
use axum::routing::{get, post, put};
use axum::Router;
use tower_http::compression::predicate::{DefaultPredicate, Predicate};
use tower_http::{compression::CompressionLayer, trace::TraceLayer};

use crate::locks::Lockable;
use crate::middleware;
use crate::state::AppState;

pub const API_PREFIX: &str = "/api/v1";

const MULTIPART_OVERHEAD: u64 = 64 * 1024;

/// Compression predicate that leaves SSE streams and file downloads alone.
#[derive(Clone)]
struct NoStreamingDefault(DefaultPredicate);

impl Predicate for NoStreamingDefault {
    fn should_compress<B: axum::body::HttpBody>(&self, res: &axum::http::Response<B>) -> bool {
        if let Some(ct) = res.headers().get(CONTENT_TYPE).and_then(|v| v.to_str().ok()) {
            if ct.starts_with("text/event-stream") || res.headers().contains_key("content-disposition") {
                return false;
            }
        }
        self.0.should_compress(res)
    }
}

fn api_routes(state: &AppState) -> Router<AppState> {
    // Headroom for the multipart framing around the file itself
    let upload_limit =
        usize::try_from(state.config.uploads.max_upload_bytes.saturating_add(MULTIPART_OVERHEAD)).unwrap_or(usize::MAX);

    Router::new()
        .route("/auth/login", post(auth::login))
        .route("/auth/logout", post(auth::logout))
        .route("/auth/password-reset", post(auth::password_reset))
        .route("/auth/password-reset/validate", post(auth::password_reset_validate))
        .route("/auth/password-reset/confirm", post(auth::password_reset_confirm))
        .route("/users", get(users::list_users))
        .route("/users/me", get(users::me))
        .route("/users/{id}", get(users::get_user))
        .route("/settings", get(settings::list_settings))
        .route("/settings/{key}", put(settings::put_setting))
        .route("/projects", get(projects::list_projects).post(projects::create_project))
        .route(
            "/projects/{id}",
            get(projects::get_project).patch(projects::update_project).delete(projects::delete_project),
        )
        .route("/projects/{id}/members", put(projects::sync_members))
        .route("/projects/{id}/folders", get(projects::project_folders))
        .route("/projects/{id}/metadata-templates", get(projects::project_templates))
        .route("/project-memberships", get(projects::list_memberships))
        .route(
            "/project-memberships/{id}",
            get(projects::get_membership).patch(projects::update_membership).delete(projects::delete_membership),
        )
        .route("/folders", get(folders::list_folders).post(folders::create_folder))
        .route(
            "/folders/{id}",
            get(folders::get_folder).patch(folders::update_folder).delete(folders::delete_folder),
        )
        .route("/folders/{id}/permissions", put(folders::sync_permissions))
        .route("/folder-permissions", get(folders::list_permissions))
        .route(
            "/folder-permissions/{id}",
            get(folders::get_permission).patch(folders::update_permission).delete(folders::delete_permission),
        )
        .route("/metadata", get(metadata::list_metadata))
        .route("/metadata/fields", get(metadata::list_fields))
        .route("/metadata/fields/{id}", get(metadata::get_field))
        .route("/metadata/templates", get(metadata::list_templates).post(metadata::create_template))
        .route(
            "/metadata/templates/{id}",
            get(metadata::get_template).patch(metadata::update_template).delete(metadata::delete_template),
        )
        .route("/uploads/datasets", get(uploads::list_datasets).post(uploads::create_dataset))
        .route("/uploads/datasets/bulk-delete", post(uploads::bulk_delete))
        .route("/uploads/datasets/bulk-publish", post(uploads::bulk_publish))
        .route(
            "/uploads/datasets/{id}",
            get(uploads::get_dataset).patch(uploads::update_dataset).delete(uploads::delete_dataset),
        )
        .route("/uploads/datasets/{id}/publish", post(uploads::publish))
        .route("/uploads/datasets/{id}/version", post(uploads::create_version))
        .route("/uploads/datasets/{id}/restore", post(uploads::restore))
        .route(
            "/uploads/datasets/{id}/file",
            post(uploads::upload_file).layer(DefaultBodyLimit::max(upload_limit)),
        )
        .route("/uploads/versions", get(uploads::list_versions))
        .route("/uploads/versions/{id}", get(uploads::get_version).patch(uploads::update_version))
        .route("/uploads/versions/{id}/download", get(uploads::download).head(uploads::download_head))
        .route("/uploads/versions/{id}/diff", get(uploads::diff))
        .route("/uploads/version-files/{id}", get(uploads::get_version_file))
        .route("/search/global", get(search::global_search))
        .route("/cms/slugs", get(content::page_slugs))
        .route("/cms/{slug}", get(content::get_page).put(content::put_page))
        .route("/faq-category", get(content::list_categories).post(content::create_category))
        .route("/faq-category/{id}", get(content::get_category))
        .route("/faq", get(content::list_faqs).post(content::create_faq))
        .route("/faq/{id}", get(content::get_faq))
        .route("/events/locks", get(events::lock_events))
        .merge(locks::lock_routes("/projects", Lockable::Project))
        .merge(locks::lock_routes("/folders", Lockable::Folder))
        .merge(locks::lock_routes("/uploads/datasets", Lockable::Dataset))
        .merge(locks::lock_routes("/metadata/templates", Lockable::MetadataTemplate))
}

/// Builds the full application router with its middleware stack.
pub fn build_router(state: AppState) -> Router {
    let compression = CompressionLayer::new().compress_when(NoStreamingDefault(DefaultPredicate::new()));
    let cfg_arc = state.config.clone();
    let body_limit = state.config.server.max_body_bytes;

    Router::new()
        .route("/healthz", get(health::healthz))
        .route("/readyz", get(health::readyz))
        .route("/metrics", get(health::metrics))
        .route("/metrics/prometheus", get(health::metrics_prometheus))
        .route("/version", get(health::version))
        .nest(API_PREFIX, api_routes(&state))
        .with_state(state)
        .layer(DefaultBodyLimit::max(body_limit))
        .layer(from_fn_with_state(cfg_arc.clone(), middleware::validation::validate_request_middleware))
        .layer(from_fn(middleware::rate_limit::rate_limit_middleware))
        .layer(compression)
        .layer(TraceLayer::new_for_http())
        .layer(from_fn_with_state(cfg_arc, middleware::security_headers::security_headers_middleware))
}
