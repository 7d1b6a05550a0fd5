//! Tests for the fdm service.
//!
//! Unit tests live next to their code; the modules here exercise the HTTP API and the domain
//! layer against a throwaway SQLite database and storage root.
//!
//! ## Test Modules
//!
//! - **api_tests**: authentication, users and settings over HTTP
//! - **projects_api_tests**: projects and memberships
//! - **folders_api_tests**: folders and folder permissions
//! - **metadata_api_tests**: metadata entries, fields and templates
//! - **uploads_api_tests**: datasets, versions, uploads, downloads and publishing
//! - **locks_api_tests**: lock, unlock, status and the lock event stream
//! - **search_api_tests**: global search
//! - **content_api_tests**: content pages and the FAQ
//! - **worker_tests**: the file parser tick and the mail dispatcher
//! - **fixtures_tests**: dump and load of JSON fixtures
//! - **error_tests**, **config_tests**, **db_tests**, **health_api_tests**
//!
//! Individual modules can be run with e.g. `cargo test uploads_api_tests`.

pub mod config_tests;
pub mod content_api_tests;
pub mod fixtures_tests;
pub mod folders_api_tests;
pub mod health_api_tests;
pub mod locks_api_tests;
pub mod uploads_api_tests;
pub mod worker_tests;

use axum::{
    body::Body,
    http::{Method, Request, StatusCode},
    Router,
};
use chrono::Duration;
use http_body_util::BodyExt;
use serde_json::Value;
use tempfile::TempDir;
use tower::ServiceExt;

use crate::auth::{self, TokenKind};
use crate::state::AppState;
use crate::users::{self, NewUser, User};
use crate::{config, db, routes};

pub const MULTIPART_BOUNDARY: &str = "fdm-test-boundary";

/// A router on a fresh database and storage root. Both vanish with the value.
pub struct TestEnv {
    pub app: Router,
    pub state: AppState,
    client_ip: String,
    _dir: TempDir,
}

/// A user plus a session token for the `Authorization` header.
pub struct TestUser {
    pub user: User,
    pub token: String,
}

impl TestEnv {
    pub async fn new() -> Self {
        Self::with_config("").await
    }

    /// `extra` is a TOML snippet applied on top of the test defaults.
    pub async fn with_config(extra: &str) -> Self {
        let dir = TempDir::new().unwrap();
        let db_path = dir.path().join("fdm.db");
        let storage = dir.path().join("storage");
        std::fs::create_dir_all(&storage).unwrap();
        let base = format!(
            "[database]\nurl = \"sqlite://{}\"\nmax_connections = 4\n[storage]\nroot = \"{}\"\n[workers]\nenabled = false\n",
            db_path.display(),
            storage.display()
        );
        let cfg = config::from_toml_layers(&[base.as_str(), extra]).unwrap();
        let pool = db::connect(&cfg.database.url, cfg.database.max_connections).await.unwrap();
        db::init_db(&pool).await.unwrap();

        let state = AppState::new(pool, cfg);
        let app = routes::build_router(state.clone());
        // Unique client address so the per-IP limiters of parallel tests do not interfere
        let bytes = uuid::Uuid::new_v4().into_bytes();
        let client_ip = format!("10.{}.{}.{}", bytes[0], bytes[1], bytes[2]);
        TestEnv { app, state, client_ip, _dir: dir }
    }

    pub async fn user(&self, email: &str) -> TestUser {
        self.user_with(NewUser { email: email.to_string(), can_create_projects: true, ..Default::default() }).await
    }

    pub async fn superuser(&self, email: &str) -> TestUser {
        self.user_with(NewUser { email: email.to_string(), is_superuser: true, ..Default::default() }).await
    }

    pub async fn user_with(&self, new: NewUser) -> TestUser {
        let user = users::create(&self.state.db, new).await.unwrap();
        let (token, _) = auth::issue_token(&self.state.db, user.id, TokenKind::Session, Duration::days(1)).await.unwrap();
        TestUser { user, token }
    }

    fn builder(&self, method: Method, uri: &str, token: Option<&str>) -> axum::http::request::Builder {
        let mut builder = Request::builder().method(method).uri(uri).header("x-forwarded-for", &self.client_ip);
        if let Some(token) = token {
            builder = builder.header("authorization", format!("Bearer {}", token));
        }
        builder
    }

    /// Sends a JSON request and returns the status and the parsed body (`Null` when empty).
    pub async fn json(&self, method: Method, uri: &str, token: Option<&str>, body: Option<Value>) -> (StatusCode, Value) {
        let builder = self.builder(method, uri, token);
        let request = match body {
            Some(body) => builder.header("content-type", "application/json").body(Body::from(body.to_string())),
            None => builder.body(Body::empty()),
        }
        .unwrap();
        let response = self.app.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let value = if bytes.is_empty() { Value::Null } else { serde_json::from_slice(&bytes).unwrap_or(Value::Null) };
        (status, value)
    }

    pub async fn get(&self, uri: &str, token: &str) -> (StatusCode, Value) {
        self.json(Method::GET, uri, Some(token), None).await
    }

    pub async fn post(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.json(Method::POST, uri, Some(token), Some(body)).await
    }

    pub async fn patch(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.json(Method::PATCH, uri, Some(token), Some(body)).await
    }

    pub async fn put(&self, uri: &str, token: &str, body: Value) -> (StatusCode, Value) {
        self.json(Method::PUT, uri, Some(token), Some(body)).await
    }

    pub async fn delete(&self, uri: &str, token: &str) -> StatusCode {
        self.json(Method::DELETE, uri, Some(token), None).await.0
    }

    /// Sends a raw request and returns the full response.
    pub async fn raw(&self, method: Method, uri: &str, token: &str) -> axum::response::Response {
        let request = self.builder(method, uri, Some(token)).body(Body::empty()).unwrap();
        self.app.clone().oneshot(request).await.unwrap()
    }

    /// Uploads `content` as the multipart field `file`.
    pub async fn upload(
        &self,
        dataset_id: &str,
        token: &str,
        file_name: &str,
        content: &[u8],
        original_path: Option<&str>,
    ) -> (StatusCode, Value) {
        let mut body = Vec::new();
        body.extend_from_slice(format!("--{}\r\n", MULTIPART_BOUNDARY).as_bytes());
        body.extend_from_slice(
            format!("Content-Disposition: form-data; name=\"file\"; filename=\"{}\"\r\n", file_name).as_bytes(),
        );
        body.extend_from_slice(b"Content-Type: application/octet-stream\r\n\r\n");
        body.extend_from_slice(content);
        body.extend_from_slice(format!("\r\n--{}--\r\n", MULTIPART_BOUNDARY).as_bytes());

        let mut builder = self
            .builder(Method::POST, &format!("/api/v1/uploads/datasets/{}/file", dataset_id), Some(token))
            .header("content-type", format!("multipart/form-data; boundary={}", MULTIPART_BOUNDARY));
        if let Some(path) = original_path {
            builder = builder.header("original-file-path", path);
        }
        let response = self.app.clone().oneshot(builder.body(Body::from(body)).unwrap()).await.unwrap();
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, serde_json::from_slice(&bytes).unwrap_or(Value::Null))
    }

    /// Creates a project through the API and returns its JSON.
    pub async fn project(&self, owner: &TestUser, name: &str) -> Value {
        let (status, body) = self.post("/api/v1/projects", &owner.token, serde_json::json!({ "name": name })).await;
        assert_eq!(status, StatusCode::CREATED, "{}", body);
        body
    }

    /// The id of the default folder created with a project.
    pub async fn default_folder(&self, owner: &TestUser, project: &Value) -> String {
        let (_, body) =
            self.get(&format!("/api/v1/projects/{}/folders", project["id"].as_str().unwrap()), &owner.token).await;
        body["results"][0]["id"].as_str().unwrap().to_string()
    }

    /// Creates a draft dataset with one uploaded file and returns the dataset JSON.
    pub async fn draft_with_file(&self, owner: &TestUser, file_name: &str, content: &[u8]) -> Value {
        let (status, dataset) = self.post("/api/v1/uploads/datasets", &owner.token, serde_json::json!({})).await;
        assert_eq!(status, StatusCode::CREATED, "{}", dataset);
        let (status, dataset) = self.upload(dataset["id"].as_str().unwrap(), &owner.token, file_name, content, None).await;
        assert_eq!(status, StatusCode::CREATED, "{}", dataset);
        dataset
    }
}
