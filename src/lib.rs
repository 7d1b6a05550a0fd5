//! # fdm
//!
//! Backend library for a file data management service. Users organize research data into
//! projects and folders, upload files into versioned datasets, describe them with typed
//! metadata and publish them to the members of a folder.
//!
//! ## Architecture
//!
//! The application is built using:
//! - **Axum**: HTTP server, routing and extractors
//! - **SQLx**: asynchronous SQLite access
//! - **Tokio**: async runtime for the server and the background workers
//! - **Serde**: JSON request and response bodies
//!
//! ## Core Components
//!
//! - [`config`]: layered configuration (embedded defaults, TOML file, environment)
//! - [`db`]: connection pool and schema
//! - [`error`]: [`error::AppError`] and its mapping onto HTTP responses
//! - [`auth`], [`users`], [`settings`]: accounts, bearer tokens and database settings
//! - [`projects`], [`folders`], [`permissions`]: the project/folder hierarchy and who may do what
//! - [`metadata`]: typed metadata entries, shared fields and templates
//! - [`uploads`]: datasets, versions, version files and their storage
//! - [`locks`]: short-lived edit locks with an event stream
//! - [`file_parser`]: the background worker that checksums, inspects and relocates files
//! - [`mail`]: the mail outbox and its dispatcher
//! - [`search`]: global search
//! - [`content`]: public content pages and the FAQ
//! - [`fixtures`]: JSON dump and load of the configuration data
//! - [`routes`], [`middleware`]: the HTTP surface
//! - [`metrics`], [`state`], [`storage`], [`types`]: shared infrastructure

pub mod auth;
pub mod config;
pub mod content;
pub mod db;
pub mod error;
pub mod file_parser;
pub mod fixtures;
pub mod folders;
pub mod locks;
pub mod mail;
pub mod metadata;
pub mod metrics;
pub mod middleware;
pub mod permissions;
pub mod projects;
pub mod routes;
pub mod search;
pub mod settings;
pub mod state;
pub mod storage;
pub mod types;
pub mod uploads;
pub mod users;

#[cfg(test)]
mod tests;
