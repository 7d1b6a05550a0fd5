//! Middleware and extractors for HTTP request processing.
//!
//! Cross-cutting concerns live here: authentication, client identification, rate limiting,
//! request validation and security headers.

pub mod auth;
pub mod ip;
pub mod rate_limit;
pub mod security_headers;
pub mod validation;

pub use auth::CurrentUser;
pub use ip::ClientIp;
pub use rate_limit::{EndpointRateLimiter, LimitedEndpoint};
