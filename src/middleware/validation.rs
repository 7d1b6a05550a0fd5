use std::sync::Arc;

use axum::{
    extract::{Request, State},
    http::Method,
    middleware::Next,
    response::{IntoResponse, Response},
};

use crate::config::AppConfig;
use crate::error::AppError;

/// Rejects requests with traversal sequences in the URI and bodies above the configured limit.
///
/// File uploads (`.../file`) are measured against `uploads.max_upload_bytes`, everything else
/// against `server.max_body_bytes`. Suspicious user agents are only logged.
pub async fn validate_request_middleware(
    State(cfg): State<Arc<AppConfig>>,
    req: Request,
    next: Next,
) -> Response {
    let uri_path = req.uri().path();
    if contains_path_traversal(uri_path) {
        return AppError::bad_request("Path traversal detected in request").into_response();
    }

    if let Some(user_agent) = req.headers().get("user-agent") {
        if let Ok(ua_str) = user_agent.to_str() {
            if is_suspicious_user_agent(ua_str) {
                tracing::warn!("Suspicious user agent detected: {}", sanitize_for_logging(ua_str));
            }
        }
    }

    if matches!(req.method(), &Method::POST | &Method::PUT | &Method::PATCH) {
        let limit = body_limit_for(&cfg, uri_path);
        let declared = req
            .headers()
            .get("content-length")
            .and_then(|v| v.to_str().ok())
            .and_then(|v| v.parse::<u64>().ok());
        if let Some(length) = declared {
            if length > limit {
                return AppError::PayloadTooLarge(format!("Request body exceeds maximum size of {} bytes", limit))
                    .into_response();
            }
        }
    }

    next.run(req).await
}

pub fn is_upload_path(path: &str) -> bool {
    path.starts_with("/api/v1/uploads/datasets/") && path.ends_with("/file")
}

pub fn body_limit_for(cfg: &AppConfig, path: &str) -> u64 {
    if is_upload_path(path) {
        cfg.uploads.max_upload_bytes
    } else {
        cfg.server.max_body_bytes as u64
    }
}

/// Detects directory traversal sequences, including URL-encoded variants.
fn contains_path_traversal(path: &str) -> bool {
    let lower = path.to_lowercase();

    if path.contains("/..") || path.contains("\\..") || path.starts_with("..") {
        return true;
    }
    if path.contains("/./") || path.contains("\\.\\") || path.contains("....") {
        return true;
    }

    const ENCODED_PATTERNS: [&str; 11] = [
        "%2e%2e", "%252e%252e", "%2e/", "%252e%2f", "/%2e", "%2f%2e", "%2e\\", "%2e%5c", "%5c%2e", "%5c%5c", "%00",
    ];
    if ENCODED_PATTERNS.iter().any(|p| lower.contains(p)) {
        return true;
    }

    path.contains('\0')
}

fn is_suspicious_user_agent(ua: &str) -> bool {
    let ua_lower = ua.to_lowercase();
    ua_lower.contains("scanner")
        || (ua_lower.contains("crawler") && !ua_lower.contains("googlebot") && !ua_lower.contains("bingbot"))
        || ua_lower.contains("nikto")
        || ua_lower.contains("sqlmap")
        || ua_lower.contains("havij")
        || ua_lower.contains("acunetix")
}

/// Strips control characters and caps the length of user input before it reaches the log.
pub fn sanitize_for_logging(input: &str) -> String {
    input
        .chars()
        .filter(|c| !c.is_control() || c.is_whitespace())
        .take(200)
        .collect::<String>()
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\'', "\\\'")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_path_traversal_detection() {
        assert!(contains_path_traversal("../etc/passwd"));
        assert!(contains_path_traversal("/api/v1/../etc"));
        assert!(contains_path_traversal("/api/v1/%2e%2e/etc"));
        assert!(contains_path_traversal("path\0with\0null"));

        assert!(!contains_path_traversal("/api/v1/projects"));
        assert!(!contains_path_traversal("/api/v1/uploads/versions/5c3e/download"));
    }

    #[test]
    fn test_suspicious_user_agents() {
        assert!(is_suspicious_user_agent("nikto/2.1.5"));
        assert!(is_suspicious_user_agent("sqlmap/1.0"));
        assert!(!is_suspicious_user_agent("Mozilla/5.0 (Windows NT 10.0; Win64; x64)"));
        assert!(!is_suspicious_user_agent("Googlebot/2.1"));
    }

    #[test]
    fn uploads_use_their_own_limit() {
        let cfg = AppConfig::default();
        assert!(is_upload_path("/api/v1/uploads/datasets/abc/file"));
        assert!(!is_upload_path("/api/v1/uploads/datasets/abc/version"));
        assert_eq!(body_limit_for(&cfg, "/api/v1/uploads/datasets/abc/file"), cfg.uploads.max_upload_bytes);
        assert_eq!(body_limit_for(&cfg, "/api/v1/projects"), cfg.server.max_body_bytes as u64);
    }

    #[test]
    fn test_sanitize_for_logging() {
        assert_eq!(sanitize_for_logging("normal text"), "normal text");
        let sanitized = sanitize_for_logging("text\x00with\x01control");
        assert!(!sanitized.contains('\x00'));
        assert!(!sanitized.contains('\x01'));
        assert_eq!(sanitize_for_logging(&"a".repeat(300)).len(), 200);
    }
}
