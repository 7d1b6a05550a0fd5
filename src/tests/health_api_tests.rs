#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use http_body_util::BodyExt;

    use crate::tests::TestEnv;

    async fn text(env: &TestEnv, uri: &str) -> (StatusCode, String) {
        let response = env.raw(Method::GET, uri, "").await;
        let status = response.status();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        (status, String::from_utf8(bytes.to_vec()).unwrap())
    }

    #[tokio::test]
    async fn test_healthz_endpoint() {
        let env = TestEnv::new().await;
        let (status, body) = text(&env, "/healthz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ok");
    }

    #[tokio::test]
    async fn test_version_endpoint() {
        let env = TestEnv::new().await;
        let (status, body) = text(&env, "/version").await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["name"], "fdm");
        assert!(!v["version"].as_str().unwrap().is_empty());
    }

    #[tokio::test]
    async fn test_readyz_endpoint() {
        let env = TestEnv::new().await;
        let (status, body) = text(&env, "/readyz").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, "ready");

        std::fs::remove_dir_all(env.state.storage.root()).unwrap();
        let (status, body) = text(&env, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("storage root"));

        env.state.db.close().await;
        let (status, body) = text(&env, "/readyz").await;
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
        assert!(body.contains("not ready"));
    }

    #[tokio::test]
    async fn test_metrics_count_uploads() {
        let env = TestEnv::new().await;
        let (status, body) = text(&env, "/metrics").await;
        assert_eq!(status, StatusCode::OK);
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["uploads"], 0);
        assert_eq!(v["bytes_uploaded"], 0);

        let alice = env.user("alice@example.org").await;
        env.draft_with_file(&alice, "hello.txt", b"hello").await;

        let (_, body) = text(&env, "/metrics").await;
        let v: serde_json::Value = serde_json::from_str(&body).unwrap();
        assert_eq!(v["uploads"], 1);
        assert_eq!(v["bytes_uploaded"], 5);
    }

    #[tokio::test]
    async fn test_metrics_prometheus_endpoint() {
        let env = TestEnv::new().await;
        let response = env.raw(Method::GET, "/metrics/prometheus", "").await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(response.headers()["content-type"].to_str().unwrap().starts_with("text/plain"));
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = String::from_utf8(bytes.to_vec()).unwrap();
        assert!(body.contains("fdm_uploads 0"));
        assert!(body.contains("# TYPE fdm_mails_sent counter"));
        assert!(body.contains("# TYPE fdm_uptime_seconds gauge"));
    }
}
