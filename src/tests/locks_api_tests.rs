#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use uuid::Uuid;

    use crate::tests::TestEnv;
    use crate::types::{ContentType, LockEvent};

    #[tokio::test]
    async fn lock_blocks_other_editors_until_released() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let bob = env.user("bob@example.org").await;
        let project = env.project(&alice, "Survey").await;
        let project_id = project["id"].as_str().unwrap();
        env.put(
            &format!("/api/v1/projects/{}/members", project_id),
            &alice.token,
            json!({"project_users": [{"email": "bob@example.org", "is_project_admin": true}]}),
        )
        .await;

        let (status, lock) = env.post(&format!("/api/v1/projects/{}/lock", project_id), &alice.token, json!({})).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(lock["locked"], true);
        assert_eq!(lock["locked_by"]["email"], "alice@example.org");

        let (_, status_body) = env.get(&format!("/api/v1/projects/{}/status", project_id), &bob.token).await;
        assert_eq!(status_body["locked"], true);

        let (status, _) =
            env.patch(&format!("/api/v1/projects/{}", project_id), &bob.token, json!({"name": "Mine"})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = env.post(&format!("/api/v1/projects/{}/lock", project_id), &bob.token, json!({})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = env.post(&format!("/api/v1/projects/{}/unlock", project_id), &bob.token, json!({})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        // Saving releases the holder's own lock
        let (status, _) =
            env.patch(&format!("/api/v1/projects/{}", project_id), &alice.token, json!({"name": "Survey 2"})).await;
        assert_eq!(status, StatusCode::OK);
        let (_, status_body) = env.get(&format!("/api/v1/projects/{}/status", project_id), &bob.token).await;
        assert_eq!(status_body["locked"], false);
        assert!(status_body["locked_by"].is_null());
    }

    #[tokio::test]
    async fn unlock_is_idempotent_for_the_holder() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let project = env.project(&alice, "Survey").await;
        let folder_id = env.default_folder(&alice, &project).await;

        let uri = format!("/api/v1/folders/{}/lock", folder_id);
        assert_eq!(env.post(&uri, &alice.token, json!({})).await.0, StatusCode::CREATED);
        // Locking again refreshes the caller's own lock
        assert_eq!(env.post(&uri, &alice.token, json!({})).await.0, StatusCode::CREATED);

        let unlock = format!("/api/v1/folders/{}/unlock", folder_id);
        let (status, body) = env.post(&unlock, &alice.token, json!({})).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["locked"], false);
        let (status, body) = env.post(&unlock, &alice.token, json!({})).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["locked"], false);
    }

    #[tokio::test]
    async fn expired_locks_are_released() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let bob = env.user("bob@example.org").await;
        let project = env.project(&alice, "Survey").await;
        let project_id = project["id"].as_str().unwrap();
        env.put(
            &format!("/api/v1/projects/{}/members", project_id),
            &alice.token,
            json!({"project_users": [{"email": "bob@example.org", "is_project_admin": true}]}),
        )
        .await;
        env.post(&format!("/api/v1/projects/{}/lock", project_id), &alice.token, json!({})).await;

        let stale = Utc::now() - Duration::hours(2);
        sqlx::query("UPDATE projects SET locked_at = ? WHERE id = ?")
            .bind(stale)
            .bind(Uuid::parse_str(project_id).unwrap())
            .execute(&env.state.db)
            .await
            .unwrap();

        let (status, lock) = env.post(&format!("/api/v1/projects/{}/lock", project_id), &bob.token, json!({})).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(lock["locked_by"]["email"], "bob@example.org");
    }

    #[tokio::test]
    async fn lock_endpoints_hide_invisible_entities() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let mallory = env.user("mallory@example.org").await;
        let project = env.project(&alice, "Survey").await;
        let project_id = project["id"].as_str().unwrap();

        let (status, _) = env.get(&format!("/api/v1/projects/{}/status", project_id), &mallory.token).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = env.post(&format!("/api/v1/projects/{}/lock", project_id), &mallory.token, json!({})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = env.get(&format!("/api/v1/uploads/datasets/{}/status", Uuid::new_v4()), &alice.token).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn lock_changes_are_broadcast() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let dataset = env.draft_with_file(&alice, "a.txt", b"hello").await;
        let dataset_id = dataset["id"].as_str().unwrap();
        let mut events = env.state.lock_events.subscribe();

        env.post(&format!("/api/v1/uploads/datasets/{}/lock", dataset_id), &alice.token, json!({})).await;
        env.post(&format!("/api/v1/uploads/datasets/{}/unlock", dataset_id), &alice.token, json!({})).await;

        let pk = Uuid::parse_str(dataset_id).unwrap();
        let locked = events.recv().await.unwrap();
        assert_eq!(
            locked,
            LockEvent { content_type: ContentType::UploadsDataset, pk, status: true, user: Some(alice.user.id) }
        );
        let unlocked = events.recv().await.unwrap();
        assert!(!unlocked.status);
        assert_eq!(serde_json::to_value(&unlocked).unwrap()["content_type"], "uploads.uploadsdataset");
    }

    #[tokio::test]
    async fn event_stream_is_served_as_sse() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let response = env.raw(axum::http::Method::GET, "/api/v1/events/locks", &alice.token).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["content-type"], "text/event-stream");
    }
}
