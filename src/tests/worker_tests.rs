#[cfg(test)]
mod tests {
    use std::sync::Mutex;

    use async_trait::async_trait;
    use axum::http::StatusCode;
    use chrono::{Duration, Utc};
    use serde_json::json;
    use uuid::Uuid;

    use crate::auth::{self, TokenKind};
    use crate::file_parser;
    use crate::mail::{self, MailTransport, OutgoingMail};
    use crate::storage::Storage;
    use crate::tests::TestEnv;
    use crate::types::ContentType;
    use crate::uploads;

    const HELLO_SHA256: &str = "2cf24dba5fb0a30e26e83b2ac5b9e29e1b161e5c1fa7425e73043362938b9824";

    #[derive(Default)]
    struct RecordingTransport {
        sent: Mutex<Vec<OutgoingMail>>,
    }

    #[async_trait]
    impl MailTransport for RecordingTransport {
        async fn send(&self, _sender: &str, mail: &OutgoingMail) -> anyhow::Result<()> {
            self.sent.lock().unwrap().push(mail.clone());
            Ok(())
        }
    }

    struct FailingTransport;

    #[async_trait]
    impl MailTransport for FailingTransport {
        async fn send(&self, _sender: &str, _mail: &OutgoingMail) -> anyhow::Result<()> {
            anyhow::bail!("connection refused")
        }
    }

    fn uuid_of(value: &serde_json::Value) -> Uuid {
        Uuid::parse_str(value.as_str().unwrap()).unwrap()
    }

    #[tokio::test]
    async fn tick_checksums_files_and_relocates_published_ones() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let project = env.project(&alice, "Survey").await;
        let folder_id = env.default_folder(&alice, &project).await;
        let dataset = env.draft_with_file(&alice, "hello.txt", b"hello").await;
        let file_id = uuid_of(&dataset["latest_version"]["version_file_id"]);

        let before = uploads::find_file(&env.state.db, file_id).await.unwrap().unwrap();
        assert!(Storage::is_draft_path(&before.stored_path));

        let summary = file_parser::tick(&env.state).await.unwrap();
        assert_eq!(summary.scheduled_files, 1);
        assert_eq!(summary.tasks_finished, 2);
        assert_eq!(summary.tasks_failed, 0);
        assert_eq!(summary.files_relocated, 0);

        let file = uploads::find_file(&env.state.db, file_id).await.unwrap().unwrap();
        assert_eq!(file.status, "FINISHED");
        let values =
            crate::metadata::values_for(&env.state.db, ContentType::UploadsVersionFile, file_id).await.unwrap();
        assert_eq!(values[uploads::CHECKSUM_SHA256], HELLO_SHA256);
        assert_eq!(values[uploads::FILE_SIZE], "5");

        let (status, _) = env
            .post(
                &format!("/api/v1/uploads/datasets/{}/publish", dataset["id"].as_str().unwrap()),
                &alice.token,
                json!({"folder": folder_id}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        let summary = file_parser::tick(&env.state).await.unwrap();
        assert_eq!(summary.files_relocated, 1);
        let moved = uploads::find_file(&env.state.db, file_id).await.unwrap().unwrap();
        assert!(!Storage::is_draft_path(&moved.stored_path));
        assert!(moved.stored_path.contains(&folder_id));
        assert_eq!(moved.storage_relocating, "FINISHED");
        assert!(env.state.storage.metadata(&moved.stored_path).await.is_ok());
        assert!(env.state.storage.metadata(&before.stored_path).await.is_err());

        // The published download now carries the checksum as ETag
        let version_id = dataset["latest_version"]["id"].as_str().unwrap();
        let response = env
            .raw(axum::http::Method::HEAD, &format!("/api/v1/uploads/versions/{}/download", version_id), &alice.token)
            .await;
        assert_eq!(response.headers()["file-checksum-sha256"], HELLO_SHA256);
        assert_eq!(response.headers()["etag"], format!("\"{}\"", HELLO_SHA256).as_str());
    }

    #[tokio::test]
    async fn tick_checks_mandatory_template_fields() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let project = env.project(&alice, "Survey").await;
        let folder_id = env.default_folder(&alice, &project).await;
        let (_, template) = env
            .post(
                "/api/v1/metadata/templates",
                &alice.token,
                json!({
                    "name": "Required",
                    "assigned_to_content_type": "folders.folder",
                    "assigned_to_object_id": folder_id,
                    "metadata_template_fields": [
                        {"custom_key": "station", "field_type": "TEXT", "value": "", "mandatory": true}
                    ]
                }),
            )
            .await;
        env.patch(
            &format!("/api/v1/folders/{}", folder_id),
            &alice.token,
            json!({"metadata_template": template["id"]}),
        )
        .await;

        let dataset = env.draft_with_file(&alice, "a.txt", b"a").await;
        let (_, dataset) = env
            .post(
                &format!("/api/v1/uploads/datasets/{}/publish", dataset["id"].as_str().unwrap()),
                &alice.token,
                json!({"folder": folder_id}),
            )
            .await;
        let version_id = uuid_of(&dataset["latest_version"]["id"]);

        file_parser::tick(&env.state).await.unwrap();
        let version = uploads::find_version(&env.state.db, version_id).await.unwrap().unwrap();
        assert_eq!(version.status, "FINISHED");
        assert!(!version.metadata_is_complete);

        let (status, _) = env
            .patch(
                &format!("/api/v1/uploads/versions/{}", version_id),
                &alice.token,
                json!({"metadata": [{"custom_key": "station", "field_type": "TEXT", "value": "A1"}]}),
            )
            .await;
        assert_eq!(status, StatusCode::OK);
        file_parser::tick(&env.state).await.unwrap();
        let version = uploads::find_version(&env.state.db, version_id).await.unwrap().unwrap();
        assert!(version.metadata_is_complete);
    }

    #[tokio::test]
    async fn expired_drafts_are_purged() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let dataset = env.draft_with_file(&alice, "old.txt", b"old").await;
        let dataset_id = uuid_of(&dataset["id"]);
        let file_id = uuid_of(&dataset["latest_version"]["version_file_id"]);
        let stored = uploads::find_file(&env.state.db, file_id).await.unwrap().unwrap().stored_path;

        sqlx::query("UPDATE uploads_datasets SET expiry_date = ? WHERE id = ?")
            .bind(Utc::now() - Duration::days(1))
            .bind(dataset_id)
            .execute(&env.state.db)
            .await
            .unwrap();

        let summary = file_parser::tick(&env.state).await.unwrap();
        assert_eq!(summary.drafts_removed, 1);
        assert!(uploads::find_dataset(&env.state.db, dataset_id).await.unwrap().is_none());
        assert!(uploads::find_file(&env.state.db, file_id).await.unwrap().is_none());
        assert!(env.state.storage.metadata(&stored).await.is_err());
    }

    #[tokio::test]
    async fn missing_files_mark_the_file_as_failed() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let dataset = env.draft_with_file(&alice, "gone.txt", b"gone").await;
        let file_id = uuid_of(&dataset["latest_version"]["version_file_id"]);
        let stored = uploads::find_file(&env.state.db, file_id).await.unwrap().unwrap().stored_path;
        env.state.storage.remove(&stored).await.unwrap();

        let summary = file_parser::tick(&env.state).await.unwrap();
        assert_eq!(summary.tasks_failed, 2);
        let file = uploads::find_file(&env.state.db, file_id).await.unwrap().unwrap();
        assert_eq!(file.status, "ERROR");
    }

    #[tokio::test]
    async fn tick_forgets_expired_tokens() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let (stale, _) =
            auth::issue_token(&env.state.db, alice.user.id, TokenKind::PasswordReset, Duration::hours(-1)).await.unwrap();

        let summary = file_parser::tick(&env.state).await.unwrap();
        assert_eq!(summary.tokens_removed, 1);
        assert!(auth::resolve_token(&env.state.db, &stale, TokenKind::PasswordReset).await.unwrap().is_none());

        // The live session survives
        let (status, _) = env.get("/api/v1/users/me", &alice.token).await;
        assert_eq!(status, StatusCode::OK);
        let remaining: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM auth_tokens").fetch_one(&env.state.db).await.unwrap();
        assert_eq!(remaining, 1);
    }

    #[tokio::test]
    async fn dispatcher_sends_due_mails() {
        let env = TestEnv::new().await;
        let transport = RecordingTransport::default();
        let id = mail::enqueue_db(&env.state.db, &mail::test_mail("ops@example.org")).await.unwrap();

        let summary = mail::dispatch_due(&env.state.db, &transport, &env.state.config.mail, 10).await.unwrap();
        assert_eq!(summary, mail::DispatchSummary { sent: 1, failed: 0 });
        assert_eq!(transport.sent.lock().unwrap()[0].recipient, "ops@example.org");

        let entry = mail::get_entry(&env.state.db, id).await.unwrap().unwrap();
        assert_eq!(entry.status, mail::STATUS_SENT);
        assert_eq!(entry.attempts, 1);

        // Nothing left to send
        let summary = mail::dispatch_due(&env.state.db, &transport, &env.state.config.mail, 10).await.unwrap();
        assert_eq!(summary.sent, 0);
    }

    #[tokio::test]
    async fn send_entry_delivers_only_the_requested_mail() {
        let env = TestEnv::new().await;
        let transport = RecordingTransport::default();
        let queued = mail::enqueue_db(&env.state.db, &mail::test_mail("queued@example.org")).await.unwrap();
        let test = mail::enqueue_db(&env.state.db, &mail::test_mail("ops@example.org")).await.unwrap();

        assert!(mail::send_entry(&env.state.db, &transport, &env.state.config.mail, test).await.unwrap());
        let sent = transport.sent.lock().unwrap().clone();
        assert_eq!(sent.len(), 1);
        assert_eq!(sent[0].recipient, "ops@example.org");

        let entry = mail::get_entry(&env.state.db, queued).await.unwrap().unwrap();
        assert_eq!(entry.status, mail::STATUS_PENDING);
        assert_eq!(entry.attempts, 0);

        // Already sent
        assert!(mail::send_entry(&env.state.db, &transport, &env.state.config.mail, test).await.is_err());

        assert!(!mail::send_entry(&env.state.db, &FailingTransport, &env.state.config.mail, queued).await.unwrap());
        let entry = mail::get_entry(&env.state.db, queued).await.unwrap().unwrap();
        assert_eq!(entry.attempts, 1);
    }

    #[tokio::test]
    async fn failed_mails_are_retried_then_given_up() {
        let env = TestEnv::with_config("[mail]\nmax_retries = 2\nretry_backoff_secs = 0\n").await;
        let id = mail::enqueue_db(&env.state.db, &mail::test_mail("ops@example.org")).await.unwrap();

        let summary = mail::dispatch_due(&env.state.db, &FailingTransport, &env.state.config.mail, 10).await.unwrap();
        assert_eq!(summary.failed, 1);
        let entry = mail::get_entry(&env.state.db, id).await.unwrap().unwrap();
        assert_eq!(entry.status, mail::STATUS_PENDING);
        assert_eq!(entry.last_error.as_deref(), Some("connection refused"));

        mail::dispatch_due(&env.state.db, &FailingTransport, &env.state.config.mail, 10).await.unwrap();
        let entry = mail::get_entry(&env.state.db, id).await.unwrap().unwrap();
        assert_eq!(entry.status, mail::STATUS_FAILED);
        assert_eq!(entry.attempts, 2);

        let transport = RecordingTransport::default();
        let summary = mail::dispatch_due(&env.state.db, &transport, &env.state.config.mail, 10).await.unwrap();
        assert_eq!(summary.sent, 0);
    }
}
