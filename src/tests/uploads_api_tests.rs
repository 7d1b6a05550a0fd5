#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use http_body_util::BodyExt;
    use serde_json::{json, Value};

    use crate::tests::{TestEnv, TestUser};

    fn id(value: &Value) -> &str {
        value["id"].as_str().unwrap()
    }

    fn file_metadata<'a>(version: &'a Value, key: &str) -> Option<&'a Value> {
        version["version_file"]["metadata"].as_array()?.iter().find(|m| m["key"] == key).map(|m| &m["value"])
    }

    async fn published(env: &TestEnv, owner: &TestUser, content: &[u8]) -> (Value, String) {
        let project = env.project(owner, "Survey").await;
        let folder_id = env.default_folder(owner, &project).await;
        let dataset = env.draft_with_file(owner, "data.csv", content).await;
        let (status, dataset) = env
            .post(&format!("/api/v1/uploads/datasets/{}/publish", id(&dataset)), &owner.token, json!({"folder": folder_id}))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", dataset);
        (dataset, folder_id)
    }

    #[tokio::test]
    async fn upload_creates_a_version_with_file_metadata() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let (status, dataset) = env.post("/api/v1/uploads/datasets", &alice.token, json!({})).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(dataset["display_name"], dataset["id"]);
        assert_eq!(dataset["is_published"], false);
        assert!(dataset["expiry_date"].is_string());

        let (status, dataset) =
            env.upload(id(&dataset), &alice.token, "Field notes.txt", b"hello world", Some("trip/Field notes.txt")).await;
        assert_eq!(status, StatusCode::CREATED, "{}", dataset);
        assert_eq!(dataset["display_name"], "Field notes.txt");
        assert_eq!(dataset["versions_count"], 1);

        let latest = &dataset["latest_version"];
        assert_eq!(latest["is_latest_version"], true);
        assert_eq!(latest["version_file"]["size"], 11);
        assert_eq!(latest["version_file"]["status"], "SCHEDULED");
        assert_eq!(file_metadata(latest, "ORIGINAL_FILE_NAME").unwrap(), "Field notes.txt");
        assert_eq!(file_metadata(latest, "ORIGINAL_FILE_PATH").unwrap(), "trip/Field notes.txt");
        assert_eq!(file_metadata(latest, "MIME_TYPE").unwrap(), "text/plain");

        let (_, drafts) = env.get("/api/v1/uploads/datasets", &alice.token).await;
        assert_eq!(drafts["count"], 1);
    }

    #[tokio::test]
    async fn long_multibyte_file_names_are_stored_shortened() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let (_, dataset) = env.post("/api/v1/uploads/datasets", &alice.token, json!({})).await;
        let original = format!("{}.txt", "数".repeat(100));

        let (status, dataset) = env.upload(id(&dataset), &alice.token, &original, b"hello", None).await;
        assert_eq!(status, StatusCode::CREATED, "{}", dataset);
        let latest = &dataset["latest_version"];
        assert_eq!(file_metadata(latest, "ORIGINAL_FILE_NAME").unwrap(), original.as_str());
        let stored = latest["version_file"]["name"].as_str().unwrap();
        assert!(stored.len() <= 200);
        assert!(stored.ends_with(".txt"));
    }

    #[tokio::test]
    async fn upload_needs_a_file_field() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let (_, dataset) = env.post("/api/v1/uploads/datasets", &alice.token, json!({})).await;

        let (status, body) = env.post(&format!("/api/v1/uploads/datasets/{}/file", id(&dataset)), &alice.token, json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);

        let bob = env.user("bob@example.org").await;
        let (status, _) = env.upload(id(&dataset), &bob.token, "x.txt", b"x", None).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn oversized_uploads_are_rejected() {
        let env = TestEnv::with_config("[uploads]\nmax_upload_bytes = 16\n").await;
        let alice = env.user("alice@example.org").await;
        let (_, dataset) = env.post("/api/v1/uploads/datasets", &alice.token, json!({})).await;

        let (status, _) = env.upload(id(&dataset), &alice.token, "big.bin", &[7u8; 64], None).await;
        assert_eq!(status, StatusCode::PAYLOAD_TOO_LARGE);
        let (_, dataset) = env.get(&format!("/api/v1/uploads/datasets/{}", id(&dataset)), &alice.token).await;
        assert_eq!(dataset["versions_count"], 0);
    }

    #[tokio::test]
    async fn download_streams_the_file_with_headers() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let dataset = env.draft_with_file(&alice, "notes.txt", b"line one\nline two\n").await;
        env.patch(&format!("/api/v1/uploads/datasets/{}", id(&dataset)), &alice.token, json!({"name": "Cruise notes.txt"}))
            .await;
        let version_id = id(&dataset["latest_version"]).to_string();

        let response = env
            .raw(Method::GET, &format!("/api/v1/uploads/versions/{}/download?as_attachment=true", version_id), &alice.token)
            .await;
        assert_eq!(response.status(), StatusCode::OK);
        let headers = response.headers().clone();
        assert_eq!(headers["content-type"], "text/plain");
        assert_eq!(headers["content-length"], "18");
        let disposition = headers["content-disposition"].to_str().unwrap();
        assert!(disposition.starts_with("attachment; filename=\"Cruise notes.txt\""), "{}", disposition);
        assert!(headers.contains_key("last-modified"));
        let body = response.into_body().collect().await.unwrap().to_bytes();
        assert_eq!(&body[..], b"line one\nline two\n");

        let response =
            env.raw(Method::GET, &format!("/api/v1/uploads/versions/{}/download", version_id), &alice.token).await;
        assert!(response.headers()["content-disposition"].to_str().unwrap().starts_with("inline;"));

        let response =
            env.raw(Method::HEAD, &format!("/api/v1/uploads/versions/{}/download", version_id), &alice.token).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(response.headers()["file-size"], "18");
        assert_eq!(response.headers()["file-mime-type"], "text/plain");
        assert_eq!(response.headers()["file-accept-ranges"], "bytes");

        let mallory = env.user("mallory@example.org").await;
        let response =
            env.raw(Method::GET, &format!("/api/v1/uploads/versions/{}/download", version_id), &mallory.token).await;
        assert_eq!(response.status(), StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn publishing_moves_a_draft_into_the_folder() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let (dataset, folder_id) = published(&env, &alice, b"a,b\n1,2\n").await;
        assert_eq!(dataset["is_published"], true);
        assert_eq!(dataset["folder_id"], folder_id.as_str());
        assert!(dataset["expiry_date"].is_null());
        assert!(dataset["latest_version"]["publication_date"].is_string());
        assert_eq!(dataset["latest_version"]["version_file"]["storage_relocating"], "SCHEDULED");

        let (status, _) = env
            .post(&format!("/api/v1/uploads/datasets/{}/publish", id(&dataset)), &alice.token, json!({"folder": folder_id}))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (_, drafts) = env.get("/api/v1/uploads/datasets", &alice.token).await;
        assert_eq!(drafts["count"], 0);
        let (_, in_folder) = env.get(&format!("/api/v1/uploads/datasets?folder={}", folder_id), &alice.token).await;
        assert_eq!(in_folder["count"], 1);
        let (_, folder) = env.get(&format!("/api/v1/folders/{}", folder_id), &alice.token).await;
        assert_eq!(folder["datasets_count"], 1);

        // Published datasets are only deleted by privileged users
        assert_eq!(env.delete(&format!("/api/v1/uploads/datasets/{}", id(&dataset)), &alice.token).await, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn publishing_needs_a_folder_and_edit_rights() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let bob = env.user("bob@example.org").await;
        let project = env.project(&alice, "Survey").await;
        let folder_id = env.default_folder(&alice, &project).await;
        let dataset = env.draft_with_file(&bob, "b.txt", b"bob").await;
        let uri = format!("/api/v1/uploads/datasets/{}/publish", id(&dataset));

        let (status, body) = env.json(Method::POST, &uri, Some(&bob.token), None).await;
        assert_eq!(status, StatusCode::BAD_REQUEST, "{}", body);
        assert_eq!(body["error"]["details"]["field"], "folder");

        let (status, _) = env.post(&uri, &bob.token, json!({"folder": folder_id})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn bulk_operations_report_per_dataset_results() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let project = env.project(&alice, "Survey").await;
        let folder_id = env.default_folder(&alice, &project).await;
        let first = env.draft_with_file(&alice, "1.txt", b"1").await;
        let second = env.draft_with_file(&alice, "2.txt", b"2").await;
        let third = env.draft_with_file(&alice, "3.txt", b"3").await;

        let (status, result) = env
            .post(
                "/api/v1/uploads/datasets/bulk-publish",
                &alice.token,
                json!({"uploads_datasets": [id(&first), id(&second)], "folder": folder_id}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", result);
        assert_eq!(result["success"].as_array().unwrap().len(), 2);
        assert!(result["error"].as_array().unwrap().is_empty());

        let (status, _) = env
            .post("/api/v1/uploads/datasets/bulk-delete", &alice.token, json!({"uploads_datasets": [id(&first), id(&third)]}))
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, result) =
            env.post("/api/v1/uploads/datasets/bulk-delete", &alice.token, json!({"uploads_datasets": [id(&third)]})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(result["success"][0], id(&third));

        let (status, _) = env.post("/api/v1/uploads/datasets/bulk-delete", &alice.token, json!({"uploads_datasets": []})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        let (status, _) = env
            .post("/api/v1/uploads/datasets/bulk-delete", &alice.token, json!({"uploads_datasets": [uuid::Uuid::new_v4()]}))
            .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn versions_carry_metadata_forward_and_can_be_restored() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let dataset = env.draft_with_file(&alice, "v1.txt", b"first").await;
        let dataset_id = id(&dataset).to_string();
        let first_version = id(&dataset["latest_version"]).to_string();

        let (status, version) = env
            .patch(
                &format!("/api/v1/uploads/versions/{}", first_version),
                &alice.token,
                json!({"metadata": [{"custom_key": "station", "field_type": "TEXT", "value": "A1"}]}),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", version);

        let (status, dataset) = env.upload(&dataset_id, &alice.token, "v2.txt", b"second", None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(dataset["versions_count"], 2);
        let second_version = id(&dataset["latest_version"]).to_string();
        assert_eq!(dataset["latest_version"]["metadata"][0]["value"], "A1");

        let (status, version) = env
            .post(
                &format!("/api/v1/uploads/datasets/{}/version", dataset_id),
                &alice.token,
                json!({"name": "Cleaned", "metadata": [{"custom_key": "station", "field_type": "TEXT", "value": "B2"}]}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", version);
        assert_eq!(version["name"], "Cleaned");
        assert_eq!(version["version_file_id"], dataset["latest_version"]["version_file_id"]);

        let (status, diff) = env
            .get(&format!("/api/v1/uploads/versions/{}/diff?compare={}", id(&version), first_version), &alice.token)
            .await;
        assert_eq!(status, StatusCode::OK, "{}", diff);
        assert_eq!(diff["version"]["old"]["id"], first_version.as_str());
        assert_eq!(diff["metadata"][0], json!({"key": "station", "old": "A1", "new": "B2"}));
        assert!(diff["version_file"]["old"]["id"].is_string());

        let (status, _) = env.get(&format!("/api/v1/uploads/versions/{}/diff", id(&version)), &alice.token).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let restore = format!("/api/v1/uploads/datasets/{}/restore", dataset_id);
        let (status, _) = env.post(&restore, &alice.token, json!({"uploads_version": id(&version)})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, _) = env.post(&restore, &alice.token, json!({})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, restored) = env.post(&restore, &alice.token, json!({"uploads_version": first_version})).await;
        assert_eq!(status, StatusCode::CREATED, "{}", restored);
        assert_eq!(restored["is_latest_version"], true);
        assert_eq!(restored["metadata"][0]["value"], "A1");

        let (_, versions) = env.get(&format!("/api/v1/uploads/versions?dataset={}", dataset_id), &alice.token).await;
        assert_eq!(versions["count"], 4);
        assert_eq!(versions["results"][0]["id"], restored["id"]);
        assert_ne!(versions["results"][0]["id"], second_version.as_str());

        let (_, dataset) = env.get(&format!("/api/v1/uploads/datasets/{}", dataset_id), &alice.token).await;
        assert_eq!(dataset["display_name"], "v1.txt");
    }

    #[tokio::test]
    async fn old_published_versions_keep_their_metadata() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let (dataset, _) = published(&env, &alice, b"x").await;
        let old_version = id(&dataset["latest_version"]).to_string();

        let (status, newer) = env.upload(id(&dataset), &alice.token, "data.csv", b"y", None).await;
        assert_eq!(status, StatusCode::CREATED);
        assert!(newer["latest_version"]["publication_date"].is_string());

        let (status, _) = env
            .patch(
                &format!("/api/v1/uploads/versions/{}", old_version),
                &alice.token,
                json!({"metadata": [{"custom_key": "late", "field_type": "TEXT", "value": "edit"}]}),
            )
            .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn version_files_are_visible_through_their_versions() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let mallory = env.user("mallory@example.org").await;
        let dataset = env.draft_with_file(&alice, "a.txt", b"abc").await;
        let file_id = dataset["latest_version"]["version_file_id"].as_str().unwrap();

        let (status, file) = env.get(&format!("/api/v1/uploads/version-files/{}", file_id), &alice.token).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(file["name"], "a.txt");
        assert!(file["metadata"].as_array().unwrap().iter().all(|m| m["read_only"] == true));

        let (status, _) = env.get(&format!("/api/v1/uploads/version-files/{}", file_id), &mallory.token).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, _) = env.get("/api/v1/uploads/versions", &alice.token).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn template_metadata_is_applied_on_publish() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let project = env.project(&alice, "Survey").await;
        let folder_id = env.default_folder(&alice, &project).await;
        let (status, template) = env
            .post(
                "/api/v1/metadata/templates",
                &alice.token,
                json!({
                    "name": "Defaults",
                    "assigned_to_content_type": "folders.folder",
                    "assigned_to_object_id": folder_id,
                    "metadata_template_fields": [
                        {"custom_key": "license", "field_type": "TEXT", "value": "CC-BY"},
                        {"custom_key": "station", "field_type": "TEXT", "value": "default", "mandatory": true}
                    ]
                }),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", template);
        let (status, _) =
            env.patch(&format!("/api/v1/folders/{}", folder_id), &alice.token, json!({"metadata_template": id(&template)})).await;
        assert_eq!(status, StatusCode::OK);

        let dataset = env.draft_with_file(&alice, "d.txt", b"d").await;
        env.patch(
            &format!("/api/v1/uploads/versions/{}", id(&dataset["latest_version"])),
            &alice.token,
            json!({"metadata": [{"custom_key": "station", "field_type": "TEXT", "value": "C3"}]}),
        )
        .await;

        let (status, dataset) = env
            .post(&format!("/api/v1/uploads/datasets/{}/publish", id(&dataset)), &alice.token, json!({"folder": folder_id}))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", dataset);
        assert_eq!(dataset["versions_count"], 2);
        let metadata = dataset["latest_version"]["metadata"].as_array().unwrap();
        let value = |key: &str| metadata.iter().find(|m| m["key"] == key).map(|m| m["value"].clone());
        assert_eq!(value("license"), Some(json!("CC-BY")));
        assert_eq!(value("station"), Some(json!("C3")));
    }

    #[tokio::test]
    async fn publishing_into_a_templated_folder_always_adds_a_version() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let project = env.project(&alice, "Survey").await;
        let folder_id = env.default_folder(&alice, &project).await;
        let (_, template) = env
            .post(
                "/api/v1/metadata/templates",
                &alice.token,
                json!({
                    "name": "Stations",
                    "assigned_to_content_type": "folders.folder",
                    "assigned_to_object_id": folder_id,
                    "metadata_template_fields": [{"custom_key": "station", "field_type": "TEXT", "value": "default"}]
                }),
            )
            .await;
        env.patch(&format!("/api/v1/folders/{}", folder_id), &alice.token, json!({"metadata_template": id(&template)}))
            .await;

        let dataset = env.draft_with_file(&alice, "d.txt", b"d").await;
        env.patch(
            &format!("/api/v1/uploads/versions/{}", id(&dataset["latest_version"])),
            &alice.token,
            json!({"metadata": [{"custom_key": "station", "field_type": "TEXT", "value": "C3"}]}),
        )
        .await;

        // Every template key is already set on the draft
        let (status, published) = env
            .post(&format!("/api/v1/uploads/datasets/{}/publish", id(&dataset)), &alice.token, json!({"folder": folder_id}))
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", published);
        assert_eq!(published["versions_count"], 2);
        assert_ne!(published["latest_version"]["id"], dataset["latest_version"]["id"]);
        let metadata = published["latest_version"]["metadata"].as_array().unwrap();
        let station = metadata.iter().find(|m| m["key"] == "station").unwrap();
        assert_eq!(station["value"], "C3");
    }
}
