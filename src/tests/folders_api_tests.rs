#[cfg(test)]
mod tests {
    use axum::http::StatusCode;
    use serde_json::{json, Value};

    use crate::tests::{TestEnv, TestUser};

    async fn project_with_member(env: &TestEnv, owner: &TestUser, member_email: &str) -> (String, String) {
        let project = env.project(owner, "Survey").await;
        let project_id = project["id"].as_str().unwrap().to_string();
        env.put(
            &format!("/api/v1/projects/{}/members", project_id),
            &owner.token,
            json!({"project_users": [{"email": member_email, "can_create_folders": true}]}),
        )
        .await;
        let folder_id = env.default_folder(owner, &project).await;
        (project_id, folder_id)
    }

    fn permission_of<'a>(permissions: &'a Value, email: &str) -> &'a Value {
        permissions.as_array().unwrap().iter().find(|p| p["member"]["email"] == email).unwrap()
    }

    #[tokio::test]
    async fn folder_creators_and_project_admins_get_full_permissions() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let bob = env.user("bob@example.org").await;
        let (project_id, _) = project_with_member(&env, &alice, "bob@example.org").await;

        let (status, folder) =
            env.post("/api/v1/folders", &bob.token, json!({"project": project_id, "name": "Raw data"})).await;
        assert_eq!(status, StatusCode::CREATED, "{}", folder);
        assert_eq!(folder["members_count"], 2);
        assert_eq!(folder["permission"]["is_folder_admin"], true);

        let (_, permissions) =
            env.get(&format!("/api/v1/folder-permissions?folder={}", folder["id"].as_str().unwrap()), &alice.token).await;
        let alice_permission = permission_of(&permissions["results"], "alice@example.org");
        assert_eq!(alice_permission["is_folder_admin"], true);
        assert_eq!(alice_permission["role"], "Admin");
    }

    #[tokio::test]
    async fn folder_creation_needs_the_project_flag() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let carol = env.user("carol@example.org").await;
        let project = env.project(&alice, "Survey").await;
        let project_id = project["id"].as_str().unwrap();
        env.put(
            &format!("/api/v1/projects/{}/members", project_id),
            &alice.token,
            json!({"project_users": [{"email": "carol@example.org"}]}),
        )
        .await;

        let (status, _) = env.post("/api/v1/folders", &carol.token, json!({"project": project_id, "name": "X"})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let stranger = env.user("dave@example.org").await;
        let (status, _) = env.post("/api/v1/folders", &stranger.token, json!({"project": project_id, "name": "X"})).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn unavailable_templates_reject_folder_creation_without_side_effects() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let project = env.project(&alice, "Survey").await;
        let project_id = project["id"].as_str().unwrap();

        let (status, body) = env
            .post(
                "/api/v1/folders",
                &alice.token,
                json!({"project": project_id, "name": "Orphan", "metadata_template": uuid::Uuid::new_v4()}),
            )
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["details"]["field"], "metadata_template");
        let orphans: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM folders WHERE name = 'Orphan'")
            .fetch_one(&env.state.db)
            .await
            .unwrap();
        assert_eq!(orphans, 0);

        let (_, template) = env
            .post(
                "/api/v1/metadata/templates",
                &alice.token,
                json!({
                    "name": "Cruise",
                    "assigned_to_content_type": "projects.project",
                    "assigned_to_object_id": project_id,
                    "metadata_template_fields": []
                }),
            )
            .await;
        let (status, folder) = env
            .post(
                "/api/v1/folders",
                &alice.token,
                json!({"project": project_id, "name": "Stations", "metadata_template": template["id"]}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED, "{}", folder);
        assert_eq!(folder["metadata_template"], template["id"]);
    }

    #[tokio::test]
    async fn folders_are_listed_by_permission() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let bob = env.user("bob@example.org").await;
        let (project_id, _) = project_with_member(&env, &alice, "bob@example.org").await;
        env.post("/api/v1/folders", &alice.token, json!({"project": project_id, "name": "Archive"})).await;

        let (_, mine) = env.get(&format!("/api/v1/folders?project={}", project_id), &alice.token).await;
        let names: Vec<&str> = mine["results"].as_array().unwrap().iter().map(|f| f["name"].as_str().unwrap()).collect();
        assert_eq!(names, vec!["Archive", "General"]);

        let (_, bobs) = env.get("/api/v1/folders", &bob.token).await;
        assert_eq!(bobs["count"], 0);
    }

    #[tokio::test]
    async fn folder_patch_and_delete() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let bob = env.user("bob@example.org").await;
        let (_, folder_id) = project_with_member(&env, &alice, "bob@example.org").await;
        env.put(
            &format!("/api/v1/folders/{}/permissions", folder_id),
            &alice.token,
            json!({"folder_users": [{"email": "bob@example.org", "can_edit": true}]}),
        )
        .await;

        let (status, _) = env.patch(&format!("/api/v1/folders/{}", folder_id), &bob.token, json!({"name": "Mine"})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);
        let (status, folder) =
            env.patch(&format!("/api/v1/folders/{}", folder_id), &alice.token, json!({"name": "Renamed"})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(folder["name"], "Renamed");

        assert_eq!(env.delete(&format!("/api/v1/folders/{}", folder_id), &bob.token).await, StatusCode::FORBIDDEN);
        assert_eq!(env.delete(&format!("/api/v1/folders/{}", folder_id), &alice.token).await, StatusCode::NO_CONTENT);
    }

    #[tokio::test]
    async fn folders_with_datasets_cannot_be_deleted() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let project = env.project(&alice, "Survey").await;
        let folder_id = env.default_folder(&alice, &project).await;
        let dataset = env.draft_with_file(&alice, "data.csv", b"a,b\n1,2\n").await;
        let (status, _) = env
            .post(
                &format!("/api/v1/uploads/datasets/{}/publish", dataset["id"].as_str().unwrap()),
                &alice.token,
                json!({"folder": folder_id}),
            )
            .await;
        assert_eq!(status, StatusCode::CREATED);

        assert_eq!(env.delete(&format!("/api/v1/folders/{}", folder_id), &alice.token).await, StatusCode::FORBIDDEN);
        let (_, project) = env.get(&format!("/api/v1/projects/{}", project["id"].as_str().unwrap()), &alice.token).await;
        assert_eq!(project["is_deletable"], false);
        assert_eq!(
            env.delete(&format!("/api/v1/projects/{}", project["id"].as_str().unwrap()), &alice.token).await,
            StatusCode::FORBIDDEN
        );
    }

    #[tokio::test]
    async fn syncing_permissions_keeps_project_admins() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let (project_id, folder_id) = project_with_member(&env, &alice, "bob@example.org").await;
        let uri = format!("/api/v1/folders/{}/permissions", folder_id);

        let (status, permissions) = env
            .put(
                &uri,
                &alice.token,
                json!({"folder_users": [
                    {"email": "bob@example.org", "can_edit": true},
                    {"email": "erin@example.org", "is_metadata_template_admin": true}
                ]}),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", permissions);
        assert_eq!(permissions.as_array().unwrap().len(), 3);
        assert_eq!(permission_of(&permissions, "alice@example.org")["is_folder_admin"], true);
        assert_eq!(permission_of(&permissions, "bob@example.org")["role"], "Editor");
        assert_eq!(permission_of(&permissions, "erin@example.org")["role"], "Metadata template admin");

        // erin became a plain project member on the way
        let (_, memberships) = env.get(&format!("/api/v1/project-memberships?project={}", project_id), &alice.token).await;
        assert_eq!(memberships["count"], 3);

        let (_, permissions) = env.put(&uri, &alice.token, json!({"folder_users": []})).await;
        assert_eq!(permissions.as_array().unwrap().len(), 1);
        assert_eq!(permissions[0]["member"]["email"], "alice@example.org");
    }

    #[tokio::test]
    async fn project_admin_permissions_cannot_be_downgraded() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let (_, folder_id) = project_with_member(&env, &alice, "bob@example.org").await;
        let (_, permissions) = env.get(&format!("/api/v1/folder-permissions?folder={}", folder_id), &alice.token).await;
        let id = permission_of(&permissions["results"], "alice@example.org")["id"].as_str().unwrap().to_string();

        let (status, permission) =
            env.patch(&format!("/api/v1/folder-permissions/{}", id), &alice.token, json!({"can_edit": true})).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(permission["is_folder_admin"], true);

        let (status, _) = env.get(&format!("/api/v1/folder-permissions/{}", id), &alice.token).await;
        assert_eq!(status, StatusCode::OK);
    }

    #[tokio::test]
    async fn folder_permission_endpoints_check_visibility() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let bob = env.user("bob@example.org").await;
        let (_, folder_id) = project_with_member(&env, &alice, "bob@example.org").await;
        let (_, permissions) = env.get(&format!("/api/v1/folder-permissions?folder={}", folder_id), &alice.token).await;
        let id = permissions["results"][0]["id"].as_str().unwrap().to_string();

        let (status, _) = env.get(&format!("/api/v1/folder-permissions/{}", id), &bob.token).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, _) = env.get(&format!("/api/v1/folder-permissions?folder={}", folder_id), &bob.token).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }
}
