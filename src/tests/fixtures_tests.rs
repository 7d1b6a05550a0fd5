#[cfg(test)]
mod tests {
    use serde_json::json;

    use crate::fixtures::{self, FixtureRecord};
    use crate::tests::TestEnv;

    async fn populated() -> TestEnv {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let root = env.superuser("root@example.org").await;
        let project = env.project(&alice, "Survey").await;
        env.put(
            &format!("/api/v1/projects/{}/members", project["id"].as_str().unwrap()),
            &alice.token,
            json!({"project_users": [{"email": "bob@example.org", "can_create_folders": true}]}),
        )
        .await;
        env.post(
            "/api/v1/metadata/templates",
            &root.token,
            json!({"name": "Cruise", "metadata_template_fields": [
                {"field": {"key": "vessel", "field_type": "TEXT"}, "value": "Poseidon", "mandatory": true}
            ]}),
        )
        .await;
        env.put("/api/v1/settings/max_lock_time", &root.token, json!({"value": 5, "public": true})).await;
        env
    }

    fn count(records: &[FixtureRecord], model: &str) -> usize {
        records.iter().filter(|r| r.model == model).count()
    }

    #[tokio::test]
    async fn dump_covers_configuration_but_no_secrets() {
        let env = populated().await;
        let records = fixtures::dump(&env.state.db).await.unwrap();

        assert_eq!(count(&records, "users.user"), 3);
        assert_eq!(count(&records, "projects.project"), 1);
        assert_eq!(count(&records, "projects.projectmembership"), 2);
        assert_eq!(count(&records, "folders.folder"), 1);
        assert_eq!(count(&records, "folders.folderpermission"), 1);
        assert_eq!(count(&records, "metadata.metadatatemplate"), 1);
        assert_eq!(count(&records, "metadata.metadatatemplatefield"), 1);
        assert_eq!(count(&records, "metadata.metadatafield"), 1);
        assert_eq!(count(&records, "dbsettings.setting"), 1);
        assert!(records.iter().all(|r| !r.fields.contains_key("password_hash")));

        // Users come before anything that points at them
        let first_project = records.iter().position(|r| r.model == "projects.project").unwrap();
        let last_user = records.iter().rposition(|r| r.model == "users.user").unwrap();
        assert!(last_user < first_project);
    }

    #[tokio::test]
    async fn load_reproduces_a_dump_and_is_idempotent() {
        let source = populated().await;
        let records = fixtures::dump(&source.state.db).await.unwrap();
        let json = serde_json::to_string_pretty(&records).unwrap();
        let parsed: Vec<FixtureRecord> = serde_json::from_str(&json).unwrap();

        let target = TestEnv::new().await;
        assert_eq!(fixtures::load(&target.state.db, &parsed).await.unwrap(), records.len());
        assert_eq!(fixtures::dump(&target.state.db).await.unwrap(), records);

        fixtures::load(&target.state.db, &parsed).await.unwrap();
        assert_eq!(fixtures::dump(&target.state.db).await.unwrap(), records);
    }

    #[tokio::test]
    async fn load_updates_only_the_given_fields() {
        let env = populated().await;
        let records = fixtures::dump(&env.state.db).await.unwrap();
        let project = records.iter().find(|r| r.model == "projects.project").unwrap();
        let mut fields = serde_json::Map::new();
        fields.insert("name".to_string(), json!("Renamed"));
        let patch = FixtureRecord { model: project.model.clone(), pk: project.pk.clone(), fields };

        fixtures::load(&env.state.db, &[patch]).await.unwrap();
        let after = fixtures::dump(&env.state.db).await.unwrap();
        let reloaded = after.iter().find(|r| r.pk == project.pk).unwrap();
        assert_eq!(reloaded.fields["name"], "Renamed");
        assert_eq!(reloaded.fields["created_by"], project.fields["created_by"]);
    }

    #[tokio::test]
    async fn bad_records_roll_back_the_whole_load() {
        let env = TestEnv::new().await;
        let good = FixtureRecord {
            model: "dbsettings.setting".to_string(),
            pk: json!("MAX_LOCK_TIME"),
            fields: serde_json::from_value(json!({"value": "10", "description": "", "public": true})).unwrap(),
        };
        let unknown = FixtureRecord { model: "uploads.uploadsdataset".to_string(), pk: json!("x"), fields: Default::default() };

        let err = fixtures::load(&env.state.db, &[good.clone(), unknown]).await.unwrap_err();
        assert!(format!("{:#}", err).contains("unknown model"));
        assert!(fixtures::dump(&env.state.db).await.unwrap().is_empty());

        let bad_uuid = FixtureRecord { model: "users.user".to_string(), pk: json!("not-a-uuid"), fields: Default::default() };
        assert!(fixtures::load(&env.state.db, &[bad_uuid]).await.is_err());
    }
}
