#[cfg(test)]
mod tests {
    use axum::http::{Method, StatusCode};
    use serde_json::json;

    use crate::fixtures;
    use crate::tests::TestEnv;

    async fn public_get(env: &TestEnv, uri: &str) -> (StatusCode, serde_json::Value) {
        env.json(Method::GET, uri, None, None).await
    }

    #[tokio::test]
    async fn default_pages_exist_but_stay_hidden_until_published() {
        let env = TestEnv::new().await;
        let (status, body) = public_get(&env, "/api/v1/cms/slugs").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["slugs"], json!([]));

        let (status, _) = public_get(&env, "/api/v1/cms/privacy-policy").await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let root = env.superuser("root@example.org").await;
        let (status, body) = env
            .put(
                "/api/v1/cms/privacy-policy",
                &root.token,
                json!({"name": "Privacy policy", "published": true, "text_de": "# Datenschutz\nZeile", "text_en": "We keep *little*."}),
            )
            .await;
        assert_eq!(status, StatusCode::OK, "{}", body);

        let (_, body) = public_get(&env, "/api/v1/cms/slugs").await;
        assert_eq!(body["slugs"], json!(["privacy-policy"]));

        let (status, body) = public_get(&env, "/api/v1/cms/privacy-policy").await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["name"], "Privacy policy");
        assert!(body["text_de_html"].as_str().unwrap().contains("<h1>Datenschutz</h1>"));
        assert!(body["text_en_html"].as_str().unwrap().contains("<em>little</em>"));
        assert_eq!(body["last_modified_by"], json!(root.user.id));

        // Same row, not a second page
        let pages: i64 =
            sqlx::query_scalar("SELECT COUNT(*) FROM cms_content").fetch_one(&env.state.db).await.unwrap();
        assert_eq!(pages, 3);
    }

    #[tokio::test]
    async fn pages_are_edited_by_superusers_only_and_never_deleted() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let root = env.superuser("root@example.org").await;

        let (status, _) =
            env.put("/api/v1/cms/imprint", &alice.token, json!({"name": "Imprint", "published": true})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = env.put("/api/v1/cms/Imprint", &root.token, json!({"name": "Imprint"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["details"]["field"], "slug");

        let (status, _) = env.put("/api/v1/cms/imprint", &root.token, json!({"name": " "})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _) = env.put("/api/v1/cms/imprint", &root.token, json!({"name": "Imprint"})).await;
        assert_eq!(status, StatusCode::OK);

        let status = env.delete("/api/v1/cms/imprint", &root.token).await;
        assert_eq!(status, StatusCode::METHOD_NOT_ALLOWED);
        let removed = sqlx::query("DELETE FROM cms_content WHERE slug = 'imprint'").execute(&env.state.db).await;
        assert!(removed.is_err());
    }

    #[tokio::test]
    async fn faq_lists_only_published_entries_in_order() {
        let env = TestEnv::new().await;
        let root = env.superuser("root@example.org").await;

        let (status, general) =
            env.post("/api/v1/faq-category", &root.token, json!({"name": "General", "order": 2, "published": true})).await;
        assert_eq!(status, StatusCode::CREATED, "{}", general);
        assert_eq!(general["slug"], "general");
        let (_, uploads) =
            env.post("/api/v1/faq-category", &root.token, json!({"name": "Uploads", "order": 1, "published": true})).await;
        let (_, hidden) = env.post("/api/v1/faq-category", &root.token, json!({"name": "Drafts", "order": 0})).await;

        let faq = |question: &str, category: &serde_json::Value, order: i64, published: bool| {
            json!({"question": question, "answer": "Yes.", "category": category["pk"], "order": order, "published": published})
        };
        for body in [
            faq("How big may a file be?", &uploads, 1, true),
            faq("Can I upload folders?", &uploads, 0, true),
            faq("Who can see my data?", &general, 0, true),
            faq("Is this visible?", &general, 1, false),
            faq("Hidden category entry", &hidden, 0, true),
        ] {
            let (status, created) = env.post("/api/v1/faq", &root.token, body).await;
            assert_eq!(status, StatusCode::CREATED, "{}", created);
        }
        let (_, loose) = env
            .post("/api/v1/faq", &root.token, json!({"question": "Where is the imprint?", "published": true}))
            .await;
        assert_eq!(loose["slug"], "where-is-the-imprint");
        assert!(loose["category"].is_null());

        let (status, body) = public_get(&env, "/api/v1/faq-category").await;
        assert_eq!(status, StatusCode::OK);
        let names: Vec<&str> = body.as_array().unwrap().iter().map(|c| c["name"].as_str().unwrap()).collect();
        assert_eq!(names, ["Uploads", "General"]);
        assert_eq!(body[0]["faq"][0]["question"], "Can I upload folders?");
        assert_eq!(body[1]["faq"].as_array().unwrap().len(), 1);

        let (_, body) = public_get(&env, "/api/v1/faq").await;
        let questions: Vec<&str> = body.as_array().unwrap().iter().map(|f| f["question"].as_str().unwrap()).collect();
        assert_eq!(
            questions,
            ["Can I upload folders?", "How big may a file be?", "Who can see my data?", "Where is the imprint?"]
        );
        assert_eq!(body[0]["category"]["name"], "Uploads");
        assert!(body[3]["category"].is_null());

        let (status, _) = public_get(&env, &format!("/api/v1/faq-category/{}", hidden["pk"].as_str().unwrap())).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
        let (status, body) = public_get(&env, &format!("/api/v1/faq/{}", loose["pk"].as_str().unwrap())).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["answer"], json!(null));
    }

    #[tokio::test]
    async fn faq_creation_is_validated() {
        let env = TestEnv::new().await;
        let alice = env.user("alice@example.org").await;
        let root = env.superuser("root@example.org").await;

        let (status, _) = env.post("/api/v1/faq", &alice.token, json!({"question": "Why?"})).await;
        assert_eq!(status, StatusCode::FORBIDDEN);

        let (status, body) = env
            .post("/api/v1/faq", &root.token, json!({"question": "Why?", "category": uuid::Uuid::new_v4()}))
            .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["details"]["field"], "category");

        let (status, _) = env.post("/api/v1/faq", &root.token, json!({"question": "Why?"})).await;
        assert_eq!(status, StatusCode::CREATED);
        let (status, _) = env.post("/api/v1/faq", &root.token, json!({"question": "Why?!"})).await;
        assert_eq!(status, StatusCode::CONFLICT);

        let (status, body) = env.post("/api/v1/faq-category", &root.token, json!({"name": "???"})).await;
        assert_eq!(status, StatusCode::BAD_REQUEST);
        assert_eq!(body["error"]["details"]["field"], "slug");
    }

    #[tokio::test]
    async fn content_travels_with_fixtures() {
        let source = TestEnv::new().await;
        let root = source.superuser("root@example.org").await;
        source
            .put("/api/v1/cms/accessibility", &root.token, json!({"name": "Accessibility", "published": true, "text_en": "Hi"}))
            .await;
        source.post("/api/v1/faq-category", &root.token, json!({"name": "General", "published": true})).await;
        let records = fixtures::dump(&source.state.db).await.unwrap();
        assert_eq!(records.iter().filter(|r| r.model == "cms.content").count(), 3);

        let target = TestEnv::new().await;
        let without_users: Vec<_> = records
            .into_iter()
            .filter(|r| r.model == "cms.content" || r.model == "faq.faqcategory")
            .map(|mut r| {
                for column in ["created_by", "last_modified_by"] {
                    r.fields.insert(column.to_string(), json!(null));
                }
                r
            })
            .collect();
        fixtures::load(&target.state.db, &without_users).await.unwrap();

        let (_, body) = public_get(&target, "/api/v1/cms/accessibility").await;
        assert_eq!(body["text_en_html"], "<p>Hi</p><br/>");
        let (_, body) = public_get(&target, "/api/v1/faq-category").await;
        assert_eq!(body[0]["slug"], "general");
    }
}
