use axum::extract::DefaultBodyLimit;
use axum::middleware;
use axum::routing::{delete, get, patch, post};
use axum::{Json, Router};
use serde_json::{json, Value};

use crate::auth;
use crate::files;
use crate::providers;
use crate::ratelimit::{self, Tier};
use crate::resume;
use crate::share;
use crate::state::AppState;
use crate::views;

/// Uploads are capped at 5 MiB; the limit leaves headroom for multipart
/// framing.
const BODY_LIMIT: usize = 6 * 1024 * 1024;

async fn health() -> Json<Value> {
    Json(json!({
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
    }))
}

pub fn build_router(state: AppState) -> Router {
    let normal = middleware::from_fn_with_state((state.clone(), Tier::Normal), ratelimit::enforce);
    let moderate =
        middleware::from_fn_with_state((state.clone(), Tier::Moderate), ratelimit::enforce);
    let strict = middleware::from_fn_with_state((state.clone(), Tier::Strict), ratelimit::enforce);

    let public_api = Router::new()
        .route("/api/view/:slug/access", get(views::handlers::access))
        .route("/api/view/:slug/data", get(views::handlers::data))
        .route("/api/default-view", get(views::handlers::default_view))
        .route("/api/ai/status", get(providers::handlers::ai_status))
        .route("/api/ai-print/status", get(providers::handlers::print_status))
        .layer(normal);

    let share_api = Router::new()
        .route("/api/share/validate", post(share::handlers::validate))
        .layer(moderate);

    let credential_api = Router::new()
        .route("/api/password/check", post(views::handlers::password_check))
        .route("/api/auth/login", post(auth::login))
        .layer(strict);

    let owner_api = Router::new()
        .route("/api/share/generate", post(share::handlers::generate))
        .route("/api/share/revoke/:id", post(share::handlers::revoke))
        .route("/api/password/set", post(views::handlers::password_set))
        .route("/api/views", post(views::handlers::create_view))
        .route("/api/views/:id", patch(views::handlers::update_view))
        .route("/api/providers", post(providers::handlers::create))
        .route("/api/providers/:id", patch(providers::handlers::update))
        .route("/api/ai/test/:id", post(providers::handlers::test_connection))
        .route("/api/view/:slug/exports", get(resume::handlers::list_exports))
        .route(
            "/api/view/:slug/exports/:id",
            delete(resume::handlers::delete_export),
        )
        .route("/api/resume/upload", post(resume::handlers::upload));

    Router::new()
        .route("/health", get(health))
        .route("/api/files/:collection/:record/:name", get(files::serve))
        .route("/api/view/:slug/generate", post(resume::handlers::generate))
        .route("/s/:token", get(views::handlers::share_handoff))
        .route("/v/:slug", get(views::handlers::legacy_redirect))
        .route("/:slug", get(views::handlers::slug_entry))
        .merge(public_api)
        .merge(share_api)
        .merge(credential_api)
        .merge(owner_api)
        .layer(DefaultBodyLimit::max(BODY_LIMIT))
        .with_state(state)
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::Config;
    use crate::ratelimit::{HourlyWindow, RateLimiter};
    use crate::store::memory::MemoryStore;
    use crate::store::StoreView;
    use crate::vault::Vault;
    use axum::body::Body;
    use axum::http::{header, Method, Request, StatusCode};
    use http_body_util::BodyExt;
    use std::sync::Arc;
    use tower::ServiceExt;

    fn test_config() -> Config {
        Config {
            encryption_key: "test-secret".to_string(),
            using_dev_key: false,
            admin_emails: vec!["owner@example.com".to_string()],
            admin_password_hash: None,
            trust_proxy: false,
            app_url: None,
            public_app_url: Some("https://example.com".to_string()),
            seed_data: false,
            data_dir: "/tmp/vitrine-test".to_string(),
            port: 0,
            rust_log: "info".to_string(),
        }
    }

    fn test_state() -> AppState {
        AppState {
            store: Arc::new(MemoryStore::new()),
            vault: Arc::new(Vault::new("test-secret")),
            limiter: Arc::new(RateLimiter::new()),
            generate_window: Arc::new(HourlyWindow::new(5)),
            http: reqwest::Client::new(),
            config: test_config(),
        }
    }

    fn live_store(state: &AppState) -> StoreView {
        StoreView::new(state.store.clone(), false)
    }

    async fn insert_view(state: &AppState, fields: Value) -> String {
        live_store(state)
            .insert("views", fields.as_object().cloned().unwrap())
            .await
            .unwrap()
            .id
    }

    fn owner_header(state: &AppState) -> String {
        let (token, _) = state
            .vault
            .issue_owner_jwt("owner@example.com", chrono::Duration::hours(1))
            .unwrap();
        format!("Bearer {token}")
    }

    async fn send(
        router: &Router,
        method: Method,
        uri: &str,
        body: Option<Value>,
        headers: &[(&str, &str)],
    ) -> (StatusCode, axum::http::HeaderMap, Value) {
        let mut builder = Request::builder().method(method).uri(uri);
        for (name, value) in headers {
            builder = builder.header(*name, *value);
        }
        let request = match body {
            Some(json) => builder
                .header(header::CONTENT_TYPE, "application/json")
                .body(Body::from(json.to_string()))
                .unwrap(),
            None => builder.body(Body::empty()).unwrap(),
        };

        let response = router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap_or(Value::Null)
        };
        (status, headers, body)
    }

    #[tokio::test]
    async fn test_health() {
        let router = build_router(test_state());
        let (status, _, body) = send(&router, Method::GET, "/health", None, &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["status"], "ok");
    }

    #[tokio::test]
    async fn test_private_view_is_indistinguishable_from_missing() {
        let state = test_state();
        insert_view(
            &state,
            json!({"slug": "internal", "visibility": "private", "is_active": true}),
        )
        .await;
        let router = build_router(state);

        let (status_a, _, body_a) =
            send(&router, Method::GET, "/api/view/internal/access", None, &[]).await;
        let (status_b, _, body_b) =
            send(&router, Method::GET, "/api/view/nonexistent/access", None, &[]).await;

        assert_eq!(status_a, StatusCode::NOT_FOUND);
        assert_eq!(status_b, StatusCode::NOT_FOUND);
        assert_eq!(body_a, body_b);
        assert_eq!(body_a, json!({"error": "view not found"}));

        let (status_c, _, body_c) =
            send(&router, Method::GET, "/api/view/internal/data", None, &[]).await;
        assert_eq!(status_c, StatusCode::NOT_FOUND);
        assert_eq!(body_c, body_a);
    }

    #[tokio::test]
    async fn test_share_validate_is_non_leaky() {
        let state = test_state();
        let router = build_router(state);
        let (status, _, body) = send(
            &router,
            Method::POST,
            "/api/share/validate",
            Some(json!({"token": "definitely-not-a-token"})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body, json!({"valid": false, "error": "invalid token"}));
    }

    #[tokio::test]
    async fn test_share_handoff_sets_cookie_and_gates_unlisted_data() {
        let state = test_state();
        let view_id = insert_view(
            &state,
            json!({
                "slug": "recruiter", "visibility": "unlisted", "is_active": true,
                "name": "Recruiter", "sections": [],
            }),
        )
        .await;
        let store = live_store(&state);
        let issued = share::issue(&store, &state.vault, &view_id, None, None, None)
            .await
            .unwrap();
        let router = build_router(state);

        // Unlisted without a token: hidden.
        let (status, _, _) =
            send(&router, Method::GET, "/api/view/recruiter/data", None, &[]).await;
        assert_eq!(status, StatusCode::NOT_FOUND);

        let (status, headers, _) = send(
            &router,
            Method::GET,
            &format!("/s/{}", issued.token),
            None,
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::FOUND);
        assert_eq!(headers[header::LOCATION], "/recruiter");
        let cookie = headers[header::SET_COOKIE].to_str().unwrap().to_string();
        assert!(cookie.starts_with("me_share_token="));
        assert!(cookie.contains("HttpOnly"));
        assert!(cookie.contains("SameSite=Lax"));
        // Tokens without an expiry get the 30-day default cookie lifetime.
        assert!(cookie.contains(&format!("Max-Age={}", 30 * 24 * 3600)));

        let cookie_pair = cookie.split(';').next().unwrap().to_string();

        // Legacy links pass the token as a query parameter instead.
        let (status, _, body) = send(
            &router,
            Method::GET,
            &format!("/api/view/recruiter/data?token={}", issued.token),
            None,
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["slug"], "recruiter");
        let (status, _, body) = send(
            &router,
            Method::GET,
            "/api/view/recruiter/data",
            None,
            &[("cookie", cookie_pair.as_str())],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["slug"], "recruiter");

        // Revocation closes the door for the same cookie.
        share::revoke(&store, &issued.id).await.unwrap();
        let (status, _, _) = send(
            &router,
            Method::GET,
            "/api/view/recruiter/data",
            None,
            &[("cookie", cookie_pair.as_str())],
        )
        .await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_strict_tier_returns_429_with_retry_after() {
        let state = test_state();
        let router = build_router(state);
        let body = json!({"view_id": "x", "password": "y"});

        for _ in 0..3 {
            let (status, headers, _) = send(
                &router,
                Method::POST,
                "/api/password/check",
                Some(body.clone()),
                &[],
            )
            .await;
            assert_eq!(status, StatusCode::OK);
            assert!(headers.contains_key("x-ratelimit-remaining"));
        }

        for _ in 0..2 {
            let (status, headers, resp) = send(
                &router,
                Method::POST,
                "/api/password/check",
                Some(body.clone()),
                &[],
            )
            .await;
            assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
            assert_eq!(resp, json!({"error": "too many requests"}));
            let retry_after: u64 = headers[header::RETRY_AFTER]
                .to_str()
                .unwrap()
                .parse()
                .unwrap();
            assert!((1..=60).contains(&retry_after));
        }
    }

    #[tokio::test]
    async fn test_password_flow_grants_data_access() {
        let state = test_state();
        let hash = state.vault.hash_password("open sesame").unwrap();
        let view_id = insert_view(
            &state,
            json!({
                "slug": "locked", "visibility": "password", "is_active": true,
                "name": "Locked", "password_hash": hash, "sections": [],
            }),
        )
        .await;
        let router = build_router(state);

        // Anonymous data access yields the prompt indicator, not content.
        let (status, _, body) =
            send(&router, Method::GET, "/api/view/locked/data", None, &[]).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["requires_password"], json!(true));
        assert!(body.get("sections").is_none());

        let (status, _, body) = send(
            &router,
            Method::POST,
            "/api/password/check",
            Some(json!({"view_id": view_id, "password": "wrong"})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(body["valid"], json!(false));

        let (_, _, body) = send(
            &router,
            Method::POST,
            "/api/password/check",
            Some(json!({"view_id": view_id, "password": "open sesame"})),
            &[],
        )
        .await;
        assert_eq!(body["valid"], json!(true));
        let token = body["token"].as_str().unwrap().to_string();

        let (status, _, body) = send(
            &router,
            Method::GET,
            "/api/view/locked/data",
            None,
            &[("x-password-token", token.as_str())],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("sections").is_some());

        // The same token works as a bearer credential.
        let bearer = format!("Bearer {token}");
        let (status, _, body) = send(
            &router,
            Method::GET,
            "/api/view/locked/data",
            None,
            &[("authorization", bearer.as_str())],
        )
        .await;
        assert_eq!(status, StatusCode::OK);
        assert!(body.get("sections").is_some());
    }

    #[tokio::test]
    async fn test_default_view_single_winner() {
        let state = test_state();
        let auth = owner_header(&state);
        let store = live_store(&state);
        let router = build_router(state);

        let (status, _, view_a) = send(
            &router,
            Method::POST,
            "/api/views",
            Some(json!({"slug": "main", "name": "Main", "is_default": true})),
            &[("authorization", auth.as_str())],
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (status, _, view_b) = send(
            &router,
            Method::POST,
            "/api/views",
            Some(json!({"slug": "alt", "name": "Alt"})),
            &[("authorization", auth.as_str())],
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);

        let (_, _, body) = send(&router, Method::GET, "/api/default-view", None, &[]).await;
        assert_eq!(body["slug"], "main");

        let (status, _, _) = send(
            &router,
            Method::PATCH,
            &format!("/api/views/{}", view_b["id"].as_str().unwrap()),
            Some(json!({"is_default": true})),
            &[("authorization", auth.as_str())],
        )
        .await;
        assert_eq!(status, StatusCode::OK);

        let (_, _, body) = send(&router, Method::GET, "/api/default-view", None, &[]).await;
        assert_eq!(body["slug"], "alt");

        let record_a = store
            .get("views", view_a["id"].as_str().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert!(!record_a.get_bool("is_default"));
    }

    #[tokio::test]
    async fn test_reserved_slugs_rejected_at_both_layers() {
        let state = test_state();
        let auth = owner_header(&state);
        let router = build_router(state);

        let (status, _, _) = send(
            &router,
            Method::POST,
            "/api/views",
            Some(json!({"slug": "Admin", "name": "Shadow"})),
            &[("authorization", auth.as_str())],
        )
        .await;
        assert_eq!(status, StatusCode::BAD_REQUEST);

        let (status, _, _) = send(&router, Method::GET, "/admin", None, &[]).await;
        assert_eq!(status, StatusCode::NOT_FOUND);
    }

    #[tokio::test]
    async fn test_owner_routes_require_auth() {
        let router = build_router(test_state());
        for (method, uri) in [
            (Method::POST, "/api/share/generate"),
            (Method::POST, "/api/views"),
            (Method::POST, "/api/providers"),
        ] {
            let (status, _, _) = send(&router, method, uri, Some(json!({})), &[]).await;
            assert_eq!(status, StatusCode::UNAUTHORIZED, "{uri}");
        }
    }

    #[tokio::test]
    async fn test_legacy_redirect() {
        let router = build_router(test_state());
        let (status, headers, _) = send(&router, Method::GET, "/v/recruiter", None, &[]).await;
        assert_eq!(status, StatusCode::MOVED_PERMANENTLY);
        assert_eq!(headers[header::LOCATION], "/recruiter");
    }

    #[tokio::test]
    async fn test_provider_create_masks_key() {
        let state = test_state();
        let auth = owner_header(&state);
        let store = live_store(&state);
        let vault = state.vault.clone();
        let router = build_router(state);

        let (status, _, body) = send(
            &router,
            Method::POST,
            "/api/providers",
            Some(json!({"type": "openai", "api_key": "sk-live-12345", "model": "gpt-4o"})),
            &[("authorization", auth.as_str())],
        )
        .await;
        assert_eq!(status, StatusCode::CREATED);
        assert_eq!(body["api_key"], "********");
        assert!(body.get("api_key_encrypted").is_none());

        // The stored blob decrypts back to the submitted key.
        let record = store
            .get("ai_providers", body["id"].as_str().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            vault.decrypt(record.get_str("api_key_encrypted")).unwrap(),
            "sk-live-12345"
        );

        // Sentinel update keeps the key; a new value replaces it.
        let (_, _, _) = send(
            &router,
            Method::PATCH,
            &format!("/api/providers/{}", body["id"].as_str().unwrap()),
            Some(json!({"api_key": "********", "model": "gpt-4o-mini"})),
            &[("authorization", auth.as_str())],
        )
        .await;
        let record = store
            .get("ai_providers", body["id"].as_str().unwrap())
            .await
            .unwrap()
            .unwrap();
        assert_eq!(
            vault.decrypt(record.get_str("api_key_encrypted")).unwrap(),
            "sk-live-12345"
        );
        assert_eq!(record.get_str("model"), "gpt-4o-mini");
    }

    #[tokio::test]
    async fn test_generate_without_pandoc_or_provider_never_panics() {
        let state = test_state();
        insert_view(
            &state,
            json!({"slug": "pub", "visibility": "public", "is_active": true, "sections": []}),
        )
        .await;
        let router = build_router(state);

        let (status, _, _) = send(
            &router,
            Method::POST,
            "/api/view/pub/generate",
            Some(json!({"format": "pdf"})),
            &[],
        )
        .await;
        // 503 whether pandoc or the provider is the missing piece.
        assert_eq!(status, StatusCode::SERVICE_UNAVAILABLE);
    }

    #[tokio::test]
    async fn test_generate_forbidden_for_private_view_without_owner() {
        let state = test_state();
        insert_view(
            &state,
            json!({"slug": "secret", "visibility": "private", "is_active": true}),
        )
        .await;
        let router = build_router(state);

        let (status, _, _) = send(
            &router,
            Method::POST,
            "/api/view/secret/generate",
            Some(json!({"format": "pdf"})),
            &[],
        )
        .await;
        assert_eq!(status, StatusCode::FORBIDDEN);
    }

    #[tokio::test]
    async fn test_resume_upload_dedups_on_file_hash() {
        let state = test_state();
        let file_bytes = b"%PDF-1.4 fake resume bytes";
        let hash = crate::resume::parse::sha256_hex(file_bytes);
        live_store(&state)
            .insert(
                resume::IMPORTS_COLLECTION,
                json!({
                    "file_hash": hash,
                    "filename": "resume.pdf",
                    "status": "completed",
                    "counts": {"experience": 2},
                })
                .as_object()
                .cloned()
                .unwrap(),
            )
            .await
            .unwrap();
        let auth = owner_header(&state);
        let router = build_router(state.clone());

        let boundary = "----upload-test-boundary";
        let mut body = Vec::new();
        body.extend_from_slice(
            format!(
                "--{boundary}\r\nContent-Disposition: form-data; name=\"file\"; \
                 filename=\"resume.pdf\"\r\nContent-Type: application/pdf\r\n\r\n"
            )
            .as_bytes(),
        );
        body.extend_from_slice(file_bytes);
        body.extend_from_slice(format!("\r\n--{boundary}--\r\n").as_bytes());

        let request = Request::builder()
            .method(Method::POST)
            .uri("/api/resume/upload")
            .header(header::AUTHORIZATION, &auth)
            .header(
                header::CONTENT_TYPE,
                format!("multipart/form-data; boundary={boundary}"),
            )
            .body(Body::from(body))
            .unwrap();
        let response = router.clone().oneshot(request).await.unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        let bytes = response.into_body().collect().await.unwrap().to_bytes();
        let json: Value = serde_json::from_slice(&bytes).unwrap();
        assert_eq!(json["deduped"], json!(true));
        assert_eq!(json["counts"]["experience"], json!(2));

        let imports = live_store(&state)
            .list(resume::IMPORTS_COLLECTION, &crate::store::Filter::new())
            .await
            .unwrap();
        assert_eq!(imports.len(), 1);
    }
}
