//! End-to-end tests for the auth API and the guards in front of the image API.

#![allow(clippy::unwrap_used, clippy::expect_used)]

use std::{net::SocketAddr, sync::Arc};

use {
    anzuimg_config::AnzuConfig,
    anzuimg_gateway::{GatewayState, build_gateway_app},
    reqwest::{Client, Response, StatusCode},
    secrecy::Secret,
    serde_json::{Value, json},
    sqlx::SqlitePool,
    tokio::net::TcpListener,
};

const PASSWORD: &str = "Sup3rSecret";

struct TestServer {
    addr: SocketAddr,
    client: Client,
    state: Arc<GatewayState>,
    pool: SqlitePool,
}

impl TestServer {
    async fn start() -> Self {
        Self::start_with(AnzuConfig::default()).await
    }

    async fn start_with(config: AnzuConfig) -> Self {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        let state = GatewayState::from_config(&config, pool.clone())
            .await
            .unwrap();
        let app = build_gateway_app(Arc::clone(&state));

        let listener = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        tokio::spawn(async move {
            axum::serve(
                listener,
                app.into_make_service_with_connect_info::<SocketAddr>(),
            )
            .await
            .unwrap();
        });

        Self {
            addr,
            client: Client::new(),
            state,
            pool,
        }
    }

    fn url(&self, path: &str) -> String {
        format!("http://{}/api/v1{path}", self.addr)
    }

    async fn get(&self, path: &str, token: Option<&str>) -> Response {
        let mut req = self.client.get(self.url(path));
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        req.send().await.unwrap()
    }

    async fn post(&self, path: &str, token: Option<&str>, body: Value) -> Response {
        let mut req = self.client.post(self.url(path)).json(&body);
        if let Some(token) = token {
            req = req.bearer_auth(token);
        }
        req.send().await.unwrap()
    }

    /// Password login, pretending to come from `ip` through the local proxy.
    async fn login_from(&self, ip: &str, password: &str) -> Response {
        self.client
            .post(self.url("/auth/login"))
            .header("x-forwarded-for", ip)
            .json(&json!({ "password": password }))
            .send()
            .await
            .unwrap()
    }

    /// Initialize from loopback and return the session token.
    async fn setup(&self) -> String {
        let resp = self
            .post("/auth/setup", None, json!({ "password": PASSWORD }))
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        body(resp).await["token"].as_str().unwrap().to_string()
    }

    async fn create_token(&self, session: &str, token_type: &str) -> String {
        let resp = self
            .post(
                "/auth/tokens",
                Some(session),
                json!({ "name": format!("{token_type} token"), "token_type": token_type }),
            )
            .await;
        assert_eq!(resp.status(), StatusCode::OK);
        body(resp).await["raw_token"].as_str().unwrap().to_string()
    }

    /// Actions in the security log, newest first.
    async fn security_actions(&self, session: &str, failed_only: bool) -> Vec<String> {
        let logs = body(
            self.get(
                &format!("/auth/security/logs?page_size=200&failed_only={failed_only}"),
                Some(session),
            )
            .await,
        )
        .await;
        logs["items"]
            .as_array()
            .unwrap()
            .iter()
            .map(|e| e["action"].as_str().unwrap().to_string())
            .collect()
    }
}

async fn body(resp: Response) -> Value {
    resp.json().await.unwrap()
}

async fn error_code(resp: Response) -> String {
    body(resp).await["code"].as_str().unwrap().to_string()
}

#[tokio::test]
async fn setup_login_validate_logout() {
    let server = TestServer::start().await;

    let status = body(server.get("/auth/status", None).await).await;
    assert_eq!(status["initialized"], false);
    assert_eq!(status["passkey_available"], true);

    let resp = server
        .post("/auth/setup", None, json!({ "password": PASSWORD }))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let cookie = resp
        .headers()
        .get("set-cookie")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    assert!(cookie.starts_with("anzuimg_session="));
    assert!(cookie.contains("HttpOnly"));
    assert!(cookie.contains("SameSite=Lax"));
    assert!(cookie.contains("Max-Age=28800"));

    let status = body(server.get("/auth/status", None).await).await;
    assert_eq!(status["initialized"], true);

    // Second setup is refused.
    let resp = server
        .post("/auth/setup", None, json!({ "password": PASSWORD }))
        .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(resp).await, "system_already_initialized");

    let resp = server
        .post("/auth/login", None, json!({ "password": "Wrong1pass" }))
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(resp).await, "invalid_credentials");

    let resp = server
        .post("/auth/login", None, json!({ "password": PASSWORD }))
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let login = body(resp).await;
    assert_eq!(login["auth_method"], "password");
    let token = login["token"].as_str().unwrap().to_string();

    let resp = server.get("/auth/validate", Some(&token)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let valid = body(resp).await;
    assert_eq!(valid["valid"], true);
    assert_eq!(valid["auth_method"], "session");

    let resp = server.post("/auth/logout", Some(&token), json!({})).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let cleared = resp.headers().get("set-cookie").unwrap().to_str().unwrap();
    assert!(cleared.contains("Max-Age=0"));

    let resp = server.get("/auth/validate", Some(&token)).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(resp).await, "session_invalid");

    // Logout is idempotent.
    let resp = server.post("/auth/logout", Some(&token), json!({})).await;
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn second_login_replaces_the_first_session() {
    let server = TestServer::start().await;
    let first = server.setup().await;

    let second = body(server.login_from("127.0.0.1", PASSWORD).await).await["token"]
        .as_str()
        .unwrap()
        .to_string();

    assert_eq!(
        server.get("/auth/validate", Some(&first)).await.status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        server.get("/auth/validate", Some(&second)).await.status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn setup_is_loopback_only_without_a_setup_token() {
    let server = TestServer::start().await;

    let resp = server
        .client
        .post(server.url("/auth/setup"))
        .header("x-forwarded-for", "203.0.113.9")
        .json(&json!({ "password": PASSWORD }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(resp).await, "setup_localhost_only");
    assert!(!server.state.store.is_initialized());
}

#[tokio::test]
async fn configured_setup_token_is_required_from_anywhere() {
    let mut config = AnzuConfig::default();
    config.auth.setup_token = Some(Secret::new("let-me-in".to_string()));
    let server = TestServer::start_with(config).await;

    // Loopback alone is not enough.
    let resp = server
        .post("/auth/setup", None, json!({ "password": PASSWORD }))
        .await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(resp).await, "setup_token_required");

    let resp = server
        .client
        .post(server.url("/auth/setup"))
        .header("x-forwarded-for", "203.0.113.9")
        .header("x-setup-token", "let-me-in")
        .json(&json!({ "password": PASSWORD }))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn weak_setup_password_is_rejected() {
    let server = TestServer::start().await;
    let resp = server
        .post("/auth/setup", None, json!({ "password": "short" }))
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert!(!server.state.store.is_initialized());
}

#[tokio::test]
async fn repeated_failures_lock_out_one_ip() {
    let server = TestServer::start().await;
    server.setup().await;

    for _ in 0..5 {
        let resp = server.login_from("198.51.100.7", "Wrong1pass").await;
        assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    }

    // Locked out even with the right password.
    let resp = server.login_from("198.51.100.7", PASSWORD).await;
    assert_eq!(resp.status(), StatusCode::TOO_MANY_REQUESTS);
    let retry_after: i64 = resp
        .headers()
        .get("retry-after")
        .unwrap()
        .to_str()
        .unwrap()
        .parse()
        .unwrap();
    assert!(retry_after > 0 && retry_after <= 15 * 60);
    let err = body(resp).await;
    assert_eq!(err["code"], "too_many_login_attempts");
    assert!(err["unlock_time"].as_str().is_some());

    // Another address is unaffected.
    let resp = server.login_from("198.51.100.8", PASSWORD).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let session = body(resp).await["token"].as_str().unwrap().to_string();
    let logs = body(
        server
            .get("/auth/security/logs?page_size=50", Some(&session))
            .await,
    )
    .await;
    let actions: Vec<&str> = logs["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["action"].as_str().unwrap())
        .collect();
    assert!(actions.contains(&"login_bruteforce_alert"));
    assert!(actions.contains(&"login_rate_limited"));
    assert!(actions.contains(&"login_failed"));
    // `failed_only` defaults to true.
    assert!(!actions.contains(&"login_success"));
}

#[tokio::test]
async fn protected_routes_require_a_credential() {
    let server = TestServer::start().await;
    let session = server.setup().await;

    let resp = server.get("/ping", None).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(resp).await, "session_or_token_invalid");

    let resp = server.get("/ping", Some("anz_not-a-real-token")).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = server.get("/ping", Some(&session)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body(resp).await["auth_method"], "session");

    // Session cookie works as well as a bearer token.
    let resp = server
        .client
        .get(server.url("/auth/passkeys/count"))
        .header("cookie", format!("theme=dark; anzuimg_session={session}"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
}

#[tokio::test]
async fn token_types_gate_image_endpoints() {
    let server = TestServer::start().await;
    let session = server.setup().await;

    let list_only = server.create_token(&session, "list_only").await;
    assert!(list_only.starts_with("anz_"));

    let resp = server.get("/images", Some(&list_only)).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = server.post("/images", Some(&list_only), json!({})).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(resp).await, "api_token_scope_denied");

    let resp = server.get("/ping", Some(&list_only)).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    // Management endpoints are for browser sessions only.
    let resp = server.get("/auth/tokens", Some(&list_only)).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(resp).await, "session_required");

    let upload = server.create_token(&session, "upload-and-list").await;
    let resp = server.post("/images", Some(&upload), json!({})).await;
    assert_eq!(resp.status(), StatusCode::NOT_IMPLEMENTED);
    let resp = server.get("/ping", Some(&upload)).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);

    let full = server.create_token(&session, "").await;
    let resp = server.get("/ping", Some(&full)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body(resp).await["auth_method"], "api_token");
}

#[tokio::test]
async fn token_management_and_activity_log() {
    let server = TestServer::start().await;
    let session = server.setup().await;

    let resp = server
        .post(
            "/auth/tokens",
            Some(&session),
            json!({ "name": "bad", "token_type": "superuser" }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);

    let resp = server
        .post(
            "/auth/tokens",
            Some(&session),
            json!({ "name": "ci", "token_type": "full", "ip_allowlist": ["10.0.0.0/8"] }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    let created = body(resp).await;
    let raw = created["raw_token"].as_str().unwrap().to_string();
    let id = created["token"]["id"].as_i64().unwrap();

    // Loopback is outside the allow-list.
    let resp = server.get("/ping", Some(&raw)).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = server
        .client
        .get(server.url("/ping"))
        .bearer_auth(&raw)
        .header("x-forwarded-for", "10.1.2.3")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let tokens = body(server.get("/auth/tokens", Some(&session)).await).await;
    assert_eq!(tokens.as_array().unwrap().len(), 1);
    assert_eq!(tokens[0]["last_used_ip"], "10.1.2.3");

    let logs = body(server.get("/auth/tokens/logs", Some(&session)).await).await;
    let actions: Vec<&str> = logs["items"]
        .as_array()
        .unwrap()
        .iter()
        .map(|e| e["action"].as_str().unwrap())
        .collect();
    assert!(actions.contains(&"token_create"));
    assert!(actions.contains(&"api_request"));

    let resp = server
        .client
        .delete(server.url("/auth/tokens/logs?days=0"))
        .bearer_auth(&session)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::BAD_REQUEST);
    assert_eq!(error_code(resp).await, "invalid_days");

    let resp = server
        .client
        .delete(server.url(&format!("/auth/tokens/{id}")))
        .bearer_auth(&session)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::OK);

    let resp = server
        .post(&format!("/auth/tokens/{id}/delete"), Some(&session), json!({}))
        .await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(resp).await, "token_not_found");
}

#[tokio::test]
async fn change_password_revokes_every_session() {
    let server = TestServer::start().await;
    let session = server.setup().await;

    let resp = server
        .post(
            "/auth/change-password",
            Some(&session),
            json!({ "current_password": "Wrong1pass", "new_password": "N3wPassword" }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);

    let resp = server
        .post(
            "/auth/change-password",
            Some(&session),
            json!({ "current_password": PASSWORD, "new_password": "N3wPassword" }),
        )
        .await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert_eq!(body(resp).await["revoked_sessions"], 1);

    assert_eq!(
        server.get("/auth/validate", Some(&session)).await.status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        server.login_from("127.0.0.1", PASSWORD).await.status(),
        StatusCode::UNAUTHORIZED
    );
    assert_eq!(
        server.login_from("127.0.0.1", "N3wPassword").await.status(),
        StatusCode::OK
    );
}

#[tokio::test]
async fn passkey_ceremonies() {
    let server = TestServer::start().await;
    let session = server.setup().await;

    // Nothing enrolled yet.
    let resp = server.get("/auth/passkey/login/begin", None).await;
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);
    assert_eq!(error_code(resp).await, "passkey_not_found");

    let resp = server.get("/auth/passkey/register/begin", Some(&session)).await;
    assert_eq!(resp.status(), StatusCode::OK);
    let header_id = resp
        .headers()
        .get("x-session-id")
        .unwrap()
        .to_str()
        .unwrap()
        .to_string();
    let begin = body(resp).await;
    assert_eq!(begin["session_id"], header_id.as_str());
    assert!(begin["options"]["publicKey"]["challenge"].is_string());

    let resp = server.get("/auth/passkeys/check", Some(&session)).await;
    assert_eq!(body(resp).await["has_passkey"], false);

    let resp = server
        .client
        .delete(server.url("/auth/passkeys/unknown-credential"))
        .bearer_auth(&session)
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_FOUND);

    // Registration needs a browser session.
    let token = server.create_token(&session, "full").await;
    let resp = server.get("/auth/passkey/register/begin", Some(&token)).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(resp).await, "session_required");
}

#[tokio::test]
async fn passkeys_unavailable_with_bad_relying_party() {
    let mut config = AnzuConfig::default();
    config.passkey.rp_origin = "not a url".into();
    let server = TestServer::start_with(config).await;

    let status = body(server.get("/auth/status", None).await).await;
    assert_eq!(status["passkey_available"], false);

    let resp = server.get("/auth/passkey/login/begin", None).await;
    assert_eq!(resp.status(), StatusCode::SERVICE_UNAVAILABLE);
    assert_eq!(error_code(resp).await, "passkey_unavailable");
}

#[tokio::test]
async fn responses_carry_request_id_and_hardening_headers() {
    let server = TestServer::start().await;

    let resp = server.get("/health", None).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));
    assert_eq!(resp.headers()["x-frame-options"], "DENY");
    assert_eq!(resp.headers()["x-content-type-options"], "nosniff");

    let resp = server
        .client
        .get(server.url("/health"))
        .header("x-request-id", "trace-me")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-request-id"], "trace-me");
}

#[tokio::test]
async fn token_misuse_is_audited() {
    let server = TestServer::start().await;
    let session = server.setup().await;

    let resp = server
        .post(
            "/auth/tokens",
            Some(&session),
            json!({ "name": "office", "ip_allowlist": ["10.0.0.0/8"] }),
        )
        .await;
    let office = body(resp).await["raw_token"].as_str().unwrap().to_string();

    // Outside the allowlist the caller sees a plain authentication failure.
    let resp = server.get("/ping", Some(&office)).await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(resp).await, "session_or_token_invalid");

    let list_only = server.create_token(&session, "list_only").await;
    let resp = server.get("/auth/security/logs", Some(&list_only)).await;
    assert_eq!(resp.status(), StatusCode::FORBIDDEN);
    assert_eq!(error_code(resp).await, "session_required");

    let actions = server.security_actions(&session, true).await;
    assert!(actions.iter().any(|a| a == "token_ip_denied"));
    assert!(actions.iter().any(|a| a == "token_session_required"));
}

#[tokio::test]
async fn logout_is_audited_only_when_a_session_ends() {
    let server = TestServer::start().await;
    let session = server.setup().await;
    let token = server.create_token(&session, "full").await;

    for credential in ["never-issued", token.as_str()] {
        let resp = server.post("/auth/logout", Some(credential), json!({})).await;
        assert_eq!(resp.status(), StatusCode::OK);
    }
    let logouts = |actions: &[String]| actions.iter().filter(|a| *a == "logout").count();
    assert_eq!(logouts(&server.security_actions(&session, false).await), 0);

    let resp = server.post("/auth/logout", Some(&session), json!({})).await;
    assert_eq!(resp.status(), StatusCode::OK);

    let next = body(server.login_from("127.0.0.1", PASSWORD).await).await["token"]
        .as_str()
        .unwrap()
        .to_string();
    assert_eq!(logouts(&server.security_actions(&next, false).await), 1);
}

#[tokio::test]
async fn login_survives_attempt_bookkeeping_failure() {
    let server = TestServer::start().await;
    server.setup().await;
    sqlx::query(
        "CREATE TRIGGER no_attempts BEFORE INSERT ON login_attempts
         BEGIN SELECT RAISE(FAIL, 'read only'); END",
    )
    .execute(&server.pool)
    .await
    .unwrap();

    let resp = server.login_from("198.51.100.20", PASSWORD).await;
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(body(resp).await["token"].as_str().is_some());

    let resp = server.login_from("198.51.100.20", "Wrong1pass").await;
    assert_eq!(resp.status(), StatusCode::UNAUTHORIZED);
    assert_eq!(error_code(resp).await, "invalid_credentials");
}
