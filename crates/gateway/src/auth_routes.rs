use {
    anzuimg_auth::{
        AuthError, NewSession, Page, PrincipalId, SESSION_COOKIE, SecurityEvent, authorize_setup,
        extract_credential,
    },
    anzuimg_config::SameSitePolicy,
    axum::{
        Json, Router,
        extract::{Path, Query, State},
        http::{HeaderMap, HeaderValue, StatusCode, header::SET_COOKIE},
        response::{IntoResponse, Response},
        routing::{get, post},
    },
    serde::Deserialize,
    serde_json::json,
    tracing::warn,
    webauthn_rs::prelude::{PublicKeyCredential, RegisterPublicKeyCredential},
};

use crate::{
    auth_middleware::{ApiJson, Caller, SessionOnly},
    error::ApiError,
    server::AppState,
};

/// Header carrying the passkey ceremony id between begin and finish.
pub const CEREMONY_ID_HEADER: &str = "x-session-id";
/// Older clients send the ceremony id under this name.
const LEGACY_CEREMONY_ID_HEADER: &str = "x-session-data";
const SETUP_TOKEN_HEADER: &str = "x-setup-token";

/// Routes reachable without a credential.
pub fn public_router() -> Router<AppState> {
    Router::new()
        .route("/status", get(status_handler))
        .route("/setup", post(setup_handler))
        .route("/login", post(login_handler))
        .route("/logout", post(logout_handler))
        .route("/validate", get(validate_handler))
        .route("/passkey/login/begin", get(passkey_login_begin_handler))
        .route("/passkey/login/finish", post(passkey_login_finish_handler))
}

/// Browser-only management routes. Mounted behind `require_auth`.
pub fn session_router() -> Router<AppState> {
    Router::new()
        .route("/passkey/register/begin", get(passkey_register_begin_handler))
        .route(
            "/passkey/register/finish",
            post(passkey_register_finish_handler),
        )
        .route("/passkeys", get(list_passkeys_handler))
        .route("/passkeys/count", get(count_passkeys_handler))
        .route("/passkeys/check", get(check_passkeys_handler))
        .route(
            "/passkeys/{credential_id}",
            axum::routing::delete(delete_passkey_handler),
        )
        .route(
            "/passkeys/{credential_id}/delete",
            post(delete_passkey_handler),
        )
        .route("/change-password", post(change_password_handler))
        .route("/security/logs", get(security_logs_handler))
}

// ── Status & setup ───────────────────────────────────────────────────────────

async fn status_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let gw = &state.gateway;
    let has_passkeys = gw.store.has_passkeys().await?;
    Ok(Json(json!({
        "initialized": gw.store.is_initialized(),
        "has_passkeys": has_passkeys,
        "passkey_available": gw.passkeys.is_some(),
    }))
    .into_response())
}

#[derive(Deserialize)]
struct SetupRequest {
    password: String,
    #[serde(default)]
    setup_token: Option<String>,
}

async fn setup_handler(
    State(state): State<AppState>,
    caller: Caller,
    headers: HeaderMap,
    ApiJson(body): ApiJson<SetupRequest>,
) -> Result<Response, ApiError> {
    let gw = &state.gateway;
    let provided = body
        .setup_token
        .as_deref()
        .filter(|t| !t.is_empty())
        .or_else(|| headers.get(SETUP_TOKEN_HEADER).and_then(|v| v.to_str().ok()));

    if let Err(e) = authorize_setup(gw.setup_token.as_ref(), provided, caller.ip) {
        gw.record_event(&caller, SecurityEvent::warning("setup_denied", e.to_string()))
            .await;
        return Err(e.into());
    }

    gw.store.initialize(&body.password).await?;
    gw.record_event(
        &caller,
        SecurityEvent::info("setup_completed", "system initialized"),
    )
    .await;

    let session = gw.store.create_session(PrincipalId::ADMIN, &caller.context()).await?;
    Ok(session_response(&state, &headers, &session, "password"))
}

// ── Password login ───────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LoginRequest {
    password: String,
}

async fn login_handler(
    State(state): State<AppState>,
    caller: Caller,
    headers: HeaderMap,
    ApiJson(body): ApiJson<LoginRequest>,
) -> Result<Response, ApiError> {
    let gw = &state.gateway;
    let request = caller.request_info();

    // Refused before the password is even looked at.
    gw.login_defense.check(&request).await?;

    let ok = gw.store.verify_password(&body.password).await?;
    if let Err(e) = gw.login_defense.record_attempt(&request, ok).await {
        warn!(ip = %caller.ip, error = %e, "failed to record login attempt");
    }
    if !ok {
        gw.record_event(
            &caller,
            SecurityEvent::warning("login_failed", "failed login attempt"),
        )
        .await;
        return Err(ApiError::from(AuthError::InvalidCredential).with_code(
            "invalid_credentials",
            "invalid password or system not initialized",
        ));
    }

    gw.record_event(&caller, SecurityEvent::info("login_success", "successful login"))
        .await;
    let session = gw.store.create_session(PrincipalId::ADMIN, &caller.context()).await?;
    Ok(session_response(&state, &headers, &session, "password"))
}

// ── Logout & validate ────────────────────────────────────────────────────────

async fn logout_handler(
    State(state): State<AppState>,
    caller: Caller,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let gw = &state.gateway;
    if let Some(token) = extract_credential(&headers)
        && gw.store.revoke_session(token).await?
    {
        gw.record_event(&caller, SecurityEvent::info("logout", "logged out"))
            .await;
    }
    Ok(clear_session_response(
        &state,
        &headers,
        json!({ "message": "logged out" }),
    ))
}

async fn validate_handler(
    State(state): State<AppState>,
    caller: Caller,
    headers: HeaderMap,
) -> Result<Response, ApiError> {
    let invalid = || {
        ApiError::from(AuthError::InvalidCredential)
            .with_code("session_invalid", "invalid or expired session")
    };
    let token = extract_credential(&headers).ok_or_else(invalid)?;
    let session = match state.gateway.store.validate_session(token, caller.ip).await {
        Ok(session) => session,
        Err(AuthError::InvalidCredential) => return Err(invalid()),
        Err(e) => return Err(e.into()),
    };
    Ok(Json(json!({
        "valid": true,
        "auth_method": "session",
        "expires_at": session.expires_at,
        "created_at": session.created_at,
        "last_used": session.last_used_at,
    }))
    .into_response())
}

// ── Passkey login ────────────────────────────────────────────────────────────

async fn passkey_login_begin_handler(State(state): State<AppState>) -> Result<Response, ApiError> {
    let ceremony = state.gateway.passkeys()?.begin_login().await?;
    Ok(ceremony_response(&ceremony.session_id, json!({
        "options": ceremony.options,
        "session_id": ceremony.session_id,
    })))
}

async fn passkey_login_finish_handler(
    State(state): State<AppState>,
    caller: Caller,
    headers: HeaderMap,
    ApiJson(credential): ApiJson<PublicKeyCredential>,
) -> Result<Response, ApiError> {
    let gw = &state.gateway;
    let passkeys = gw.passkeys()?;
    let ceremony_id = ceremony_id(&headers)?;

    match passkeys
        .finish_login(ceremony_id, &credential, &caller.context())
        .await
    {
        Ok(session) => {
            gw.record_event(
                &caller,
                SecurityEvent::info("passkey_login_success", "passkey login succeeded"),
            )
            .await;
            Ok(session_response(&state, &headers, &session, "passkey"))
        },
        Err(e) => {
            gw.record_event(
                &caller,
                SecurityEvent::warning("passkey_login_failed", e.to_string()),
            )
            .await;
            Err(e.into())
        },
    }
}

// ── Passkey registration ─────────────────────────────────────────────────────

async fn passkey_register_begin_handler(
    State(state): State<AppState>,
    SessionOnly(session): SessionOnly,
) -> Result<Response, ApiError> {
    let ceremony = state
        .gateway
        .passkeys()?
        .begin_registration(session.principal)
        .await?;
    Ok(ceremony_response(&ceremony.session_id, json!({
        "options": ceremony.options,
        "session_id": ceremony.session_id,
    })))
}

async fn passkey_register_finish_handler(
    State(state): State<AppState>,
    SessionOnly(_session): SessionOnly,
    caller: Caller,
    headers: HeaderMap,
    ApiJson(credential): ApiJson<RegisterPublicKeyCredential>,
) -> Result<Response, ApiError> {
    let gw = &state.gateway;
    let passkeys = gw.passkeys()?;
    let ceremony_id = ceremony_id(&headers)?;

    match passkeys
        .finish_registration(ceremony_id, &credential, &caller.context())
        .await
    {
        Ok(passkey) => {
            gw.record_event(
                &caller,
                SecurityEvent::info("passkey_register_success", "passkey registered"),
            )
            .await;
            Ok(Json(json!({
                "message": "passkey registered successfully",
                "passkey": passkey,
            }))
            .into_response())
        },
        Err(e) => {
            gw.record_event(
                &caller,
                SecurityEvent::warning("passkey_register_failed", e.to_string()),
            )
            .await;
            Err(e.into())
        },
    }
}

// ── Passkey management ───────────────────────────────────────────────────────

async fn list_passkeys_handler(
    State(state): State<AppState>,
    SessionOnly(session): SessionOnly,
) -> Result<Response, ApiError> {
    let gw = &state.gateway;
    gw.passkeys()?;
    let credentials = gw.store.list_passkeys(session.principal).await?;
    Ok(Json(json!({
        "count": credentials.len(),
        "credentials": credentials,
    }))
    .into_response())
}

async fn count_passkeys_handler(
    State(state): State<AppState>,
    SessionOnly(_session): SessionOnly,
) -> Result<Response, ApiError> {
    let gw = &state.gateway;
    gw.passkeys()?;
    let count = gw.store.count_passkeys().await?;
    Ok(Json(json!({ "count": count })).into_response())
}

async fn check_passkeys_handler(
    State(state): State<AppState>,
    SessionOnly(_session): SessionOnly,
) -> Result<Response, ApiError> {
    let gw = &state.gateway;
    gw.passkeys()?;
    let has_passkey = gw.store.has_passkeys().await?;
    Ok(Json(json!({ "has_passkey": has_passkey })).into_response())
}

async fn delete_passkey_handler(
    State(state): State<AppState>,
    SessionOnly(_session): SessionOnly,
    caller: Caller,
    Path(credential_id): Path<String>,
) -> Result<Response, ApiError> {
    let gw = &state.gateway;
    gw.passkeys()?;
    match gw.store.delete_passkey(&credential_id).await {
        Ok(()) => {
            gw.record_event(
                &caller,
                SecurityEvent::info("passkey_delete_success", "passkey deleted"),
            )
            .await;
            Ok(Json(json!({ "message": "passkey deleted successfully" })).into_response())
        },
        Err(e) => {
            gw.record_event(
                &caller,
                SecurityEvent::warning("passkey_delete_failed", e.to_string()),
            )
            .await;
            Err(e.into())
        },
    }
}

// ── Password change ──────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct ChangePasswordRequest {
    current_password: String,
    new_password: String,
}

async fn change_password_handler(
    State(state): State<AppState>,
    SessionOnly(_session): SessionOnly,
    caller: Caller,
    headers: HeaderMap,
    ApiJson(body): ApiJson<ChangePasswordRequest>,
) -> Result<Response, ApiError> {
    let gw = &state.gateway;
    match gw
        .store
        .change_password(&body.current_password, &body.new_password)
        .await
    {
        Ok(revoked) => {
            gw.record_event(
                &caller,
                SecurityEvent::info("password_changed", "password changed successfully"),
            )
            .await;
            // Every session is gone, including the caller's.
            Ok(clear_session_response(
                &state,
                &headers,
                json!({
                    "message": "password changed successfully",
                    "revoked_sessions": revoked,
                }),
            ))
        },
        Err(e) => {
            gw.record_event(
                &caller,
                SecurityEvent::warning("password_change_failed", "password change failed"),
            )
            .await;
            Err(e.into())
        },
    }
}

// ── Security log ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct SecurityLogQuery {
    page: Option<u32>,
    page_size: Option<u32>,
    failed_only: Option<bool>,
}

async fn security_logs_handler(
    State(state): State<AppState>,
    SessionOnly(_session): SessionOnly,
    Query(query): Query<SecurityLogQuery>,
) -> Result<Response, ApiError> {
    let page = Page::new(query.page, query.page_size);
    let events = state
        .gateway
        .audit
        .list(page, query.failed_only.unwrap_or(true))
        .await?;
    Ok(Json(events).into_response())
}

// ── Helpers ──────────────────────────────────────────────────────────────────

fn ceremony_id(headers: &HeaderMap) -> Result<&str, ApiError> {
    [CEREMONY_ID_HEADER, LEGACY_CEREMONY_ID_HEADER]
        .into_iter()
        .filter_map(|name| headers.get(name).and_then(|v| v.to_str().ok()))
        .map(str::trim)
        .find(|v| !v.is_empty())
        .ok_or_else(|| {
            ApiError::bad_request(
                "passkey_session_id_required",
                "X-Session-ID header required",
            )
        })
}

fn ceremony_response(ceremony_id: &str, body: serde_json::Value) -> Response {
    let mut response = Json(body).into_response();
    if let Ok(value) = HeaderValue::from_str(ceremony_id) {
        response.headers_mut().insert(CEREMONY_ID_HEADER, value);
    }
    response
}

/// The request reached us over HTTPS, as reported by the proxy.
fn forwarded_https(headers: &HeaderMap) -> bool {
    headers
        .get("x-forwarded-proto")
        .and_then(|v| v.to_str().ok())
        .and_then(|v| v.split(',').next())
        .is_some_and(|proto| proto.trim().eq_ignore_ascii_case("https"))
}

/// `SameSite=None` is only accepted by browsers together with `Secure`.
fn session_cookie(
    value: &str,
    max_age_secs: u64,
    same_site: SameSitePolicy,
    headers: &HeaderMap,
) -> String {
    let secure = if same_site == SameSitePolicy::None || forwarded_https(headers) {
        "; Secure"
    } else {
        ""
    };
    format!(
        "{SESSION_COOKIE}={value}; HttpOnly; Path=/; Max-Age={max_age_secs}; SameSite={}{secure}",
        same_site.as_str()
    )
}

fn session_response(
    state: &AppState,
    headers: &HeaderMap,
    session: &NewSession,
    auth_method: &str,
) -> Response {
    let gw = &state.gateway;
    let cookie = session_cookie(
        &session.token,
        gw.session_ttl().as_secs(),
        gw.cookie_same_site,
        headers,
    );
    (
        StatusCode::OK,
        [(SET_COOKIE, cookie)],
        Json(json!({
            "token": session.token,
            "expires_at": session.session.expires_at,
            "auth_method": auth_method,
        })),
    )
        .into_response()
}

fn clear_session_response(
    state: &AppState,
    headers: &HeaderMap,
    body: serde_json::Value,
) -> Response {
    let cookie = session_cookie("", 0, state.gateway.cookie_same_site, headers);
    (StatusCode::OK, [(SET_COOKIE, cookie)], Json(body)).into_response()
}
