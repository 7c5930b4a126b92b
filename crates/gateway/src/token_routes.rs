//! API token management. Browser sessions only.

use {
    anzuimg_auth::{ApiToken, Page, SecurityEvent, TokenActivity, TokenType},
    axum::{
        Json, Router,
        extract::{Path, Query, State},
        response::{IntoResponse, Response},
        routing::{get, post},
    },
    serde::Deserialize,
    serde_json::json,
};

use crate::{
    auth_middleware::{ApiJson, Caller, SessionOnly},
    error::ApiError,
    server::AppState,
};

pub fn token_router() -> Router<AppState> {
    Router::new()
        .route("/tokens", get(list_tokens_handler).post(create_token_handler))
        .route(
            "/tokens/logs",
            get(list_logs_handler).delete(cleanup_logs_handler),
        )
        .route("/tokens/logs/cleanup", post(cleanup_logs_post_handler))
        .route("/tokens/{id}", axum::routing::delete(delete_token_handler))
        .route("/tokens/{id}/delete", post(delete_token_handler))
}

/// Token log entry for a management action, stamped with the caller.
fn activity(token: &ApiToken, action: &str, caller: &Caller) -> TokenActivity {
    TokenActivity {
        method: caller.method.clone(),
        path: caller.path.clone(),
        ip_address: caller.ip.to_string(),
        user_agent: caller.user_agent.clone(),
        ..TokenActivity::new(token, action)
    }
}

// ── Create / list / delete ───────────────────────────────────────────────────

#[derive(Deserialize)]
struct CreateTokenRequest {
    name: String,
    #[serde(default)]
    token_type: String,
    #[serde(default)]
    ip_allowlist: Vec<String>,
}

async fn create_token_handler(
    State(state): State<AppState>,
    SessionOnly(session): SessionOnly,
    caller: Caller,
    ApiJson(body): ApiJson<CreateTokenRequest>,
) -> Result<Response, ApiError> {
    let gw = &state.gateway;
    let created = match TokenType::from_name(&body.token_type) {
        Ok(token_type) => {
            gw.store
                .create_token(session.principal, &body.name, token_type, &body.ip_allowlist)
                .await
        },
        Err(e) => Err(e),
    };
    let created = match created {
        Ok(created) => created,
        Err(e) => {
            gw.record_event(
                &caller,
                SecurityEvent::warning("token_create_failed", e.to_string()),
            )
            .await;
            return Err(e.into());
        },
    };

    gw.store
        .record_token_activity(&activity(&created.token, "token_create", &caller))
        .await;
    gw.record_event(
        &caller,
        SecurityEvent::info("token_create_success", "api token created"),
    )
    .await;

    Ok(Json(json!({
        "token": created.token,
        "raw_token": created.raw,
    }))
    .into_response())
}

async fn list_tokens_handler(
    State(state): State<AppState>,
    SessionOnly(_session): SessionOnly,
) -> Result<Response, ApiError> {
    let tokens = state.gateway.store.list_tokens().await?;
    Ok(Json(tokens).into_response())
}

async fn delete_token_handler(
    State(state): State<AppState>,
    SessionOnly(_session): SessionOnly,
    caller: Caller,
    Path(id): Path<i64>,
) -> Result<Response, ApiError> {
    let gw = &state.gateway;
    let deleted = match gw.store.get_token(id).await {
        Ok(token) => gw.store.delete_token(id).await.map(|()| token),
        Err(e) => Err(e),
    };
    match deleted {
        Ok(token) => {
            gw.store
                .record_token_activity(&activity(&token, "token_delete", &caller))
                .await;
            gw.record_event(
                &caller,
                SecurityEvent::info("token_delete_success", "api token deleted"),
            )
            .await;
            Ok(Json(json!({ "message": "token deleted" })).into_response())
        },
        Err(e) => {
            gw.record_event(
                &caller,
                SecurityEvent::warning("token_delete_failed", e.to_string()),
            )
            .await;
            Err(e.into())
        },
    }
}

// ── Activity log ─────────────────────────────────────────────────────────────

#[derive(Deserialize)]
struct LogsQuery {
    page: Option<u32>,
    page_size: Option<u32>,
}

async fn list_logs_handler(
    State(state): State<AppState>,
    SessionOnly(_session): SessionOnly,
    Query(query): Query<LogsQuery>,
) -> Result<Response, ApiError> {
    let logs = state
        .gateway
        .store
        .list_token_logs(Page::new(query.page, query.page_size))
        .await?;
    Ok(Json(logs).into_response())
}

#[derive(Deserialize)]
struct CleanupQuery {
    days: Option<String>,
}

#[derive(Deserialize)]
struct CleanupRequest {
    days: i64,
}

async fn cleanup_logs_handler(
    State(state): State<AppState>,
    SessionOnly(_session): SessionOnly,
    caller: Caller,
    Query(query): Query<CleanupQuery>,
) -> Result<Response, ApiError> {
    let days = query
        .days
        .as_deref()
        .and_then(|d| d.trim().parse::<i64>().ok())
        .ok_or_else(invalid_days)?;
    cleanup_logs(&state, &caller, days).await
}

async fn cleanup_logs_post_handler(
    State(state): State<AppState>,
    SessionOnly(_session): SessionOnly,
    caller: Caller,
    ApiJson(body): ApiJson<CleanupRequest>,
) -> Result<Response, ApiError> {
    cleanup_logs(&state, &caller, body.days).await
}

async fn cleanup_logs(state: &AppState, caller: &Caller, days: i64) -> Result<Response, ApiError> {
    let days = u32::try_from(days)
        .ok()
        .filter(|d| *d > 0)
        .ok_or_else(invalid_days)?;
    let gw = &state.gateway;
    let deleted = gw.store.cleanup_token_logs(days).await?;
    gw.record_event(
        caller,
        SecurityEvent::info("token_logs_cleanup", format!("removed {deleted} token log entries")),
    )
    .await;
    Ok(Json(json!({ "deleted": deleted, "days": days })).into_response())
}

fn invalid_days() -> ApiError {
    ApiError::bad_request("invalid_days", "days must be a positive number")
}
