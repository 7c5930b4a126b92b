//! Protected API endpoints. The image service itself lives elsewhere; these
//! routes carry the guards every image endpoint is mounted with.

use {
    anzuimg_auth::{Page, Scope, TokenType},
    axum::{
        Json, Router,
        extract::{Query, State},
        http::StatusCode,
        response::{IntoResponse, Response},
        routing::get,
    },
    serde::Deserialize,
    serde_json::json,
};

use crate::{
    auth_middleware::{Authenticated, Caller, guard_scope, guard_token_type},
    error::ApiError,
    server::AppState,
};

pub fn api_router() -> Router<AppState> {
    Router::new()
        .route("/ping", get(ping_handler))
        .route("/images", get(list_images_handler).post(upload_image_handler))
}

async fn ping_handler(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    caller: Caller,
) -> Result<Response, ApiError> {
    guard_token_type(&state, &identity, &caller, &[TokenType::Full]).await?;
    Ok(Json(json!({
        "message": "pong",
        "auth_method": identity.method(),
    }))
    .into_response())
}

#[derive(Deserialize)]
struct ListQuery {
    page: Option<u32>,
    page_size: Option<u32>,
}

async fn list_images_handler(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    caller: Caller,
    Query(query): Query<ListQuery>,
) -> Result<Response, ApiError> {
    guard_scope(&state, &identity, &caller, &[Scope::ImagesList]).await?;
    let page = Page::new(query.page, query.page_size);
    Ok(Json(json!({
        "items": [],
        "total": 0,
        "page": page.page,
        "page_size": page.page_size,
    }))
    .into_response())
}

async fn upload_image_handler(
    State(state): State<AppState>,
    Authenticated(identity): Authenticated,
    caller: Caller,
) -> Result<Response, ApiError> {
    guard_scope(&state, &identity, &caller, &[Scope::ImagesUpload]).await?;
    Err(ApiError::new(
        StatusCode::NOT_IMPLEMENTED,
        "upload_unavailable",
        "image storage is not configured on this server",
    ))
}
