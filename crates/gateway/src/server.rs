use std::{net::SocketAddr, sync::Arc};

use {
    anzuimg_auth::spawn_sweeper,
    anzuimg_config::AnzuConfig,
    axum::{
        Router,
        extract::{Request, State},
        http::{
            HeaderName, HeaderValue,
            header::{AUTHORIZATION, COOKIE, REFERRER_POLICY, SET_COOKIE, X_CONTENT_TYPE_OPTIONS, X_FRAME_OPTIONS},
        },
        response::{IntoResponse, Json},
        routing::get,
    },
    sqlx::SqlitePool,
    tokio_util::sync::CancellationToken,
    tower_http::{
        catch_panic::CatchPanicLayer,
        request_id::{MakeRequestUuid, PropagateRequestIdLayer, SetRequestIdLayer},
        sensitive_headers::{SetSensitiveRequestHeadersLayer, SetSensitiveResponseHeadersLayer},
        set_header::SetResponseHeaderLayer,
        trace::TraceLayer,
    },
    tracing::{info, info_span, warn},
};

use crate::{
    api_routes::api_router,
    auth_middleware::require_auth,
    auth_routes::{public_router, session_router},
    state::GatewayState,
    token_routes::token_router,
};

/// All routes live under this prefix.
pub const API_PREFIX: &str = "/api/v1";

// ── Shared app state ─────────────────────────────────────────────────────────

#[derive(Clone)]
pub struct AppState {
    pub gateway: Arc<GatewayState>,
}

// ── Router ───────────────────────────────────────────────────────────────────

/// Build the gateway router (shared between production startup and tests).
///
/// Must be served with `into_make_service_with_connect_info::<SocketAddr>()`:
/// the caller's address comes from the connection.
pub fn build_gateway_app(state: Arc<GatewayState>) -> Router {
    let app_state = AppState { gateway: state };
    let auth_layer = axum::middleware::from_fn_with_state(app_state.clone(), require_auth);

    let auth = public_router().merge(
        session_router()
            .merge(token_router())
            .route_layer(auth_layer.clone()),
    );
    let api = api_router().route_layer(auth_layer);

    let v1 = Router::new()
        .route("/health", get(health_handler))
        .nest("/auth", auth)
        .merge(api);

    let sensitive = [
        AUTHORIZATION,
        COOKIE,
        HeaderName::from_static("x-session-token"),
        HeaderName::from_static("x-setup-token"),
    ];

    Router::new()
        .nest(API_PREFIX, v1)
        .layer(PropagateRequestIdLayer::x_request_id())
        .layer(
            TraceLayer::new_for_http().make_span_with(|request: &Request| {
                let request_id = request
                    .headers()
                    .get("x-request-id")
                    .and_then(|v| v.to_str().ok())
                    .unwrap_or("-");
                info_span!(
                    "http",
                    method = %request.method(),
                    path = %request.uri().path(),
                    request_id,
                )
            }),
        )
        .layer(SetSensitiveResponseHeadersLayer::new([SET_COOKIE]))
        .layer(SetSensitiveRequestHeadersLayer::new(sensitive))
        .layer(SetRequestIdLayer::x_request_id(MakeRequestUuid))
        .layer(SetResponseHeaderLayer::if_not_present(
            X_FRAME_OPTIONS,
            HeaderValue::from_static("DENY"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            X_CONTENT_TYPE_OPTIONS,
            HeaderValue::from_static("nosniff"),
        ))
        .layer(SetResponseHeaderLayer::if_not_present(
            REFERRER_POLICY,
            HeaderValue::from_static("strict-origin-when-cross-origin"),
        ))
        .layer(CatchPanicLayer::new())
        .with_state(app_state)
}

// ── Server startup ───────────────────────────────────────────────────────────

/// Open the database, start the sweeper and serve until Ctrl-C / SIGTERM.
/// The sweeper is stopped after in-flight requests have drained.
pub async fn start_gateway(config: &AnzuConfig) -> anyhow::Result<()> {
    let pool = SqlitePool::connect(&config.database.url).await?;
    let state = GatewayState::from_config(config, pool).await?;

    let cancel = CancellationToken::new();
    let sweeper = spawn_sweeper(state.sweep_targets(), state.sweep_interval, cancel.clone());

    let app = build_gateway_app(Arc::clone(&state));
    let listener =
        tokio::net::TcpListener::bind((config.server.bind.as_str(), config.server.port)).await?;
    let addr = listener.local_addr()?;
    info!(%addr, version = %state.version, "gateway listening");

    axum::serve(
        listener,
        app.into_make_service_with_connect_info::<SocketAddr>(),
    )
    .with_graceful_shutdown(shutdown_signal())
    .await?;

    cancel.cancel();
    if let Err(e) = sweeper.await {
        warn!(error = %e, "auth sweeper task failed");
    }
    info!("gateway stopped");
    Ok(())
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            warn!(error = %e, "failed to listen for ctrl-c");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut sig) => {
                sig.recv().await;
            },
            Err(e) => {
                warn!(error = %e, "failed to listen for SIGTERM");
                std::future::pending::<()>().await;
            },
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        () = ctrl_c => {},
        () = terminate => {},
    }
    info!("shutdown requested");
}

// ── Handlers ─────────────────────────────────────────────────────────────────

async fn health_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(serde_json::json!({
        "status": "ok",
        "version": state.gateway.version,
    }))
}
