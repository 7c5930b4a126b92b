use std::net::{IpAddr, SocketAddr};

use {
    anzuimg_auth::{
        AuthError, AuthIdentity, ClientContext, Denied, RequestInfo, Scope, SecurityEvent,
        Session, TokenActivity, TokenType,
    },
    axum::{
        Json,
        extract::{ConnectInfo, FromRequest, FromRequestParts, Request, State},
        http::{StatusCode, header::USER_AGENT, request::Parts},
        middleware::Next,
        response::{IntoResponse, Response},
    },
    serde::de::DeserializeOwned,
    tracing::debug,
};

use crate::{error::ApiError, server::AppState};

// ── Caller ───────────────────────────────────────────────────────────────────

/// Who sent the request, after proxy headers have been weighed against the
/// trusted-proxy list.
#[derive(Debug, Clone)]
pub struct Caller {
    pub ip: IpAddr,
    pub user_agent: String,
    pub method: String,
    pub path: String,
}

impl Caller {
    pub fn request_info(&self) -> RequestInfo {
        RequestInfo::new(self.ip, self.method.clone(), self.path.clone())
    }

    pub fn context(&self) -> ClientContext {
        ClientContext::new(self.ip, self.user_agent.clone())
    }
}

impl FromRequestParts<AppState> for Caller {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let Some(ConnectInfo(peer)) = parts.extensions.get::<ConnectInfo<SocketAddr>>() else {
            return Err(AuthError::Internal(anyhow::anyhow!(
                "router served without connect info"
            ))
            .into());
        };
        let ip = state.gateway.client_ip.resolve(*peer, &parts.headers);
        let user_agent = parts
            .headers
            .get(USER_AGENT)
            .and_then(|v| v.to_str().ok())
            .unwrap_or_default()
            .to_string();
        Ok(Self {
            ip,
            user_agent,
            method: parts.method.to_string(),
            path: parts.uri.path().to_string(),
        })
    }
}

// ── Identity extractors ──────────────────────────────────────────────────────

/// The identity [`require_auth`] attached to the request.
pub struct Authenticated(pub AuthIdentity);

impl<S: Send + Sync> FromRequestParts<S> for Authenticated {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, _state: &S) -> Result<Self, ApiError> {
        parts
            .extensions
            .get::<AuthIdentity>()
            .cloned()
            .map(Self)
            .ok_or_else(unauthenticated)
    }
}

/// A browser session. API tokens are refused with `session_required` and the
/// refusal is written to the security log.
pub struct SessionOnly(pub Session);

impl FromRequestParts<AppState> for SessionOnly {
    type Rejection = ApiError;

    async fn from_request_parts(parts: &mut Parts, state: &AppState) -> Result<Self, ApiError> {
        let Authenticated(identity) = Authenticated::from_request_parts(parts, state).await?;
        match identity.require_session() {
            Ok(session) => Ok(Self(session.clone())),
            Err(e) => {
                let caller = Caller::from_request_parts(parts, state).await?;
                state
                    .gateway
                    .record_event(
                        &caller,
                        SecurityEvent::warning("token_session_required", e.to_string()),
                    )
                    .await;
                Err(e.into())
            },
        }
    }
}

fn unauthenticated() -> ApiError {
    ApiError::new(
        StatusCode::UNAUTHORIZED,
        "session_or_token_invalid",
        "invalid or expired session or token",
    )
}

// ── Middleware ───────────────────────────────────────────────────────────────

/// Resolve the caller's credential and attach the [`AuthIdentity`], or answer
/// 401. Requests made with an API token are appended to the token log.
pub async fn require_auth(
    State(state): State<AppState>,
    caller: Caller,
    mut request: Request,
    next: Next,
) -> Response {
    let identity = match state.gateway.gate.authorize(request.headers(), caller.ip).await {
        Ok(identity) => identity,
        Err(AuthError::InvalidCredential) => return unauthenticated().into_response(),
        Err(AuthError::Forbidden(denied @ Denied::TokenIpNotAllowed)) => {
            state
                .gateway
                .record_event(
                    &caller,
                    SecurityEvent::warning("token_ip_denied", denied.to_string()),
                )
                .await;
            return unauthenticated().into_response();
        },
        Err(e) => return ApiError::from(e).into_response(),
    };

    if let AuthIdentity::ApiToken(token) = &identity {
        let activity = TokenActivity {
            method: caller.method.clone(),
            path: caller.path.clone(),
            ip_address: caller.ip.to_string(),
            user_agent: caller.user_agent.clone(),
            ..TokenActivity::new(token, "api_request")
        };
        state.gateway.store.record_token_activity(&activity).await;
    }

    request.extensions_mut().insert(identity);
    next.run(request).await
}

// ── Guards ───────────────────────────────────────────────────────────────────

/// Require one of `scopes` from an API token. Sessions pass. A refusal is
/// written to the security log.
pub async fn guard_scope(
    state: &AppState,
    identity: &AuthIdentity,
    caller: &Caller,
    scopes: &[Scope],
) -> Result<(), ApiError> {
    denied_or_logged(state, caller, identity.require_any_scope(scopes)).await
}

/// Require an API token of one of the `allowed` types. Sessions pass.
pub async fn guard_token_type(
    state: &AppState,
    identity: &AuthIdentity,
    caller: &Caller,
    allowed: &[TokenType],
) -> Result<(), ApiError> {
    denied_or_logged(state, caller, identity.require_token_type(allowed)).await
}

async fn denied_or_logged(
    state: &AppState,
    caller: &Caller,
    outcome: Result<(), AuthError>,
) -> Result<(), ApiError> {
    if let Err(AuthError::Forbidden(Denied::TokenScope)) = &outcome {
        debug!(path = %caller.path, "api token scope denied");
        state
            .gateway
            .record_event(
                caller,
                SecurityEvent::warning("token_scope_denied", "insufficient api token scope"),
            )
            .await;
    }
    outcome.map_err(ApiError::from)
}

// ── JSON bodies ──────────────────────────────────────────────────────────────

/// `Json` whose rejection is an [`ApiError`] (`invalid_request`).
pub struct ApiJson<T>(pub T);

impl<S, T> FromRequest<S> for ApiJson<T>
where
    S: Send + Sync,
    T: DeserializeOwned,
{
    type Rejection = ApiError;

    async fn from_request(req: Request, state: &S) -> Result<Self, ApiError> {
        match Json::<T>::from_request(req, state).await {
            Ok(Json(value)) => Ok(Self(value)),
            Err(rejection) => Err(ApiError::bad_request(
                "invalid_request",
                rejection.body_text(),
            )),
        }
    }
}
