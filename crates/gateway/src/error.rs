//! JSON error responses.

use {
    anzuimg_auth::AuthError,
    axum::{
        Json,
        http::{HeaderValue, StatusCode, header::RETRY_AFTER},
        response::{IntoResponse, Response},
    },
    chrono::{DateTime, SecondsFormat, Utc},
    serde_json::json,
    tracing::error,
};

/// An error as returned to HTTP callers: `{"code", "message"}` with a stable
/// machine-readable code.
#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    code: &'static str,
    message: String,
    unlock_at: Option<DateTime<Utc>>,
}

impl ApiError {
    pub fn new(status: StatusCode, code: &'static str, message: impl Into<String>) -> Self {
        Self {
            status,
            code,
            message: message.into(),
            unlock_at: None,
        }
    }

    pub fn bad_request(code: &'static str, message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, code, message)
    }

    pub fn passkey_unavailable() -> Self {
        Self::new(
            StatusCode::SERVICE_UNAVAILABLE,
            "passkey_unavailable",
            "passkey service not available",
        )
    }

    /// Replace the code of an error, keeping its status. Used where an
    /// endpoint reports a failure under its own name (e.g. `session_invalid`).
    #[must_use]
    pub fn with_code(mut self, code: &'static str, message: impl Into<String>) -> Self {
        self.code = code;
        self.message = message.into();
        self
    }

    pub fn status(&self) -> StatusCode {
        self.status
    }

    pub fn code(&self) -> &'static str {
        self.code
    }
}

impl From<AuthError> for ApiError {
    fn from(err: AuthError) -> Self {
        let code = err.code();
        let display = err.to_string();
        match err {
            AuthError::InvalidCredential => {
                Self::new(StatusCode::UNAUTHORIZED, code, "invalid credentials")
            },
            AuthError::RateLimited { unlock_at } => Self {
                unlock_at: Some(unlock_at),
                ..Self::new(StatusCode::TOO_MANY_REQUESTS, code, display)
            },
            AuthError::Forbidden(_) => Self::new(StatusCode::FORBIDDEN, code, display),
            AuthError::NotFound(_) => Self::new(StatusCode::NOT_FOUND, code, display),
            AuthError::Invalid(message) => Self::bad_request(code, message),
            AuthError::ServiceUnavailable(message) => {
                Self::new(StatusCode::SERVICE_UNAVAILABLE, code, message)
            },
            AuthError::Internal(source) => {
                error!(error = ?source, "request failed");
                Self::new(
                    StatusCode::INTERNAL_SERVER_ERROR,
                    code,
                    "internal server error",
                )
            },
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let mut body = json!({
            "code": self.code,
            "message": self.message,
        });
        if let Some(unlock_at) = self.unlock_at {
            body["unlock_time"] = unlock_at
                .to_rfc3339_opts(SecondsFormat::Secs, true)
                .into();
        }

        let mut response = (self.status, Json(body)).into_response();
        if let Some(unlock_at) = self.unlock_at {
            let secs = retry_after_secs(unlock_at, Utc::now());
            if let Ok(value) = HeaderValue::from_str(&secs.to_string()) {
                response.headers_mut().insert(RETRY_AFTER, value);
            }
        }
        response
    }
}

/// Whole seconds until `unlock_at`, rounded up, never below one.
fn retry_after_secs(unlock_at: DateTime<Utc>, now: DateTime<Utc>) -> i64 {
    let millis = (unlock_at - now).num_milliseconds();
    ((millis + 999) / 1000).max(1)
}
