//! HTTP gateway: the auth API and the guards in front of the image API.
//!
//! Routes are served under `/api/v1`. Public auth routes sit beside the
//! session-only management routes; everything else passes through
//! [`auth_middleware::require_auth`] first.

pub mod api_routes;
pub mod auth_middleware;
pub mod auth_routes;
pub mod error;
pub mod server;
pub mod state;
pub mod token_routes;

pub use {
    error::ApiError,
    server::{API_PREFIX, AppState, build_gateway_app, start_gateway},
    state::GatewayState,
};
