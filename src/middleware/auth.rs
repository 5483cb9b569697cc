//! Authentication middleware for account-management routes.
//!
//! Metered routes authenticate inside the gateway so that every outcome is logged in
//! pipeline order. Unmetered routes (profile, API keys, balance) use these layers instead:
//!
//! 1. Resolve the caller with the gateway's authenticator under a fixed mode
//! 2. Inject the [`Identity`] into the request extensions
//! 3. Reject with 401 (or 500 when the store fails)

use axum::{
    extract::{Request, State},
    middleware::Next,
    response::Response,
};

use crate::app::AppState;
use crate::error::AppError;
use crate::services::authenticator::{AuthMode, Identity};

async fn authenticate(
    state: &AppState,
    mut request: Request,
    next: Next,
    mode: AuthMode,
) -> Result<Response, AppError> {
    let identity: Identity = state
        .gateway
        .authenticator()
        .authenticate(request.headers(), mode)
        .await
        .inspect_err(|failure| {
            tracing::warn!(
                path = %request.uri().path(),
                reason = %failure,
                "Authentication failed"
            );
        })?;

    // Route handlers can now extract this using Extension<Identity>
    request.extensions_mut().insert(identity);

    Ok(next.run(request).await)
}

/// Session cookie only.
pub async fn require_session(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    authenticate(&state, request, next, AuthMode::Session).await
}

/// API key only.
pub async fn require_api_key(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    authenticate(&state, request, next, AuthMode::ApiKey).await
}

/// API key when an `Authorization` header is sent, the session cookie otherwise.
pub async fn require_api_key_or_session(
    State(state): State<AppState>,
    request: Request,
    next: Next,
) -> Result<Response, AppError> {
    authenticate(&state, request, next, AuthMode::ApiKeyOrSession).await
}
