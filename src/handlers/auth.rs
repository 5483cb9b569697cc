//! Registration, login and session handlers.
//!
//! - POST /api/auth/register - Create a user
//! - POST /api/auth/login - Open a session and set the session cookie
//! - POST /api/auth/logout - Close the session and clear the cookie
//! - GET /api/auth/me - Profile of the session user

use axum::{
    Extension, Json,
    extract::{State, rejection::JsonRejection},
    http::{HeaderMap, HeaderValue, header::SET_COOKIE, header::USER_AGENT},
    response::{IntoResponse, Response},
};
use serde_json::{Value, json};

use crate::app::AppState;
use crate::error::AppError;
use crate::models::user::{LoginRequest, RegisterRequest, UserProfile};
use crate::services::accounts::ClientInfo;
use crate::services::authenticator::Identity;

/// Create a user account.
///
/// # Response
///
/// - **Success (200 OK)**
/// - **Error (400)**: Missing field, invalid email, mismatched or weak password
/// - **Error (409)**: Email already registered
///
/// ```json
/// {
///   "success": true,
///   "message": "User created successfully",
///   "user": { "id": "...", "email": "ops@example.com", "firstName": "Ada", "lastName": "Lovelace" }
/// }
/// ```
pub async fn register(
    State(state): State<AppState>,
    payload: Result<Json<RegisterRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(request) = payload?;

    let user = state.accounts.register(request).await?;

    Ok(Json(json!({
        "success": true,
        "message": "User created successfully",
        "user": {
            "id": user.id,
            "email": user.email,
            "firstName": user.first_name,
            "lastName": user.last_name,
        }
    })))
}

/// Log in with email and password.
///
/// On success the session token is only sent in the `Set-Cookie` header.
///
/// # Response
///
/// - **Success (200 OK)**: `{ success, message, user }` where `user` is the full profile
/// - **Error (400)**: Missing email or password
/// - **Error (401)**: Invalid credentials, or the account is deactivated
pub async fn login(
    State(state): State<AppState>,
    headers: HeaderMap,
    payload: Result<Json<LoginRequest>, JsonRejection>,
) -> Result<Response, AppError> {
    let Json(request) = payload?;

    let client = ClientInfo {
        user_agent: header_string(&headers, USER_AGENT.as_str()),
        ip_address: client_ip(&headers),
    };

    let (user, session) = state.accounts.login(request, client).await?;

    let cookie = session_cookie(
        state.gateway.authenticator().cookie_name(),
        &session.token,
        state.accounts.session_ttl().num_seconds(),
        !state.config.is_development(),
    );

    let body = Json(json!({
        "success": true,
        "message": "Login successful",
        "user": UserProfile::from(user),
    }));

    Ok(([(SET_COOKIE, cookie)], body).into_response())
}

/// Close the current session, if any, and expire the cookie.
pub async fn logout(
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Response, AppError> {
    let authenticator = state.gateway.authenticator();
    state
        .accounts
        .logout(authenticator.session_token(&headers))
        .await?;

    let cookie = session_cookie(
        authenticator.cookie_name(),
        "",
        0,
        !state.config.is_development(),
    );

    let body = Json(json!({
        "success": true,
        "message": "Logout successful",
    }));

    Ok(([(SET_COOKIE, cookie)], body).into_response())
}

/// Profile of the session user, including the current balance.
pub async fn me(Extension(identity): Extension<Identity>) -> Json<Value> {
    Json(json!({
        "success": true,
        "user": UserProfile::from(identity.user),
    }))
}

/// `Set-Cookie` value for the session cookie. `max_age_secs = 0` expires it.
pub fn session_cookie(name: &str, token: &str, max_age_secs: i64, secure: bool) -> HeaderValue {
    let mut cookie =
        format!("{name}={token}; HttpOnly; SameSite=Lax; Path=/; Max-Age={max_age_secs}");
    if secure {
        cookie.push_str("; Secure");
    }
    // Token is hex and the name comes from config
    HeaderValue::from_str(&cookie).unwrap_or_else(|_| HeaderValue::from_static(""))
}

/// First `X-Forwarded-For` entry, else `X-Real-IP`.
pub fn client_ip(headers: &HeaderMap) -> Option<String> {
    header_string(headers, "x-forwarded-for")
        .and_then(|value| {
            value
                .split(',')
                .next()
                .map(str::trim)
                .filter(|ip| !ip.is_empty())
                .map(str::to_string)
        })
        .or_else(|| header_string(headers, "x-real-ip"))
}

fn header_string(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(str::trim)
        .filter(|value| !value.is_empty())
        .map(str::to_string)
}
