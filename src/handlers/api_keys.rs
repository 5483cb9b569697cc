//! API key management handlers.
//!
//! All routes require a session; keys cannot manage keys.
//!
//! - GET /api/auth/api-keys - List the caller's keys
//! - POST /api/auth/api-keys - Issue a key
//! - DELETE /api/auth/api-keys - Delete a key
//! - PUT /api/auth/api-keys/toggle - Enable or disable a key

use axum::{
    Extension, Json,
    extract::{State, rejection::JsonRejection},
};
use serde_json::{Value, json};

use crate::app::AppState;
use crate::error::AppError;
use crate::models::api_key::{
    ApiKeyResponse, CreateApiKeyRequest, CreatedApiKeyResponse, DeleteApiKeyRequest,
    ToggleApiKeyRequest,
};
use crate::services::authenticator::Identity;

/// List the caller's keys, newest first. Raw keys are never returned here.
pub async fn list_api_keys(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
) -> Result<Json<Value>, AppError> {
    let keys: Vec<ApiKeyResponse> = state
        .accounts
        .list_api_keys(identity.user_id())
        .await?
        .into_iter()
        .map(ApiKeyResponse::from)
        .collect();

    Ok(Json(json!({
        "success": true,
        "apiKeys": keys,
    })))
}

/// Issue a key.
///
/// # Response
///
/// - **Success (200 OK)**: the raw key, shown this one time
/// - **Error (400)**: Missing or blank name
/// - **Error (429)**: Key cap reached
pub async fn create_api_key(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<CreateApiKeyRequest>, JsonRejection>,
) -> Result<Json<CreatedApiKeyResponse>, AppError> {
    let Json(request) = payload?;

    let (api_key, raw_key) = state
        .accounts
        .create_api_key(identity.user_id(), request.name)
        .await?;

    Ok(Json(CreatedApiKeyResponse {
        success: true,
        id: api_key.id,
        api_key: raw_key,
        message: "API key created successfully. Store it securely - it will not be shown again."
            .to_string(),
    }))
}

pub async fn delete_api_key(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<DeleteApiKeyRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(request) = payload?;

    state
        .accounts
        .delete_api_key(identity.user_id(), request.key_id)
        .await?;

    Ok(Json(json!({
        "success": true,
        "message": "API key deleted successfully",
    })))
}

pub async fn toggle_api_key(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<ToggleApiKeyRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(request) = payload?;

    let is_active = state
        .accounts
        .set_api_key_active(identity.user_id(), request.key_id, request.is_active.as_ref())
        .await?;

    let verb = if is_active { "activated" } else { "deactivated" };
    Ok(Json(json!({
        "success": true,
        "message": format!("API key {verb} successfully"),
    })))
}
