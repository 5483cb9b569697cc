//! Credit balance handlers.
//!
//! One path, three credential modes:
//! - GET /api/credits - API key or session
//! - POST /api/credits - Session only, manual grant
//! - PUT /api/credits - API key only, internal deduction

use axum::{
    Extension, Json,
    extract::{State, rejection::JsonRejection},
};
use serde_json::{Value, json};

use crate::app::AppState;
use crate::error::AppError;
use crate::models::credits::{
    AddCreditsRequest, CreditsResponse, DeductCreditsRequest, positive_amount,
};
use crate::services::authenticator::Identity;
use crate::services::credit_ledger::Reservation;

/// Balance of the caller as read during authentication.
pub async fn get_credits(Extension(identity): Extension<Identity>) -> Json<CreditsResponse> {
    Json(CreditsResponse {
        success: true,
        credits: identity.user.credits,
        user_id: identity.user_id(),
    })
}

/// Grant credits to the session user.
///
/// # Request Body
///
/// ```json
/// { "amount": 50, "reason": "Invoice 2025-001" }
/// ```
///
/// # Response
///
/// - **Success (200 OK)**: `{ success, message, reason, credits }`
/// - **Error (400)**: `amount` missing or not a positive integer
pub async fn add_credits(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<AddCreditsRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(request) = payload?;

    let amount = positive_amount(request.amount.as_ref())
        .ok_or_else(|| AppError::InvalidRequest("Valid amount is required".to_string()))?;

    let balance = state
        .gateway
        .ledger()
        .add(identity.user_id(), amount)
        .await?;

    let reason = request
        .reason
        .filter(|reason| !reason.trim().is_empty())
        .unwrap_or_else(|| "Manual credit addition".to_string());

    tracing::info!(user_id = %identity.user_id(), amount, reason = %reason, "Credits added");

    Ok(Json(json!({
        "success": true,
        "message": format!("{amount} credits added successfully"),
        "reason": reason,
        "credits": balance,
    })))
}

/// Deduct credits from the key owner, all or nothing.
///
/// # Response
///
/// - **Success (200 OK)**: `{ success, message, remainingCredits }`
/// - **Error (400)**: `amount` missing or not a positive integer
/// - **Error (402)**: `{ error, required, available }`, nothing deducted
pub async fn deduct_credits(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    payload: Result<Json<DeductCreditsRequest>, JsonRejection>,
) -> Result<Json<Value>, AppError> {
    let Json(request) = payload?;

    let amount = positive_amount(request.amount.as_ref())
        .ok_or_else(|| AppError::InvalidRequest("Valid amount is required".to_string()))?;

    match state
        .gateway
        .ledger()
        .reserve(identity.user_id(), amount)
        .await?
    {
        Reservation::Reserved { remaining } => {
            tracing::info!(user_id = %identity.user_id(), amount, remaining, "Credits deducted");
            Ok(Json(json!({
                "success": true,
                "message": format!("{amount} credits deducted successfully"),
                "remainingCredits": remaining,
            })))
        }
        Reservation::Insufficient { available } => Err(AppError::InsufficientCredits {
            required: amount,
            available,
        }),
    }
}
