//! Credit balance request/response types.

use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Request body for `POST /api/credits` (manual grant).
///
/// `amount` is kept as raw JSON so a float or string is reported as a validation error
/// instead of a deserialization failure.
#[derive(Debug, Deserialize)]
pub struct AddCreditsRequest {
    pub amount: Option<serde_json::Value>,
    pub reason: Option<String>,
}

/// Request body for `PUT /api/credits` (internal deduction).
#[derive(Debug, Deserialize)]
pub struct DeductCreditsRequest {
    pub amount: Option<serde_json::Value>,
}

/// Current balance of the authenticated caller.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreditsResponse {
    pub success: bool,
    pub credits: i64,
    pub user_id: Uuid,
}

/// Parse a positive integer credit amount from a JSON value.
pub fn positive_amount(value: Option<&serde_json::Value>) -> Option<i64> {
    value.and_then(serde_json::Value::as_i64).filter(|amount| *amount > 0)
}
