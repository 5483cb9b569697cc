//! Usage history handler.

use axum::{
    Extension, Json,
    extract::{Query, State},
};
use serde_json::{Value, json};

use crate::app::AppState;
use crate::error::AppError;
use crate::models::usage::{UsageLogResponse, UsageQuery, UsageSummary};
use crate::services::authenticator::Identity;
use crate::store::{UsageStore, with_timeout};

/// Recent usage of the caller with a summary, and per-day aggregates when asked.
///
/// # Endpoint
///
/// `GET /api/usage?limit=100&days=30&stats=true`
///
/// # Authentication
///
/// API key or session.
///
/// # Response (200 OK)
///
/// ```json
/// {
///   "user": { "id": "...", "email": "ops@example.com", "currentCredits": 42 },
///   "summary": { "totalRequests": 3, "totalCreditsUsed": 2, "successfulRequests": 2, "successRate": 66.7 },
///   "usage": [ { "id": "...", "endpoint": "/api/datasets", "creditsUsed": 1, "status": "success", ... } ],
///   "analytics": { "dailyStats": [ ... ], "period": "30 days" }
/// }
/// ```
///
/// The summary covers the returned entries only, not the whole history.
pub async fn get_usage(
    State(state): State<AppState>,
    Extension(identity): Extension<Identity>,
    Query(query): Query<UsageQuery>,
) -> Result<Json<Value>, AppError> {
    let user_id = identity.user_id();
    let timeout = state.store_timeout();

    let logs = with_timeout(
        "list_usage",
        timeout,
        state.store.list_usage(user_id, query.limit()),
    )
    .await?;

    let summary = UsageSummary::from_logs(&logs);
    let usage: Vec<UsageLogResponse> = logs.into_iter().map(UsageLogResponse::from).collect();

    let mut body = json!({
        "user": {
            "id": user_id,
            "email": identity.user.email,
            "currentCredits": identity.user.credits,
        },
        "summary": summary,
        "usage": usage,
    });

    if query.include_stats() {
        let days = query.days();
        let daily = with_timeout(
            "daily_usage",
            timeout,
            state.store.daily_usage(user_id, days),
        )
        .await?;

        body["analytics"] = json!({
            "dailyStats": daily,
            "period": format!("{days} days"),
        });
    }

    Ok(Json(body))
}
