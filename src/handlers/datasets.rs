//! Dataset handlers, metered by the gateway.
//!
//! - GET /api/datasets - Sample datasets, 1 credit
//! - POST /api/datasets - Data contribution, free and rewarded

use axum::{
    extract::{Query, RawQuery, State, rejection::QueryRejection},
    http::HeaderMap,
    response::Response,
};
use serde_json::json;

use crate::app::AppState;
use crate::services::authenticator::AuthMode;
use crate::services::datasets::{
    ContributionRequest, DataContribution, DatasetLookup, DatasetQuery,
};
use crate::services::gateway::{EndpointPolicy, Unparseable};
use crate::services::rate_limiter::RateLimit;

pub const LIST_POLICY: EndpointPolicy =
    EndpointPolicy::metered("/api/datasets", AuthMode::ApiKey, 1)
        .with_rate_limit(RateLimit::per_hour(100));

pub const CONTRIBUTE_POLICY: EndpointPolicy =
    EndpointPolicy::metered("/api/datasets", AuthMode::ApiKey, 0);

/// Fetch a sample dataset.
///
/// # Query Parameters
///
/// - `type`: `logistics`, `walkability`, `gis` or `all` (default)
/// - `format`: echoed back in `meta.format`, default `json`
/// - `limit`: maximum records per list, default 100
///
/// A query string that does not parse is rejected with 400 after authentication and
/// logged without charge.
pub async fn list_datasets(
    State(state): State<AppState>,
    headers: HeaderMap,
    RawQuery(raw_query): RawQuery,
    query: Result<Query<DatasetQuery>, QueryRejection>,
) -> Response {
    match query {
        Ok(Query(query)) => {
            let request_data = query.log_data();
            state
                .gateway
                .run(&headers, &LIST_POLICY, Some(request_data), DatasetLookup::new(query))
                .await
        }
        Err(rejection) => {
            let request_data = json!({ "query": raw_query });
            let op = Unparseable::new(rejection.body_text());
            state
                .gateway
                .run(&headers, &LIST_POLICY, Some(request_data), op)
                .await
        }
    }
}

/// Contribute data in exchange for reward credits.
///
/// A body that is not JSON is treated as empty and fails validation.
pub async fn contribute(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: axum::body::Bytes,
) -> Response {
    let request: ContributionRequest = serde_json::from_slice(&body).unwrap_or_default();
    let op = DataContribution::new(request);
    let request_data = op.log_data();

    state
        .gateway
        .run(&headers, &CONTRIBUTE_POLICY, Some(request_data), op)
        .await
}
