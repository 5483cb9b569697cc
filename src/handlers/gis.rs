//! GIS analysis handler, metered by the gateway.

use std::time::Duration;

use axum::{body::Bytes, extract::State, http::HeaderMap, response::Response};
use serde_json::Value;

use crate::app::AppState;
use crate::services::authenticator::AuthMode;
use crate::services::gateway::EndpointPolicy;
use crate::services::gis::{AnalyzeRequest, GisAnalysis, analysis_cost};
use crate::services::rate_limiter::RateLimit;

pub const ANALYZE_ENDPOINT: &str = "/api/gis/analyze";

/// Policy for one analysis request; the cost depends on the requested type.
pub fn analyze_policy(analysis_type: Option<&str>) -> EndpointPolicy {
    EndpointPolicy::metered(ANALYZE_ENDPOINT, AuthMode::ApiKey, analysis_cost(analysis_type))
        .with_rate_limit(RateLimit::per_hour(50))
}

/// Run a mock spatial analysis.
///
/// # Endpoint
///
/// `POST /api/gis/analyze`
///
/// # Request Body
///
/// ```json
/// {
///   "analysisType": "buffer",
///   "data": { "geometry": { "type": "Point", "coordinates": [100.5, 13.7] } },
///   "parameters": { "bufferDistance": 250, "units": "meters" }
/// }
/// ```
///
/// # Response
///
/// - **Success (200 OK)**: gateway envelope with the analysis result under `data`
/// - **Error (400)**: missing or unknown `analysisType`, missing `data`, invalid geometry
/// - **Error (401/402/429)**: gateway rejections
///
/// A body that is not JSON is treated as empty and fails validation after
/// authentication, so the attempt is still logged.
pub async fn analyze(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let raw: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let request: AnalyzeRequest = serde_json::from_value(raw.clone()).unwrap_or_default();

    let policy = analyze_policy(request.analysis_type.as_deref());
    let latency = Duration::from_millis(state.config.simulated_latency_ms);

    state
        .gateway
        .run(&headers, &policy, Some(raw), GisAnalysis::new(request, latency))
        .await
}
