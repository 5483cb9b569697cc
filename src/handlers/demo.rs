//! Self-test handlers, metered by the gateway.
//!
//! - GET /api/demo - Caller details, 2 credits, occasionally fails
//! - POST /api/demo - Echo the body, 3 credits

use std::time::Duration;

use axum::{
    body::Bytes,
    extract::State,
    http::{HeaderMap, Method, Uri, header::USER_AGENT},
    response::Response,
};
use serde_json::Value;

use crate::app::AppState;
use crate::services::authenticator::AuthMode;
use crate::services::demo::{DemoEcho, DemoInfo, RequestInfo};
use crate::services::gateway::EndpointPolicy;
use crate::services::rate_limiter::RateLimit;

pub const INFO_POLICY: EndpointPolicy =
    EndpointPolicy::metered("/api/demo", AuthMode::ApiKey, 2)
        .with_rate_limit(RateLimit::per_minute(10));

pub const ECHO_POLICY: EndpointPolicy =
    EndpointPolicy::metered("/api/demo", AuthMode::ApiKey, 3)
        .with_rate_limit(RateLimit::per_minute(5));

/// The info request waits up to this many base latencies.
const INFO_LATENCY_FACTOR: u64 = 10;

/// Report the caller and request line.
///
/// Fails with a 500 for a `DEMO_ERROR_RATE` share of requests. The credits are kept
/// under the default charge policy, which makes this the quickest way to watch a failed
/// attempt being billed.
pub async fn info(
    State(state): State<AppState>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
) -> Response {
    let info = RequestInfo {
        method: method.to_string(),
        url: uri.to_string(),
        user_agent: headers
            .get(USER_AGENT)
            .and_then(|value| value.to_str().ok())
            .map(str::to_string),
    };
    let max_delay = Duration::from_millis(
        state
            .config
            .simulated_latency_ms
            .saturating_mul(INFO_LATENCY_FACTOR),
    );
    let op = DemoInfo::new(info, max_delay, state.config.demo_error_rate);

    state.gateway.run(&headers, &INFO_POLICY, None, op).await
}

/// Echo a JSON body back to the caller.
pub async fn echo(State(state): State<AppState>, headers: HeaderMap, body: Bytes) -> Response {
    let body: Value = serde_json::from_slice(&body).unwrap_or(Value::Null);
    let request_data = body.clone();

    state
        .gateway
        .run(&headers, &ECHO_POLICY, Some(request_data), DemoEcho::new(body))
        .await
}
