//! Gateway properties exercised with small custom operations.

mod common;

use std::time::Duration;

use async_trait::async_trait;
use axum::body::to_bytes;
use axum::http::{HeaderMap, HeaderValue, StatusCode, header::AUTHORIZATION, header::RETRY_AFTER};
use axum::response::Response;
use serde_json::{Value, json};

use common::{bearer, spawn_app};
use credit_gateway::services::authenticator::{AuthMode, Identity};
use credit_gateway::services::gateway::{EndpointPolicy, Operation, OperationError, OperationOutput};
use credit_gateway::services::rate_limiter::RateLimit;

struct Echo;

#[async_trait]
impl Operation for Echo {
    async fn execute(self, caller: Option<&Identity>) -> Result<OperationOutput, OperationError> {
        Ok(OperationOutput::new(json!({
            "caller": caller.map(|identity| identity.user_id()),
        })))
    }
}

fn key_headers(api_key: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    headers.insert(AUTHORIZATION, HeaderValue::from_str(&bearer(api_key)).unwrap());
    headers
}

async fn split(response: Response) -> (StatusCode, HeaderMap, Value) {
    let status = response.status();
    let headers = response.headers().clone();
    let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
    (status, headers, serde_json::from_slice(&bytes).unwrap())
}

#[tokio::test]
async fn second_costly_call_is_refused_without_charge() {
    let app = spawn_app();
    let caller = app.seed_caller("ops@example.com", 10).await;
    let headers = key_headers(&caller.api_key);
    let policy = EndpointPolicy::metered("/api/route-optimize", AuthMode::ApiKey, 7);

    let (status, _, body) = split(app.state.gateway.run(&headers, &policy, None, Echo).await).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["meta"]["creditsUsed"], 7);
    assert_eq!(body["meta"]["remainingCredits"], 3);

    let (status, _, body) = split(app.state.gateway.run(&headers, &policy, None, Echo).await).await;
    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(body["required"], 7);
    assert_eq!(body["available"], 3);

    assert_eq!(app.balance(caller.user_id).await, 3);

    let entries = app.store.usage_entries();
    assert_eq!(entries.len(), 2);
    assert_eq!(
        (entries[0].status.as_str(), entries[0].credits_used),
        ("success", 7)
    );
    assert_eq!(
        (entries[1].status.as_str(), entries[1].credits_used),
        ("insufficient_credits", 0)
    );
}

#[tokio::test]
async fn rate_limited_calls_are_logged_and_free() {
    let app = spawn_app();
    let caller = app.seed_caller("ops@example.com", 10).await;
    let headers = key_headers(&caller.api_key);
    let policy = EndpointPolicy::metered("/api/geocode", AuthMode::ApiKey, 1)
        .with_rate_limit(RateLimit::new(2, Duration::from_millis(1000)));

    for remaining in ["1", "0"] {
        let (status, response_headers, _) =
            split(app.state.gateway.run(&headers, &policy, None, Echo).await).await;
        assert_eq!(status, StatusCode::OK);
        assert_eq!(response_headers["x-ratelimit-remaining"], remaining);
    }

    let (status, response_headers, body) =
        split(app.state.gateway.run(&headers, &policy, None, Echo).await).await;
    assert_eq!(status, StatusCode::TOO_MANY_REQUESTS);
    let retry_after = body["retryAfter"].as_u64().unwrap();
    assert!(retry_after <= 1);
    assert_eq!(
        response_headers[RETRY_AFTER].to_str().unwrap(),
        retry_after.to_string()
    );

    assert_eq!(app.balance(caller.user_id).await, 8);

    let entries = app.store.usage_entries();
    assert_eq!(entries.len(), 3);
    assert_eq!(entries[2].status, "rate_limited");
    assert_eq!(entries[2].credits_used, 0);
}

#[tokio::test]
async fn windows_are_scoped_per_user() {
    let app = spawn_app();
    let first = app.seed_caller("a@example.com", 10).await;
    let second = app.seed_caller("b@example.com", 10).await;
    let policy = EndpointPolicy::metered("/api/geocode", AuthMode::ApiKey, 1)
        .with_rate_limit(RateLimit::new(1, Duration::from_secs(60)));

    let gateway = &app.state.gateway;
    let ok = gateway.run(&key_headers(&first.api_key), &policy, None, Echo).await;
    assert_eq!(ok.status(), StatusCode::OK);

    let limited = gateway.run(&key_headers(&first.api_key), &policy, None, Echo).await;
    assert_eq!(limited.status(), StatusCode::TOO_MANY_REQUESTS);

    let other = gateway.run(&key_headers(&second.api_key), &policy, None, Echo).await;
    assert_eq!(other.status(), StatusCode::OK);
}

#[tokio::test]
async fn usage_write_failure_does_not_change_the_response() {
    let app = spawn_app();
    let caller = app.seed_caller("ops@example.com", 10).await;
    app.store.fail_usage_writes(true);

    let policy = EndpointPolicy::metered("/api/geocode", AuthMode::ApiKey, 2);
    let (status, _, body) = split(
        app.state
            .gateway
            .run(&key_headers(&caller.api_key), &policy, None, Echo)
            .await,
    )
    .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(body["data"]["caller"], json!(caller.user_id));
    assert_eq!(app.balance(caller.user_id).await, 8);
    assert!(app.store.usage_entries().is_empty());
}
