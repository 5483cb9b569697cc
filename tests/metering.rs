//! Metered endpoints driven through the full router.

mod common;

use axum::body::Body;
use axum::http::{StatusCode, header::AUTHORIZATION};
use serde_json::json;

use common::{bearer, get, json_body, json_request, spawn_app, spawn_app_with, test_config};
use credit_gateway::config::Config;
use credit_gateway::services::usage_recorder::REDACTED;

#[tokio::test]
async fn analysis_charges_until_balance_runs_out() {
    let app = spawn_app();
    let caller = app.seed_caller("ops@example.com", 10).await;
    let body = json!({ "analysisType": "overlay", "data": [{ "id": 1 }, { "id": 2 }] });

    for expected_remaining in [7, 4, 1] {
        let (status, headers, response) = app
            .send(
                json_request("POST", "/api/gis/analyze")
                    .header(AUTHORIZATION, bearer(&caller.api_key))
                    .body(json_body(body.clone()))
                    .unwrap(),
            )
            .await;

        assert_eq!(status, StatusCode::OK);
        assert_eq!(response["success"], true);
        assert_eq!(response["meta"]["creditsUsed"], 3);
        assert_eq!(response["meta"]["remainingCredits"], expected_remaining);
        assert_eq!(response["meta"]["analysisType"], "overlay");
        assert_eq!(headers["x-ratelimit-limit"], "50");
    }

    let (status, _, response) = app
        .send(
            json_request("POST", "/api/gis/analyze")
                .header(AUTHORIZATION, bearer(&caller.api_key))
                .body(json_body(body))
                .unwrap(),
        )
        .await;

    assert_eq!(status, StatusCode::PAYMENT_REQUIRED);
    assert_eq!(response["error"], "Insufficient credits");
    assert_eq!(response["required"], 3);
    assert_eq!(response["available"], 1);
    assert_eq!(app.balance(caller.user_id).await, 1);

    let entries = app.store.usage_entries();
    let statuses: Vec<&str> = entries.iter().map(|e| e.status.as_str()).collect();
    assert_eq!(
        statuses,
        ["success", "success", "success", "insufficient_credits"]
    );
    assert_eq!(entries[3].credits_used, 0);
    assert!(entries.iter().all(|e| e.api_key_id.is_some()));
}

#[tokio::test]
async fn failed_analysis_keeps_the_charge() {
    let app = spawn_app();
    let caller = app.seed_caller("ops@example.com", 10).await;

    let (status, _, response) = app
        .send(
            json_request("POST", "/api/gis/analyze")
                .header(AUTHORIZATION, bearer(&caller.api_key))
                .body(json_body(json!({ "analysisType": "area", "data": {} })))
                .unwrap(),
        )
        .await;

    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"], "Invalid geometry data");
    assert_eq!(app.balance(caller.user_id).await, 9);

    let entries = app.store.usage_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, "error");
    assert_eq!(entries[0].credits_used, 1);
    assert_eq!(entries[0].error_message.as_deref(), Some("Invalid geometry data"));
}

#[tokio::test]
async fn invalid_requests_are_logged_but_not_charged() {
    let app = spawn_app();
    let caller = app.seed_caller("ops@example.com", 10).await;

    let (status, _, response) = app
        .send(
            get("/api/datasets?type=weather")
                .header(AUTHORIZATION, bearer(&caller.api_key))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"], "Invalid dataset type");
    assert_eq!(response["available_types"][3], "all");

    let (status, _, response) = app
        .send(
            json_request("POST", "/api/gis/analyze")
                .header(AUTHORIZATION, bearer(&caller.api_key))
                .body(Body::from("not json"))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert_eq!(response["error"], "analysisType is required");

    assert_eq!(app.balance(caller.user_id).await, 10);
    let entries = app.store.usage_entries();
    assert_eq!(entries.len(), 2);
    assert!(entries.iter().all(|e| e.status == "error" && e.credits_used == 0));
}

#[tokio::test]
async fn unparseable_query_is_authenticated_and_logged_first() {
    let app = spawn_app();

    let (status, _, response) = app
        .send(get("/api/datasets?limit=abc").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error"], "Missing credentials");

    let caller = app.seed_caller("ops@example.com", 10).await;
    let (status, _, response) = app
        .send(
            get("/api/datasets?limit=abc")
                .header(AUTHORIZATION, bearer(&caller.api_key))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    assert!(response["error"].as_str().unwrap().contains("limit"));

    assert_eq!(app.balance(caller.user_id).await, 10);
    let entries = app.store.usage_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, "error");
    assert_eq!(entries[0].credits_used, 0);
    assert_eq!(
        entries[0].request_data.as_ref().unwrap()["query"],
        "limit=abc"
    );
}

#[tokio::test]
async fn malformed_keys_never_reach_the_store() {
    let app = spawn_app();
    let caller = app.seed_caller("ops@example.com", 10).await;

    let dashed = caller.api_key.replace("gis_", "gis-");
    for key in ["gis_short", "live_0123", dashed.as_str()] {
        let (status, _, response) = app
            .send(
                get("/api/datasets")
                    .header(AUTHORIZATION, bearer(key))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await;
        assert_eq!(status, StatusCode::UNAUTHORIZED);
        assert_eq!(response["error"], "Invalid API key format");
    }

    assert_eq!(app.store.api_key_lookups(), 0);
    assert!(app.store.usage_entries().is_empty());
    assert_eq!(app.balance(caller.user_id).await, 10);
}

#[tokio::test]
async fn unknown_and_missing_credentials_are_rejected() {
    let app = spawn_app();

    let (status, _, response) = app
        .send(get("/api/datasets").body(Body::empty()).unwrap())
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error"], "Missing credentials");

    let unknown = format!("gis_{}", "ab".repeat(32));
    let (status, _, response) = app
        .send(
            get("/api/datasets")
                .header(AUTHORIZATION, bearer(&unknown))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(response["error"], "Invalid credentials");
    assert_eq!(app.store.api_key_lookups(), 1);
    assert!(app.store.usage_entries().is_empty());
}

#[tokio::test]
async fn deactivated_user_is_locked_out() {
    let app = spawn_app();
    let caller = app.seed_caller("ops@example.com", 10).await;
    app.store.set_user_active(caller.user_id, false);

    let (status, _, _) = app
        .send(
            get("/api/datasets")
                .header(AUTHORIZATION, bearer(&caller.api_key))
                .body(Body::empty())
                .unwrap(),
        )
        .await;

    assert_eq!(status, StatusCode::UNAUTHORIZED);
    assert_eq!(app.balance(caller.user_id).await, 10);
    assert!(app.store.usage_entries().is_empty());
}

#[tokio::test]
async fn contribution_rewards_the_caller() {
    let app = spawn_app();
    let caller = app.seed_caller("ops@example.com", 0).await;

    let (status, _, response) = app
        .send(
            json_request("POST", "/api/datasets")
                .header(AUTHORIZATION, bearer(&caller.api_key))
                .body(json_body(json!({
                    "datasetType": "logistics",
                    "data": { "warehouses": [{ "name": "Khon Kaen Depot" }] },
                })))
                .unwrap(),
        )
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["meta"]["creditsUsed"], -5);
    assert_eq!(response["meta"]["remainingCredits"], 5);
    assert_eq!(app.balance(caller.user_id).await, 5);

    let entries = app.store.usage_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].credits_used, -5);
    assert_eq!(entries[0].status, "success");
}

#[tokio::test]
async fn sensitive_request_fields_are_redacted_in_the_log() {
    let app = spawn_app();
    let caller = app.seed_caller("ops@example.com", 10).await;

    let (status, _, _) = app
        .send(
            json_request("POST", "/api/gis/analyze")
                .header(AUTHORIZATION, bearer(&caller.api_key))
                .body(json_body(json!({
                    "analysisType": "area",
                    "data": {
                        "geometry": { "type": "Point", "coordinates": [100.5, 13.7] },
                        "apiKey": "gis_leaked",
                    },
                    "password": "hunter2",
                })))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);

    let entries = app.store.usage_entries();
    let logged = entries[0].request_data.as_ref().unwrap();
    assert_eq!(logged["password"], REDACTED);
    assert_eq!(logged["data"]["apiKey"], REDACTED);
    assert_eq!(logged["data"]["geometry"]["type"], "Point");
}

#[tokio::test]
async fn concurrent_requests_never_overdraw() {
    let app = spawn_app();
    let caller = app.seed_caller("ops@example.com", 10).await;

    let mut handles = Vec::new();
    for _ in 0..25 {
        let router = app.router.clone();
        let key = caller.api_key.clone();
        handles.push(tokio::spawn(async move {
            use tower::ServiceExt;
            let request = get("/api/datasets?type=gis")
                .header(AUTHORIZATION, bearer(&key))
                .body(Body::empty())
                .unwrap();
            router.oneshot(request).await.unwrap().status()
        }));
    }

    let mut ok = 0;
    let mut payment_required = 0;
    for handle in handles {
        match handle.await.unwrap() {
            StatusCode::OK => ok += 1,
            StatusCode::PAYMENT_REQUIRED => payment_required += 1,
            other => panic!("unexpected status {other}"),
        }
    }

    assert_eq!(ok, 10);
    assert_eq!(payment_required, 15);
    assert_eq!(app.balance(caller.user_id).await, 0);
    assert_eq!(app.store.usage_entries().len(), 25);
}

#[tokio::test]
async fn health_reports_store_connectivity() {
    let app = spawn_app();
    let (status, _, response) = app
        .send(get("/health").body(Body::empty()).unwrap())
        .await;

    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["status"], "healthy");
    assert_eq!(response["database"], "connected");
}

#[tokio::test]
async fn demo_endpoints_charge_per_method() {
    let app = spawn_app();
    let caller = app.seed_caller("ops@example.com", 10).await;

    let (status, _, response) = app
        .send(
            get("/api/demo")
                .header(AUTHORIZATION, bearer(&caller.api_key))
                .header("user-agent", "integration-test")
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["data"]["user"]["email"], "ops@example.com");
    assert_eq!(response["data"]["requestInfo"]["method"], "GET");
    assert_eq!(response["data"]["requestInfo"]["userAgent"], "integration-test");
    assert_eq!(response["meta"]["creditsUsed"], 2);

    let (status, _, response) = app
        .send(
            json_request("POST", "/api/demo")
                .header(AUTHORIZATION, bearer(&caller.api_key))
                .body(json_body(json!({ "ping": "pong" })))
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["data"]["receivedData"]["ping"], "pong");
    assert_eq!(response["meta"]["remainingCredits"], 5);

    assert_eq!(app.balance(caller.user_id).await, 5);
}

#[tokio::test]
async fn failing_demo_info_keeps_the_charge() {
    let app = spawn_app_with(Config {
        demo_error_rate: 1.0,
        ..test_config()
    });
    let caller = app.seed_caller("ops@example.com", 10).await;

    let (status, _, response) = app
        .send(
            get("/api/demo")
                .header(AUTHORIZATION, bearer(&caller.api_key))
                .body(Body::empty())
                .unwrap(),
        )
        .await;
    assert_eq!(status, StatusCode::INTERNAL_SERVER_ERROR);
    assert_eq!(response, json!({ "error": "Internal server error" }));

    assert_eq!(app.balance(caller.user_id).await, 8);
    let entries = app.store.usage_entries();
    assert_eq!(entries.len(), 1);
    assert_eq!(entries[0].status, "error");
    assert_eq!(entries[0].credits_used, 2);
    assert_eq!(
        entries[0].error_message.as_deref(),
        Some("Random demo error for testing")
    );
}
