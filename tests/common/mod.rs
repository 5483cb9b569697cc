//! Shared fixtures: the production router on top of the in-process store.

#![allow(dead_code)]

use std::sync::Arc;

use axum::{
    Router,
    body::{Body, to_bytes},
    http::{HeaderMap, Request, StatusCode, header},
};
use serde_json::Value;
use tower::ServiceExt;
use uuid::Uuid;

use credit_gateway::app::{AppState, build_router};
use credit_gateway::config::Config;
use credit_gateway::models::user::NewUser;
use credit_gateway::services::authenticator::generate_api_key;
use credit_gateway::services::rate_limiter::MemoryRateLimitStore;
use credit_gateway::services::tasks::TaskSupervisor;
use credit_gateway::store::{CredentialStore, CreditStore, MemoryStore};

pub struct TestApp {
    pub store: Arc<MemoryStore>,
    pub state: AppState,
    pub router: Router,
}

pub struct Caller {
    pub user_id: Uuid,
    pub api_key: String,
}

pub fn test_config() -> Config {
    Config {
        simulated_latency_ms: 0,
        demo_error_rate: 0.0,
        ..Config::default()
    }
}

pub fn spawn_app() -> TestApp {
    spawn_app_with(test_config())
}

pub fn spawn_app_with(config: Config) -> TestApp {
    let store = Arc::new(MemoryStore::new());
    let state = AppState::new(
        config,
        store.clone(),
        Arc::new(MemoryRateLimitStore::new()),
        TaskSupervisor::new(),
        None,
    )
    .expect("valid test config");
    let router = build_router(state.clone());

    TestApp {
        store,
        state,
        router,
    }
}

impl TestApp {
    /// A user holding `credits` and one active API key.
    pub async fn seed_caller(&self, email: &str, credits: i64) -> Caller {
        let user = self
            .store
            .create_user(NewUser {
                email: email.to_string(),
                password_hash: "unused".to_string(),
                first_name: "Test".to_string(),
                last_name: "Caller".to_string(),
                company: None,
                role: None,
                credits,
            })
            .await
            .unwrap();

        let (api_key, key_hash) = generate_api_key("gis");
        self.store
            .create_api_key(user.id, "fixture", &key_hash, 5)
            .await
            .unwrap();

        Caller {
            user_id: user.id,
            api_key,
        }
    }

    pub async fn balance(&self, user_id: Uuid) -> i64 {
        self.store.balance(user_id).await.unwrap().unwrap()
    }

    pub async fn send(&self, request: Request<Body>) -> (StatusCode, HeaderMap, Value) {
        let response = self.router.clone().oneshot(request).await.unwrap();
        let status = response.status();
        let headers = response.headers().clone();
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        let body = if bytes.is_empty() {
            Value::Null
        } else {
            serde_json::from_slice(&bytes).unwrap()
        };
        (status, headers, body)
    }
}

pub fn bearer(api_key: &str) -> String {
    format!("Bearer {api_key}")
}

pub fn get(uri: &str) -> axum::http::request::Builder {
    Request::builder().method("GET").uri(uri)
}

pub fn json_request(method: &str, uri: &str) -> axum::http::request::Builder {
    Request::builder()
        .method(method)
        .uri(uri)
        .header(header::CONTENT_TYPE, "application/json")
}

pub fn json_body(value: Value) -> Body {
    Body::from(value.to_string())
}
