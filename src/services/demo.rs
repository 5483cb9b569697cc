//! Self-test operations for the metering pipeline.
//!
//! `GET /api/demo` reports the caller after a random delay and fails a configurable share
//! of requests, so charging of failed attempts can be watched end to end. `POST /api/demo`
//! echoes its body.

use std::time::Duration;

use async_trait::async_trait;
use serde_json::{Value, json};

use crate::services::authenticator::Identity;
use crate::services::gateway::{Operation, OperationError, OperationOutput};

pub const DEMO_ERROR_MESSAGE: &str = "Random demo error for testing";

/// Request line details echoed back by `GET /api/demo`.
#[derive(Debug, Clone)]
pub struct RequestInfo {
    pub method: String,
    pub url: String,
    pub user_agent: Option<String>,
}

pub struct DemoInfo {
    info: RequestInfo,
    max_delay: Duration,
    error_rate: f64,
}

impl DemoInfo {
    pub fn new(info: RequestInfo, max_delay: Duration, error_rate: f64) -> Self {
        Self {
            info,
            max_delay,
            error_rate,
        }
    }
}

fn require_caller(caller: Option<&Identity>) -> Result<&Identity, OperationError> {
    caller.ok_or_else(|| OperationError::internal("demo operation ran without a caller"))
}

#[async_trait]
impl Operation for DemoInfo {
    async fn execute(self, caller: Option<&Identity>) -> Result<OperationOutput, OperationError> {
        let caller = require_caller(caller)?;

        let max_ms = u64::try_from(self.max_delay.as_millis()).unwrap_or(u64::MAX);
        if max_ms > 0 {
            let delay = rand::random_range(0..=max_ms);
            tokio::time::sleep(Duration::from_millis(delay)).await;
        }

        if rand::random::<f64>() < self.error_rate {
            return Err(OperationError::internal(DEMO_ERROR_MESSAGE));
        }

        let api_key = caller
            .api_key
            .as_ref()
            .map(|key| json!({ "id": key.id, "name": key.name }));

        Ok(OperationOutput::new(json!({
            "message": "This is a demo API endpoint",
            "timestamp": chrono::Utc::now(),
            "user": {
                "id": caller.user.id,
                "email": caller.user.email,
                "credits": caller.user.credits,
            },
            "apiKey": api_key,
            "requestInfo": {
                "method": self.info.method,
                "url": self.info.url,
                "userAgent": self.info.user_agent,
            },
        })))
    }
}

pub struct DemoEcho {
    body: Value,
}

impl DemoEcho {
    /// `body` is `Null` when the request body was not JSON.
    pub fn new(body: Value) -> Self {
        Self { body }
    }
}

#[async_trait]
impl Operation for DemoEcho {
    fn validate(&self) -> Result<(), OperationError> {
        if self.body.is_null() {
            return Err(OperationError::bad_request("Request body must be JSON"));
        }
        Ok(())
    }

    async fn execute(self, caller: Option<&Identity>) -> Result<OperationOutput, OperationError> {
        let caller = require_caller(caller)?;

        Ok(OperationOutput::new(json!({
            "message": "POST request processed",
            "receivedData": self.body,
            "user": caller.user.email,
            "processedAt": chrono::Utc::now(),
        })))
    }
}
