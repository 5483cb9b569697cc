//! Request gateway - the metering pipeline around every billable operation.
//!
//! # Pipeline
//!
//! Stages run in a fixed order and each one can end the request:
//!
//! 1. Authenticate (401). Failures have no user to attribute, so they go to `tracing`
//!    only.
//! 2. Rate limit (429). Never touches the ledger.
//! 3. Validate the request shape (400, or the operation's declared status)
//! 4. Reserve `credit_cost` credits (402). The operation does not run.
//! 5. Execute the operation (its declared status, or 500)
//! 6. Grant any reward, build the success envelope
//!
//! From stage 2 on, every exit writes exactly one usage entry whose status matches the
//! outcome.
//!
//! # Charging
//!
//! Under [`ChargePolicy::PayToAttempt`] a failed operation keeps its reservation. Under
//! [`ChargePolicy::PayOnSuccess`] the reservation is refunded.
//!
//! # Cancellation
//!
//! If the request future is dropped after authentication, a guard settles the pass on
//! the task supervisor: a reservation is refunded when the operation never started (or,
//! under `PayOnSuccess`, never finished), and one `error` entry with "request cancelled"
//! is written.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use axum::Json;
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use serde_json::{Map, Value, json};
use tokio::sync::oneshot;
use uuid::Uuid;

use crate::error::{AppError, RATE_LIMIT_LIMIT, RATE_LIMIT_REMAINING};
use crate::models::usage::{NewUsageLog, UsageStatus};
use crate::services::authenticator::{AuthMode, Authenticator, Identity};
use crate::services::credit_ledger::{CreditLedger, LedgerError, Reservation};
use crate::services::rate_limiter::{RateLimit, RateLimitDecision, RateLimiter};
use crate::services::tasks::TaskSupervisor;
use crate::services::usage_recorder::UsageRecorder;

/// What happens to a reservation when the operation fails.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ChargePolicy {
    /// Credits pay for the attempt and are kept on failure.
    #[default]
    PayToAttempt,

    /// Credits are refunded when the operation fails.
    PayOnSuccess,
}

/// Metering configuration of one route.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct EndpointPolicy {
    /// Path recorded in usage entries and used as the rate-limit scope.
    pub endpoint: &'static str,

    pub requires_auth: bool,
    pub auth_mode: AuthMode,
    pub credit_cost: i64,
    pub rate_limit: Option<RateLimit>,
}

impl EndpointPolicy {
    /// Authenticated endpoint with the given credential mode and cost.
    pub const fn metered(endpoint: &'static str, auth_mode: AuthMode, credit_cost: i64) -> Self {
        Self {
            endpoint,
            requires_auth: true,
            auth_mode,
            credit_cost,
            rate_limit: None,
        }
    }

    /// Endpoint without authentication. It can neither charge nor log usage.
    pub const fn public(endpoint: &'static str) -> Self {
        Self {
            endpoint,
            requires_auth: false,
            auth_mode: AuthMode::ApiKeyOrSession,
            credit_cost: 0,
            rate_limit: None,
        }
    }

    pub const fn with_rate_limit(mut self, rate_limit: RateLimit) -> Self {
        self.rate_limit = Some(rate_limit);
        self
    }

    pub const fn with_credit_cost(mut self, credit_cost: i64) -> Self {
        self.credit_cost = credit_cost;
        self
    }

    /// A charged endpoint always needs a user to charge.
    pub fn needs_identity(&self) -> bool {
        self.requires_auth || self.credit_cost > 0
    }
}

/// Successful operation result.
#[derive(Debug, Clone)]
pub struct OperationOutput {
    pub data: Value,

    /// Extra fields merged into the response `meta` envelope
    pub meta: Map<String, Value>,

    /// Summary stored in the usage entry instead of the full payload
    pub response_data: Option<Value>,

    /// Credits granted to the caller after success
    pub reward: i64,

    pub status: StatusCode,
}

impl OperationOutput {
    pub fn new(data: Value) -> Self {
        Self {
            data,
            meta: Map::new(),
            response_data: None,
            reward: 0,
            status: StatusCode::OK,
        }
    }

    pub fn with_meta(mut self, key: &str, value: Value) -> Self {
        self.meta.insert(key.to_string(), value);
        self
    }

    pub fn with_response_data(mut self, response_data: Value) -> Self {
        self.response_data = Some(response_data);
        self
    }

    pub fn with_reward(mut self, reward: i64) -> Self {
        self.reward = reward;
        self
    }

    pub fn with_status(mut self, status: StatusCode) -> Self {
        self.status = status;
        self
    }
}

/// Failure declared by an operation.
#[derive(Debug, Clone, thiserror::Error)]
#[error("{message}")]
pub struct OperationError {
    pub status: StatusCode,
    pub message: String,

    /// Whether `message` may be shown to the caller on a 5xx
    pub public: bool,

    /// Extra fields for the error body
    pub context: Map<String, Value>,
}

impl OperationError {
    pub fn new(status: StatusCode, message: impl Into<String>) -> Self {
        Self {
            status,
            message: message.into(),
            public: true,
            context: Map::new(),
        }
    }

    pub fn bad_request(message: impl Into<String>) -> Self {
        Self::new(StatusCode::BAD_REQUEST, message)
    }

    /// 500 whose message is recorded in the usage log but not shown to the caller.
    pub fn internal(message: impl Into<String>) -> Self {
        Self {
            public: false,
            ..Self::new(StatusCode::INTERNAL_SERVER_ERROR, message)
        }
    }

    pub fn with_context(mut self, key: &str, value: Value) -> Self {
        self.context.insert(key.to_string(), value);
        self
    }
}

/// Business logic run behind the gateway.
#[async_trait]
pub trait Operation: Send + 'static {
    /// Cheap request-shape checks, run after the rate limit and before anything is charged.
    fn validate(&self) -> Result<(), OperationError> {
        Ok(())
    }

    /// `caller` is `None` only on public endpoints.
    async fn execute(self, caller: Option<&Identity>) -> Result<OperationOutput, OperationError>;
}

/// Stand-in for a request whose parameters could not be parsed.
///
/// It always fails validation, so the caller is still authenticated, rate limited and
/// logged, but never charged.
#[derive(Debug, Clone)]
pub struct Unparseable {
    message: String,
}

impl Unparseable {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
        }
    }
}

#[async_trait]
impl Operation for Unparseable {
    fn validate(&self) -> Result<(), OperationError> {
        Err(OperationError::bad_request(self.message.clone()))
    }

    async fn execute(self, _: Option<&Identity>) -> Result<OperationOutput, OperationError> {
        Err(OperationError::bad_request(self.message))
    }
}

struct GatewayInner {
    authenticator: Authenticator,
    rate_limiter: RateLimiter,
    ledger: CreditLedger,
    recorder: UsageRecorder,
    tasks: TaskSupervisor,
    charge_policy: ChargePolicy,
    expose_details: bool,
}

#[derive(Clone)]
pub struct Gateway {
    inner: Arc<GatewayInner>,
}

impl Gateway {
    pub fn new(
        authenticator: Authenticator,
        rate_limiter: RateLimiter,
        ledger: CreditLedger,
        recorder: UsageRecorder,
        tasks: TaskSupervisor,
        charge_policy: ChargePolicy,
        expose_details: bool,
    ) -> Self {
        Self {
            inner: Arc::new(GatewayInner {
                authenticator,
                rate_limiter,
                ledger,
                recorder,
                tasks,
                charge_policy,
                expose_details,
            }),
        }
    }

    pub fn authenticator(&self) -> &Authenticator {
        &self.inner.authenticator
    }

    pub fn ledger(&self) -> &CreditLedger {
        &self.inner.ledger
    }

    pub fn rate_limiter(&self) -> &RateLimiter {
        &self.inner.rate_limiter
    }

    pub fn charge_policy(&self) -> ChargePolicy {
        self.inner.charge_policy
    }

    /// Render an error, with internal details only in development.
    pub fn error_response(&self, err: AppError) -> Response {
        err.render(self.inner.expose_details)
    }

    /// Run `op` through the full pipeline and build the HTTP response.
    ///
    /// `request_data` is the request metadata to log; it is sanitized before the write.
    pub async fn run<O: Operation>(
        &self,
        headers: &HeaderMap,
        policy: &EndpointPolicy,
        request_data: Option<Value>,
        op: O,
    ) -> Response {
        let started = Instant::now();

        if !policy.needs_identity() {
            return self.run_public(policy, op, started).await;
        }

        let identity = match self
            .inner
            .authenticator
            .authenticate(headers, policy.auth_mode)
            .await
        {
            Ok(identity) => identity,
            Err(failure) => {
                tracing::warn!(
                    endpoint = policy.endpoint,
                    reason = %failure,
                    "Authentication failed"
                );
                return self.error_response(failure.into());
            }
        };

        let mut pass = Pass::new(self.inner.clone(), &identity, policy, request_data, started);

        let mut rate_limit_headers = None;
        if let Some(limit) = policy.rate_limit {
            let scope = identity.user_id().to_string();
            match self
                .inner
                .rate_limiter
                .check(&scope, policy.endpoint, limit)
                .await
            {
                RateLimitDecision::Allowed { limit, remaining } => {
                    rate_limit_headers = Some((limit, remaining));
                }
                RateLimitDecision::Limited {
                    limit,
                    retry_after_secs,
                } => {
                    let err = AppError::RateLimited {
                        limit,
                        retry_after_secs,
                    };
                    pass.finish(Outcome::failed(
                        UsageStatus::RateLimited,
                        0,
                        &err.to_string(),
                    ))
                    .await;
                    return self.error_response(err);
                }
            }
        }

        if let Err(e) = op.validate() {
            pass.finish(Outcome::failed(UsageStatus::Error, 0, &e.message))
                .await;
            return self.operation_error_response(e);
        }

        let mut remaining_credits = None;
        if policy.credit_cost > 0 {
            match self
                .inner
                .ledger
                .reserve(identity.user_id(), policy.credit_cost)
                .await
            {
                Ok(Reservation::Reserved { remaining }) => {
                    pass.reserved = policy.credit_cost;
                    remaining_credits = Some(remaining);
                }
                Ok(Reservation::Insufficient { available }) => {
                    let err = AppError::InsufficientCredits {
                        required: policy.credit_cost,
                        available,
                    };
                    pass.finish(Outcome::failed(
                        UsageStatus::InsufficientCredits,
                        0,
                        &err.to_string(),
                    ))
                    .await;
                    return self.error_response(err);
                }
                Err(e) => {
                    pass.finish(Outcome::failed(
                        UsageStatus::Error,
                        0,
                        &format!("Credit reservation failed: {e}"),
                    ))
                    .await;
                    return self.error_response(e.into());
                }
            }
        }

        pass.stage = Stage::Executing;
        let result = op.execute(Some(&identity)).await;

        let output = match result {
            Ok(output) => output,
            Err(e) => {
                let refund = match self.inner.charge_policy {
                    ChargePolicy::PayToAttempt => 0,
                    ChargePolicy::PayOnSuccess => pass.reserved,
                };
                let charged = pass.reserved - refund;
                let _ = pass
                    .settle(
                        refund,
                        Outcome::failed(UsageStatus::Error, charged, &e.message),
                    )
                    .await;
                return self.operation_error_response(e);
            }
        };

        pass.stage = Stage::Rewarding;
        let mut credits_used = policy.credit_cost;
        if output.reward > 0 {
            match self.inner.ledger.add(identity.user_id(), output.reward).await {
                Ok(balance) => {
                    credits_used -= output.reward;
                    remaining_credits = Some(balance);
                }
                Err(e) => {
                    tracing::error!(
                        user_id = %identity.user_id(),
                        endpoint = policy.endpoint,
                        reward = output.reward,
                        error = %e,
                        "Failed to grant reward credits"
                    );
                }
            }
        }

        let remaining_credits = match remaining_credits {
            Some(balance) => balance,
            None => self.current_balance(&identity).await,
        };
        let processing_time = elapsed_ms(started);

        pass.finish(Outcome {
            status: UsageStatus::Success,
            credits_used,
            response_data: output.response_data.clone(),
            error_message: None,
        })
        .await;

        let mut meta = Map::new();
        meta.insert("creditsUsed".to_string(), json!(credits_used));
        meta.insert("remainingCredits".to_string(), json!(remaining_credits));
        meta.insert("processingTime".to_string(), json!(processing_time));
        meta.insert("timestamp".to_string(), json!(chrono::Utc::now()));
        meta.extend(output.meta);

        let body = json!({
            "success": true,
            "data": output.data,
            "meta": meta,
        });

        let mut response = (output.status, Json(body)).into_response();
        if let Some((limit, remaining)) = rate_limit_headers {
            let headers = response.headers_mut();
            headers.insert(RATE_LIMIT_LIMIT, HeaderValue::from(limit));
            headers.insert(RATE_LIMIT_REMAINING, HeaderValue::from(remaining));
        }
        response
    }

    async fn run_public<O: Operation>(
        &self,
        policy: &EndpointPolicy,
        op: O,
        started: Instant,
    ) -> Response {
        if let Some(limit) = policy.rate_limit {
            let decision = self
                .inner
                .rate_limiter
                .check("anonymous", policy.endpoint, limit)
                .await;
            if let RateLimitDecision::Limited {
                limit,
                retry_after_secs,
            } = decision
            {
                return self.error_response(AppError::RateLimited {
                    limit,
                    retry_after_secs,
                });
            }
        }

        if let Err(e) = op.validate() {
            return self.operation_error_response(e);
        }

        match op.execute(None).await {
            Ok(output) => {
                let mut meta = output.meta;
                meta.insert("processingTime".to_string(), json!(elapsed_ms(started)));
                let body = json!({ "success": true, "data": output.data, "meta": meta });
                (output.status, Json(body)).into_response()
            }
            Err(e) => self.operation_error_response(e),
        }
    }

    async fn current_balance(&self, identity: &Identity) -> i64 {
        match self.inner.ledger.balance(identity.user_id()).await {
            Ok(balance) => balance,
            Err(e) => {
                tracing::warn!(
                    user_id = %identity.user_id(),
                    error = %e,
                    "Balance read failed, reporting authentication snapshot"
                );
                identity.user.credits
            }
        }
    }

    fn operation_error_response(&self, e: OperationError) -> Response {
        let status = e.status;
        let public = e.public;
        let context = e.context;
        let message = e.message;

        if context.is_empty() || (status.is_server_error() && !public) {
            return self.error_response(AppError::Operation {
                status,
                message,
                public,
            });
        }

        let mut body = context;
        body.insert("error".to_string(), json!(message));
        (status, Json(Value::Object(body))).into_response()
    }
}

fn elapsed_ms(started: Instant) -> i64 {
    i64::try_from(started.elapsed().as_millis()).unwrap_or(i64::MAX)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    /// Between authentication and the start of the operation
    Admitting,
    Executing,
    /// Operation succeeded, reward and response still pending
    Rewarding,
}

/// Usage entry fields that depend on how the pass ended.
struct Outcome {
    status: UsageStatus,
    credits_used: i64,
    response_data: Option<Value>,
    error_message: Option<String>,
}

impl Outcome {
    fn failed(status: UsageStatus, credits_used: i64, message: &str) -> Self {
        Self {
            status,
            credits_used,
            response_data: None,
            error_message: Some(message.to_string()),
        }
    }
}

/// One authenticated trip through the pipeline.
///
/// Armed on creation; settling it writes the usage entry. If it is dropped while still
/// armed the request was cancelled and the drop settles it.
struct Pass {
    inner: Arc<GatewayInner>,
    user_id: Uuid,
    api_key_id: Option<Uuid>,
    endpoint: &'static str,
    request_data: Option<Value>,
    started: Instant,
    reserved: i64,
    stage: Stage,
    armed: bool,
}

impl Pass {
    fn new(
        inner: Arc<GatewayInner>,
        identity: &Identity,
        policy: &EndpointPolicy,
        request_data: Option<Value>,
        started: Instant,
    ) -> Self {
        Self {
            inner,
            user_id: identity.user_id(),
            api_key_id: identity.api_key_id(),
            endpoint: policy.endpoint,
            request_data,
            started,
            reserved: 0,
            stage: Stage::Admitting,
            armed: true,
        }
    }

    async fn finish(mut self, outcome: Outcome) {
        let _ = self.settle(0, outcome).await;
    }

    /// Refund `refund` credits, then write the usage entry, on the supervisor.
    ///
    /// Both happen even if the caller stops waiting. The returned receiver completes
    /// after the refund and, in await mode, after the write.
    fn settle(&mut self, refund: i64, outcome: Outcome) -> oneshot::Receiver<()> {
        self.armed = false;

        let (done_tx, done_rx) = oneshot::channel();
        let ledger = self.inner.ledger.clone();
        let recorder = self.inner.recorder.clone();
        let user_id = self.user_id;
        let mut entry = NewUsageLog {
            user_id,
            api_key_id: self.api_key_id,
            endpoint: self.endpoint.to_string(),
            credits_used: outcome.credits_used,
            request_data: self.request_data.take(),
            response_data: outcome.response_data,
            processing_time_ms: elapsed_ms(self.started),
            status: outcome.status,
            error_message: outcome.error_message,
        };

        tracing::info!(
            %user_id,
            api_key_id = ?self.api_key_id,
            endpoint = self.endpoint,
            status = %entry.status,
            credits_used = entry.credits_used,
            "Request metered"
        );

        self.inner.tasks.spawn("settle_usage", async move {
            if refund > 0 {
                if let Err(e) = ledger.add(user_id, refund).await {
                    tracing::error!(%user_id, refund, error = %e, "Failed to refund reservation");
                    entry.credits_used += refund;
                }
            }
            recorder.record(entry).await;
            let _ = done_tx.send(());
            Ok::<_, LedgerError>(())
        });

        done_rx
    }
}

impl Drop for Pass {
    fn drop(&mut self) {
        if !self.armed {
            return;
        }

        let refund = match (self.stage, self.inner.charge_policy) {
            (Stage::Admitting, _) => self.reserved,
            (Stage::Executing, ChargePolicy::PayOnSuccess) => self.reserved,
            _ => 0,
        };
        let charged = self.reserved - refund;

        tracing::warn!(
            user_id = %self.user_id,
            endpoint = self.endpoint,
            stage = ?self.stage,
            refund,
            "Request cancelled"
        );

        drop(self.settle(
            refund,
            Outcome::failed(UsageStatus::Error, charged, "request cancelled"),
        ));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::models::user::NewUser;
    use crate::services::authenticator::generate_api_key;
    use crate::services::rate_limiter::MemoryRateLimitStore;
    use crate::services::usage_recorder::UsageLogMode;
    use crate::store::{CredentialStore, CreditStore, MemoryStore};
    use axum::body::to_bytes;
    use axum::http::header::AUTHORIZATION;
    use std::time::Duration;

    struct Fixture {
        store: Arc<MemoryStore>,
        tasks: TaskSupervisor,
        gateway: Gateway,
        headers: HeaderMap,
        user_id: Uuid,
    }

    async fn fixture(credits: i64, charge_policy: ChargePolicy) -> Fixture {
        let store = Arc::new(MemoryStore::new());
        let tasks = TaskSupervisor::new();
        let timeout = Duration::from_secs(1);

        let user = store
            .create_user(NewUser {
                email: "gw@example.com".to_string(),
                password_hash: "x".to_string(),
                first_name: "G".to_string(),
                last_name: "W".to_string(),
                company: None,
                role: None,
                credits,
            })
            .await
            .unwrap();
        let (raw_key, key_hash) = generate_api_key("gis");
        store
            .create_api_key(user.id, "test", &key_hash, 5)
            .await
            .unwrap();

        let gateway = Gateway::new(
            Authenticator::new(store.clone(), tasks.clone(), "gis", "session", timeout),
            RateLimiter::new(Arc::new(MemoryRateLimitStore::new())),
            CreditLedger::new(store.clone(), timeout),
            UsageRecorder::new(store.clone(), tasks.clone(), UsageLogMode::Await, timeout),
            tasks.clone(),
            charge_policy,
            false,
        );

        let mut headers = HeaderMap::new();
        headers.insert(
            AUTHORIZATION,
            HeaderValue::from_str(&format!("Bearer {raw_key}")).unwrap(),
        );

        Fixture {
            store,
            tasks,
            gateway,
            headers,
            user_id: user.id,
        }
    }

    struct Echo;

    #[async_trait]
    impl Operation for Echo {
        async fn execute(self, _: Option<&Identity>) -> Result<OperationOutput, OperationError> {
            Ok(OperationOutput::new(json!({ "ok": true })))
        }
    }

    struct Fails;

    #[async_trait]
    impl Operation for Fails {
        async fn execute(self, _: Option<&Identity>) -> Result<OperationOutput, OperationError> {
            Err(OperationError::internal("backend exploded"))
        }
    }

    struct Invalid;

    #[async_trait]
    impl Operation for Invalid {
        fn validate(&self) -> Result<(), OperationError> {
            Err(OperationError::bad_request("data is required"))
        }

        async fn execute(self, _: Option<&Identity>) -> Result<OperationOutput, OperationError> {
            unreachable!("validation failed")
        }
    }

    struct Hangs;

    #[async_trait]
    impl Operation for Hangs {
        async fn execute(self, _: Option<&Identity>) -> Result<OperationOutput, OperationError> {
            std::future::pending::<()>().await;
            unreachable!()
        }
    }

    struct Rewards;

    #[async_trait]
    impl Operation for Rewards {
        async fn execute(self, _: Option<&Identity>) -> Result<OperationOutput, OperationError> {
            Ok(OperationOutput::new(json!({})).with_reward(5))
        }
    }

    async fn body_json(response: Response) -> Value {
        let bytes = to_bytes(response.into_body(), usize::MAX).await.unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    const PAID: EndpointPolicy = EndpointPolicy::metered("/paid", AuthMode::ApiKey, 7);

    #[tokio::test]
    async fn success_envelope_reports_balance() {
        let fx = fixture(10, ChargePolicy::PayToAttempt).await;

        let response = fx.gateway.run(&fx.headers, &PAID, None, Echo).await;
        assert_eq!(response.status(), StatusCode::OK);

        let body = body_json(response).await;
        assert_eq!(body["success"], true);
        assert_eq!(body["data"]["ok"], true);
        assert_eq!(body["meta"]["creditsUsed"], 7);
        assert_eq!(body["meta"]["remainingCredits"], 3);

        let logs = fx.store.usage_entries();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "success");
        assert_eq!(logs[0].credits_used, 7);
    }

    #[tokio::test]
    async fn insufficient_credits_skips_the_operation() {
        let fx = fixture(3, ChargePolicy::PayToAttempt).await;

        let response = fx.gateway.run(&fx.headers, &PAID, None, Hangs).await;
        assert_eq!(response.status(), StatusCode::PAYMENT_REQUIRED);

        let body = body_json(response).await;
        assert_eq!(body["required"], 7);
        assert_eq!(body["available"], 3);

        let logs = fx.store.usage_entries();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "insufficient_credits");
        assert_eq!(logs[0].credits_used, 0);
    }

    #[tokio::test]
    async fn pay_to_attempt_keeps_credits_on_failure() {
        let fx = fixture(10, ChargePolicy::PayToAttempt).await;

        let response = fx.gateway.run(&fx.headers, &PAID, None, Fails).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "Internal server error");

        assert_eq!(fx.store.balance(fx.user_id).await.unwrap(), Some(3));
        let logs = fx.store.usage_entries();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "error");
        assert_eq!(logs[0].credits_used, 7);
        assert_eq!(logs[0].error_message.as_deref(), Some("backend exploded"));
    }

    #[tokio::test]
    async fn pay_on_success_refunds_on_failure() {
        let fx = fixture(10, ChargePolicy::PayOnSuccess).await;

        let response = fx.gateway.run(&fx.headers, &PAID, None, Fails).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);

        assert_eq!(fx.store.balance(fx.user_id).await.unwrap(), Some(10));
        assert_eq!(fx.store.usage_entries()[0].credits_used, 0);
    }

    #[tokio::test]
    async fn validation_failure_is_logged_without_charge() {
        let fx = fixture(10, ChargePolicy::PayToAttempt).await;

        let response = fx.gateway.run(&fx.headers, &PAID, None, Invalid).await;
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
        assert_eq!(body_json(response).await["error"], "data is required");

        assert_eq!(fx.store.balance(fx.user_id).await.unwrap(), Some(10));
        let logs = fx.store.usage_entries();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "error");
    }

    #[tokio::test]
    async fn invalid_requests_count_against_the_rate_limit() {
        let fx = fixture(10, ChargePolicy::PayToAttempt).await;
        let policy = PAID.with_rate_limit(RateLimit::new(2, Duration::from_secs(60)));

        let mut statuses = Vec::new();
        for _ in 0..4 {
            let response = fx.gateway.run(&fx.headers, &policy, None, Invalid).await;
            statuses.push(response.status());
        }
        assert_eq!(
            statuses,
            [
                StatusCode::BAD_REQUEST,
                StatusCode::BAD_REQUEST,
                StatusCode::TOO_MANY_REQUESTS,
                StatusCode::TOO_MANY_REQUESTS,
            ]
        );

        assert_eq!(fx.store.balance(fx.user_id).await.unwrap(), Some(10));
        let statuses: Vec<String> = fx
            .store
            .usage_entries()
            .into_iter()
            .map(|log| log.status)
            .collect();
        assert_eq!(statuses, ["error", "error", "rate_limited", "rate_limited"]);
    }

    #[tokio::test]
    async fn failed_reservation_is_a_generic_error_without_charge() {
        let fx = fixture(10, ChargePolicy::PayToAttempt).await;
        fx.store.fail_credit_ops(true);

        let response = fx.gateway.run(&fx.headers, &PAID, None, Hangs).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(
            body_json(response).await,
            json!({ "error": "Internal server error" })
        );

        fx.store.fail_credit_ops(false);
        assert_eq!(fx.store.balance(fx.user_id).await.unwrap(), Some(10));
        let logs = fx.store.usage_entries();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "error");
        assert_eq!(logs[0].credits_used, 0);
    }

    #[tokio::test]
    async fn timed_out_reservation_counts_as_not_reserved() {
        let fx = fixture(10, ChargePolicy::PayToAttempt).await;
        // The fixture's store timeout is one second
        fx.store.delay_credit_ops(Duration::from_secs(2));

        let response = fx.gateway.run(&fx.headers, &PAID, None, Hangs).await;
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
        assert_eq!(body_json(response).await["error"], "Internal server error");

        fx.store.delay_credit_ops(Duration::ZERO);
        assert_eq!(fx.store.balance(fx.user_id).await.unwrap(), Some(10));
        let logs = fx.store.usage_entries();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "error");
        assert!(
            logs[0]
                .error_message
                .as_deref()
                .is_some_and(|message| message.contains("timed out"))
        );
    }

    #[tokio::test]
    async fn rewards_are_logged_as_negative_usage() {
        let fx = fixture(10, ChargePolicy::PayToAttempt).await;
        let policy = EndpointPolicy::metered("/contribute", AuthMode::ApiKey, 0);

        let body = body_json(fx.gateway.run(&fx.headers, &policy, None, Rewards).await).await;
        assert_eq!(body["meta"]["creditsUsed"], -5);
        assert_eq!(body["meta"]["remainingCredits"], 15);
        assert_eq!(fx.store.usage_entries()[0].credits_used, -5);
    }

    #[tokio::test]
    async fn cancelled_mid_operation_keeps_credits_under_pay_to_attempt() {
        let fx = fixture(10, ChargePolicy::PayToAttempt).await;

        let run = fx.gateway.run(&fx.headers, &PAID, None, Hangs);
        let timed_out = tokio::time::timeout(Duration::from_millis(50), run).await;
        assert!(timed_out.is_err());
        assert!(fx.tasks.drain(Duration::from_secs(1)).await);

        assert_eq!(fx.store.balance(fx.user_id).await.unwrap(), Some(3));
        let logs = fx.store.usage_entries();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].status, "error");
        assert_eq!(logs[0].error_message.as_deref(), Some("request cancelled"));
        assert_eq!(logs[0].credits_used, 7);
    }

    #[tokio::test]
    async fn cancelled_mid_operation_refunds_under_pay_on_success() {
        let fx = fixture(10, ChargePolicy::PayOnSuccess).await;

        let run = fx.gateway.run(&fx.headers, &PAID, None, Hangs);
        assert!(tokio::time::timeout(Duration::from_millis(50), run).await.is_err());
        assert!(fx.tasks.drain(Duration::from_secs(1)).await);

        assert_eq!(fx.store.balance(fx.user_id).await.unwrap(), Some(10));
        let logs = fx.store.usage_entries();
        assert_eq!(logs.len(), 1);
        assert_eq!(logs[0].credits_used, 0);
    }

    #[tokio::test]
    async fn log_write_failure_does_not_mask_the_response() {
        let fx = fixture(10, ChargePolicy::PayToAttempt).await;
        fx.store.fail_usage_writes(true);

        let response = fx.gateway.run(&fx.headers, &PAID, None, Echo).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["meta"]["remainingCredits"], 3);
    }

    #[tokio::test]
    async fn unauthenticated_requests_leave_no_trace_in_the_ledger() {
        let fx = fixture(10, ChargePolicy::PayToAttempt).await;

        let response = fx.gateway.run(&HeaderMap::new(), &PAID, None, Echo).await;
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
        assert_eq!(body_json(response).await["error"], "Missing credentials");

        assert_eq!(fx.store.balance(fx.user_id).await.unwrap(), Some(10));
        assert!(fx.store.usage_entries().is_empty());
    }

    #[tokio::test]
    async fn public_endpoints_skip_auth_and_logging() {
        let fx = fixture(10, ChargePolicy::PayToAttempt).await;
        let policy = EndpointPolicy::public("/open");

        let response = fx.gateway.run(&HeaderMap::new(), &policy, None, Echo).await;
        assert_eq!(response.status(), StatusCode::OK);
        assert!(fx.store.usage_entries().is_empty());
    }
}
