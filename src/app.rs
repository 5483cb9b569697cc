//! Application state and router construction.
//!
//! Split from `main` so integration tests can build the exact production router on top
//! of the in-process store.

use std::sync::Arc;
use std::time::Duration;

use axum::{
    Router, middleware as axum_middleware,
    routing::{get, post, put},
};
use tower_http::{cors::CorsLayer, trace::TraceLayer};

use crate::config::{Config, ConfigError};
use crate::handlers;
use crate::middleware::auth::{require_api_key, require_api_key_or_session, require_session};
use crate::services::accounts::AccountService;
use crate::services::authenticator::{Authenticator, TestIdentity};
use crate::services::credit_ledger::CreditLedger;
use crate::services::gateway::Gateway;
use crate::services::rate_limiter::{RateLimitStore, RateLimiter};
use crate::services::tasks::TaskSupervisor;
use crate::services::usage_recorder::UsageRecorder;
use crate::store::Store;

/// State shared by every handler.
#[derive(Clone)]
pub struct AppState {
    pub config: Arc<Config>,
    pub store: Arc<dyn Store>,
    pub gateway: Gateway,
    pub accounts: AccountService,
    pub tasks: TaskSupervisor,
}

impl AppState {
    /// Wire the gateway stages on top of one store.
    ///
    /// `test_identity` is the already-resolved test identity provider, if enabled.
    pub fn new<S: Store + 'static>(
        config: Config,
        store: Arc<S>,
        rate_limits: Arc<dyn RateLimitStore>,
        tasks: TaskSupervisor,
        test_identity: Option<TestIdentity>,
    ) -> Result<Self, ConfigError> {
        let timeout = config.store_timeout();

        let mut authenticator = Authenticator::new(
            store.clone(),
            tasks.clone(),
            config.api_key_prefix.clone(),
            config.session_cookie_name.clone(),
            timeout,
        );
        if let Some(test_identity) = test_identity {
            authenticator = authenticator.with_test_identity(test_identity);
        }

        let gateway = Gateway::new(
            authenticator,
            RateLimiter::new(rate_limits),
            CreditLedger::new(store.clone(), timeout),
            UsageRecorder::new(
                store.clone(),
                tasks.clone(),
                config.usage_log_mode()?,
                timeout,
            ),
            tasks.clone(),
            config.charge_policy()?,
            config.is_development(),
        );

        let accounts = AccountService::new(
            store.clone(),
            timeout,
            config.session_ttl_days,
            config.api_key_prefix.clone(),
            config.max_api_keys_per_user,
        );

        Ok(Self {
            config: Arc::new(config),
            store,
            gateway,
            accounts,
            tasks,
        })
    }

    pub fn store_timeout(&self) -> Duration {
        self.config.store_timeout()
    }
}

/// Build the HTTP router.
pub fn build_router(state: AppState) -> Router {
    // Session-authenticated account management
    let session_routes = Router::new()
        .route("/api/auth/me", get(handlers::auth::me))
        .route(
            "/api/auth/api-keys",
            get(handlers::api_keys::list_api_keys)
                .post(handlers::api_keys::create_api_key)
                .delete(handlers::api_keys::delete_api_key),
        )
        .route(
            "/api/auth/api-keys/toggle",
            put(handlers::api_keys::toggle_api_key),
        )
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            require_session,
        ));

    let dual_routes = Router::new()
        .route("/api/usage", get(handlers::usage::get_usage))
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            require_api_key_or_session,
        ));

    // One path, a different credential mode per method
    let credits = get(handlers::credits::get_credits)
        .route_layer(axum_middleware::from_fn_with_state(
            state.clone(),
            require_api_key_or_session,
        ))
        .merge(
            post(handlers::credits::add_credits).route_layer(
                axum_middleware::from_fn_with_state(state.clone(), require_session),
            ),
        )
        .merge(
            put(handlers::credits::deduct_credits).route_layer(
                axum_middleware::from_fn_with_state(state.clone(), require_api_key),
            ),
        );

    // Metered routes authenticate inside the gateway
    let metered_routes = Router::new()
        .route("/api/gis/analyze", post(handlers::gis::analyze))
        .route(
            "/api/datasets",
            get(handlers::datasets::list_datasets).post(handlers::datasets::contribute),
        )
        .route(
            "/api/demo",
            get(handlers::demo::info).post(handlers::demo::echo),
        );

    Router::new()
        // Public routes (no authentication required)
        .route("/health", get(handlers::health::health_check))
        .route("/api/auth/register", post(handlers::auth::register))
        .route("/api/auth/login", post(handlers::auth::login))
        .route("/api/auth/logout", post(handlers::auth::logout))
        .route("/api/credits", credits)
        .merge(session_routes)
        .merge(dual_routes)
        .merge(metered_routes)
        .layer(TraceLayer::new_for_http())
        .layer(CorsLayer::permissive())
        .with_state(state)
}
