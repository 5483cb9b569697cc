//! Credit Gateway - Main Application Entry Point
//!
//! REST API server that meters access to GIS analysis and logistics datasets with
//! per-user credit balances.
//!
//! # Architecture
//!
//! - **Web Framework**: Axum (async HTTP server)
//! - **Database**: PostgreSQL with sqlx, or the in-process store without `DATABASE_URL`
//! - **Authentication**: API keys (SHA-256 hashed) and session cookies
//! - **Format**: JSON requests/responses
//!
//! # Startup Flow
//!
//! 1. Load configuration from environment variables
//! 2. Create database connection pool and run migrations
//! 3. Resolve the demo identity, if configured
//! 4. Build HTTP router and start the cleanup loop
//! 5. Serve until Ctrl+C or SIGTERM, then drain background tasks

use std::sync::Arc;
use std::time::Duration;

use anyhow::Context;
use tracing_subscriber::EnvFilter;

use credit_gateway::app::{AppState, build_router};
use credit_gateway::config::Config;
use credit_gateway::db;
use credit_gateway::services::authenticator::TestIdentity;
use credit_gateway::services::rate_limiter::{MemoryRateLimitStore, RateLimiter};
use credit_gateway::services::tasks::TaskSupervisor;
use credit_gateway::store::{CredentialStore, MemoryStore, PgStore, Store, with_timeout};

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    // Initialize logging with tracing subscriber. Reads RUST_LOG environment variable (defaults to "info" level)
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::try_from_default_env().unwrap_or_else(|_| "info".into()))
        .init();

    let config = Config::from_env().context("failed to load configuration")?;
    tracing::info!(
        app_env = %config.app_env,
        charge_policy = %config.charge_policy,
        usage_log_mode = %config.usage_log_mode,
        "Configuration loaded"
    );

    match config.database_url.clone() {
        Some(url) => {
            let pool = db::create_pool(&url, config.store_timeout()).await?;
            tracing::info!("Database pool created");

            db::run_migrations(&pool).await?;
            tracing::info!("Database migrations complete");

            serve(config, Arc::new(PgStore::new(pool))).await
        }
        None => {
            tracing::warn!("DATABASE_URL not set, using the in-process store; data is lost on exit");
            serve(config, Arc::new(MemoryStore::new())).await
        }
    }
}

async fn serve<S: Store + 'static>(config: Config, store: Arc<S>) -> anyhow::Result<()> {
    let tasks = TaskSupervisor::new();
    let rate_limits = Arc::new(MemoryRateLimitStore::new());

    let test_identity = resolve_test_identity(&config, store.as_ref()).await?;

    let addr = format!("0.0.0.0:{}", config.server_port);
    let drain_limit = Duration::from_secs(config.shutdown_drain_secs);
    let gc_interval = Duration::from_secs(config.rate_limit_gc_interval_secs.max(1));

    let state = AppState::new(config, store.clone(), rate_limits.clone(), tasks.clone(), test_identity)?;

    let cleanup = tokio::spawn(cleanup_loop(
        RateLimiter::new(rate_limits),
        store,
        state.store_timeout(),
        gc_interval,
    ));

    let app = build_router(state);

    let listener = tokio::net::TcpListener::bind(&addr).await?;
    tracing::info!("Server listening on {}", addr);

    axum::serve(listener, app)
        .with_graceful_shutdown(shutdown_signal())
        .await?;

    cleanup.abort();

    tracing::info!(pending = tasks.in_flight(), "Draining background tasks");
    if !tasks.drain(drain_limit).await {
        tracing::warn!(
            pending = tasks.in_flight(),
            "Shutdown drain timed out; some usage entries or refunds may be lost"
        );
    }

    Ok(())
}

/// Map the configured demo key to the demo user, if both are set and the user exists.
async fn resolve_test_identity<S: Store>(
    config: &Config,
    store: &S,
) -> anyhow::Result<Option<TestIdentity>> {
    let Some((api_key, email)) = config.demo_identity() else {
        return Ok(None);
    };

    let user = with_timeout(
        "find_user_by_email",
        config.store_timeout(),
        store.find_user_by_email(&email.trim().to_lowercase()),
    )
    .await
    .context("failed to look up the demo user")?;

    match user {
        Some(user) => {
            tracing::warn!(user_id = %user.id, "Test identity provider enabled");
            Ok(Some(TestIdentity {
                api_key: api_key.to_string(),
                user_id: user.id,
            }))
        }
        None => {
            tracing::warn!(email, "Demo user not found, test identity provider disabled");
            Ok(None)
        }
    }
}

/// Purge expired rate-limit windows and sessions on a fixed interval.
async fn cleanup_loop<S: Store>(
    rate_limiter: RateLimiter,
    store: Arc<S>,
    store_timeout: Duration,
    every: Duration,
) {
    let mut interval = tokio::time::interval(every);
    // First tick completes immediately
    interval.tick().await;

    loop {
        interval.tick().await;

        let windows = rate_limiter.purge_expired().await;
        match with_timeout(
            "purge_expired_sessions",
            store_timeout,
            store.purge_expired_sessions(),
        )
        .await
        {
            Ok(sessions) => {
                tracing::debug!(windows, sessions, "Expired state purged");
            }
            Err(e) => tracing::warn!(error = %e, "Failed to purge expired sessions"),
        }
    }
}

async fn shutdown_signal() {
    let ctrl_c = async {
        if let Err(e) = tokio::signal::ctrl_c().await {
            tracing::error!(error = %e, "Failed to install Ctrl+C handler");
            std::future::pending::<()>().await;
        }
    };

    #[cfg(unix)]
    let terminate = async {
        match tokio::signal::unix::signal(tokio::signal::unix::SignalKind::terminate()) {
            Ok(mut signal) => {
                signal.recv().await;
            }
            Err(e) => {
                tracing::error!(error = %e, "Failed to install SIGTERM handler");
                std::future::pending::<()>().await;
            }
        }
    };

    #[cfg(not(unix))]
    let terminate = std::future::pending::<()>();

    tokio::select! {
        _ = ctrl_c => {},
        _ = terminate => {},
    }

    tracing::info!("Shutdown signal received");
}
