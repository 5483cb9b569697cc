//! Credential, credit and usage persistence.
//!
//! The gateway only talks to storage through the traits in this module, so the same
//! pipeline runs against PostgreSQL in production and against the in-process store in
//! tests and database-less local runs.
//!
//! - [`CredentialStore`]: users, sessions and API keys
//! - [`CreditStore`]: atomic balance updates
//! - [`UsageStore`]: append-only usage log

use std::future::Future;
use std::time::Duration;

use async_trait::async_trait;
use uuid::Uuid;

use crate::models::api_key::ApiKey;
use crate::models::usage::{DailyUsage, NewUsageLog, UsageLog};
use crate::models::user::{NewSession, NewUser, Session, User};

pub mod memory;
pub mod postgres;

pub use memory::MemoryStore;
pub use postgres::PgStore;

/// Errors surfaced by store implementations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    #[error("database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("store call `{0}` timed out")]
    Timeout(&'static str),

    #[error("conflict: {0}")]
    Conflict(String),

    #[error("store unavailable: {0}")]
    Unavailable(String),

    #[error("credit balance of user {0} would overflow")]
    Overflow(Uuid),
}

/// Run a store call with an upper bound on its duration.
///
/// An elapsed call is reported as [`StoreError::Timeout`]. Callers treat it as a failure
/// of the stage that issued it, never as a partial success.
pub async fn with_timeout<T, F>(op: &'static str, limit: Duration, fut: F) -> Result<T, StoreError>
where
    F: Future<Output = Result<T, StoreError>>,
{
    match tokio::time::timeout(limit, fut).await {
        Ok(result) => result,
        Err(_) => Err(StoreError::Timeout(op)),
    }
}

/// Users, sessions and API keys.
#[async_trait]
pub trait CredentialStore: Send + Sync {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError>;

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError>;

    /// Fails with [`StoreError::Conflict`] when the email is taken.
    async fn create_user(&self, user: NewUser) -> Result<User, StoreError>;

    async fn touch_last_login(&self, user_id: Uuid) -> Result<(), StoreError>;

    async fn create_session(&self, session: NewSession) -> Result<Session, StoreError>;

    /// Non-expired session joined to an active user.
    async fn find_session_user(&self, token: &str) -> Result<Option<(Session, User)>, StoreError>;

    async fn delete_session(&self, token: &str) -> Result<(), StoreError>;

    async fn purge_expired_sessions(&self) -> Result<u64, StoreError>;

    /// Active key with this hash, joined to an active user.
    async fn find_active_api_key(&self, key_hash: &str)
    -> Result<Option<(ApiKey, User)>, StoreError>;

    async fn touch_api_key(&self, key_id: Uuid) -> Result<(), StoreError>;

    async fn list_api_keys(&self, user_id: Uuid) -> Result<Vec<ApiKey>, StoreError>;

    /// Insert a key unless the user already holds `max_keys` keys; `None` when capped.
    async fn create_api_key(
        &self,
        user_id: Uuid,
        name: &str,
        key_hash: &str,
        max_keys: usize,
    ) -> Result<Option<ApiKey>, StoreError>;

    /// `false` when the key does not exist or belongs to someone else.
    async fn delete_api_key(&self, user_id: Uuid, key_id: Uuid) -> Result<bool, StoreError>;

    /// `false` when the key does not exist or belongs to someone else.
    async fn set_api_key_active(
        &self,
        user_id: Uuid,
        key_id: Uuid,
        is_active: bool,
    ) -> Result<bool, StoreError>;

    async fn ping(&self) -> Result<(), StoreError>;
}

/// Integer credit balances.
#[async_trait]
pub trait CreditStore: Send + Sync {
    /// Deduct `amount` iff the balance covers it, as one atomic step.
    ///
    /// Returns the remaining balance, or `None` when nothing was deducted.
    async fn try_deduct(&self, user_id: Uuid, amount: i64) -> Result<Option<i64>, StoreError>;

    /// Unconditional increment. Returns the new balance, `None` for an unknown user.
    async fn add(&self, user_id: Uuid, amount: i64) -> Result<Option<i64>, StoreError>;

    async fn balance(&self, user_id: Uuid) -> Result<Option<i64>, StoreError>;
}

/// Append-only usage log.
#[async_trait]
pub trait UsageStore: Send + Sync {
    async fn insert_usage(&self, entry: NewUsageLog) -> Result<(), StoreError>;

    /// Newest first.
    async fn list_usage(&self, user_id: Uuid, limit: i64) -> Result<Vec<UsageLog>, StoreError>;

    async fn daily_usage(&self, user_id: Uuid, days: i64) -> Result<Vec<DailyUsage>, StoreError>;
}

/// Anything that can back the whole service.
pub trait Store: CredentialStore + CreditStore + UsageStore {}

impl<T: CredentialStore + CreditStore + UsageStore> Store for T {}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn with_timeout_reports_elapsed_calls() {
        let result: Result<(), StoreError> = with_timeout(
            "slow_call",
            Duration::from_millis(10),
            async {
                tokio::time::sleep(Duration::from_secs(5)).await;
                Ok(())
            },
        )
        .await;

        assert!(matches!(result, Err(StoreError::Timeout("slow_call"))));
    }

    #[tokio::test]
    async fn with_timeout_passes_through_results() {
        let result = with_timeout("fast_call", Duration::from_secs(1), async { Ok(7) }).await;
        assert_eq!(result.unwrap(), 7);
    }
}
