//! PostgreSQL implementation of the store traits.
//!
//! # Atomicity Guarantees
//!
//! Credit deduction is a single conditional `UPDATE ... WHERE credits >= $amount`.
//! PostgreSQL row locking serializes concurrent deductions for the same user, so the
//! balance never goes negative and no read-check-write race exists.

use async_trait::async_trait;
use uuid::Uuid;

use super::{CredentialStore, CreditStore, StoreError, UsageStore};
use crate::db::DbPool;
use crate::models::api_key::ApiKey;
use crate::models::usage::{DailyUsage, NewUsageLog, UsageLog};
use crate::models::user::{NewSession, NewUser, Session, User};

const USER_COLUMNS: &str = "id, email, password_hash, first_name, last_name, company, role, \
     credits, is_active, last_login_at, created_at, updated_at";

/// Store backed by a sqlx connection pool.
#[derive(Debug, Clone)]
pub struct PgStore {
    pool: DbPool,
}

impl PgStore {
    pub fn new(pool: DbPool) -> Self {
        Self { pool }
    }

    pub fn pool(&self) -> &DbPool {
        &self.pool
    }
}

/// Row shape of the session/user join.
#[derive(sqlx::FromRow)]
struct SessionUserRow {
    #[sqlx(flatten)]
    user: User,
    session_id: Uuid,
    token: String,
    expires_at: chrono::DateTime<chrono::Utc>,
    user_agent: Option<String>,
    ip_address: Option<String>,
    session_created_at: chrono::DateTime<chrono::Utc>,
}

/// Row shape of the api key/user join.
#[derive(sqlx::FromRow)]
struct ApiKeyUserRow {
    #[sqlx(flatten)]
    user: User,
    key_id: Uuid,
    key_hash: String,
    key_name: String,
    key_is_active: bool,
    key_last_used: Option<chrono::DateTime<chrono::Utc>>,
    key_created_at: chrono::DateTime<chrono::Utc>,
}

#[async_trait]
impl CredentialStore for PgStore {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE id = $1"
        ))
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let user = sqlx::query_as::<_, User>(&format!(
            "SELECT {USER_COLUMNS} FROM users WHERE email = $1"
        ))
        .bind(email)
        .fetch_optional(&self.pool)
        .await?;

        Ok(user)
    }

    async fn create_user(&self, user: NewUser) -> Result<User, StoreError> {
        let result = sqlx::query_as::<_, User>(&format!(
            r#"
            INSERT INTO users (email, password_hash, first_name, last_name, company, role, credits)
            VALUES ($1, $2, $3, $4, $5, $6, $7)
            RETURNING {USER_COLUMNS}
            "#
        ))
        .bind(&user.email)
        .bind(&user.password_hash)
        .bind(&user.first_name)
        .bind(&user.last_name)
        .bind(&user.company)
        .bind(&user.role)
        .bind(user.credits)
        .fetch_one(&self.pool)
        .await;

        match result {
            Ok(user) => Ok(user),
            // 23505 = unique_violation on users.email
            Err(sqlx::Error::Database(db_err)) if db_err.code().as_deref() == Some("23505") => {
                Err(StoreError::Conflict(format!("email {} already registered", user.email)))
            }
            Err(e) => Err(e.into()),
        }
    }

    async fn touch_last_login(&self, user_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE users SET last_login_at = NOW(), updated_at = NOW() WHERE id = $1")
            .bind(user_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn create_session(&self, session: NewSession) -> Result<Session, StoreError> {
        let session = sqlx::query_as::<_, Session>(
            r#"
            INSERT INTO sessions (user_id, token, expires_at, user_agent, ip_address)
            VALUES ($1, $2, $3, $4, $5)
            RETURNING id, user_id, token, expires_at, user_agent, ip_address, created_at
            "#,
        )
        .bind(session.user_id)
        .bind(&session.token)
        .bind(session.expires_at)
        .bind(&session.user_agent)
        .bind(&session.ip_address)
        .fetch_one(&self.pool)
        .await?;

        Ok(session)
    }

    async fn find_session_user(&self, token: &str) -> Result<Option<(Session, User)>, StoreError> {
        // Expired sessions and deactivated users both fall out of the join
        let row = sqlx::query_as::<_, SessionUserRow>(
            r#"
            SELECT u.id, u.email, u.password_hash, u.first_name, u.last_name, u.company, u.role,
                   u.credits, u.is_active, u.last_login_at, u.created_at, u.updated_at,
                   s.id AS session_id, s.token, s.expires_at, s.user_agent, s.ip_address,
                   s.created_at AS session_created_at
            FROM sessions s
            JOIN users u ON u.id = s.user_id
            WHERE s.token = $1 AND s.expires_at > NOW() AND u.is_active = true
            "#,
        )
        .bind(token)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let session = Session {
                id: row.session_id,
                user_id: row.user.id,
                token: row.token,
                expires_at: row.expires_at,
                user_agent: row.user_agent,
                ip_address: row.ip_address,
                created_at: row.session_created_at,
            };
            (session, row.user)
        }))
    }

    async fn delete_session(&self, token: &str) -> Result<(), StoreError> {
        sqlx::query("DELETE FROM sessions WHERE token = $1")
            .bind(token)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn purge_expired_sessions(&self) -> Result<u64, StoreError> {
        let purged = sqlx::query("DELETE FROM sessions WHERE expires_at <= NOW()")
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(purged)
    }

    async fn find_active_api_key(
        &self,
        key_hash: &str,
    ) -> Result<Option<(ApiKey, User)>, StoreError> {
        let row = sqlx::query_as::<_, ApiKeyUserRow>(
            r#"
            SELECT u.id, u.email, u.password_hash, u.first_name, u.last_name, u.company, u.role,
                   u.credits, u.is_active, u.last_login_at, u.created_at, u.updated_at,
                   k.id AS key_id, k.key_hash, k.name AS key_name, k.is_active AS key_is_active,
                   k.last_used AS key_last_used, k.created_at AS key_created_at
            FROM api_keys k
            JOIN users u ON u.id = k.user_id
            WHERE k.key_hash = $1 AND k.is_active = true AND u.is_active = true
            "#,
        )
        .bind(key_hash)
        .fetch_optional(&self.pool)
        .await?;

        Ok(row.map(|row| {
            let key = ApiKey {
                id: row.key_id,
                user_id: row.user.id,
                key_hash: row.key_hash,
                name: row.key_name,
                is_active: row.key_is_active,
                last_used: row.key_last_used,
                created_at: row.key_created_at,
            };
            (key, row.user)
        }))
    }

    async fn touch_api_key(&self, key_id: Uuid) -> Result<(), StoreError> {
        sqlx::query("UPDATE api_keys SET last_used = NOW() WHERE id = $1")
            .bind(key_id)
            .execute(&self.pool)
            .await?;

        Ok(())
    }

    async fn list_api_keys(&self, user_id: Uuid) -> Result<Vec<ApiKey>, StoreError> {
        let keys = sqlx::query_as::<_, ApiKey>(
            r#"
            SELECT id, user_id, key_hash, name, is_active, last_used, created_at
            FROM api_keys
            WHERE user_id = $1
            ORDER BY created_at DESC
            "#,
        )
        .bind(user_id)
        .fetch_all(&self.pool)
        .await?;

        Ok(keys)
    }

    async fn create_api_key(
        &self,
        user_id: Uuid,
        name: &str,
        key_hash: &str,
        max_keys: usize,
    ) -> Result<Option<ApiKey>, StoreError> {
        let mut tx = self.pool.begin().await?;

        // Lock the owner so concurrent creations for the same user count one at a time
        sqlx::query("SELECT id FROM users WHERE id = $1 FOR UPDATE")
            .bind(user_id)
            .fetch_optional(&mut *tx)
            .await?;

        let existing: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM api_keys WHERE user_id = $1")
            .bind(user_id)
            .fetch_one(&mut *tx)
            .await?;

        if existing >= max_keys as i64 {
            tx.rollback().await?;
            return Ok(None);
        }

        let key = sqlx::query_as::<_, ApiKey>(
            r#"
            INSERT INTO api_keys (user_id, key_hash, name)
            VALUES ($1, $2, $3)
            RETURNING id, user_id, key_hash, name, is_active, last_used, created_at
            "#,
        )
        .bind(user_id)
        .bind(key_hash)
        .bind(name)
        .fetch_one(&mut *tx)
        .await?;

        tx.commit().await?;

        Ok(Some(key))
    }

    async fn delete_api_key(&self, user_id: Uuid, key_id: Uuid) -> Result<bool, StoreError> {
        let deleted = sqlx::query("DELETE FROM api_keys WHERE id = $1 AND user_id = $2")
            .bind(key_id)
            .bind(user_id)
            .execute(&self.pool)
            .await?
            .rows_affected();

        Ok(deleted > 0)
    }

    async fn set_api_key_active(
        &self,
        user_id: Uuid,
        key_id: Uuid,
        is_active: bool,
    ) -> Result<bool, StoreError> {
        let updated = sqlx::query(
            "UPDATE api_keys SET is_active = $1, updated_at = NOW() WHERE id = $2 AND user_id = $3",
        )
        .bind(is_active)
        .bind(key_id)
        .bind(user_id)
        .execute(&self.pool)
        .await?
        .rows_affected();

        Ok(updated > 0)
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").execute(&self.pool).await?;
        Ok(())
    }
}

#[async_trait]
impl CreditStore for PgStore {
    async fn try_deduct(&self, user_id: Uuid, amount: i64) -> Result<Option<i64>, StoreError> {
        // Check and deduct in one statement; zero rows means the balance did not cover it
        let remaining: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE users
            SET credits = credits - $1,
                updated_at = NOW()
            WHERE id = $2 AND credits >= $1
            RETURNING credits
            "#,
        )
        .bind(amount)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(remaining)
    }

    async fn add(&self, user_id: Uuid, amount: i64) -> Result<Option<i64>, StoreError> {
        let balance: Option<i64> = sqlx::query_scalar(
            r#"
            UPDATE users
            SET credits = credits + $1,
                updated_at = NOW()
            WHERE id = $2
            RETURNING credits
            "#,
        )
        .bind(amount)
        .bind(user_id)
        .fetch_optional(&self.pool)
        .await?;

        Ok(balance)
    }

    async fn balance(&self, user_id: Uuid) -> Result<Option<i64>, StoreError> {
        let balance: Option<i64> = sqlx::query_scalar("SELECT credits FROM users WHERE id = $1")
            .bind(user_id)
            .fetch_optional(&self.pool)
            .await?;

        Ok(balance)
    }
}

#[async_trait]
impl UsageStore for PgStore {
    async fn insert_usage(&self, entry: NewUsageLog) -> Result<(), StoreError> {
        sqlx::query(
            r#"
            INSERT INTO usage_logs (
                user_id,
                api_key_id,
                endpoint,
                credits_used,
                request_data,
                response_data,
                processing_time_ms,
                status,
                error_message
            )
            VALUES ($1, $2, $3, $4, $5, $6, $7, $8, $9)
            "#,
        )
        .bind(entry.user_id)
        .bind(entry.api_key_id)
        .bind(&entry.endpoint)
        .bind(entry.credits_used)
        .bind(&entry.request_data)
        .bind(&entry.response_data)
        .bind(entry.processing_time_ms)
        .bind(entry.status.as_str())
        .bind(&entry.error_message)
        .execute(&self.pool)
        .await?;

        Ok(())
    }

    async fn list_usage(&self, user_id: Uuid, limit: i64) -> Result<Vec<UsageLog>, StoreError> {
        let logs = sqlx::query_as::<_, UsageLog>(
            r#"
            SELECT id, user_id, api_key_id, endpoint, credits_used, request_data, response_data,
                   processing_time_ms, status, error_message, created_at
            FROM usage_logs
            WHERE user_id = $1
            ORDER BY created_at DESC
            LIMIT $2
            "#,
        )
        .bind(user_id)
        .bind(limit)
        .fetch_all(&self.pool)
        .await?;

        Ok(logs)
    }

    async fn daily_usage(&self, user_id: Uuid, days: i64) -> Result<Vec<DailyUsage>, StoreError> {
        let stats = sqlx::query_as::<_, DailyUsage>(
            r#"
            SELECT date_trunc('day', created_at)::date AS date,
                   COUNT(*) AS requests,
                   COALESCE(SUM(credits_used), 0)::bigint AS credits_used,
                   (AVG(CASE WHEN status = 'success' THEN 1.0 ELSE 0.0 END) * 100)::float8 AS success_rate
            FROM usage_logs
            WHERE user_id = $1 AND created_at >= NOW() - make_interval(days => $2::int)
            GROUP BY 1
            ORDER BY 1
            "#,
        )
        .bind(user_id)
        .bind(days)
        .fetch_all(&self.pool)
        .await?;

        Ok(stats)
    }
}
