//! User and session models.
//!
//! This module defines:
//! - `User`: Database entity holding the credit balance
//! - `Session`: Cookie-backed login session
//! - Request/response bodies for registration, login and the profile endpoint

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Represents a user record from the database.
///
/// # Database Table
///
/// Maps to the `users` table. Users are never hard-deleted by this service;
/// deactivation (`is_active = false`) revokes every session and API key at once
/// because all credential lookups join on an active user.
///
/// # Balance Storage
///
/// `credits` is an integer balance. It must stay >= 0, which the database enforces
/// with a CHECK constraint and the ledger enforces with a conditional update.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct User {
    pub id: Uuid,
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub company: Option<String>,
    pub role: Option<String>,
    pub credits: i64,
    pub is_active: bool,
    pub last_login_at: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Login session bound to an opaque cookie token.
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct Session {
    pub id: Uuid,
    pub user_id: Uuid,

    /// 64 hex characters of randomness, unique across live sessions
    pub token: String,

    pub expires_at: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
    pub created_at: DateTime<Utc>,
}

/// Fields needed to insert a user.
#[derive(Debug, Clone)]
pub struct NewUser {
    pub email: String,
    pub password_hash: String,
    pub first_name: String,
    pub last_name: String,
    pub company: Option<String>,
    pub role: Option<String>,
    pub credits: i64,
}

/// Fields needed to insert a session.
#[derive(Debug, Clone)]
pub struct NewSession {
    pub user_id: Uuid,
    pub token: String,
    pub expires_at: DateTime<Utc>,
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

/// Request body for `POST /api/auth/register`.
///
/// # JSON Example
///
/// ```json
/// {
///   "email": "ops@example.com",
///   "password": "Secur3pass",
///   "confirmPassword": "Secur3pass",
///   "firstName": "Ada",
///   "lastName": "Lovelace",
///   "company": "Freight Co"
/// }
/// ```
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RegisterRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
    #[serde(default)]
    pub confirm_password: String,
    #[serde(default)]
    pub first_name: String,
    #[serde(default)]
    pub last_name: String,
    pub company: Option<String>,
    pub role: Option<String>,
}

/// Request body for `POST /api/auth/login`.
#[derive(Debug, Deserialize)]
pub struct LoginRequest {
    #[serde(default)]
    pub email: String,
    #[serde(default)]
    pub password: String,
}

/// Public view of a user (never includes the password hash).
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UserProfile {
    pub id: Uuid,
    pub email: String,
    pub first_name: String,
    pub last_name: String,
    pub company: Option<String>,
    pub role: Option<String>,
    pub credits: i64,
}

impl From<User> for UserProfile {
    fn from(user: User) -> Self {
        Self {
            id: user.id,
            email: user.email,
            first_name: user.first_name,
            last_name: user.last_name,
            company: user.company,
            role: user.role,
            credits: user.credits,
        }
    }
}
