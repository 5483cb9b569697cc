//! API Key model for authentication.
//!
//! API keys authenticate programmatic callers of the metered endpoints. The raw key is
//! generated once, returned to its owner, and only its SHA-256 hash is ever stored.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

/// Represents an API key record from the database.
///
/// # Database Table
///
/// Maps to the `api_keys` table with columns:
/// - `id`: Unique identifier (UUID)
/// - `user_id`: Owning user
/// - `key_hash`: SHA-256 hash of the key body (the 64 hex chars after the prefix)
/// - `name`: Owner-chosen label
/// - `is_active`: Whether the key is currently accepted
/// - `last_used`: Best-effort timestamp of the last successful authentication
#[derive(Debug, Clone, sqlx::FromRow)]
pub struct ApiKey {
    /// Unique identifier for this API key
    pub id: Uuid,

    pub user_id: Uuid,

    /// SHA-256 hash of the key body (64 hex characters)
    ///
    /// When a request comes in with "Bearer gis_<body>", we:
    /// 1. Check the prefix and that `<body>` is 64 hex characters
    /// 2. Hash `<body>` with SHA-256
    /// 3. Look up this hash among active keys of active users
    pub key_hash: String,

    pub name: String,

    /// Inactive keys are rejected during authentication. This revokes access without
    /// deleting the record.
    pub is_active: bool,

    pub last_used: Option<DateTime<Utc>>,

    pub created_at: DateTime<Utc>,
}

/// Request body for `POST /api/auth/api-keys`.
#[derive(Debug, Deserialize)]
pub struct CreateApiKeyRequest {
    #[serde(default)]
    pub name: Option<String>,
}

/// Request body for `DELETE /api/auth/api-keys`.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct DeleteApiKeyRequest {
    pub key_id: Option<Uuid>,
}

/// Request body for `PUT /api/auth/api-keys/toggle`.
///
/// `is_active` is kept as raw JSON so a non-boolean is reported as a validation error.
#[derive(Debug, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct ToggleApiKeyRequest {
    pub key_id: Option<Uuid>,
    pub is_active: Option<serde_json::Value>,
}

/// API key as listed to its owner.
///
/// Only the first characters of the hash are returned, enough to tell keys apart.
///
/// ```json
/// {
///   "id": "550e8400-e29b-41d4-a716-446655440000",
///   "name": "Routing worker",
///   "keyHint": "9f86d081",
///   "isActive": true,
///   "lastUsed": null,
///   "createdAt": "2025-01-15T10:30:00Z"
/// }
/// ```
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ApiKeyResponse {
    pub id: Uuid,
    pub name: String,
    pub key_hint: String,
    pub is_active: bool,
    pub last_used: Option<DateTime<Utc>>,
    pub created_at: DateTime<Utc>,
}

impl From<ApiKey> for ApiKeyResponse {
    fn from(key: ApiKey) -> Self {
        Self {
            id: key.id,
            name: key.name,
            key_hint: key.key_hash.chars().take(8).collect(),
            is_active: key.is_active,
            last_used: key.last_used,
            created_at: key.created_at,
        }
    }
}

/// Response for a newly created key. `api_key` is the only time the raw key is visible.
#[derive(Debug, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct CreatedApiKeyResponse {
    pub success: bool,
    pub id: Uuid,
    pub api_key: String,
    pub message: String,
}
