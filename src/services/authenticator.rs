//! Request authentication.
//!
//! Resolves an inbound request to an [`Identity`] from either:
//!
//! - `Authorization: Bearer <prefix>_<64 hex>` (API key)
//! - the session cookie
//!
//! # API Key Path
//!
//! 1. Format gate: prefix, length and hex alphabet are checked before anything else.
//!    Malformed keys never reach the store.
//! 2. The key body (the hex after `<prefix>_`) is hashed with SHA-256.
//! 3. The hash is looked up among active keys of active users.
//! 4. On success `last_used` is stamped on the task supervisor; the request does not
//!    wait for it and its failure is only logged.
//!
//! # Test Identity
//!
//! When configured, one fixed key resolves to a seeded user without a key record. This
//! is the only non-store credential and it is off unless both `DEMO_API_KEY` and
//! `DEMO_USER_EMAIL` are set.

use std::sync::Arc;
use std::time::Duration;

use axum::http::HeaderMap;
use axum::http::header::{AUTHORIZATION, COOKIE};
use sha2::{Digest, Sha256};
use uuid::Uuid;

use crate::models::api_key::ApiKey;
use crate::models::user::User;
use crate::services::tasks::TaskSupervisor;
use crate::store::{CredentialStore, StoreError, with_timeout};

/// Length of the hex body of an API key and of a session token.
pub const TOKEN_HEX_LEN: usize = 64;

/// Which credentials an endpoint accepts.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum AuthMode {
    ApiKey,
    Session,
    /// An `Authorization` header, when present, is authoritative. The session cookie is
    /// only consulted for requests without one.
    ApiKeyOrSession,
}

/// Authenticated caller.
#[derive(Debug, Clone)]
pub struct Identity {
    pub user: User,

    /// `None` for session callers and for the test identity
    pub api_key: Option<ApiKey>,
}

impl Identity {
    pub fn user_id(&self) -> Uuid {
        self.user.id
    }

    pub fn api_key_id(&self) -> Option<Uuid> {
        self.api_key.as_ref().map(|key| key.id)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum AuthFailure {
    #[error("Missing credentials")]
    MissingCredentials,

    #[error("Invalid API key format")]
    InvalidFormat,

    #[error("Authorization header must use the Bearer scheme")]
    UnsupportedScheme,

    /// No match, inactive key, expired session or deactivated user
    #[error("Invalid credentials")]
    InvalidCredentials,

    #[error("credential lookup failed: {0}")]
    Store(#[from] StoreError),
}

/// Fixed key that resolves to a seeded user.
#[derive(Debug, Clone)]
pub struct TestIdentity {
    pub api_key: String,
    pub user_id: Uuid,
}

pub struct Authenticator {
    store: Arc<dyn CredentialStore>,
    tasks: TaskSupervisor,
    key_prefix: String,
    cookie_name: String,
    timeout: Duration,
    test_identity: Option<TestIdentity>,
}

impl Authenticator {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        tasks: TaskSupervisor,
        key_prefix: impl Into<String>,
        cookie_name: impl Into<String>,
        timeout: Duration,
    ) -> Self {
        Self {
            store,
            tasks,
            key_prefix: key_prefix.into(),
            cookie_name: cookie_name.into(),
            timeout,
            test_identity: None,
        }
    }

    pub fn with_test_identity(mut self, test_identity: TestIdentity) -> Self {
        self.test_identity = Some(test_identity);
        self
    }

    pub fn cookie_name(&self) -> &str {
        &self.cookie_name
    }

    pub fn key_prefix(&self) -> &str {
        &self.key_prefix
    }

    /// Resolve the caller of a request under the given mode.
    pub async fn authenticate(
        &self,
        headers: &HeaderMap,
        mode: AuthMode,
    ) -> Result<Identity, AuthFailure> {
        match mode {
            AuthMode::ApiKey => {
                let key = presented_api_key(headers).ok_or(AuthFailure::MissingCredentials)??;
                self.authenticate_api_key(key).await
            }
            AuthMode::Session => {
                let token = self
                    .session_token(headers)
                    .ok_or(AuthFailure::MissingCredentials)?;
                self.authenticate_session(token).await
            }
            AuthMode::ApiKeyOrSession => match presented_api_key(headers) {
                Some(key) => self.authenticate_api_key(key?).await,
                None => {
                    let token = self
                        .session_token(headers)
                        .ok_or(AuthFailure::MissingCredentials)?;
                    self.authenticate_session(token).await
                }
            },
        }
    }

    /// Value of the session cookie, if the request carries one.
    pub fn session_token<'a>(&self, headers: &'a HeaderMap) -> Option<&'a str> {
        cookie_value(headers, &self.cookie_name)
    }

    async fn authenticate_api_key(&self, raw_key: &str) -> Result<Identity, AuthFailure> {
        if let Some(test_identity) = &self.test_identity {
            if raw_key == test_identity.api_key {
                return self.resolve_test_identity(test_identity.user_id).await;
            }
        }

        let body = self
            .key_body(raw_key)
            .ok_or(AuthFailure::InvalidFormat)?;
        let key_hash = hash_key_body(body);

        let (api_key, user) = with_timeout(
            "find_active_api_key",
            self.timeout,
            self.store.find_active_api_key(&key_hash),
        )
        .await?
        .ok_or(AuthFailure::InvalidCredentials)?;

        let store = self.store.clone();
        let key_id = api_key.id;
        let limit = self.timeout;
        self.tasks.spawn("touch_api_key", async move {
            with_timeout("touch_api_key", limit, store.touch_api_key(key_id)).await
        });

        tracing::debug!(user_id = %user.id, api_key_id = %api_key.id, "API key authenticated");

        Ok(Identity {
            user,
            api_key: Some(api_key),
        })
    }

    async fn authenticate_session(&self, token: &str) -> Result<Identity, AuthFailure> {
        if !is_hex_token(token) {
            return Err(AuthFailure::InvalidCredentials);
        }

        let (_session, user) = with_timeout(
            "find_session_user",
            self.timeout,
            self.store.find_session_user(token),
        )
        .await?
        .ok_or(AuthFailure::InvalidCredentials)?;

        Ok(Identity { user, api_key: None })
    }

    async fn resolve_test_identity(&self, user_id: Uuid) -> Result<Identity, AuthFailure> {
        let user = with_timeout("find_user", self.timeout, self.store.find_user(user_id))
            .await?
            .filter(|user| user.is_active)
            .ok_or(AuthFailure::InvalidCredentials)?;

        tracing::debug!(user_id = %user.id, "Test identity authenticated");

        Ok(Identity { user, api_key: None })
    }

    /// The hex body of a well-formed key, `None` otherwise.
    fn key_body<'a>(&self, raw_key: &'a str) -> Option<&'a str> {
        raw_key
            .strip_prefix(self.key_prefix.as_str())
            .and_then(|rest| rest.strip_prefix('_'))
            .filter(|body| is_hex_token(body))
    }
}

/// `Authorization: Bearer <token>` value.
pub fn bearer_token(headers: &HeaderMap) -> Option<&str> {
    headers
        .get(AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .map(str::trim)
        .filter(|token| !token.is_empty())
}

/// The API key of a request that carries an `Authorization` header.
///
/// `None` only when the header is absent. A header in any shape other than
/// `Bearer <token>` is still a presented credential and fails.
fn presented_api_key(headers: &HeaderMap) -> Option<Result<&str, AuthFailure>> {
    headers.get(AUTHORIZATION)?;
    Some(bearer_token(headers).ok_or(AuthFailure::UnsupportedScheme))
}

/// Value of a named cookie from the `Cookie` headers.
pub fn cookie_value<'a>(headers: &'a HeaderMap, name: &str) -> Option<&'a str> {
    headers
        .get_all(COOKIE)
        .iter()
        .filter_map(|value| value.to_str().ok())
        .flat_map(|value| value.split(';'))
        .filter_map(|pair| pair.trim().split_once('='))
        .find(|(key, _)| *key == name)
        .map(|(_, value)| value)
        .filter(|value| !value.is_empty())
}

fn is_hex_token(value: &str) -> bool {
    value.len() == TOKEN_HEX_LEN && value.bytes().all(|b| b.is_ascii_hexdigit())
}

/// SHA-256 of an API key body, hex encoded. This is the only stored form of a key.
pub fn hash_key_body(body: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(body.as_bytes());
    hex::encode(hasher.finalize())
}

/// 32 random bytes, hex encoded.
pub fn random_token() -> String {
    hex::encode(rand::random::<[u8; 32]>())
}

/// A fresh API key and the hash to store for it.
pub fn generate_api_key(prefix: &str) -> (String, String) {
    let body = random_token();
    let key_hash = hash_key_body(&body);
    (format!("{prefix}_{body}"), key_hash)
}
