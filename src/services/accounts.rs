//! Account service - registration, login sessions and API key management.
//!
//! These operations are not metered. Passwords are hashed with Argon2 on the blocking
//! pool; API keys are generated by the authenticator helpers so both sides agree on
//! the key format.

use std::sync::Arc;
use std::time::Duration;

use argon2::{
    Argon2,
    password_hash::{PasswordHash, PasswordHasher, PasswordVerifier, SaltString, rand_core::OsRng},
};
use chrono::Utc;
use uuid::Uuid;

use crate::error::AppError;
use crate::models::api_key::ApiKey;
use crate::models::user::{LoginRequest, NewSession, NewUser, RegisterRequest, Session, User};
use crate::services::authenticator::{generate_api_key, random_token};
use crate::store::{CredentialStore, StoreError, with_timeout};

pub const MIN_PASSWORD_LEN: usize = 8;

/// Owner-facing operations on users, sessions and keys.
#[derive(Clone)]
pub struct AccountService {
    store: Arc<dyn CredentialStore>,
    timeout: Duration,
    session_ttl: chrono::Duration,
    key_prefix: String,
    max_api_keys: usize,
}

/// Where a login came from, stored on the session.
#[derive(Debug, Clone, Default)]
pub struct ClientInfo {
    pub user_agent: Option<String>,
    pub ip_address: Option<String>,
}

impl AccountService {
    pub fn new(
        store: Arc<dyn CredentialStore>,
        timeout: Duration,
        session_ttl_days: i64,
        key_prefix: impl Into<String>,
        max_api_keys: usize,
    ) -> Self {
        Self {
            store,
            timeout,
            session_ttl: chrono::Duration::days(session_ttl_days),
            key_prefix: key_prefix.into(),
            max_api_keys,
        }
    }

    pub fn session_ttl(&self) -> chrono::Duration {
        self.session_ttl
    }

    /// Create a user with a zero balance.
    ///
    /// # Errors
    ///
    /// - `InvalidRequest`: missing field, bad email or mismatched passwords
    /// - `Validation`: password rules not met, with one detail per broken rule
    /// - `Conflict`: email already registered
    pub async fn register(&self, request: RegisterRequest) -> Result<User, AppError> {
        let email = normalize_email(&request.email);
        let first_name = request.first_name.trim().to_string();
        let last_name = request.last_name.trim().to_string();

        if email.is_empty()
            || request.password.is_empty()
            || first_name.is_empty()
            || last_name.is_empty()
        {
            return Err(AppError::InvalidRequest(
                "First name, last name, email, and password are required".to_string(),
            ));
        }

        if !is_valid_email(&email) {
            return Err(AppError::InvalidRequest("Invalid email format".to_string()));
        }

        if request.password != request.confirm_password {
            return Err(AppError::InvalidRequest("Passwords do not match".to_string()));
        }

        let problems = password_problems(&request.password);
        if !problems.is_empty() {
            return Err(AppError::Validation {
                message: "Password requirements not met".to_string(),
                details: problems,
            });
        }

        let existing = with_timeout(
            "find_user_by_email",
            self.timeout,
            self.store.find_user_by_email(&email),
        )
        .await?;
        if existing.is_some() {
            return Err(user_exists());
        }

        let password_hash = hash_password(request.password).await?;

        let user = with_timeout(
            "create_user",
            self.timeout,
            self.store.create_user(NewUser {
                email,
                password_hash,
                first_name,
                last_name,
                company: non_empty(request.company),
                role: non_empty(request.role),
                credits: 0,
            }),
        )
        .await
        .map_err(|e| match e {
            // Lost a race with a concurrent registration of the same email
            StoreError::Conflict(_) => user_exists(),
            other => AppError::Store(other),
        })?;

        tracing::info!(user_id = %user.id, "User registered");
        Ok(user)
    }

    /// Check credentials and open a session.
    ///
    /// Unknown email and wrong password are indistinguishable. A deactivated account is
    /// only reported once the password has been verified.
    pub async fn login(
        &self,
        request: LoginRequest,
        client: ClientInfo,
    ) -> Result<(User, Session), AppError> {
        let email = normalize_email(&request.email);
        if email.is_empty() || request.password.is_empty() {
            return Err(AppError::InvalidRequest(
                "Email and password are required".to_string(),
            ));
        }

        let user = with_timeout(
            "find_user_by_email",
            self.timeout,
            self.store.find_user_by_email(&email),
        )
        .await?
        .ok_or_else(invalid_credentials)?;

        if !verify_password(request.password, user.password_hash.clone()).await? {
            tracing::warn!(user_id = %user.id, "Login failed: wrong password");
            return Err(invalid_credentials());
        }

        if !user.is_active {
            return Err(AppError::Unauthorized("Account is deactivated".to_string()));
        }

        let session = with_timeout(
            "create_session",
            self.timeout,
            self.store.create_session(NewSession {
                user_id: user.id,
                token: random_token(),
                expires_at: Utc::now() + self.session_ttl,
                user_agent: client.user_agent,
                ip_address: client.ip_address,
            }),
        )
        .await?;

        // Bookkeeping only; a failure must not fail the login
        if let Err(e) = with_timeout(
            "touch_last_login",
            self.timeout,
            self.store.touch_last_login(user.id),
        )
        .await
        {
            tracing::warn!(user_id = %user.id, error = %e, "Failed to record last login");
        }

        tracing::info!(user_id = %user.id, "User logged in");
        Ok((user, session))
    }

    /// Delete the session behind `token`, if any. Logging out twice is not an error.
    pub async fn logout(&self, token: Option<&str>) -> Result<(), AppError> {
        if let Some(token) = token {
            with_timeout(
                "delete_session",
                self.timeout,
                self.store.delete_session(token),
            )
            .await?;
        }
        Ok(())
    }

    pub async fn list_api_keys(&self, user_id: Uuid) -> Result<Vec<ApiKey>, AppError> {
        Ok(with_timeout(
            "list_api_keys",
            self.timeout,
            self.store.list_api_keys(user_id),
        )
        .await?)
    }

    /// Issue a new key. Returns the stored record and the raw key, which is never
    /// retrievable again.
    pub async fn create_api_key(
        &self,
        user_id: Uuid,
        name: Option<String>,
    ) -> Result<(ApiKey, String), AppError> {
        let name = name
            .map(|name| name.trim().to_string())
            .filter(|name| !name.is_empty())
            .ok_or_else(|| AppError::InvalidRequest("API key name is required".to_string()))?;

        let (raw_key, key_hash) = generate_api_key(&self.key_prefix);

        let api_key = with_timeout(
            "create_api_key",
            self.timeout,
            self.store
                .create_api_key(user_id, &name, &key_hash, self.max_api_keys),
        )
        .await?
        .ok_or(AppError::ApiKeyLimitReached(self.max_api_keys))?;

        tracing::info!(user_id = %user_id, api_key_id = %api_key.id, "API key created");
        Ok((api_key, raw_key))
    }

    pub async fn delete_api_key(&self, user_id: Uuid, key_id: Option<Uuid>) -> Result<(), AppError> {
        let key_id =
            key_id.ok_or_else(|| AppError::InvalidRequest("API key ID is required".to_string()))?;

        let deleted = with_timeout(
            "delete_api_key",
            self.timeout,
            self.store.delete_api_key(user_id, key_id),
        )
        .await?;
        if !deleted {
            return Err(AppError::NotFound("API key not found".to_string()));
        }

        tracing::info!(user_id = %user_id, api_key_id = %key_id, "API key deleted");
        Ok(())
    }

    /// Enable or disable a key without deleting it. Returns the new state.
    pub async fn set_api_key_active(
        &self,
        user_id: Uuid,
        key_id: Option<Uuid>,
        is_active: Option<&serde_json::Value>,
    ) -> Result<bool, AppError> {
        let key_id =
            key_id.ok_or_else(|| AppError::InvalidRequest("API key ID is required".to_string()))?;
        let is_active = is_active
            .and_then(serde_json::Value::as_bool)
            .ok_or_else(|| AppError::InvalidRequest("isActive must be a boolean".to_string()))?;

        let updated = with_timeout(
            "set_api_key_active",
            self.timeout,
            self.store.set_api_key_active(user_id, key_id, is_active),
        )
        .await?;
        if !updated {
            return Err(AppError::NotFound(
                "API key not found or access denied".to_string(),
            ));
        }

        tracing::info!(user_id = %user_id, api_key_id = %key_id, is_active, "API key toggled");
        Ok(is_active)
    }
}

fn user_exists() -> AppError {
    AppError::Conflict("User already exists with this email".to_string())
}

fn invalid_credentials() -> AppError {
    AppError::Unauthorized("Invalid credentials".to_string())
}

fn non_empty(value: Option<String>) -> Option<String> {
    value
        .map(|v| v.trim().to_string())
        .filter(|v| !v.is_empty())
}

pub fn normalize_email(email: &str) -> String {
    email.trim().to_lowercase()
}

/// `local@domain.tld`: no whitespace, exactly one `@`, and a dot inside the domain.
pub fn is_valid_email(email: &str) -> bool {
    if email.chars().any(char::is_whitespace) {
        return false;
    }
    let Some((local, domain)) = email.split_once('@') else {
        return false;
    };
    if local.is_empty() || domain.contains('@') {
        return false;
    }
    domain
        .char_indices()
        .any(|(i, c)| c == '.' && i > 0 && i + 1 < domain.len())
}

/// Every password rule the candidate breaks, in a fixed order.
pub fn password_problems(password: &str) -> Vec<String> {
    let mut problems = Vec::new();
    if password.chars().count() < MIN_PASSWORD_LEN {
        problems.push(format!(
            "Password must be at least {MIN_PASSWORD_LEN} characters long"
        ));
    }
    if !password.chars().any(|c| c.is_ascii_uppercase()) {
        problems.push("Password must contain at least one uppercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_lowercase()) {
        problems.push("Password must contain at least one lowercase letter".to_string());
    }
    if !password.chars().any(|c| c.is_ascii_digit()) {
        problems.push("Password must contain at least one number".to_string());
    }
    problems
}

/// Hash a password with Argon2 off the async workers.
pub async fn hash_password(password: String) -> Result<String, AppError> {
    tokio::task::spawn_blocking(move || {
        let salt = SaltString::generate(&mut OsRng);
        Argon2::default()
            .hash_password(password.as_bytes(), &salt)
            .map(|hash| hash.to_string())
            .map_err(|e| AppError::Internal(format!("password hashing failed: {e}")))
    })
    .await
    .map_err(|e| AppError::Internal(format!("password hashing task failed: {e}")))?
}

/// `false` for a wrong password or a hash that does not parse.
pub async fn verify_password(password: String, hash: String) -> Result<bool, AppError> {
    tokio::task::spawn_blocking(move || {
        PasswordHash::new(&hash)
            .map(|parsed| {
                Argon2::default()
                    .verify_password(password.as_bytes(), &parsed)
                    .is_ok()
            })
            .unwrap_or(false)
    })
    .await
    .map_err(|e| AppError::Internal(format!("password verification task failed: {e}")))
}
