//! In-process implementation of the store traits.
//!
//! Used by the test suite and by local runs without `DATABASE_URL`. Balances live in a
//! `DashMap`, whose entry guard makes each check-and-deduct atomic for one user without
//! serializing other users.

use std::sync::atomic::{AtomicBool, AtomicU64, AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError};
use std::time::Duration as StdDuration;

use async_trait::async_trait;
use chrono::{Duration, Utc};
use dashmap::DashMap;
use uuid::Uuid;

use super::{CredentialStore, CreditStore, StoreError, UsageStore};
use crate::models::api_key::ApiKey;
use crate::models::usage::{DailyUsage, NewUsageLog, UsageLog, UsageStatus};
use crate::models::user::{NewSession, NewUser, Session, User};

#[derive(Debug, Default)]
pub struct MemoryStore {
    users: DashMap<Uuid, User>,
    emails: DashMap<String, Uuid>,
    sessions: DashMap<String, Session>,
    api_keys: DashMap<Uuid, ApiKey>,
    usage: Mutex<Vec<UsageLog>>,

    api_key_lookups: AtomicUsize,
    session_lookups: AtomicUsize,
    fail_usage_writes: AtomicBool,
    fail_credit_ops: AtomicBool,
    credit_delay_ms: AtomicU64,
}

fn lock<T>(mutex: &Mutex<T>) -> MutexGuard<'_, T> {
    mutex.lock().unwrap_or_else(PoisonError::into_inner)
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Number of API-key hash lookups served so far.
    pub fn api_key_lookups(&self) -> usize {
        self.api_key_lookups.load(Ordering::SeqCst)
    }

    pub fn session_lookups(&self) -> usize {
        self.session_lookups.load(Ordering::SeqCst)
    }

    /// Make every subsequent usage write fail, to exercise log-failure containment.
    pub fn fail_usage_writes(&self, fail: bool) {
        self.fail_usage_writes.store(fail, Ordering::SeqCst);
    }

    /// Make every subsequent balance read or update fail.
    pub fn fail_credit_ops(&self, fail: bool) {
        self.fail_credit_ops.store(fail, Ordering::SeqCst);
    }

    /// Stall balance reads and updates before they touch any balance.
    pub fn delay_credit_ops(&self, delay: StdDuration) {
        let millis = u64::try_from(delay.as_millis()).unwrap_or(u64::MAX);
        self.credit_delay_ms.store(millis, Ordering::SeqCst);
    }

    async fn credit_gate(&self) -> Result<(), StoreError> {
        let delay = self.credit_delay_ms.load(Ordering::SeqCst);
        if delay > 0 {
            tokio::time::sleep(StdDuration::from_millis(delay)).await;
        }
        if self.fail_credit_ops.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("credit operations disabled".to_string()));
        }
        Ok(())
    }

    /// Snapshot of every usage entry, oldest first.
    pub fn usage_entries(&self) -> Vec<UsageLog> {
        lock(&self.usage).clone()
    }

    pub fn set_user_active(&self, user_id: Uuid, is_active: bool) {
        if let Some(mut user) = self.users.get_mut(&user_id) {
            user.is_active = is_active;
        }
    }

    /// Move a session's expiry, e.g. into the past.
    pub fn set_session_expiry(&self, token: &str, expires_at: chrono::DateTime<Utc>) {
        if let Some(mut session) = self.sessions.get_mut(token) {
            session.expires_at = expires_at;
        }
    }
}

#[async_trait]
impl CredentialStore for MemoryStore {
    async fn find_user(&self, user_id: Uuid) -> Result<Option<User>, StoreError> {
        Ok(self.users.get(&user_id).map(|user| user.clone()))
    }

    async fn find_user_by_email(&self, email: &str) -> Result<Option<User>, StoreError> {
        let user_id = self.emails.get(email).map(|id| *id);
        Ok(user_id.and_then(|id| self.users.get(&id).map(|user| user.clone())))
    }

    async fn create_user(&self, new_user: NewUser) -> Result<User, StoreError> {
        let now = Utc::now();
        let user = User {
            id: Uuid::new_v4(),
            email: new_user.email.clone(),
            password_hash: new_user.password_hash,
            first_name: new_user.first_name,
            last_name: new_user.last_name,
            company: new_user.company,
            role: new_user.role,
            credits: new_user.credits,
            is_active: true,
            last_login_at: None,
            created_at: now,
            updated_at: now,
        };

        match self.emails.entry(new_user.email) {
            dashmap::Entry::Occupied(entry) => Err(StoreError::Conflict(format!(
                "email {} already registered",
                entry.key()
            ))),
            dashmap::Entry::Vacant(entry) => {
                self.users.insert(user.id, user.clone());
                entry.insert(user.id);
                Ok(user)
            }
        }
    }

    async fn touch_last_login(&self, user_id: Uuid) -> Result<(), StoreError> {
        if let Some(mut user) = self.users.get_mut(&user_id) {
            user.last_login_at = Some(Utc::now());
            user.updated_at = Utc::now();
        }
        Ok(())
    }

    async fn create_session(&self, new_session: NewSession) -> Result<Session, StoreError> {
        let session = Session {
            id: Uuid::new_v4(),
            user_id: new_session.user_id,
            token: new_session.token,
            expires_at: new_session.expires_at,
            user_agent: new_session.user_agent,
            ip_address: new_session.ip_address,
            created_at: Utc::now(),
        };

        match self.sessions.entry(session.token.clone()) {
            dashmap::Entry::Occupied(_) => {
                Err(StoreError::Conflict("session token collision".to_string()))
            }
            dashmap::Entry::Vacant(entry) => {
                entry.insert(session.clone());
                Ok(session)
            }
        }
    }

    async fn find_session_user(&self, token: &str) -> Result<Option<(Session, User)>, StoreError> {
        self.session_lookups.fetch_add(1, Ordering::SeqCst);

        let session = match self.sessions.get(token) {
            Some(session) if session.expires_at > Utc::now() => session.clone(),
            _ => return Ok(None),
        };

        let user = self
            .users
            .get(&session.user_id)
            .filter(|user| user.is_active)
            .map(|user| user.clone());

        Ok(user.map(|user| (session, user)))
    }

    async fn delete_session(&self, token: &str) -> Result<(), StoreError> {
        self.sessions.remove(token);
        Ok(())
    }

    async fn purge_expired_sessions(&self) -> Result<u64, StoreError> {
        let now = Utc::now();
        let before = self.sessions.len();
        self.sessions.retain(|_, session| session.expires_at > now);
        Ok((before - self.sessions.len()) as u64)
    }

    async fn find_active_api_key(
        &self,
        key_hash: &str,
    ) -> Result<Option<(ApiKey, User)>, StoreError> {
        self.api_key_lookups.fetch_add(1, Ordering::SeqCst);

        // Clone out before touching `users` so no two map guards are held at once
        let key = self
            .api_keys
            .iter()
            .find(|key| key.key_hash == key_hash && key.is_active)
            .map(|key| key.clone());

        let Some(key) = key else {
            return Ok(None);
        };

        let user = self
            .users
            .get(&key.user_id)
            .filter(|user| user.is_active)
            .map(|user| user.clone());

        Ok(user.map(|user| (key, user)))
    }

    async fn touch_api_key(&self, key_id: Uuid) -> Result<(), StoreError> {
        if let Some(mut key) = self.api_keys.get_mut(&key_id) {
            key.last_used = Some(Utc::now());
        }
        Ok(())
    }

    async fn list_api_keys(&self, user_id: Uuid) -> Result<Vec<ApiKey>, StoreError> {
        let mut keys: Vec<ApiKey> = self
            .api_keys
            .iter()
            .filter(|key| key.user_id == user_id)
            .map(|key| key.clone())
            .collect();
        keys.sort_by(|a, b| b.created_at.cmp(&a.created_at));
        Ok(keys)
    }

    async fn create_api_key(
        &self,
        user_id: Uuid,
        name: &str,
        key_hash: &str,
        max_keys: usize,
    ) -> Result<Option<ApiKey>, StoreError> {
        // Holding the owner's entry serializes concurrent creations for that user
        let Some(_owner) = self.users.get_mut(&user_id) else {
            return Err(StoreError::Conflict(format!("unknown user {user_id}")));
        };

        let existing = self
            .api_keys
            .iter()
            .filter(|key| key.user_id == user_id)
            .count();
        if existing >= max_keys {
            return Ok(None);
        }

        let key = ApiKey {
            id: Uuid::new_v4(),
            user_id,
            key_hash: key_hash.to_string(),
            name: name.to_string(),
            is_active: true,
            last_used: None,
            created_at: Utc::now(),
        };
        self.api_keys.insert(key.id, key.clone());

        Ok(Some(key))
    }

    async fn delete_api_key(&self, user_id: Uuid, key_id: Uuid) -> Result<bool, StoreError> {
        Ok(self
            .api_keys
            .remove_if(&key_id, |_, key| key.user_id == user_id)
            .is_some())
    }

    async fn set_api_key_active(
        &self,
        user_id: Uuid,
        key_id: Uuid,
        is_active: bool,
    ) -> Result<bool, StoreError> {
        match self.api_keys.get_mut(&key_id) {
            Some(mut key) if key.user_id == user_id => {
                key.is_active = is_active;
                Ok(true)
            }
            _ => Ok(false),
        }
    }

    async fn ping(&self) -> Result<(), StoreError> {
        Ok(())
    }
}

#[async_trait]
impl CreditStore for MemoryStore {
    async fn try_deduct(&self, user_id: Uuid, amount: i64) -> Result<Option<i64>, StoreError> {
        self.credit_gate().await?;

        let Some(mut user) = self.users.get_mut(&user_id) else {
            return Ok(None);
        };

        if user.credits < amount {
            return Ok(None);
        }
        user.credits -= amount;
        user.updated_at = Utc::now();

        Ok(Some(user.credits))
    }

    async fn add(&self, user_id: Uuid, amount: i64) -> Result<Option<i64>, StoreError> {
        self.credit_gate().await?;

        let Some(mut user) = self.users.get_mut(&user_id) else {
            return Ok(None);
        };

        user.credits = user
            .credits
            .checked_add(amount)
            .ok_or(StoreError::Overflow(user_id))?;
        user.updated_at = Utc::now();

        Ok(Some(user.credits))
    }

    async fn balance(&self, user_id: Uuid) -> Result<Option<i64>, StoreError> {
        self.credit_gate().await?;

        Ok(self.users.get(&user_id).map(|user| user.credits))
    }
}

#[async_trait]
impl UsageStore for MemoryStore {
    async fn insert_usage(&self, entry: NewUsageLog) -> Result<(), StoreError> {
        if self.fail_usage_writes.load(Ordering::SeqCst) {
            return Err(StoreError::Unavailable("usage log writes disabled".to_string()));
        }

        let log = UsageLog {
            id: Uuid::new_v4(),
            user_id: entry.user_id,
            api_key_id: entry.api_key_id,
            endpoint: entry.endpoint,
            credits_used: entry.credits_used,
            request_data: entry.request_data,
            response_data: entry.response_data,
            processing_time_ms: entry.processing_time_ms,
            status: entry.status.as_str().to_string(),
            error_message: entry.error_message,
            created_at: Utc::now(),
        };
        lock(&self.usage).push(log);

        Ok(())
    }

    async fn list_usage(&self, user_id: Uuid, limit: i64) -> Result<Vec<UsageLog>, StoreError> {
        let usage = lock(&self.usage);
        Ok(usage
            .iter()
            .rev()
            .filter(|log| log.user_id == user_id)
            .take(limit.max(0) as usize)
            .cloned()
            .collect())
    }

    async fn daily_usage(&self, user_id: Uuid, days: i64) -> Result<Vec<DailyUsage>, StoreError> {
        let since = Utc::now() - Duration::days(days);
        let usage = lock(&self.usage);

        let mut by_day: std::collections::BTreeMap<chrono::NaiveDate, (i64, i64, i64)> =
            std::collections::BTreeMap::new();
        for log in usage
            .iter()
            .filter(|log| log.user_id == user_id && log.created_at >= since)
        {
            let day = by_day.entry(log.created_at.date_naive()).or_default();
            day.0 += 1;
            day.1 += log.credits_used;
            if log.status == UsageStatus::Success.as_str() {
                day.2 += 1;
            }
        }

        Ok(by_day
            .into_iter()
            .map(|(date, (requests, credits_used, successes))| DailyUsage {
                date,
                requests,
                credits_used,
                success_rate: successes as f64 / requests as f64 * 100.0,
            })
            .collect())
    }
}
