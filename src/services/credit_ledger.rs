//! Credit ledger - atomic balance operations.
//!
//! # Atomicity Guarantees
//!
//! `reserve` is a single conditional decrement in the store (`... WHERE credits >= amount`),
//! never a read followed by a write. Under any number of concurrent reservations for one
//! user, exactly as many succeed as the balance covers and the rest leave it untouched.
//!
//! A store call that times out is reported as an error, which callers treat as "not
//! reserved". The conditional update either committed in full or not at all.

use std::sync::Arc;
use std::time::Duration;

use uuid::Uuid;

use crate::store::{CreditStore, StoreError, with_timeout};

#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    #[error("amount must be a positive integer, got {0}")]
    InvalidAmount(i64),

    #[error("user {0} not found")]
    UnknownUser(Uuid),

    #[error(transparent)]
    Store(#[from] StoreError),
}

/// Outcome of a reservation attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Reservation {
    Reserved { remaining: i64 },

    /// Nothing was deducted. `available` is the balance read right after the attempt.
    Insufficient { available: i64 },
}

#[derive(Clone)]
pub struct CreditLedger {
    store: Arc<dyn CreditStore>,
    timeout: Duration,
}

impl CreditLedger {
    pub fn new(store: Arc<dyn CreditStore>, timeout: Duration) -> Self {
        Self { store, timeout }
    }

    /// Atomically deduct `amount` if the balance covers it.
    ///
    /// # Errors
    ///
    /// - `InvalidAmount`: `amount` is zero or negative
    /// - `UnknownUser`: no such user
    /// - `Store`: the store failed or timed out; nothing is reserved
    pub async fn reserve(&self, user_id: Uuid, amount: i64) -> Result<Reservation, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        let deducted = with_timeout(
            "try_deduct",
            self.timeout,
            self.store.try_deduct(user_id, amount),
        )
        .await?;

        match deducted {
            Some(remaining) => Ok(Reservation::Reserved { remaining }),
            None => {
                let available = self.balance(user_id).await?;
                Ok(Reservation::Insufficient { available })
            }
        }
    }

    /// Unconditionally add credits (grants, rewards, refunds). Returns the new balance.
    pub async fn add(&self, user_id: Uuid, amount: i64) -> Result<i64, LedgerError> {
        if amount <= 0 {
            return Err(LedgerError::InvalidAmount(amount));
        }

        with_timeout("add_credits", self.timeout, self.store.add(user_id, amount))
            .await?
            .ok_or(LedgerError::UnknownUser(user_id))
    }

    pub async fn balance(&self, user_id: Uuid) -> Result<i64, LedgerError> {
        with_timeout("balance", self.timeout, self.store.balance(user_id))
            .await?
            .ok_or(LedgerError::UnknownUser(user_id))
    }
}
