//! Account types for the credit ledger.
//!
//! An account is the single owner of a user's aggregate balances. All balance
//! arithmetic lives here so that every writer applies the same rules; each
//! method either applies its change completely or leaves the account untouched.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::error::{LedgerError, Result};
use crate::ids::{AccountId, UserId};

/// A credit account for a user.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Account {
    /// The account ID, referenced by the account's ledger entries.
    pub id: AccountId,

    /// The owning user. Unique across accounts.
    pub user_id: UserId,

    /// Credits usable right now. Never includes locked credits.
    pub available_total: i64,

    /// Credits reserved by `Locked` entries.
    pub locked_total: i64,

    /// Optimistic concurrency token, bumped by the store on every write.
    pub version: i64,

    /// When the account was created.
    pub created_at: DateTime<Utc>,

    /// When the account was last updated.
    pub updated_at: DateTime<Utc>,
}

impl Account {
    /// Create a new, not yet persisted account with zero balance.
    #[must_use]
    pub fn new(user_id: UserId) -> Self {
        let now = Utc::now();
        Self {
            id: AccountId::generate(),
            user_id,
            available_total: 0,
            locked_total: 0,
            version: 0,
            created_at: now,
            updated_at: now,
        }
    }

    /// Sum of available and locked credits.
    #[must_use]
    pub const fn total(&self) -> i64 {
        self.available_total.saturating_add(self.locked_total)
    }

    /// Check if the account can cover a reservation of `amount`.
    #[must_use]
    pub const fn has_sufficient_credits(&self, amount: i64) -> bool {
        self.available_total >= amount
    }

    /// Check that neither bucket is negative.
    #[must_use]
    pub const fn is_consistent(&self) -> bool {
        self.available_total >= 0 && self.locked_total >= 0
    }

    /// Add granted credits to the available balance.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidAmount` if `amount` is not positive or the
    /// balance would overflow.
    pub fn grant(&mut self, amount: i64) -> Result<()> {
        ensure_positive(amount)?;
        self.available_total = self
            .available_total
            .checked_add(amount)
            .ok_or_else(|| LedgerError::InvalidAmount("available total overflow".into()))?;
        Ok(())
    }

    /// Move `amount` from available to locked.
    ///
    /// # Errors
    ///
    /// - `LedgerError::InsufficientCredit` if fewer than `amount` credits are available.
    /// - `LedgerError::InvalidAmount` if `amount` is not positive or the locked total would overflow.
    pub fn reserve(&mut self, amount: i64) -> Result<()> {
        ensure_positive(amount)?;
        if !self.has_sufficient_credits(amount) {
            return Err(LedgerError::InsufficientCredit {
                available: self.available_total,
                required: amount,
            });
        }
        let locked = self
            .locked_total
            .checked_add(amount)
            .ok_or_else(|| LedgerError::InvalidAmount("locked total overflow".into()))?;
        self.available_total -= amount;
        self.locked_total = locked;
        Ok(())
    }

    /// Drop a confirmed reservation of `amount` from the locked total.
    ///
    /// Availability is not consulted: the credits left `available_total` when
    /// the reservation was made.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidAmount` if `amount` is not positive or more
    /// than is currently locked.
    pub fn settle(&mut self, amount: i64) -> Result<()> {
        ensure_positive(amount)?;
        if self.locked_total < amount {
            return Err(LedgerError::InvalidAmount(format!(
                "cannot settle {amount}: only {} locked",
                self.locked_total
            )));
        }
        self.locked_total -= amount;
        Ok(())
    }

    /// Return a cancelled reservation of `amount` to the available balance.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::InvalidAmount` if `amount` is not positive, more
    /// than is currently locked, or the available total would overflow.
    pub fn release(&mut self, amount: i64) -> Result<()> {
        ensure_positive(amount)?;
        if self.locked_total < amount {
            return Err(LedgerError::InvalidAmount(format!(
                "cannot release {amount}: only {} locked",
                self.locked_total
            )));
        }
        let available = self
            .available_total
            .checked_add(amount)
            .ok_or_else(|| LedgerError::InvalidAmount("available total overflow".into()))?;
        self.locked_total -= amount;
        self.available_total = available;
        Ok(())
    }
}

fn ensure_positive(amount: i64) -> Result<()> {
    if amount <= 0 {
        return Err(LedgerError::InvalidAmount(format!(
            "amount must be positive, got {amount}"
        )));
    }
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    fn account_with(available: i64, locked: i64) -> Account {
        let mut account = Account::new(UserId::generate());
        account.available_total = available;
        account.locked_total = locked;
        account
    }

    #[test]
    fn new_account_is_empty() {
        let account = Account::new(UserId::generate());
        assert_eq!(account.available_total, 0);
        assert_eq!(account.locked_total, 0);
        assert_eq!(account.version, 0);
        assert!(account.is_consistent());
    }

    #[test]
    fn reserve_then_settle() {
        let mut account = account_with(100, 0);
        account.reserve(30).unwrap();
        assert_eq!((account.available_total, account.locked_total), (70, 30));

        account.settle(30).unwrap();
        assert_eq!((account.available_total, account.locked_total), (70, 0));
    }

    #[test]
    fn reserve_then_release_keeps_total() {
        let mut account = account_with(70, 0);
        account.reserve(20).unwrap();
        assert_eq!(account.total(), 70);

        account.release(20).unwrap();
        assert_eq!((account.available_total, account.locked_total), (70, 0));
    }

    #[test]
    fn insufficient_reserve_leaves_account_untouched() {
        let mut account = account_with(10, 0);
        let before = account.clone();

        let err = account.reserve(11).unwrap_err();
        assert!(matches!(
            err,
            LedgerError::InsufficientCredit {
                available: 10,
                required: 11
            }
        ));
        assert_eq!(account, before);
    }

    #[test]
    fn reserve_exact_balance() {
        let mut account = account_with(50, 0);
        account.reserve(50).unwrap();
        assert_eq!((account.available_total, account.locked_total), (0, 50));
    }

    #[test]
    fn non_positive_amounts_are_rejected() {
        let mut account = account_with(10, 10);
        assert!(matches!(account.grant(0), Err(LedgerError::InvalidAmount(_))));
        assert!(matches!(account.reserve(-5), Err(LedgerError::InvalidAmount(_))));
        assert!(matches!(account.settle(0), Err(LedgerError::InvalidAmount(_))));
        assert!(matches!(account.release(-1), Err(LedgerError::InvalidAmount(_))));
    }

    #[test]
    fn settle_more_than_locked_fails() {
        let mut account = account_with(0, 5);
        assert!(account.settle(6).is_err());
        assert!(account.release(6).is_err());
        assert_eq!(account.locked_total, 5);
    }

    #[test]
    fn grant_overflow_is_rejected() {
        let mut account = account_with(i64::MAX, 0);
        assert!(account.grant(1).is_err());
        assert_eq!(account.available_total, i64::MAX);
    }
}
