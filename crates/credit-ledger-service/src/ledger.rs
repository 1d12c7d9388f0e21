//! The credit reservation protocol.
//!
//! Grants are recorded as `Active` entries. Deductions are two-phase: a
//! reservation moves credits from available to locked and records a `Locked`
//! entry; confirming it settles the locked credits, cancelling it returns them.
//! Every step is one account CAS plus one entry write in the same transaction.

use std::sync::Arc;

use credit_ledger_core::{
    Account, CreditRequest, Deadline, EntryId, EntryStatus, LedgerEntry, LedgerError, Result,
    UserId,
};
use credit_ledger_store::{EntryChange, Store, StoreError};

use crate::config::LedgerConfig;
use crate::retry::{Attempt, RetryPolicy};

/// An account together with its most recent entries.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AccountSnapshot {
    /// The account as last committed.
    pub account: Account,
    /// Most recent entries, newest first.
    pub recent_entries: Vec<LedgerEntry>,
}

/// The credit ledger service.
///
/// Methods are synchronous and safe to call from many threads at once; share
/// the service through an `Arc`.
pub struct CreditLedger<S> {
    store: Arc<S>,
    retry: RetryPolicy,
    history_limit: usize,
}

impl<S: Store> CreditLedger<S> {
    /// Create a service on top of a store.
    #[must_use]
    pub fn new(store: Arc<S>, config: &LedgerConfig) -> Self {
        Self {
            store,
            retry: RetryPolicy::from_config(config),
            history_limit: config.history_limit,
        }
    }

    /// The underlying store.
    #[must_use]
    pub fn store(&self) -> &Arc<S> {
        &self.store
    }

    /// Grant credits, creating the account on first use.
    ///
    /// A repeated idempotency key is a successful no-op that returns the entry
    /// recorded by the first delivery.
    ///
    /// # Errors
    ///
    /// - `LedgerError::InvalidAmount` if the amount is not positive.
    /// - `LedgerError::ConcurrencyConflict` if retries were exhausted.
    /// - `LedgerError::DeadlineExceeded` if the deadline elapsed.
    pub fn add_credits(&self, request: &CreditRequest, deadline: Deadline) -> Result<EntryId> {
        ensure_positive(request.amount)?;
        tracing::debug!(
            user_id = %request.user_id,
            amount = request.amount,
            key = %request.idempotency_key,
            "Adding credits"
        );

        let entry_id = self
            .retry
            .run("add_credits", deadline, || self.add_once(request, deadline))?;

        tracing::info!(
            user_id = %request.user_id,
            entry_id = %entry_id,
            amount = request.amount,
            biz = %request.biz,
            biz_id = %request.biz_id,
            "Credits added"
        );
        Ok(entry_id)
    }

    fn add_once(&self, request: &CreditRequest, deadline: Deadline) -> Result<Attempt<EntryId>> {
        let existing = match self.store.find_account(&request.user_id) {
            Ok(account) => Some(account),
            Err(StoreError::NotFound { .. }) => None,
            Err(e) => return Err(e.into()),
        };

        let Some(mut account) = existing else {
            let mut account = Account::new(request.user_id);
            account.grant(request.amount)?;
            let entry = LedgerEntry::grant(&account, request);
            return match self
                .store
                .create_account_with_entry(&account, &entry, deadline)
            {
                Ok(id) => Ok(Attempt::Done(id)),
                Err(StoreError::AccountExists { .. } | StoreError::VersionConflict) => {
                    Ok(Attempt::Conflict)
                }
                Err(StoreError::DuplicateKey { existing }) => Ok(Attempt::Done(existing)),
                Err(e) => Err(e.into()),
            };
        };

        if let Err(e) = account.grant(request.amount) {
            return self.redelivered(&account, request, e);
        }
        let entry = LedgerEntry::grant(&account, request);
        match self
            .store
            .apply_with_entry(&account, EntryChange::Insert(&entry), deadline)
        {
            Ok(()) => Ok(Attempt::Done(entry.id)),
            Err(StoreError::DuplicateKey { existing }) => {
                tracing::info!(
                    user_id = %request.user_id,
                    key = %request.idempotency_key,
                    entry_id = %existing,
                    "Duplicate grant ignored"
                );
                Ok(Attempt::Done(existing))
            }
            Err(StoreError::VersionConflict) => Ok(Attempt::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    /// Reserve credits ahead of a priced operation.
    ///
    /// Returns the reservation handle to confirm or cancel later. A repeated
    /// idempotency key returns the existing reservation without reserving again.
    ///
    /// # Errors
    ///
    /// - `LedgerError::AccountNotFound` if the user has no account.
    /// - `LedgerError::InsufficientCredit` if too few credits are available; the
    ///   account is left unchanged.
    /// - `LedgerError::InvalidAmount` if the amount is not positive.
    /// - `LedgerError::ConcurrencyConflict` if retries were exhausted.
    /// - `LedgerError::DeadlineExceeded` if the deadline elapsed.
    pub fn try_deduct_credits(
        &self,
        request: &CreditRequest,
        deadline: Deadline,
    ) -> Result<EntryId> {
        ensure_positive(request.amount)?;
        tracing::debug!(
            user_id = %request.user_id,
            amount = request.amount,
            key = %request.idempotency_key,
            "Reserving credits"
        );

        let result = self
            .retry
            .run("try_deduct_credits", deadline, || {
                self.reserve_once(request, deadline)
            });

        match &result {
            Ok(entry_id) => tracing::info!(
                user_id = %request.user_id,
                entry_id = %entry_id,
                amount = request.amount,
                biz = %request.biz,
                biz_id = %request.biz_id,
                "Credits reserved"
            ),
            Err(LedgerError::InsufficientCredit {
                available,
                required,
            }) => tracing::warn!(
                user_id = %request.user_id,
                available,
                required,
                "Reservation denied"
            ),
            Err(_) => {}
        }
        result
    }

    fn reserve_once(&self, request: &CreditRequest, deadline: Deadline) -> Result<Attempt<EntryId>> {
        let mut account = self.load_account(&request.user_id)?;
        if let Err(e) = account.reserve(request.amount) {
            return self.redelivered(&account, request, e);
        }
        let entry = LedgerEntry::reservation(&account, request);

        match self
            .store
            .apply_with_entry(&account, EntryChange::Insert(&entry), deadline)
        {
            Ok(()) => Ok(Attempt::Done(entry.id)),
            Err(StoreError::DuplicateKey { existing }) => {
                tracing::info!(
                    user_id = %request.user_id,
                    key = %request.idempotency_key,
                    entry_id = %existing,
                    "Duplicate reservation ignored"
                );
                Ok(Attempt::Done(existing))
            }
            Err(StoreError::VersionConflict) => Ok(Attempt::Conflict),
            Err(e) => Err(e.into()),
        }
    }

    /// Resolve a request the balance cannot take. A redelivery of an event
    /// that already committed is a success; anything else surfaces `err`.
    fn redelivered(
        &self,
        account: &Account,
        request: &CreditRequest,
        err: LedgerError,
    ) -> Result<Attempt<EntryId>> {
        match self
            .store
            .find_entry_id_by_key(&account.id, &request.idempotency_key)?
        {
            Some(existing) => {
                tracing::info!(
                    user_id = %request.user_id,
                    key = %request.idempotency_key,
                    entry_id = %existing,
                    "Duplicate request ignored"
                );
                Ok(Attempt::Done(existing))
            }
            None => Err(err),
        }
    }

    /// Finalize a reservation: its locked credits are spent.
    ///
    /// # Errors
    ///
    /// - `LedgerError::EntryNotFound` / `LedgerError::AccountNotFound` if either is missing.
    /// - `LedgerError::InvalidReservation` if the entry is not `Locked` or belongs
    ///   to another user.
    /// - `LedgerError::ConcurrencyConflict` if retries were exhausted.
    /// - `LedgerError::DeadlineExceeded` if the deadline elapsed.
    pub fn confirm_deduct_credits(
        &self,
        user_id: &UserId,
        entry_id: &EntryId,
        deadline: Deadline,
    ) -> Result<()> {
        tracing::debug!(user_id = %user_id, entry_id = %entry_id, "Confirming reservation");

        self.retry.run("confirm_deduct_credits", deadline, || {
            self.settle_once(user_id, entry_id, EntryStatus::Active, deadline)
        })?;

        tracing::info!(user_id = %user_id, entry_id = %entry_id, "Reservation confirmed");
        Ok(())
    }

    /// Release a reservation: its locked credits become available again.
    ///
    /// Cancelling an entry that is already `Inactive` succeeds without effect,
    /// so the reaper and the original caller may race safely.
    ///
    /// # Errors
    ///
    /// - `LedgerError::EntryNotFound` / `LedgerError::AccountNotFound` if either is missing.
    /// - `LedgerError::InvalidReservation` if the entry was confirmed or belongs
    ///   to another user.
    /// - `LedgerError::ConcurrencyConflict` if retries were exhausted.
    /// - `LedgerError::DeadlineExceeded` if the deadline elapsed.
    pub fn cancel_deduct_credits(
        &self,
        user_id: &UserId,
        entry_id: &EntryId,
        deadline: Deadline,
    ) -> Result<()> {
        tracing::debug!(user_id = %user_id, entry_id = %entry_id, "Cancelling reservation");

        let released = self.retry.run("cancel_deduct_credits", deadline, || {
            self.settle_once(user_id, entry_id, EntryStatus::Inactive, deadline)
        })?;

        if released {
            tracing::info!(user_id = %user_id, entry_id = %entry_id, "Reservation cancelled");
        } else {
            tracing::debug!(user_id = %user_id, entry_id = %entry_id, "Reservation already cancelled");
        }
        Ok(())
    }

    /// Move a `Locked` entry to `to`, adjusting the account to match.
    ///
    /// Returns `false` when a cancel found the entry already `Inactive`.
    fn settle_once(
        &self,
        user_id: &UserId,
        entry_id: &EntryId,
        to: EntryStatus,
        deadline: Deadline,
    ) -> Result<Attempt<bool>> {
        // Account before entry: a settle that commits in between bumps the
        // version, so the CAS below rejects the stale account.
        let mut account = self.load_account(user_id)?;
        let entry = match self.store.find_entry(entry_id) {
            Ok(entry) => entry,
            Err(StoreError::NotFound { .. }) => {
                return Err(LedgerError::EntryNotFound {
                    entry_id: *entry_id,
                })
            }
            Err(e) => return Err(e.into()),
        };

        if entry.account_id != account.id {
            return Err(LedgerError::invalid_reservation(
                *entry_id,
                "entry belongs to another account",
            ));
        }
        match entry.status {
            EntryStatus::Locked => {}
            EntryStatus::Inactive if to == EntryStatus::Inactive => {
                return Ok(Attempt::Done(false));
            }
            status => {
                return Err(LedgerError::invalid_reservation(
                    *entry_id,
                    format!("entry is {status}"),
                ));
            }
        }

        if to == EntryStatus::Active {
            account.settle(entry.amount())?;
        } else {
            account.release(entry.amount())?;
        }

        let change = EntryChange::Transition {
            id: *entry_id,
            from: EntryStatus::Locked,
            to,
        };
        match self.store.apply_with_entry(&account, change, deadline) {
            Ok(()) => Ok(Attempt::Done(true)),
            Err(StoreError::VersionConflict) => Ok(Attempt::Conflict),
            Err(StoreError::StatusMismatch { actual }) => {
                if actual == EntryStatus::Inactive && to == EntryStatus::Inactive {
                    Ok(Attempt::Done(false))
                } else {
                    Err(LedgerError::invalid_reservation(
                        *entry_id,
                        format!("entry is {actual}"),
                    ))
                }
            }
            Err(e) => Err(e.into()),
        }
    }

    /// Read an account with its most recent entries.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::AccountNotFound` if the user has no account.
    pub fn get_account(&self, user_id: &UserId) -> Result<AccountSnapshot> {
        let account = self.load_account(user_id)?;
        let recent_entries = self
            .store
            .list_entries_by_account(&account.id, self.history_limit, 0)?;
        Ok(AccountSnapshot {
            account,
            recent_entries,
        })
    }

    /// Read one entry of a user.
    ///
    /// # Errors
    ///
    /// Returns `LedgerError::EntryNotFound` if the entry does not exist or
    /// belongs to another user.
    pub fn get_entry(&self, user_id: &UserId, entry_id: &EntryId) -> Result<LedgerEntry> {
        match self.store.find_entry(entry_id) {
            Ok(entry) if entry.user_id == *user_id => Ok(entry),
            Ok(_) | Err(StoreError::NotFound { .. }) => Err(LedgerError::EntryNotFound {
                entry_id: *entry_id,
            }),
            Err(e) => Err(e.into()),
        }
    }

    fn load_account(&self, user_id: &UserId) -> Result<Account> {
        match self.store.find_account(user_id) {
            Ok(account) => Ok(account),
            Err(StoreError::NotFound { .. }) => Err(LedgerError::AccountNotFound {
                user_id: *user_id,
            }),
            Err(e) => Err(e.into()),
        }
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
