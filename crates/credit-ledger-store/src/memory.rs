//! In-memory storage implementation.
//!
//! All state lives behind one `RwLock`. Every write validates under the write
//! lock before mutating anything, so a failed call leaves no trace. Callers
//! still go through the version check: a reader that released the lock may
//! find the account moved on when it comes back to write.

use std::collections::{BTreeSet, HashMap};
use std::sync::{RwLock, RwLockReadGuard, RwLockWriteGuard};

use chrono::{DateTime, Utc};

use credit_ledger_core::{Account, AccountId, Deadline, EntryId, EntryStatus, LedgerEntry, UserId};

use crate::error::{Result, StoreError};
use crate::{EntryChange, Store};

/// In-memory store for tests, local demos, and embedding.
#[derive(Default)]
pub struct MemoryStore {
    inner: RwLock<MemoryState>,
}

#[derive(Default)]
struct MemoryState {
    accounts: HashMap<UserId, Account>,
    entries: HashMap<EntryId, LedgerEntry>,
    by_account: HashMap<AccountId, Vec<EntryId>>,
    by_status: BTreeSet<(u8, DateTime<Utc>, EntryId)>,
    idempotency: HashMap<(AccountId, String), EntryId>,
}

impl MemoryStore {
    /// Create an empty store.
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    fn read(&self) -> Result<RwLockReadGuard<'_, MemoryState>> {
        self.inner
            .read()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }

    fn write(&self) -> Result<RwLockWriteGuard<'_, MemoryState>> {
        self.inner
            .write()
            .map_err(|_| StoreError::Database("memory store lock poisoned".into()))
    }
}

impl MemoryState {
    fn check_key_free(&self, entry: &LedgerEntry) -> Result<()> {
        let key = (entry.account_id, entry.idempotency_key.clone());
        match self.idempotency.get(&key) {
            Some(existing) => Err(StoreError::DuplicateKey {
                existing: *existing,
            }),
            None => Ok(()),
        }
    }

    /// Validate a transition. `Ok(false)` means the entry already has `to`.
    fn check_transition(
        &self,
        entry_id: &EntryId,
        expected: Option<EntryStatus>,
        to: EntryStatus,
    ) -> Result<bool> {
        let entry = self
            .entries
            .get(entry_id)
            .ok_or_else(|| StoreError::entry_not_found(entry_id))?;
        if let Some(from) = expected {
            if entry.status != from {
                return Err(StoreError::StatusMismatch {
                    actual: entry.status,
                });
            }
        }
        if entry.status == to {
            return Ok(false);
        }
        if !entry.status.can_transition_to(to) {
            return Err(StoreError::InvalidTransition {
                from: entry.status,
                to,
            });
        }
        Ok(true)
    }

    fn insert_entry(&mut self, entry: &LedgerEntry) {
        self.idempotency.insert(
            (entry.account_id, entry.idempotency_key.clone()),
            entry.id,
        );
        self.by_account
            .entry(entry.account_id)
            .or_default()
            .push(entry.id);
        self.by_status
            .insert((entry.status.as_byte(), entry.updated_at, entry.id));
        self.entries.insert(entry.id, entry.clone());
    }

    fn transition_entry(&mut self, entry_id: &EntryId, to: EntryStatus) {
        if let Some(entry) = self.entries.get_mut(entry_id) {
            self.by_status
                .remove(&(entry.status.as_byte(), entry.updated_at, entry.id));
            entry.status = to;
            entry.updated_at = Utc::now();
            self.by_status
                .insert((entry.status.as_byte(), entry.updated_at, entry.id));
        }
    }

    fn put_account(&mut self, account: &Account) {
        let mut next = account.clone();
        next.version += 1;
        next.updated_at = Utc::now();
        self.accounts.insert(next.user_id, next);
    }
}

impl Store for MemoryStore {
    fn find_account(&self, user_id: &UserId) -> Result<Account> {
        self.read()?
            .accounts
            .get(user_id)
            .cloned()
            .ok_or_else(|| StoreError::account_not_found(user_id))
    }

    fn create_account_with_entry(
        &self,
        account: &Account,
        entry: &LedgerEntry,
        deadline: Deadline,
    ) -> Result<EntryId> {
        let mut state = self.write()?;
        if state.accounts.contains_key(&account.user_id) {
            return Err(StoreError::AccountExists {
                user_id: account.user_id,
            });
        }
        state.check_key_free(entry)?;
        if deadline.is_expired() {
            return Err(StoreError::DeadlineExceeded);
        }

        state.insert_entry(entry);
        state.put_account(account);
        Ok(entry.id)
    }

    fn apply_with_entry(
        &self,
        account: &Account,
        change: EntryChange<'_>,
        deadline: Deadline,
    ) -> Result<()> {
        let mut state = self.write()?;
        let stored = state
            .accounts
            .get(&account.user_id)
            .ok_or_else(|| StoreError::account_not_found(&account.user_id))?;
        if stored.version != account.version {
            return Err(StoreError::VersionConflict);
        }

        match change {
            EntryChange::Insert(entry) => {
                state.check_key_free(entry)?;
                if deadline.is_expired() {
                    return Err(StoreError::DeadlineExceeded);
                }
                state.insert_entry(entry);
            }
            EntryChange::Transition { id, from, to } => {
                let changed = state.check_transition(&id, Some(from), to)?;
                if deadline.is_expired() {
                    return Err(StoreError::DeadlineExceeded);
                }
                if changed {
                    state.transition_entry(&id, to);
                }
            }
        }
        state.put_account(account);
        Ok(())
    }

    fn find_entry(&self, entry_id: &EntryId) -> Result<LedgerEntry> {
        self.read()?
            .entries
            .get(entry_id)
            .cloned()
            .ok_or_else(|| StoreError::entry_not_found(entry_id))
    }

    fn find_entry_id_by_key(
        &self,
        account_id: &AccountId,
        idempotency_key: &str,
    ) -> Result<Option<EntryId>> {
        Ok(self
            .read()?
            .idempotency
            .get(&(*account_id, idempotency_key.to_owned()))
            .copied())
    }

    fn update_entry_status(
        &self,
        entry_id: &EntryId,
        status: EntryStatus,
        deadline: Deadline,
    ) -> Result<()> {
        let mut state = self.write()?;
        if state.check_transition(entry_id, None, status)? {
            if deadline.is_expired() {
                return Err(StoreError::DeadlineExceeded);
            }
            state.transition_entry(entry_id, status);
        }
        Ok(())
    }

    fn list_locked_entries_older_than(
        &self,
        cutoff: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<LedgerEntry>, usize)> {
        let state = self.read()?;
        let locked = EntryStatus::Locked.as_byte();

        let matching: Vec<EntryId> = state
            .by_status
            .iter()
            .skip_while(|(status, _, _)| *status < locked)
            .take_while(|(status, updated_at, _)| *status == locked && *updated_at < cutoff)
            .map(|(_, _, id)| *id)
            .collect();

        let page = matching
            .iter()
            .skip(offset)
            .take(limit)
            .filter_map(|id| state.entries.get(id).cloned())
            .collect();

        Ok((page, matching.len()))
    }

    fn list_entries_by_account(
        &self,
        account_id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let state = self.read()?;
        let Some(ids) = state.by_account.get(account_id) else {
            return Ok(Vec::new());
        };

        Ok(ids
            .iter()
            .rev()
            .skip(offset)
            .take(limit)
            .filter_map(|id| state.entries.get(id).cloned())
            .collect())
    }
}
