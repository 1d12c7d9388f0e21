//! Common test utilities for ledger integration tests.

#![allow(dead_code)] // Some utilities are used by different test files

use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};

use tempfile::TempDir;

use credit_ledger_core::{
    Account, AccountId, CreditRequest, Deadline, EntryId, EntryStatus, LedgerEntry, UserId,
};
use credit_ledger_service::{CreditLedger, LedgerConfig};
#[cfg(feature = "rocksdb-backend")]
use credit_ledger_store::RocksStore;
use credit_ledger_store::{EntryChange, MemoryStore, Store};

/// A ledger over a fresh store, plus whatever keeps the store alive.
pub struct TestHarness<S> {
    /// The ledger under test.
    pub ledger: Arc<CreditLedger<S>>,
    /// A user with no account yet.
    pub user_id: UserId,
    /// Temporary directory for the database (kept alive for test duration).
    pub _temp_dir: Option<TempDir>,
}

impl TestHarness<MemoryStore> {
    /// Create a harness over an in-memory store.
    pub fn memory() -> Self {
        Self::memory_with(&test_config())
    }

    /// Create a harness over an in-memory store with a custom config.
    pub fn memory_with(config: &LedgerConfig) -> Self {
        Self {
            ledger: Arc::new(CreditLedger::new(Arc::new(MemoryStore::new()), config)),
            user_id: UserId::generate(),
            _temp_dir: None,
        }
    }
}

#[cfg(feature = "rocksdb-backend")]
impl TestHarness<RocksStore> {
    /// Create a harness over a fresh `RocksDB` database.
    pub fn rocks() -> Self {
        Self::rocks_with(&test_config())
    }

    /// Create a harness over a fresh `RocksDB` database with a custom config.
    pub fn rocks_with(config: &LedgerConfig) -> Self {
        let temp_dir = TempDir::new().expect("Failed to create temp directory");
        let store = RocksStore::open(temp_dir.path()).expect("Failed to open store");
        Self {
            ledger: Arc::new(CreditLedger::new(Arc::new(store), config)),
            user_id: UserId::generate(),
            _temp_dir: Some(temp_dir),
        }
    }
}

impl<S: Store> TestHarness<S> {
    /// Grant `amount` to the harness user.
    pub fn grant(&self, amount: i64, key: &str) -> EntryId {
        self.ledger
            .add_credits(&CreditRequest::new(self.user_id, amount, key), Deadline::none())
            .expect("grant failed")
    }

    /// Reserve `amount` for the harness user.
    pub fn reserve(&self, amount: i64, key: &str) -> EntryId {
        self.ledger
            .try_deduct_credits(&CreditRequest::new(self.user_id, amount, key), Deadline::none())
            .expect("reservation failed")
    }

    /// Current `(available, locked)` of the harness user.
    pub fn balance(&self) -> (i64, i64) {
        let account = self
            .ledger
            .get_account(&self.user_id)
            .expect("account missing")
            .account;
        (account.available_total, account.locked_total)
    }
}

type Hook = Box<dyn FnOnce() + Send>;

/// A store that runs a one-shot hook inside the next `find_account`, after the
/// account was read. Lets a test commit a rival write between a caller's reads.
pub struct InterleavingStore<S> {
    inner: Arc<S>,
    hook: Mutex<Option<Hook>>,
}

impl<S: Store> InterleavingStore<S> {
    /// Wrap a store shared with other ledgers.
    pub fn new(inner: Arc<S>) -> Self {
        Self {
            inner,
            hook: Mutex::new(None),
        }
    }

    /// Run `hook` during the next `find_account`.
    pub fn arm(&self, hook: impl FnOnce() + Send + 'static) {
        *self.hook.lock().unwrap() = Some(Box::new(hook));
    }
}

impl<S: Store> Store for InterleavingStore<S> {
    fn find_account(&self, user_id: &UserId) -> credit_ledger_store::Result<Account> {
        let account = self.inner.find_account(user_id);
        let hook = self.hook.lock().unwrap().take();
        if let Some(hook) = hook {
            hook();
        }
        account
    }

    fn create_account_with_entry(
        &self,
        account: &Account,
        entry: &LedgerEntry,
        deadline: Deadline,
    ) -> credit_ledger_store::Result<EntryId> {
        self.inner.create_account_with_entry(account, entry, deadline)
    }

    fn apply_with_entry(
        &self,
        account: &Account,
        change: EntryChange<'_>,
        deadline: Deadline,
    ) -> credit_ledger_store::Result<()> {
        self.inner.apply_with_entry(account, change, deadline)
    }

    fn find_entry(&self, entry_id: &EntryId) -> credit_ledger_store::Result<LedgerEntry> {
        self.inner.find_entry(entry_id)
    }

    fn find_entry_id_by_key(
        &self,
        account_id: &AccountId,
        idempotency_key: &str,
    ) -> credit_ledger_store::Result<Option<EntryId>> {
        self.inner.find_entry_id_by_key(account_id, idempotency_key)
    }

    fn update_entry_status(
        &self,
        entry_id: &EntryId,
        status: EntryStatus,
        deadline: Deadline,
    ) -> credit_ledger_store::Result<()> {
        self.inner.update_entry_status(entry_id, status, deadline)
    }

    fn list_locked_entries_older_than(
        &self,
        cutoff: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> credit_ledger_store::Result<(Vec<LedgerEntry>, usize)> {
        self.inner.list_locked_entries_older_than(cutoff, offset, limit)
    }

    fn list_entries_by_account(
        &self,
        account_id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> credit_ledger_store::Result<Vec<LedgerEntry>> {
        self.inner.list_entries_by_account(account_id, limit, offset)
    }
}

impl<S: Store + 'static> TestHarness<S> {
    /// A second ledger over the harness store whose next `find_account` runs a hook.
    pub fn interleaved(&self) -> (Arc<InterleavingStore<S>>, CreditLedger<InterleavingStore<S>>) {
        let store = Arc::new(InterleavingStore::new(Arc::clone(self.ledger.store())));
        let ledger = CreditLedger::new(Arc::clone(&store), &test_config());
        (store, ledger)
    }
}

/// Config with a generous retry budget and no backoff, for contention tests.
pub fn test_config() -> LedgerConfig {
    let mut config = LedgerConfig::default().with_max_retries(64);
    config.retry_backoff_base = std::time::Duration::ZERO;
    config.retry_backoff_max = std::time::Duration::from_millis(1);
    config
}

/// Run a generic test body against both store backends.
macro_rules! on_both_backends {
    ($name:ident, $body:ident) => {
        mod $name {
            use super::*;

            #[test]
            fn memory() {
                $body(&TestHarness::memory());
            }

            #[cfg(feature = "rocksdb-backend")]
            #[test]
            fn rocks() {
                $body(&TestHarness::rocks());
            }
        }
    };
}
