//! Storage layer for the credit ledger.
//!
//! This crate persists accounts and their append-only ledger entries, and applies
//! every balance change together with its entry write in one atomic step.
//!
//! # Backends
//!
//! - [`RocksStore`]: `RocksDB` opened as an optimistic transaction database
//!   (feature `rocksdb-backend`, enabled by default).
//! - [`MemoryStore`]: everything behind one lock, for tests and embedding.
//!
//! # Concurrency
//!
//! Writers never hold locks across calls. Each account carries a `version`;
//! [`Store::apply_with_entry`] only commits if the stored version still equals
//! the version the caller read, and bumps it by one. Losing that race yields
//! [`StoreError::VersionConflict`] and the caller re-reads and retries.
//!
//! Idempotency keys are unique per account and checked inside the write
//! transaction, so two concurrent deliveries of the same event cannot both commit.
//!
//! # Column families
//!
//! - `accounts`: account records, keyed by `user_id`
//! - `entries`: ledger entries, keyed by `entry_id` (ULID)
//! - `entries_by_account`: history index
//! - `entries_by_status`: `(status, updated_at)` index feeding the reaper
//! - `idempotency_keys`: unique `(account_id, idempotency_key)` index
//!
//! # Example
//!
//! ```no_run
//! use credit_ledger_core::{Account, CreditRequest, Deadline, LedgerEntry, UserId};
//! # #[cfg(feature = "rocksdb-backend")]
//! # fn main() {
//! use credit_ledger_store::{RocksStore, Store};
//!
//! let store = RocksStore::open("/tmp/credit-ledger-db").unwrap();
//!
//! let user_id = UserId::generate();
//! let mut account = Account::new(user_id);
//! let request = CreditRequest::new(user_id, 100, "signup-bonus");
//! account.grant(request.amount).unwrap();
//! let entry = LedgerEntry::grant(&account, &request);
//! store
//!     .create_account_with_entry(&account, &entry, Deadline::none())
//!     .unwrap();
//!
//! let stored = store.find_account(&user_id).unwrap();
//! assert_eq!(stored.available_total, 100);
//! # }
//! # #[cfg(not(feature = "rocksdb-backend"))]
//! # fn main() {}
//! ```

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod error;
pub mod keys;
pub mod memory;
#[cfg(feature = "rocksdb-backend")]
pub mod rocks;
pub mod schema;

pub use error::{Result, StoreError};
pub use memory::MemoryStore;
#[cfg(feature = "rocksdb-backend")]
pub use rocks::RocksStore;

use chrono::{DateTime, Utc};
use credit_ledger_core::{Account, AccountId, Deadline, EntryId, EntryStatus, LedgerEntry, UserId};

/// The entry-side half of an atomic account update.
#[derive(Debug, Clone, Copy)]
pub enum EntryChange<'a> {
    /// Append a new entry. Fails with `DuplicateKey` if its idempotency key is taken.
    Insert(&'a LedgerEntry),

    /// Move an existing entry from `from` to `to`. Fails with `StatusMismatch`
    /// if the entry is no longer in `from`.
    Transition {
        /// The entry to update.
        id: EntryId,
        /// The status the caller observed.
        from: EntryStatus,
        /// The new status.
        to: EntryStatus,
    },
}

/// The storage trait defining all ledger database operations.
///
/// This trait abstracts the storage layer, allowing for different implementations
/// (`RocksDB`, in-memory for testing).
pub trait Store: Send + Sync {
    // =========================================================================
    // Account Operations
    // =========================================================================

    /// Get an account by user ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the user has no account.
    fn find_account(&self, user_id: &UserId) -> Result<Account>;

    /// Create a user's first account together with its first entry.
    ///
    /// The account is stored with `version = account.version + 1`.
    ///
    /// # Errors
    ///
    /// - `StoreError::AccountExists` if the user already has an account.
    /// - `StoreError::DuplicateKey` if the entry's idempotency key is taken.
    /// - `StoreError::VersionConflict` if a concurrent writer won the commit.
    /// - `StoreError::DeadlineExceeded` if the deadline elapsed before commit.
    fn create_account_with_entry(
        &self,
        account: &Account,
        entry: &LedgerEntry,
        deadline: Deadline,
    ) -> Result<EntryId>;

    /// Write `account` and apply `change` atomically, conditioned on the stored
    /// version still being `account.version`.
    ///
    /// On success the stored version is `account.version + 1`.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the account or the transitioned entry does not exist.
    /// - `StoreError::VersionConflict` if the version moved or the commit lost a race.
    /// - `StoreError::DuplicateKey` / `StoreError::StatusMismatch` per [`EntryChange`].
    /// - `StoreError::DeadlineExceeded` if the deadline elapsed before commit.
    fn apply_with_entry(
        &self,
        account: &Account,
        change: EntryChange<'_>,
        deadline: Deadline,
    ) -> Result<()>;

    // =========================================================================
    // Entry Operations
    // =========================================================================

    /// Get an entry by ID.
    ///
    /// # Errors
    ///
    /// Returns `StoreError::NotFound` if the entry does not exist.
    fn find_entry(&self, entry_id: &EntryId) -> Result<LedgerEntry>;

    /// Look up the entry that claimed an idempotency key on an account.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn find_entry_id_by_key(
        &self,
        account_id: &AccountId,
        idempotency_key: &str,
    ) -> Result<Option<EntryId>>;

    /// Change an entry's status without touching its account.
    ///
    /// Setting the status it already has is a no-op.
    ///
    /// # Errors
    ///
    /// - `StoreError::NotFound` if the entry does not exist.
    /// - `StoreError::InvalidTransition` if the state machine forbids the change.
    /// - `StoreError::DeadlineExceeded` if the deadline elapsed before commit.
    fn update_entry_status(
        &self,
        entry_id: &EntryId,
        status: EntryStatus,
        deadline: Deadline,
    ) -> Result<()>;

    /// List `Locked` entries last updated before `cutoff`, oldest first.
    ///
    /// Returns the requested page and the total number of matching entries.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_locked_entries_older_than(
        &self,
        cutoff: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<LedgerEntry>, usize)>;

    /// List entries of an account, newest first.
    ///
    /// # Errors
    ///
    /// Returns an error if the database operation fails.
    fn list_entries_by_account(
        &self,
        account_id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>>;
}
