//! `RocksDB` storage implementation.
//!
//! This module provides the `RocksStore` implementation of the `Store` trait.
//! The database is opened as an `OptimisticTransactionDB`: every row a write
//! depends on is read with `get_for_update_cf`, and a commit that races with
//! another writer on any of those rows fails with `Busy`, surfaced as
//! `StoreError::VersionConflict`.

use std::path::Path;
use std::sync::Arc;

use chrono::{DateTime, Utc};
use rocksdb::{
    BoundColumnFamily, ColumnFamilyDescriptor, Direction, ErrorKind, IteratorMode, MultiThreaded,
    OptimisticTransactionDB, Options, Transaction,
};

use credit_ledger_core::{Account, AccountId, Deadline, EntryId, EntryStatus, LedgerEntry, UserId};

use crate::error::{Result, StoreError};
use crate::keys;
use crate::schema::{all_column_families, cf};
use crate::{EntryChange, Store};

type Db = OptimisticTransactionDB<MultiThreaded>;
type Txn<'db> = Transaction<'db, Db>;

/// RocksDB-backed storage implementation.
pub struct RocksStore {
    db: Arc<Db>,
}

impl RocksStore {
    /// Open or create a `RocksDB` database at the given path.
    ///
    /// # Errors
    ///
    /// Returns an error if the database cannot be opened or created.
    pub fn open<P: AsRef<Path>>(path: P) -> Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.create_missing_column_families(true);

        let cf_descriptors: Vec<_> = all_column_families()
            .into_iter()
            .map(|name| ColumnFamilyDescriptor::new(name, Options::default()))
            .collect();

        let db = Db::open_cf_descriptors(&opts, path, cf_descriptors).map_err(db_err)?;

        Ok(Self { db: Arc::new(db) })
    }

    /// Get a column family handle.
    fn cf(&self, name: &str) -> Result<Arc<BoundColumnFamily<'_>>> {
        self.db
            .cf_handle(name)
            .ok_or_else(|| StoreError::Database(format!("column family not found: {name}")))
    }

    /// Serialize a value using CBOR.
    fn serialize<T: serde::Serialize>(value: &T) -> Result<Vec<u8>> {
        let mut buf = Vec::new();
        ciborium::into_writer(value, &mut buf)
            .map_err(|e| StoreError::Serialization(e.to_string()))?;
        Ok(buf)
    }

    /// Deserialize a value from CBOR.
    fn deserialize<T: serde::de::DeserializeOwned>(data: &[u8]) -> Result<T> {
        ciborium::from_reader(data).map_err(|e| StoreError::Serialization(e.to_string()))
    }

    /// Commit unless the deadline already passed, in which case roll back.
    fn commit(txn: Txn<'_>, deadline: Deadline) -> Result<()> {
        if deadline.is_expired() {
            txn.rollback().map_err(db_err)?;
            return Err(StoreError::DeadlineExceeded);
        }
        txn.commit().map_err(|e| match e.kind() {
            ErrorKind::Busy | ErrorKind::TryAgain => StoreError::VersionConflict,
            _ => db_err(e),
        })
    }

    /// Stage a new entry with its indexes, claiming its idempotency key.
    fn stage_insert(&self, txn: &Txn<'_>, entry: &LedgerEntry) -> Result<()> {
        let cf_entries = self.cf(cf::ENTRIES)?;
        let cf_by_account = self.cf(cf::ENTRIES_BY_ACCOUNT)?;
        let cf_by_status = self.cf(cf::ENTRIES_BY_STATUS)?;
        let cf_keys = self.cf(cf::IDEMPOTENCY_KEYS)?;

        let idem_key = keys::idempotency_key(&entry.account_id, &entry.idempotency_key);
        if let Some(existing) = txn
            .get_for_update_cf(&cf_keys, &idem_key, true)
            .map_err(db_err)?
        {
            return Err(StoreError::DuplicateKey {
                existing: decode_key_owner(&existing)?,
            });
        }

        let value = Self::serialize(entry)?;
        txn.put_cf(&cf_entries, keys::entry_key(&entry.id), value)
            .map_err(db_err)?;
        txn.put_cf(
            &cf_by_account,
            keys::account_entry_key(&entry.account_id, &entry.id),
            [],
        )
        .map_err(db_err)?;
        txn.put_cf(
            &cf_by_status,
            keys::status_key(entry.status, &entry.updated_at, &entry.id),
            [],
        )
        .map_err(db_err)?;
        txn.put_cf(&cf_keys, idem_key, entry.id.to_bytes())
            .map_err(db_err)?;

        Ok(())
    }

    /// Stage a status change of an entry, moving its status index key.
    ///
    /// `expected` is checked against the stored status when given. Moving to the
    /// status the entry already has is reported as `Ok(false)`.
    fn stage_transition(
        &self,
        txn: &Txn<'_>,
        entry_id: &EntryId,
        expected: Option<EntryStatus>,
        to: EntryStatus,
    ) -> Result<bool> {
        let cf_entries = self.cf(cf::ENTRIES)?;
        let cf_by_status = self.cf(cf::ENTRIES_BY_STATUS)?;

        let entry_key = keys::entry_key(entry_id);
        let data = txn
            .get_for_update_cf(&cf_entries, &entry_key, true)
            .map_err(db_err)?
            .ok_or_else(|| StoreError::entry_not_found(entry_id))?;
        let mut entry: LedgerEntry = Self::deserialize(&data)?;

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

        txn.delete_cf(
            &cf_by_status,
            keys::status_key(entry.status, &entry.updated_at, &entry.id),
        )
        .map_err(db_err)?;

        entry.status = to;
        entry.updated_at = Utc::now();

        txn.put_cf(&cf_entries, &entry_key, Self::serialize(&entry)?)
            .map_err(db_err)?;
        txn.put_cf(
            &cf_by_status,
            keys::status_key(entry.status, &entry.updated_at, &entry.id),
            [],
        )
        .map_err(db_err)?;

        Ok(true)
    }

    /// Stage the account write with its bumped version.
    fn stage_account(&self, txn: &Txn<'_>, account: &Account) -> Result<()> {
        let cf_accounts = self.cf(cf::ACCOUNTS)?;
        let mut next = account.clone();
        next.version += 1;
        next.updated_at = Utc::now();
        txn.put_cf(
            &cf_accounts,
            keys::account_key(&account.user_id),
            Self::serialize(&next)?,
        )
        .map_err(db_err)
    }
}

impl Store for RocksStore {
    // =========================================================================
    // Account Operations
    // =========================================================================

    fn find_account(&self, user_id: &UserId) -> Result<Account> {
        let cf = self.cf(cf::ACCOUNTS)?;
        let key = keys::account_key(user_id);

        let data = self
            .db
            .get_cf(&cf, key)
            .map_err(db_err)?
            .ok_or_else(|| StoreError::account_not_found(user_id))?;
        Self::deserialize(&data)
    }

    fn create_account_with_entry(
        &self,
        account: &Account,
        entry: &LedgerEntry,
        deadline: Deadline,
    ) -> Result<EntryId> {
        let cf_accounts = self.cf(cf::ACCOUNTS)?;
        let txn = self.db.transaction();

        let account_key = keys::account_key(&account.user_id);
        if txn
            .get_for_update_cf(&cf_accounts, &account_key, true)
            .map_err(db_err)?
            .is_some()
        {
            return Err(StoreError::AccountExists {
                user_id: account.user_id,
            });
        }

        self.stage_insert(&txn, entry)?;
        self.stage_account(&txn, account)?;
        Self::commit(txn, deadline)?;

        tracing::debug!(
            user_id = %account.user_id,
            account_id = %account.id,
            entry_id = %entry.id,
            "Account created"
        );
        Ok(entry.id)
    }

    fn apply_with_entry(
        &self,
        account: &Account,
        change: EntryChange<'_>,
        deadline: Deadline,
    ) -> Result<()> {
        let cf_accounts = self.cf(cf::ACCOUNTS)?;
        let txn = self.db.transaction();

        let account_key = keys::account_key(&account.user_id);
        let data = txn
            .get_for_update_cf(&cf_accounts, &account_key, true)
            .map_err(db_err)?
            .ok_or_else(|| StoreError::account_not_found(&account.user_id))?;
        let stored: Account = Self::deserialize(&data)?;
        if stored.version != account.version {
            tracing::debug!(
                user_id = %account.user_id,
                expected = account.version,
                actual = stored.version,
                "Account version moved"
            );
            return Err(StoreError::VersionConflict);
        }

        match change {
            EntryChange::Insert(entry) => self.stage_insert(&txn, entry)?,
            EntryChange::Transition { id, from, to } => {
                self.stage_transition(&txn, &id, Some(from), to)?;
            }
        }
        self.stage_account(&txn, account)?;
        Self::commit(txn, deadline)
    }

    // =========================================================================
    // Entry Operations
    // =========================================================================

    fn find_entry(&self, entry_id: &EntryId) -> Result<LedgerEntry> {
        let cf = self.cf(cf::ENTRIES)?;

        let data = self
            .db
            .get_cf(&cf, keys::entry_key(entry_id))
            .map_err(db_err)?
            .ok_or_else(|| StoreError::entry_not_found(entry_id))?;
        Self::deserialize(&data)
    }

    fn find_entry_id_by_key(
        &self,
        account_id: &AccountId,
        idempotency_key: &str,
    ) -> Result<Option<EntryId>> {
        let cf = self.cf(cf::IDEMPOTENCY_KEYS)?;

        self.db
            .get_cf(&cf, keys::idempotency_key(account_id, idempotency_key))
            .map_err(db_err)?
            .map(|owner| decode_key_owner(&owner))
            .transpose()
    }

    fn update_entry_status(
        &self,
        entry_id: &EntryId,
        status: EntryStatus,
        deadline: Deadline,
    ) -> Result<()> {
        let txn = self.db.transaction();
        if self.stage_transition(&txn, entry_id, None, status)? {
            Self::commit(txn, deadline)?;
        }
        Ok(())
    }

    fn list_locked_entries_older_than(
        &self,
        cutoff: DateTime<Utc>,
        offset: usize,
        limit: usize,
    ) -> Result<(Vec<LedgerEntry>, usize)> {
        let cf_by_status = self.cf(cf::ENTRIES_BY_STATUS)?;
        let prefix = keys::status_prefix(EntryStatus::Locked);
        let cutoff_micros = cutoff.timestamp_micros();

        let iter = self
            .db
            .iterator_cf(&cf_by_status, IteratorMode::From(&prefix, Direction::Forward));

        // Keys are ordered by update time, so the scan ends at the first key past the cutoff.
        let mut total = 0;
        let mut entries = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(db_err)?;
            if !key.starts_with(&prefix) {
                break;
            }
            let Some((updated_micros, entry_id)) = keys::decode_status_key(&key) else {
                tracing::warn!(key_len = key.len(), "Skipping malformed status index key");
                continue;
            };
            if updated_micros >= cutoff_micros {
                break;
            }
            if total >= offset && entries.len() < limit {
                match self.find_entry(&entry_id) {
                    Ok(entry) if entry.is_locked() => entries.push(entry),
                    // Settled after the iterator's snapshot; keep filling the page.
                    Ok(_) | Err(StoreError::NotFound { .. }) => continue,
                    Err(e) => return Err(e),
                }
            }
            total += 1;
        }

        Ok((entries, total))
    }

    fn list_entries_by_account(
        &self,
        account_id: &AccountId,
        limit: usize,
        offset: usize,
    ) -> Result<Vec<LedgerEntry>> {
        let cf_by_account = self.cf(cf::ENTRIES_BY_ACCOUNT)?;
        let prefix = keys::account_entries_prefix(account_id);

        let iter = self
            .db
            .iterator_cf(&cf_by_account, IteratorMode::From(&prefix, Direction::Forward));

        // ULID keys are time-ordered; collect and reverse for newest first.
        let mut entry_ids = Vec::new();
        for item in iter {
            let (key, _) = item.map_err(db_err)?;
            if !key.starts_with(&prefix) {
                break;
            }
            if let Some(entry_id) = keys::entry_id_from_account_key(&key) {
                entry_ids.push(entry_id);
            }
        }
        entry_ids.reverse();

        entry_ids
            .into_iter()
            .skip(offset)
            .take(limit)
            .map(|entry_id| self.find_entry(&entry_id))
            .collect()
    }
}

/// Decode the entry ID stored as the value of an idempotency key.
fn decode_key_owner(bytes: &[u8]) -> Result<EntryId> {
    let bytes: [u8; 16] = bytes
        .try_into()
        .map_err(|_| StoreError::Serialization("malformed idempotency index".into()))?;
    Ok(EntryId::from_bytes(bytes))
}

#[allow(clippy::needless_pass_by_value)]
fn db_err(e: rocksdb::Error) -> StoreError {
    StoreError::Database(e.to_string())
}

#[cfg(test)]
mod tests {
    use super::*;
    use chrono::Duration;
    use credit_ledger_core::CreditRequest;
    use tempfile::TempDir;

    fn create_test_store() -> (RocksStore, TempDir) {
        let dir = TempDir::new().unwrap();
        let store = RocksStore::open(dir.path()).unwrap();
        (store, dir)
    }

    /// Create an account holding `amount` through a first grant.
    fn seed_account(store: &RocksStore, amount: i64) -> Account {
        let user_id = UserId::generate();
        let mut account = Account::new(user_id);
        account.grant(amount).unwrap();
        let entry = LedgerEntry::grant(&account, &CreditRequest::new(user_id, amount, "seed"));
        store
            .create_account_with_entry(&account, &entry, Deadline::none())
            .unwrap();
        store.find_account(&user_id).unwrap()
    }

    #[test]
    fn create_account_with_entry_persists_both() {
        let (store, _dir) = create_test_store();
        let account = seed_account(&store, 100);

        assert_eq!(account.available_total, 100);
        assert_eq!(account.version, 1);

        let history = store.list_entries_by_account(&account.id, 10, 0).unwrap();
        assert_eq!(history.len(), 1);
        assert_eq!(history[0].change_amount, 100);
        assert_eq!(history[0].status, EntryStatus::Active);
    }

    #[test]
    fn create_twice_reports_existing_account() {
        let (store, _dir) = create_test_store();
        let account = seed_account(&store, 10);

        let again = Account::new(account.user_id);
        let entry = LedgerEntry::grant(&again, &CreditRequest::new(account.user_id, 5, "other"));
        let result = store.create_account_with_entry(&again, &entry, Deadline::none());
        assert!(matches!(result, Err(StoreError::AccountExists { .. })));
    }

    #[test]
    fn apply_with_stale_version_conflicts() {
        let (store, _dir) = create_test_store();
        let account = seed_account(&store, 100);

        let mut first = account.clone();
        first.reserve(10).unwrap();
        let entry = LedgerEntry::reservation(&first, &CreditRequest::new(first.user_id, 10, "r1"));
        store
            .apply_with_entry(&first, EntryChange::Insert(&entry), Deadline::none())
            .unwrap();

        // Second writer still holds version 1.
        let mut second = account;
        second.reserve(10).unwrap();
        let entry = LedgerEntry::reservation(&second, &CreditRequest::new(second.user_id, 10, "r2"));
        let result = store.apply_with_entry(&second, EntryChange::Insert(&entry), Deadline::none());
        assert!(matches!(result, Err(StoreError::VersionConflict)));

        let stored = store.find_account(&second.user_id).unwrap();
        assert_eq!((stored.available_total, stored.locked_total), (90, 10));
        assert_eq!(stored.version, 2);
        assert!(matches!(
            store.find_entry(&entry.id),
            Err(StoreError::NotFound { .. })
        ));
    }

    #[test]
    fn duplicate_idempotency_key_rolls_back_account() {
        let (store, _dir) = create_test_store();
        let account = seed_account(&store, 100);

        let mut next = account.clone();
        next.grant(50).unwrap();
        let entry = LedgerEntry::grant(&next, &CreditRequest::new(next.user_id, 50, "seed"));
        let result = store.apply_with_entry(&next, EntryChange::Insert(&entry), Deadline::none());

        let Err(StoreError::DuplicateKey { existing }) = result else {
            panic!("expected duplicate key, got {result:?}");
        };
        let original = store.find_entry(&existing).unwrap();
        assert_eq!(original.idempotency_key, "seed");

        let stored = store.find_account(&account.user_id).unwrap();
        assert_eq!(stored.available_total, 100);
        assert_eq!(stored.version, account.version);
    }

    #[test]
    fn transition_requires_expected_status() {
        let (store, _dir) = create_test_store();
        let account = seed_account(&store, 100);

        let mut reserved = account.clone();
        reserved.reserve(30).unwrap();
        let entry =
            LedgerEntry::reservation(&reserved, &CreditRequest::new(reserved.user_id, 30, "r1"));
        store
            .apply_with_entry(&reserved, EntryChange::Insert(&entry), Deadline::none())
            .unwrap();

        let mut settled = store.find_account(&account.user_id).unwrap();
        settled.settle(30).unwrap();
        store
            .apply_with_entry(
                &settled,
                EntryChange::Transition {
                    id: entry.id,
                    from: EntryStatus::Locked,
                    to: EntryStatus::Active,
                },
                Deadline::none(),
            )
            .unwrap();
        assert_eq!(store.find_entry(&entry.id).unwrap().status, EntryStatus::Active);

        let mut released = store.find_account(&account.user_id).unwrap();
        released.available_total += 30;
        let result = store.apply_with_entry(
            &released,
            EntryChange::Transition {
                id: entry.id,
                from: EntryStatus::Locked,
                to: EntryStatus::Inactive,
            },
            Deadline::none(),
        );
        assert!(matches!(
            result,
            Err(StoreError::StatusMismatch {
                actual: EntryStatus::Active
            })
        ));
        let stored = store.find_account(&account.user_id).unwrap();
        assert_eq!((stored.available_total, stored.locked_total), (70, 0));
    }

    #[test]
    fn expired_deadline_writes_nothing() {
        let (store, _dir) = create_test_store();
        let account = seed_account(&store, 100);

        let mut next = account.clone();
        next.reserve(10).unwrap();
        let entry = LedgerEntry::reservation(&next, &CreditRequest::new(next.user_id, 10, "late"));
        let expired = Deadline::at(std::time::Instant::now());
        std::thread::sleep(std::time::Duration::from_millis(1));

        let result = store.apply_with_entry(&next, EntryChange::Insert(&entry), expired);
        assert!(matches!(result, Err(StoreError::DeadlineExceeded)));
        assert_eq!(store.find_account(&account.user_id).unwrap(), account);
        assert!(store.find_entry(&entry.id).is_err());
    }

    #[test]
    fn update_entry_status_is_idempotent() {
        let (store, _dir) = create_test_store();
        let account = seed_account(&store, 100);

        let mut next = account.clone();
        next.reserve(10).unwrap();
        let entry = LedgerEntry::reservation(&next, &CreditRequest::new(next.user_id, 10, "r"));
        store
            .apply_with_entry(&next, EntryChange::Insert(&entry), Deadline::none())
            .unwrap();

        store
            .update_entry_status(&entry.id, EntryStatus::Inactive, Deadline::none())
            .unwrap();
        store
            .update_entry_status(&entry.id, EntryStatus::Inactive, Deadline::none())
            .unwrap();
        let result = store.update_entry_status(&entry.id, EntryStatus::Active, Deadline::none());
        assert!(matches!(
            result,
            Err(StoreError::InvalidTransition {
                from: EntryStatus::Inactive,
                to: EntryStatus::Active
            })
        ));
    }

    #[test]
    fn locked_scan_pages_by_age() {
        let (store, _dir) = create_test_store();
        let mut account = seed_account(&store, 100);

        let mut ids = Vec::new();
        for i in 0..5 {
            let mut next = account.clone();
            next.reserve(1).unwrap();
            let entry = LedgerEntry::reservation(
                &next,
                &CreditRequest::new(next.user_id, 1, format!("r{i}")),
            );
            store
                .apply_with_entry(&next, EntryChange::Insert(&entry), Deadline::none())
                .unwrap();
            ids.push(entry.id);
            account = store.find_account(&account.user_id).unwrap();
        }

        let future = Utc::now() + Duration::seconds(1);
        let (page, total) = store.list_locked_entries_older_than(future, 0, 2).unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.iter().map(|e| e.id).collect::<Vec<_>>(), ids[..2]);

        let (page, total) = store.list_locked_entries_older_than(future, 4, 2).unwrap();
        assert_eq!(total, 5);
        assert_eq!(page.len(), 1);
        assert_eq!(page[0].id, ids[4]);

        let past = Utc::now() - Duration::hours(1);
        let (page, total) = store.list_locked_entries_older_than(past, 0, 10).unwrap();
        assert!(page.is_empty());
        assert_eq!(total, 0);
    }

    #[test]
    fn locked_scan_fills_page_past_stale_index_keys() {
        let (store, _dir) = create_test_store();
        let mut account = seed_account(&store, 100);

        let mut entries = Vec::new();
        for i in 0..3 {
            let mut next = account.clone();
            next.reserve(1).unwrap();
            let entry = LedgerEntry::reservation(
                &next,
                &CreditRequest::new(next.user_id, 1, format!("r{i}")),
            );
            store
                .apply_with_entry(&next, EntryChange::Insert(&entry), Deadline::none())
                .unwrap();
            entries.push(entry);
            account = store.find_account(&account.user_id).unwrap();
        }

        // Settle the oldest, then put its old index key back: the scan sees a
        // `Locked` key for an entry that is no longer locked.
        let stale = &entries[0];
        store
            .update_entry_status(&stale.id, EntryStatus::Inactive, Deadline::none())
            .unwrap();
        let cf_by_status = store.cf(cf::ENTRIES_BY_STATUS).unwrap();
        store
            .db
            .put_cf(
                &cf_by_status,
                keys::status_key(EntryStatus::Locked, &stale.updated_at, &stale.id),
                [],
            )
            .unwrap();

        let future = Utc::now() + Duration::seconds(1);
        let (page, _) = store.list_locked_entries_older_than(future, 0, 2).unwrap();
        assert_eq!(
            page.iter().map(|e| e.id).collect::<Vec<_>>(),
            [entries[1].id, entries[2].id]
        );
    }

    #[test]
    fn idempotency_key_lookup() {
        let (store, _dir) = create_test_store();
        let account = seed_account(&store, 100);

        let seed = store.find_entry_id_by_key(&account.id, "seed").unwrap();
        let history = store.list_entries_by_account(&account.id, 1, 0).unwrap();
        assert_eq!(seed, Some(history[0].id));
        assert_eq!(store.find_entry_id_by_key(&account.id, "other").unwrap(), None);
    }

    #[test]
    fn history_is_newest_first() {
        let (store, _dir) = create_test_store();
        let account = seed_account(&store, 100);

        std::thread::sleep(std::time::Duration::from_millis(2));
        let mut next = account.clone();
        next.grant(5).unwrap();
        let entry = LedgerEntry::grant(&next, &CreditRequest::new(next.user_id, 5, "bonus"));
        store
            .apply_with_entry(&next, EntryChange::Insert(&entry), Deadline::none())
            .unwrap();

        let history = store.list_entries_by_account(&account.id, 10, 0).unwrap();
        assert_eq!(history.len(), 2);
        assert_eq!(history[0].idempotency_key, "bonus");
        assert_eq!(history[1].idempotency_key, "seed");

        let page = store.list_entries_by_account(&account.id, 1, 1).unwrap();
        assert_eq!(page[0].idempotency_key, "seed");
    }

    #[test]
    fn reopen_keeps_state() {
        let dir = TempDir::new().unwrap();
        let user_id = {
            let store = RocksStore::open(dir.path()).unwrap();
            seed_account(&store, 42).user_id
        };
        let store = RocksStore::open(dir.path()).unwrap();
        assert_eq!(store.find_account(&user_id).unwrap().available_total, 42);
    }
}
