//! Database schema definitions and column families.
//!
//! This module defines the column families used in `RocksDB` storage.

/// Column family names for the `RocksDB` database.
pub mod cf {
    /// Primary account records, keyed by `user_id`.
    pub const ACCOUNTS: &str = "accounts";

    /// Ledger entries, keyed by `entry_id` (ULID).
    pub const ENTRIES: &str = "entries";

    /// Index: entries by account, keyed by `account_id || entry_id`.
    /// Value is empty (index only).
    pub const ENTRIES_BY_ACCOUNT: &str = "entries_by_account";

    /// Index: entries by status and update time, keyed by
    /// `status || updated_at_micros || entry_id`. Value is empty (index only).
    pub const ENTRIES_BY_STATUS: &str = "entries_by_status";

    /// Unique index on `account_id || idempotency_key`. Value is the owning `entry_id`.
    pub const IDEMPOTENCY_KEYS: &str = "idempotency_keys";
}

/// Returns all column family names for database initialization.
#[must_use]
pub fn all_column_families() -> Vec<&'static str> {
    vec![
        cf::ACCOUNTS,
        cf::ENTRIES,
        cf::ENTRIES_BY_ACCOUNT,
        cf::ENTRIES_BY_STATUS,
        cf::IDEMPOTENCY_KEYS,
    ]
}
