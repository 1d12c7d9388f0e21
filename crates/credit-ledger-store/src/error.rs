//! Error types for ledger storage.

use credit_ledger_core::{EntryId, EntryStatus, LedgerError, UserId};

/// Result type for storage operations.
pub type Result<T> = std::result::Result<T, StoreError>;

/// Errors that can occur in storage operations.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// Database operation failed.
    #[error("database error: {0}")]
    Database(String),

    /// Serialization/deserialization failed.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Record not found.
    #[error("{entity} not found: {id}")]
    NotFound {
        /// The kind of record.
        entity: &'static str,
        /// The key that was looked up.
        id: String,
    },

    /// An account for the user was created by another writer.
    #[error("account already exists: {user_id}")]
    AccountExists {
        /// The user that already has an account.
        user_id: UserId,
    },

    /// The stored account version moved on, or the transaction lost a commit race.
    #[error("version conflict")]
    VersionConflict,

    /// The idempotency key is already taken on this account.
    #[error("duplicate idempotency key, existing entry {existing}")]
    DuplicateKey {
        /// The entry that owns the key.
        existing: EntryId,
    },

    /// A conditional status transition found the entry in another status.
    #[error("entry status mismatch: actual={actual}")]
    StatusMismatch {
        /// The status the entry actually has.
        actual: EntryStatus,
    },

    /// The requested status change is not allowed by the state machine.
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: EntryStatus,
        /// Requested status.
        to: EntryStatus,
    },

    /// The caller's deadline elapsed; nothing was written.
    #[error("deadline exceeded")]
    DeadlineExceeded,
}

impl StoreError {
    pub(crate) fn account_not_found(user_id: &UserId) -> Self {
        Self::NotFound {
            entity: "account",
            id: user_id.to_string(),
        }
    }

    pub(crate) fn entry_not_found(entry_id: &EntryId) -> Self {
        Self::NotFound {
            entity: "entry",
            id: entry_id.to_string(),
        }
    }
}

impl From<StoreError> for LedgerError {
    fn from(err: StoreError) -> Self {
        match err {
            StoreError::Serialization(msg) => Self::Serialization(msg),
            StoreError::DeadlineExceeded => Self::DeadlineExceeded,
            StoreError::InvalidTransition { from, to } => Self::InvalidTransition { from, to },
            StoreError::VersionConflict => Self::ConcurrencyConflict { attempts: 1 },
            other => Self::Storage(other.to_string()),
        }
    }
}
