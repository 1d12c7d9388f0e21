//! Error types for the credit ledger.

use crate::entry::EntryStatus;
use crate::ids::{EntryId, IdError, UserId};

/// Result type for ledger operations.
pub type Result<T> = std::result::Result<T, LedgerError>;

/// Errors that can occur in ledger operations.
#[derive(Debug, thiserror::Error)]
pub enum LedgerError {
    /// The reservation would exceed the available balance.
    #[error("insufficient credit: available={available}, required={required}")]
    InsufficientCredit {
        /// Currently available credits.
        available: i64,
        /// Credits the reservation asked for.
        required: i64,
    },

    /// Account not found.
    #[error("account not found: {user_id}")]
    AccountNotFound {
        /// The user whose account does not exist.
        user_id: UserId,
    },

    /// Ledger entry not found.
    #[error("ledger entry not found: {entry_id}")]
    EntryNotFound {
        /// The entry that does not exist.
        entry_id: EntryId,
    },

    /// Confirm or cancel on an entry that is not a live reservation of the caller.
    #[error("invalid reservation {entry_id}: {reason}")]
    InvalidReservation {
        /// The offending entry.
        entry_id: EntryId,
        /// Why the entry cannot be settled.
        reason: String,
    },

    /// An entry status change outside the state machine.
    #[error("invalid status transition from {from} to {to}")]
    InvalidTransition {
        /// Current status.
        from: EntryStatus,
        /// Requested status.
        to: EntryStatus,
    },

    /// Optimistic concurrency retries were exhausted.
    #[error("concurrency conflict after {attempts} attempts")]
    ConcurrencyConflict {
        /// How many attempts were made.
        attempts: u32,
    },

    /// Invalid amount.
    #[error("invalid amount: {0}")]
    InvalidAmount(String),

    /// The caller's deadline elapsed before the operation committed.
    #[error("deadline exceeded")]
    DeadlineExceeded,

    /// Storage error.
    #[error("storage error: {0}")]
    Storage(String),

    /// Serialization error.
    #[error("serialization error: {0}")]
    Serialization(String),

    /// Invalid identifier.
    #[error("invalid identifier: {0}")]
    InvalidId(#[from] IdError),
}

impl LedgerError {
    /// Build an `InvalidReservation` error.
    pub fn invalid_reservation(entry_id: EntryId, reason: impl Into<String>) -> Self {
        Self::InvalidReservation {
            entry_id,
            reason: reason.into(),
        }
    }

    /// Whether the error comes from a business rule rather than infrastructure.
    ///
    /// Business rule violations are terminal for the attempt and never retried.
    #[must_use]
    pub const fn is_business_rule(&self) -> bool {
        matches!(
            self,
            Self::InsufficientCredit { .. }
                | Self::InvalidReservation { .. }
                | Self::InvalidTransition { .. }
                | Self::InvalidAmount(_)
        )
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn insufficient_credit_message() {
        let err = LedgerError::InsufficientCredit {
            available: 10,
            required: 11,
        };
        assert_eq!(
            err.to_string(),
            "insufficient credit: available=10, required=11"
        );
        assert!(err.is_business_rule());
    }

    #[test]
    fn storage_errors_are_not_business_rules() {
        assert!(!LedgerError::Storage("io".into()).is_business_rule());
        assert!(!LedgerError::ConcurrencyConflict { attempts: 3 }.is_business_rule());
        assert!(!LedgerError::DeadlineExceeded.is_business_rule());
    }
}
