//! Ledger entry types.
//!
//! Every credit-affecting event is recorded as one append-only `LedgerEntry`.
//! The entry's amount and idempotency key never change after creation; only
//! its status moves, and at most once.

use std::fmt;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::account::Account;
use crate::ids::{AccountId, EntryId, UserId};

/// Status of a ledger entry.
///
/// ```text
///   grant ────────────────────────► Active
///   reserve ──► Locked ──confirm──► Active
///                  └─────cancel───► Inactive
/// ```
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntryStatus {
    /// Settled: a grant, or a confirmed deduction.
    Active,

    /// A reservation whose credits are carved out but not yet settled.
    Locked,

    /// A cancelled or expired reservation.
    Inactive,
}

impl EntryStatus {
    /// Single-byte tag used in storage index keys.
    #[must_use]
    pub const fn as_byte(self) -> u8 {
        match self {
            Self::Active => 1,
            Self::Locked => 2,
            Self::Inactive => 3,
        }
    }

    /// Inverse of [`EntryStatus::as_byte`].
    #[must_use]
    pub const fn from_byte(byte: u8) -> Option<Self> {
        match byte {
            1 => Some(Self::Active),
            2 => Some(Self::Locked),
            3 => Some(Self::Inactive),
            _ => None,
        }
    }

    /// `Locked` is the only non-terminal status.
    #[must_use]
    pub const fn is_terminal(self) -> bool {
        !matches!(self, Self::Locked)
    }

    /// Whether the state machine allows moving from `self` to `next`.
    #[must_use]
    pub const fn can_transition_to(self, next: Self) -> bool {
        matches!(
            (self, next),
            (Self::Locked, Self::Active | Self::Inactive)
        )
    }
}

impl fmt::Display for EntryStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Self::Active => "active",
            Self::Locked => "locked",
            Self::Inactive => "inactive",
        };
        f.write_str(name)
    }
}

/// A grant or reservation request from a caller.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CreditRequest {
    /// The user whose account is affected.
    pub user_id: UserId,
    /// Credits to grant or reserve. Must be positive.
    pub amount: i64,
    /// Caller-supplied dedupe key, unique per logical event.
    pub idempotency_key: String,
    /// Business domain of the event (e.g. `"purchase"`, `"ai_call"`).
    pub biz: String,
    /// Business object the event refers to.
    pub biz_id: String,
    /// Free-form description.
    pub desc: String,
}

impl CreditRequest {
    /// Create a request with empty provenance fields.
    #[must_use]
    pub fn new(user_id: UserId, amount: i64, idempotency_key: impl Into<String>) -> Self {
        Self {
            user_id,
            amount,
            idempotency_key: idempotency_key.into(),
            biz: String::new(),
            biz_id: String::new(),
            desc: String::new(),
        }
    }

    /// Set the business domain and object ID.
    #[must_use]
    pub fn with_biz(mut self, biz: impl Into<String>, biz_id: impl Into<String>) -> Self {
        self.biz = biz.into();
        self.biz_id = biz_id.into();
        self
    }

    /// Set the description.
    #[must_use]
    pub fn with_desc(mut self, desc: impl Into<String>) -> Self {
        self.desc = desc.into();
        self
    }
}

/// One append-only ledger record.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct LedgerEntry {
    /// Unique entry ID (ULID for time-ordering). Also the reservation handle.
    pub id: EntryId,

    /// The account this entry belongs to.
    pub account_id: AccountId,

    /// The account's user.
    pub user_id: UserId,

    /// Dedupe key, unique per account.
    pub idempotency_key: String,

    /// Signed amount. Positive = grant, negative = reservation/deduction.
    pub change_amount: i64,

    /// Business domain of the event.
    pub biz: String,

    /// Business object the event refers to.
    pub biz_id: String,

    /// Free-form description.
    pub desc: String,

    /// Current status.
    pub status: EntryStatus,

    /// When the entry was created.
    pub created_at: DateTime<Utc>,

    /// When the status last changed.
    pub updated_at: DateTime<Utc>,
}

impl LedgerEntry {
    /// Create an `Active` grant entry of `+amount`.
    #[must_use]
    pub fn grant(account: &Account, request: &CreditRequest) -> Self {
        Self::build(account, request, request.amount, EntryStatus::Active)
    }

    /// Create a `Locked` reservation entry of `-amount`.
    #[must_use]
    pub fn reservation(account: &Account, request: &CreditRequest) -> Self {
        Self::build(account, request, -request.amount, EntryStatus::Locked)
    }

    fn build(
        account: &Account,
        request: &CreditRequest,
        change_amount: i64,
        status: EntryStatus,
    ) -> Self {
        let now = Utc::now();
        Self {
            id: EntryId::generate(),
            account_id: account.id,
            user_id: account.user_id,
            idempotency_key: request.idempotency_key.clone(),
            change_amount,
            biz: request.biz.clone(),
            biz_id: request.biz_id.clone(),
            desc: request.desc.clone(),
            status,
            created_at: now,
            updated_at: now,
        }
    }

    /// The unsigned amount the entry moves.
    #[must_use]
    pub const fn amount(&self) -> i64 {
        self.change_amount.saturating_abs()
    }

    /// Whether the entry is an unsettled reservation.
    #[must_use]
    pub fn is_locked(&self) -> bool {
        self.status == EntryStatus::Locked
    }
}
