//! Core types for the credit ledger.
//!
//! This crate provides the foundational types shared by the store and the service:
//!
//! - **Identifiers**: `UserId`, `AccountId`, `EntryId`
//! - **Accounts**: `Account` with its balance arithmetic
//! - **Entries**: `LedgerEntry`, `EntryStatus`
//! - **Calls**: `CreditRequest`, `Deadline`
//!
//! # Balances
//!
//! An account splits its credits into two buckets:
//!
//! - `available_total`: credits usable right now
//! - `locked_total`: credits carved out by reservations that are not settled yet
//!
//! Both are `i64` and never negative. A reservation moves credits from available to
//! locked; confirming it drops them from locked, cancelling it moves them back.

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod account;
pub mod deadline;
pub mod entry;
pub mod error;
pub mod ids;

pub use account::Account;
pub use deadline::Deadline;
pub use entry::{CreditRequest, EntryStatus, LedgerEntry};
pub use error::{LedgerError, Result};
pub use ids::{AccountId, EntryId, IdError, UserId};
