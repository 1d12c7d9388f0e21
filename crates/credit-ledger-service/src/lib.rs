//! Credit reservation ledger service.
//!
//! This crate implements the ledger protocol on top of a [`Store`]:
//!
//! - [`CreditLedger::add_credits`]: idempotent grant
//! - [`CreditLedger::try_deduct_credits`]: reserve credits, failing if the balance cannot cover them
//! - [`CreditLedger::confirm_deduct_credits`]: spend a reservation
//! - [`CreditLedger::cancel_deduct_credits`]: release a reservation
//! - [`CreditLedger::get_account`]: balance and recent history
//!
//! and the [`Reaper`] that cancels reservations abandoned by their callers.
//!
//! # Example
//!
//! ```
//! use std::sync::Arc;
//!
//! use credit_ledger_core::{CreditRequest, Deadline, UserId};
//! use credit_ledger_service::{CreditLedger, LedgerConfig};
//! use credit_ledger_store::MemoryStore;
//!
//! let ledger = CreditLedger::new(Arc::new(MemoryStore::new()), &LedgerConfig::default());
//! let user_id = UserId::generate();
//!
//! ledger
//!     .add_credits(&CreditRequest::new(user_id, 100, "signup"), Deadline::none())
//!     .unwrap();
//! let hold = ledger
//!     .try_deduct_credits(&CreditRequest::new(user_id, 30, "call-1"), Deadline::none())
//!     .unwrap();
//! ledger
//!     .confirm_deduct_credits(&user_id, &hold, Deadline::none())
//!     .unwrap();
//!
//! let account = ledger.get_account(&user_id).unwrap().account;
//! assert_eq!((account.available_total, account.locked_total), (70, 0));
//! ```
//!
//! [`Store`]: credit_ledger_store::Store

#![forbid(unsafe_code)]
#![warn(missing_docs)]
#![warn(clippy::all)]
#![warn(clippy::pedantic)]

pub mod config;
pub mod ledger;
pub mod reaper;
pub mod retry;

pub use config::{ConfigError, LedgerConfig, ReaperConfig};
pub use ledger::{AccountSnapshot, CreditLedger};
pub use reaper::{Reaper, ReaperHandle, ReaperJob, ReaperStats};
pub use retry::RetryPolicy;
