//! Key encoding utilities for `RocksDB`.
//!
//! This module provides functions for encoding and decoding keys used in column families.

use chrono::{DateTime, Utc};
use credit_ledger_core::{AccountId, EntryId, EntryStatus, UserId};

/// Length of a ULID or UUID in bytes.
const ID_LEN: usize = 16;

/// Length of an encoded timestamp in bytes.
const TS_LEN: usize = 8;

/// Create an account key from a user ID.
#[must_use]
pub fn account_key(user_id: &UserId) -> Vec<u8> {
    user_id.as_bytes().to_vec()
}

/// Create an entry key from an entry ID.
#[must_use]
pub fn entry_key(entry_id: &EntryId) -> Vec<u8> {
    entry_id.to_bytes().to_vec()
}

/// Create an account-entry index key.
///
/// Format: `account_id (16 bytes) || entry_id (16 bytes)`
///
/// Since ULIDs are time-ordered, entries for an account sort by creation time.
#[must_use]
pub fn account_entry_key(account_id: &AccountId, entry_id: &EntryId) -> Vec<u8> {
    let mut key = Vec::with_capacity(ID_LEN * 2);
    key.extend_from_slice(account_id.as_bytes());
    key.extend_from_slice(&entry_id.to_bytes());
    key
}

/// Create a prefix for iterating all entries of an account.
#[must_use]
pub fn account_entries_prefix(account_id: &AccountId) -> Vec<u8> {
    account_id.as_bytes().to_vec()
}

/// Create a status index key.
///
/// Format: `status (1 byte) || updated_at micros (8 bytes, order-preserving) || entry_id (16 bytes)`
#[must_use]
pub fn status_key(status: EntryStatus, updated_at: &DateTime<Utc>, entry_id: &EntryId) -> Vec<u8> {
    let mut key = Vec::with_capacity(1 + TS_LEN + ID_LEN);
    key.push(status.as_byte());
    key.extend_from_slice(&encode_timestamp(updated_at.timestamp_micros()));
    key.extend_from_slice(&entry_id.to_bytes());
    key
}

/// Create a prefix for iterating all entries with a status, oldest first.
#[must_use]
pub fn status_prefix(status: EntryStatus) -> Vec<u8> {
    vec![status.as_byte()]
}

/// Decode the timestamp (micros) and entry ID from a status index key.
///
/// Returns `None` if the key is malformed.
#[must_use]
pub fn decode_status_key(key: &[u8]) -> Option<(i64, EntryId)> {
    if key.len() != 1 + TS_LEN + ID_LEN {
        return None;
    }
    let ts: [u8; TS_LEN] = key[1..=TS_LEN].try_into().ok()?;
    let id: [u8; ID_LEN] = key[1 + TS_LEN..].try_into().ok()?;
    Some((decode_timestamp(ts), EntryId::from_bytes(id)))
}

/// Extract the entry ID from an account-entry index key.
///
/// Returns `None` if the key is malformed.
#[must_use]
pub fn entry_id_from_account_key(key: &[u8]) -> Option<EntryId> {
    let bytes: [u8; ID_LEN] = key.get(ID_LEN..ID_LEN * 2)?.try_into().ok()?;
    Some(EntryId::from_bytes(bytes))
}

/// Create an idempotency key index key.
///
/// Format: `account_id (16 bytes) || idempotency_key (utf-8)`
#[must_use]
pub fn idempotency_key(account_id: &AccountId, key: &str) -> Vec<u8> {
    let mut out = Vec::with_capacity(ID_LEN + key.len());
    out.extend_from_slice(account_id.as_bytes());
    out.extend_from_slice(key.as_bytes());
    out
}

/// Flip the sign bit so that big-endian byte order matches signed order.
#[allow(clippy::cast_sign_loss)]
fn encode_timestamp(micros: i64) -> [u8; TS_LEN] {
    ((micros as u64) ^ (1 << 63)).to_be_bytes()
}

#[allow(clippy::cast_possible_wrap)]
fn decode_timestamp(bytes: [u8; TS_LEN]) -> i64 {
    (u64::from_be_bytes(bytes) ^ (1 << 63)) as i64
}
