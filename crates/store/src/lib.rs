// Store crate clippy configuration
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Snapdock Record Store
//!
//! Key-value record store abstraction shared by the billing subsystem and the
//! migration engine. Records are JSON documents keyed by a `kind/id` string.
//!
//! Every record carries a version token and writes are optimistic
//! compare-and-swap: a `put` against a stale version fails with
//! [`StoreError::VersionConflict`] and the caller re-runs its
//! read-modify-write. Transient write failures (rate limiting, brief
//! unavailability) are retried with bounded exponential backoff via the
//! helpers in [`retry`].

pub mod error;
pub mod memory;
pub mod retry;

pub use error::{StoreError, StoreResult};
pub use memory::InMemoryStore;
pub use retry::{put_with_backoff, update_with_retry, DEFAULT_CAS_ATTEMPTS};

use async_trait::async_trait;
use serde_json::Value;

/// Monotonic per-record version token used for optimistic concurrency.
pub type Version = u64;

/// A record value together with the version it was read at.
#[derive(Debug, Clone, PartialEq)]
pub struct VersionedRecord {
    pub value: Value,
    pub version: Version,
}

/// One page of a prefix scan.
#[derive(Debug, Clone, Default)]
pub struct Page {
    /// Key/record pairs in key order.
    pub items: Vec<(String, VersionedRecord)>,
    /// Opaque cursor for the next page; `None` when the scan is exhausted.
    pub cursor: Option<String>,
}

/// Durable key-value store for account, snapshot, and index records.
///
/// `put` semantics:
/// - `expected = Some(v)`: write succeeds only if the current version is `v`.
/// - `expected = None`: write succeeds only if the key does not exist yet.
///
/// There is deliberately no unconditional overwrite; every writer goes through
/// the compare-and-swap so concurrent read-modify-write sequences cannot
/// silently clobber each other.
#[async_trait]
pub trait RecordStore: Send + Sync {
    async fn get(&self, key: &str) -> StoreResult<Option<VersionedRecord>>;

    async fn put(&self, key: &str, value: Value, expected: Option<Version>)
        -> StoreResult<Version>;

    /// Scan keys beginning with `prefix`, resuming after `cursor` if given.
    /// Returns at most `limit` items per page.
    async fn list(&self, prefix: &str, cursor: Option<&str>, limit: usize) -> StoreResult<Page>;
}
