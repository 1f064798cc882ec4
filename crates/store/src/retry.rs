//! Write retry discipline
//!
//! Two layers, applied uniformly to every billing and migration write:
//!
//! 1. [`put_with_backoff`]: transient store failures (rate limiting, brief
//!    unavailability) are retried with bounded exponential backoff.
//! 2. [`update_with_retry`]: a version conflict means another writer landed
//!    between our read and our write, so the whole read-modify-write is
//!    re-run against the fresh record instead of overwriting it.

use serde_json::Value;
use tokio_retry::strategy::{jitter, ExponentialBackoff};
use tokio_retry::RetryIf;

use crate::error::{StoreError, StoreResult};
use crate::{RecordStore, Version, VersionedRecord};

/// Maximum read-modify-write attempts before giving up on a contended key.
pub const DEFAULT_CAS_ATTEMPTS: usize = 5;

const BACKOFF_ATTEMPTS: usize = 4;

/// `put` with bounded exponential backoff on transient failures.
///
/// Version conflicts are not retried here; they require a fresh read and are
/// handled by [`update_with_retry`].
pub async fn put_with_backoff(
    store: &dyn RecordStore,
    key: &str,
    value: Value,
    expected: Option<Version>,
) -> StoreResult<Version> {
    // 20ms, 40ms, 80ms, 160ms (jittered), then give up.
    let strategy = ExponentialBackoff::from_millis(2)
        .factor(10)
        .map(jitter)
        .take(BACKOFF_ATTEMPTS);

    RetryIf::spawn(
        strategy,
        || store.put(key, value.clone(), expected),
        |err: &StoreError| {
            let transient = err.is_transient();
            if transient {
                tracing::warn!(key = %key, error = %err, "Transient store write failure, retrying");
            }
            transient
        },
    )
    .await
}

/// Optimistic read-modify-write loop.
///
/// `compute` maps the current record (or `None` if absent) to the next value;
/// returning `None` skips the write entirely. On a version conflict the
/// record is re-read and `compute` re-applied, up to `max_attempts` times.
///
/// Returns the version written, or `Ok(None)` when `compute` declined.
pub async fn update_with_retry<F>(
    store: &dyn RecordStore,
    key: &str,
    max_attempts: usize,
    mut compute: F,
) -> StoreResult<Option<Version>>
where
    F: FnMut(Option<&VersionedRecord>) -> Option<Value>,
{
    let mut last_conflict = None;
    for attempt in 1..=max_attempts {
        let current = store.get(key).await?;
        let expected = current.as_ref().map(|r| r.version);

        let next = match compute(current.as_ref()) {
            Some(value) => value,
            None => return Ok(None),
        };

        match put_with_backoff(store, key, next, expected).await {
            Ok(version) => return Ok(Some(version)),
            Err(err @ StoreError::VersionConflict { .. }) => {
                tracing::debug!(
                    key = %key,
                    attempt = attempt,
                    "Concurrent write detected, re-running read-modify-write"
                );
                last_conflict = Some(err);
            }
            Err(err) => return Err(err),
        }
    }

    Err(last_conflict.unwrap_or(StoreError::Unavailable(format!(
        "update of {key} exhausted {max_attempts} attempts"
    ))))
}
