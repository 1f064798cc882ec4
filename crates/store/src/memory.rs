//! In-memory record store
//!
//! Backs tests and local development. Mirrors the semantics of the hosted
//! store: versioned compare-and-swap writes and cursor-based prefix scans.
//! Transient failures can be injected to exercise retry paths.

use std::collections::BTreeMap;
use std::ops::Bound;
use std::sync::atomic::{AtomicUsize, Ordering};

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::RwLock;

use crate::error::{StoreError, StoreResult};
use crate::{Page, RecordStore, Version, VersionedRecord};

#[derive(Default)]
pub struct InMemoryStore {
    inner: RwLock<BTreeMap<String, VersionedRecord>>,
    /// Number of upcoming `put` calls that fail with `RateLimited`.
    fail_puts: AtomicUsize,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Insert a record directly, bypassing the compare-and-swap. Test setup
    /// and local fixtures only.
    pub async fn seed(&self, key: &str, value: Value) -> Version {
        let mut inner = self.inner.write().await;
        let version = inner.get(key).map(|r| r.version + 1).unwrap_or(1);
        inner.insert(key.to_string(), VersionedRecord { value, version });
        version
    }

    /// Make the next `n` puts fail with [`StoreError::RateLimited`].
    pub fn fail_next_puts(&self, n: usize) {
        self.fail_puts.store(n, Ordering::SeqCst);
    }

    pub async fn len(&self) -> usize {
        self.inner.read().await.len()
    }

    pub async fn is_empty(&self) -> bool {
        self.inner.read().await.is_empty()
    }
}

#[async_trait]
impl RecordStore for InMemoryStore {
    async fn get(&self, key: &str) -> StoreResult<Option<VersionedRecord>> {
        Ok(self.inner.read().await.get(key).cloned())
    }

    async fn put(
        &self,
        key: &str,
        value: Value,
        expected: Option<Version>,
    ) -> StoreResult<Version> {
        // Consume one injected failure, if any.
        let remaining = self
            .fail_puts
            .fetch_update(Ordering::SeqCst, Ordering::SeqCst, |n| n.checked_sub(1));
        if remaining.is_ok() {
            return Err(StoreError::RateLimited);
        }

        let mut inner = self.inner.write().await;
        let found = inner.get(key).map(|r| r.version);
        if found != expected {
            return Err(StoreError::VersionConflict {
                key: key.to_string(),
                expected,
                found,
            });
        }
        let version = found.map(|v| v + 1).unwrap_or(1);
        inner.insert(key.to_string(), VersionedRecord { value, version });
        Ok(version)
    }

    async fn list(&self, prefix: &str, cursor: Option<&str>, limit: usize) -> StoreResult<Page> {
        let inner = self.inner.read().await;
        let start = match cursor {
            Some(c) => Bound::Excluded(c.to_string()),
            None => Bound::Included(prefix.to_string()),
        };

        let mut items = Vec::new();
        for (key, record) in inner.range((start, Bound::Unbounded)) {
            if !key.starts_with(prefix) {
                break;
            }
            if items.len() >= limit {
                // More keys remain under this prefix; hand back a cursor.
                let cursor = items.last().map(|(k, _): &(String, _)| k.clone());
                return Ok(Page { items, cursor });
            }
            items.push((key.clone(), record.clone()));
        }
        Ok(Page {
            items,
            cursor: None,
        })
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[tokio::test]
    async fn put_create_and_update() {
        let store = InMemoryStore::new();
        let v1 = store
            .put("account/a", json!({"email": "a@example.com"}), None)
            .await
            .unwrap();
        assert_eq!(v1, 1);

        let v2 = store
            .put("account/a", json!({"email": "b@example.com"}), Some(v1))
            .await
            .unwrap();
        assert_eq!(v2, 2);

        let rec = store.get("account/a").await.unwrap().unwrap();
        assert_eq!(rec.version, 2);
        assert_eq!(rec.value["email"], "b@example.com");
    }

    #[tokio::test]
    async fn put_stale_version_conflicts() {
        let store = InMemoryStore::new();
        store.seed("account/a", json!({"n": 1})).await;
        store.seed("account/a", json!({"n": 2})).await;

        let err = store
            .put("account/a", json!({"n": 3}), Some(1))
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));

        // The stale write must not have landed.
        let rec = store.get("account/a").await.unwrap().unwrap();
        assert_eq!(rec.value["n"], 2);
    }

    #[tokio::test]
    async fn put_create_fails_when_key_exists() {
        let store = InMemoryStore::new();
        store.seed("customer_index/cus_1", json!({"accountId": "a"})).await;

        let err = store
            .put("customer_index/cus_1", json!({"accountId": "b"}), None)
            .await
            .unwrap_err();
        assert!(matches!(err, StoreError::VersionConflict { .. }));
    }

    #[tokio::test]
    async fn list_paginates_by_prefix() {
        let store = InMemoryStore::new();
        for i in 0..5 {
            store.seed(&format!("account/{i}"), json!({"i": i})).await;
        }
        store.seed("snapshot/x", json!({})).await;

        let page1 = store.list("account/", None, 2).await.unwrap();
        assert_eq!(page1.items.len(), 2);
        let cursor = page1.cursor.clone().unwrap();

        let page2 = store.list("account/", Some(&cursor), 2).await.unwrap();
        assert_eq!(page2.items.len(), 2);

        let cursor = page2.cursor.clone().unwrap();
        let page3 = store.list("account/", Some(&cursor), 2).await.unwrap();
        assert_eq!(page3.items.len(), 1);
        assert!(page3.cursor.is_none());

        // Prefix isolation: the snapshot key never appears.
        let all: Vec<_> = page1
            .items
            .iter()
            .chain(&page2.items)
            .chain(&page3.items)
            .map(|(k, _)| k.clone())
            .collect();
        assert!(all.iter().all(|k| k.starts_with("account/")));
    }

    #[tokio::test]
    async fn injected_failures_consume() {
        let store = InMemoryStore::new();
        store.fail_next_puts(1);

        let err = store.put("account/a", json!({}), None).await.unwrap_err();
        assert!(matches!(err, StoreError::RateLimited));

        // Next put succeeds.
        store.put("account/a", json!({}), None).await.unwrap();
    }
}
