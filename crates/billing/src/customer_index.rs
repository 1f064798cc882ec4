//! Customer index
//!
//! Maps a payment-processor customer id to an internal account id. The
//! authoritative path is an explicit index record written when a customer id
//! is first bound to an account. The paginated full scan of the account
//! prefix survives only as a fallback and repair tool: an index miss falls
//! through to the scan and self-heals the index, and [`CustomerIndex::rebuild`]
//! re-derives every missing index record offline.

use std::sync::Arc;

use snapdock_store::{put_with_backoff, RecordStore, StoreError};

use crate::error::BillingResult;
use crate::model::{
    account_key, customer_index_key, now_ms, AccountRecord, CustomerIndexRecord, ACCOUNT_PREFIX,
};

const SCAN_PAGE_SIZE: usize = 200;

pub struct CustomerIndex {
    store: Arc<dyn RecordStore>,
}

impl CustomerIndex {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Resolve a processor customer id to an account id.
    pub async fn lookup(&self, customer_id: &str) -> BillingResult<Option<String>> {
        let key = customer_index_key(customer_id);
        if let Some(record) = self.store.get(&key).await? {
            let index: CustomerIndexRecord =
                serde_json::from_value(record.value).map_err(StoreError::Serialization)?;
            return Ok(Some(index.account_id));
        }

        // Index miss: fall back to the O(n) scan and heal the index.
        if let Some(account_id) = self.scan_for_customer(customer_id).await? {
            tracing::warn!(
                customer_id = %customer_id,
                account_id = %account_id,
                "Customer index miss repaired via account scan"
            );
            self.bind(customer_id, &account_id).await?;
            return Ok(Some(account_id));
        }

        Ok(None)
    }

    /// Bind a customer id to an account. First write wins; a re-bind to the
    /// same account is an idempotent no-op, a re-bind to a different account
    /// is logged and ignored.
    pub async fn bind(&self, customer_id: &str, account_id: &str) -> BillingResult<()> {
        let key = customer_index_key(customer_id);
        let record = CustomerIndexRecord {
            account_id: account_id.to_string(),
            bound_at: now_ms(),
        };
        let value = serde_json::to_value(&record).map_err(StoreError::Serialization)?;

        match put_with_backoff(self.store.as_ref(), &key, value, None).await {
            Ok(_) => {
                tracing::info!(
                    customer_id = %customer_id,
                    account_id = %account_id,
                    "Customer id bound to account"
                );
                Ok(())
            }
            Err(StoreError::VersionConflict { .. }) => {
                // Already bound. Only flag it when the binding disagrees.
                if let Some(existing) = self.store.get(&key).await? {
                    let index: CustomerIndexRecord = serde_json::from_value(existing.value)
                        .map_err(StoreError::Serialization)?;
                    if index.account_id != account_id {
                        tracing::error!(
                            customer_id = %customer_id,
                            bound_account = %index.account_id,
                            requested_account = %account_id,
                            "Customer id already bound to a different account; keeping first binding"
                        );
                    }
                }
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    /// Rebuild missing index records from the account store. Returns the
    /// number of index records written.
    pub async fn rebuild(&self) -> BillingResult<usize> {
        let mut written = 0;
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .store
                .list(ACCOUNT_PREFIX, cursor.as_deref(), SCAN_PAGE_SIZE)
                .await?;

            for (key, record) in &page.items {
                let account: AccountRecord = match serde_json::from_value(record.value.clone()) {
                    Ok(account) => account,
                    Err(err) => {
                        tracing::warn!(key = %key, error = %err, "Skipping unreadable account during index rebuild");
                        continue;
                    }
                };
                let Some(customer_id) = stored_customer_id(&account) else {
                    continue;
                };
                let account_id = key.trim_start_matches(ACCOUNT_PREFIX);

                let index_key = customer_index_key(customer_id);
                if self.store.get(&index_key).await?.is_none() {
                    self.bind(customer_id, account_id).await?;
                    written += 1;
                }
            }

            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        tracing::info!(written = written, "Customer index rebuild complete");
        Ok(written)
    }

    /// Linear scan of the account prefix. Correct but O(n); repair path only.
    async fn scan_for_customer(&self, customer_id: &str) -> BillingResult<Option<String>> {
        let mut cursor: Option<String> = None;
        loop {
            let page = self
                .store
                .list(ACCOUNT_PREFIX, cursor.as_deref(), SCAN_PAGE_SIZE)
                .await?;

            for (key, record) in &page.items {
                let account: AccountRecord = match serde_json::from_value(record.value.clone()) {
                    Ok(account) => account,
                    Err(_) => continue,
                };
                if stored_customer_id(&account) == Some(customer_id) {
                    return Ok(Some(key.trim_start_matches(ACCOUNT_PREFIX).to_string()));
                }
            }

            match page.cursor {
                Some(next) => cursor = Some(next),
                None => return Ok(None),
            }
        }
    }

    /// Existence check used by the dashboard: does this account have a bound
    /// processor customer at all?
    pub async fn customer_for_account(&self, account_id: &str) -> BillingResult<Option<String>> {
        let Some(record) = self.store.get(&account_key(account_id)).await? else {
            return Ok(None);
        };
        let account: AccountRecord =
            serde_json::from_value(record.value).map_err(StoreError::Serialization)?;
        Ok(stored_customer_id(&account).map(str::to_string))
    }
}

fn stored_customer_id(account: &AccountRecord) -> Option<&str> {
    account
        .stripe_customer_id
        .as_deref()
        .or_else(|| {
            account
                .subscription
                .as_ref()
                .and_then(|s| s.customer_id.as_deref())
        })
        .filter(|id| !id.is_empty())
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use snapdock_store::InMemoryStore;

    fn index(store: Arc<InMemoryStore>) -> CustomerIndex {
        CustomerIndex::new(store)
    }

    #[tokio::test]
    async fn bind_then_lookup() {
        let store = Arc::new(InMemoryStore::new());
        let index = index(Arc::clone(&store));

        index.bind("cus_1", "acct_1").await.unwrap();
        assert_eq!(
            index.lookup("cus_1").await.unwrap().as_deref(),
            Some("acct_1")
        );
    }

    #[tokio::test]
    async fn bind_is_idempotent_and_first_write_wins() {
        let store = Arc::new(InMemoryStore::new());
        let index = index(Arc::clone(&store));

        index.bind("cus_1", "acct_1").await.unwrap();
        index.bind("cus_1", "acct_1").await.unwrap();
        index.bind("cus_1", "acct_2").await.unwrap();

        assert_eq!(
            index.lookup("cus_1").await.unwrap().as_deref(),
            Some("acct_1")
        );
    }

    #[tokio::test]
    async fn lookup_falls_back_to_scan_and_heals() {
        let store = Arc::new(InMemoryStore::new());
        store
            .seed(
                "account/acct_7",
                json!({ "email": "a@example.com", "stripeCustomerId": "cus_7" }),
            )
            .await;
        let index = index(Arc::clone(&store));

        assert_eq!(
            index.lookup("cus_7").await.unwrap().as_deref(),
            Some("acct_7")
        );
        // Scan result was written back as an index record.
        assert!(store.get("customer_index/cus_7").await.unwrap().is_some());
    }

    #[tokio::test]
    async fn lookup_unknown_customer_is_none() {
        let store = Arc::new(InMemoryStore::new());
        store
            .seed("account/acct_1", json!({ "stripeCustomerId": "cus_1" }))
            .await;
        let index = index(Arc::clone(&store));

        assert!(index.lookup("cus_nope").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn customer_for_account_reads_either_representation() {
        let store = Arc::new(InMemoryStore::new());
        store
            .seed("account/a1", json!({ "stripeCustomerId": "cus_a" }))
            .await;
        store
            .seed(
                "account/a2",
                json!({ "subscription": { "customerId": "cus_b" } }),
            )
            .await;
        let index = index(Arc::clone(&store));

        assert_eq!(
            index.customer_for_account("a1").await.unwrap().as_deref(),
            Some("cus_a")
        );
        assert_eq!(
            index.customer_for_account("a2").await.unwrap().as_deref(),
            Some("cus_b")
        );
        assert!(index.customer_for_account("a3").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn rebuild_writes_missing_index_records() {
        let store = Arc::new(InMemoryStore::new());
        store
            .seed("account/a1", json!({ "stripeCustomerId": "cus_a" }))
            .await;
        store
            .seed(
                "account/a2",
                json!({ "subscription": { "customerId": "cus_b" } }),
            )
            .await;
        store.seed("account/a3", json!({ "email": "nocus@example.com" })).await;
        let index = index(Arc::clone(&store));

        let written = index.rebuild().await.unwrap();
        assert_eq!(written, 2);
        assert_eq!(index.lookup("cus_a").await.unwrap().as_deref(), Some("a1"));
        assert_eq!(index.lookup("cus_b").await.unwrap().as_deref(), Some("a2"));

        // Second rebuild finds nothing to do.
        assert_eq!(index.rebuild().await.unwrap(), 0);
    }
}
