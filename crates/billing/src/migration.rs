//! Schema migration engine
//!
//! Batch sweep that evolves stored records from the legacy flat schema to the
//! nested containers, while live traffic keeps dual-writing both. Migration
//! is a pure fill-missing operation: a legacy field is copied into its
//! new-schema sibling only when the sibling is absent, and legacy fields are
//! left in place for readers that have not migrated.
//!
//! Each record write goes through the same compare-and-swap retry loop as the
//! state machine, so a concurrent webhook write between the scan's read and
//! the engine's write triggers a re-read instead of clobbering fresher state.

use std::sync::Arc;
use std::time::Instant;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use snapdock_store::{update_with_retry, RecordStore, DEFAULT_CAS_ATTEMPTS};

use crate::error::{BillingError, BillingResult};
use crate::model::{
    now_ms, AccountRecord, AccountState, AnalyticsRecord, RecordKind, SnapshotMeta, SnapshotRecord,
    SnapshotStats, StatusRecord, SubscriptionRecord,
};

const STATS_PAGE_SIZE: usize = 200;

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", default)]
pub struct MigrationOptions {
    /// Compute and report without persisting anything.
    pub dry_run: bool,
    /// Pagination page size for the store scan.
    pub batch_size: usize,
    /// Continue past a single-record failure instead of aborting the run.
    pub skip_errors: bool,
    /// Emit per-page progress logs.
    pub verbose: bool,
}

impl Default for MigrationOptions {
    fn default() -> Self {
        Self {
            dry_run: false,
            batch_size: 100,
            skip_errors: true,
            verbose: false,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum MigrationAction {
    Migrated,
    Skipped,
    Error,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationDetail {
    pub kind: RecordKind,
    pub id: String,
    pub action: MigrationAction,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub message: Option<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationReport {
    pub kind: RecordKind,
    pub migrated: usize,
    pub errors: usize,
    pub details: Vec<MigrationDetail>,
    pub duration_ms: u64,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MigrationStats {
    pub kind: RecordKind,
    pub total: usize,
    pub migrated: usize,
    pub legacy: usize,
    pub percent_complete: f64,
}

/// One legacy-to-new field copy performed by a backfill.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FieldCopy {
    pub from: &'static str,
    pub to: &'static str,
}

impl FieldCopy {
    fn new(from: &'static str, to: &'static str) -> Self {
        Self { from, to }
    }
}

impl std::fmt::Display for FieldCopy {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{} -> {}", self.from, self.to)
    }
}

/// A record kind that can be backfilled from its legacy fields.
pub trait LegacyBackfill: Serialize + DeserializeOwned {
    /// Migrated means every new-schema container field is present.
    fn is_migrated(&self) -> bool;

    /// Copy legacy fields into absent new-schema siblings, never overwriting
    /// a populated one. Returns the field pairs actually touched.
    fn backfill(&mut self, now_ms: i64) -> Vec<FieldCopy>;
}

impl LegacyBackfill for AccountRecord {
    fn is_migrated(&self) -> bool {
        self.analytics.is_some()
            && self.subscription.is_some()
            && self.status.is_some()
            && self.updated_at.is_some()
    }

    fn backfill(&mut self, now_ms: i64) -> Vec<FieldCopy> {
        let mut copies = Vec::new();

        // subscription container
        let legacy_status = self.subscription_status;
        let legacy_plan = self.plan;
        let legacy_customer = self.stripe_customer_id.clone();
        let legacy_subscription = self.stripe_subscription_id.clone();
        let legacy_started = self.subscription_started_at;
        let legacy_payment = self.last_payment_at;

        let created = self.subscription.is_none();
        let sub = self.subscription.get_or_insert_with(SubscriptionRecord::default);
        if created {
            sub.status = legacy_status;
            sub.plan = legacy_plan;
            copies.push(FieldCopy::new("subscriptionStatus", "subscription.status"));
            copies.push(FieldCopy::new("plan", "subscription.plan"));
        }
        if sub.customer_id.is_none() {
            if let Some(id) = legacy_customer {
                sub.customer_id = Some(id);
                copies.push(FieldCopy::new("stripeCustomerId", "subscription.customerId"));
            }
        }
        if sub.external_subscription_id.is_none() {
            if let Some(id) = legacy_subscription {
                sub.external_subscription_id = Some(id);
                copies.push(FieldCopy::new(
                    "stripeSubscriptionId",
                    "subscription.externalSubscriptionId",
                ));
            }
        }
        if sub.started_at.is_none() {
            if let Some(at) = legacy_started {
                sub.started_at = Some(at);
                copies.push(FieldCopy::new(
                    "subscriptionStartedAt",
                    "subscription.startedAt",
                ));
            }
        }
        if sub.last_payment_at.is_none() {
            if let Some(at) = legacy_payment {
                sub.last_payment_at = Some(at);
                copies.push(FieldCopy::new("lastPaymentAt", "subscription.lastPaymentAt"));
            }
        }

        // analytics container
        let legacy_count = self.snapshot_count;
        let legacy_seen = self.last_seen_at;
        let analytics = self.analytics.get_or_insert_with(AnalyticsRecord::default);
        if analytics.snapshot_count.is_none() {
            if let Some(count) = legacy_count {
                analytics.snapshot_count = Some(count);
                copies.push(FieldCopy::new("snapshotCount", "analytics.snapshotCount"));
            }
        }
        if analytics.last_active_at.is_none() {
            if let Some(at) = legacy_seen {
                analytics.last_active_at = Some(at);
                copies.push(FieldCopy::new("lastSeenAt", "analytics.lastActiveAt"));
            }
        }

        // status container
        if self.status.is_none() {
            let disabled = self.disabled;
            self.status = Some(StatusRecord {
                state: if disabled == Some(true) {
                    AccountState::Disabled
                } else {
                    AccountState::Active
                },
                disabled,
            });
            if disabled.is_some() {
                copies.push(FieldCopy::new("disabled", "status.disabled"));
            }
        }

        if self.updated_at.is_none() {
            self.updated_at = Some(self.created_at.unwrap_or(now_ms));
            copies.push(FieldCopy::new("createdAt", "updatedAt"));
        }

        copies
    }
}

impl LegacyBackfill for SnapshotRecord {
    fn is_migrated(&self) -> bool {
        self.meta.is_some() && self.stats.is_some() && self.updated_at.is_some()
    }

    fn backfill(&mut self, now_ms: i64) -> Vec<FieldCopy> {
        let mut copies = Vec::new();

        let legacy_account = self.account_id.clone();
        let legacy_title = self.title.clone();
        let legacy_public = self.public;
        let meta = self.meta.get_or_insert_with(SnapshotMeta::default);
        if meta.account_id.is_none() {
            if let Some(id) = legacy_account {
                meta.account_id = Some(id);
                copies.push(FieldCopy::new("accountId", "meta.accountId"));
            }
        }
        if meta.title.is_none() {
            if let Some(title) = legacy_title {
                meta.title = Some(title);
                copies.push(FieldCopy::new("title", "meta.title"));
            }
        }
        if meta.visibility.is_none() {
            if let Some(public) = legacy_public {
                meta.visibility = Some(if public { "public" } else { "private" }.into());
                copies.push(FieldCopy::new("public", "meta.visibility"));
            }
        }

        let legacy_views = self.view_count;
        let stats = self.stats.get_or_insert_with(SnapshotStats::default);
        if stats.view_count.is_none() {
            if let Some(views) = legacy_views {
                stats.view_count = Some(views);
                copies.push(FieldCopy::new("viewCount", "stats.viewCount"));
            }
        }

        if self.updated_at.is_none() {
            self.updated_at = Some(self.created_at.unwrap_or(now_ms));
            copies.push(FieldCopy::new("createdAt", "updatedAt"));
        }

        copies
    }
}

pub struct MigrationEngine {
    store: Arc<dyn RecordStore>,
}

impl MigrationEngine {
    pub fn new(store: Arc<dyn RecordStore>) -> Self {
        Self { store }
    }

    /// Sweep every record of `kind` and backfill un-migrated ones.
    ///
    /// Per-record failures become `error` details and abort the run only when
    /// `skip_errors` is off. A failure of the scan itself aborts the run and
    /// is reported as a single system-level error detail.
    pub async fn migrate_all(&self, kind: RecordKind, options: &MigrationOptions) -> MigrationReport {
        let started = Instant::now();
        tracing::info!(
            kind = %kind,
            dry_run = options.dry_run,
            batch_size = options.batch_size,
            "Starting migration run"
        );

        let result = match kind {
            RecordKind::Account => self.run::<AccountRecord>(kind, options).await,
            RecordKind::Snapshot => self.run::<SnapshotRecord>(kind, options).await,
        };

        let mut report = match result {
            Ok(report) => report,
            Err(err) => {
                tracing::error!(kind = %kind, error = %err, "Migration scan failed");
                MigrationReport {
                    kind,
                    migrated: 0,
                    errors: 1,
                    details: vec![MigrationDetail {
                        kind,
                        id: "(system)".into(),
                        action: MigrationAction::Error,
                        message: Some(err.to_string()),
                    }],
                    duration_ms: 0,
                }
            }
        };
        report.duration_ms = started.elapsed().as_millis() as u64;

        tracing::info!(
            kind = %kind,
            migrated = report.migrated,
            errors = report.errors,
            duration_ms = report.duration_ms,
            "Migration run finished"
        );
        report
    }

    async fn run<T: LegacyBackfill>(
        &self,
        kind: RecordKind,
        options: &MigrationOptions,
    ) -> BillingResult<MigrationReport> {
        let mut report = MigrationReport {
            kind,
            migrated: 0,
            errors: 0,
            details: Vec::new(),
            duration_ms: 0,
        };
        let mut cursor: Option<String> = None;
        // A zero page size would scan nothing and report a clean run.
        let batch_size = options.batch_size.max(1);

        loop {
            let page = self
                .store
                .list(kind.prefix(), cursor.as_deref(), batch_size)
                .await?;

            for (key, _) in &page.items {
                let id = key.trim_start_matches(kind.prefix()).to_string();
                match self.migrate_one::<T>(key, options).await {
                    Ok(detail) => {
                        if detail.action == MigrationAction::Migrated {
                            report.migrated += 1;
                        }
                        report.details.push(MigrationDetail {
                            kind,
                            id,
                            ..detail
                        });
                    }
                    Err(message) => {
                        tracing::error!(kind = %kind, id = %id, error = %message, "Record migration failed");
                        report.errors += 1;
                        report.details.push(MigrationDetail {
                            kind,
                            id,
                            action: MigrationAction::Error,
                            message: Some(message),
                        });
                        if !options.skip_errors {
                            return Ok(report);
                        }
                    }
                }
            }

            if options.verbose {
                tracing::info!(
                    kind = %kind,
                    processed = report.details.len(),
                    migrated = report.migrated,
                    errors = report.errors,
                    "Migration progress"
                );
            }

            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        Ok(report)
    }

    /// Migrate a single record. The record is re-read inside the CAS loop so
    /// a concurrent state-machine write is re-applied, never clobbered.
    async fn migrate_one<T: LegacyBackfill>(
        &self,
        key: &str,
        options: &MigrationOptions,
    ) -> Result<MigrationDetail, String> {
        // kind/id are filled in by the caller
        let placeholder = |action, message| MigrationDetail {
            kind: RecordKind::Account,
            id: String::new(),
            action,
            message,
        };

        if options.dry_run {
            let Some(current) = self.store.get(key).await.map_err(|e| e.to_string())? else {
                return Ok(placeholder(
                    MigrationAction::Skipped,
                    Some("record no longer present".into()),
                ));
            };
            let mut record: T =
                serde_json::from_value(current.value).map_err(|e| e.to_string())?;
            if record.is_migrated() {
                return Ok(placeholder(
                    MigrationAction::Skipped,
                    Some("already migrated".into()),
                ));
            }
            let copies = record.backfill(now_ms());
            return Ok(placeholder(
                MigrationAction::Migrated,
                Some(format!("dry run: {}", join_copies(&copies))),
            ));
        }

        let mut codec_error: Option<String> = None;
        let mut already_migrated = false;
        let mut vanished = false;
        let mut copies: Vec<FieldCopy> = Vec::new();

        let written = update_with_retry(
            self.store.as_ref(),
            key,
            DEFAULT_CAS_ATTEMPTS,
            |current| {
                let Some(current) = current else {
                    vanished = true;
                    return None;
                };
                let mut record: T = match serde_json::from_value(current.value.clone()) {
                    Ok(record) => record,
                    Err(err) => {
                        codec_error = Some(err.to_string());
                        return None;
                    }
                };
                if record.is_migrated() {
                    already_migrated = true;
                    return None;
                }
                copies = record.backfill(now_ms());
                match serde_json::to_value(&record) {
                    Ok(value) => Some(value),
                    Err(err) => {
                        codec_error = Some(err.to_string());
                        None
                    }
                }
            },
        )
        .await
        .map_err(|e| e.to_string())?;

        if let Some(message) = codec_error {
            return Err(message);
        }
        if vanished {
            return Ok(placeholder(
                MigrationAction::Skipped,
                Some("record no longer present".into()),
            ));
        }
        if already_migrated || written.is_none() {
            return Ok(placeholder(
                MigrationAction::Skipped,
                Some("already migrated".into()),
            ));
        }
        Ok(placeholder(
            MigrationAction::Migrated,
            Some(join_copies(&copies)),
        ))
    }

    /// Read-only scan reporting how far the migration has progressed.
    pub async fn get_stats(&self, kind: RecordKind) -> BillingResult<MigrationStats> {
        let mut total = 0;
        let mut migrated = 0;
        let mut cursor: Option<String> = None;

        loop {
            let page = self
                .store
                .list(kind.prefix(), cursor.as_deref(), STATS_PAGE_SIZE)
                .await
                .map_err(|e| BillingError::Migration(e.to_string()))?;

            for (key, record) in &page.items {
                total += 1;
                let is_migrated = match kind {
                    RecordKind::Account => {
                        serde_json::from_value::<AccountRecord>(record.value.clone())
                            .map(|r| r.is_migrated())
                    }
                    RecordKind::Snapshot => {
                        serde_json::from_value::<SnapshotRecord>(record.value.clone())
                            .map(|r| r.is_migrated())
                    }
                };
                match is_migrated {
                    Ok(true) => migrated += 1,
                    Ok(false) => {}
                    Err(err) => {
                        tracing::warn!(key = %key, error = %err, "Unreadable record counted as legacy");
                    }
                }
            }

            match page.cursor {
                Some(next) => cursor = Some(next),
                None => break,
            }
        }

        let percent_complete = if total == 0 {
            100.0
        } else {
            migrated as f64 / total as f64 * 100.0
        };
        Ok(MigrationStats {
            kind,
            total,
            migrated,
            legacy: total - migrated,
            percent_complete,
        })
    }
}

fn join_copies(copies: &[FieldCopy]) -> String {
    if copies.is_empty() {
        return "no legacy fields to copy".into();
    }
    copies
        .iter()
        .map(|c| c.to_string())
        .collect::<Vec<_>>()
        .join(", ")
}
