//! Account and snapshot record schemas
//!
//! Records live in the store as JSON documents. Accounts carry two mirrored
//! representations of the subscription fact: the legacy flat fields
//! (`subscriptionStatus`, `plan`, `stripeCustomerId`, ...) and the nested
//! new-schema containers (`subscription`, `analytics`, `status`). Every
//! mutation dual-writes the nested status/plan and their legacy mirrors in
//! the same record write; the migration engine backfills the containers from
//! the legacy siblings without ever overwriting a populated one.
//!
//! Timestamps in records are unix milliseconds. The payment processor speaks
//! unix seconds; conversion happens at the event boundary.

use serde::{Deserialize, Serialize};
use time::OffsetDateTime;

/// Free-trial window granted by a zero-amount checkout with a recurring
/// subscription attached.
pub const TRIAL_PERIOD_DAYS: i64 = 7;

pub const ACCOUNT_PREFIX: &str = "account/";
pub const SNAPSHOT_PREFIX: &str = "snapshot/";
pub const CUSTOMER_INDEX_PREFIX: &str = "customer_index/";

pub fn account_key(account_id: &str) -> String {
    format!("{ACCOUNT_PREFIX}{account_id}")
}

pub fn snapshot_key(snapshot_id: &str) -> String {
    format!("{SNAPSHOT_PREFIX}{snapshot_id}")
}

pub fn customer_index_key(customer_id: &str) -> String {
    format!("{CUSTOMER_INDEX_PREFIX}{customer_id}")
}

/// Current time in record units (unix milliseconds).
pub fn now_ms() -> i64 {
    (OffsetDateTime::now_utc().unix_timestamp_nanos() / 1_000_000) as i64
}

/// Processor timestamps are unix seconds; records store milliseconds.
pub fn processor_secs_to_ms(secs: i64) -> i64 {
    secs * 1000
}

pub fn trial_window_ms() -> i64 {
    TRIAL_PERIOD_DAYS * 24 * 60 * 60 * 1000
}

/// Subscription lifecycle status. Cancellation is a status value; records are
/// never tombstoned.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SubscriptionStatus {
    #[default]
    None,
    Trial,
    Active,
    Cancelled,
    PastDue,
}

impl SubscriptionStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            SubscriptionStatus::None => "none",
            SubscriptionStatus::Trial => "trial",
            SubscriptionStatus::Active => "active",
            SubscriptionStatus::Cancelled => "cancelled",
            SubscriptionStatus::PastDue => "past_due",
        }
    }
}

/// Denormalized plan tier, derived from status for fast authorization checks.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PlanTier {
    #[default]
    Free,
    Pro,
}

impl PlanTier {
    pub fn as_str(&self) -> &'static str {
        match self {
            PlanTier::Free => "free",
            PlanTier::Pro => "pro",
        }
    }
}

/// Nested new-schema subscription container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SubscriptionRecord {
    #[serde(default)]
    pub status: SubscriptionStatus,
    #[serde(default)]
    pub plan: PlanTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub customer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub external_subscription_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial_start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub trial_end: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_period_start: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub current_period_end: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_payment_at: Option<i64>,
}

/// Nested new-schema analytics container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AnalyticsRecord {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_active_at: Option<i64>,
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AccountState {
    #[default]
    Active,
    Disabled,
}

/// Nested new-schema account status container.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct StatusRecord {
    #[serde(default)]
    pub state: AccountState,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
}

/// Full account record: legacy flat fields plus optional new-schema
/// containers. A record counts as migrated once all of `analytics`,
/// `subscription`, `status` and `updatedAt` are present.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct AccountRecord {
    // ---- legacy flat schema ----
    #[serde(skip_serializing_if = "Option::is_none")]
    pub email: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    /// Legacy mirror of `subscription.status`. Kept equal by every writer.
    #[serde(default)]
    pub subscription_status: SubscriptionStatus,
    /// Legacy mirror of `subscription.plan`.
    #[serde(default)]
    pub plan: PlanTier,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stripe_customer_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stripe_subscription_id: Option<String>,
    /// Set once on the first transition away from `none`, never overwritten.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription_started_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_payment_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub snapshot_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub last_seen_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub disabled: Option<bool>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub role: Option<String>,

    // ---- new-schema containers (presence of all four = migrated) ----
    #[serde(skip_serializing_if = "Option::is_none")]
    pub subscription: Option<SubscriptionRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub analytics: Option<AnalyticsRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub status: Option<StatusRecord>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,

    /// Fields this subsystem does not own (profile data, feature flags, ...)
    /// survive a read-modify-write untouched.
    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

impl AccountRecord {
    /// Dual-write: set the nested subscription status and the legacy mirror
    /// to the same logical value. `plan = None` leaves the tier untouched
    /// (past-due does not downgrade).
    pub fn apply_status(&mut self, status: SubscriptionStatus, plan: Option<PlanTier>) {
        let sub = self.subscription.get_or_insert_with(SubscriptionRecord::default);
        sub.status = status;
        self.subscription_status = status;
        if let Some(plan) = plan {
            sub.plan = plan;
            self.plan = plan;
        }
    }

    /// Monotonic start marker: set-if-absent on both representations.
    pub fn mark_subscription_started(&mut self, now_ms: i64) {
        if self.subscription_started_at.is_none() {
            self.subscription_started_at = Some(now_ms);
        }
        let sub = self.subscription.get_or_insert_with(SubscriptionRecord::default);
        if sub.started_at.is_none() {
            sub.started_at = self.subscription_started_at;
        }
    }

    pub fn touch(&mut self, now_ms: i64) {
        self.updated_at = Some(now_ms);
    }

    /// Invariant probe used by handlers' tests: both representations report
    /// the same status and plan.
    pub fn mirrors_consistent(&self) -> bool {
        match &self.subscription {
            Some(sub) => sub.status == self.subscription_status && sub.plan == self.plan,
            None => self.subscription_status == SubscriptionStatus::None,
        }
    }
}

/// Snapshot record: the other migratable kind. Legacy flat fields plus the
/// `meta`/`stats` containers and `updatedAt` marker.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotRecord {
    // ---- legacy flat schema ----
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub created_at: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<i64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub public: Option<bool>,

    // ---- new-schema containers (presence of all three = migrated) ----
    #[serde(skip_serializing_if = "Option::is_none")]
    pub meta: Option<SnapshotMeta>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub stats: Option<SnapshotStats>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<i64>,

    #[serde(flatten)]
    pub extra: serde_json::Map<String, serde_json::Value>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotMeta {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub account_id: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub visibility: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SnapshotStats {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub view_count: Option<i64>,
}

/// Index record binding a processor customer id to an account id.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct CustomerIndexRecord {
    pub account_id: String,
    pub bound_at: i64,
}

/// Record kinds the migration engine can sweep.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RecordKind {
    Account,
    Snapshot,
}

impl RecordKind {
    pub fn prefix(&self) -> &'static str {
        match self {
            RecordKind::Account => ACCOUNT_PREFIX,
            RecordKind::Snapshot => SNAPSHOT_PREFIX,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            RecordKind::Account => "account",
            RecordKind::Snapshot => "snapshot",
        }
    }
}

impl std::str::FromStr for RecordKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "account" | "accounts" => Ok(RecordKind::Account),
            "snapshot" | "snapshots" => Ok(RecordKind::Snapshot),
            other => Err(format!("unknown record kind '{other}'")),
        }
    }
}

impl std::fmt::Display for RecordKind {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn status_serializes_snake_case() {
        assert_eq!(
            serde_json::to_value(SubscriptionStatus::PastDue).unwrap(),
            json!("past_due")
        );
        assert_eq!(
            serde_json::to_value(SubscriptionStatus::None).unwrap(),
            json!("none")
        );
    }

    #[test]
    fn apply_status_keeps_mirrors_equal() {
        let mut record = AccountRecord::default();
        record.apply_status(SubscriptionStatus::Active, Some(PlanTier::Pro));
        assert!(record.mirrors_consistent());
        assert_eq!(record.subscription_status, SubscriptionStatus::Active);
        assert_eq!(
            record.subscription.as_ref().unwrap().status,
            SubscriptionStatus::Active
        );
        assert_eq!(record.plan, PlanTier::Pro);

        // past_due without a plan change keeps the tier
        record.apply_status(SubscriptionStatus::PastDue, None);
        assert!(record.mirrors_consistent());
        assert_eq!(record.plan, PlanTier::Pro);
    }

    #[test]
    fn subscription_started_is_monotonic() {
        let mut record = AccountRecord::default();
        record.mark_subscription_started(1_000);
        record.mark_subscription_started(2_000);
        assert_eq!(record.subscription_started_at, Some(1_000));
        assert_eq!(record.subscription.unwrap().started_at, Some(1_000));
    }

    #[test]
    fn unknown_fields_round_trip() {
        let raw = json!({
            "email": "a@example.com",
            "subscriptionStatus": "trial",
            "displayName": "Ada",
            "featureFlags": {"beta": true}
        });
        let record: AccountRecord = serde_json::from_value(raw).unwrap();
        assert_eq!(record.subscription_status, SubscriptionStatus::Trial);

        let back = serde_json::to_value(&record).unwrap();
        assert_eq!(back["displayName"], "Ada");
        assert_eq!(back["featureFlags"]["beta"], true);
    }

    #[test]
    fn record_kind_parses_plural() {
        assert_eq!("accounts".parse::<RecordKind>().unwrap(), RecordKind::Account);
        assert_eq!("snapshot".parse::<RecordKind>().unwrap(), RecordKind::Snapshot);
        assert!("widgets".parse::<RecordKind>().is_err());
    }
}
