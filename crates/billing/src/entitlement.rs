//! Paid-feature entitlement
//!
//! Trial expiry is evaluated lazily at check time. No sweep flips expired
//! trials to cancelled; the stored status may say `trial` long after the
//! window closed and the check still answers correctly. The stored record is
//! never rewritten here.

use crate::model::{AccountRecord, SubscriptionStatus};

/// Whether this account may use paid features right now.
///
/// Admins always may. Past-due accounts keep access through the grace period;
/// access ends only when the processor reports the subscription deleted.
pub fn is_authorized_for_paid_features(record: &AccountRecord, now_ms: i64) -> bool {
    if record.role.as_deref() == Some("admin") {
        return true;
    }
    match effective_status(record, now_ms) {
        SubscriptionStatus::Active | SubscriptionStatus::Trial | SubscriptionStatus::PastDue => {
            true
        }
        SubscriptionStatus::None | SubscriptionStatus::Cancelled => false,
    }
}

/// The stored status with lazy trial expiry applied: a `trial` whose window
/// has closed reads as `cancelled` without a write.
pub fn effective_status(record: &AccountRecord, now_ms: i64) -> SubscriptionStatus {
    let status = record.subscription_status;
    if status != SubscriptionStatus::Trial {
        return status;
    }
    let trial_end = record.subscription.as_ref().and_then(|s| s.trial_end);
    match trial_end {
        Some(end) if end > now_ms => SubscriptionStatus::Trial,
        // A trial with no recorded end never expires on its own; the
        // processor's subscription.updated moves it along.
        None => SubscriptionStatus::Trial,
        Some(_) => SubscriptionStatus::Cancelled,
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::model::PlanTier;

    const NOW: i64 = 1_700_000_000_000;

    fn account_with(status: SubscriptionStatus, trial_end: Option<i64>) -> AccountRecord {
        let mut record = AccountRecord::default();
        record.apply_status(status, Some(PlanTier::Pro));
        if let Some(sub) = record.subscription.as_mut() {
            sub.trial_end = trial_end;
        }
        record
    }

    #[test]
    fn active_and_past_due_are_authorized() {
        assert!(is_authorized_for_paid_features(
            &account_with(SubscriptionStatus::Active, None),
            NOW
        ));
        assert!(is_authorized_for_paid_features(
            &account_with(SubscriptionStatus::PastDue, None),
            NOW
        ));
    }

    #[test]
    fn cancelled_and_none_are_not() {
        assert!(!is_authorized_for_paid_features(
            &account_with(SubscriptionStatus::Cancelled, None),
            NOW
        ));
        assert!(!is_authorized_for_paid_features(&AccountRecord::default(), NOW));
    }

    #[test]
    fn trial_respects_its_window() {
        let live = account_with(SubscriptionStatus::Trial, Some(NOW + 1));
        assert!(is_authorized_for_paid_features(&live, NOW));
        assert_eq!(effective_status(&live, NOW), SubscriptionStatus::Trial);

        let expired = account_with(SubscriptionStatus::Trial, Some(NOW - 1));
        assert!(!is_authorized_for_paid_features(&expired, NOW));
        assert_eq!(effective_status(&expired, NOW), SubscriptionStatus::Cancelled);

        // Expiry is a read-time view; the stored status is untouched.
        assert_eq!(expired.subscription_status, SubscriptionStatus::Trial);
    }

    #[test]
    fn trial_without_end_stays_live() {
        let open = account_with(SubscriptionStatus::Trial, None);
        assert!(is_authorized_for_paid_features(&open, NOW));
    }

    #[test]
    fn admin_bypasses_subscription_state() {
        let mut record = account_with(SubscriptionStatus::Cancelled, None);
        record.role = Some("admin".into());
        assert!(is_authorized_for_paid_features(&record, NOW));
    }
}
