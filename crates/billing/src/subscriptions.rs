//! Subscription lifecycle state machine
//!
//! One handler per processor event kind. Each transition is a pure function
//! over the account record; the apply step is read-current, compute-next,
//! compare-and-swap write. Deliveries may arrive out of order or more than
//! once, so every transition is idempotent and never assumes it is seeing
//! state it wrote itself.
//!
//! Every mutation dual-writes the nested `subscription.status`/`plan` and the
//! legacy top-level mirrors in the same record write.

use std::sync::Arc;

use serde_json::json;
use snapdock_store::{update_with_retry, RecordStore, StoreError, DEFAULT_CAS_ATTEMPTS};

use crate::customer_index::CustomerIndex;
use crate::error::{BillingError, BillingResult};
use crate::events::{
    CheckoutPayload, CustomerPayload, PaymentPayload, ProcessorSubscriptionStatus,
    SubscriptionPayload,
};
use crate::model::{
    account_key, now_ms, processor_secs_to_ms, trial_window_ms, AccountRecord, PlanTier,
    SubscriptionStatus,
};
use crate::telemetry::TelemetrySink;

/// Pure transition functions, exposed for property-style tests.
pub mod transitions {
    use super::*;

    fn record_processor_ids(
        record: &mut AccountRecord,
        customer_id: &str,
        subscription_id: Option<&str>,
    ) {
        record.stripe_customer_id = Some(customer_id.to_string());
        let sub = record.subscription.get_or_insert_with(Default::default);
        sub.customer_id = Some(customer_id.to_string());
        if let Some(id) = subscription_id {
            record.stripe_subscription_id = Some(id.to_string());
            sub.external_subscription_id = Some(id.to_string());
        }
    }

    /// checkout.session.completed
    ///
    /// - zero amount, discount applied, no recurring subscription: a
    ///   full-discount coupon checkout grants paid access with no trial
    /// - zero amount with a recurring subscription: standard free trial
    /// - anything else: immediate paid signup
    pub fn apply_checkout_completed(
        record: &mut AccountRecord,
        payload: &CheckoutPayload,
        now_ms: i64,
    ) {
        record_processor_ids(record, &payload.customer, payload.subscription.as_deref());

        if payload.amount_total == 0
            && payload.discount_applied()
            && payload.subscription.is_none()
        {
            record.apply_status(SubscriptionStatus::Active, Some(PlanTier::Pro));
            if let Some(sub) = record.subscription.as_mut() {
                sub.trial_end = None;
            }
        } else if payload.amount_total == 0 && payload.subscription.is_some() {
            record.apply_status(SubscriptionStatus::Trial, Some(PlanTier::Pro));
            if let Some(sub) = record.subscription.as_mut() {
                sub.trial_start = Some(now_ms);
                sub.trial_end = Some(now_ms + trial_window_ms());
            }
        } else {
            record.apply_status(SubscriptionStatus::Active, Some(PlanTier::Pro));
            if let Some(sub) = record.subscription.as_mut() {
                sub.trial_end = None;
            }
        }

        record.mark_subscription_started(now_ms);
        record.touch(now_ms);
    }

    /// customer.subscription.created / customer.subscription.updated
    ///
    /// A 100%-off coupon on a trialing subscription is permanent paid access,
    /// not a trial; any smaller (or absent) discount goes through the normal
    /// trial window with the processor-supplied end.
    pub fn apply_subscription_update(
        record: &mut AccountRecord,
        payload: &SubscriptionPayload,
        now_ms: i64,
    ) {
        record_processor_ids(record, &payload.customer, Some(&payload.id));

        if let Some(sub) = record.subscription.as_mut() {
            if let Some(start) = payload.current_period_start {
                sub.current_period_start = Some(processor_secs_to_ms(start));
            }
            if let Some(end) = payload.current_period_end {
                sub.current_period_end = Some(processor_secs_to_ms(end));
            }
        }

        match payload.status {
            ProcessorSubscriptionStatus::Trialing if payload.is_full_discount() => {
                record.apply_status(SubscriptionStatus::Active, Some(PlanTier::Pro));
                if let Some(sub) = record.subscription.as_mut() {
                    sub.trial_end = None;
                }
            }
            ProcessorSubscriptionStatus::Trialing => {
                record.apply_status(SubscriptionStatus::Trial, Some(PlanTier::Pro));
                if let Some(sub) = record.subscription.as_mut() {
                    // The processor often sends only trial_end; an absent
                    // trial_start must not erase the one recorded at checkout.
                    if let Some(start) = payload.trial_start {
                        sub.trial_start = Some(processor_secs_to_ms(start));
                    }
                    sub.trial_end = payload.trial_end.map(processor_secs_to_ms);
                }
            }
            ProcessorSubscriptionStatus::Active => {
                // trialEnd deliberately untouched
                record.apply_status(SubscriptionStatus::Active, Some(PlanTier::Pro));
            }
            ProcessorSubscriptionStatus::Canceled
            | ProcessorSubscriptionStatus::IncompleteExpired => {
                record.apply_status(SubscriptionStatus::Cancelled, Some(PlanTier::Free));
            }
            ProcessorSubscriptionStatus::PastDue => {
                // plan is not downgraded on past_due
                record.apply_status(SubscriptionStatus::PastDue, None);
            }
            other => {
                tracing::debug!(
                    processor_status = ?other,
                    "Subscription status has no transition; recording ids only"
                );
            }
        }

        if record.subscription_status != SubscriptionStatus::None {
            record.mark_subscription_started(now_ms);
        }
        record.touch(now_ms);
    }

    /// customer.subscription.deleted
    pub fn apply_subscription_deleted(
        record: &mut AccountRecord,
        _payload: &SubscriptionPayload,
        now_ms: i64,
    ) {
        record.apply_status(SubscriptionStatus::Cancelled, Some(PlanTier::Free));
        record.touch(now_ms);
    }

    /// customer.deleted
    ///
    /// Clears the legacy top-level identifier fields. The nested subscription
    /// record keeps its processor ids.
    pub fn apply_customer_deleted(record: &mut AccountRecord, now_ms: i64) {
        record.stripe_customer_id = None;
        record.stripe_subscription_id = None;
        record.touch(now_ms);
    }

    /// invoice.payment_succeeded: records the payment time, status untouched.
    pub fn apply_payment_succeeded(record: &mut AccountRecord, now_ms: i64) {
        record.last_payment_at = Some(now_ms);
        let sub = record.subscription.get_or_insert_with(Default::default);
        sub.last_payment_at = Some(now_ms);
        record.touch(now_ms);
    }

    /// invoice.payment_failed: past_due, plan untouched.
    pub fn apply_payment_failed(record: &mut AccountRecord, now_ms: i64) {
        record.apply_status(SubscriptionStatus::PastDue, None);
        record.touch(now_ms);
    }
}

pub struct SubscriptionService {
    store: Arc<dyn RecordStore>,
    index: CustomerIndex,
    telemetry: Arc<dyn TelemetrySink>,
}

impl SubscriptionService {
    pub fn new(store: Arc<dyn RecordStore>, telemetry: Arc<dyn TelemetrySink>) -> Self {
        let index = CustomerIndex::new(Arc::clone(&store));
        Self {
            store,
            index,
            telemetry,
        }
    }

    pub fn customer_index(&self) -> &CustomerIndex {
        &self.index
    }

    pub async fn handle_checkout_completed(&self, payload: &CheckoutPayload) -> BillingResult<()> {
        let account_id = match payload.client_reference_id.as_deref() {
            Some(id) => id.to_string(),
            None => self.resolve(&payload.customer).await?,
        };

        // First association of this customer id with an account: write the
        // index record before touching the account itself.
        self.index.bind(&payload.customer, &account_id).await?;

        let now = now_ms();
        self.mutate(&account_id, &payload.customer, |record| {
            transitions::apply_checkout_completed(record, payload, now)
        })
        .await?;

        self.telemetry
            .emit(
                &account_id,
                "billing.checkout_completed",
                json!({
                    "customerId": payload.customer,
                    "amountTotal": payload.amount_total,
                    "discountApplied": payload.discount_applied(),
                }),
            )
            .await;

        tracing::info!(
            account_id = %account_id,
            customer_id = %payload.customer,
            amount_total = payload.amount_total,
            "Checkout completed"
        );
        Ok(())
    }

    pub async fn handle_subscription_created(
        &self,
        payload: &SubscriptionPayload,
    ) -> BillingResult<()> {
        self.sync_subscription(payload, "billing.subscription_created")
            .await
    }

    pub async fn handle_subscription_updated(
        &self,
        payload: &SubscriptionPayload,
    ) -> BillingResult<()> {
        self.sync_subscription(payload, "billing.subscription_updated")
            .await
    }

    async fn sync_subscription(
        &self,
        payload: &SubscriptionPayload,
        telemetry_kind: &str,
    ) -> BillingResult<()> {
        let account_id = self.resolve(&payload.customer).await?;
        let now = now_ms();
        self.mutate(&account_id, &payload.customer, |record| {
            transitions::apply_subscription_update(record, payload, now)
        })
        .await?;

        self.telemetry
            .emit(
                &account_id,
                telemetry_kind,
                json!({
                    "subscriptionId": payload.id,
                    "processorStatus": format!("{:?}", payload.status),
                    "discountPercent": payload.discount_percent(),
                }),
            )
            .await;

        tracing::info!(
            account_id = %account_id,
            subscription_id = %payload.id,
            processor_status = ?payload.status,
            "Subscription synced"
        );
        Ok(())
    }

    pub async fn handle_subscription_deleted(
        &self,
        payload: &SubscriptionPayload,
    ) -> BillingResult<()> {
        let account_id = self.resolve(&payload.customer).await?;
        let now = now_ms();
        self.mutate(&account_id, &payload.customer, |record| {
            transitions::apply_subscription_deleted(record, payload, now)
        })
        .await?;

        self.telemetry
            .emit(
                &account_id,
                "billing.subscription_deleted",
                json!({ "subscriptionId": payload.id }),
            )
            .await;

        tracing::info!(
            account_id = %account_id,
            subscription_id = %payload.id,
            "Subscription deleted, downgraded to free"
        );
        Ok(())
    }

    pub async fn handle_customer_created(&self, payload: &CustomerPayload) -> BillingResult<()> {
        match payload.account_id() {
            Some(account_id) => {
                self.index.bind(&payload.id, account_id).await?;
                tracing::info!(
                    account_id = %account_id,
                    customer_id = %payload.id,
                    "Customer created and bound"
                );
            }
            None => {
                tracing::warn!(
                    customer_id = %payload.id,
                    "Customer created without account metadata; nothing to bind"
                );
            }
        }
        Ok(())
    }

    pub async fn handle_customer_deleted(&self, payload: &CustomerPayload) -> BillingResult<()> {
        let account_id = self.resolve(&payload.id).await?;
        let now = now_ms();
        self.mutate(&account_id, &payload.id, |record| {
            transitions::apply_customer_deleted(record, now)
        })
        .await?;

        tracing::info!(
            account_id = %account_id,
            customer_id = %payload.id,
            "Customer deleted; legacy processor ids cleared"
        );
        Ok(())
    }

    pub async fn handle_payment_succeeded(&self, payload: &PaymentPayload) -> BillingResult<()> {
        let account_id = self.resolve(&payload.customer).await?;
        let now = now_ms();
        self.mutate(&account_id, &payload.customer, |record| {
            transitions::apply_payment_succeeded(record, now)
        })
        .await?;

        self.telemetry
            .emit(
                &account_id,
                "billing.payment_succeeded",
                json!({ "amountPaid": payload.amount_paid }),
            )
            .await;
        Ok(())
    }

    pub async fn handle_payment_failed(&self, payload: &PaymentPayload) -> BillingResult<()> {
        let account_id = self.resolve(&payload.customer).await?;
        let now = now_ms();
        self.mutate(&account_id, &payload.customer, |record| {
            transitions::apply_payment_failed(record, now)
        })
        .await?;

        self.telemetry
            .emit(
                &account_id,
                "billing.payment_failed",
                json!({ "amountDue": payload.amount_due }),
            )
            .await;

        tracing::warn!(
            account_id = %account_id,
            customer_id = %payload.customer,
            "Payment failed; subscription marked past_due"
        );
        Ok(())
    }

    async fn resolve(&self, customer_id: &str) -> BillingResult<String> {
        self.index
            .lookup(customer_id)
            .await?
            .ok_or_else(|| BillingError::UnknownAccount {
                customer_id: customer_id.to_string(),
            })
    }

    /// Read-modify-write on an account record with the shared compare-and-swap
    /// retry discipline. A version conflict re-reads and re-applies the
    /// transition; a missing or unreadable record is surfaced, not invented.
    async fn mutate<F>(
        &self,
        account_id: &str,
        customer_id: &str,
        transition: F,
    ) -> BillingResult<()>
    where
        F: Fn(&mut AccountRecord),
    {
        let key = account_key(account_id);
        let mut codec_error: Option<serde_json::Error> = None;
        let mut drift_detected = false;

        let written = update_with_retry(
            self.store.as_ref(),
            &key,
            DEFAULT_CAS_ATTEMPTS,
            |current| {
                let current = current?;
                let mut record: AccountRecord = match serde_json::from_value(current.value.clone())
                {
                    Ok(record) => record,
                    Err(err) => {
                        codec_error = Some(err);
                        return None;
                    }
                };

                transition(&mut record);

                if !record.mirrors_consistent() {
                    drift_detected = true;
                }

                match serde_json::to_value(&record) {
                    Ok(value) => Some(value),
                    Err(err) => {
                        codec_error = Some(err);
                        None
                    }
                }
            },
        )
        .await?;

        if let Some(err) = codec_error {
            return Err(StoreError::Serialization(err).into());
        }
        if drift_detected {
            // Should be unreachable: apply_status writes both mirrors.
            tracing::error!(
                account_id = %account_id,
                "Dual-write drift after transition; mirrors disagree"
            );
        }
        if written.is_none() {
            return Err(BillingError::UnknownAccount {
                customer_id: customer_id.to_string(),
            });
        }
        Ok(())
    }
}
