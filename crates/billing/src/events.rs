//! Processor event decoding
//!
//! Webhook payloads are decoded into a closed set of tagged variants at the
//! gateway boundary. Handlers never see untyped JSON: anything that does not
//! match a known shape is either a `Payload` error (recognized kind, bad
//! shape) or `Unrecognized` (unknown kind, acknowledged no-op).

use serde::Deserialize;
use serde_json::Value;

use crate::error::{BillingError, BillingResult};

/// Raw envelope as delivered by the processor.
#[derive(Debug, Deserialize)]
struct RawEvent {
    id: String,
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    created: i64,
    data: RawEventData,
}

#[derive(Debug, Deserialize)]
struct RawEventData {
    object: Value,
}

/// A verified, decoded webhook event.
#[derive(Debug, Clone)]
pub struct WebhookEvent {
    /// Processor-assigned event id, used for logging and manual replay.
    pub id: String,
    /// Original event type string.
    pub kind: String,
    /// Processor event timestamp (unix seconds).
    pub created: i64,
    pub payload: ProcessorEvent,
}

/// Closed set of recognized processor events.
#[derive(Debug, Clone)]
pub enum ProcessorEvent {
    CheckoutCompleted(CheckoutPayload),
    SubscriptionCreated(SubscriptionPayload),
    SubscriptionUpdated(SubscriptionPayload),
    SubscriptionDeleted(SubscriptionPayload),
    CustomerCreated(CustomerPayload),
    CustomerDeleted(CustomerPayload),
    PaymentSucceeded(PaymentPayload),
    PaymentFailed(PaymentPayload),
    /// Unknown kind: acknowledged, logged, never dispatched.
    Unrecognized { kind: String },
}

impl ProcessorEvent {
    pub fn name(&self) -> &str {
        match self {
            ProcessorEvent::CheckoutCompleted(_) => "checkout.session.completed",
            ProcessorEvent::SubscriptionCreated(_) => "customer.subscription.created",
            ProcessorEvent::SubscriptionUpdated(_) => "customer.subscription.updated",
            ProcessorEvent::SubscriptionDeleted(_) => "customer.subscription.deleted",
            ProcessorEvent::CustomerCreated(_) => "customer.created",
            ProcessorEvent::CustomerDeleted(_) => "customer.deleted",
            ProcessorEvent::PaymentSucceeded(_) => "invoice.payment_succeeded",
            ProcessorEvent::PaymentFailed(_) => "invoice.payment_failed",
            ProcessorEvent::Unrecognized { kind } => kind,
        }
    }
}

/// `checkout.session.completed` object.
#[derive(Debug, Clone, Deserialize)]
pub struct CheckoutPayload {
    pub customer: String,
    /// Account id the dashboard attached when creating the session.
    #[serde(default)]
    pub client_reference_id: Option<String>,
    /// Amount actually charged, in the processor's minor unit.
    #[serde(default)]
    pub amount_total: i64,
    /// Recurring subscription created by this checkout, if any.
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub total_details: Option<TotalDetails>,
    /// Discount breakdown list.
    #[serde(default)]
    pub discounts: Vec<Value>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct TotalDetails {
    #[serde(default)]
    pub amount_discount: i64,
}

impl CheckoutPayload {
    /// Whether any coupon/discount reduced the charge.
    pub fn discount_applied(&self) -> bool {
        !self.discounts.is_empty()
            || self
                .total_details
                .as_ref()
                .map(|t| t.amount_discount > 0)
                .unwrap_or(false)
    }
}

/// Processor-side subscription status strings.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProcessorSubscriptionStatus {
    Trialing,
    Active,
    PastDue,
    Canceled,
    IncompleteExpired,
    Incomplete,
    Unpaid,
    Paused,
    #[serde(other)]
    Unknown,
}

/// `customer.subscription.*` object.
#[derive(Debug, Clone, Deserialize)]
pub struct SubscriptionPayload {
    pub id: String,
    pub customer: String,
    pub status: ProcessorSubscriptionStatus,
    /// Unix seconds.
    #[serde(default)]
    pub trial_start: Option<i64>,
    #[serde(default)]
    pub trial_end: Option<i64>,
    #[serde(default)]
    pub current_period_start: Option<i64>,
    #[serde(default)]
    pub current_period_end: Option<i64>,
    #[serde(default)]
    pub discount: Option<Discount>,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Discount {
    #[serde(default)]
    pub coupon: Coupon,
}

#[derive(Debug, Clone, Default, Deserialize)]
pub struct Coupon {
    #[serde(default)]
    pub percent_off: Option<f64>,
    #[serde(default)]
    pub duration: Option<String>,
}

impl SubscriptionPayload {
    /// Coupon percentage on this subscription, if any.
    pub fn discount_percent(&self) -> Option<f64> {
        self.discount.as_ref().and_then(|d| d.coupon.percent_off)
    }

    /// A 100%-off coupon is permanent paid access, not a trial.
    pub fn is_full_discount(&self) -> bool {
        self.discount_percent()
            .map(|p| (p - 100.0).abs() < f64::EPSILON)
            .unwrap_or(false)
    }
}

/// `customer.*` object.
#[derive(Debug, Clone, Deserialize)]
pub struct CustomerPayload {
    pub id: String,
    #[serde(default)]
    pub email: Option<String>,
    #[serde(default)]
    pub metadata: serde_json::Map<String, Value>,
}

impl CustomerPayload {
    /// Account id the dashboard stamped into customer metadata at creation.
    pub fn account_id(&self) -> Option<&str> {
        self.metadata.get("accountId").and_then(|v| v.as_str())
    }
}

/// `invoice.payment_*` object.
#[derive(Debug, Clone, Deserialize)]
pub struct PaymentPayload {
    pub customer: String,
    #[serde(default)]
    pub subscription: Option<String>,
    #[serde(default)]
    pub amount_paid: Option<i64>,
    #[serde(default)]
    pub amount_due: Option<i64>,
}

/// Decode a verified payload into a [`WebhookEvent`].
///
/// A recognized kind with a malformed object is a [`BillingError::Payload`];
/// an unknown kind decodes to [`ProcessorEvent::Unrecognized`].
pub fn decode_event(payload: &str) -> BillingResult<WebhookEvent> {
    let raw: RawEvent = serde_json::from_str(payload)
        .map_err(|e| BillingError::Payload(format!("invalid event envelope: {e}")))?;

    let object = &raw.data.object;
    let payload = match raw.kind.as_str() {
        "checkout.session.completed" => ProcessorEvent::CheckoutCompleted(parse(object, &raw.kind)?),
        "customer.subscription.created" => {
            ProcessorEvent::SubscriptionCreated(parse(object, &raw.kind)?)
        }
        "customer.subscription.updated" => {
            ProcessorEvent::SubscriptionUpdated(parse(object, &raw.kind)?)
        }
        "customer.subscription.deleted" => {
            ProcessorEvent::SubscriptionDeleted(parse(object, &raw.kind)?)
        }
        "customer.created" => ProcessorEvent::CustomerCreated(parse(object, &raw.kind)?),
        "customer.deleted" => ProcessorEvent::CustomerDeleted(parse(object, &raw.kind)?),
        "invoice.payment_succeeded" => ProcessorEvent::PaymentSucceeded(parse(object, &raw.kind)?),
        "invoice.payment_failed" => ProcessorEvent::PaymentFailed(parse(object, &raw.kind)?),
        other => ProcessorEvent::Unrecognized {
            kind: other.to_string(),
        },
    };

    Ok(WebhookEvent {
        id: raw.id,
        kind: raw.kind,
        created: raw.created,
        payload,
    })
}

fn parse<T: serde::de::DeserializeOwned>(object: &Value, kind: &str) -> BillingResult<T> {
    serde_json::from_value(object.clone())
        .map_err(|e| BillingError::Payload(format!("{kind}: {e}")))
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn envelope(kind: &str, object: Value) -> String {
        json!({
            "id": "evt_1",
            "type": kind,
            "created": 1_700_000_000,
            "data": { "object": object }
        })
        .to_string()
    }

    #[test]
    fn decodes_checkout_completed() {
        let body = envelope(
            "checkout.session.completed",
            json!({
                "customer": "cus_1",
                "client_reference_id": "acct_1",
                "amount_total": 0,
                "subscription": "sub_1",
                "total_details": { "amount_discount": 0 },
                "discounts": []
            }),
        );
        let event = decode_event(&body).unwrap();
        match event.payload {
            ProcessorEvent::CheckoutCompleted(p) => {
                assert_eq!(p.customer, "cus_1");
                assert_eq!(p.subscription.as_deref(), Some("sub_1"));
                assert!(!p.discount_applied());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn decodes_full_discount_subscription() {
        let body = envelope(
            "customer.subscription.updated",
            json!({
                "id": "sub_1",
                "customer": "cus_1",
                "status": "trialing",
                "trial_end": 1_700_600_000,
                "discount": { "coupon": { "percent_off": 100.0, "duration": "forever" } }
            }),
        );
        let event = decode_event(&body).unwrap();
        match event.payload {
            ProcessorEvent::SubscriptionUpdated(p) => {
                assert_eq!(p.status, ProcessorSubscriptionStatus::Trialing);
                assert!(p.is_full_discount());
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_status_string_is_tolerated() {
        let body = envelope(
            "customer.subscription.updated",
            json!({
                "id": "sub_1",
                "customer": "cus_1",
                "status": "some_future_status"
            }),
        );
        let event = decode_event(&body).unwrap();
        match event.payload {
            ProcessorEvent::SubscriptionUpdated(p) => {
                assert_eq!(p.status, ProcessorSubscriptionStatus::Unknown);
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }

    #[test]
    fn unknown_kind_is_unrecognized() {
        let body = envelope("product.created", json!({ "id": "prod_1" }));
        let event = decode_event(&body).unwrap();
        assert!(matches!(
            event.payload,
            ProcessorEvent::Unrecognized { ref kind } if kind == "product.created"
        ));
    }

    #[test]
    fn recognized_kind_with_bad_shape_is_payload_error() {
        // subscription object missing required `customer`
        let body = envelope(
            "customer.subscription.updated",
            json!({ "id": "sub_1", "status": "active" }),
        );
        let err = decode_event(&body).unwrap_err();
        assert!(matches!(err, BillingError::Payload(_)));
    }

    #[test]
    fn metadata_account_id_is_read() {
        let body = envelope(
            "customer.created",
            json!({
                "id": "cus_1",
                "email": "a@example.com",
                "metadata": { "accountId": "acct_1" }
            }),
        );
        let event = decode_event(&body).unwrap();
        match event.payload {
            ProcessorEvent::CustomerCreated(p) => {
                assert_eq!(p.account_id(), Some("acct_1"));
            }
            other => panic!("wrong variant: {other:?}"),
        }
    }
}
