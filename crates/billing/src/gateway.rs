//! Event gateway
//!
//! Receives signed webhook payloads from the payment processor, verifies the
//! signature header against the shared secret, decodes the payload into the
//! closed event set, and dispatches to the state machine.
//!
//! Acknowledgement contract: once the signature verifies, the delivery is
//! acknowledged to the processor no matter what happens downstream —
//! otherwise the processor redelivers forever. Downstream failures are logged
//! with enough context (event id, kind, customer id) to replay manually.

use std::sync::Arc;

use hmac::{Hmac, Mac};
use sha2::Sha256;
use subtle::ConstantTimeEq;

use crate::error::{BillingError, BillingResult};
use crate::events::{decode_event, ProcessorEvent, WebhookEvent};
use crate::subscriptions::SubscriptionService;

type HmacSha256 = Hmac<Sha256>;

/// Reject deliveries whose signature timestamp is older than this.
const SIGNATURE_TOLERANCE_SECS: i64 = 300;

pub struct EventGateway {
    secret: Option<String>,
    subscriptions: Arc<SubscriptionService>,
}

impl EventGateway {
    pub fn new(secret: Option<String>, subscriptions: Arc<SubscriptionService>) -> Self {
        Self {
            secret: secret.filter(|s| !s.is_empty()),
            subscriptions,
        }
    }

    /// Verify the signature header and decode the payload.
    ///
    /// Fails closed with `Configuration` when no secret is configured and
    /// with `SignatureInvalid` when verification fails; neither is processed.
    pub fn verify(&self, payload: &str, signature_header: &str) -> BillingResult<WebhookEvent> {
        let secret = self.secret.as_deref().ok_or_else(|| {
            BillingError::Configuration("webhook verification secret is not configured".into())
        })?;

        let now = unix_now()?;
        verify_signature(secret, payload, signature_header, now)?;
        decode_event(payload)
    }

    /// Dispatch a verified event to its handler.
    pub async fn process(&self, event: &WebhookEvent) -> BillingResult<()> {
        tracing::info!(
            event_id = %event.id,
            event_kind = %event.kind,
            "Processing webhook event"
        );

        match &event.payload {
            ProcessorEvent::CheckoutCompleted(p) => {
                self.subscriptions.handle_checkout_completed(p).await
            }
            ProcessorEvent::SubscriptionCreated(p) => {
                self.subscriptions.handle_subscription_created(p).await
            }
            ProcessorEvent::SubscriptionUpdated(p) => {
                self.subscriptions.handle_subscription_updated(p).await
            }
            ProcessorEvent::SubscriptionDeleted(p) => {
                self.subscriptions.handle_subscription_deleted(p).await
            }
            ProcessorEvent::CustomerCreated(p) => {
                self.subscriptions.handle_customer_created(p).await
            }
            ProcessorEvent::CustomerDeleted(p) => {
                self.subscriptions.handle_customer_deleted(p).await
            }
            ProcessorEvent::PaymentSucceeded(p) => {
                self.subscriptions.handle_payment_succeeded(p).await
            }
            ProcessorEvent::PaymentFailed(p) => self.subscriptions.handle_payment_failed(p).await,
            ProcessorEvent::Unrecognized { kind } => {
                // Track which events have no handler; helps spot new kinds.
                tracing::info!(
                    event_id = %event.id,
                    event_kind = %kind,
                    "Unrecognized webhook event kind; acknowledging without processing"
                );
                Ok(())
            }
        }
    }

    /// Full delivery path: verify, dispatch, acknowledge.
    ///
    /// Returns `Err` only for `Configuration` and `SignatureInvalid`; every
    /// downstream failure is logged and swallowed so the delivery succeeds.
    pub async fn handle_delivery(&self, payload: &str, signature_header: &str) -> BillingResult<()> {
        let event = match self.verify(payload, signature_header) {
            Ok(event) => event,
            Err(err) if err.is_acknowledgeable() => {
                tracing::error!(error = %err, "Verified payload failed to decode; acknowledging");
                return Ok(());
            }
            Err(err) => return Err(err),
        };

        if let Err(err) = self.process(&event).await {
            match &err {
                BillingError::UnknownAccount { customer_id } => {
                    tracing::warn!(
                        event_id = %event.id,
                        event_kind = %event.kind,
                        customer_id = %customer_id,
                        "Webhook event for unknown customer; acknowledged as no-op"
                    );
                }
                _ => {
                    tracing::error!(
                        event_id = %event.id,
                        event_kind = %event.kind,
                        error = %err,
                        "Webhook handling failed; acknowledging to prevent redelivery storm"
                    );
                }
            }
        }
        Ok(())
    }
}

fn unix_now() -> BillingResult<i64> {
    let now = std::time::SystemTime::now()
        .duration_since(std::time::UNIX_EPOCH)
        .map_err(|e| BillingError::Configuration(format!("system clock error: {e}")))?;
    Ok(now.as_secs() as i64)
}

/// Verify a `t=<unix>,v1=<hex hmac>` signature header over `"{t}.{payload}"`.
fn verify_signature(
    secret: &str,
    payload: &str,
    signature_header: &str,
    now: i64,
) -> BillingResult<()> {
    // Parse the signature header: t=timestamp,v1=signature
    let mut timestamp: Option<i64> = None;
    let mut v1_signature: Option<&str> = None;

    for part in signature_header.split(',') {
        match part.split_once('=') {
            Some(("t", value)) => timestamp = value.parse().ok(),
            Some(("v1", value)) => v1_signature = Some(value),
            _ => {}
        }
    }

    let timestamp = timestamp.ok_or_else(|| {
        tracing::error!("Missing timestamp in signature header");
        BillingError::SignatureInvalid
    })?;
    let v1_signature = v1_signature.ok_or_else(|| {
        tracing::error!("Missing v1 signature in signature header");
        BillingError::SignatureInvalid
    })?;

    if (now - timestamp).abs() > SIGNATURE_TOLERANCE_SECS {
        tracing::error!(
            timestamp = timestamp,
            now = now,
            "Webhook signature timestamp outside tolerance"
        );
        return Err(BillingError::SignatureInvalid);
    }

    let expected = hex::decode(v1_signature).map_err(|_| {
        tracing::error!("Signature is not valid hex");
        BillingError::SignatureInvalid
    })?;
    let computed = compute_signature(secret, timestamp, payload)?;

    if computed.as_slice().ct_eq(expected.as_slice()).unwrap_u8() != 1 {
        tracing::error!("Webhook signature mismatch");
        return Err(BillingError::SignatureInvalid);
    }
    Ok(())
}

/// HMAC-SHA256 over `"{timestamp}.{payload}"`. The secret may carry the
/// processor's `whsec_` prefix.
pub fn compute_signature(secret: &str, timestamp: i64, payload: &str) -> BillingResult<Vec<u8>> {
    let secret_key = secret.strip_prefix("whsec_").unwrap_or(secret);
    let signed_payload = format!("{timestamp}.{payload}");

    let mut mac = HmacSha256::new_from_slice(secret_key.as_bytes())
        .map_err(|_| BillingError::Configuration("invalid webhook secret key".into()))?;
    mac.update(signed_payload.as_bytes());
    Ok(mac.finalize().into_bytes().to_vec())
}

/// Build a valid signature header; local tooling and tests.
pub fn signature_header(secret: &str, timestamp: i64, payload: &str) -> BillingResult<String> {
    let sig = compute_signature(secret, timestamp, payload)?;
    Ok(format!("t={timestamp},v1={}", hex::encode(sig)))
}

#[cfg(test)]
mod tests {
    use super::*;

    const SECRET: &str = "whsec_test_secret";
    const PAYLOAD: &str = r#"{"id":"evt_1","type":"ping","data":{"object":{}}}"#;

    #[test]
    fn round_trip_signature_verifies() {
        let now = 1_700_000_000;
        let header = signature_header(SECRET, now, PAYLOAD).unwrap();
        verify_signature(SECRET, PAYLOAD, &header, now).unwrap();
    }

    #[test]
    fn tampered_payload_is_rejected() {
        let now = 1_700_000_000;
        let header = signature_header(SECRET, now, PAYLOAD).unwrap();
        let err = verify_signature(SECRET, r#"{"id":"evt_2"}"#, &header, now).unwrap_err();
        assert!(matches!(err, BillingError::SignatureInvalid));
    }

    #[test]
    fn wrong_secret_is_rejected() {
        let now = 1_700_000_000;
        let header = signature_header("whsec_other", now, PAYLOAD).unwrap();
        let err = verify_signature(SECRET, PAYLOAD, &header, now).unwrap_err();
        assert!(matches!(err, BillingError::SignatureInvalid));
    }

    #[test]
    fn stale_timestamp_is_rejected() {
        let now = 1_700_000_000;
        let header = signature_header(SECRET, now - 301, PAYLOAD).unwrap();
        let err = verify_signature(SECRET, PAYLOAD, &header, now).unwrap_err();
        assert!(matches!(err, BillingError::SignatureInvalid));
    }

    #[test]
    fn malformed_header_is_rejected() {
        let now = 1_700_000_000;
        for header in ["", "t=abc,v1=def", "v1=00ff", "t=1700000000"] {
            let err = verify_signature(SECRET, PAYLOAD, header, now).unwrap_err();
            assert!(matches!(err, BillingError::SignatureInvalid), "{header}");
        }
    }

    #[tokio::test]
    async fn missing_secret_fails_closed() {
        use crate::telemetry::NoopTelemetry;
        use snapdock_store::InMemoryStore;

        let store = Arc::new(InMemoryStore::new());
        let subs = Arc::new(SubscriptionService::new(store, Arc::new(NoopTelemetry)));
        let gateway = EventGateway::new(None, subs);

        let err = gateway.verify(PAYLOAD, "t=1,v1=00").unwrap_err();
        assert!(matches!(err, BillingError::Configuration(_)));
    }
}
