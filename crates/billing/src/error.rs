//! Billing error types

use snapdock_store::StoreError;

pub type BillingResult<T> = Result<T, BillingError>;

#[derive(Debug, thiserror::Error)]
pub enum BillingError {
    /// Missing or unusable configuration (e.g. no webhook secret). Fails
    /// closed before any payload is processed.
    #[error("billing configuration error: {0}")]
    Configuration(String),

    /// Webhook signature did not verify. The event is rejected, not
    /// processed, and not acknowledged as success.
    #[error("webhook signature verification failed")]
    SignatureInvalid,

    /// Recognized event for a customer with no matching account. Logged
    /// no-op; the delivery is still acknowledged.
    #[error("no account found for processor customer {customer_id}")]
    UnknownAccount { customer_id: String },

    /// Recognized event kind whose payload does not match the expected shape.
    #[error("malformed event payload: {0}")]
    Payload(String),

    #[error(transparent)]
    Store(#[from] StoreError),

    /// System-level migration failure (the scan itself failed).
    #[error("migration failed: {0}")]
    Migration(String),
}

impl BillingError {
    /// Errors that must never fail the webhook delivery once the signature
    /// has been verified.
    pub fn is_acknowledgeable(&self) -> bool {
        !matches!(
            self,
            BillingError::Configuration(_) | BillingError::SignatureInvalid
        )
    }
}
