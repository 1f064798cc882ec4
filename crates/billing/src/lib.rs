// Billing crate clippy configuration
// Test code patterns (expected in test files):
#![cfg_attr(test, allow(clippy::unwrap_used))]
#![cfg_attr(test, allow(clippy::expect_used))]

//! Snapdock Billing Module
//!
//! Subscription lifecycle driven by payment-processor webhooks, plus the
//! schema migration engine for the account and snapshot records.
//!
//! ## Features
//!
//! - **Event Gateway**: Verify signed webhook deliveries and dispatch them
//! - **Subscription State Machine**: checkout, trial, renewal, dunning, cancel
//! - **Customer Index**: processor customer id to account id resolution
//! - **Migration Engine**: legacy flat schema to nested containers, batch sweep
//! - **Entitlement**: paid-feature checks with lazy trial expiry

pub mod customer_index;
pub mod entitlement;
pub mod error;
pub mod events;
pub mod gateway;
pub mod migration;
pub mod model;
pub mod subscriptions;
pub mod telemetry;


// Customer index
pub use customer_index::CustomerIndex;

// Entitlement
pub use entitlement::{effective_status, is_authorized_for_paid_features};

// Error
pub use error::{BillingError, BillingResult};

// Events
pub use events::{decode_event, ProcessorEvent, WebhookEvent};

// Gateway
pub use gateway::{signature_header, EventGateway};

// Migration
pub use migration::{
    MigrationAction, MigrationDetail, MigrationEngine, MigrationOptions, MigrationReport,
    MigrationStats,
};

// Model
pub use model::{
    AccountRecord, PlanTier, RecordKind, SnapshotRecord, SubscriptionStatus,
};

// Subscriptions
pub use subscriptions::SubscriptionService;

// Telemetry
pub use telemetry::{LoggingTelemetry, NoopTelemetry, TelemetrySink};

use std::sync::Arc;

use snapdock_store::RecordStore;

/// Everything the HTTP layer needs, wired together over one record store.
pub struct BillingService {
    gateway: EventGateway,
    subscriptions: Arc<SubscriptionService>,
    migrations: MigrationEngine,
}

impl BillingService {
    pub fn new(
        store: Arc<dyn RecordStore>,
        webhook_secret: Option<String>,
        telemetry: Arc<dyn TelemetrySink>,
    ) -> Self {
        let subscriptions = Arc::new(SubscriptionService::new(Arc::clone(&store), telemetry));
        let gateway = EventGateway::new(webhook_secret, Arc::clone(&subscriptions));
        let migrations = MigrationEngine::new(store);
        Self {
            gateway,
            subscriptions,
            migrations,
        }
    }

    pub fn gateway(&self) -> &EventGateway {
        &self.gateway
    }

    pub fn subscriptions(&self) -> &Arc<SubscriptionService> {
        &self.subscriptions
    }

    pub fn migrations(&self) -> &MigrationEngine {
        &self.migrations
    }
}
