//! Telemetry sink
//!
//! Fire-and-forget event emission. The sink is an explicit collaborator
//! injected into the services that need it; there is no lazily-constructed
//! module-level client. Sink failures are the implementation's problem to
//! log and must never abort a billing transition.

use async_trait::async_trait;
use serde_json::Value;

#[async_trait]
pub trait TelemetrySink: Send + Sync {
    /// Emit one telemetry event. Implementations swallow and log their own
    /// failures; callers never inspect a result.
    async fn emit(&self, account_id: &str, event_kind: &str, payload: Value);
}

/// Sink that writes events to the trace log. Default for deployments without
/// an analytics backend configured.
#[derive(Debug, Default, Clone)]
pub struct LoggingTelemetry;

#[async_trait]
impl TelemetrySink for LoggingTelemetry {
    async fn emit(&self, account_id: &str, event_kind: &str, payload: Value) {
        tracing::debug!(
            account_id = %account_id,
            event_kind = %event_kind,
            payload = %payload,
            "telemetry event"
        );
    }
}

/// Sink that drops everything. Test default.
#[derive(Debug, Default, Clone)]
pub struct NoopTelemetry;

#[async_trait]
impl TelemetrySink for NoopTelemetry {
    async fn emit(&self, _account_id: &str, _event_kind: &str, _payload: Value) {}
}

/// Capturing sink for assertions in tests.
#[derive(Debug, Default)]
pub struct CapturingTelemetry {
    events: tokio::sync::Mutex<Vec<(String, String, Value)>>,
}

impl CapturingTelemetry {
    pub fn new() -> Self {
        Self::default()
    }

    pub async fn events(&self) -> Vec<(String, String, Value)> {
        self.events.lock().await.clone()
    }
}

#[async_trait]
impl TelemetrySink for CapturingTelemetry {
    async fn emit(&self, account_id: &str, event_kind: &str, payload: Value) {
        self.events
            .lock()
            .await
            .push((account_id.to_string(), event_kind.to_string(), payload));
    }
}
