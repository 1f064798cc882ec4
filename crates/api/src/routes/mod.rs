//! Route definitions

pub mod admin;
pub mod webhooks;

use axum::routing::{get, post};
use axum::{Json, Router};
use serde_json::json;

use crate::state::AppState;

pub fn create_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/webhooks/billing", post(webhooks::receive_billing_webhook))
        .route("/admin/migrations/{kind}", post(admin::run_migration))
        .route("/admin/migrations/{kind}/stats", get(admin::migration_stats))
        .with_state(state)
}

async fn health() -> Json<serde_json::Value> {
    Json(json!({ "status": "ok" }))
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::sync::Arc;

    use axum::body::Body;
    use axum::http::{header, Request, StatusCode};
    use serde_json::Value;
    use snapdock_billing::{signature_header, BillingService, NoopTelemetry};
    use snapdock_store::{InMemoryStore, RecordStore};
    use tower::ServiceExt;

    use crate::config::Config;

    const SECRET: &str = "whsec_route_test";
    const ADMIN_TOKEN: &str = "admin-token-for-tests";

    async fn test_app() -> (Arc<InMemoryStore>, Router) {
        let store = Arc::new(InMemoryStore::new());
        store
            .seed(
                "account/acct_1",
                json!({ "email": "a@example.com", "stripeCustomerId": "cus_1" }),
            )
            .await;
        let billing = Arc::new(BillingService::new(
            Arc::clone(&store) as Arc<dyn RecordStore>,
            Some(SECRET.into()),
            Arc::new(NoopTelemetry),
        ));
        let config = Config {
            webhook_secret: Some(SECRET.into()),
            admin_token: Some(ADMIN_TOKEN.into()),
            bind_addr: "127.0.0.1:0".into(),
        };
        (store.clone(), create_router(AppState::new(billing, config)))
    }

    fn unix_now_secs() -> i64 {
        std::time::SystemTime::now()
            .duration_since(std::time::UNIX_EPOCH)
            .unwrap()
            .as_secs() as i64
    }

    async fn body_json(response: axum::response::Response) -> Value {
        let bytes = axum::body::to_bytes(response.into_body(), usize::MAX)
            .await
            .unwrap();
        serde_json::from_slice(&bytes).unwrap()
    }

    #[tokio::test]
    async fn health_responds() {
        let (_, app) = test_app().await;
        let response = app
            .oneshot(Request::get("/health").body(Body::empty()).unwrap())
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
    }

    #[tokio::test]
    async fn webhook_without_signature_header_is_rejected() {
        let (_, app) = test_app().await;
        let response = app
            .oneshot(
                Request::post("/webhooks/billing")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_with_bad_signature_is_rejected() {
        let (_, app) = test_app().await;
        let response = app
            .oneshot(
                Request::post("/webhooks/billing")
                    .header("stripe-signature", "t=1,v1=00")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }

    #[tokio::test]
    async fn webhook_without_configured_secret_is_server_error() {
        let store = Arc::new(InMemoryStore::new());
        let billing = Arc::new(BillingService::new(
            store as Arc<dyn RecordStore>,
            None,
            Arc::new(NoopTelemetry),
        ));
        let config = Config {
            webhook_secret: None,
            admin_token: None,
            bind_addr: "127.0.0.1:0".into(),
        };
        let app = create_router(AppState::new(billing, config));

        let response = app
            .oneshot(
                Request::post("/webhooks/billing")
                    .header("stripe-signature", "t=1,v1=00")
                    .body(Body::from("{}"))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::INTERNAL_SERVER_ERROR);
    }

    #[tokio::test]
    async fn signed_webhook_is_processed_and_acknowledged() {
        let (store, app) = test_app().await;
        let payload = json!({
            "id": "evt_route_1",
            "type": "invoice.payment_failed",
            "created": unix_now_secs(),
            "data": { "object": { "customer": "cus_1", "amount_due": 900 } }
        })
        .to_string();
        let header = signature_header(SECRET, unix_now_secs(), &payload).unwrap();

        let response = app
            .oneshot(
                Request::post("/webhooks/billing")
                    .header("stripe-signature", header)
                    .body(Body::from(payload))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);
        assert_eq!(body_json(response).await["received"], true);

        let record = store.get("account/acct_1").await.unwrap().unwrap();
        assert_eq!(record.value["subscriptionStatus"], "past_due");
    }

    #[tokio::test]
    async fn admin_requires_bearer_token() {
        let (_, app) = test_app().await;

        let response = app
            .clone()
            .oneshot(
                Request::post("/admin/migrations/account")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);

        let response = app
            .oneshot(
                Request::post("/admin/migrations/account")
                    .header(header::AUTHORIZATION, "Bearer wrong-token")
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::UNAUTHORIZED);
    }

    #[tokio::test]
    async fn admin_migration_run_returns_report() {
        let (_, app) = test_app().await;
        let response = app
            .oneshot(
                Request::post("/admin/migrations/account")
                    .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
                    .header(header::CONTENT_TYPE, "application/json")
                    .body(Body::from(r#"{"dryRun": false, "batchSize": 50}"#))
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let report = body_json(response).await;
        assert_eq!(report["kind"], "account");
        assert_eq!(report["migrated"], 1);
        assert_eq!(report["errors"], 0);
    }

    #[tokio::test]
    async fn admin_migration_stats_round_trip() {
        let (_, app) = test_app().await;
        let response = app
            .oneshot(
                Request::get("/admin/migrations/account/stats")
                    .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::OK);

        let stats = body_json(response).await;
        assert_eq!(stats["total"], 1);
        assert_eq!(stats["legacy"], 1);
    }

    #[tokio::test]
    async fn unknown_migration_kind_is_bad_request() {
        let (_, app) = test_app().await;
        let response = app
            .oneshot(
                Request::post("/admin/migrations/widgets")
                    .header(header::AUTHORIZATION, format!("Bearer {ADMIN_TOKEN}"))
                    .body(Body::empty())
                    .unwrap(),
            )
            .await
            .unwrap();
        assert_eq!(response.status(), StatusCode::BAD_REQUEST);
    }
}
