//! Payment-processor webhook endpoint

use axum::extract::State;
use axum::http::HeaderMap;
use axum::Json;
use serde_json::{json, Value};

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

/// `POST /webhooks/billing`
///
/// The body must be the raw payload exactly as signed; any reserialization
/// would break verification, so this handler takes `String`, not `Json`.
pub async fn receive_billing_webhook(
    State(state): State<AppState>,
    headers: HeaderMap,
    body: String,
) -> ApiResult<Json<Value>> {
    let signature = headers
        .get("stripe-signature")
        .and_then(|value| value.to_str().ok())
        .ok_or_else(|| ApiError::BadRequest("missing Stripe-Signature header".into()))?;

    state
        .billing
        .gateway()
        .handle_delivery(&body, signature)
        .await?;

    Ok(Json(json!({ "received": true })))
}
