//! Admin migration endpoints
//!
//! Bearer-token gated. The token comparison is constant-time.

use axum::extract::{Path, State};
use axum::http::{header, HeaderMap};
use axum::Json;
use snapdock_billing::{MigrationOptions, MigrationReport, MigrationStats, RecordKind};
use subtle::ConstantTimeEq;

use crate::error::{ApiError, ApiResult};
use crate::state::AppState;

fn require_admin(state: &AppState, headers: &HeaderMap) -> ApiResult<()> {
    let Some(expected) = state.config.admin_token.as_deref() else {
        tracing::warn!("Admin endpoint hit but ADMIN_TOKEN is not configured");
        return Err(ApiError::Unauthorized);
    };
    let provided = headers
        .get(header::AUTHORIZATION)
        .and_then(|value| value.to_str().ok())
        .and_then(|value| value.strip_prefix("Bearer "))
        .ok_or(ApiError::Unauthorized)?;

    if provided.as_bytes().ct_eq(expected.as_bytes()).unwrap_u8() != 1 {
        return Err(ApiError::Unauthorized);
    }
    Ok(())
}

fn parse_kind(kind: &str) -> ApiResult<RecordKind> {
    kind.parse::<RecordKind>().map_err(ApiError::BadRequest)
}

/// `POST /admin/migrations/{kind}`
///
/// Body is an optional [`MigrationOptions`] JSON object; omitted fields take
/// their defaults.
pub async fn run_migration(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
    body: Option<Json<MigrationOptions>>,
) -> ApiResult<Json<MigrationReport>> {
    require_admin(&state, &headers)?;
    let kind = parse_kind(&kind)?;
    let options = body.map(|Json(options)| options).unwrap_or_default();

    tracing::info!(kind = %kind, dry_run = options.dry_run, "Admin migration run requested");
    let report = state.billing.migrations().migrate_all(kind, &options).await;
    Ok(Json(report))
}

/// `GET /admin/migrations/{kind}/stats`
pub async fn migration_stats(
    State(state): State<AppState>,
    Path(kind): Path<String>,
    headers: HeaderMap,
) -> ApiResult<Json<MigrationStats>> {
    require_admin(&state, &headers)?;
    let kind = parse_kind(&kind)?;

    let stats = state.billing.migrations().get_stats(kind).await?;
    Ok(Json(stats))
}
