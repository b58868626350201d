//! Operator surface: audit queries, stats, erasure, retention sweeps, and
//! rate-limit bucket maintenance. Mounted only when an admin token is
//! configured; every handler checks it.

use axum::extract::{Path, Query, State};
use axum::http::{HeaderMap, StatusCode};
use axum::response::{IntoResponse, Response};
use axum::routing::{delete, get, post};
use axum::{Extension, Json, Router};
use chrono::{DateTime, Duration as ChronoDuration, Utc};
use serde::Deserialize;
use serde_json::json;
use tracing::info;

use crate::audit::AuditFilter;
use crate::error::{ErrorBody, ErrorKind};
use crate::rate_limit::Tier;

use super::{bearer_token, header_value, FirewallState, RequestContext};

pub fn router() -> Router<FirewallState> {
    Router::new()
        .route("/admin/audit-logs", get(list_audit_logs))
        .route("/admin/audit-stats", get(audit_stats))
        .route(
            "/admin/audit-logs/client/:fingerprint",
            delete(erase_by_caller),
        )
        .route("/admin/audit-logs/cleanup", post(cleanup))
        .route(
            "/admin/rate-limits/:tier/:identifier",
            get(rate_limit_status).delete(rate_limit_reset),
        )
}

fn ensure_admin(state: &FirewallState, headers: &HeaderMap) -> Result<(), Response> {
    let expected = state.config.admin_token.as_deref().unwrap_or_default();
    let presented = header_value(headers, "x-admin-token").or_else(|| bearer_token(headers));

    if presented.as_deref() == Some(expected) && !expected.is_empty() {
        return Ok(());
    }
    Err((
        StatusCode::UNAUTHORIZED,
        Json(json!({"error": {"type": "Unauthorized", "message": "admin token required"}})),
    )
        .into_response())
}

fn storage_error(ctx: &RequestContext, err: impl std::fmt::Display) -> Response {
    ErrorBody::new(
        ErrorKind::InternalServerError,
        format!("audit store error: {err}"),
        &ctx.request_id,
    )
    .into_response()
}

#[derive(Debug, Deserialize)]
struct AuditLogsQuery {
    #[serde(default)]
    from: Option<DateTime<Utc>>,
    #[serde(default)]
    to: Option<DateTime<Utc>>,
    #[serde(default)]
    client_ip_hash: Option<String>,
    #[serde(default)]
    is_blocked: Option<bool>,
    #[serde(default)]
    response_status: Option<i32>,
    #[serde(default)]
    limit: Option<i64>,
    #[serde(default)]
    offset: Option<i64>,
}

async fn list_audit_logs(
    State(state): State<FirewallState>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    Query(query): Query<AuditLogsQuery>,
) -> Response {
    if let Err(denied) = ensure_admin(&state, &headers) {
        return denied;
    }

    let filter = AuditFilter {
        from: query.from,
        to: query.to,
        client_ip_hash: query.client_ip_hash,
        is_blocked: query.is_blocked,
        response_status: query.response_status,
        limit: query.limit,
        offset: query.offset,
    };

    match state.audit_store.query(&filter).await {
        Ok(entries) => Json(json!({"count": entries.len(), "entries": entries})).into_response(),
        Err(err) => storage_error(&ctx, err),
    }
}

#[derive(Debug, Deserialize)]
struct StatsQuery {
    #[serde(default)]
    from: Option<DateTime<Utc>>,
    #[serde(default)]
    to: Option<DateTime<Utc>>,
}

async fn audit_stats(
    State(state): State<FirewallState>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    Query(query): Query<StatsQuery>,
) -> Response {
    if let Err(denied) = ensure_admin(&state, &headers) {
        return denied;
    }

    let to = query.to.unwrap_or_else(Utc::now);
    let from = query.from.unwrap_or(to - ChronoDuration::hours(24));

    match state.audit_store.stats_over(from, to).await {
        Ok(stats) => Json(stats).into_response(),
        Err(err) => storage_error(&ctx, err),
    }
}

async fn erase_by_caller(
    State(state): State<FirewallState>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    Path(fingerprint): Path<String>,
) -> Response {
    if let Err(denied) = ensure_admin(&state, &headers) {
        return denied;
    }

    match state.audit_store.erase_by_caller(&fingerprint).await {
        Ok(deleted) => {
            info!(deleted, "erased audit entries for caller");
            Json(json!({
                "deleted_count": deleted,
                "client_ip_hash": fingerprint,
            }))
            .into_response()
        }
        Err(err) => storage_error(&ctx, err),
    }
}

async fn cleanup(
    State(state): State<FirewallState>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
) -> Response {
    if let Err(denied) = ensure_admin(&state, &headers) {
        return denied;
    }

    match state.audit_store.sweep_expired().await {
        Ok(deleted) => {
            info!(deleted, "retention sweep complete");
            Json(json!({"deleted_count": deleted})).into_response()
        }
        Err(err) => storage_error(&ctx, err),
    }
}

fn parse_tier(ctx: &RequestContext, raw: &str) -> Result<Tier, Response> {
    raw.parse::<Tier>().map_err(|message| {
        ErrorBody::new(ErrorKind::ValidationError, message, &ctx.request_id).into_response()
    })
}

async fn rate_limit_status(
    State(state): State<FirewallState>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    Path((tier, identifier)): Path<(String, String)>,
) -> Response {
    if let Err(denied) = ensure_admin(&state, &headers) {
        return denied;
    }
    let tier = match parse_tier(&ctx, &tier) {
        Ok(tier) => tier,
        Err(response) => return response,
    };

    match state.limiter.status(tier, &identifier).await {
        Ok(status) => Json(status).into_response(),
        Err(err) => ErrorBody::new(
            ErrorKind::ServiceUnavailableError,
            format!("rate limit store error: {err}"),
            &ctx.request_id,
        )
        .into_response(),
    }
}

async fn rate_limit_reset(
    State(state): State<FirewallState>,
    Extension(ctx): Extension<RequestContext>,
    headers: HeaderMap,
    Path((tier, identifier)): Path<(String, String)>,
) -> Response {
    if let Err(denied) = ensure_admin(&state, &headers) {
        return denied;
    }
    let tier = match parse_tier(&ctx, &tier) {
        Ok(tier) => tier,
        Err(response) => return response,
    };

    match state.limiter.reset(tier, &identifier).await {
        Ok(deleted) => Json(json!({"deleted_buckets": deleted})).into_response(),
        Err(err) => ErrorBody::new(
            ErrorKind::ServiceUnavailableError,
            format!("rate limit store error: {err}"),
            &ctx.request_id,
        )
        .into_response(),
    }
}
