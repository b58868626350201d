//! HTTP surface and the per-request admission lifecycle.
//!
//! The lifecycle middleware owns both hooks of the request machine:
//! request-id assignment and timing on the way in, response headers,
//! metrics and the audit emit on the way out. Admission decisions happen
//! in the chat-completions handler between the two hooks.

pub mod admin;

use std::collections::HashMap;
use std::sync::{Arc, Mutex};
use std::time::Instant;

use axum::extract::{DefaultBodyLimit, Request, State};
use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use axum::routing::{get, post};
use axum::{Extension, Json, Router};
use bytes::Bytes;
use chrono::{Duration as ChronoDuration, Utc};
use serde::{Deserialize, Serialize};
use serde_json::json;
use tracing::{error, info_span, Instrument};

use crate::analyzer::{AnalyzerError, ContentAnalyzer};
use crate::audit::{AuditLogger, AuditPatch, AuditStore, BlockReason, NewAuditEntry};
use crate::config::FirewallConfig;
use crate::digest::Digester;
use crate::error::{ErrorBody, ErrorKind};
use crate::metrics::{FirewallMetrics, MetricsConfig};
use crate::rate_limit::{RateLimitDecision, RateLimiter};

/// Everything a request handler can reach. One construction site in the
/// binary; clones are cheap Arc bumps.
#[derive(Clone)]
pub struct FirewallState {
    config: Arc<FirewallConfig>,
    digester: Digester,
    limiter: Arc<RateLimiter>,
    analyzer: Arc<dyn ContentAnalyzer>,
    audit_store: Arc<dyn AuditStore>,
    audit_logger: Arc<AuditLogger>,
    metrics: Arc<Mutex<FirewallMetrics>>,
    started_at: Instant,
}

impl FirewallState {
    pub fn new(
        config: FirewallConfig,
        limiter: RateLimiter,
        analyzer: Arc<dyn ContentAnalyzer>,
        audit_store: Arc<dyn AuditStore>,
        audit_logger: AuditLogger,
    ) -> Self {
        let digester = Digester::new(config.security.hash_salt.clone());
        Self {
            config: Arc::new(config),
            digester,
            limiter: Arc::new(limiter),
            analyzer,
            audit_store,
            audit_logger: Arc::new(audit_logger),
            metrics: Arc::new(Mutex::new(FirewallMetrics::default())),
            started_at: Instant::now(),
        }
    }

    pub fn with_metrics_config(mut self, config: MetricsConfig) -> Self {
        self.metrics = Arc::new(Mutex::new(FirewallMetrics::new(config)));
        self
    }

    pub fn config(&self) -> &FirewallConfig {
        &self.config
    }

    pub fn audit_logger(&self) -> &AuditLogger {
        &self.audit_logger
    }

    pub fn analyzer(&self) -> &Arc<dyn ContentAnalyzer> {
        &self.analyzer
    }

    pub fn audit_store(&self) -> &Arc<dyn AuditStore> {
        &self.audit_store
    }

    pub fn limiter(&self) -> &Arc<RateLimiter> {
        &self.limiter
    }

    /// Metrics are guarded by a plain mutex: every critical section is
    /// synchronous and short, so recording never suspends a request task.
    fn lock_metrics(&self) -> std::sync::MutexGuard<'_, FirewallMetrics> {
        self.metrics.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

/// Per-request state, created by the lifecycle middleware and destroyed
/// after the audit enqueue. Raw identifiers live here only long enough to
/// reach the analyzer metadata; nothing raw survives into the audit row.
#[derive(Clone)]
pub struct RequestContext {
    pub request_id: String,
    pub started: Instant,
    pub client_ip: String,
    pub user_agent: Option<String>,
    pub client_ip_hash: String,
    pub user_agent_hash: Option<String>,
    pub api_key_hash: Option<String>,
    pub patch: Arc<std::sync::Mutex<AuditPatch>>,
}

impl RequestContext {
    fn from_request(state: &FirewallState, request: &Request) -> Self {
        let headers = request.headers();
        let request_id = header_value(headers, "x-request-id")
            .filter(|value| !value.is_empty())
            .unwrap_or_else(|| uuid::Uuid::new_v4().to_string());

        let client_ip = header_value(headers, "x-forwarded-for")
            .map(|raw| raw.split(',').next().unwrap_or("").trim().to_string())
            .filter(|ip| !ip.is_empty())
            .or_else(|| header_value(headers, "x-real-ip"))
            .unwrap_or_else(|| "unknown".to_string());
        let user_agent = header_value(headers, "user-agent");
        let api_key = bearer_token(headers);

        let client_ip_hash = state
            .digester
            .digest(Some(&client_ip))
            .unwrap_or_else(|| "unknown".to_string());
        let user_agent_hash = state.digester.digest(user_agent.as_deref());
        let api_key_hash = state.digester.digest(api_key.as_deref());

        Self {
            request_id,
            started: Instant::now(),
            client_ip,
            user_agent,
            client_ip_hash,
            user_agent_hash,
            api_key_hash,
            patch: Arc::new(std::sync::Mutex::new(AuditPatch::default())),
        }
    }

    fn patch(&self) -> std::sync::MutexGuard<'_, AuditPatch> {
        self.patch.lock().unwrap_or_else(|poisoned| poisoned.into_inner())
    }
}

fn header_value(headers: &HeaderMap, name: &str) -> Option<String> {
    headers
        .get(name)
        .and_then(|value| value.to_str().ok())
        .map(|value| value.to_string())
}

fn bearer_token(headers: &HeaderMap) -> Option<String> {
    let raw = header_value(headers, "authorization")?;
    let token = raw.strip_prefix("Bearer ").or_else(|| raw.strip_prefix("bearer "))?;
    let token = token.trim();
    (!token.is_empty()).then(|| token.to_string())
}

pub fn router(state: FirewallState) -> Router {
    let body_limit = state.config.security.max_content_length.saturating_add(1024);

    let mut router = Router::new()
        .route("/health", get(health))
        .route("/ready", get(ready))
        .route("/v1/chat/completions", post(chat_completions))
        .route("/v1/models", get(list_models))
        .route("/metrics", get(render_metrics));

    if state.config.admin_token.is_some() {
        router = router.merge(admin::router());
    }

    router
        .fallback(fallback)
        .layer(axum::middleware::from_fn_with_state(
            state.clone(),
            lifecycle,
        ))
        .layer(DefaultBodyLimit::max(body_limit))
        .with_state(state)
}

/// OnRequest / OnResponse hooks for every route. `/health` is the liveness
/// probe: it keeps the header contract but is never audited.
async fn lifecycle(State(state): State<FirewallState>, mut request: Request, next: Next) -> Response {
    let method = request.method().to_string();
    let path = request.uri().path().to_string();
    let request_bytes = header_value(request.headers(), "content-length")
        .and_then(|raw| raw.parse::<i64>().ok())
        .unwrap_or(0);

    let ctx = RequestContext::from_request(&state, &request);
    request.extensions_mut().insert(ctx.clone());

    let span = info_span!(
        "request",
        request_id = %ctx.request_id,
        method = %method,
        path = %path,
    );
    let mut response = next.run(request).instrument(span).await;

    let latency = ctx.started.elapsed();
    let status = response.status().as_u16();

    if let Ok(value) = HeaderValue::from_str(&ctx.request_id) {
        response.headers_mut().insert("x-request-id", value);
    }
    if let Ok(value) = HeaderValue::from_str(&format!("{}ms", latency.as_millis())) {
        response.headers_mut().insert("x-response-time", value);
    }

    {
        let mut metrics = state.lock_metrics();
        metrics.record_request(&path, &method, status);
        metrics.observe_latency(&path, &method, latency);
    }

    if path == "/health" || !state.config.features.audit_logging {
        return response;
    }

    let response_bytes = header_value(response.headers(), "content-length")
        .and_then(|raw| raw.parse::<i64>().ok())
        .unwrap_or(0);

    let patch = ctx.patch().clone();
    let ts = Utc::now();
    let entry = NewAuditEntry {
        request_id: ctx.request_id.clone(),
        ts,
        method,
        path,
        client_ip_hash: ctx.client_ip_hash.clone(),
        user_agent_hash: ctx.user_agent_hash.clone(),
        api_key_hash: ctx.api_key_hash.clone(),
        request_bytes,
        response_status: i32::from(status),
        response_bytes,
        latency_ms: latency.as_millis() as i64,
        is_blocked: patch.is_blocked,
        block_reason: patch.block_reason,
        detected_issues_count: patch.detected_issues_count,
        security_confidence: patch.security_confidence,
        llm_provider: patch.llm_provider,
        llm_model: patch.llm_model,
        metadata: serde_json::Value::Object(patch.metadata),
        retention_until: ts + ChronoDuration::days(state.config.audit.retention_days),
    };
    state.audit_logger.log(entry).await;

    response
}

#[derive(Clone, Copy, Debug, Deserialize, Serialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Deserialize)]
struct ChatMessage {
    role: Role,
    content: String,
    #[serde(default)]
    #[allow(dead_code)]
    name: Option<String>,
}

#[derive(Debug, Deserialize)]
struct ChatCompletionRequest {
    #[serde(default)]
    model: Option<String>,
    #[serde(default)]
    messages: Vec<ChatMessage>,
    #[serde(default)]
    temperature: Option<f64>,
    #[serde(default)]
    max_tokens: Option<i64>,
    #[serde(default)]
    #[allow(dead_code)]
    stream: Option<bool>,
}

const REDACTED_PREVIEW_CHARS: usize = 100;

/// The admission path: rate-limit → validate → analyze → forward.
async fn chat_completions(
    State(state): State<FirewallState>,
    Extension(ctx): Extension<RequestContext>,
    body: Bytes,
) -> Response {
    let path = "/v1/chat/completions";

    // Step 2: tier cascade. The decision's headers ride on whatever
    // response this request ends up with.
    let decision = if state.config.features.rate_limiting {
        Some(
            state
                .limiter
                .check(&ctx.client_ip_hash, ctx.api_key_hash.as_deref())
                .await,
        )
    } else {
        None
    };

    if let Some(denied) = decision.as_ref().filter(|decision| !decision.allowed) {
        ctx.patch().blocked(BlockReason::RateLimit);
        {
            let mut metrics = state.lock_metrics();
            metrics.record_rate_limit_violation(denied.tier.as_str());
            metrics.record_blocked(BlockReason::RateLimit.as_str(), path);
        }

        let body = ErrorBody::new(
            ErrorKind::RateLimitExceeded,
            "rate limit exceeded, retry later",
            &ctx.request_id,
        )
        .with_details(json!({
            "tier": denied.tier.as_str(),
            "retry_after_secs": denied.retry_after_secs,
        }));
        let mut response = body.into_response();
        apply_rate_limit_headers(&mut response, denied);
        return response;
    }

    // Step 3: body validation.
    let payload = match validate_body(&state, &ctx, &body) {
        Ok(payload) => payload,
        Err(response) => return finish(response, decision.as_ref()),
    };

    if let Some(model) = payload.model.as_deref() {
        ctx.patch().llm_model = Some(model.to_string());
    }

    // Step 4: analyzer verdict.
    if state.config.features.content_analysis {
        let content = payload
            .messages
            .iter()
            .filter(|message| message.role == Role::User)
            .map(|message| message.content.as_str())
            .collect::<Vec<_>>()
            .join("\n");

        let mut metadata = HashMap::new();
        metadata.insert("client_ip".to_string(), ctx.client_ip.clone());
        if let Some(user_agent) = ctx.user_agent.as_deref() {
            metadata.insert("user_agent".to_string(), user_agent.to_string());
        }
        if let Some(model) = payload.model.as_deref() {
            metadata.insert("model".to_string(), model.to_string());
        }

        let verdict = state
            .analyzer
            .check_content(&content, &ctx.request_id, metadata)
            .await;

        match verdict {
            Ok(verdict) if !verdict.is_safe => {
                {
                    let mut patch = ctx.patch();
                    patch.blocked(BlockReason::ContentPolicyViolation);
                    patch.detected_issues_count = verdict.issues.len() as i32;
                    patch.security_confidence = Some(f64::from(verdict.confidence));
                }
                {
                    let mut metrics = state.lock_metrics();
                    metrics.record_blocked(BlockReason::ContentPolicyViolation.as_str(), path);
                    for issue in &verdict.issues {
                        metrics.record_detected_issue(&issue.kind);
                    }
                }

                let preview = verdict
                    .redacted_text
                    .as_deref()
                    .map(|text| truncate_chars(text, REDACTED_PREVIEW_CHARS));
                let body = ErrorBody::new(
                    ErrorKind::ContentPolicyViolation,
                    "request blocked by content policy",
                    &ctx.request_id,
                )
                .with_details(json!({
                    "detected_issues": verdict.issues,
                    "redacted_preview": preview,
                }));
                return finish(body.into_response(), decision.as_ref());
            }
            Ok(_verdict) => {}
            Err(AnalyzerError::InvalidArgument(message)) => {
                error!(request_id = %ctx.request_id, %message, "analyzer rejected gateway request");
                let body = ErrorBody::new(
                    ErrorKind::InternalServerError,
                    "content analysis failed",
                    &ctx.request_id,
                );
                return finish(body.into_response(), decision.as_ref());
            }
            Err(err) => {
                // Fail closed: unanalyzed content is never admitted.
                error!(request_id = %ctx.request_id, error = %err, "analyzer unreachable");
                let body = ErrorBody::new(
                    ErrorKind::ServiceUnavailableError,
                    "content analyzer unavailable",
                    &ctx.request_id,
                );
                return finish(body.into_response(), decision.as_ref());
            }
        }
    }

    // Step 5: forwarding placeholder until an upstream client is wired.
    let body = ErrorBody::new(
        ErrorKind::NotImplementedError,
        "upstream forwarding is not configured",
        &ctx.request_id,
    );
    finish(body.into_response(), decision.as_ref())
}

fn validate_body(
    state: &FirewallState,
    ctx: &RequestContext,
    body: &Bytes,
) -> Result<ChatCompletionRequest, Response> {
    let invalid = |message: &str, details: Option<serde_json::Value>| {
        let mut body = ErrorBody::new(ErrorKind::ValidationError, message, &ctx.request_id);
        if let Some(details) = details {
            body = body.with_details(details);
        }
        body.into_response()
    };

    let payload: ChatCompletionRequest = serde_json::from_slice(body)
        .map_err(|err| invalid("malformed request body", Some(json!({"parse": err.to_string()}))))?;

    if payload.messages.is_empty() {
        return Err(invalid(
            "messages array is required and must not be empty",
            None,
        ));
    }
    if let Some(temperature) = payload.temperature {
        if !(0.0..=2.0).contains(&temperature) {
            return Err(invalid(
                "temperature must be between 0 and 2",
                Some(json!({"temperature": temperature})),
            ));
        }
    }
    if let Some(max_tokens) = payload.max_tokens {
        if max_tokens < 1 {
            return Err(invalid(
                "max_tokens must be at least 1",
                Some(json!({"max_tokens": max_tokens})),
            ));
        }
    }

    let total_content_length: usize = payload
        .messages
        .iter()
        .map(|message| message.content.len())
        .sum();
    let min = state.config.security.min_content_length;
    let max = state.config.security.max_content_length;
    if total_content_length < min || total_content_length > max {
        return Err(invalid(
            "content length out of bounds",
            Some(json!({
                "content_length": total_content_length,
                "min": min,
                "max": max,
            })),
        ));
    }

    Ok(payload)
}

fn finish(mut response: Response, decision: Option<&RateLimitDecision>) -> Response {
    if let Some(decision) = decision {
        apply_rate_limit_headers(&mut response, decision);
    }
    response
}

fn apply_rate_limit_headers(response: &mut Response, decision: &RateLimitDecision) {
    let headers = response.headers_mut();
    if let Some(limit) = decision.limit {
        if let Ok(value) = HeaderValue::from_str(&limit.to_string()) {
            headers.insert("x-ratelimit-limit", value);
        }
    }
    if let Some(remaining) = decision.remaining {
        if let Ok(value) = HeaderValue::from_str(&remaining.to_string()) {
            headers.insert("x-ratelimit-remaining", value);
        }
    }
    if let Some(reset) = decision.reset_epoch {
        if let Ok(value) = HeaderValue::from_str(&reset.to_string()) {
            headers.insert("x-ratelimit-reset", value);
        }
    }
    if let Some(retry_after) = decision.retry_after_secs {
        if let Ok(value) = HeaderValue::from_str(&retry_after.to_string()) {
            headers.insert("retry-after", value);
        }
    }
}

fn truncate_chars(text: &str, max_chars: usize) -> String {
    text.chars().take(max_chars).collect()
}

async fn health(State(state): State<FirewallState>) -> Json<serde_json::Value> {
    Json(json!({
        "status": "ok",
        "service": env!("CARGO_PKG_NAME"),
        "version": env!("CARGO_PKG_VERSION"),
        "timestamp": Utc::now().to_rfc3339(),
        "uptime_seconds": state.started_at.elapsed().as_secs(),
    }))
}

async fn ready(State(state): State<FirewallState>) -> Response {
    let analyzer_ok = match state.analyzer.health_check().await {
        Ok(health) => health.serving,
        Err(_) => false,
    };
    let audit_ok = state.audit_store.health().await;
    let rate_store_ok = state.limiter.health().await;

    let ready = analyzer_ok && audit_ok && rate_store_ok;
    let status = if ready {
        StatusCode::OK
    } else {
        StatusCode::SERVICE_UNAVAILABLE
    };

    (
        status,
        Json(json!({
            "ready": ready,
            "checks": {
                "analyzer": analyzer_ok,
                "audit_store": audit_ok,
                "rate_limit_store": rate_store_ok,
            },
        })),
    )
        .into_response()
}

async fn list_models(State(state): State<FirewallState>) -> Json<serde_json::Value> {
    let data: Vec<serde_json::Value> = state
        .config
        .models
        .iter()
        .map(|id| json!({"id": id, "object": "model", "owned_by": "organization"}))
        .collect();
    Json(json!({"object": "list", "data": data}))
}

async fn render_metrics(State(state): State<FirewallState>) -> Response {
    let rendered = {
        let metrics = state.lock_metrics();
        metrics.render(state.audit_logger.size())
    };
    (
        [("content-type", "text/plain; version=0.0.4")],
        rendered,
    )
        .into_response()
}

async fn fallback(Extension(ctx): Extension<RequestContext>) -> Response {
    ErrorBody::new(ErrorKind::NotFoundError, "no such route", &ctx.request_id).into_response()
}
