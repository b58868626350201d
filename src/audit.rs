//! Audit trail types.
//!
//! An audit entry never carries a raw identifier: IPs, user agents and API
//! keys arrive here already fingerprinted by [`crate::digest::Digester`].

pub mod queue;
pub mod store;

use std::collections::BTreeMap;

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;

pub use queue::AuditLogger;
pub use store::{AuditStore, AuditStoreError, PgAuditStore};

/// Why a request was denied.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub enum BlockReason {
    #[serde(rename = "rate-limit")]
    RateLimit,
    #[serde(rename = "content-policy-violation")]
    ContentPolicyViolation,
}

impl BlockReason {
    pub fn as_str(self) -> &'static str {
        match self {
            BlockReason::RateLimit => "rate-limit",
            BlockReason::ContentPolicyViolation => "content-policy-violation",
        }
    }
}

/// Row ready for insertion; the store assigns the id.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct NewAuditEntry {
    pub request_id: String,
    pub ts: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub client_ip_hash: String,
    pub user_agent_hash: Option<String>,
    pub api_key_hash: Option<String>,
    pub request_bytes: i64,
    pub response_status: i32,
    pub response_bytes: i64,
    pub latency_ms: i64,
    pub is_blocked: bool,
    pub block_reason: Option<BlockReason>,
    pub detected_issues_count: i32,
    pub security_confidence: Option<f64>,
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    pub metadata: Value,
    pub retention_until: DateTime<Utc>,
}

/// Persisted row.
#[derive(Clone, Debug, Serialize, Deserialize, sqlx::FromRow)]
pub struct AuditEntry {
    pub id: i64,
    pub request_id: String,
    pub ts: DateTime<Utc>,
    pub method: String,
    pub path: String,
    pub client_ip_hash: String,
    pub user_agent_hash: Option<String>,
    pub api_key_hash: Option<String>,
    pub request_bytes: i64,
    pub response_status: i32,
    pub response_bytes: i64,
    pub latency_ms: i64,
    pub is_blocked: bool,
    pub block_reason: Option<String>,
    pub detected_issues_count: i32,
    pub security_confidence: Option<f64>,
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    pub metadata: Value,
    pub retention_until: DateTime<Utc>,
}

/// Filter for the admin query endpoint. Results come back timestamp
/// descending; `limit` is clamped to 1000 by the store.
#[derive(Clone, Debug, Default, Deserialize)]
pub struct AuditFilter {
    pub from: Option<DateTime<Utc>>,
    pub to: Option<DateTime<Utc>>,
    pub client_ip_hash: Option<String>,
    pub is_blocked: Option<bool>,
    pub response_status: Option<i32>,
    pub limit: Option<i64>,
    pub offset: Option<i64>,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditStats {
    pub total_requests: i64,
    pub blocked_requests: i64,
    pub block_rate: f64,
    pub avg_latency_ms: f64,
    pub unique_callers: i64,
    pub counts_by_status: BTreeMap<String, i64>,
}

/// Fields the admission pipeline fills in as it progresses. Owned by the
/// request context; read exactly once, by the response hook, after the
/// response has been flushed.
#[derive(Clone, Debug, Default)]
pub struct AuditPatch {
    pub is_blocked: bool,
    pub block_reason: Option<BlockReason>,
    pub detected_issues_count: i32,
    pub security_confidence: Option<f64>,
    pub llm_provider: Option<String>,
    pub llm_model: Option<String>,
    pub metadata: serde_json::Map<String, Value>,
}

impl AuditPatch {
    pub fn blocked(&mut self, reason: BlockReason) {
        self.is_blocked = true;
        self.block_reason = Some(reason);
    }
}
