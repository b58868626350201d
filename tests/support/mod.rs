//! In-memory doubles for the gateway's three external dependencies.

#![allow(dead_code)]

use std::collections::{BTreeMap, HashMap};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};

use chrono::{DateTime, Utc};
use llm_firewall::analyzer::{
    AnalyzerError, AnalyzerHealth, ContentAnalyzer, DetectedIssue, Verdict,
};
use llm_firewall::audit::{
    AuditEntry, AuditFilter, AuditLogger, AuditStats, AuditStore, AuditStoreError, NewAuditEntry,
};
use llm_firewall::config::FirewallConfig;
use llm_firewall::rate_limit::{CounterStore, RateLimiter, RateStoreError};
use llm_firewall::FirewallState;

#[derive(Clone, Debug)]
pub enum AnalyzerBehavior {
    Safe { confidence: f32 },
    Unsafe {
        issues: Vec<DetectedIssue>,
        confidence: f32,
        redacted: Option<String>,
    },
    Unavailable,
    InvalidArgument,
}

pub struct MockAnalyzer {
    pub behavior: Mutex<AnalyzerBehavior>,
    pub calls: AtomicUsize,
    pub serving: AtomicBool,
}

impl MockAnalyzer {
    pub fn safe() -> Self {
        Self::with_behavior(AnalyzerBehavior::Safe { confidence: 0.99 })
    }

    pub fn with_behavior(behavior: AnalyzerBehavior) -> Self {
        Self {
            behavior: Mutex::new(behavior),
            calls: AtomicUsize::new(0),
            serving: AtomicBool::new(true),
        }
    }

    pub fn set_behavior(&self, behavior: AnalyzerBehavior) {
        *self.behavior.lock().unwrap() = behavior;
    }
}

#[async_trait::async_trait]
impl ContentAnalyzer for MockAnalyzer {
    async fn check_content(
        &self,
        _content: &str,
        _request_id: &str,
        _metadata: HashMap<String, String>,
    ) -> Result<Verdict, AnalyzerError> {
        self.calls.fetch_add(1, Ordering::Relaxed);
        match self.behavior.lock().unwrap().clone() {
            AnalyzerBehavior::Safe { confidence } => Ok(Verdict {
                is_safe: true,
                redacted_text: None,
                issues: Vec::new(),
                confidence,
            }),
            AnalyzerBehavior::Unsafe {
                issues,
                confidence,
                redacted,
            } => Ok(Verdict {
                is_safe: false,
                redacted_text: redacted,
                issues,
                confidence,
            }),
            AnalyzerBehavior::Unavailable => {
                Err(AnalyzerError::Unavailable("analyzer stopped".to_string()))
            }
            AnalyzerBehavior::InvalidArgument => {
                Err(AnalyzerError::InvalidArgument("empty content".to_string()))
            }
        }
    }

    async fn health_check(&self) -> Result<AnalyzerHealth, AnalyzerError> {
        if !self.serving.load(Ordering::Relaxed) {
            return Err(AnalyzerError::Unavailable("analyzer stopped".to_string()));
        }
        Ok(AnalyzerHealth {
            serving: true,
            version: "test".to_string(),
            uptime_seconds: 1,
        })
    }
}

#[derive(Default)]
pub struct MemoryCounterStore {
    pub buckets: Mutex<HashMap<String, u64>>,
    pub fail: AtomicBool,
}

#[async_trait::async_trait]
impl CounterStore for MemoryCounterStore {
    async fn increment_and_ttl(
        &self,
        key: &str,
        window_secs: u64,
    ) -> Result<(u64, i64), RateStoreError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(RateStoreError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))));
        }
        let mut buckets = self.buckets.lock().unwrap();
        let entry = buckets.entry(key.to_string()).or_insert(0);
        *entry += 1;
        Ok((*entry, window_secs as i64))
    }

    async fn set_expiry(&self, _key: &str, _secs: u64) -> Result<(), RateStoreError> {
        Ok(())
    }

    async fn get(&self, key: &str) -> Result<Option<u64>, RateStoreError> {
        Ok(self.buckets.lock().unwrap().get(key).copied())
    }

    async fn keys_matching(&self, prefix: &str) -> Result<Vec<String>, RateStoreError> {
        Ok(self
            .buckets
            .lock()
            .unwrap()
            .keys()
            .filter(|key| key.starts_with(prefix))
            .cloned()
            .collect())
    }

    async fn delete(&self, keys: &[String]) -> Result<u64, RateStoreError> {
        let mut buckets = self.buckets.lock().unwrap();
        let mut deleted = 0;
        for key in keys {
            if buckets.remove(key).is_some() {
                deleted += 1;
            }
        }
        Ok(deleted)
    }

    async fn ping(&self) -> Result<(), RateStoreError> {
        if self.fail.load(Ordering::Relaxed) {
            return Err(RateStoreError::Redis(redis::RedisError::from((
                redis::ErrorKind::IoError,
                "connection refused",
            ))));
        }
        Ok(())
    }
}

#[derive(Default)]
pub struct MemoryAuditStore {
    pub rows: Mutex<Vec<AuditEntry>>,
    next_id: AtomicUsize,
    pub healthy: AtomicBool,
}

impl MemoryAuditStore {
    pub fn new() -> Self {
        Self {
            rows: Mutex::new(Vec::new()),
            next_id: AtomicUsize::new(1),
            healthy: AtomicBool::new(true),
        }
    }

    pub fn snapshot(&self) -> Vec<AuditEntry> {
        self.rows.lock().unwrap().clone()
    }
}

#[async_trait::async_trait]
impl AuditStore for MemoryAuditStore {
    async fn insert(&self, entry: &NewAuditEntry) -> Result<i64, AuditStoreError> {
        let id = self.next_id.fetch_add(1, Ordering::Relaxed) as i64;
        let row = AuditEntry {
            id,
            request_id: entry.request_id.clone(),
            ts: entry.ts,
            method: entry.method.clone(),
            path: entry.path.clone(),
            client_ip_hash: entry.client_ip_hash.clone(),
            user_agent_hash: entry.user_agent_hash.clone(),
            api_key_hash: entry.api_key_hash.clone(),
            request_bytes: entry.request_bytes,
            response_status: entry.response_status,
            response_bytes: entry.response_bytes,
            latency_ms: entry.latency_ms,
            is_blocked: entry.is_blocked,
            block_reason: entry.block_reason.map(|reason| reason.as_str().to_string()),
            detected_issues_count: entry.detected_issues_count,
            security_confidence: entry.security_confidence,
            llm_provider: entry.llm_provider.clone(),
            llm_model: entry.llm_model.clone(),
            metadata: entry.metadata.clone(),
            retention_until: entry.retention_until,
        };
        self.rows.lock().unwrap().push(row);
        Ok(id)
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditStoreError> {
        let mut rows: Vec<AuditEntry> = self
            .rows
            .lock()
            .unwrap()
            .iter()
            .filter(|row| filter.from.map_or(true, |from| row.ts >= from))
            .filter(|row| filter.to.map_or(true, |to| row.ts < to))
            .filter(|row| {
                filter
                    .client_ip_hash
                    .as_deref()
                    .map_or(true, |hash| row.client_ip_hash == hash)
            })
            .filter(|row| filter.is_blocked.map_or(true, |blocked| row.is_blocked == blocked))
            .filter(|row| {
                filter
                    .response_status
                    .map_or(true, |status| row.response_status == status)
            })
            .cloned()
            .collect();
        rows.sort_by(|a, b| b.ts.cmp(&a.ts));

        let offset = filter.offset.unwrap_or(0).max(0) as usize;
        let limit = filter.limit.unwrap_or(100).clamp(1, 1000) as usize;
        Ok(rows.into_iter().skip(offset).take(limit).collect())
    }

    async fn erase_by_caller(&self, fingerprint: &str) -> Result<u64, AuditStoreError> {
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|row| row.client_ip_hash != fingerprint);
        Ok((before - rows.len()) as u64)
    }

    async fn sweep_expired(&self) -> Result<u64, AuditStoreError> {
        let now = Utc::now();
        let mut rows = self.rows.lock().unwrap();
        let before = rows.len();
        rows.retain(|row| row.retention_until >= now);
        Ok((before - rows.len()) as u64)
    }

    async fn stats_over(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<AuditStats, AuditStoreError> {
        let rows = self.rows.lock().unwrap();
        let scoped: Vec<&AuditEntry> = rows
            .iter()
            .filter(|row| row.ts >= from && row.ts < to)
            .collect();

        let total_requests = scoped.len() as i64;
        let blocked_requests = scoped.iter().filter(|row| row.is_blocked).count() as i64;
        let avg_latency_ms = if scoped.is_empty() {
            0.0
        } else {
            scoped.iter().map(|row| row.latency_ms as f64).sum::<f64>() / scoped.len() as f64
        };
        let unique_callers = scoped
            .iter()
            .map(|row| row.client_ip_hash.as_str())
            .collect::<std::collections::HashSet<_>>()
            .len() as i64;
        let mut counts_by_status = BTreeMap::new();
        for row in &scoped {
            *counts_by_status
                .entry(row.response_status.to_string())
                .or_insert(0) += 1;
        }

        Ok(AuditStats {
            total_requests,
            blocked_requests,
            block_rate: if total_requests > 0 {
                blocked_requests as f64 / total_requests as f64
            } else {
                0.0
            },
            avg_latency_ms,
            unique_callers,
            counts_by_status,
        })
    }

    async fn health(&self) -> bool {
        self.healthy.load(Ordering::Relaxed)
    }

    async fn close(&self) {}
}

pub fn base_config() -> FirewallConfig {
    serde_json::from_value(serde_json::json!({
        "security": { "hash_salt": "test-salt" },
        "redis_url": "redis://127.0.0.1/",
        "database_url": "postgres://localhost/firewall",
        "models": ["gpt-4o-mini", "gpt-4o"],
        "admin_token": "admin-token",
        "audit": { "async": false }
    }))
    .expect("test config")
}

pub struct TestHarness {
    pub analyzer: Arc<MockAnalyzer>,
    pub counter_store: Arc<MemoryCounterStore>,
    pub audit_store: Arc<MemoryAuditStore>,
    pub state: FirewallState,
}

/// Builds a gateway wired entirely to in-memory doubles, in synchronous
/// audit mode so rows are visible as soon as the response lands.
pub fn harness(config: FirewallConfig) -> TestHarness {
    harness_with_analyzer(config, Arc::new(MockAnalyzer::safe()))
}

pub fn harness_with_analyzer(config: FirewallConfig, analyzer: Arc<MockAnalyzer>) -> TestHarness {
    let counter_store = Arc::new(MemoryCounterStore::default());
    let audit_store = Arc::new(MemoryAuditStore::new());

    let limiter = RateLimiter::new(counter_store.clone(), config.rate_limit);
    let audit_logger = if config.audit.asynchronous {
        AuditLogger::asynchronous(audit_store.clone(), config.audit.queue_capacity)
    } else {
        AuditLogger::synchronous(audit_store.clone())
    };

    let state = FirewallState::new(
        config,
        limiter,
        analyzer.clone(),
        audit_store.clone(),
        audit_logger,
    );

    TestHarness {
        analyzer,
        counter_store,
        audit_store,
        state,
    }
}
