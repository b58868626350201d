//! Relational audit store.
//!
//! The Postgres implementation owns a bounded connection pool; every
//! mutation is a single statement so erasure and retention sweeps stay
//! atomic without client-side transactions.

use std::collections::BTreeMap;
use std::time::Duration;

use chrono::{DateTime, Utc};
use sqlx::postgres::PgPoolOptions;
use sqlx::{QueryBuilder, Row};
use thiserror::Error;

use super::{AuditEntry, AuditFilter, AuditStats, NewAuditEntry};

const MAX_CONNECTIONS: u32 = 20;
const IDLE_TIMEOUT: Duration = Duration::from_secs(30);
const ACQUIRE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_QUERY_LIMIT: i64 = 1000;
const DEFAULT_QUERY_LIMIT: i64 = 100;

#[derive(Debug, Error)]
pub enum AuditStoreError {
    #[error("audit sql error: {0}")]
    Sqlx(#[from] sqlx::Error),
    #[error("audit migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),
}

#[async_trait::async_trait]
pub trait AuditStore: Send + Sync {
    /// Appends one row and returns the assigned id.
    async fn insert(&self, entry: &NewAuditEntry) -> Result<i64, AuditStoreError>;

    /// Filtered page of entries, timestamp descending.
    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditStoreError>;

    /// Hard-deletes every row for one caller fingerprint.
    async fn erase_by_caller(&self, fingerprint: &str) -> Result<u64, AuditStoreError>;

    /// Hard-deletes every row whose retention window has passed.
    async fn sweep_expired(&self) -> Result<u64, AuditStoreError>;

    async fn stats_over(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<AuditStats, AuditStoreError>;

    async fn health(&self) -> bool;

    async fn close(&self);
}

#[derive(Clone)]
pub struct PgAuditStore {
    pool: sqlx::PgPool,
}

impl PgAuditStore {
    pub async fn connect(url: &str) -> Result<Self, AuditStoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(MAX_CONNECTIONS)
            .idle_timeout(IDLE_TIMEOUT)
            .acquire_timeout(ACQUIRE_TIMEOUT)
            .connect(url)
            .await?;
        Ok(Self { pool })
    }

    pub async fn connect_and_migrate(url: &str) -> Result<Self, AuditStoreError> {
        let store = Self::connect(url).await?;
        store.migrate().await?;
        Ok(store)
    }

    pub async fn migrate(&self) -> Result<(), AuditStoreError> {
        sqlx::migrate!("./migrations").run(&self.pool).await?;
        Ok(())
    }
}

#[async_trait::async_trait]
impl AuditStore for PgAuditStore {
    async fn insert(&self, entry: &NewAuditEntry) -> Result<i64, AuditStoreError> {
        let row = sqlx::query(
            "INSERT INTO audit_logs (
                request_id, ts, method, path,
                client_ip_hash, user_agent_hash, api_key_hash,
                request_bytes, response_status, response_bytes, latency_ms,
                is_blocked, block_reason, detected_issues_count,
                security_confidence, llm_provider, llm_model,
                metadata, retention_until
             ) VALUES ($1,$2,$3,$4,$5,$6,$7,$8,$9,$10,$11,$12,$13,$14,$15,$16,$17,$18,$19)
             RETURNING id",
        )
        .bind(&entry.request_id)
        .bind(entry.ts)
        .bind(&entry.method)
        .bind(&entry.path)
        .bind(&entry.client_ip_hash)
        .bind(&entry.user_agent_hash)
        .bind(&entry.api_key_hash)
        .bind(entry.request_bytes)
        .bind(entry.response_status)
        .bind(entry.response_bytes)
        .bind(entry.latency_ms)
        .bind(entry.is_blocked)
        .bind(entry.block_reason.map(|reason| reason.as_str()))
        .bind(entry.detected_issues_count)
        .bind(entry.security_confidence)
        .bind(&entry.llm_provider)
        .bind(&entry.llm_model)
        .bind(&entry.metadata)
        .bind(entry.retention_until)
        .fetch_one(&self.pool)
        .await?;

        Ok(row.get::<i64, _>(0))
    }

    async fn query(&self, filter: &AuditFilter) -> Result<Vec<AuditEntry>, AuditStoreError> {
        let limit = filter
            .limit
            .unwrap_or(DEFAULT_QUERY_LIMIT)
            .clamp(1, MAX_QUERY_LIMIT);
        let offset = filter.offset.unwrap_or(0).max(0);

        let mut builder = QueryBuilder::new("SELECT * FROM audit_logs WHERE TRUE");
        if let Some(from) = filter.from {
            builder.push(" AND ts >= ").push_bind(from);
        }
        if let Some(to) = filter.to {
            builder.push(" AND ts < ").push_bind(to);
        }
        if let Some(ref hash) = filter.client_ip_hash {
            builder.push(" AND client_ip_hash = ").push_bind(hash);
        }
        if let Some(blocked) = filter.is_blocked {
            builder.push(" AND is_blocked = ").push_bind(blocked);
        }
        if let Some(status) = filter.response_status {
            builder.push(" AND response_status = ").push_bind(status);
        }
        builder
            .push(" ORDER BY ts DESC LIMIT ")
            .push_bind(limit)
            .push(" OFFSET ")
            .push_bind(offset);

        let entries = builder
            .build_query_as::<AuditEntry>()
            .fetch_all(&self.pool)
            .await?;
        Ok(entries)
    }

    async fn erase_by_caller(&self, fingerprint: &str) -> Result<u64, AuditStoreError> {
        let result = sqlx::query("DELETE FROM audit_logs WHERE client_ip_hash = $1")
            .bind(fingerprint)
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn sweep_expired(&self) -> Result<u64, AuditStoreError> {
        let result = sqlx::query("DELETE FROM audit_logs WHERE retention_until < now()")
            .execute(&self.pool)
            .await?;
        Ok(result.rows_affected())
    }

    async fn stats_over(
        &self,
        from: DateTime<Utc>,
        to: DateTime<Utc>,
    ) -> Result<AuditStats, AuditStoreError> {
        let row = sqlx::query("SELECT * FROM audit_stats($1, $2)")
            .bind(from)
            .bind(to)
            .fetch_one(&self.pool)
            .await?;

        let total_requests: i64 = row.get("total_requests");
        let blocked_requests: i64 = row.get("blocked_requests");
        let avg_latency_ms: f64 = row.get("avg_latency_ms");
        let unique_callers: i64 = row.get("unique_callers");
        let counts_value: serde_json::Value = row.get("counts_by_status");

        let mut counts_by_status = BTreeMap::new();
        if let Some(map) = counts_value.as_object() {
            for (status, count) in map {
                counts_by_status.insert(status.clone(), count.as_i64().unwrap_or(0));
            }
        }

        let block_rate = if total_requests > 0 {
            blocked_requests as f64 / total_requests as f64
        } else {
            0.0
        };

        Ok(AuditStats {
            total_requests,
            blocked_requests,
            block_rate,
            avg_latency_ms,
            unique_callers,
            counts_by_status,
        })
    }

    async fn health(&self) -> bool {
        sqlx::query("SELECT 1").execute(&self.pool).await.is_ok()
    }

    async fn close(&self) {
        self.pool.close().await;
    }
}
