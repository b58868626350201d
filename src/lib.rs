//! LLM security gateway.
//!
//! A reverse proxy in front of a chat-completion upstream: every request
//! passes rate limiting, content analysis by a remote analyzer, and a
//! privacy-preserving audit trail before anything reaches the model.

pub mod analyzer;
pub mod audit;
pub mod config;
pub mod digest;
pub mod error;
pub mod http;
pub mod metrics;
pub mod rate_limit;
pub mod shutdown;

pub use analyzer::{
    AnalyzerError, AnalyzerHealth, ContentAnalyzer, DetectedIssue, GrpcAnalyzer, Verdict,
};
pub use audit::{
    AuditEntry, AuditFilter, AuditLogger, AuditPatch, AuditStats, AuditStore, AuditStoreError,
    BlockReason, NewAuditEntry, PgAuditStore,
};
pub use config::FirewallConfig;
pub use digest::Digester;
pub use error::{ErrorBody, ErrorKind};
pub use http::{router, FirewallState, RequestContext};
pub use metrics::{FirewallMetrics, MetricsConfig};
pub use rate_limit::{
    CounterStore, RateLimitDecision, RateLimiter, RateStoreError, RedisCounterStore, Tier,
};
