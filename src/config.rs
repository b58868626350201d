//! Gateway configuration tree.
//!
//! Loaded from a JSON file at startup; every knob has a serde default so a
//! minimal config only needs the store addresses and the hash salt.

use serde::{Deserialize, Serialize};

#[derive(Clone, Serialize, Deserialize)]
pub struct FirewallConfig {
    #[serde(default)]
    pub server: ServerConfig,
    #[serde(default)]
    pub analyzer: AnalyzerConfig,
    #[serde(default)]
    pub rate_limit: RateLimitConfig,
    #[serde(default)]
    pub audit: AuditConfig,
    pub security: SecurityConfig,
    #[serde(default)]
    pub features: FeatureToggles,
    /// Model identifiers served by `GET /v1/models`.
    #[serde(default)]
    pub models: Vec<String>,
    pub redis_url: String,
    pub database_url: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub admin_token: Option<String>,
}

impl std::fmt::Debug for FirewallConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("FirewallConfig")
            .field("server", &self.server)
            .field("analyzer", &self.analyzer)
            .field("rate_limit", &self.rate_limit)
            .field("audit", &self.audit)
            .field("security", &self.security)
            .field("features", &self.features)
            .field("models", &self.models)
            .field("redis_url", &self.redis_url)
            .field("database_url", &self.database_url)
            .field(
                "admin_token",
                &self.admin_token.as_ref().map(|_| "<redacted>"),
            )
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct ServerConfig {
    #[serde(default = "default_host")]
    pub host: String,
    #[serde(default = "default_port")]
    pub port: u16,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalyzerConfig {
    #[serde(default = "default_analyzer_host")]
    pub host: String,
    #[serde(default = "default_analyzer_port")]
    pub port: u16,
    /// Per-attempt deadline for `CheckContent`.
    #[serde(default = "default_analyzer_timeout_secs")]
    pub timeout_secs: u64,
    /// Retries after the first attempt.
    #[serde(default = "default_analyzer_max_retries")]
    pub max_retries: u32,
}

impl AnalyzerConfig {
    pub fn endpoint(&self) -> String {
        format!("http://{}:{}", self.host, self.port)
    }
}

impl Default for AnalyzerConfig {
    fn default() -> Self {
        Self {
            host: default_analyzer_host(),
            port: default_analyzer_port(),
            timeout_secs: default_analyzer_timeout_secs(),
            max_retries: default_analyzer_max_retries(),
        }
    }
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct TierLimit {
    pub max: u64,
    pub window_secs: u64,
}

#[derive(Clone, Copy, Debug, Serialize, Deserialize)]
pub struct RateLimitConfig {
    #[serde(default = "default_global_tier")]
    pub global: TierLimit,
    #[serde(default = "default_per_caller_tier")]
    pub per_caller: TierLimit,
    #[serde(default = "default_per_key_tier")]
    pub per_key: TierLimit,
}

impl Default for RateLimitConfig {
    fn default() -> Self {
        Self {
            global: default_global_tier(),
            per_caller: default_per_caller_tier(),
            per_key: default_per_key_tier(),
        }
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AuditConfig {
    /// Asynchronous mode runs the background drainer; synchronous mode
    /// awaits every insert inline and never spawns it.
    #[serde(default = "default_true", rename = "async")]
    pub asynchronous: bool,
    #[serde(default = "default_retention_days")]
    pub retention_days: i64,
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,
}

impl Default for AuditConfig {
    fn default() -> Self {
        Self {
            asynchronous: true,
            retention_days: default_retention_days(),
            queue_capacity: default_queue_capacity(),
        }
    }
}

#[derive(Clone, Serialize, Deserialize)]
pub struct SecurityConfig {
    #[serde(default = "default_min_content_length")]
    pub min_content_length: usize,
    #[serde(default = "default_max_content_length")]
    pub max_content_length: usize,
    pub hash_salt: String,
}

impl std::fmt::Debug for SecurityConfig {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SecurityConfig")
            .field("min_content_length", &self.min_content_length)
            .field("max_content_length", &self.max_content_length)
            .field("hash_salt", &"<redacted>")
            .finish()
    }
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct FeatureToggles {
    #[serde(default = "default_true")]
    pub audit_logging: bool,
    #[serde(default = "default_true")]
    pub rate_limiting: bool,
    #[serde(default = "default_true")]
    pub content_analysis: bool,
}

impl Default for FeatureToggles {
    fn default() -> Self {
        Self {
            audit_logging: true,
            rate_limiting: true,
            content_analysis: true,
        }
    }
}

impl FirewallConfig {
    pub fn validate(&self) -> Result<(), String> {
        if self.security.hash_salt.trim().is_empty() {
            return Err("security.hash_salt must not be empty".to_string());
        }
        if self.security.min_content_length > self.security.max_content_length {
            return Err(format!(
                "security.min_content_length ({}) exceeds max_content_length ({})",
                self.security.min_content_length, self.security.max_content_length
            ));
        }
        for (name, tier) in [
            ("global", self.rate_limit.global),
            ("per_caller", self.rate_limit.per_caller),
            ("per_key", self.rate_limit.per_key),
        ] {
            if tier.window_secs == 0 {
                return Err(format!("rate_limit.{name}.window_secs must be positive"));
            }
            if tier.max == 0 {
                return Err(format!("rate_limit.{name}.max must be positive"));
            }
        }
        if self.audit.retention_days <= 0 {
            return Err("audit.retention_days must be positive".to_string());
        }
        if self.audit.queue_capacity == 0 {
            return Err("audit.queue_capacity must be positive".to_string());
        }
        if self.analyzer.timeout_secs == 0 {
            return Err("analyzer.timeout_secs must be positive".to_string());
        }
        Ok(())
    }
}

fn default_host() -> String {
    "127.0.0.1".to_string()
}

fn default_port() -> u16 {
    8080
}

fn default_analyzer_host() -> String {
    "127.0.0.1".to_string()
}

fn default_analyzer_port() -> u16 {
    50051
}

fn default_analyzer_timeout_secs() -> u64 {
    5
}

fn default_analyzer_max_retries() -> u32 {
    3
}

fn default_global_tier() -> TierLimit {
    TierLimit {
        max: 10_000,
        window_secs: 3600,
    }
}

fn default_per_caller_tier() -> TierLimit {
    TierLimit {
        max: 100,
        window_secs: 3600,
    }
}

fn default_per_key_tier() -> TierLimit {
    TierLimit {
        max: 1000,
        window_secs: 3600,
    }
}

fn default_true() -> bool {
    true
}

fn default_retention_days() -> i64 {
    90
}

fn default_queue_capacity() -> usize {
    1000
}

fn default_min_content_length() -> usize {
    1
}

fn default_max_content_length() -> usize {
    10_240
}
