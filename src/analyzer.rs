//! Content analyzer RPC client.
//!
//! The analyzer is an external deployment; this module owns the wire
//! reliability only. Detection quality is the analyzer's problem, staying
//! reachable is ours: per-attempt deadlines, bounded retries with
//! exponential backoff, and a fresh channel after every failed attempt.

use std::collections::HashMap;
use std::time::Duration;

use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::Mutex;
use tonic::transport::{Channel, Endpoint};
use tonic::Code;
use tracing::{debug, warn};

use crate::config::AnalyzerConfig;

pub mod proto {
    tonic::include_proto!("firewall");
}

use proto::firewall_service_client::FirewallServiceClient;
use proto::{CheckContentRequest, HealthCheckRequest};

const KEEPALIVE_INTERVAL: Duration = Duration::from_secs(10);
const KEEPALIVE_TIMEOUT: Duration = Duration::from_secs(5);
const MAX_MESSAGE_BYTES: usize = 4 * 1024 * 1024;
const BACKOFF_BASE: Duration = Duration::from_secs(1);

#[derive(Debug, Error)]
pub enum AnalyzerError {
    #[error("analyzer rejected the request: {0}")]
    InvalidArgument(String),
    #[error("analyzer unavailable: {0}")]
    Unavailable(String),
    #[error("analyzer deadline exceeded after {0:?}")]
    DeadlineExceeded(Duration),
    #[error("analyzer rpc failed: {0}")]
    Status(tonic::Status),
}

/// One detected problem inside the submitted content.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct DetectedIssue {
    #[serde(rename = "type")]
    pub kind: String,
    pub start: i32,
    pub end: i32,
    pub confidence: f32,
}

/// The analyzer's decision for one content string.
#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct Verdict {
    pub is_safe: bool,
    pub redacted_text: Option<String>,
    pub issues: Vec<DetectedIssue>,
    pub confidence: f32,
}

#[derive(Clone, Debug, Serialize, Deserialize)]
pub struct AnalyzerHealth {
    pub serving: bool,
    pub version: String,
    pub uptime_seconds: i64,
}

#[async_trait::async_trait]
pub trait ContentAnalyzer: Send + Sync {
    async fn check_content(
        &self,
        content: &str,
        request_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<Verdict, AnalyzerError>;

    async fn health_check(&self) -> Result<AnalyzerHealth, AnalyzerError>;

    /// Releases any transport resources; part of the shutdown sequence.
    async fn shutdown(&self) {}
}

/// tonic-backed client. The channel slot is behind a mutex so a reconnect
/// is exclusive: concurrent requests share one channel and at most one of
/// them rebuilds it after a failure.
pub struct GrpcAnalyzer {
    endpoint: Endpoint,
    timeout: Duration,
    max_retries: u32,
    channel: Mutex<Option<FirewallServiceClient<Channel>>>,
}

impl GrpcAnalyzer {
    pub fn new(config: &AnalyzerConfig) -> Result<Self, tonic::transport::Error> {
        let endpoint = Endpoint::from_shared(config.endpoint())?
            .connect_timeout(Duration::from_secs(config.timeout_secs))
            .http2_keep_alive_interval(KEEPALIVE_INTERVAL)
            .keep_alive_timeout(KEEPALIVE_TIMEOUT)
            .keep_alive_while_idle(true);

        Ok(Self {
            endpoint,
            timeout: Duration::from_secs(config.timeout_secs),
            max_retries: config.max_retries,
            channel: Mutex::new(None),
        })
    }

    async fn client(&self) -> Result<FirewallServiceClient<Channel>, AnalyzerError> {
        let mut slot = self.channel.lock().await;
        if let Some(client) = slot.as_ref() {
            return Ok(client.clone());
        }

        let channel = self
            .endpoint
            .connect()
            .await
            .map_err(|err| AnalyzerError::Unavailable(err.to_string()))?;
        let client = FirewallServiceClient::new(channel)
            .max_decoding_message_size(MAX_MESSAGE_BYTES)
            .max_encoding_message_size(MAX_MESSAGE_BYTES);
        *slot = Some(client.clone());
        Ok(client)
    }

    /// Drops the cached channel so the next attempt reconnects.
    async fn tear_down(&self) {
        let mut slot = self.channel.lock().await;
        *slot = None;
    }

    /// Closes the channel for good; part of the shutdown sequence.
    pub async fn close(&self) {
        self.tear_down().await;
    }

    fn classify(&self, status: tonic::Status) -> AnalyzerError {
        match status.code() {
            Code::InvalidArgument => AnalyzerError::InvalidArgument(status.message().to_string()),
            Code::Unavailable => AnalyzerError::Unavailable(status.message().to_string()),
            Code::DeadlineExceeded => AnalyzerError::DeadlineExceeded(self.timeout),
            _ => AnalyzerError::Status(status),
        }
    }
}

/// Sleep before reissuing after a failed attempt `k` (0-based): 1s · 2^k.
fn backoff_delay(attempt: u32) -> Duration {
    BACKOFF_BASE * 2u32.saturating_pow(attempt)
}

fn is_retryable(error: &AnalyzerError) -> bool {
    matches!(
        error,
        AnalyzerError::Unavailable(_) | AnalyzerError::DeadlineExceeded(_)
    )
}

fn issue_kind_name(kind: i32) -> String {
    proto::IssueKind::try_from(kind)
        .unwrap_or(proto::IssueKind::Unknown)
        .as_str_name()
        .trim_start_matches("ISSUE_KIND_")
        .to_string()
}

#[async_trait::async_trait]
impl ContentAnalyzer for GrpcAnalyzer {
    async fn check_content(
        &self,
        content: &str,
        request_id: &str,
        metadata: HashMap<String, String>,
    ) -> Result<Verdict, AnalyzerError> {
        let mut last_error = AnalyzerError::Unavailable("no attempt made".to_string());

        for attempt in 0..=self.max_retries {
            let mut client = match self.client().await {
                Ok(client) => client,
                Err(err) => {
                    last_error = err;
                    if attempt < self.max_retries {
                        tokio::time::sleep(backoff_delay(attempt)).await;
                        continue;
                    }
                    break;
                }
            };

            let request = CheckContentRequest {
                content: content.to_string(),
                request_id: request_id.to_string(),
                metadata: metadata.clone(),
            };

            let outcome = tokio::time::timeout(self.timeout, client.check_content(request)).await;

            let error = match outcome {
                Ok(Ok(response)) => {
                    let response = response.into_inner();
                    return Ok(Verdict {
                        is_safe: response.is_safe,
                        redacted_text: (!response.redacted_text.is_empty())
                            .then_some(response.redacted_text),
                        issues: response
                            .detected_issues
                            .into_iter()
                            .map(|issue| DetectedIssue {
                                kind: issue_kind_name(issue.r#type),
                                start: issue.start,
                                end: issue.end,
                                confidence: issue.confidence,
                            })
                            .collect(),
                        confidence: response.confidence_score,
                    });
                }
                Ok(Err(status)) => self.classify(status),
                Err(_elapsed) => AnalyzerError::DeadlineExceeded(self.timeout),
            };

            if !is_retryable(&error) {
                return Err(error);
            }

            debug!(request_id, attempt, error = %error, "analyzer attempt failed");
            self.tear_down().await;
            last_error = error;

            if attempt < self.max_retries {
                tokio::time::sleep(backoff_delay(attempt)).await;
            }
        }

        warn!(request_id, retries = self.max_retries, error = %last_error, "analyzer retries exhausted");
        Err(last_error)
    }

    async fn health_check(&self) -> Result<AnalyzerHealth, AnalyzerError> {
        let mut client = self.client().await?;
        let request = HealthCheckRequest {
            service: String::new(),
        };

        let outcome = tokio::time::timeout(self.timeout, client.health_check(request)).await;
        match outcome {
            Ok(Ok(response)) => {
                let response = response.into_inner();
                let serving = response.status()
                    == proto::health_check_response::ServingStatus::Serving;
                Ok(AnalyzerHealth {
                    serving,
                    version: response.version,
                    uptime_seconds: response.uptime_seconds,
                })
            }
            Ok(Err(status)) => {
                self.tear_down().await;
                Err(self.classify(status))
            }
            Err(_elapsed) => {
                self.tear_down().await;
                Err(AnalyzerError::DeadlineExceeded(self.timeout))
            }
        }
    }

    async fn shutdown(&self) {
        self.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn backoff_doubles_from_one_second() {
        assert_eq!(backoff_delay(0), Duration::from_secs(1));
        assert_eq!(backoff_delay(1), Duration::from_secs(2));
        assert_eq!(backoff_delay(2), Duration::from_secs(4));
    }

    #[test]
    fn only_unavailable_and_deadline_retry() {
        assert!(is_retryable(&AnalyzerError::Unavailable("down".into())));
        assert!(is_retryable(&AnalyzerError::DeadlineExceeded(
            Duration::from_secs(5)
        )));
        assert!(!is_retryable(&AnalyzerError::InvalidArgument(
            "empty content".into()
        )));
        assert!(!is_retryable(&AnalyzerError::Status(
            tonic::Status::internal("boom")
        )));
    }

    #[test]
    fn issue_kind_names_drop_the_proto_prefix() {
        assert_eq!(issue_kind_name(proto::IssueKind::Ssn as i32), "SSN");
        assert_eq!(
            issue_kind_name(proto::IssueKind::PromptInjection as i32),
            "PROMPT_INJECTION"
        );
        assert_eq!(issue_kind_name(9999), "UNKNOWN");
    }
}
