//! Prometheus text-format metrics, rendered by hand.
//!
//! Series are capped per label set so a caller spraying unique paths
//! cannot grow the maps without bound.

use std::collections::HashMap;
use std::time::Duration;

#[derive(Clone, Copy, Debug)]
pub struct MetricsConfig {
    pub max_path_series: usize,
    pub max_issue_series: usize,
}

impl Default for MetricsConfig {
    fn default() -> Self {
        Self {
            max_path_series: 128,
            max_issue_series: 64,
        }
    }
}

/// Issue kinds produced by the analyzer split into two metric families:
/// injection-shaped findings get their own counter, everything else is a
/// PII detection.
fn is_injection_kind(kind: &str) -> bool {
    matches!(
        kind,
        "PROMPT_INJECTION" | "JAILBREAK" | "EXCESSIVE_SPECIAL_CHARS" | "ENCODED_PAYLOAD"
    )
}

#[derive(Debug)]
pub struct FirewallMetrics {
    config: MetricsConfig,

    requests_total: HashMap<(String, String, u16), u64>,
    requests_by_status_total: HashMap<(u16, String), u64>,
    blocked_total: HashMap<(String, String), u64>,
    pii_detections_total: HashMap<String, u64>,
    prompt_injections_total: HashMap<String, u64>,
    rate_limit_violations_total: HashMap<String, u64>,
    latency_seconds: HashMap<(String, String), DurationHistogram>,
}

impl FirewallMetrics {
    pub fn new(config: MetricsConfig) -> Self {
        Self {
            config,
            requests_total: HashMap::new(),
            requests_by_status_total: HashMap::new(),
            blocked_total: HashMap::new(),
            pii_detections_total: HashMap::new(),
            prompt_injections_total: HashMap::new(),
            rate_limit_violations_total: HashMap::new(),
            latency_seconds: HashMap::new(),
        }
    }

    pub fn record_request(&mut self, path: &str, method: &str, status: u16) {
        bump_limited(
            &mut self.requests_total,
            (path.to_string(), method.to_string(), status),
            self.config.max_path_series,
        );
        bump_limited(
            &mut self.requests_by_status_total,
            (status, path.to_string()),
            self.config.max_path_series,
        );
    }

    pub fn record_blocked(&mut self, reason: &str, path: &str) {
        bump_limited(
            &mut self.blocked_total,
            (reason.to_string(), path.to_string()),
            self.config.max_path_series,
        );
    }

    pub fn record_detected_issue(&mut self, kind: &str) {
        if is_injection_kind(kind) {
            bump_limited(
                &mut self.prompt_injections_total,
                kind.to_string(),
                self.config.max_issue_series,
            );
        } else {
            bump_limited(
                &mut self.pii_detections_total,
                kind.to_string(),
                self.config.max_issue_series,
            );
        }
    }

    pub fn record_rate_limit_violation(&mut self, tier: &str) {
        bump_limited(
            &mut self.rate_limit_violations_total,
            tier.to_string(),
            self.config.max_issue_series,
        );
    }

    pub fn observe_latency(&mut self, path: &str, method: &str, duration: Duration) {
        let key = (path.to_string(), method.to_string());
        if self.latency_seconds.len() >= self.config.max_path_series
            && !self.latency_seconds.contains_key(&key)
        {
            return;
        }
        self.latency_seconds.entry(key).or_default().observe(duration);
    }

    pub fn render(&self, audit_queue_size: usize) -> String {
        let mut out = String::new();

        out.push_str("# HELP firewall_requests_total Total requests by path, method and status.\n");
        out.push_str("# TYPE firewall_requests_total counter\n");
        let mut requests: Vec<_> = self.requests_total.iter().collect();
        requests.sort_by(|(a, _), (b, _)| a.cmp(b));
        for ((path, method, status), count) in requests {
            out.push_str(&format!(
                "firewall_requests_total{{path=\"{}\",method=\"{}\",status=\"{status}\"}} {count}\n",
                escape_label_value(path),
                escape_label_value(method),
            ));
        }

        out.push_str("# HELP firewall_blocked_total Blocked requests by reason and path.\n");
        out.push_str("# TYPE firewall_blocked_total counter\n");
        let mut blocked: Vec<_> = self.blocked_total.iter().collect();
        blocked.sort_by(|(a, _), (b, _)| a.cmp(b));
        for ((reason, path), count) in blocked {
            out.push_str(&format!(
                "firewall_blocked_total{{reason=\"{}\",path=\"{}\"}} {count}\n",
                escape_label_value(reason),
                escape_label_value(path),
            ));
        }

        write_counter_map(
            &mut out,
            "firewall_pii_detections_total",
            "PII findings by type.",
            "type",
            &self.pii_detections_total,
        );

        write_counter_map(
            &mut out,
            "firewall_prompt_injections_total",
            "Prompt injection findings by category.",
            "category",
            &self.prompt_injections_total,
        );

        write_counter_map(
            &mut out,
            "firewall_rate_limit_violations_total",
            "Rate limit denials by tier.",
            "type",
            &self.rate_limit_violations_total,
        );

        out.push_str(
            "# HELP firewall_requests_by_status_total Responses by HTTP status and path.\n",
        );
        out.push_str("# TYPE firewall_requests_by_status_total counter\n");
        let mut by_status: Vec<_> = self.requests_by_status_total.iter().collect();
        by_status.sort_by(|(a, _), (b, _)| a.cmp(b));
        for ((status, path), count) in by_status {
            out.push_str(&format!(
                "firewall_requests_by_status_total{{status=\"{status}\",path=\"{}\"}} {count}\n",
                escape_label_value(path),
            ));
        }

        out.push_str("# HELP firewall_latency_seconds Request latency by path and method.\n");
        out.push_str("# TYPE firewall_latency_seconds histogram\n");
        let mut latencies: Vec<_> = self.latency_seconds.iter().collect();
        latencies.sort_by(|(a, _), (b, _)| a.cmp(b));
        for ((path, method), hist) in latencies {
            let path = escape_label_value(path);
            let method = escape_label_value(method);
            for (idx, bound) in hist.buckets.iter().enumerate() {
                out.push_str(&format!(
                    "firewall_latency_seconds_bucket{{path=\"{path}\",method=\"{method}\",le=\"{bound}\"}} {}\n",
                    hist.bucket_counts[idx]
                ));
            }
            out.push_str(&format!(
                "firewall_latency_seconds_bucket{{path=\"{path}\",method=\"{method}\",le=\"+Inf\"}} {}\n",
                hist.count
            ));
            out.push_str(&format!(
                "firewall_latency_seconds_sum{{path=\"{path}\",method=\"{method}\"}} {}\n",
                hist.sum_seconds
            ));
            out.push_str(&format!(
                "firewall_latency_seconds_count{{path=\"{path}\",method=\"{method}\"}} {}\n",
                hist.count
            ));
        }

        out.push_str("# HELP firewall_audit_queue_size Current depth of the audit queue.\n");
        out.push_str("# TYPE firewall_audit_queue_size gauge\n");
        out.push_str(&format!("firewall_audit_queue_size {audit_queue_size}\n"));

        out
    }
}

impl Default for FirewallMetrics {
    fn default() -> Self {
        Self::new(MetricsConfig::default())
    }
}

fn bump_limited<K: std::hash::Hash + Eq>(map: &mut HashMap<K, u64>, key: K, max_series: usize) {
    if map.len() >= max_series && !map.contains_key(&key) {
        return;
    }
    let entry = map.entry(key).or_insert(0);
    *entry = entry.saturating_add(1);
}

fn write_counter_map(
    out: &mut String,
    metric: &str,
    help: &str,
    label: &str,
    map: &HashMap<String, u64>,
) {
    out.push_str(&format!("# HELP {metric} {help}\n# TYPE {metric} counter\n"));

    let mut names: Vec<&String> = map.keys().collect();
    names.sort_unstable();
    for name in names {
        out.push_str(&format!(
            "{metric}{{{label}=\"{}\"}} {}\n",
            escape_label_value(name),
            map[name]
        ));
    }
}

/// Prometheus label escaping: backslash first, then quote and newline.
fn escape_label_value(value: &str) -> String {
    value
        .replace('\\', "\\\\")
        .replace('"', "\\\"")
        .replace('\n', "\\n")
}

#[derive(Clone, Debug)]
struct DurationHistogram {
    buckets: [f64; 11],
    bucket_counts: [u64; 11],
    sum_seconds: f64,
    count: u64,
}

impl Default for DurationHistogram {
    fn default() -> Self {
        Self {
            buckets: [
                0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
            ],
            bucket_counts: [0; 11],
            sum_seconds: 0.0,
            count: 0,
        }
    }
}

impl DurationHistogram {
    fn observe(&mut self, duration: Duration) {
        let seconds = duration.as_secs_f64();
        self.sum_seconds += seconds;
        self.count = self.count.saturating_add(1);
        for (idx, bound) in self.buckets.iter().enumerate() {
            if seconds <= *bound {
                self.bucket_counts[idx] = self.bucket_counts[idx].saturating_add(1);
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_includes_every_family() {
        let mut metrics = FirewallMetrics::default();
        metrics.record_request("/v1/chat/completions", "POST", 200);
        metrics.record_blocked("content-policy-violation", "/v1/chat/completions");
        metrics.record_detected_issue("SSN");
        metrics.record_detected_issue("PROMPT_INJECTION");
        metrics.record_rate_limit_violation("caller");
        metrics.observe_latency(
            "/v1/chat/completions",
            "POST",
            Duration::from_millis(30),
        );

        let rendered = metrics.render(7);
        assert!(rendered.contains(
            "firewall_requests_total{path=\"/v1/chat/completions\",method=\"POST\",status=\"200\"} 1"
        ));
        assert!(rendered.contains(
            "firewall_blocked_total{reason=\"content-policy-violation\",path=\"/v1/chat/completions\"} 1"
        ));
        assert!(rendered.contains("firewall_pii_detections_total{type=\"SSN\"} 1"));
        assert!(rendered
            .contains("firewall_prompt_injections_total{category=\"PROMPT_INJECTION\"} 1"));
        assert!(rendered.contains("firewall_rate_limit_violations_total{type=\"caller\"} 1"));
        assert!(rendered.contains(
            "firewall_requests_by_status_total{status=\"200\",path=\"/v1/chat/completions\"} 1"
        ));
        assert!(rendered.contains("firewall_latency_seconds_count"));
        assert!(rendered.contains("firewall_audit_queue_size 7"));
    }

    #[test]
    fn injection_kinds_route_to_their_own_family() {
        let mut metrics = FirewallMetrics::default();
        metrics.record_detected_issue("JAILBREAK");
        metrics.record_detected_issue("EMAIL");

        let rendered = metrics.render(0);
        assert!(rendered.contains("firewall_prompt_injections_total{category=\"JAILBREAK\"} 1"));
        assert!(rendered.contains("firewall_pii_detections_total{type=\"EMAIL\"} 1"));
    }

    #[test]
    fn series_caps_hold() {
        let mut metrics = FirewallMetrics::new(MetricsConfig {
            max_path_series: 2,
            max_issue_series: 2,
        });
        for i in 0..10 {
            metrics.record_request(&format!("/path/{i}"), "GET", 200);
        }
        assert_eq!(metrics.requests_total.len(), 2);
    }

    #[test]
    fn escapes_label_values() {
        assert_eq!(escape_label_value("a\"b"), "a\\\"b");
        assert_eq!(escape_label_value("a\\b"), "a\\\\b");
        assert_eq!(escape_label_value("a\nb"), "a\\nb");
    }
}
