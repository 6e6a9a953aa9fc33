//! Metrics registry: `http_requests_total` and
//! `backend_connection_failures_total`, both prefixed `hashrouter_`.
//!
//! Mirrors `internal/metrics/metrics.go` 1:1 — same two counter
//! vectors, same label sanitization rule.

use once_cell::sync::Lazy;
use prometheus::{CounterVec, Opts, Registry};
use regex::Regex;

pub const METRICS_PREFIX: &str = "hashrouter_";

static UNSAFE_LABEL_CHARS: Lazy<Regex> = Lazy::new(|| Regex::new(r"[^A-Za-z0-9_]+").unwrap());

/// Sanitize a label value to `[A-Za-z0-9_]`, replacing every other run
/// of characters with a single underscore.
pub fn sanitize_label(value: &str) -> String {
    UNSAFE_LABEL_CHARS.replace_all(value, "_").into_owned()
}

/// The proxy's metric set, registered once at startup and shared by
/// every engine.
pub struct MetricsPool {
    pub registry: Registry,
    pub http_requests_total: CounterVec,
    pub backend_connection_failures_total: CounterVec,
}

impl MetricsPool {
    pub fn new() -> Self {
        let registry = Registry::new();

        let http_requests_total = CounterVec::new(
            Opts::new(
                format!("{METRICS_PREFIX}http_requests_total"),
                "total amount of requests by status code",
            ),
            &["proxy_name", "method", "delivered_status_code", "error"],
        )
        .expect("valid http_requests_total metric spec");

        let backend_connection_failures_total = CounterVec::new(
            Opts::new(
                format!("{METRICS_PREFIX}backend_connection_failures_total"),
                "total amount of requests that were tried against all the backends and failed",
            ),
            &["proxy_name", "method"],
        )
        .expect("valid backend_connection_failures_total metric spec");

        registry
            .register(Box::new(http_requests_total.clone()))
            .expect("register http_requests_total");
        registry
            .register(Box::new(backend_connection_failures_total.clone()))
            .expect("register backend_connection_failures_total");

        Self {
            registry,
            http_requests_total,
            backend_connection_failures_total,
        }
    }

    /// Record one completed request.
    pub fn observe_request(&self, proxy_name: &str, method: &str, status_code: u16, error: &str) {
        self.http_requests_total
            .with_label_values(&[
                &sanitize_label(proxy_name),
                &sanitize_label(method),
                &status_code.to_string(),
                &sanitize_label(error),
            ])
            .inc();
    }

    /// Record one failed backend connection attempt.
    pub fn observe_backend_failure(&self, proxy_name: &str, method: &str) {
        self.backend_connection_failures_total
            .with_label_values(&[&sanitize_label(proxy_name), &sanitize_label(method)])
            .inc();
    }
}

impl Default for MetricsPool {
    fn default() -> Self {
        Self::new()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn sanitizes_disallowed_characters() {
        assert_eq!(sanitize_label("GET /a"), "GET_a");
        assert_eq!(sanitize_label("proxy-name"), "proxy_name");
        assert_eq!(sanitize_label("clean_name"), "clean_name");
    }

    #[test]
    fn observe_request_increments_the_right_series() {
        let pool = MetricsPool::new();
        pool.observe_request("demo", "GET", 200, "none");
        pool.observe_request("demo", "GET", 200, "none");

        let value = pool
            .http_requests_total
            .with_label_values(&["demo", "GET", "200", "none"])
            .get();
        assert_eq!(value, 2.0);
    }
}
