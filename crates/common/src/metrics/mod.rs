//! Metrics and observability utilities
//!
//! Provides Prometheus metrics for the HTTP surface and every pipeline
//! stage, with standardized naming conventions.

use crate::llm::Usage;
use metrics::{counter, describe_counter, describe_histogram, histogram, Unit};
use std::time::Instant;

/// Metrics prefix for all Lexforge metrics
pub const METRICS_PREFIX: &str = "lexforge";

/// Histogram buckets for request latency (in seconds)
pub const LATENCY_BUCKETS: &[f64] = &[
    0.005, // 5ms
    0.010, // 10ms
    0.025, // 25ms
    0.050, // 50ms
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.500, // 2.5s
    5.000, // 5s
    10.00, // 10s
];

/// Buckets for calls to hosted services and full answer streams
pub const UPSTREAM_BUCKETS: &[f64] = &[
    0.100, // 100ms
    0.250, // 250ms
    0.500, // 500ms
    1.000, // 1s
    2.000, // 2s
    5.000, // 5s
    10.00, // 10s
    20.00, // 20s
    40.00, // 40s
    60.00, // 60s
];

/// Full metric name
pub fn metric_name(suffix: &str) -> String {
    format!("{}_{}", METRICS_PREFIX, suffix)
}

/// Register all metric descriptions
pub fn register_metrics() {
    describe_counter!(
        metric_name("requests_total"),
        Unit::Count,
        "Total number of HTTP requests"
    );

    describe_histogram!(
        metric_name("request_duration_seconds"),
        Unit::Seconds,
        "HTTP request latency in seconds"
    );

    describe_counter!(
        metric_name("search_legs_total"),
        Unit::Count,
        "Search calls by outcome"
    );

    describe_histogram!(
        metric_name("search_duration_seconds"),
        Unit::Seconds,
        "Search call latency in seconds"
    );

    describe_counter!(
        metric_name("query_expansions_total"),
        Unit::Count,
        "Query expansions by outcome"
    );

    describe_counter!(
        metric_name("reference_expansions_total"),
        Unit::Count,
        "Legislation reference lookups by outcome"
    );

    describe_histogram!(
        metric_name("reference_expansion_duration_seconds"),
        Unit::Seconds,
        "Legislation reference lookup latency in seconds"
    );

    describe_counter!(
        metric_name("generation_tokens_total"),
        Unit::Count,
        "Tokens consumed by answer generation"
    );

    describe_counter!(
        metric_name("answer_streams_total"),
        Unit::Count,
        "Answer streams by terminal outcome"
    );

    describe_histogram!(
        metric_name("answer_stream_duration_seconds"),
        Unit::Seconds,
        "Answer stream duration in seconds"
    );

    tracing::info!("Metrics registered");
}

/// Helper to record request metrics
pub struct RequestMetrics {
    start: Instant,
    endpoint: String,
    method: String,
}

impl RequestMetrics {
    /// Start tracking a request
    pub fn start(method: &str, endpoint: &str) -> Self {
        Self {
            start: Instant::now(),
            endpoint: endpoint.to_string(),
            method: method.to_string(),
        }
    }

    /// Record request completion
    pub fn finish(self, status: u16) {
        let duration = self.start.elapsed().as_secs_f64();

        counter!(
            metric_name("requests_total"),
            "method" => self.method.clone(),
            "endpoint" => self.endpoint.clone(),
            "status" => status.to_string()
        )
        .increment(1);

        histogram!(
            metric_name("request_duration_seconds"),
            "method" => self.method,
            "endpoint" => self.endpoint
        )
        .record(duration);
    }
}

/// One search call; `status` is `ok` or `error`
pub fn record_search_leg(duration_secs: f64, status: &str) {
    counter!(metric_name("search_legs_total"), "status" => status.to_string()).increment(1);
    histogram!(metric_name("search_duration_seconds")).record(duration_secs);
}

/// Query expansion outcome: `generated`, `fallback` or `failed`
pub fn record_query_expansion(outcome: &str) {
    counter!(metric_name("query_expansions_total"), "outcome" => outcome.to_string())
        .increment(1);
}

/// Reference lookup outcome and latency
pub fn record_reference_expansion(status: &str, duration_secs: f64) {
    counter!(metric_name("reference_expansions_total"), "status" => status.to_string())
        .increment(1);
    histogram!(metric_name("reference_expansion_duration_seconds")).record(duration_secs);
}

/// Token usage of one answer
pub fn record_generation_usage(model: &str, usage: &Usage) {
    let kinds = [
        ("input", usage.input_tokens),
        ("output", usage.output_tokens),
        ("cached_input", usage.cached_input_tokens),
    ];
    for (kind, tokens) in kinds {
        counter!(
            metric_name("generation_tokens_total"),
            "model" => model.to_string(),
            "kind" => kind
        )
        .increment(u64::from(tokens));
    }
}

/// Terminal outcome of an answer stream: `done`, `error` or `cancelled`
pub fn record_stream_outcome(outcome: &str, duration_secs: f64) {
    counter!(metric_name("answer_streams_total"), "outcome" => outcome.to_string()).increment(1);
    histogram!(metric_name("answer_stream_duration_seconds")).record(duration_secs);
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_buckets_sorted() {
        for buckets in [LATENCY_BUCKETS, UPSTREAM_BUCKETS] {
            assert!(buckets.windows(2).all(|w| w[0] < w[1]));
        }
        // Reference lookup timeout must land inside a bucket
        assert!(UPSTREAM_BUCKETS.contains(&10.0));
    }

    #[test]
    fn test_metric_name() {
        assert_eq!(metric_name("search_legs_total"), "lexforge_search_legs_total");
    }

    #[test]
    fn test_helpers_without_recorder() {
        let metrics = RequestMetrics::start("POST", "/api/chat");
        metrics.finish(200);
        record_search_leg(0.2, "error");
        record_generation_usage("mock", &Usage::default());
        record_stream_outcome("done", 1.5);
    }
}
