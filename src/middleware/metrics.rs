//! Prometheus metrics recorder for the relay.
//!
//! Exposes a standard `/metrics` endpoint that Prometheus can scrape.
//! Metrics are updated once per relayed request via `record()`.

use std::sync::atomic::{AtomicUsize, Ordering};

use prometheus::{
    histogram_opts, opts, CounterVec, Encoder, HistogramVec, Registry, TextEncoder,
};

/// Maximum unique model labels before bucketing to "other".
const MAX_CARDINALITY: usize = 10_000;

/// Outcome of one relayed request, as seen by the metrics recorder.
#[derive(Debug, Clone, Default)]
pub struct RequestRecord<'a> {
    pub model: &'a str,
    pub status_code: u16,
    pub is_streaming: bool,
    pub latency_secs: f64,
    pub ttft_secs: Option<f64>,
    /// Channels that failed before the final outcome.
    pub failed_attempts: u32,
    pub quota: i64,
    pub prompt_tokens: u32,
    pub completion_tokens: u32,
    pub error_type: Option<&'static str>,
}

/// Metrics live in their own registry so several gateways can coexist in
/// one process (tests build one per case).
pub struct RelayMetrics {
    registry: Registry,
    label_combos: AtomicUsize,

    requests_total: CounterVec,
    failovers_total: CounterVec,
    quota_total: CounterVec,
    tokens_total: CounterVec,
    errors_total: CounterVec,
    rate_limited_total: CounterVec,

    request_duration_seconds: HistogramVec,
    ttft_seconds: HistogramVec,
}

impl RelayMetrics {
    pub fn new() -> prometheus::Result<Self> {
        let registry = Registry::new_custom(Some("relay".into()), None)?;

        let requests_total = CounterVec::new(
            opts!("requests_total", "Total number of relayed requests"),
            &["model", "status_code", "is_streaming"],
        )?;
        let failovers_total = CounterVec::new(
            opts!("failovers_total", "Channel attempts that failed and were retried elsewhere"),
            &["model"],
        )?;
        let quota_total = CounterVec::new(
            opts!("quota_consumed_total", "Quota settled against tokens and users"),
            &["model"],
        )?;
        let tokens_total = CounterVec::new(
            opts!("tokens_total", "Total tokens metered"),
            &["model", "type"],
        )?;
        let errors_total = CounterVec::new(
            opts!("errors_total", "Total errors by type"),
            &["model", "error_type"],
        )?;
        let rate_limited_total = CounterVec::new(
            opts!("rate_limited_total", "Requests rejected by the rate limiter"),
            &["class"],
        )?;
        let request_duration_seconds = HistogramVec::new(
            histogram_opts!(
                "request_duration_seconds",
                "Request latency in seconds",
                // LLM-optimized buckets: 100ms to 120s
                vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0, 120.0]
            ),
            &["model", "status_code"],
        )?;
        let ttft_seconds = HistogramVec::new(
            histogram_opts!(
                "ttft_seconds",
                "Time to first chunk in seconds (streaming only)",
                vec![0.05, 0.1, 0.25, 0.5, 1.0, 2.0, 5.0, 10.0]
            ),
            &["model"],
        )?;

        registry.register(Box::new(requests_total.clone()))?;
        registry.register(Box::new(failovers_total.clone()))?;
        registry.register(Box::new(quota_total.clone()))?;
        registry.register(Box::new(tokens_total.clone()))?;
        registry.register(Box::new(errors_total.clone()))?;
        registry.register(Box::new(rate_limited_total.clone()))?;
        registry.register(Box::new(request_duration_seconds.clone()))?;
        registry.register(Box::new(ttft_seconds.clone()))?;

        Ok(Self {
            registry,
            label_combos: AtomicUsize::new(0),
            requests_total,
            failovers_total,
            quota_total,
            tokens_total,
            errors_total,
            rate_limited_total,
            request_duration_seconds,
            ttft_seconds,
        })
    }

    /// Record metrics for a finished request.
    pub fn record(&self, entry: &RequestRecord<'_>) {
        // Cardinality guard: if we've seen too many unique combos, bucket to "other"
        let current = self.label_combos.load(Ordering::Relaxed);
        let model = if current > MAX_CARDINALITY {
            "other"
        } else {
            self.label_combos.fetch_add(1, Ordering::Relaxed);
            if entry.model.is_empty() {
                "unknown"
            } else {
                entry.model
            }
        };

        let status = entry.status_code.to_string();
        let is_streaming = if entry.is_streaming { "true" } else { "false" };

        self.requests_total
            .with_label_values(&[model, &status, is_streaming])
            .inc();
        self.request_duration_seconds
            .with_label_values(&[model, &status])
            .observe(entry.latency_secs);

        if entry.failed_attempts > 0 {
            self.failovers_total
                .with_label_values(&[model])
                .inc_by(entry.failed_attempts as f64);
        }
        if entry.quota > 0 {
            self.quota_total
                .with_label_values(&[model])
                .inc_by(entry.quota as f64);
        }
        if entry.prompt_tokens > 0 {
            self.tokens_total
                .with_label_values(&[model, "prompt"])
                .inc_by(entry.prompt_tokens as f64);
        }
        if entry.completion_tokens > 0 {
            self.tokens_total
                .with_label_values(&[model, "completion"])
                .inc_by(entry.completion_tokens as f64);
        }
        if let Some(error_type) = entry.error_type {
            self.errors_total
                .with_label_values(&[model, error_type])
                .inc();
        }
        if let Some(ttft) = entry.ttft_secs {
            self.ttft_seconds.with_label_values(&[model]).observe(ttft);
        }
    }

    pub fn record_rate_limited(&self, class: &str) {
        self.rate_limited_total.with_label_values(&[class]).inc();
    }

    /// Encode all registered metrics as Prometheus text format.
    pub fn encode(&self) -> String {
        let encoder = TextEncoder::new();
        let metric_families = self.registry.gather();
        let mut buffer = Vec::new();
        if let Err(e) = encoder.encode(&metric_families, &mut buffer) {
            tracing::warn!("failed to encode metrics: {}", e);
        }
        String::from_utf8(buffer).unwrap_or_default()
    }
}
