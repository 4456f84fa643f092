//! Gateway metrics
//!
//! Counters and histograms on the default prometheus registry, exposed in
//! text exposition format at `GET /metrics`.

use lazy_static::lazy_static;
use prometheus::{
    register_histogram_vec, register_int_counter, register_int_counter_vec, Encoder, HistogramVec,
    IntCounter, IntCounterVec, TextEncoder,
};

lazy_static! {
    pub static ref CACHE_HITS: IntCounter = register_int_counter!(
        "gateway_cache_hits_total",
        "Completion responses served from cache"
    )
    .expect("metric registration");
    pub static ref CACHE_MISSES: IntCounter = register_int_counter!(
        "gateway_cache_misses_total",
        "Cache lookups that missed"
    )
    .expect("metric registration");
    pub static ref BUDGET_REJECTED: IntCounter = register_int_counter!(
        "gateway_budget_rejected_total",
        "Requests rejected by budget enforcement"
    )
    .expect("metric registration");
    pub static ref FILTER_BLOCKED: IntCounter = register_int_counter!(
        "gateway_filter_blocked_total",
        "Requests or completions blocked by the content filter"
    )
    .expect("metric registration");
    pub static ref FALLBACKS: IntCounter = register_int_counter!(
        "gateway_fallbacks_total",
        "Fallback attempts after provider failures"
    )
    .expect("metric registration");
    pub static ref RATE_LIMITED: IntCounter = register_int_counter!(
        "gateway_rate_limited_total",
        "Requests refused by the gateway rate limiter"
    )
    .expect("metric registration");
    pub static ref REQUESTS: IntCounterVec = register_int_counter_vec!(
        "gateway_requests_total",
        "Provider calls by outcome",
        &["provider", "outcome"]
    )
    .expect("metric registration");
    pub static ref PROVIDER_LATENCY: HistogramVec = register_histogram_vec!(
        "gateway_provider_latency_seconds",
        "Provider call latency",
        &["provider"],
        vec![0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0, 60.0]
    )
    .expect("metric registration");
    pub static ref COST_USD_MILLIS: IntCounterVec = register_int_counter_vec!(
        "gateway_cost_milliusd_total",
        "Recorded spend in thousandths of a USD",
        &["provider", "operation"]
    )
    .expect("metric registration");
}

/// Render the default registry in text exposition format.
pub fn render() -> String {
    let encoder = TextEncoder::new();
    let metrics = prometheus::gather();
    let mut buffer = Vec::new();
    if encoder.encode(&metrics, &mut buffer).is_err() {
        return String::new();
    }
    String::from_utf8(buffer).unwrap_or_default()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn counters_increment_and_render() {
        let before = CACHE_HITS.get();
        CACHE_HITS.inc();
        assert_eq!(CACHE_HITS.get(), before + 1);

        REQUESTS.with_label_values(&["openai", "ok"]).inc();
        let body = render();
        assert!(body.contains("gateway_cache_hits_total"));
        assert!(body.contains("gateway_requests_total"));
    }
}
