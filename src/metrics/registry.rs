use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`,
/// `gauge!`, `histogram!`) can be used anywhere in the codebase. The
/// `PrometheusHandle` is retained solely for rendering the `/metrics`
/// endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and register metric
    /// descriptions. Must be called once at startup.
    pub fn install() -> Self {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                metrics_exporter_prometheus::Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )
            .expect("valid matcher")
            .install_recorder()
            .expect("failed to install metrics recorder");

        // request path
        describe_counter!(
            "gateway_http_requests_total",
            Unit::Count,
            "Total HTTP requests processed"
        );
        describe_histogram!(
            "gateway_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );

        // rate limiting
        describe_counter!(
            "gateway_rate_limit_admitted_total",
            Unit::Count,
            "Requests admitted by the rate-limit engine"
        );
        describe_counter!(
            "gateway_rate_limit_denied_total",
            Unit::Count,
            "Requests denied by the rate-limit engine (and deferred)"
        );

        // deferred pipeline
        describe_counter!(
            "gateway_deferred_enqueued_total",
            Unit::Count,
            "Requests parked on this node's stream"
        );
        describe_counter!(
            "gateway_deferred_processed_total",
            Unit::Count,
            "Deferred requests processed by workers, by result"
        );
        describe_gauge!(
            "gateway_stream_length",
            Unit::Count,
            "Current length of this node's request stream"
        );
        describe_counter!(
            "gateway_stream_trimmed_total",
            Unit::Count,
            "Entries dropped by the stream length cap"
        );
        describe_gauge!(
            "gateway_workers_active",
            Unit::Count,
            "Workers currently running on this node"
        );

        // connections
        describe_gauge!(
            "gateway_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "gateway_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        Self { handle }
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
