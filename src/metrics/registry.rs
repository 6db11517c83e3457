use anyhow::Result;
use metrics::{describe_counter, describe_gauge, describe_histogram, Unit};
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle};

/// Histogram bucket boundaries for latency metrics (seconds).
const LATENCY_BUCKETS: &[f64] = &[
    0.001, 0.005, 0.01, 0.025, 0.05, 0.1, 0.25, 0.5, 1.0, 2.5, 5.0, 10.0, 30.0,
];

/// Thin handle around the global metrics recorder.
///
/// After `Metrics::install()` the `metrics` crate macros (`counter!`, `gauge!`,
/// `histogram!`) record into Prometheus. The handle is kept only to render the
/// admin `/metrics` endpoint.
#[derive(Clone)]
pub struct Metrics {
    handle: PrometheusHandle,
}

impl Metrics {
    /// Install the global Prometheus recorder and describe every metric.
    /// Fails if a recorder is already installed in this process.
    pub fn install() -> Result<Self> {
        let handle = PrometheusBuilder::new()
            .set_buckets_for_metric(
                Matcher::Suffix("_duration_seconds".to_string()),
                LATENCY_BUCKETS,
            )?
            .install_recorder()?;

        // request path
        describe_counter!(
            "portico_http_requests_total",
            Unit::Count,
            "Requests answered, by version, method, status and outcome"
        );
        describe_histogram!(
            "portico_http_request_duration_seconds",
            Unit::Seconds,
            "Total request duration from client perspective"
        );
        describe_counter!(
            "portico_auth_rejected_total",
            Unit::Count,
            "Requests rejected by token validation, by reason"
        );
        describe_counter!(
            "portico_hook_errors_total",
            Unit::Count,
            "Lifecycle hook failures, by stage"
        );

        // backend
        describe_counter!(
            "portico_backend_requests_total",
            Unit::Count,
            "Backend exchanges, by destination and outcome"
        );
        describe_histogram!(
            "portico_backend_request_duration_seconds",
            Unit::Seconds,
            "Time spent waiting for the backend"
        );

        // rate limiting
        describe_counter!(
            "portico_rate_limit_allowed_total",
            Unit::Count,
            "Requests admitted by the rate limiter"
        );
        describe_counter!(
            "portico_rate_limit_rejected_total",
            Unit::Count,
            "Requests rejected by the rate limiter"
        );
        describe_counter!(
            "portico_rate_limit_lookup_errors_total",
            Unit::Count,
            "Client limit lookups that failed and were admitted"
        );

        // configuration
        describe_counter!(
            "portico_config_reloads_total",
            Unit::Count,
            "Snapshot installs, by source and result"
        );
        describe_gauge!(
            "portico_mapping_generation",
            Unit::Count,
            "Generation of the snapshot currently serving"
        );
        describe_gauge!(
            "portico_mapping_endpoints",
            Unit::Count,
            "Endpoints in the snapshot currently serving"
        );
        describe_counter!(
            "portico_store_events_total",
            Unit::Count,
            "Replicated map events received, by map and kind"
        );

        // connections
        describe_gauge!(
            "portico_connections_active",
            Unit::Count,
            "Number of active downstream connections"
        );
        describe_counter!(
            "portico_connections_total",
            Unit::Count,
            "Total connections accepted"
        );

        Ok(Self { handle })
    }

    /// Render all metrics in Prometheus text exposition format.
    pub fn render(&self) -> String {
        self.handle.render()
    }
}
