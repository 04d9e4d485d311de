//! Prometheus counters and histograms.
//!
//! A [`Metrics`] registry is created once per process and shared by the HTTP
//! middleware, the ingest handler and the dispatchers. Series are recorded
//! through the `metrics` facade into a Prometheus recorder owned by the
//! registry, so each registry is independent of the global recorder.
//! [`Metrics::render`] produces the text exposition served at `GET /metrics`.

use std::time::Duration;

use metrics::Label;
use metrics_exporter_prometheus::{Matcher, PrometheusBuilder, PrometheusHandle, PrometheusRecorder};
use tracing::warn;

/// Metric names.
pub mod names {
    /// HTTP requests by method, route and status.
    pub const HTTP_REQUESTS_TOTAL: &str = "http_requests_total";
    /// HTTP request latency by method and route.
    pub const HTTP_REQUEST_DURATION_SECONDS: &str = "http_request_duration_seconds";
    /// Ingress outcomes.
    pub const EVENTS_RECEIVED_TOTAL: &str = "events_received_total";
    /// Dispatcher outcomes.
    pub const EVENTS_PROCESSED_TOTAL: &str = "events_processed_total";
    /// Time from claim to terminal state, retries included.
    pub const EVENT_PROCESSING_DURATION_SECONDS: &str = "event_processing_duration_seconds";
}

/// Histogram buckets for request latency, in seconds.
pub const HTTP_DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0];

/// Histogram buckets for event processing time, in seconds.
pub const PROCESSING_DURATION_BUCKETS: &[f64] = &[0.1, 0.5, 1.0, 2.0, 5.0, 10.0];

/// Content type of [`Metrics::render`] output.
pub const CONTENT_TYPE: &str = "text/plain; version=0.0.4";

/// Process metrics registry.
pub struct Metrics {
    recorder: PrometheusRecorder,
    handle: PrometheusHandle,
}

fn labels(pairs: &[(&str, &str)]) -> Vec<Label> {
    pairs.iter().map(|(k, v)| Label::new((*k).to_string(), (*v).to_string())).collect()
}

fn builder() -> PrometheusBuilder {
    let configured = PrometheusBuilder::new()
        .set_buckets_for_metric(
            Matcher::Full(names::HTTP_REQUEST_DURATION_SECONDS.to_string()),
            HTTP_DURATION_BUCKETS,
        )
        .and_then(|builder| {
            builder.set_buckets_for_metric(
                Matcher::Full(names::EVENT_PROCESSING_DURATION_SECONDS.to_string()),
                PROCESSING_DURATION_BUCKETS,
            )
        });

    match configured {
        Ok(builder) => builder,
        Err(e) => {
            warn!(error = %e, "histogram buckets rejected, durations render as summaries");
            PrometheusBuilder::new()
        },
    }
}

impl Metrics {
    /// Creates an empty registry with its own recorder.
    pub fn new() -> Self {
        let recorder = builder().build_recorder();
        let handle = recorder.handle();
        Self { recorder, handle }
    }

    /// Adds one to a counter series.
    pub fn increment(&self, name: &'static str, pairs: &[(&str, &str)]) {
        let labels = labels(pairs);
        metrics::with_local_recorder(&self.recorder, || {
            metrics::counter!(name, labels).increment(1);
        });
    }

    /// Records one duration observation in seconds.
    pub fn observe(&self, name: &'static str, pairs: &[(&str, &str)], duration: Duration) {
        let labels = labels(pairs);
        metrics::with_local_recorder(&self.recorder, || {
            metrics::histogram!(name, labels).record(duration.as_secs_f64());
        });
    }

    /// Records a finished HTTP request.
    pub fn record_http_request(&self, method: &str, route: &str, status: u16, elapsed: Duration) {
        let status = status.to_string();
        self.increment(names::HTTP_REQUESTS_TOTAL, &[
            ("method", method),
            ("route", route),
            ("status", &status),
        ]);
        self.observe(
            names::HTTP_REQUEST_DURATION_SECONDS,
            &[("method", method), ("route", route)],
            elapsed,
        );
    }

    /// Records an ingress outcome such as `accepted`, `replayed` or `invalid`.
    pub fn record_event_received(&self, outcome: &str) {
        self.increment(names::EVENTS_RECEIVED_TOTAL, &[("outcome", outcome)]);
    }

    /// Records a dispatcher outcome (`delivered` or `failed`) and its duration.
    pub fn record_event_processed(&self, outcome: &str, elapsed: Duration) {
        self.increment(names::EVENTS_PROCESSED_TOTAL, &[("outcome", outcome)]);
        self.observe(names::EVENT_PROCESSING_DURATION_SECONDS, &[], elapsed);
    }

    /// Prometheus text exposition of every series.
    pub fn render(&self) -> String {
        self.handle.render()
    }

    /// Current value of one counter series, read back from the exposition.
    /// Zero if the series was never incremented.
    pub fn counter(&self, name: &str, pairs: &[(&str, &str)]) -> u64 {
        let mut wanted: Vec<(String, String)> =
            pairs.iter().map(|(k, v)| ((*k).to_string(), (*v).to_string())).collect();
        wanted.sort();

        self.render()
            .lines()
            .filter(|line| !line.starts_with('#'))
            .filter_map(parse_sample)
            .find(|(series, labels, _)| series == name && *labels == wanted)
            .map_or(0, |(_, _, value)| value as u64)
    }
}

impl Default for Metrics {
    fn default() -> Self {
        Self::new()
    }
}

impl std::fmt::Debug for Metrics {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Metrics").finish_non_exhaustive()
    }
}

/// Splits `name{k="v",...} value` into its parts, labels sorted by name.
fn parse_sample(line: &str) -> Option<(String, Vec<(String, String)>, f64)> {
    let (series, value) = line.rsplit_once(' ')?;
    let value = value.parse().ok()?;

    let Some((name, rest)) = series.split_once('{') else {
        return Some((series.to_string(), Vec::new(), value));
    };
    let body = rest.strip_suffix('}')?;

    let mut labels = Vec::new();
    for pair in body.split("\",").filter(|p| !p.is_empty()) {
        let (key, raw) = pair.split_once("=\"")?;
        labels.push((key.to_string(), raw.trim_end_matches('"').to_string()));
    }
    labels.sort();

    Some((name.to_string(), labels, value))
}
