//! Lightweight metrics helpers for the apps proxy.
//!
//! Thin wrappers around the `metrics` crate macros. No exporter is embedded;
//! the binary (or an embedding application) installs any compatible recorder.
//!
//! Provided metrics:
//! * `appsproxy_requests_total` (counter, labels: method, status)
//! * `appsproxy_request_duration_seconds` (histogram, labels: method)
//! * `appsproxy_config_fetch_total` (counter, labels: result)
//! * `appsproxy_notify_total` (counter, labels: result)
//! * `appsproxy_wakeup_total` (counter, labels: result)
//! * `appsproxy_upstream_requests_total` (counter, labels: websocket, status)
//! * `appsproxy_upstream_request_duration_seconds` (histogram, labels: websocket)
//!
//! The `*Timer` structs record durations on `Drop`, so early returns are
//! measured too.
use std::time::Instant;

use metrics::{Unit, counter, describe_counter, describe_histogram, histogram};
use once_cell::sync::Lazy;

pub const APPSPROXY_REQUESTS_TOTAL: &str = "appsproxy_requests_total";
pub const APPSPROXY_REQUEST_DURATION_SECONDS: &str = "appsproxy_request_duration_seconds";
pub const APPSPROXY_CONFIG_FETCH_TOTAL: &str = "appsproxy_config_fetch_total";
pub const APPSPROXY_NOTIFY_TOTAL: &str = "appsproxy_notify_total";
pub const APPSPROXY_WAKEUP_TOTAL: &str = "appsproxy_wakeup_total";
pub const APPSPROXY_UPSTREAM_REQUESTS_TOTAL: &str = "appsproxy_upstream_requests_total";
pub const APPSPROXY_UPSTREAM_REQUEST_DURATION_SECONDS: &str =
    "appsproxy_upstream_request_duration_seconds";

static DESCRIPTIONS: Lazy<()> = Lazy::new(|| {
    describe_counter!(
        APPSPROXY_REQUESTS_TOTAL,
        Unit::Count,
        "Total number of inbound HTTP requests."
    );
    describe_histogram!(
        APPSPROXY_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of inbound HTTP requests."
    );
    describe_counter!(
        APPSPROXY_CONFIG_FETCH_TOTAL,
        Unit::Count,
        "App configuration fetches from the control plane, by result."
    );
    describe_counter!(
        APPSPROXY_NOTIFY_TOTAL,
        Unit::Count,
        "Usage notifications sent to the control plane, by result."
    );
    describe_counter!(
        APPSPROXY_WAKEUP_TOTAL,
        Unit::Count,
        "Wakeup requests sent to the control plane, by result."
    );
    describe_counter!(
        APPSPROXY_UPSTREAM_REQUESTS_TOTAL,
        Unit::Count,
        "Requests forwarded to app upstreams."
    );
    describe_histogram!(
        APPSPROXY_UPSTREAM_REQUEST_DURATION_SECONDS,
        Unit::Seconds,
        "Latency of requests forwarded to app upstreams."
    );
});

/// Count an inbound request.
pub fn increment_request_total(method: &str, status: u16) {
    counter!(
        APPSPROXY_REQUESTS_TOTAL,
        "method" => method.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_request_duration(method: &str, duration: std::time::Duration) {
    histogram!(APPSPROXY_REQUEST_DURATION_SECONDS, "method" => method.to_string())
        .record(duration.as_secs_f64());
}

/// Count a config fetch. `result` is one of `hit`, `modified`,
/// `not_modified`, `not_found`, `stale`, `error`.
pub fn increment_config_fetch(result: &'static str) {
    counter!(APPSPROXY_CONFIG_FETCH_TOTAL, "result" => result).increment(1);
}

/// Count a notify attempt (`sent`, `debounced`, `error`).
pub fn increment_notify(result: &'static str) {
    counter!(APPSPROXY_NOTIFY_TOTAL, "result" => result).increment(1);
}

/// Count a wakeup attempt (`sent`, `debounced`, `conflict`, `error`).
pub fn increment_wakeup(result: &'static str) {
    counter!(APPSPROXY_WAKEUP_TOTAL, "result" => result).increment(1);
}

pub fn increment_upstream_request_total(websocket: bool, status: u16) {
    counter!(
        APPSPROXY_UPSTREAM_REQUESTS_TOTAL,
        "websocket" => websocket.to_string(),
        "status" => status.to_string()
    )
    .increment(1);
}

pub fn record_upstream_request_duration(websocket: bool, duration: std::time::Duration) {
    histogram!(
        APPSPROXY_UPSTREAM_REQUEST_DURATION_SECONDS,
        "websocket" => websocket.to_string()
    )
    .record(duration.as_secs_f64());
}

/// RAII helper measuring inbound request duration.
pub struct RequestTimer {
    start: Instant,
    method: String,
}

impl RequestTimer {
    pub fn new(method: &str) -> Self {
        Self {
            start: Instant::now(),
            method: method.to_string(),
        }
    }
}

impl Drop for RequestTimer {
    fn drop(&mut self) {
        record_request_duration(&self.method, self.start.elapsed());
    }
}

/// RAII helper measuring upstream request duration.
pub struct UpstreamRequestTimer {
    start: Instant,
    websocket: bool,
}

impl UpstreamRequestTimer {
    pub fn new(websocket: bool) -> Self {
        Self {
            start: Instant::now(),
            websocket,
        }
    }
}

impl Drop for UpstreamRequestTimer {
    fn drop(&mut self) {
        record_upstream_request_duration(self.websocket, self.start.elapsed());
    }
}

/// Register metric descriptions (idempotent).
pub fn init_metrics() -> eyre::Result<()> {
    Lazy::force(&DESCRIPTIONS);
    tracing::info!("Metrics descriptions registered");
    Ok(())
}
