//! Axum middleware shared by every route of the proxy.
use std::time::Instant;

use axum::{extract::Request, http::HeaderValue, middleware::Next, response::Response};
use tracing::Instrument;

use crate::metrics;

pub const REQUEST_ID_HEADER: &str = "X-Request-ID";

/// Log start/end of a request including latency, and record request metrics.
pub async fn request_timing_middleware(req: Request, next: Next) -> Response {
    let start = Instant::now();
    let method = req.method().clone();
    let uri = req.uri().clone();
    let host = req
        .headers()
        .get(axum::http::header::HOST)
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let _timer = metrics::RequestTimer::new(method.as_str());

    tracing::debug!("Started processing {} {}{}", method, host, uri);

    let response = next.run(req).await;
    let duration = start.elapsed();
    metrics::increment_request_total(method.as_str(), response.status().as_u16());

    tracing::info!(
        "Completed {} {}{} - {} in {:?}",
        method,
        host,
        uri.path(),
        response.status(),
        duration
    );

    response
}

/// Generate a per-request UUID and expose it via tracing plus `X-Request-ID`.
pub async fn request_id_middleware(req: Request, next: Next) -> Response {
    let request_id = uuid::Uuid::new_v4().to_string();
    let span = tracing::info_span!("request", request_id = %request_id);

    let mut response = next.run(req).instrument(span).await;

    if let Ok(header_value) = HeaderValue::from_str(&request_id) {
        response.headers_mut().insert(REQUEST_ID_HEADER, header_value);
    }

    response
}
