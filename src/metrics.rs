//! Metric names and the Prometheus recorder.
//!
//! Everything is recorded through the `metrics` facade; `/metrics` renders
//! the exporter's handle when observability is enabled.

use axum::body::Body;
use axum::http::{Request, StatusCode};
use axum::middleware::Next;
use axum::response::{IntoResponse, Response};
use metrics::{counter, describe_counter, describe_gauge, describe_histogram, histogram};
use metrics_exporter_prometheus::{PrometheusBuilder, PrometheusHandle};
use std::sync::OnceLock;
use std::time::Instant;

/// Counter. Labels: method, path, status.
pub const HTTP_REQUESTS_TOTAL: &str = "herald_http_requests_total";

/// Histogram of handler latency. Labels: method, path.
pub const HTTP_REQUEST_DURATION_SECONDS: &str = "herald_http_request_duration_seconds";

/// Backend operations (counter). Labels: protocol, operation, outcome.
pub const BACKEND_REQUESTS_TOTAL: &str = "herald_backend_requests_total";

/// Failed backend attempts that were retried (counter).
pub const BACKEND_RETRIES_TOTAL: &str = "herald_backend_retries_total";

/// Reads that fell through to replicas (counter). Labels: outcome.
pub const REPLICA_FAILOVERS_TOTAL: &str = "herald_replica_failovers_total";

/// Mirror tasks enqueued (counter). Labels: command.
pub const MIRROR_TASKS_ENQUEUED_TOTAL: &str = "herald_mirror_tasks_enqueued_total";

/// Mirror tasks finished (counter). Labels: command, outcome.
pub const MIRROR_TASKS_FINISHED_TOTAL: &str = "herald_mirror_tasks_finished_total";

/// Storage lock counter value (gauge). Labels: storage.
pub const STORAGE_LOCKS: &str = "herald_storage_locks";

/// Task store snapshot attempts (counter). Labels: outcome.
pub const TASK_STORE_SYNCS_TOTAL: &str = "herald_task_store_syncs_total";

static RECORDER: OnceLock<PrometheusHandle> = OnceLock::new();

/// Installs the process-wide recorder on first call and returns its handle.
pub fn init_metrics() -> &'static PrometheusHandle {
    RECORDER.get_or_init(|| {
        PrometheusBuilder::new()
            .install_recorder()
            .expect("a second metrics recorder was installed")
    })
}

/// Attach help text to every metric above.
pub fn describe_metrics() {
    describe_counter!(HTTP_REQUESTS_TOTAL, "Gateway requests by status");
    describe_histogram!(HTTP_REQUEST_DURATION_SECONDS, "Gateway request latency in seconds");
    describe_counter!(BACKEND_REQUESTS_TOTAL, "Backend operations by outcome");
    describe_counter!(BACKEND_RETRIES_TOTAL, "Backend attempts that were retried");
    describe_counter!(REPLICA_FAILOVERS_TOTAL, "Reads served or attempted by replicas");
    describe_counter!(MIRROR_TASKS_ENQUEUED_TOTAL, "Mirror tasks enqueued");
    describe_counter!(MIRROR_TASKS_FINISHED_TOTAL, "Mirror tasks finished by outcome");
    describe_gauge!(STORAGE_LOCKS, "Mirror tasks ever enqueued per storage");
    describe_counter!(TASK_STORE_SYNCS_TOTAL, "Task store snapshot attempts");
}

/// Request count and latency for everything but the scrape endpoint.
pub async fn metrics_middleware(req: Request<Body>, next: Next) -> Response {
    let Some(path) = path_label(req.uri().path()) else {
        return next.run(req).await;
    };
    let method = req.method().as_str().to_owned();

    let started = Instant::now();
    let response = next.run(req).await;
    let elapsed = started.elapsed().as_secs_f64();

    histogram!(HTTP_REQUEST_DURATION_SECONDS, "method" => method.clone(), "path" => path)
        .record(elapsed);
    counter!(
        HTTP_REQUESTS_TOTAL,
        "method" => method,
        "path" => path,
        "status" => response.status().as_u16().to_string()
    )
    .increment(1);

    response
}

/// Path label with bucket names and keys folded away, or `None` for the
/// scrape endpoint itself.
fn path_label(path: &str) -> Option<&'static str> {
    let segments: Vec<&str> = path.split('/').filter(|s| !s.is_empty()).collect();
    Some(match segments.as_slice() {
        ["metrics"] => return None,
        [] => "/",
        ["health"] => "/health",
        [_] => "/{bucket}",
        _ => "/{bucket}/{key}",
    })
}

/// Prometheus text exposition; 404 until the recorder is installed.
pub async fn metrics_handler() -> Response {
    match RECORDER.get() {
        Some(handle) => (
            StatusCode::OK,
            [("content-type", "text/plain; version=0.0.4")],
            handle.render(),
        )
            .into_response(),
        None => StatusCode::NOT_FOUND.into_response(),
    }
}
