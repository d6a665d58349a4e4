//! Axum router construction.
//!
//! The [`app`] function wires the infrastructure endpoints and hands every
//! other request to the resolver. S3 distinguishes operations by method,
//! path shape and query parameters, and in virtual-hosted style the bucket
//! lives in the `Host` header, so there are no per-operation routes: the
//! fallback handler decodes the request and [`resolve`] classifies it.

use axum::{
    body::Bytes,
    extract::{DefaultBodyLimit, State},
    http::{HeaderMap, HeaderValue, Method, Request, StatusCode, Uri},
    middleware::{self, Next},
    response::{IntoResponse, Response},
    routing::get,
    Router,
};
use std::future::Future;
use std::sync::Arc;
use std::time::Duration;
use tokio::net::TcpListener;
use tower_http::trace::TraceLayer;
use tracing::{error, info, warn};

use crate::errors::{generate_request_id, S3Error};
use crate::metrics::{metrics_handler, metrics_middleware};
use crate::replication::TaskStore;
use crate::request::ProxyRequest;
use crate::resolver::resolve;
use crate::AppState;

/// Build the axum [`Router`] for the gateway.
pub fn app(state: Arc<AppState>) -> Router {
    let mut router = Router::new().route("/health", get(health_check));
    if state.config.observability.metrics {
        router = router.route("/metrics", get(metrics_handler));
    }

    router
        .fallback(handle_s3)
        .with_state(state)
        // Layer ordering: the last layer added is the outermost.
        .layer(TraceLayer::new_for_http())
        .layer(middleware::from_fn(auth_presence_middleware))
        .layer(middleware::from_fn(common_headers_middleware))
        .layer(middleware::from_fn(metrics_middleware))
        // Objects can be large; bodies are buffered whole.
        .layer(DefaultBodyLimit::disable())
}

// -- Serving and shutdown ----------------------------------------------------

/// Serve `app` until `stop` resolves, then drain open connections while
/// the task store takes its final snapshot.
///
/// Draining and the snapshot run side by side under one `grace` budget.
/// Connections still open at the deadline are dropped; a snapshot that has
/// not finished is abandoned and the previous one stays authoritative.
pub async fn serve_until(
    listener: TcpListener,
    app: Router,
    stop: impl Future<Output = ()> + Send,
    tasks: Arc<TaskStore>,
    grace: Duration,
) -> std::io::Result<()> {
    let (stop_tx, stop_rx) = tokio::sync::oneshot::channel::<()>();
    let mut server = tokio::spawn(async move {
        axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = stop_rx.await;
            })
            .await
    });

    let exited = tokio::select! {
        _ = stop => None,
        result = &mut server => Some(result),
    };
    let _ = stop_tx.send(());

    let deadline = tokio::time::Instant::now() + grace;
    let drain = async {
        match exited {
            Some(result) => result,
            None => (&mut server).await,
        }
    };
    let (drained, synced) = tokio::join!(
        tokio::time::timeout_at(deadline, drain),
        tokio::time::timeout_at(deadline, tasks.close()),
    );
    server.abort();

    match synced {
        Ok(Ok(())) => info!("Task store synced"),
        Ok(Err(e)) => error!("Final task store sync failed: {e}"),
        Err(_) => warn!("Final task store sync timed out after {grace:?}"),
    }
    match drained {
        Ok(Ok(result)) => result,
        Ok(Err(e)) => Err(std::io::Error::other(e)),
        Err(_) => {
            warn!("Connections still open after {grace:?} were dropped");
            Ok(())
        }
    }
}

// -- Common headers middleware -----------------------------------------------

/// Adds `x-amz-request-id`, `Date` and `Server` to every response.
async fn common_headers_middleware(req: Request<axum::body::Body>, next: Next) -> Response {
    let mut response = next.run(req).await;
    let headers = response.headers_mut();

    // Error documents already carry their own request id.
    if !headers.contains_key("x-amz-request-id") {
        if let Ok(value) = HeaderValue::from_str(&generate_request_id()) {
            headers.insert("x-amz-request-id", value);
        }
    }

    let date = httpdate::fmt_http_date(std::time::SystemTime::now());
    if let Ok(value) = HeaderValue::from_str(&date) {
        headers.insert("date", value);
    }
    headers.insert("server", HeaderValue::from_static("Herald"));

    response
}

// -- Auth middleware ---------------------------------------------------------

/// Paths that need no `Authorization` header.
const AUTH_SKIP_PATHS: &[&str] = &["/health", "/metrics"];

/// Rejects S3 requests without an `Authorization` header. Signatures are
/// checked later, once the resolver knows which bucket's keys apply.
async fn auth_presence_middleware(
    req: Request<axum::body::Body>,
    next: Next,
) -> Result<Response, S3Error> {
    if AUTH_SKIP_PATHS.contains(&req.uri().path()) {
        return Ok(next.run(req).await);
    }
    if !req.headers().contains_key("authorization") {
        return Err(S3Error::MissingAuthorization);
    }
    Ok(next.run(req).await)
}

// -- Handlers ----------------------------------------------------------------

async fn health_check() -> impl IntoResponse {
    (
        StatusCode::OK,
        [("content-type", "application/json")],
        r#"{"status":"ok"}"#,
    )
}

/// Every S3 call: decode, resolve, relay.
async fn handle_s3(
    State(state): State<Arc<AppState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Result<Response, S3Error> {
    let req = ProxyRequest::new(method, &uri, headers, body);
    Ok(resolve(&state, req).await?.into_response())
}
