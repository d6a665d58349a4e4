//! Replaying one mirror task against its replica.

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use md5::{Digest, Md5};
use thiserror::Error;
use tracing::{debug, warn};

use super::task::{MirrorCommand, MirrorTask};
use crate::backends::{BackendError, BackendResponse, Backends, Operation};
use crate::buckets::Bucket;
use crate::config::Protocol;
use crate::request::ProxyRequest;
use crate::retry::RetryPolicy;
use crate::xml::render_create_bucket_configuration;

/// Headers of the primary's object copied onto the replica's.
const CARRIED_HEADERS: &[&str] = &[
    "content-type",
    "content-encoding",
    "content-disposition",
    "content-language",
    "cache-control",
    "expires",
];

#[derive(Debug, Error)]
pub enum MirrorError {
    #[error("replica '{0}' is not attached to the primary bucket")]
    UnknownReplica(String),

    #[error("cannot rebuild original request: {0}")]
    InvalidRequest(#[from] anyhow::Error),

    #[error(transparent)]
    Backend(#[from] BackendError),

    #[error("{step} answered {status}")]
    Rejected { step: &'static str, status: StatusCode },
}

/// Execute `task` against its replica.
///
/// The replica handle is taken from the primary's own replica set, never
/// looked up independently.
pub async fn process_task(backends: &Backends, task: &MirrorTask) -> Result<(), MirrorError> {
    let main = &task.main_bucket;
    let replica = main
        .find_replica(&task.backup_bucket.name)
        .ok_or_else(|| MirrorError::UnknownReplica(task.backup_bucket.name.clone()))?;
    let request = ProxyRequest::from_serialized(&task.original_request)?;

    debug!(
        "Mirroring {} on '{}' to '{}' (nonce {})",
        task.command.as_str(),
        main.name,
        replica.name,
        task.nonce
    );

    match task.command {
        // The body is not kept in the task: both re-read the primary's
        // current object, which may be newer than the triggering write.
        MirrorCommand::PutObject | MirrorCommand::CopyObject => {
            mirror_put_object(backends, main, replica, &request).await
        }
        MirrorCommand::DeleteObject => {
            let delete = derived_request(&request, Method::DELETE, HeaderMap::new(), Bytes::new());
            let resp = run(backends, Operation::DeleteObject, replica, &delete).await?;
            expect_success("delete object", &resp)
        }
        MirrorCommand::CreateBucket => mirror_create_bucket(backends, replica, &request).await,
        MirrorCommand::DeleteBucket => {
            let delete = derived_request(&request, Method::DELETE, HeaderMap::new(), Bytes::new());
            let resp = run(backends, Operation::DeleteBucket, replica, &delete).await?;
            expect_success("delete bucket", &resp)
        }
    }
}

async fn mirror_put_object(
    backends: &Backends,
    main: &Bucket,
    replica: &Bucket,
    request: &ProxyRequest,
) -> Result<(), MirrorError> {
    let fetch = derived_request(request, Method::GET, HeaderMap::new(), Bytes::new());
    let source = run(backends, Operation::GetObject, main, &fetch).await?;
    expect_success("fetch from primary", &source)?;

    let mut headers = HeaderMap::new();
    for (name, value) in &source.headers {
        let lower = name.as_str();
        if CARRIED_HEADERS.contains(&lower) || lower.starts_with("x-amz-meta-") {
            headers.append(name.clone(), value.clone());
        }
    }

    let checksum = hex::encode(Md5::digest(&source.body));
    let put = derived_request(request, Method::PUT, headers, source.body);
    let resp = run(backends, Operation::PutObject, replica, &put).await?;
    expect_success("put to replica", &resp)?;

    // Single-part uploads carry the MD5 as ETag on both protocols.
    if let Some(etag) = resp.header("etag") {
        if etag.trim_matches('"') != checksum {
            warn!(
                "Replica '{}' ETag {etag} differs from primary content MD5 {checksum}",
                replica.name
            );
        }
    }
    Ok(())
}

async fn mirror_create_bucket(
    backends: &Backends,
    replica: &Bucket,
    request: &ProxyRequest,
) -> Result<(), MirrorError> {
    let (headers, body) = match (replica.protocol(), replica.s3_config()) {
        (Protocol::S3, Some(config)) => {
            let mut headers = HeaderMap::new();
            headers.insert("content-type", HeaderValue::from_static("application/xml"));
            let body = render_create_bucket_configuration(&config.region);
            (headers, Bytes::from(body))
        }
        _ => (HeaderMap::new(), Bytes::new()),
    };
    let create = derived_request(request, Method::PUT, headers, body);
    let resp = run(backends, Operation::CreateBucket, replica, &create).await?;
    expect_success("create bucket", &resp)
}

async fn run(
    backends: &Backends,
    op: Operation,
    bucket: &Bucket,
    request: &ProxyRequest,
) -> Result<BackendResponse, BackendError> {
    backends.run(op, bucket, request, RetryPolicy::FORWARD).await
}

/// Same bucket and key as `original`, with a new method, headers and body.
fn derived_request(
    original: &ProxyRequest,
    method: Method,
    headers: HeaderMap,
    body: Bytes,
) -> ProxyRequest {
    ProxyRequest {
        method,
        bucket: original.bucket.clone(),
        key: original.key.clone(),
        path: original.path.clone(),
        raw_query: String::new(),
        query: Vec::new(),
        headers,
        body,
    }
}

fn expect_success(step: &'static str, resp: &BackendResponse) -> Result<(), MirrorError> {
    if resp.is_success() {
        Ok(())
    } else {
        Err(MirrorError::Rejected {
            step,
            status: resp.status,
        })
    }
}
