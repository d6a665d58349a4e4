//! Request resolution.
//!
//! Maps a decoded S3 request to an [`Operation`], finds the bucket that
//! owns it and runs it on the primary. Reads that fail on the primary are
//! retried synchronously against each replica in order; successful
//! mutations fan out one mirror task per replica.

use axum::http::{HeaderValue, Method};
use metrics::counter;
use tracing::{debug, info, warn};

use crate::auth::{s3_uri_encode, verify_request};
use crate::backends::{parse_copy_source, BackendResponse, Operation, SubResource};
use crate::buckets::Bucket;
use crate::config::Protocol;
use crate::errors::S3Error;
use crate::replication::{MirrorCommand, MirrorTask};
use crate::request::ProxyRequest;
use crate::retry::RetryPolicy;
use crate::AppState;

/// Query parameters accepted on a bucket listing.
const LIST_PARAMS: &[&str] = &[
    "list-type",
    "prefix",
    "delimiter",
    "continuation-token",
    "start-after",
    "max-keys",
    "encoding-type",
    "fetch-owner",
    "x-id",
];

/// Query parameters accepted on object calls, besides `response-*`
/// overrides.
const OBJECT_PARAMS: &[&str] = &["x-id", "versionId"];

/// Query parameters accepted on multipart upload calls.
const MULTIPART_PARAMS: &[&str] = &["uploads", "uploadId", "partNumber", "x-id"];

/// Decide which operation `req` asks for.
pub fn classify(req: &ProxyRequest) -> Result<Operation, S3Error> {
    let op = match (&req.method, req.key.is_some()) {
        (&Method::GET, true) => Operation::GetObject,
        (&Method::HEAD, true) => Operation::HeadObject,
        (&Method::POST, true) if req.has_query("uploads") => Operation::CreateMultipartUpload,
        (&Method::POST, true) if req.has_query("uploadId") => Operation::CompleteMultipartUpload,
        (&Method::PUT, true) if req.header("x-amz-copy-source").is_some() => Operation::CopyObject,
        (&Method::PUT, true) if req.has_query("uploadId") && req.has_query("partNumber") => {
            Operation::UploadPart
        }
        (&Method::PUT, true) => Operation::PutObject,
        (&Method::DELETE, true) if req.has_query("uploadId") => Operation::AbortMultipartUpload,
        (&Method::DELETE, true) => Operation::DeleteObject,
        (&Method::GET, false) => return classify_bucket_read(req),
        (&Method::PUT, false) => Operation::CreateBucket,
        (&Method::DELETE, false) => Operation::DeleteBucket,
        (&Method::HEAD, false) => Operation::HeadBucket,
        (method, _) => {
            return Err(S3Error::InvalidRequest {
                message: format!("Unsupported method {method}"),
            })
        }
    };

    let allowed: &[&str] = match op {
        Operation::CreateMultipartUpload
        | Operation::UploadPart
        | Operation::CompleteMultipartUpload
        | Operation::AbortMultipartUpload => MULTIPART_PARAMS,
        _ if req.key.is_some() => OBJECT_PARAMS,
        _ => &["x-id"],
    };
    check_params(req, allowed)?;
    Ok(op)
}

fn classify_bucket_read(req: &ProxyRequest) -> Result<Operation, S3Error> {
    if let Some(resource) = req
        .query
        .iter()
        .find_map(|(name, _)| SubResource::from_query_name(name))
    {
        return Ok(Operation::GetBucketSubResource(resource));
    }
    if let Some(list_type) = req.query_value("list-type") {
        if list_type != "2" {
            return Err(S3Error::InvalidRequest {
                message: format!("Unsupported list-type '{list_type}'"),
            });
        }
    }
    check_params(req, LIST_PARAMS)?;
    Ok(Operation::ListObjects)
}

fn check_params(req: &ProxyRequest, allowed: &[&str]) -> Result<(), S3Error> {
    let unsupported = req.query.iter().find(|(name, _)| {
        !allowed.contains(&name.as_str())
            && !(req.key.is_some() && name.starts_with("response-"))
    });
    match unsupported {
        Some((name, _)) => Err(S3Error::InvalidRequest {
            message: format!("Unsupported query parameter '{name}'"),
        }),
        None => Ok(()),
    }
}

/// Resolve and execute `req`.
///
/// The returned response is what the client sees: the backend's answer, a
/// replica's answer after failover, or a synthesized S3 error document.
pub async fn resolve(state: &AppState, mut req: ProxyRequest) -> Result<BackendResponse, S3Error> {
    let name = req.bucket.clone().ok_or_else(|| S3Error::InvalidRequest {
        message: "Bucket name is required".to_string(),
    })?;
    let op = classify(&req)?;

    let bucket = state
        .buckets
        .get(&name)
        .ok_or_else(|| S3Error::NoSuchBucket {
            bucket: name.clone(),
        })?;
    if !state.config.backends.contains_key(&bucket.backend_name) {
        return Err(S3Error::NoSuchBackend {
            bucket: name,
            backend: bucket.backend_name.clone(),
        });
    }

    if state.config.auth.verify_signatures && bucket.protocol() == Protocol::S3 {
        if let Some(config) = bucket.s3_config() {
            verify_request(
                req.method.as_str(),
                &req.path,
                &req.raw_query,
                &req.headers,
                &req.body,
                &config.credentials,
            )?;
        }
    }

    if op == Operation::CopyObject {
        resolve_copy_source(state, bucket, &mut req)?;
    }

    debug!("{} on '{}' -> {}", op.as_str(), name, bucket.backend_name);
    if op.is_read() {
        Ok(read_with_failover(state, op, bucket, &req).await)
    } else {
        Ok(mutate(state, op, bucket, &req).await)
    }
}

/// Point `x-amz-copy-source` at the physical bucket behind its logical
/// name. Both sides of a copy must live on the same backend.
fn resolve_copy_source(
    state: &AppState,
    bucket: &Bucket,
    req: &mut ProxyRequest,
) -> Result<(), S3Error> {
    let Some(raw) = req.header("x-amz-copy-source").map(str::to_string) else {
        return Ok(());
    };
    let invalid = || S3Error::InvalidArgument {
        message: format!("Invalid copy source '{raw}'"),
    };
    let (source_name, source_key) = parse_copy_source(&raw).ok_or_else(invalid)?;
    let source = state
        .buckets
        .get(&source_name)
        .ok_or_else(|| S3Error::NoSuchBucket {
            bucket: source_name.clone(),
        })?;
    if source.backend_name != bucket.backend_name {
        return Err(S3Error::InvalidRequest {
            message: format!(
                "Cannot copy from '{source_name}' on '{}' to '{}' on '{}'",
                source.backend_name, bucket.name, bucket.backend_name
            ),
        });
    }

    let version = raw
        .split_once('?')
        .map(|(_, query)| format!("?{query}"))
        .unwrap_or_default();
    let physical = format!(
        "/{}/{}{version}",
        source.physical_name(),
        s3_uri_encode(&source_key, false)
    );
    let value = HeaderValue::from_str(&physical).map_err(|_| invalid())?;
    req.headers.insert("x-amz-copy-source", value);
    Ok(())
}

/// Retry budget for reads: one attempt per location when there is a
/// failover path, so a dead primary does not hold the client up.
fn read_policy(bucket: &Bucket) -> RetryPolicy {
    if bucket.has_replicas() || bucket.is_replica() {
        RetryPolicy::FORWARD.single_attempt()
    } else {
        RetryPolicy::FORWARD
    }
}

async fn read_with_failover(
    state: &AppState,
    op: Operation,
    bucket: &Bucket,
    req: &ProxyRequest,
) -> BackendResponse {
    let policy = read_policy(bucket);
    let primary_failure = match state.backends.run(op, bucket, req, policy).await {
        Ok(resp) if resp.is_success() => return resp,
        Ok(resp) => resp,
        Err(err) => err.into_backend_response(),
    };
    if !bucket.has_replicas() {
        return primary_failure;
    }

    for replica in &bucket.replicas {
        match state.backends.run(op, replica, req, policy).await {
            Ok(resp) if resp.is_success() => {
                info!(
                    "{} on '{}' served by replica '{}'",
                    op.as_str(),
                    bucket.name,
                    replica.name
                );
                counter!(crate::metrics::REPLICA_FAILOVERS_TOTAL, "outcome" => "served")
                    .increment(1);
                return resp;
            }
            Ok(resp) => debug!("Replica '{}' answered {}", replica.name, resp.status),
            Err(err) => debug!("Replica '{}' failed: {err}", replica.name),
        }
    }

    warn!(
        "{} on '{}' failed on the primary and every replica",
        op.as_str(),
        bucket.name
    );
    counter!(crate::metrics::REPLICA_FAILOVERS_TOTAL, "outcome" => "exhausted").increment(1);
    primary_failure
}

async fn mutate(
    state: &AppState,
    op: Operation,
    bucket: &Bucket,
    req: &ProxyRequest,
) -> BackendResponse {
    let resp = match state.backends.run(op, bucket, req, RetryPolicy::FORWARD).await {
        Ok(resp) => resp,
        Err(err) => return err.into_backend_response(),
    };

    if resp.is_success() {
        if let Some(command) = MirrorCommand::for_operation(op) {
            for task in MirrorTask::for_replicas(bucket, command, req) {
                state.tasks.enqueue(task).await;
            }
        }
    }
    resp
}
