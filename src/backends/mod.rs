//! Protocol adapters.
//!
//! Every backend operation goes through a [`ProtocolAdapter`]; one
//! implementation speaks S3, the other translates to OpenStack Swift.
//! Adapters return their outcome as a value so the resolver can decide
//! whether to fail over to a replica.

pub mod s3;
pub mod swift;

use axum::http::{HeaderMap, HeaderValue, StatusCode};
use axum::response::{IntoResponse, Response};
use bytes::Bytes;
use metrics::counter;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Instant;
use thiserror::Error;
use tracing::{info, warn};

use crate::buckets::Bucket;
use crate::config::Protocol;
use crate::errors::{generate_request_id, S3Error};
use crate::forward::Forwarder;
use crate::request::ProxyRequest;
use crate::retry::RetryPolicy;
use crate::xml::render_error;

use self::s3::S3Adapter;
use self::swift::SwiftAdapter;

// ── Responses ───────────────────────────────────────────────────────

/// A fully buffered backend response, relayed to the client as is.
#[derive(Debug, Clone)]
pub struct BackendResponse {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Bytes,
}

const HOP_BY_HOP: &[&str] = &[
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

impl BackendResponse {
    pub fn new(status: StatusCode, headers: HeaderMap, body: Bytes) -> Self {
        Self {
            status,
            headers,
            body,
        }
    }

    /// A synthesized XML document.
    pub fn xml(status: StatusCode, body: String) -> Self {
        let mut headers = HeaderMap::new();
        headers.insert("content-type", HeaderValue::from_static("application/xml"));
        Self::new(status, headers, Bytes::from(body))
    }

    pub fn is_success(&self) -> bool {
        self.status.is_success()
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }
}

impl From<S3Error> for BackendResponse {
    fn from(err: S3Error) -> Self {
        let request_id = generate_request_id();
        let body = render_error(err.code(), &err.to_string(), &err.resource(), &request_id);
        let mut response = BackendResponse::xml(err.status_code(), body);
        if let Ok(value) = HeaderValue::from_str(&request_id) {
            response.headers.insert("x-amz-request-id", value);
        }
        response
    }
}

impl IntoResponse for BackendResponse {
    fn into_response(self) -> Response {
        let mut headers = self.headers;
        for name in HOP_BY_HOP {
            headers.remove(*name);
        }
        // Keep the upstream length only when there is no body to measure
        // (HEAD responses).
        if !self.body.is_empty() {
            headers.remove("content-length");
        }
        (self.status, headers, self.body).into_response()
    }
}

// ── Errors ──────────────────────────────────────────────────────────

/// Failure talking to a backend.
#[derive(Debug, Error)]
pub enum BackendError {
    #[error("transport error: {0}")]
    Transport(#[from] reqwest::Error),

    /// The backend answered with a server error after every retry.
    #[error("backend responded with {}", .0.status)]
    Status(BackendResponse),

    #[error("swift authentication failed: {0}")]
    SwiftAuth(String),

    #[error("no public object-store endpoint in region '{region}'")]
    MissingEndpoint { region: String },

    #[error("malformed backend payload: {0}")]
    InvalidPayload(String),

    #[error("cannot build backend request: {0}")]
    InvalidRequest(String),
}

impl BackendError {
    /// Response seen by the client when no replica could serve instead.
    pub fn into_backend_response(self) -> BackendResponse {
        match self {
            BackendError::Status(response) => response,
            other => S3Error::BadGateway {
                message: other.to_string(),
            }
            .into(),
        }
    }
}

impl IntoResponse for BackendError {
    fn into_response(self) -> Response {
        if !matches!(self, BackendError::Status(_)) {
            tracing::error!("Backend failure: {self}");
        }
        self.into_backend_response().into_response()
    }
}

pub type AdapterResult = Result<BackendResponse, BackendError>;

pub type AdapterFuture<'a> = Pin<Box<dyn Future<Output = AdapterResult> + Send + 'a>>;

// ── Operations ──────────────────────────────────────────────────────

/// Bucket sub-resources addressed by a bare query flag (`?acl`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubResource {
    Policy,
    Acl,
    Cors,
    Website,
    Versioning,
    Accelerate,
    RequestPayment,
    Logging,
    Lifecycle,
    Replication,
    Encryption,
    ObjectLock,
    Tagging,
}

impl SubResource {
    pub const ALL: [SubResource; 13] = [
        SubResource::Policy,
        SubResource::Acl,
        SubResource::Cors,
        SubResource::Website,
        SubResource::Versioning,
        SubResource::Accelerate,
        SubResource::RequestPayment,
        SubResource::Logging,
        SubResource::Lifecycle,
        SubResource::Replication,
        SubResource::Encryption,
        SubResource::ObjectLock,
        SubResource::Tagging,
    ];

    pub fn query_name(&self) -> &'static str {
        match self {
            SubResource::Policy => "policy",
            SubResource::Acl => "acl",
            SubResource::Cors => "cors",
            SubResource::Website => "website",
            SubResource::Versioning => "versioning",
            SubResource::Accelerate => "accelerate",
            SubResource::RequestPayment => "requestPayment",
            SubResource::Logging => "logging",
            SubResource::Lifecycle => "lifecycle",
            SubResource::Replication => "replication",
            SubResource::Encryption => "encryption",
            SubResource::ObjectLock => "object-lock",
            SubResource::Tagging => "tagging",
        }
    }

    pub fn from_query_name(name: &str) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.query_name() == name)
    }
}

/// One proxy-level operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Operation {
    GetObject,
    HeadObject,
    PutObject,
    DeleteObject,
    CopyObject,
    ListObjects,
    CreateBucket,
    DeleteBucket,
    HeadBucket,
    GetBucketSubResource(SubResource),
    CreateMultipartUpload,
    UploadPart,
    CompleteMultipartUpload,
    AbortMultipartUpload,
}

impl Operation {
    /// Reads may fail over to replicas; they never enqueue mirror tasks.
    pub fn is_read(&self) -> bool {
        matches!(
            self,
            Operation::GetObject
                | Operation::HeadObject
                | Operation::ListObjects
                | Operation::HeadBucket
                | Operation::GetBucketSubResource(_)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::GetObject => "GetObject",
            Operation::HeadObject => "HeadObject",
            Operation::PutObject => "PutObject",
            Operation::DeleteObject => "DeleteObject",
            Operation::CopyObject => "CopyObject",
            Operation::ListObjects => "ListObjectsV2",
            Operation::CreateBucket => "CreateBucket",
            Operation::DeleteBucket => "DeleteBucket",
            Operation::HeadBucket => "HeadBucket",
            Operation::GetBucketSubResource(_) => "GetBucketSubResource",
            Operation::CreateMultipartUpload => "CreateMultipartUpload",
            Operation::UploadPart => "UploadPart",
            Operation::CompleteMultipartUpload => "CompleteMultipartUpload",
            Operation::AbortMultipartUpload => "AbortMultipartUpload",
        }
    }
}

// ── Adapter contract ────────────────────────────────────────────────

/// Executes proxy-level operations against one backend protocol.
///
/// `bucket` is the location to talk to (a primary or one replica); the
/// request still carries the client's logical bucket name.
pub trait ProtocolAdapter: Send + Sync {
    fn get_object<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a>;

    fn head_object<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a>;

    fn put_object<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a>;

    fn delete_object<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a>;

    /// Server-side copy; the source comes from `x-amz-copy-source`, which
    /// already names the source's physical bucket.
    fn copy_object<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a>;

    /// ListObjectsV2, answered as S3 XML whatever the backend.
    fn list_objects<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a>;

    fn create_bucket<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a>;

    fn delete_bucket<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a>;

    fn head_bucket<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a>;

    fn get_bucket_subresource<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        resource: SubResource,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a>;

    /// Start a multipart upload and answer with its upload id.
    fn create_multipart_upload<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a>;

    fn upload_part<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a>;

    /// Assemble the parts listed in the request body into the object.
    fn complete_multipart_upload<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a>;

    fn abort_multipart_upload<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a>;

    /// Dispatch `op` to the matching method.
    fn execute<'a>(
        &'a self,
        op: Operation,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        match op {
            Operation::GetObject => self.get_object(bucket, req, policy),
            Operation::HeadObject => self.head_object(bucket, req, policy),
            Operation::PutObject => self.put_object(bucket, req, policy),
            Operation::DeleteObject => self.delete_object(bucket, req, policy),
            Operation::CopyObject => self.copy_object(bucket, req, policy),
            Operation::ListObjects => self.list_objects(bucket, req, policy),
            Operation::CreateBucket => self.create_bucket(bucket, req, policy),
            Operation::DeleteBucket => self.delete_bucket(bucket, req, policy),
            Operation::HeadBucket => self.head_bucket(bucket, req, policy),
            Operation::GetBucketSubResource(resource) => {
                self.get_bucket_subresource(bucket, req, resource, policy)
            }
            Operation::CreateMultipartUpload => self.create_multipart_upload(bucket, req, policy),
            Operation::UploadPart => self.upload_part(bucket, req, policy),
            Operation::CompleteMultipartUpload => {
                self.complete_multipart_upload(bucket, req, policy)
            }
            Operation::AbortMultipartUpload => self.abort_multipart_upload(bucket, req, policy),
        }
    }
}

/// Both adapters, selected by a bucket's protocol tag.
#[derive(Clone)]
pub struct Backends {
    s3: Arc<S3Adapter>,
    swift: Arc<SwiftAdapter>,
    forwarder: Forwarder,
}

impl Backends {
    pub fn new(forwarder: Forwarder) -> Self {
        Self {
            s3: Arc::new(S3Adapter::new(forwarder.clone())),
            swift: Arc::new(SwiftAdapter::new(forwarder.clone())),
            forwarder,
        }
    }

    pub fn adapter(&self, protocol: Protocol) -> &dyn ProtocolAdapter {
        match protocol {
            Protocol::S3 => self.s3.as_ref(),
            Protocol::Swift => self.swift.as_ref(),
        }
    }

    pub fn forwarder(&self) -> &Forwarder {
        &self.forwarder
    }

    /// Run `op` against `bucket` with its protocol's adapter, logging and
    /// counting the outcome.
    pub async fn run(
        &self,
        op: Operation,
        bucket: &Bucket,
        req: &ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterResult {
        let protocol = bucket.protocol();
        let start = Instant::now();
        let result = self.adapter(protocol).execute(op, bucket, req, policy).await;

        let outcome = match &result {
            Ok(resp) if resp.is_success() => {
                info!(
                    "[{}] {} on '{}' succeeded: {} ({:?})",
                    protocol.as_str(),
                    op.as_str(),
                    bucket.name,
                    resp.status,
                    start.elapsed()
                );
                "success"
            }
            Ok(resp) => {
                warn!(
                    "[{}] {} on '{}' failed: {}",
                    protocol.as_str(),
                    op.as_str(),
                    bucket.name,
                    resp.status
                );
                "rejected"
            }
            Err(err) => {
                warn!(
                    "[{}] {} on '{}' errored: {err}",
                    protocol.as_str(),
                    op.as_str(),
                    bucket.name
                );
                "error"
            }
        };
        counter!(
            crate::metrics::BACKEND_REQUESTS_TOTAL,
            "protocol" => protocol.as_str(),
            "operation" => op.as_str(),
            "outcome" => outcome,
        )
        .increment(1);
        result
    }
}

/// Quote an ETag the way S3 clients expect.
pub(crate) fn quote_etag(etag: &str) -> String {
    let bare = etag.trim_matches('"');
    format!("\"{bare}\"")
}

/// Split an `x-amz-copy-source` value into decoded bucket and key.
pub(crate) fn parse_copy_source(raw: &str) -> Option<(String, String)> {
    let without_version = raw.split('?').next().unwrap_or_default();
    let decoded = percent_encoding::percent_decode_str(without_version)
        .decode_utf8_lossy()
        .into_owned();
    let trimmed = decoded.trim_start_matches('/');
    let (bucket, key) = trimmed.split_once('/')?;
    if bucket.is_empty() || key.is_empty() {
        return None;
    }
    Some((bucket.to_string(), key.to_string()))
}
