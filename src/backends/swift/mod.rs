//! OpenStack Swift protocol adapter.
//!
//! Translates S3 operations into Swift calls against
//! `{storage_url}/{container}/{object}` and reshapes Swift answers into
//! what an S3 client expects: status codes, metadata headers, listings and
//! error documents. Every operation authenticates first.

pub mod auth;
pub mod listing;
pub mod multipart;

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use chrono::{DateTime, Utc};
use reqwest::Url;
use serde_json::json;

use self::auth::{authenticate, SwiftSession};
use self::listing::{parse_listing, to_list_bucket_result, ListParams};
use super::{
    parse_copy_source, quote_etag, AdapterFuture, AdapterResult, BackendError, BackendResponse,
    ProtocolAdapter, SubResource,
};
use crate::auth::s3_uri_encode;
use crate::buckets::Bucket;
use crate::config::SwiftConfig;
use crate::errors::S3Error;
use crate::forward::{encode_query, header_name, Forwarder, OutboundRequest};
use crate::request::ProxyRequest;
use crate::retry::RetryPolicy;
use crate::xml::{
    render_access_control_policy, render_copy_object_result, render_empty_configuration,
    render_empty_tagging, render_list_bucket_result, PublicGrants,
};

const S3_META_PREFIX: &str = "x-amz-meta-";
const SWIFT_META_PREFIX: &str = "x-object-meta-";

/// Inbound headers passed to Swift unchanged.
const FORWARDED_REQUEST_HEADERS: &[&str] = &[
    "content-type",
    "content-encoding",
    "content-disposition",
    "content-language",
    "cache-control",
    "expires",
    "range",
    "if-match",
    "if-none-match",
    "if-modified-since",
    "if-unmodified-since",
];

/// Swift response headers relayed to the client unchanged.
const RELAYED_RESPONSE_HEADERS: &[&str] = &[
    "content-type",
    "content-length",
    "content-range",
    "content-encoding",
    "content-disposition",
    "content-language",
    "cache-control",
    "expires",
    "last-modified",
    "accept-ranges",
];

pub struct SwiftAdapter {
    forwarder: Forwarder,
}

/// What a request addresses, for translating Swift 404s.
#[derive(Clone, Copy)]
enum Target<'a> {
    Object(&'a str),
    Container(&'a str),
}

impl SwiftAdapter {
    pub fn new(forwarder: Forwarder) -> Self {
        Self { forwarder }
    }

    fn config(bucket: &Bucket) -> Result<&SwiftConfig, BackendError> {
        bucket.swift_config().ok_or_else(|| {
            BackendError::InvalidRequest(format!("bucket '{}' is not a Swift bucket", bucket.name))
        })
    }

    async fn session(&self, config: &SwiftConfig) -> Result<SwiftSession, BackendError> {
        authenticate(self.forwarder.client(), config).await
    }

    async fn call(
        &self,
        method: Method,
        url: Url,
        headers: HeaderMap,
        body: Bytes,
        policy: RetryPolicy,
    ) -> AdapterResult {
        let request = OutboundRequest {
            method,
            url,
            headers,
            body,
        };
        self.forwarder.send(&request, policy).await
    }

    async fn object_call(
        &self,
        method: Method,
        bucket: &Bucket,
        req: &ProxyRequest,
        body: Bytes,
        policy: RetryPolicy,
    ) -> AdapterResult {
        let config = Self::config(bucket)?;
        let key = object_key(req)?;
        let session = self.session(config).await?;
        let url = object_url(&session, &config.container, key)?;
        let headers = request_headers(&session, &req.headers)?;
        self.call(method, url, headers, body, policy).await
    }

    async fn container_call(
        &self,
        method: Method,
        bucket: &Bucket,
        query: &[(String, String)],
        extra: HeaderMap,
        policy: RetryPolicy,
    ) -> AdapterResult {
        let config = Self::config(bucket)?;
        let session = self.session(config).await?;
        let mut url = container_url(&session, &config.container)?;
        url.set_query(encode_query(query).as_deref());
        let mut headers = session.headers()?;
        for (name, value) in &extra {
            headers.insert(name.clone(), value.clone());
        }
        self.call(method, url, headers, Bytes::new(), policy).await
    }

    /// Read the container's ACL headers.
    async fn container_acl(&self, bucket: &Bucket, policy: RetryPolicy) -> AdapterResult {
        self.container_call(Method::HEAD, bucket, &[], HeaderMap::new(), policy)
            .await
    }
}

impl ProtocolAdapter for SwiftAdapter {
    fn get_object<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(async move {
            let resp = self
                .object_call(Method::GET, bucket, req, Bytes::new(), policy)
                .await?;
            let key = object_key(req)?;
            Ok(translate_failure(&resp, Target::Object(key))
                .unwrap_or_else(|| relay_object(resp)))
        })
    }

    fn head_object<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(async move {
            let resp = self
                .object_call(Method::HEAD, bucket, req, Bytes::new(), policy)
                .await?;
            let key = object_key(req)?;
            Ok(translate_failure(&resp, Target::Object(key))
                .unwrap_or_else(|| relay_object(resp)))
        })
    }

    fn put_object<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(async move {
            let resp = self
                .object_call(Method::PUT, bucket, req, req.body.clone(), policy)
                .await?;
            let key = object_key(req)?;
            if let Some(failure) = translate_failure(&resp, Target::Object(key)) {
                return Ok(failure);
            }
            let mut headers = HeaderMap::new();
            if let Some(etag) = resp.header("etag") {
                insert_header(&mut headers, "etag", &quote_etag(etag));
            }
            Ok(BackendResponse::new(
                created_to_ok(resp.status),
                headers,
                Bytes::new(),
            ))
        })
    }

    fn delete_object<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(async move {
            let resp = self
                .object_call(Method::DELETE, bucket, req, Bytes::new(), policy)
                .await?;
            // S3 deletes are idempotent: a missing object is still a 204.
            if resp.is_success() || resp.status == StatusCode::NOT_FOUND {
                return Ok(BackendResponse::new(
                    StatusCode::NO_CONTENT,
                    HeaderMap::new(),
                    Bytes::new(),
                ));
            }
            let key = object_key(req)?;
            Ok(translate_failure(&resp, Target::Object(key)).unwrap_or(resp))
        })
    }

    fn copy_object<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(async move {
            let config = Self::config(bucket)?;
            let key = object_key(req)?;
            let raw_source = req.header("x-amz-copy-source").unwrap_or_default();
            let (source_bucket, source_key) = parse_copy_source(raw_source).ok_or_else(|| {
                BackendError::InvalidRequest(format!("invalid x-amz-copy-source '{raw_source}'"))
            })?;

            let session = self.session(config).await?;
            let url = object_url(&session, &config.container, key)?;
            let mut headers = request_headers(&session, &req.headers)?;
            let copy_from = format!(
                "/{}/{}",
                s3_uri_encode(&source_bucket, true),
                s3_uri_encode(&source_key, false)
            );
            insert_header(&mut headers, "x-copy-from", &copy_from);

            let resp = self
                .call(Method::PUT, url, headers, Bytes::new(), policy)
                .await?;
            if resp.status == StatusCode::NOT_FOUND {
                return Ok(S3Error::NoSuchKey { key: source_key }.into());
            }
            if let Some(failure) = translate_failure(&resp, Target::Object(key)) {
                return Ok(failure);
            }

            let etag = quote_etag(resp.header("etag").unwrap_or_default());
            let last_modified = resp
                .header("last-modified")
                .and_then(|v| httpdate::parse_http_date(v).ok())
                .map(DateTime::<Utc>::from)
                .unwrap_or_else(Utc::now)
                .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                .to_string();
            Ok(BackendResponse::xml(
                StatusCode::OK,
                render_copy_object_result(&etag, &last_modified),
            ))
        })
    }

    fn list_objects<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(async move {
            let params = ListParams::from_query(&req.query);
            let mut accept = HeaderMap::new();
            accept.insert("accept", HeaderValue::from_static("application/json"));
            let resp = self
                .container_call(Method::GET, bucket, &params.swift_query(), accept, policy)
                .await?;
            let name = req.bucket.as_deref().unwrap_or(&bucket.name);
            if let Some(failure) = translate_failure(&resp, Target::Container(name)) {
                return Ok(failure);
            }

            let entries = parse_listing(&resp.body)?;
            let result = to_list_bucket_result(name, &params, &entries);
            Ok(BackendResponse::xml(
                StatusCode::OK,
                render_list_bucket_result(&result),
            ))
        })
    }

    fn create_bucket<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(async move {
            let resp = self
                .container_call(Method::PUT, bucket, &[], HeaderMap::new(), policy)
                .await?;
            let name = req.bucket.as_deref().unwrap_or(&bucket.name);
            if let Some(failure) = translate_failure(&resp, Target::Container(name)) {
                return Ok(failure);
            }
            let mut headers = HeaderMap::new();
            insert_header(&mut headers, "location", &format!("/{name}"));
            Ok(BackendResponse::new(
                created_to_ok(resp.status),
                headers,
                Bytes::new(),
            ))
        })
    }

    fn delete_bucket<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(async move {
            let resp = self
                .container_call(Method::DELETE, bucket, &[], HeaderMap::new(), policy)
                .await?;
            let name = req.bucket.as_deref().unwrap_or(&bucket.name);
            if let Some(failure) = translate_failure(&resp, Target::Container(name)) {
                return Ok(failure);
            }
            Ok(BackendResponse::new(
                StatusCode::NO_CONTENT,
                HeaderMap::new(),
                Bytes::new(),
            ))
        })
    }

    fn head_bucket<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(async move {
            let config = Self::config(bucket)?;
            let resp = self
                .container_call(Method::HEAD, bucket, &[], HeaderMap::new(), policy)
                .await?;
            let name = req.bucket.as_deref().unwrap_or(&bucket.name);
            if let Some(failure) = translate_failure(&resp, Target::Container(name)) {
                return Ok(failure);
            }
            let mut headers = HeaderMap::new();
            insert_header(&mut headers, "x-amz-bucket-region", &config.region);
            Ok(BackendResponse::new(StatusCode::OK, headers, Bytes::new()))
        })
    }

    fn get_bucket_subresource<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        resource: SubResource,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(async move {
            let name = req.bucket.as_deref().unwrap_or(&bucket.name);
            match resource {
                SubResource::RequestPayment => Ok(S3Error::MethodNotAllowed.into()),
                SubResource::Policy | SubResource::Acl => {
                    let resp = self.container_acl(bucket, policy).await?;
                    if let Some(failure) = translate_failure(&resp, Target::Container(name)) {
                        return Ok(failure);
                    }
                    let grants = PublicGrants {
                        read: is_public(resp.header("x-container-read")),
                        write: is_public(resp.header("x-container-write")),
                    };
                    if resource == SubResource::Acl {
                        let owner = bucket
                            .swift_config()
                            .map(|c| c.credentials.project_name.as_str())
                            .filter(|p| !p.is_empty())
                            .unwrap_or(name);
                        Ok(BackendResponse::xml(
                            StatusCode::OK,
                            render_access_control_policy(owner, grants),
                        ))
                    } else {
                        let mut headers = HeaderMap::new();
                        headers.insert("content-type", HeaderValue::from_static("application/json"));
                        Ok(BackendResponse::new(
                            StatusCode::OK,
                            headers,
                            Bytes::from(bucket_policy(name, grants).to_string()),
                        ))
                    }
                }
                other => Ok(unconfigured(other)),
            }
        })
    }

    fn create_multipart_upload<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(self.create_upload(bucket, req, policy))
    }

    fn upload_part<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(self.put_part(bucket, req, policy))
    }

    fn complete_multipart_upload<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(self.complete_upload(bucket, req, policy))
    }

    fn abort_multipart_upload<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(self.abort_upload(bucket, req, policy))
    }
}

// ── Translation helpers ─────────────────────────────────────────────

fn object_key(req: &ProxyRequest) -> Result<&str, BackendError> {
    req.key
        .as_deref()
        .ok_or_else(|| BackendError::InvalidRequest("object key missing".to_string()))
}

fn container_url(session: &SwiftSession, container: &str) -> Result<Url, BackendError> {
    let raw = format!(
        "{}/{}",
        session.storage_url.trim_end_matches('/'),
        s3_uri_encode(container, true)
    );
    Url::parse(&raw).map_err(|e| BackendError::InvalidRequest(format!("bad storage url: {e}")))
}

fn object_url(session: &SwiftSession, container: &str, key: &str) -> Result<Url, BackendError> {
    let raw = format!(
        "{}/{}/{}",
        session.storage_url.trim_end_matches('/'),
        s3_uri_encode(container, true),
        s3_uri_encode(key, false)
    );
    Url::parse(&raw).map_err(|e| BackendError::InvalidRequest(format!("bad storage url: {e}")))
}

/// Session headers plus the client's content headers, with S3 user
/// metadata renamed to Swift object metadata.
fn request_headers(session: &SwiftSession, inbound: &HeaderMap) -> Result<HeaderMap, BackendError> {
    let mut headers = session.headers()?;
    for (name, value) in inbound {
        let lower = name.as_str();
        if FORWARDED_REQUEST_HEADERS.contains(&lower) {
            headers.append(name.clone(), value.clone());
        } else if let Some(meta) = lower.strip_prefix(S3_META_PREFIX) {
            headers.append(header_name(&format!("{SWIFT_META_PREFIX}{meta}"))?, value.clone());
        }
    }
    Ok(headers)
}

/// Swift object response headers as S3 headers.
fn response_headers(swift: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in swift {
        let lower = name.as_str();
        if RELAYED_RESPONSE_HEADERS.contains(&lower) {
            headers.append(name.clone(), value.clone());
        } else if lower == "etag" {
            if let Ok(etag) = value.to_str() {
                insert_header(&mut headers, "etag", &quote_etag(etag));
            }
        } else if let Some(meta) = lower.strip_prefix(SWIFT_META_PREFIX) {
            if let Ok(name) = HeaderName::from_bytes(format!("{S3_META_PREFIX}{meta}").as_bytes())
            {
                headers.append(name, value.clone());
            }
        }
    }
    headers
}

fn relay_object(resp: BackendResponse) -> BackendResponse {
    BackendResponse::new(resp.status, response_headers(&resp.headers), resp.body)
}

fn created_to_ok(status: StatusCode) -> StatusCode {
    match status {
        StatusCode::CREATED | StatusCode::ACCEPTED | StatusCode::NO_CONTENT => StatusCode::OK,
        other => other,
    }
}

/// S3 error document for a non-2xx Swift answer, or `None` on success.
fn translate_failure(resp: &BackendResponse, target: Target<'_>) -> Option<BackendResponse> {
    if resp.is_success() || resp.status == StatusCode::NOT_MODIFIED {
        return None;
    }
    let err = match (resp.status, target) {
        (StatusCode::NOT_FOUND, Target::Object(key)) => S3Error::NoSuchKey {
            key: key.to_string(),
        },
        (StatusCode::NOT_FOUND, Target::Container(bucket)) => S3Error::NoSuchBucket {
            bucket: bucket.to_string(),
        },
        (StatusCode::CONFLICT, Target::Container(bucket)) => S3Error::BucketNotEmpty {
            bucket: bucket.to_string(),
        },
        (StatusCode::UNAUTHORIZED | StatusCode::FORBIDDEN, _) => S3Error::AccessDenied {
            message: "Access Denied".to_string(),
        },
        _ => return Some(resp.clone()),
    };
    Some(err.into())
}

fn is_public(acl: Option<&str>) -> bool {
    acl.map(|value| value.split(',').any(|item| item.trim() == ".r:*"))
        .unwrap_or(false)
}

/// Minimal bucket policy derived from the container ACLs.
fn bucket_policy(bucket: &str, grants: PublicGrants) -> serde_json::Value {
    let statement = |sid: &str, public: bool, action: &str| {
        json!({
            "Sid": sid,
            "Effect": if public { "Allow" } else { "Deny" },
            "Principal": "*",
            "Action": [action],
            "Resource": [format!("arn:aws:s3:::{bucket}/*")],
        })
    };
    json!({
        "Version": "2012-10-17",
        "Statement": [
            statement("SwiftContainerRead", grants.read, "s3:GetObject"),
            statement("SwiftContainerWrite", grants.write, "s3:PutObject"),
        ],
    })
}

/// Static "nothing configured" document for sub-resources Swift has no
/// notion of. These are final answers, never failures.
fn unconfigured(resource: SubResource) -> BackendResponse {
    let root = match resource {
        SubResource::Tagging => return BackendResponse::xml(StatusCode::OK, render_empty_tagging()),
        SubResource::Versioning => "VersioningConfiguration",
        SubResource::Accelerate => "AccelerateConfiguration",
        SubResource::Logging => "BucketLoggingStatus",
        SubResource::Cors => "CORSConfiguration",
        SubResource::Lifecycle => "LifecycleConfiguration",
        SubResource::Website => "WebsiteConfiguration",
        SubResource::Encryption => "ServerSideEncryptionConfiguration",
        SubResource::Replication => "ReplicationConfiguration",
        SubResource::ObjectLock => "ObjectLockConfiguration",
        SubResource::Policy | SubResource::Acl | SubResource::RequestPayment => {
            return S3Error::MethodNotAllowed.into()
        }
    };
    BackendResponse::xml(StatusCode::OK, render_empty_configuration(root))
}

fn insert_header(headers: &mut HeaderMap, name: &'static str, value: &str) {
    if let Ok(value) = HeaderValue::from_str(value) {
        headers.insert(name, value);
    }
}
