//! In-process fake storage for end-to-end tests.
//!
//! A [`FakeBackend`] listens on `127.0.0.1:0` and speaks both protocols at
//! once: path-style S3 under `/{bucket}/{key}`, where every request must be
//! signed with the fixture credentials, and a Swift account under
//! `/swift/v1/AUTH_test/{container}/{object}` with v1 auth at `/auth/v1.0`
//! and Keystone v3 at `/v3/auth/tokens`. Buckets and containers share one
//! namespace. Data lives in memory.

use axum::body::Bytes;
use axum::extract::State;
use axum::http::{HeaderMap, HeaderValue, Method, StatusCode, Uri};
use axum::response::{IntoResponse, Response};
use axum::Router;
use chrono::{DateTime, Utc};
use md5::{Digest, Md5};
use percent_encoding::percent_decode_str;
use std::collections::BTreeMap;
use std::net::SocketAddr;
use std::path::Path;
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, SystemTime};

use crate::auth::verify_request;
use crate::backends::{parse_copy_source, BackendResponse, Backends};
use crate::buckets::{fixtures, BucketStore};
use crate::config::{parse_config, ConnectionConfig, S3Credentials, SwiftAuthVersion};
use crate::errors::S3Error;
use crate::forward::Forwarder;
use crate::replication::{FileSnapshotStore, TaskStore};
use crate::request::parse_query;
use crate::xml::{
    parse_complete_multipart_upload, render_complete_multipart_upload_result,
    render_copy_object_result, render_empty_configuration, render_initiate_multipart_upload_result,
    render_list_bucket_result, ListEntry, ListBucketResult,
};
use crate::AppState;

pub const SWIFT_TOKEN: &str = "fake-swift-token";
const SWIFT_PREFIX: &str = "/swift/v1/AUTH_test";

#[derive(Debug, Clone)]
pub struct FakeObject {
    pub body: Bytes,
    pub etag: String,
    pub content_type: Option<String>,
    /// User metadata without the protocol prefix.
    pub meta: BTreeMap<String, String>,
    pub last_modified: SystemTime,
}

impl FakeObject {
    fn new(body: Bytes, content_type: Option<String>, meta: BTreeMap<String, String>) -> Self {
        Self {
            etag: hex::encode(Md5::digest(&body)),
            body,
            content_type,
            meta,
            last_modified: SystemTime::now(),
        }
    }
}

/// An S3 multipart upload in progress.
struct FakeUpload {
    content_type: Option<String>,
    meta: BTreeMap<String, String>,
    parts: BTreeMap<u32, Bytes>,
}

type Namespace = BTreeMap<String, BTreeMap<String, FakeObject>>;

#[derive(Default)]
struct FakeState {
    buckets: Mutex<Namespace>,
    uploads: Mutex<BTreeMap<String, FakeUpload>>,
    /// `LocationConstraint` received with each S3 create bucket call.
    regions: Mutex<BTreeMap<String, String>>,
    down: AtomicBool,
    hits: AtomicUsize,
}

#[derive(Clone)]
pub struct FakeBackend {
    addr: SocketAddr,
    state: Arc<FakeState>,
}

impl FakeBackend {
    pub async fn start() -> Self {
        let state = Arc::new(FakeState::default());
        let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
        let addr = listener.local_addr().unwrap();
        let app = Router::new()
            .fallback(handle)
            .with_state(Arc::clone(&state));
        tokio::spawn(async move {
            axum::serve(listener, app).await.ok();
        });
        Self { addr, state }
    }

    pub fn url(&self) -> String {
        format!("http://{}", self.addr)
    }

    pub fn s3_config(&self, bucket: &str) -> ConnectionConfig {
        fixtures::s3_config(&self.url(), bucket)
    }

    /// Keystone v3 flavoured connection.
    pub fn swift_config(&self, container: &str) -> ConnectionConfig {
        fixtures::swift_config(&format!("{}/v3", self.url()), container)
    }

    pub fn swift_v1_config(&self, container: &str) -> ConnectionConfig {
        let mut config = fixtures::swift_config(&format!("{}/auth/v1.0", self.url()), container);
        if let ConnectionConfig::Swift(swift) = &mut config {
            swift.auth_version = SwiftAuthVersion::V1;
        }
        config
    }

    /// While down, every request gets a 503.
    pub fn set_down(&self, down: bool) {
        self.state.down.store(down, Ordering::SeqCst);
    }

    pub fn hits(&self) -> usize {
        self.state.hits.load(Ordering::SeqCst)
    }

    pub fn create_bucket(&self, name: &str) {
        self.state
            .buckets
            .lock()
            .unwrap()
            .entry(name.to_string())
            .or_default();
    }

    pub fn has_bucket(&self, name: &str) -> bool {
        self.state.buckets.lock().unwrap().contains_key(name)
    }

    pub fn put(&self, bucket: &str, key: &str, body: &'static [u8]) {
        let object = FakeObject::new(Bytes::from_static(body), None, BTreeMap::new());
        self.state
            .buckets
            .lock()
            .unwrap()
            .entry(bucket.to_string())
            .or_default()
            .insert(key.to_string(), object);
    }

    pub fn get(&self, bucket: &str, key: &str) -> Option<FakeObject> {
        let buckets = self.state.buckets.lock().unwrap();
        buckets.get(bucket).and_then(|b| b.get(key)).cloned()
    }

    pub fn region_of(&self, bucket: &str) -> Option<String> {
        self.state.regions.lock().unwrap().get(bucket).cloned()
    }
}

fn credentials() -> S3Credentials {
    match fixtures::s3_config("", "") {
        ConnectionConfig::S3(config) => config.credentials,
        ConnectionConfig::Swift(_) => unreachable!(),
    }
}

async fn handle(
    State(state): State<Arc<FakeState>>,
    method: Method,
    uri: Uri,
    headers: HeaderMap,
    body: Bytes,
) -> Response {
    state.hits.fetch_add(1, Ordering::SeqCst);
    if state.down.load(Ordering::SeqCst) {
        return StatusCode::SERVICE_UNAVAILABLE.into_response();
    }

    let host = headers
        .get("host")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
        .to_string();
    let path = uri.path();

    if path == "/v3/auth/tokens" && method == Method::POST {
        return keystone(&host, &body);
    }
    if path == "/auth/v1.0" {
        return auth_v1(&host, &headers);
    }
    if let Some(rest) = path.strip_prefix(SWIFT_PREFIX) {
        if headers.get("x-auth-token").and_then(|v| v.to_str().ok()) != Some(SWIFT_TOKEN) {
            return StatusCode::UNAUTHORIZED.into_response();
        }
        return swift(&state, method, rest, uri.query().unwrap_or_default(), &headers, body);
    }

    if let Err(err) = verify_request(
        method.as_str(),
        path,
        uri.query().unwrap_or_default(),
        &headers,
        &body,
        &credentials(),
    ) {
        return BackendResponse::from(err).into_response();
    }
    s3(&state, method, path, uri.query().unwrap_or_default(), &headers, body)
}

// ── Auth ────────────────────────────────────────────────────────────

fn keystone(host: &str, body: &[u8]) -> Response {
    let Ok(request) = serde_json::from_slice::<serde_json::Value>(body) else {
        return StatusCode::BAD_REQUEST.into_response();
    };
    let user = &request["auth"]["identity"]["password"]["user"];
    if user["name"] != "swift" || user["password"] != "swift-secret" {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    let catalog = serde_json::json!({
        "token": {
            "catalog": [
                { "type": "identity", "endpoints": [
                    { "interface": "public", "region": "RegionOne", "url": format!("http://{host}/v3") } ] },
                { "type": "object-store", "endpoints": [
                    { "interface": "public", "region": "RegionOne", "url": format!("http://{host}{SWIFT_PREFIX}") } ] }
            ]
        }
    });
    (
        StatusCode::CREATED,
        [("x-subject-token", SWIFT_TOKEN)],
        axum::Json(catalog),
    )
        .into_response()
}

fn auth_v1(host: &str, headers: &HeaderMap) -> Response {
    let user = headers.get("x-auth-user").and_then(|v| v.to_str().ok());
    let key = headers.get("x-auth-key").and_then(|v| v.to_str().ok());
    if user != Some("swift") || key != Some("swift-secret") {
        return StatusCode::UNAUTHORIZED.into_response();
    }
    (
        StatusCode::OK,
        [
            ("x-storage-url", format!("http://{host}{SWIFT_PREFIX}")),
            ("x-auth-token", SWIFT_TOKEN.to_string()),
        ],
    )
        .into_response()
}

// ── Shared helpers ──────────────────────────────────────────────────

fn split_path(path: &str) -> (String, Option<String>) {
    let trimmed = path.trim_start_matches('/');
    let (bucket, key) = match trimmed.split_once('/') {
        Some((bucket, key)) if !key.is_empty() => (bucket, Some(key)),
        Some((bucket, _)) => (bucket, None),
        None => (trimmed, None),
    };
    let decode = |s: &str| percent_decode_str(s).decode_utf8_lossy().into_owned();
    (decode(bucket), key.map(decode))
}

fn user_meta(headers: &HeaderMap, prefix: &str) -> BTreeMap<String, String> {
    headers
        .iter()
        .filter_map(|(name, value)| {
            let meta = name.as_str().strip_prefix(prefix)?;
            Some((meta.to_string(), value.to_str().ok()?.to_string()))
        })
        .collect()
}

fn content_type(headers: &HeaderMap) -> Option<String> {
    headers
        .get("content-type")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
}

fn object_headers(object: &FakeObject, etag: String, meta_prefix: &str) -> HeaderMap {
    let mut headers = HeaderMap::new();
    let mut set = |name: &str, value: &str| {
        if let (Ok(name), Ok(value)) = (
            axum::http::HeaderName::from_bytes(name.as_bytes()),
            HeaderValue::from_str(value),
        ) {
            headers.insert(name, value);
        }
    };
    set("etag", &etag);
    set("last-modified", &httpdate::fmt_http_date(object.last_modified));
    set("content-length", &object.body.len().to_string());
    if let Some(content_type) = &object.content_type {
        set("content-type", content_type);
    }
    for (name, value) in &object.meta {
        set(&format!("{meta_prefix}{name}"), value);
    }
    headers
}

enum Listed<'a> {
    Object(&'a str, &'a FakeObject),
    Prefix(String),
}

/// Keys after `marker` under `prefix`, rolled up at `delimiter`.
fn list<'a>(
    objects: &'a BTreeMap<String, FakeObject>,
    prefix: &str,
    delimiter: &str,
    marker: &str,
    limit: usize,
) -> Vec<Listed<'a>> {
    let mut out: Vec<Listed<'a>> = Vec::new();
    for (key, object) in objects {
        if out.len() >= limit {
            break;
        }
        if !key.starts_with(prefix) || key.as_str() <= marker {
            continue;
        }
        let rest = &key[prefix.len()..];
        match (!delimiter.is_empty()).then(|| rest.find(delimiter)).flatten() {
            Some(idx) => {
                let common = format!("{prefix}{}", &rest[..idx + delimiter.len()]);
                if common.as_str() <= marker {
                    continue;
                }
                if !matches!(out.last(), Some(Listed::Prefix(last)) if *last == common) {
                    out.push(Listed::Prefix(common));
                }
            }
            None => out.push(Listed::Object(key, object)),
        }
    }
    out
}

// ── Swift ───────────────────────────────────────────────────────────

fn swift(
    state: &FakeState,
    method: Method,
    path: &str,
    query: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let (container, object) = split_path(path);
    let mut buckets = state.buckets.lock().unwrap();

    let Some(object) = object else {
        return match method {
            Method::PUT => {
                if buckets.contains_key(&container) {
                    StatusCode::ACCEPTED.into_response()
                } else {
                    buckets.insert(container, BTreeMap::new());
                    StatusCode::CREATED.into_response()
                }
            }
            Method::HEAD => match buckets.get(&container) {
                Some(objects) => (
                    StatusCode::NO_CONTENT,
                    [("x-container-object-count", objects.len().to_string())],
                )
                    .into_response(),
                None => StatusCode::NOT_FOUND.into_response(),
            },
            Method::DELETE => match buckets.get(&container).map(BTreeMap::is_empty) {
                None => StatusCode::NOT_FOUND.into_response(),
                Some(false) => StatusCode::CONFLICT.into_response(),
                Some(true) => {
                    buckets.remove(&container);
                    StatusCode::NO_CONTENT.into_response()
                }
            },
            Method::GET => match buckets.get(&container) {
                Some(objects) => swift_listing(objects, query),
                None => StatusCode::NOT_FOUND.into_response(),
            },
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        };
    };

    if !buckets.contains_key(&container) {
        return StatusCode::NOT_FOUND.into_response();
    }

    match method {
        Method::PUT if query.contains("multipart-manifest=put") => {
            let Some(stored) = assemble_manifest(&buckets, &body, headers) else {
                return StatusCode::BAD_REQUEST.into_response();
            };
            let response = (StatusCode::CREATED, [("etag", stored.etag.clone())]).into_response();
            if let Some(objects) = buckets.get_mut(&container) {
                objects.insert(object, stored);
            }
            response
        }
        Method::PUT => {
            let stored = match headers.get("x-copy-from").and_then(|v| v.to_str().ok()) {
                Some(source) => {
                    let (source_container, source_key) = split_path(source);
                    let found = source_key.and_then(|key| {
                        buckets.get(&source_container).and_then(|b| b.get(&key)).cloned()
                    });
                    match found {
                        Some(source) => FakeObject::new(source.body, source.content_type, source.meta),
                        None => return StatusCode::NOT_FOUND.into_response(),
                    }
                }
                None => FakeObject::new(
                    body,
                    content_type(headers),
                    user_meta(headers, "x-object-meta-"),
                ),
            };
            let response = (
                StatusCode::CREATED,
                [
                    ("etag", stored.etag.clone()),
                    ("last-modified", httpdate::fmt_http_date(stored.last_modified)),
                ],
            )
                .into_response();
            if let Some(objects) = buckets.get_mut(&container) {
                objects.insert(object, stored);
            }
            response
        }
        Method::GET | Method::HEAD => {
            match buckets.get(&container).and_then(|b| b.get(&object)) {
                Some(found) => {
                    let headers = object_headers(found, found.etag.clone(), "x-object-meta-");
                    let body = if method == Method::GET {
                        found.body.clone()
                    } else {
                        Bytes::new()
                    };
                    (StatusCode::OK, headers, body).into_response()
                }
                None => StatusCode::NOT_FOUND.into_response(),
            }
        }
        Method::DELETE => match buckets.get_mut(&container).and_then(|b| b.remove(&object)) {
            Some(_) => StatusCode::NO_CONTENT.into_response(),
            None => StatusCode::NOT_FOUND.into_response(),
        },
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

/// Static large object: segments named `/{container}/{object}`, each etag
/// checked when given.
fn assemble_manifest(buckets: &Namespace, manifest: &[u8], headers: &HeaderMap) -> Option<FakeObject> {
    let segments: Vec<serde_json::Value> = serde_json::from_slice(manifest).ok()?;
    let mut body = Vec::new();
    for segment in &segments {
        let (container, name) = split_path(segment["path"].as_str()?);
        let found = buckets.get(&container)?.get(&name?)?;
        if let Some(etag) = segment["etag"].as_str() {
            if etag != found.etag {
                return None;
            }
        }
        body.extend_from_slice(&found.body);
    }
    Some(FakeObject::new(
        Bytes::from(body),
        content_type(headers),
        user_meta(headers, "x-object-meta-"),
    ))
}

fn swift_listing(objects: &BTreeMap<String, FakeObject>, query: &str) -> Response {
    let params: BTreeMap<String, String> = parse_query(query).into_iter().collect();
    let param = |name: &str| params.get(name).map(String::as_str).unwrap_or_default();
    let limit = param("limit").parse().unwrap_or(10_000);

    let listed = list(
        objects,
        param("prefix"),
        param("delimiter"),
        param("marker"),
        limit,
    );
    let entries: Vec<serde_json::Value> = listed
        .into_iter()
        .map(|entry| match entry {
            Listed::Object(name, object) => serde_json::json!({
                "name": name,
                "bytes": object.body.len(),
                "hash": object.etag,
                "last_modified": DateTime::<Utc>::from(object.last_modified)
                    .format("%Y-%m-%dT%H:%M:%S%.6f")
                    .to_string(),
                "content_type": object
                    .content_type
                    .as_deref()
                    .unwrap_or("application/octet-stream"),
            }),
            Listed::Prefix(subdir) => serde_json::json!({ "subdir": subdir }),
        })
        .collect();
    (StatusCode::OK, axum::Json(entries)).into_response()
}

// ── S3 ──────────────────────────────────────────────────────────────

fn s3(
    state: &FakeState,
    method: Method,
    path: &str,
    query: &str,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let (bucket, key) = split_path(path);
    let mut buckets = state.buckets.lock().unwrap();
    let no_such_bucket = || {
        BackendResponse::from(S3Error::NoSuchBucket {
            bucket: bucket.clone(),
        })
        .into_response()
    };

    let Some(key) = key else {
        return match method {
            Method::PUT => {
                let text = String::from_utf8_lossy(&body);
                if let Some(region) = text
                    .split("<LocationConstraint>")
                    .nth(1)
                    .and_then(|rest| rest.split("</LocationConstraint>").next())
                {
                    state
                        .regions
                        .lock()
                        .unwrap()
                        .insert(bucket.clone(), region.to_string());
                }
                buckets.entry(bucket.clone()).or_default();
                (StatusCode::OK, [("location", format!("/{bucket}"))]).into_response()
            }
            Method::HEAD if buckets.contains_key(&bucket) => StatusCode::OK.into_response(),
            Method::HEAD => StatusCode::NOT_FOUND.into_response(),
            Method::DELETE => match buckets.get(&bucket).map(BTreeMap::is_empty) {
                None => no_such_bucket(),
                Some(false) => BackendResponse::from(S3Error::BucketNotEmpty {
                    bucket: bucket.clone(),
                })
                .into_response(),
                Some(true) => {
                    buckets.remove(&bucket);
                    StatusCode::NO_CONTENT.into_response()
                }
            },
            Method::GET => match buckets.get(&bucket) {
                None => no_such_bucket(),
                Some(_) if query.contains("acl") => BackendResponse::xml(
                    StatusCode::OK,
                    render_empty_configuration("AccessControlPolicy"),
                )
                .into_response(),
                Some(objects) => s3_listing(&bucket, objects, query),
            },
            _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
        };
    };

    if !buckets.contains_key(&bucket) {
        return no_such_bucket();
    }
    let params: BTreeMap<String, String> = parse_query(query).into_iter().collect();
    if params.contains_key("uploads") || params.contains_key("uploadId") {
        return s3_multipart(state, &mut buckets, method, &bucket, key, &params, headers, body);
    }
    let Some(objects) = buckets.get(&bucket) else {
        return no_such_bucket();
    };

    match method {
        Method::PUT => {
            let copy_source = headers.get("x-amz-copy-source").and_then(|v| v.to_str().ok());
            let (stored, copied) = match copy_source {
                Some(raw) => {
                    let found = parse_copy_source(raw).and_then(|(b, k)| {
                        buckets.get(&b).and_then(|objects| objects.get(&k)).cloned()
                    });
                    match found {
                        Some(source) => (
                            FakeObject::new(source.body, source.content_type, source.meta),
                            true,
                        ),
                        None => {
                            return BackendResponse::from(S3Error::NoSuchKey { key }).into_response()
                        }
                    }
                }
                None => (
                    FakeObject::new(body, content_type(headers), user_meta(headers, "x-amz-meta-")),
                    false,
                ),
            };
            let etag = format!("\"{}\"", stored.etag);
            let response = if copied {
                let last_modified = DateTime::<Utc>::from(stored.last_modified)
                    .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                    .to_string();
                BackendResponse::xml(StatusCode::OK, render_copy_object_result(&etag, &last_modified))
                    .into_response()
            } else {
                (StatusCode::OK, [("etag", etag)]).into_response()
            };
            if let Some(objects) = buckets.get_mut(&bucket) {
                objects.insert(key, stored);
            }
            response
        }
        Method::GET | Method::HEAD => match objects.get(&key) {
            Some(found) => {
                let headers = object_headers(found, format!("\"{}\"", found.etag), "x-amz-meta-");
                let body = if method == Method::GET {
                    found.body.clone()
                } else {
                    Bytes::new()
                };
                (StatusCode::OK, headers, body).into_response()
            }
            None if method == Method::HEAD => StatusCode::NOT_FOUND.into_response(),
            None => BackendResponse::from(S3Error::NoSuchKey { key }).into_response(),
        },
        Method::DELETE => {
            if let Some(objects) = buckets.get_mut(&bucket) {
                objects.remove(&key);
            }
            StatusCode::NO_CONTENT.into_response()
        }
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

#[allow(clippy::too_many_arguments)]
fn s3_multipart(
    state: &FakeState,
    buckets: &mut Namespace,
    method: Method,
    bucket: &str,
    key: String,
    params: &BTreeMap<String, String>,
    headers: &HeaderMap,
    body: Bytes,
) -> Response {
    let mut uploads = state.uploads.lock().unwrap();
    if method == Method::POST && params.contains_key("uploads") {
        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        uploads.insert(
            upload_id.clone(),
            FakeUpload {
                content_type: content_type(headers),
                meta: user_meta(headers, "x-amz-meta-"),
                parts: BTreeMap::new(),
            },
        );
        return BackendResponse::xml(
            StatusCode::OK,
            render_initiate_multipart_upload_result(bucket, &key, &upload_id),
        )
        .into_response();
    }

    let upload_id = params.get("uploadId").cloned().unwrap_or_default();
    let no_such_upload = || {
        BackendResponse::from(S3Error::NoSuchUpload {
            upload_id: upload_id.clone(),
        })
        .into_response()
    };
    match method {
        Method::PUT => {
            let Some(upload) = uploads.get_mut(&upload_id) else {
                return no_such_upload();
            };
            let Some(part_number) = params.get("partNumber").and_then(|n| n.parse().ok()) else {
                return StatusCode::BAD_REQUEST.into_response();
            };
            let etag = format!("\"{}\"", hex::encode(Md5::digest(&body)));
            upload.parts.insert(part_number, body);
            (StatusCode::OK, [("etag", etag)]).into_response()
        }
        Method::POST => {
            let Some(upload) = uploads.get(&upload_id) else {
                return no_such_upload();
            };
            let parts = match parse_complete_multipart_upload(&body) {
                Ok(parts) => parts,
                Err(err) => return BackendResponse::from(err).into_response(),
            };
            let mut assembled = Vec::new();
            for part in &parts {
                match upload.parts.get(&part.part_number) {
                    Some(data) if part.etag.trim_matches('"') == hex::encode(Md5::digest(data)) => {
                        assembled.extend_from_slice(data)
                    }
                    _ => {
                        return BackendResponse::from(S3Error::InvalidPart {
                            message: format!("part {} does not match", part.part_number),
                        })
                        .into_response()
                    }
                }
            }
            let stored = FakeObject::new(
                Bytes::from(assembled),
                upload.content_type.clone(),
                upload.meta.clone(),
            );
            uploads.remove(&upload_id);
            let etag = format!("\"{}\"", stored.etag);
            if let Some(objects) = buckets.get_mut(bucket) {
                objects.insert(key.clone(), stored);
            }
            BackendResponse::xml(
                StatusCode::OK,
                render_complete_multipart_upload_result(
                    &format!("/{bucket}/{key}"),
                    bucket,
                    &key,
                    &etag,
                ),
            )
            .into_response()
        }
        Method::DELETE => match uploads.remove(&upload_id) {
            Some(_) => StatusCode::NO_CONTENT.into_response(),
            None => no_such_upload(),
        },
        _ => StatusCode::METHOD_NOT_ALLOWED.into_response(),
    }
}

fn s3_listing(bucket: &str, objects: &BTreeMap<String, FakeObject>, query: &str) -> Response {
    let params: BTreeMap<String, String> = parse_query(query).into_iter().collect();
    let param = |name: &str| params.get(name).cloned().unwrap_or_default();
    let max_keys: u32 = param("max-keys").parse().unwrap_or(1000);
    let marker = params
        .get("continuation-token")
        .or_else(|| params.get("start-after"))
        .cloned()
        .unwrap_or_default();
    let prefix = param("prefix");
    let delimiter = param("delimiter");

    let mut result = ListBucketResult {
        name: bucket.to_string(),
        prefix: prefix.clone(),
        delimiter: delimiter.clone(),
        max_keys,
        ..Default::default()
    };
    for entry in list(objects, &prefix, &delimiter, &marker, max_keys as usize) {
        match entry {
            Listed::Object(key, object) => result.contents.push(ListEntry {
                key: key.to_string(),
                last_modified: DateTime::<Utc>::from(object.last_modified)
                    .format("%Y-%m-%dT%H:%M:%S%.3fZ")
                    .to_string(),
                etag: format!("\"{}\"", object.etag),
                size: object.body.len() as u64,
                storage_class: "STANDARD".to_string(),
            }),
            Listed::Prefix(prefix) => result.common_prefixes.push(prefix),
        }
    }
    result.key_count = (result.contents.len() + result.common_prefixes.len()) as u32;
    BackendResponse::xml(StatusCode::OK, render_list_bucket_result(&result)).into_response()
}

// ── Gateway wiring ──────────────────────────────────────────────────

/// Address of a listener that accepts connections and never answers.
pub async fn stalled_endpoint() -> String {
    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let addr = listener.local_addr().unwrap();
    tokio::spawn(async move {
        let mut held = Vec::new();
        while let Ok((socket, _)) = listener.accept().await {
            held.push(socket);
        }
    });
    format!("http://{addr}")
}

/// Gateway state with bucket `photos` on `primary` (S3) mirrored to the
/// Swift container `photos` on `replica`. Signature checks are off.
pub async fn app_state(primary: &FakeBackend, replica: &FakeBackend, dir: &Path) -> AppState {
    app_state_with_timeout(&primary.url(), replica, 300, dir).await
}

/// [`app_state`] with the S3 primary at any URL and a custom backend
/// timeout in seconds.
pub async fn app_state_with_timeout(
    primary_url: &str,
    replica: &FakeBackend,
    backend_timeout: u64,
    dir: &Path,
) -> AppState {
    let yaml = format!(
        r#"
server:
  backend_timeout: {backend_timeout}
auth:
  verify_signatures: false
backends:
  minio:
    protocol: s3
  ovh:
    protocol: swift
buckets:
  photos:
    backend: minio
    config:
      endpoint: {primary_url}
      region: us-east-1
      bucket: photos
      credentials:
        accessKeyId: AKIDEXAMPLE
        secretAccessKey: wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY
replicas:
  - name: photos-swift
    backend: ovh
    config:
      auth_url: {replica}/v3
      container: photos
      region: RegionOne
      credentials:
        username: swift
        password: swift-secret
        project_name: herald
"#,
        replica = replica.url(),
    );
    state_from_yaml(&yaml, dir).await
}

/// Bucket `photos` on a Swift (v1 auth) `primary`, mirrored to the S3
/// bucket `photos` on `replica`.
pub async fn swift_primary_state(primary: &FakeBackend, replica: &FakeBackend, dir: &Path) -> AppState {
    let yaml = format!(
        r#"
auth:
  verify_signatures: false
backends:
  ovh:
    protocol: swift
  minio:
    protocol: s3
buckets:
  photos:
    backend: ovh
    config:
      auth_url: {primary}/auth/v1.0
      auth_version: v1
      container: photos
      region: RegionOne
      credentials:
        username: swift
        password: swift-secret
        project_name: herald
replicas:
  - name: photos-s3
    backend: minio
    config:
      endpoint: {replica}
      region: us-east-1
      bucket: photos
      credentials:
        accessKeyId: AKIDEXAMPLE
        secretAccessKey: wJalrXUtnFEMI/K7MDENG+bPxRfiCYEXAMPLEKEY
"#,
        primary = primary.url(),
        replica = replica.url(),
    );
    state_from_yaml(&yaml, dir).await
}

async fn state_from_yaml(yaml: &str, dir: &Path) -> AppState {
    let config = parse_config(yaml).unwrap();
    let buckets = BucketStore::from_config(&config);
    let queues: Vec<String> = buckets
        .iter()
        .filter(|b| b.has_replicas())
        .map(|b| b.name.clone())
        .collect();
    let snapshots = Arc::new(FileSnapshotStore::new(dir).unwrap());
    let tasks = TaskStore::open(snapshots, queues, config.replication.queue_capacity)
        .await
        .unwrap();
    let forwarder = Forwarder::new(Duration::from_secs(config.server.backend_timeout)).unwrap();
    AppState {
        config: Arc::new(config),
        buckets: Arc::new(buckets),
        backends: Backends::new(forwarder),
        tasks: Arc::new(tasks),
    }
}
