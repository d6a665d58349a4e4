//! Multipart uploads on Swift.
//!
//! Parts live in the `{container}_segments` container as
//! `{key}/{upload_id}/{part_number:08}`. A zero-byte marker object at
//! `{key}/{upload_id}` records that the upload exists and holds the content
//! headers sent when it was started. Completion writes a static large
//! object manifest at the key and drops the marker; the segments stay,
//! the manifest reads through them.

use axum::http::{HeaderMap, HeaderValue, Method, StatusCode};
use bytes::Bytes;
use serde_json::json;
use tracing::warn;

use super::auth::SwiftSession;
use super::listing::{parse_listing, SwiftListingEntry};
use super::{
    container_url, insert_header, object_key, object_url, request_headers, translate_failure,
    SwiftAdapter, Target, SWIFT_META_PREFIX,
};
use crate::backends::{quote_etag, AdapterResult, BackendError, BackendResponse};
use crate::buckets::Bucket;
use crate::errors::S3Error;
use crate::forward::encode_query;
use crate::request::ProxyRequest;
use crate::retry::RetryPolicy;
use crate::xml::{
    parse_complete_multipart_upload, render_complete_multipart_upload_result,
    render_initiate_multipart_upload_result,
};

const MAX_PART_NUMBER: u32 = 10_000;

/// Marker headers carried onto the finished object.
const MANIFEST_HEADERS: &[&str] = &[
    "content-type",
    "content-encoding",
    "content-disposition",
    "content-language",
    "cache-control",
    "expires",
];

const INVALID_PART: &str = "One or more of the specified parts could not be found. The part may \
    not have been uploaded, or the specified entity tag may not have matched the part's entity tag.";

/// Container holding the upload segments of `container`.
pub(super) fn segments_container(container: &str) -> String {
    format!("{container}_segments")
}

fn marker_name(key: &str, upload_id: &str) -> String {
    format!("{key}/{upload_id}")
}

fn segment_name(key: &str, upload_id: &str, part_number: u32) -> String {
    format!("{key}/{upload_id}/{part_number:08}")
}

/// Upload ids are ours, plain hex; anything else cannot exist.
fn upload_id(req: &ProxyRequest) -> Option<&str> {
    req.query_value("uploadId")
        .filter(|id| !id.is_empty() && id.chars().all(|c| c.is_ascii_alphanumeric()))
}

fn no_such_upload(req: &ProxyRequest) -> BackendResponse {
    S3Error::NoSuchUpload {
        upload_id: req.query_value("uploadId").unwrap_or_default().to_string(),
    }
    .into()
}

impl SwiftAdapter {
    pub(super) async fn create_upload(
        &self,
        bucket: &Bucket,
        req: &ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterResult {
        let config = Self::config(bucket)?;
        let key = object_key(req)?;
        let name = req.bucket.as_deref().unwrap_or(&bucket.name);
        let session = self.session(config).await?;
        let segments = segments_container(&config.container);

        let url = container_url(&session, &segments)?;
        let resp = self
            .call(Method::PUT, url, session.headers()?, Bytes::new(), policy)
            .await?;
        if let Some(failure) = translate_failure(&resp, Target::Container(name)) {
            return Ok(failure);
        }

        let upload_id = uuid::Uuid::new_v4().simple().to_string();
        let url = object_url(&session, &segments, &marker_name(key, &upload_id))?;
        let headers = request_headers(&session, &req.headers)?;
        let resp = self
            .call(Method::PUT, url, headers, Bytes::new(), policy)
            .await?;
        if let Some(failure) = translate_failure(&resp, Target::Object(key)) {
            return Ok(failure);
        }

        Ok(BackendResponse::xml(
            StatusCode::OK,
            render_initiate_multipart_upload_result(name, key, &upload_id),
        ))
    }

    pub(super) async fn put_part(
        &self,
        bucket: &Bucket,
        req: &ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterResult {
        let config = Self::config(bucket)?;
        let key = object_key(req)?;
        let Some(upload_id) = upload_id(req) else {
            return Ok(no_such_upload(req));
        };
        let part_number = match req.query_value("partNumber").and_then(|n| n.parse().ok()) {
            Some(n @ 1..=MAX_PART_NUMBER) => n,
            _ => {
                return Ok(S3Error::InvalidArgument {
                    message: format!(
                        "Part number must be an integer between 1 and {MAX_PART_NUMBER}, inclusive"
                    ),
                }
                .into())
            }
        };

        let session = self.session(config).await?;
        let segments = segments_container(&config.container);
        let marker = self
            .upload_marker(&session, &segments, key, upload_id, policy)
            .await?;
        if !marker.is_success() {
            return Ok(marker);
        }

        let url = object_url(&session, &segments, &segment_name(key, upload_id, part_number))?;
        let resp = self
            .call(Method::PUT, url, session.headers()?, req.body.clone(), policy)
            .await?;
        if let Some(failure) = translate_failure(&resp, Target::Object(key)) {
            return Ok(failure);
        }
        let mut headers = HeaderMap::new();
        if let Some(etag) = resp.header("etag") {
            insert_header(&mut headers, "etag", &quote_etag(etag));
        }
        Ok(BackendResponse::new(StatusCode::OK, headers, Bytes::new()))
    }

    pub(super) async fn complete_upload(
        &self,
        bucket: &Bucket,
        req: &ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterResult {
        let config = Self::config(bucket)?;
        let key = object_key(req)?;
        let name = req.bucket.as_deref().unwrap_or(&bucket.name);
        let Some(upload_id) = upload_id(req) else {
            return Ok(no_such_upload(req));
        };
        let parts = match parse_complete_multipart_upload(&req.body) {
            Ok(parts) => parts,
            Err(err) => return Ok(err.into()),
        };
        if parts.windows(2).any(|w| w[0].part_number >= w[1].part_number) {
            return Ok(S3Error::InvalidPartOrder.into());
        }

        let session = self.session(config).await?;
        let segments = segments_container(&config.container);
        let marker = self
            .upload_marker(&session, &segments, key, upload_id, policy)
            .await?;
        if !marker.is_success() {
            return Ok(marker);
        }

        let manifest: Vec<serde_json::Value> = parts
            .iter()
            .map(|part| {
                json!({
                    "path": format!("/{segments}/{}", segment_name(key, upload_id, part.part_number)),
                    "etag": part.etag.trim_matches('"'),
                    "size_bytes": null,
                })
            })
            .collect();
        let body = serde_json::to_vec(&manifest)
            .map_err(|e| BackendError::InvalidPayload(format!("manifest: {e}")))?;

        let mut headers = session.headers()?;
        for (header, value) in &marker.headers {
            let lower = header.as_str();
            if MANIFEST_HEADERS.contains(&lower) || lower.starts_with(SWIFT_META_PREFIX) {
                headers.insert(header.clone(), value.clone());
            }
        }
        let mut url = object_url(&session, &config.container, key)?;
        url.set_query(Some("multipart-manifest=put"));
        let resp = self
            .call(Method::PUT, url, headers, Bytes::from(body), policy)
            .await?;
        // Swift rejects a manifest whose segments are missing or mismatched.
        if resp.status == StatusCode::BAD_REQUEST {
            return Ok(S3Error::InvalidPart {
                message: INVALID_PART.to_string(),
            }
            .into());
        }
        if let Some(failure) = translate_failure(&resp, Target::Object(key)) {
            return Ok(failure);
        }
        let etag = quote_etag(resp.header("etag").unwrap_or_default());

        let marker_url = object_url(&session, &segments, &marker_name(key, upload_id))?;
        match self
            .call(Method::DELETE, marker_url, session.headers()?, Bytes::new(), policy)
            .await
        {
            Ok(resp) if resp.is_success() || resp.status == StatusCode::NOT_FOUND => {}
            Ok(resp) => warn!("Upload marker for '{key}' not removed: {}", resp.status),
            Err(e) => warn!("Upload marker for '{key}' not removed: {e}"),
        }

        Ok(BackendResponse::xml(
            StatusCode::OK,
            render_complete_multipart_upload_result(&format!("/{name}/{key}"), name, key, &etag),
        ))
    }

    pub(super) async fn abort_upload(
        &self,
        bucket: &Bucket,
        req: &ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterResult {
        let config = Self::config(bucket)?;
        let key = object_key(req)?;
        let name = req.bucket.as_deref().unwrap_or(&bucket.name);
        let Some(upload_id) = upload_id(req) else {
            return Ok(no_such_upload(req));
        };

        let session = self.session(config).await?;
        let segments = segments_container(&config.container);
        let marker = self
            .upload_marker(&session, &segments, key, upload_id, policy)
            .await?;
        if !marker.is_success() {
            return Ok(marker);
        }

        let prefix = format!("{}/", marker_name(key, upload_id));
        let mut url = container_url(&session, &segments)?;
        url.set_query(
            encode_query(&[
                ("format".to_string(), "json".to_string()),
                ("prefix".to_string(), prefix),
            ])
            .as_deref(),
        );
        let mut headers = session.headers()?;
        headers.insert("accept", HeaderValue::from_static("application/json"));
        let listing = self
            .call(Method::GET, url, headers, Bytes::new(), policy)
            .await?;
        if let Some(failure) = translate_failure(&listing, Target::Container(name)) {
            return Ok(failure);
        }

        // Parts first, the marker last, so a failed abort can be retried.
        let doomed = parse_listing(&listing.body)?
            .into_iter()
            .filter_map(|entry| match entry {
                SwiftListingEntry::Object { name, .. } => Some(name),
                SwiftListingEntry::Subdir { .. } => None,
            })
            .chain(std::iter::once(marker_name(key, upload_id)));
        for object in doomed {
            let url = object_url(&session, &segments, &object)?;
            let resp = self
                .call(Method::DELETE, url, session.headers()?, Bytes::new(), policy)
                .await?;
            if !resp.is_success() && resp.status != StatusCode::NOT_FOUND {
                return Ok(translate_failure(&resp, Target::Object(key)).unwrap_or(resp));
            }
        }

        Ok(BackendResponse::new(
            StatusCode::NO_CONTENT,
            HeaderMap::new(),
            Bytes::new(),
        ))
    }

    /// HEAD the upload's marker. Anything but a 2xx comes back as the S3
    /// error to answer with.
    async fn upload_marker(
        &self,
        session: &SwiftSession,
        segments: &str,
        key: &str,
        upload_id: &str,
        policy: RetryPolicy,
    ) -> AdapterResult {
        let url = object_url(session, segments, &marker_name(key, upload_id))?;
        let resp = self
            .call(Method::HEAD, url, session.headers()?, Bytes::new(), policy)
            .await?;
        Ok(match resp.status {
            status if status.is_success() => resp,
            StatusCode::NOT_FOUND => S3Error::NoSuchUpload {
                upload_id: upload_id.to_string(),
            }
            .into(),
            _ => translate_failure(&resp, Target::Object(key)).unwrap_or(resp),
        })
    }
}
