//! Outbound HTTP to backends.
//!
//! [`Forwarder`] owns the shared `reqwest` client. Every send goes through
//! [`retry_with_backoff`]; a backend 5xx counts as a failed attempt. A call
//! that outlives the client timeout fails with a transport error.

use axum::http::{HeaderMap, HeaderName, Method};
use bytes::Bytes;
use chrono::Utc;
use reqwest::Url;
use sha2::{Digest, Sha256};
use std::time::Duration;

use crate::auth::{s3_uri_encode, sign_request};
use crate::backends::{BackendError, BackendResponse};
use crate::config::S3Config;
use crate::retry::{retry_with_backoff, RetryPolicy};

const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// Inbound headers that never reach a backend. Anything starting with
/// `x-forwarded-` or `proxy-` is dropped as well.
const STRIPPED_HEADERS: &[&str] = &[
    "authorization",
    "host",
    "forwarded",
    "x-real-ip",
    "traceparent",
    "tracestate",
    "x-amzn-trace-id",
    "sentry-trace",
    "baggage",
    "content-md5",
    "content-length",
    "connection",
    "keep-alive",
    "transfer-encoding",
    "te",
    "upgrade",
    "expect",
    "x-amz-date",
    "x-amz-content-sha256",
    "x-amz-security-token",
];

/// A request ready to hit the wire.
#[derive(Debug, Clone)]
pub struct OutboundRequest {
    pub method: Method,
    pub url: Url,
    pub headers: HeaderMap,
    pub body: Bytes,
}

/// Shared HTTP client for every backend call.
#[derive(Debug, Clone)]
pub struct Forwarder {
    client: reqwest::Client,
}

impl Forwarder {
    /// A client whose calls give up after `timeout`, connecting included.
    pub fn new(timeout: Duration) -> anyhow::Result<Self> {
        let client = reqwest::Client::builder()
            .connect_timeout(CONNECT_TIMEOUT.min(timeout))
            .timeout(timeout)
            .build()?;
        Ok(Self { client })
    }

    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }

    /// Send `request` with retries. Server errors are retried and, once the
    /// budget is spent, surface as [`BackendError::Status`].
    pub async fn send(
        &self,
        request: &OutboundRequest,
        policy: RetryPolicy,
    ) -> Result<BackendResponse, BackendError> {
        retry_with_backoff(policy, || self.send_once(request)).await
    }

    async fn send_once(&self, request: &OutboundRequest) -> Result<BackendResponse, BackendError> {
        let response = self
            .client
            .request(request.method.clone(), request.url.clone())
            .headers(request.headers.clone())
            .body(request.body.clone())
            .send()
            .await?;

        let status = response.status();
        let headers = response.headers().clone();
        let body = response.bytes().await?;
        let response = BackendResponse::new(status, headers, body);

        if status.is_server_error() {
            return Err(BackendError::Status(response));
        }
        Ok(response)
    }

    /// Forward an S3 call to `config`'s endpoint: rewrite the URL, strip
    /// proxy headers, sign and send.
    #[allow(clippy::too_many_arguments)]
    pub async fn forward_s3(
        &self,
        config: &S3Config,
        method: Method,
        key: Option<&str>,
        query: &[(String, String)],
        headers: &HeaderMap,
        body: Bytes,
        policy: RetryPolicy,
    ) -> Result<BackendResponse, BackendError> {
        let request = prepare_s3_request(config, method, key, query, headers, body)?;
        self.send(&request, policy).await
    }
}

/// Copy `inbound` minus proxy-injected, tracing and hop-by-hop headers.
pub fn strip_proxy_headers(inbound: &HeaderMap) -> HeaderMap {
    let mut headers = HeaderMap::new();
    for (name, value) in inbound {
        let lower = name.as_str();
        if STRIPPED_HEADERS.contains(&lower)
            || lower.starts_with("x-forwarded-")
            || lower.starts_with("proxy-")
        {
            continue;
        }
        headers.append(name.clone(), value.clone());
    }
    headers
}

/// Build the signed request for `key` (or the bucket itself) on an S3
/// backend.
pub fn prepare_s3_request(
    config: &S3Config,
    method: Method,
    key: Option<&str>,
    query: &[(String, String)],
    inbound: &HeaderMap,
    body: Bytes,
) -> Result<OutboundRequest, BackendError> {
    let url = s3_url(config, key, query)?;
    let host = match (url.host_str(), url.port()) {
        (Some(host), Some(port)) => format!("{host}:{port}"),
        (Some(host), None) => host.to_string(),
        (None, _) => {
            return Err(BackendError::InvalidRequest(format!(
                "endpoint '{}' has no host",
                config.endpoint
            )))
        }
    };

    let mut headers = strip_proxy_headers(inbound);
    let payload_hash = hex::encode(Sha256::digest(&body));
    sign_request(
        method.as_str(),
        &host,
        url.path(),
        url.query().unwrap_or_default(),
        &mut headers,
        &payload_hash,
        &config.credentials,
        &config.region,
        Utc::now(),
    )
    .map_err(|e| BackendError::InvalidRequest(e.to_string()))?;

    Ok(OutboundRequest {
        method,
        url,
        headers,
        body,
    })
}

/// Backend URL for `key` in `config`'s bucket, path-style or
/// virtual-hosted per `force_path_style`.
pub fn s3_url(
    config: &S3Config,
    key: Option<&str>,
    query: &[(String, String)],
) -> Result<Url, BackendError> {
    let mut url = Url::parse(&config.endpoint)
        .map_err(|e| BackendError::InvalidRequest(format!("bad endpoint: {e}")))?;
    let base = url.path().trim_end_matches('/').to_string();
    let key = key.map(|k| s3_uri_encode(k, false));

    let path = if config.force_path_style {
        let bucket = s3_uri_encode(&config.bucket, true);
        match key {
            Some(key) => format!("{base}/{bucket}/{key}"),
            None => format!("{base}/{bucket}"),
        }
    } else {
        let host = url.host_str().unwrap_or_default().to_string();
        url.set_host(Some(&format!("{}.{host}", config.bucket)))
            .map_err(|e| BackendError::InvalidRequest(format!("bad bucket host: {e}")))?;
        format!("{base}/{}", key.unwrap_or_default())
    };
    url.set_path(&path);
    url.set_query(encode_query(query).as_deref());
    Ok(url)
}

/// Encode query pairs in the form the signer canonicalizes.
pub fn encode_query(query: &[(String, String)]) -> Option<String> {
    if query.is_empty() {
        return None;
    }
    Some(
        query
            .iter()
            .map(|(k, v)| format!("{}={}", s3_uri_encode(k, true), s3_uri_encode(v, true)))
            .collect::<Vec<_>>()
            .join("&"),
    )
}

pub(crate) fn header_name(name: &str) -> Result<HeaderName, BackendError> {
    HeaderName::from_bytes(name.as_bytes())
        .map_err(|e| BackendError::InvalidRequest(format!("bad header name '{name}': {e}")))
}
