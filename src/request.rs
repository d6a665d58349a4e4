//! Inbound request model.
//!
//! A [`ProxyRequest`] is the decoded form of one S3 call: bucket and key
//! are already pulled out of the path or `Host` header, the body is fully
//! buffered. It can be reduced to a [`SerializedRequest`] (no body) for
//! storage inside a mirror task and rebuilt later.

use axum::http::{HeaderMap, HeaderName, HeaderValue, Method, Uri};
use bytes::Bytes;
use percent_encoding::percent_decode_str;
use serde::{Deserialize, Serialize};
use std::net::IpAddr;

/// How the bucket is addressed in an inbound URL.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UrlStyle {
    /// `host/{bucket}/{key}`
    Path,
    /// `{bucket}.host/{key}`
    VirtualHosted,
}

/// Decide the addressing style from a `Host` header value.
///
/// IP addresses, `localhost` and hosts starting with `s3.` are path-style;
/// anything else carries the bucket as its first label.
pub fn url_style(host: &str) -> UrlStyle {
    let hostname = strip_port(host);
    let bare = hostname.trim_start_matches('[').trim_end_matches(']');
    if bare.parse::<IpAddr>().is_ok()
        || bare.eq_ignore_ascii_case("localhost")
        || bare.to_ascii_lowercase().starts_with("s3.")
        || !bare.contains('.')
    {
        UrlStyle::Path
    } else {
        UrlStyle::VirtualHosted
    }
}

fn strip_port(host: &str) -> &str {
    if host.starts_with('[') {
        // [::1]:8000
        return match host.find(']') {
            Some(end) => &host[..=end],
            None => host,
        };
    }
    match host.rsplit_once(':') {
        Some((name, port)) if port.chars().all(|c| c.is_ascii_digit()) => name,
        _ => host,
    }
}

/// A decoded inbound S3 request.
#[derive(Debug, Clone)]
pub struct ProxyRequest {
    pub method: Method,
    /// Logical bucket name as addressed by the client.
    pub bucket: Option<String>,
    /// Decoded object key; `None` for bucket-level calls.
    pub key: Option<String>,
    /// Raw path as received, used for signature verification.
    pub path: String,
    /// Raw query string as received (without `?`).
    pub raw_query: String,
    /// Decoded query pairs in their original order.
    pub query: Vec<(String, String)>,
    pub headers: HeaderMap,
    pub body: Bytes,
}

impl ProxyRequest {
    pub fn new(method: Method, uri: &Uri, headers: HeaderMap, body: Bytes) -> Self {
        let path = uri.path().to_string();
        let raw_query = uri.query().unwrap_or_default().to_string();
        let host = headers
            .get(axum::http::header::HOST)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .or_else(|| uri.authority().map(|a| a.to_string()))
            .unwrap_or_default();

        let (bucket, key) = split_bucket_and_key(&host, &path);
        Self {
            method,
            bucket,
            key,
            query: parse_query(&raw_query),
            path,
            raw_query,
            headers,
            body,
        }
    }

    /// Value of the first query parameter called `name`.
    pub fn query_value(&self, name: &str) -> Option<&str> {
        self.query
            .iter()
            .find(|(k, _)| k == name)
            .map(|(_, v)| v.as_str())
    }

    pub fn has_query(&self, name: &str) -> bool {
        self.query.iter().any(|(k, _)| k == name)
    }

    pub fn header(&self, name: &str) -> Option<&str> {
        self.headers.get(name).and_then(|v| v.to_str().ok())
    }

    /// Drop the body and flatten the request into plain strings.
    pub fn to_serialized(&self) -> SerializedRequest {
        let url = if self.raw_query.is_empty() {
            self.path.clone()
        } else {
            format!("{}?{}", self.path, self.raw_query)
        };
        SerializedRequest {
            method: self.method.to_string(),
            url,
            headers: self
                .headers
                .iter()
                .filter_map(|(name, value)| {
                    value
                        .to_str()
                        .ok()
                        .map(|v| (name.as_str().to_string(), v.to_string()))
                })
                .collect(),
        }
    }

    /// Rebuild a request from its serialized form. The body is empty.
    pub fn from_serialized(raw: &SerializedRequest) -> anyhow::Result<Self> {
        let method = Method::from_bytes(raw.method.as_bytes())?;
        let uri: Uri = raw.url.parse()?;
        let mut headers = HeaderMap::new();
        for (name, value) in &raw.headers {
            headers.append(
                HeaderName::from_bytes(name.as_bytes())?,
                HeaderValue::from_str(value)?,
            );
        }
        Ok(Self::new(method, &uri, headers, Bytes::new()))
    }
}

/// Method, URL and headers of a request. The body is never captured.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SerializedRequest {
    pub method: String,
    /// Path plus query string.
    pub url: String,
    pub headers: Vec<(String, String)>,
}

fn split_bucket_and_key(host: &str, path: &str) -> (Option<String>, Option<String>) {
    let trimmed = path.trim_start_matches('/');
    match url_style(host) {
        UrlStyle::Path => {
            let (bucket, key) = match trimmed.split_once('/') {
                Some((bucket, key)) => (bucket, key),
                None => (trimmed, ""),
            };
            (non_empty(decode(bucket)), non_empty(decode(key)))
        }
        UrlStyle::VirtualHosted => {
            let hostname = strip_port(host);
            let bucket = hostname.split('.').next().unwrap_or_default();
            (non_empty(bucket.to_string()), non_empty(decode(trimmed)))
        }
    }
}

fn decode(segment: &str) -> String {
    percent_decode_str(segment).decode_utf8_lossy().into_owned()
}

fn non_empty(value: String) -> Option<String> {
    if value.is_empty() {
        None
    } else {
        Some(value)
    }
}

/// Parse `a=1&b&c=x%20y` into decoded pairs, keeping order. `+` is a space.
pub fn parse_query(raw: &str) -> Vec<(String, String)> {
    raw.split('&')
        .filter(|pair| !pair.is_empty())
        .map(|pair| {
            let (k, v) = pair.split_once('=').unwrap_or((pair, ""));
            (decode(&k.replace('+', " ")), decode(&v.replace('+', " ")))
        })
        .collect()
}
