//! AWS Signature Version 4 signing and verification.
//!
//! Inbound requests carry `Authorization: AWS4-HMAC-SHA256 ...` headers that
//! are checked against the addressed bucket's credentials. Outbound requests
//! to S3-compatible backends are signed with the backend's own credentials.
//!
//! Both directions share one pipeline: canonical request, string to sign,
//! date/region/service key chain, hex HMAC.

use chrono::{DateTime, Utc};
use hmac::{Hmac, Mac};
use http::header::{HeaderMap, HeaderName, HeaderValue, AUTHORIZATION};
use percent_encoding::percent_decode_str;
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use subtle::ConstantTimeEq;

use crate::config::S3Credentials;
use crate::errors::S3Error;

type HmacSha256 = Hmac<Sha256>;

const ALGORITHM: &str = "AWS4-HMAC-SHA256";

/// Payload hash marker for bodies that were not hashed by the client.
pub const UNSIGNED_PAYLOAD: &str = "UNSIGNED-PAYLOAD";

/// Headers left out of outbound signatures. Intermediaries are free to
/// rewrite these.
const UNSIGNABLE_HEADERS: &[&str] = &[
    "accept",
    "accept-language",
    "content-length",
    "authorization",
    "connection",
    "expect",
    "user-agent",
    "transfer-encoding",
    "x-amzn-trace-id",
];

// Header parsing

/// Fields of an `AWS4-HMAC-SHA256` authorization header.
#[derive(Debug, Clone)]
pub struct ParsedAuthorization {
    pub access_key_id: String,
    /// YYYYMMDD from the Credential field.
    pub date_stamp: String,
    pub region: String,
    pub service: String,
    /// Semicolon-separated, lowercase.
    pub signed_headers: String,
    /// 64-char lowercase hex.
    pub signature: String,
    pub credential_scope: String,
}

/// Split an authorization header into credential, signed headers and
/// signature. Each malformed shape maps to its own error: an empty header, a missing
/// or empty `SignedHeaders=`, a missing or non-hex `Signature=`, and a bad
/// `Credential=` scope.
pub fn parse_authorization_header(header: &str) -> Result<ParsedAuthorization, S3Error> {
    let header = header.trim();
    if header.is_empty() {
        return Err(S3Error::AuthHeaderEmpty);
    }

    let rest = header.strip_prefix(ALGORITHM).unwrap_or(header).trim();

    let mut credential = None;
    let mut signed_headers = None;
    let mut signature = None;

    for part in rest.split(',') {
        let part = part.trim();
        if let Some(val) = part.strip_prefix("Credential=") {
            credential = Some(val.trim().to_string());
        } else if let Some(val) = part.strip_prefix("SignedHeaders=") {
            signed_headers = Some(val.trim().to_string());
        } else if let Some(val) = part.strip_prefix("Signature=") {
            signature = Some(val.trim().to_string());
        }
    }

    let signed_headers = signed_headers.ok_or(S3Error::MissingSignedHeaders)?;
    if signed_headers.is_empty()
        || signed_headers
            .split(';')
            .any(|h| h.is_empty() || h.chars().any(|c| c.is_ascii_uppercase() || c.is_whitespace()))
    {
        return Err(S3Error::InvalidSignedHeaders);
    }

    let signature = signature.ok_or(S3Error::MissingSignature)?;
    if signature.len() != 64 || !signature.chars().all(|c| c.is_ascii_hexdigit()) {
        return Err(S3Error::InvalidSignature);
    }

    let credential = credential.ok_or_else(|| S3Error::InvalidArgument {
        message: "Authorization header missing Credential field.".to_string(),
    })?;

    // AKID/YYYYMMDD/region/service/aws4_request
    let parts: Vec<&str> = credential.splitn(5, '/').collect();
    if parts.len() != 5 || parts[4] != "aws4_request" {
        return Err(S3Error::InvalidArgument {
            message: format!("Malformed credential scope: {credential}"),
        });
    }

    Ok(ParsedAuthorization {
        access_key_id: parts[0].to_string(),
        date_stamp: parts[1].to_string(),
        region: parts[2].to_string(),
        service: parts[3].to_string(),
        credential_scope: parts[1..].join("/"),
        signed_headers,
        signature: signature.to_lowercase(),
    })
}

// Canonical forms

/// Method, path, sorted query, the listed headers, the header list and
/// the payload hash, one per line.
pub fn build_canonical_request(
    method: &str,
    uri: &str,
    query_string: &str,
    headers: &[(String, String)],
    signed_headers_str: &str,
    payload_hash: &str,
) -> String {
    // S3 signs the raw path without normalization.
    let canonical_uri = if uri.is_empty() { "/" } else { uri };
    let canonical_query = build_canonical_query_string(query_string);

    let mut canonical_headers = String::new();
    for name in signed_headers_str.split(';') {
        if let Some((hname, hval)) = headers.iter().find(|(n, _)| n == name) {
            canonical_headers.push_str(hname);
            canonical_headers.push(':');
            canonical_headers.push_str(&collapse_whitespace(hval));
            canonical_headers.push('\n');
        }
    }

    format!(
        "{method}\n{canonical_uri}\n{canonical_query}\n{canonical_headers}\n{signed_headers_str}\n{payload_hash}"
    )
}

/// Build the canonical query string from a raw (already percent-encoded)
/// query string: decode each pair, re-encode with S3 rules, sort.
pub fn build_canonical_query_string(query_string: &str) -> String {
    let mut params: Vec<(String, String)> = query_string
        .split('&')
        .filter(|part| !part.is_empty())
        .map(|part| {
            let (k, v) = part.split_once('=').unwrap_or((part, ""));
            (
                s3_uri_encode(&percent_decode(k), true),
                s3_uri_encode(&percent_decode(v), true),
            )
        })
        .collect();

    params.sort();

    params
        .iter()
        .map(|(k, v)| format!("{k}={v}"))
        .collect::<Vec<_>>()
        .join("&")
}

/// Algorithm, timestamp, scope and the hex digest of the canonical request.
pub fn build_string_to_sign(
    timestamp: &str,
    credential_scope: &str,
    canonical_request: &str,
) -> String {
    let hash = hex::encode(Sha256::digest(canonical_request.as_bytes()));
    format!("{ALGORITHM}\n{timestamp}\n{credential_scope}\n{hash}")
}

// Keys

/// Signing key for one day, region and service.
pub fn derive_signing_key(
    secret_key: &str,
    date_stamp: &str,
    region: &str,
    service: &str,
) -> Vec<u8> {
    let seed = format!("AWS4{secret_key}").into_bytes();
    [date_stamp.as_bytes(), region.as_bytes(), service.as_bytes(), &b"aws4_request"[..]]
        .iter()
        .fold(seed, |key, scope| hmac_sha256(&key, scope))
}

fn hmac_sha256(key: &[u8], data: &[u8]) -> Vec<u8> {
    let mut mac = HmacSha256::new_from_slice(key).expect("hmac accepts any key length");
    mac.update(data);
    mac.finalize().into_bytes().to_vec()
}

/// HexEncode(HMAC-SHA256(SigningKey, StringToSign)).
pub fn compute_signature(signing_key: &[u8], string_to_sign: &str) -> String {
    hex::encode(hmac_sha256(signing_key, string_to_sign.as_bytes()))
}

/// Constant-time string equality.
pub fn constant_time_eq(a: &str, b: &str) -> bool {
    if a.len() != b.len() {
        return false;
    }
    a.as_bytes().ct_eq(b.as_bytes()).into()
}

// Inbound

/// Verify an inbound header-signed request against `credentials`.
///
/// The payload hash is the client's `x-amz-content-sha256` when present,
/// otherwise the SHA-256 of `body`.
pub fn verify_request(
    method: &str,
    path: &str,
    query_string: &str,
    header_map: &HeaderMap,
    body: &[u8],
    credentials: &S3Credentials,
) -> Result<(), S3Error> {
    let raw = header_map
        .get(AUTHORIZATION)
        .ok_or(S3Error::AuthHeaderEmpty)?
        .to_str()
        .map_err(|_| S3Error::AuthHeaderEmpty)?;
    let parsed = parse_authorization_header(raw)?;

    if parsed.access_key_id != credentials.access_key_id {
        return Err(S3Error::InvalidAccessKeyId);
    }

    let headers = extract_headers_for_signing(header_map);
    let payload_hash = match find_header_value(&headers, "x-amz-content-sha256") {
        Some(hash) => hash.to_string(),
        None => hex::encode(Sha256::digest(body)),
    };

    let canonical_request = build_canonical_request(
        method,
        path,
        query_string,
        &headers,
        &parsed.signed_headers,
        &payload_hash,
    );

    let timestamp = find_header_value(&headers, "x-amz-date")
        .or_else(|| find_header_value(&headers, "date"))
        .unwrap_or_default();

    let string_to_sign =
        build_string_to_sign(timestamp, &parsed.credential_scope, &canonical_request);
    let signing_key = derive_signing_key(
        &credentials.secret_access_key,
        &parsed.date_stamp,
        &parsed.region,
        &parsed.service,
    );
    let computed = compute_signature(&signing_key, &string_to_sign);

    if constant_time_eq(&computed, &parsed.signature) {
        Ok(())
    } else {
        Err(S3Error::SignatureDoesNotMatch)
    }
}

// Outbound

/// Sign an outbound request in place.
///
/// `path` and `query_string` must already be in their final encoded form.
/// Sets `host`, `x-amz-date`, `x-amz-content-sha256` and `authorization`,
/// signing every header present except [`UNSIGNABLE_HEADERS`].
#[allow(clippy::too_many_arguments)]
pub fn sign_request(
    method: &str,
    host: &str,
    path: &str,
    query_string: &str,
    header_map: &mut HeaderMap,
    payload_hash: &str,
    credentials: &S3Credentials,
    region: &str,
    now: DateTime<Utc>,
) -> Result<(), S3Error> {
    let amz_date = now.format("%Y%m%dT%H%M%SZ").to_string();
    let date_stamp = &amz_date[..8];

    header_map.remove(AUTHORIZATION);
    header_map.insert(http::header::HOST, header_value(host)?);
    header_map.insert(HeaderName::from_static("x-amz-date"), header_value(&amz_date)?);
    header_map.insert(
        HeaderName::from_static("x-amz-content-sha256"),
        header_value(payload_hash)?,
    );

    let headers: Vec<(String, String)> = extract_headers_for_signing(header_map)
        .into_iter()
        .filter(|(name, _)| !UNSIGNABLE_HEADERS.contains(&name.as_str()))
        .collect();
    let signed_headers = headers
        .iter()
        .map(|(name, _)| name.as_str())
        .collect::<Vec<_>>()
        .join(";");

    let credential_scope = format!("{date_stamp}/{region}/s3/aws4_request");
    let canonical_request = build_canonical_request(
        method,
        path,
        query_string,
        &headers,
        &signed_headers,
        payload_hash,
    );
    let string_to_sign = build_string_to_sign(&amz_date, &credential_scope, &canonical_request);
    let signing_key =
        derive_signing_key(&credentials.secret_access_key, date_stamp, region, "s3");
    let signature = compute_signature(&signing_key, &string_to_sign);

    let authorization = format!(
        "{ALGORITHM} Credential={}/{credential_scope}, SignedHeaders={signed_headers}, Signature={signature}",
        credentials.access_key_id
    );
    header_map.insert(AUTHORIZATION, header_value(&authorization)?);
    Ok(())
}

fn header_value(value: &str) -> Result<HeaderValue, S3Error> {
    HeaderValue::from_str(value).map_err(|e| S3Error::InternalError(e.into()))
}

// Encoding helpers

/// Percent-encode everything outside the RFC 3986 unreserved set, using
/// uppercase hex. Paths keep their `/` when `encode_slash` is false.
pub fn s3_uri_encode(input: &str, encode_slash: bool) -> String {
    input
        .bytes()
        .map(|byte| match byte {
            b if b.is_ascii_alphanumeric() || b"-_.~".contains(&b) => (b as char).to_string(),
            b'/' if !encode_slash => "/".to_string(),
            b => format!("%{b:02X}"),
        })
        .collect()
}

fn percent_decode(s: &str) -> String {
    percent_decode_str(s).decode_utf8_lossy().into_owned()
}

/// Collapse runs of whitespace to a single space and trim the ends.
fn collapse_whitespace(s: &str) -> String {
    s.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn find_header_value<'a>(headers: &'a [(String, String)], name: &str) -> Option<&'a str> {
    headers
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

/// Headers as sorted (lowercase-name, value) pairs; repeated headers are
/// joined with a comma.
pub fn extract_headers_for_signing(header_map: &HeaderMap) -> Vec<(String, String)> {
    let mut grouped: BTreeMap<String, Vec<String>> = BTreeMap::new();
    for (name, value) in header_map {
        grouped
            .entry(name.as_str().to_lowercase())
            .or_default()
            .push(value.to_str().unwrap_or("").to_string());
    }
    grouped
        .into_iter()
        .map(|(name, values)| (name, values.join(",")))
        .collect()
}
