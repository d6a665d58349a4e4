//! Swift container listings reshaped as S3 `ListBucketResult`.

use chrono::{DateTime, NaiveDateTime, Utc};
use serde::{Deserialize, Serialize};

use crate::backends::{quote_etag, BackendError};
use crate::xml::{ListBucketResult, ListEntry};

const DEFAULT_MAX_KEYS: u32 = 1000;

/// One row of a `?format=json` container listing.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum SwiftListingEntry {
    Object {
        name: String,
        bytes: u64,
        hash: String,
        last_modified: String,
        #[serde(default, skip_serializing_if = "Option::is_none")]
        content_type: Option<String>,
    },
    Subdir {
        subdir: String,
    },
}

/// ListObjectsV2 parameters as sent by the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ListParams {
    pub prefix: String,
    pub delimiter: String,
    pub continuation_token: Option<String>,
    pub start_after: Option<String>,
    pub max_keys: u32,
}

impl ListParams {
    pub fn from_query(query: &[(String, String)]) -> Self {
        let get = |name: &str| {
            query
                .iter()
                .find(|(k, _)| k == name)
                .map(|(_, v)| v.clone())
        };
        Self {
            prefix: get("prefix").unwrap_or_default(),
            delimiter: get("delimiter").unwrap_or_default(),
            continuation_token: get("continuation-token").filter(|t| !t.is_empty()),
            start_after: get("start-after").filter(|s| !s.is_empty()),
            max_keys: get("max-keys")
                .and_then(|v| v.parse().ok())
                .unwrap_or(DEFAULT_MAX_KEYS)
                .min(DEFAULT_MAX_KEYS),
        }
    }

    /// Swift's `marker`: the continuation token wins over `start-after`.
    pub fn marker(&self) -> Option<&str> {
        self.continuation_token
            .as_deref()
            .or(self.start_after.as_deref())
    }

    /// The equivalent Swift query string parameters.
    pub fn swift_query(&self) -> Vec<(String, String)> {
        let mut query = vec![("format".to_string(), "json".to_string())];
        if !self.prefix.is_empty() {
            query.push(("prefix".to_string(), self.prefix.clone()));
        }
        if !self.delimiter.is_empty() {
            query.push(("delimiter".to_string(), self.delimiter.clone()));
        }
        if let Some(marker) = self.marker() {
            query.push(("marker".to_string(), marker.to_string()));
        }
        query.push(("limit".to_string(), self.max_keys.to_string()));
        query
    }
}

/// Parse a JSON listing body. An empty body (204) is an empty listing.
pub fn parse_listing(body: &[u8]) -> Result<Vec<SwiftListingEntry>, BackendError> {
    if body.iter().all(u8::is_ascii_whitespace) {
        return Ok(Vec::new());
    }
    serde_json::from_slice(body)
        .map_err(|e| BackendError::InvalidPayload(format!("swift listing: {e}")))
}

/// Swift `2024-01-02T03:04:05.123456` to S3 `2024-01-02T03:04:05.123Z`.
pub fn to_s3_timestamp(raw: &str) -> String {
    let parsed = NaiveDateTime::parse_from_str(raw, "%Y-%m-%dT%H:%M:%S%.f")
        .map(|naive| naive.and_utc())
        .or_else(|_| DateTime::parse_from_rfc3339(raw).map(|dt| dt.with_timezone(&Utc)));
    match parsed {
        Ok(dt) => dt.format("%Y-%m-%dT%H:%M:%S%.3fZ").to_string(),
        Err(_) => raw.to_string(),
    }
}

/// Build the S3 result for bucket `name` from Swift `entries`.
pub fn to_list_bucket_result(
    name: &str,
    params: &ListParams,
    entries: &[SwiftListingEntry],
) -> ListBucketResult {
    let entries = &entries[..entries.len().min(params.max_keys as usize)];

    let mut contents = Vec::new();
    let mut common_prefixes = Vec::new();
    for entry in entries {
        match entry {
            SwiftListingEntry::Object {
                name,
                bytes,
                hash,
                last_modified,
                ..
            } => contents.push(ListEntry {
                key: name.clone(),
                last_modified: to_s3_timestamp(last_modified),
                etag: quote_etag(hash),
                size: *bytes,
                storage_class: "STANDARD".to_string(),
            }),
            SwiftListingEntry::Subdir { subdir } => common_prefixes.push(subdir.clone()),
        }
    }

    let is_truncated = params.max_keys > 0 && entries.len() == params.max_keys as usize;
    let next_continuation_token = if is_truncated {
        contents
            .last()
            .map(|e| e.key.clone())
            .or_else(|| common_prefixes.last().cloned())
    } else {
        None
    };

    ListBucketResult {
        name: name.to_string(),
        prefix: params.prefix.clone(),
        delimiter: params.delimiter.clone(),
        max_keys: params.max_keys,
        is_truncated,
        key_count: (contents.len() + common_prefixes.len()) as u32,
        contents,
        common_prefixes,
        continuation_token: params.continuation_token.clone(),
        next_continuation_token,
        start_after: params.start_after.clone(),
    }
}
