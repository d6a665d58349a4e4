//! Swift token acquisition.
//!
//! Keystone v3 password auth finds the storage URL in the service catalog;
//! v1 auth returns it directly in `X-Storage-Url`. Tokens are not cached.

use axum::http::{HeaderMap, HeaderValue};
use serde::{Deserialize, Serialize};
use tracing::debug;

use crate::backends::BackendError;
use crate::config::{SwiftAuthVersion, SwiftConfig};
use crate::retry::{retry_with_backoff, RetryPolicy};

/// Token plus the account URL it is valid for.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SwiftSession {
    pub storage_url: String,
    pub token: String,
}

impl SwiftSession {
    /// Headers every Swift call carries.
    pub fn headers(&self) -> Result<HeaderMap, BackendError> {
        let mut headers = HeaderMap::new();
        let token = HeaderValue::from_str(&self.token)
            .map_err(|e| BackendError::SwiftAuth(format!("unusable token: {e}")))?;
        headers.insert("x-auth-token", token);
        headers.insert("accept", HeaderValue::from_static("application/xml"));
        Ok(headers)
    }
}

/// Obtain a fresh session for `config`, retried with
/// [`RetryPolicy::SWIFT_AUTH`].
pub async fn authenticate(
    client: &reqwest::Client,
    config: &SwiftConfig,
) -> Result<SwiftSession, BackendError> {
    retry_with_backoff(RetryPolicy::SWIFT_AUTH, || async move {
        match config.auth_version {
            SwiftAuthVersion::V3 => keystone_v3(client, config).await,
            SwiftAuthVersion::V1 => auth_v1(client, config).await,
        }
    })
    .await
}

// ── Keystone v3 ─────────────────────────────────────────────────────

#[derive(Serialize)]
struct AuthRequest<'a> {
    auth: Auth<'a>,
}

#[derive(Serialize)]
struct Auth<'a> {
    identity: Identity<'a>,
    #[serde(skip_serializing_if = "Option::is_none")]
    scope: Option<Scope<'a>>,
}

#[derive(Serialize)]
struct Identity<'a> {
    methods: [&'a str; 1],
    password: PasswordMethod<'a>,
}

#[derive(Serialize)]
struct PasswordMethod<'a> {
    user: User<'a>,
}

#[derive(Serialize)]
struct User<'a> {
    name: &'a str,
    domain: Named<'a>,
    password: &'a str,
}

#[derive(Serialize)]
struct Scope<'a> {
    project: Project<'a>,
}

#[derive(Serialize)]
struct Project<'a> {
    name: &'a str,
    domain: Named<'a>,
}

#[derive(Serialize)]
struct Named<'a> {
    name: &'a str,
}

#[derive(Debug, Deserialize)]
struct TokenResponse {
    token: Token,
}

#[derive(Debug, Deserialize)]
struct Token {
    #[serde(default)]
    catalog: Vec<CatalogEntry>,
}

#[derive(Debug, Deserialize)]
struct CatalogEntry {
    #[serde(rename = "type")]
    kind: String,
    #[serde(default)]
    endpoints: Vec<Endpoint>,
}

#[derive(Debug, Deserialize)]
struct Endpoint {
    interface: String,
    #[serde(default)]
    region: Option<String>,
    #[serde(default)]
    region_id: Option<String>,
    url: String,
}

fn auth_body(config: &SwiftConfig) -> AuthRequest<'_> {
    let creds = &config.credentials;
    AuthRequest {
        auth: Auth {
            identity: Identity {
                methods: ["password"],
                password: PasswordMethod {
                    user: User {
                        name: &creds.username,
                        domain: Named {
                            name: &creds.user_domain_name,
                        },
                        password: &creds.password,
                    },
                },
            },
            scope: (!creds.project_name.is_empty()).then(|| Scope {
                project: Project {
                    name: &creds.project_name,
                    domain: Named {
                        name: &creds.project_domain_name,
                    },
                },
            }),
        },
    }
}

async fn keystone_v3(
    client: &reqwest::Client,
    config: &SwiftConfig,
) -> Result<SwiftSession, BackendError> {
    let url = format!("{}/auth/tokens", config.auth_url.trim_end_matches('/'));
    let response = client.post(&url).json(&auth_body(config)).send().await?;

    let status = response.status();
    if !status.is_success() {
        return Err(BackendError::SwiftAuth(format!("keystone returned {status}")));
    }

    let token = response
        .headers()
        .get("x-subject-token")
        .and_then(|v| v.to_str().ok())
        .map(str::to_string)
        .ok_or_else(|| BackendError::SwiftAuth("missing X-Subject-Token".to_string()))?;

    let body: TokenResponse = response
        .json()
        .await
        .map_err(|e| BackendError::InvalidPayload(format!("keystone token body: {e}")))?;
    let storage_url = object_store_url(&body.token.catalog, &config.region)?;

    debug!("Keystone v3 token acquired for {}", config.credentials.username);
    Ok(SwiftSession { storage_url, token })
}

fn object_store_url(catalog: &[CatalogEntry], region: &str) -> Result<String, BackendError> {
    catalog
        .iter()
        .filter(|entry| entry.kind == "object-store")
        .flat_map(|entry| entry.endpoints.iter())
        .find(|ep| {
            ep.interface == "public"
                && (ep.region.as_deref() == Some(region) || ep.region_id.as_deref() == Some(region))
        })
        .map(|ep| ep.url.trim_end_matches('/').to_string())
        .ok_or_else(|| BackendError::MissingEndpoint {
            region: region.to_string(),
        })
}

// ── v1 ──────────────────────────────────────────────────────────────

async fn auth_v1(
    client: &reqwest::Client,
    config: &SwiftConfig,
) -> Result<SwiftSession, BackendError> {
    let response = client
        .get(&config.auth_url)
        .header("x-auth-user", &config.credentials.username)
        .header("x-auth-key", &config.credentials.password)
        .send()
        .await?;

    let status = response.status();
    if !status.is_success() {
        return Err(BackendError::SwiftAuth(format!("v1 auth returned {status}")));
    }

    let header = |name: &str| {
        response
            .headers()
            .get(name)
            .and_then(|v| v.to_str().ok())
            .map(str::to_string)
            .ok_or_else(|| BackendError::SwiftAuth(format!("missing {name}")))
    };
    let storage_url = header("x-storage-url")?;
    let token = header("x-auth-token")?;

    debug!("v1 token acquired for {}", config.credentials.username);
    Ok(SwiftSession {
        storage_url: storage_url.trim_end_matches('/').to_string(),
        token,
    })
}
