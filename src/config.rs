//! YAML configuration.
//!
//! Backends, buckets and replicas describe where data
//! lives; the remaining sections tune the listener, logging, metrics and
//! the replication pipeline.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::path::Path;

/// Root of `herald.yaml`.
#[derive(Debug, Clone, Deserialize)]
pub struct Config {
    #[serde(default)]
    pub server: ServerConfig,

    #[serde(default)]
    pub logging: LoggingConfig,

    #[serde(default)]
    pub observability: ObservabilityConfig,

    /// Inbound authentication settings.
    #[serde(default)]
    pub auth: AuthConfig,

    /// Named backend definitions.
    #[serde(default)]
    pub backends: BTreeMap<String, BackendDef>,

    /// Logical bucket name -> primary location.
    #[serde(default)]
    pub buckets: BTreeMap<String, BucketConfig>,

    /// Replica locations, attached to primaries by physical name.
    #[serde(default)]
    pub replicas: Vec<ReplicaConfig>,

    /// Replication pipeline tuning.
    #[serde(default)]
    pub replication: ReplicationConfig,

    /// Where the replication queue is snapshotted.
    #[serde(default)]
    pub task_store: TaskStoreConfig,
}

/// Listener address and shutdown budget.
#[derive(Debug, Clone, Deserialize)]
pub struct ServerConfig {
    /// Bind host address.
    #[serde(default = "default_host")]
    pub host: String,

    /// Bind port.
    #[serde(default = "default_port")]
    pub port: u16,

    /// Seconds allowed, after a stop signal, for draining connections and
    /// the final task store sync together.
    #[serde(default = "default_shutdown_timeout")]
    pub shutdown_timeout: u64,

    /// Seconds a backend call may take from connect to the last body byte.
    #[serde(default = "default_backend_timeout")]
    pub backend_timeout: u64,
}

impl Default for ServerConfig {
    fn default() -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            shutdown_timeout: default_shutdown_timeout(),
            backend_timeout: default_backend_timeout(),
        }
    }
}

/// `tracing` subscriber setup.
#[derive(Debug, Clone, Deserialize)]
pub struct LoggingConfig {
    /// Default `EnvFilter` directive when `RUST_LOG` is unset.
    #[serde(default = "default_log_level")]
    pub level: String,

    /// `text` or `json`.
    #[serde(default = "default_log_format")]
    pub format: String,
}

impl Default for LoggingConfig {
    fn default() -> Self {
        Self {
            level: default_log_level(),
            format: default_log_format(),
        }
    }
}

/// Prometheus exposition.
#[derive(Debug, Clone, Deserialize)]
pub struct ObservabilityConfig {
    /// Enable Prometheus metrics collection and the `/metrics` endpoint.
    #[serde(default = "default_true")]
    pub metrics: bool,
}

impl Default for ObservabilityConfig {
    fn default() -> Self {
        Self { metrics: true }
    }
}

/// Inbound authentication settings.
#[derive(Debug, Clone, Deserialize)]
pub struct AuthConfig {
    /// Verify SigV4 signatures of requests addressed to S3-backed buckets.
    #[serde(default = "default_true")]
    pub verify_signatures: bool,
}

impl Default for AuthConfig {
    fn default() -> Self {
        Self {
            verify_signatures: true,
        }
    }
}

/// Wire protocol spoken by a backend.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Protocol {
    S3,
    Swift,
}

impl Protocol {
    pub fn as_str(&self) -> &'static str {
        match self {
            Protocol::S3 => "s3",
            Protocol::Swift => "swift",
        }
    }
}

/// A named backend definition.
#[derive(Debug, Clone, Deserialize)]
pub struct BackendDef {
    pub protocol: Protocol,
}

/// Access keys for an S3-compatible endpoint.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Credentials {
    #[serde(alias = "accessKeyId")]
    pub access_key_id: String,
    #[serde(alias = "secretAccessKey")]
    pub secret_access_key: String,
}

/// Connection parameters for an S3-compatible bucket.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct S3Config {
    /// Base URL, e.g. `http://minio:9000`.
    pub endpoint: String,
    pub region: String,
    /// Physical bucket name on the backend.
    pub bucket: String,
    #[serde(alias = "forcePathStyle", default = "default_true")]
    pub force_path_style: bool,
    pub credentials: S3Credentials,
}

/// Keystone identity used to obtain Swift tokens.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwiftCredentials {
    pub username: String,
    pub password: String,
    #[serde(default)]
    pub project_name: String,
    #[serde(default = "default_domain")]
    pub user_domain_name: String,
    #[serde(default = "default_domain")]
    pub project_domain_name: String,
}

/// Swift auth API flavour.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SwiftAuthVersion {
    /// Keystone v3 password auth.
    #[default]
    V3,
    /// TempAuth-style `X-Auth-User` / `X-Auth-Key`.
    V1,
}

/// Connection parameters for a Swift container.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct SwiftConfig {
    pub auth_url: String,
    /// Physical container name.
    pub container: String,
    pub region: String,
    #[serde(default)]
    pub auth_version: SwiftAuthVersion,
    pub credentials: SwiftCredentials,
}

/// Either flavour of connection config. The variant must agree with the
/// protocol of the referenced backend.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ConnectionConfig {
    Swift(SwiftConfig),
    S3(S3Config),
}

impl ConnectionConfig {
    pub fn protocol(&self) -> Protocol {
        match self {
            ConnectionConfig::S3(_) => Protocol::S3,
            ConnectionConfig::Swift(_) => Protocol::Swift,
        }
    }
}

/// A primary bucket definition.
#[derive(Debug, Clone, Deserialize)]
pub struct BucketConfig {
    pub backend: String,
    pub config: ConnectionConfig,
}

/// A replica definition.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicaConfig {
    pub name: String,
    pub backend: String,
    pub config: ConnectionConfig,
}

/// Replication pipeline settings.
#[derive(Debug, Clone, Deserialize)]
pub struct ReplicationConfig {
    /// Pending tasks per queue above which enqueue logs a backlog warning.
    #[serde(default = "default_queue_capacity")]
    pub queue_capacity: usize,

    /// Concurrent mirror tasks per destination bucket.
    #[serde(default = "default_workers_per_bucket")]
    pub workers_per_bucket: usize,

    /// Hard per-task timeout in seconds.
    #[serde(default = "default_task_timeout")]
    pub task_timeout: u64,

    /// Interval between task store snapshots in seconds (0 = only on shutdown).
    #[serde(default = "default_sync_interval")]
    pub sync_interval: u64,
}

impl Default for ReplicationConfig {
    fn default() -> Self {
        Self {
            queue_capacity: default_queue_capacity(),
            workers_per_bucket: default_workers_per_bucket(),
            task_timeout: default_task_timeout(),
            sync_interval: default_sync_interval(),
        }
    }
}

/// Durable location of task store snapshots.
#[derive(Debug, Clone, Deserialize)]
pub struct TaskStoreConfig {
    /// Remote S3 storage for snapshots. Falls back to `local_dir` when absent.
    #[serde(default)]
    pub remote: Option<S3Config>,

    /// Bucket that holds the snapshot objects on the remote.
    #[serde(default = "default_task_store_bucket")]
    pub bucket: String,

    /// Local snapshot directory.
    #[serde(default = "default_task_store_dir")]
    pub local_dir: String,
}

impl Default for TaskStoreConfig {
    fn default() -> Self {
        Self {
            remote: None,
            bucket: default_task_store_bucket(),
            local_dir: default_task_store_dir(),
        }
    }
}

// Defaults

fn default_true() -> bool {
    true
}

fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_shutdown_timeout() -> u64 {
    30
}

fn default_backend_timeout() -> u64 {
    300
}

fn default_log_level() -> String {
    "info".to_string()
}

fn default_log_format() -> String {
    "text".to_string()
}

fn default_domain() -> String {
    "Default".to_string()
}

fn default_queue_capacity() -> usize {
    1024
}

fn default_workers_per_bucket() -> usize {
    4
}

fn default_task_timeout() -> u64 {
    240
}

fn default_sync_interval() -> u64 {
    300
}

fn default_task_store_bucket() -> String {
    "task-store".to_string()
}

fn default_task_store_dir() -> String {
    "./data/task-store".to_string()
}

// Validation

impl Config {
    /// Cross-check references between backends, buckets and replicas.
    pub fn validate(&self) -> anyhow::Result<()> {
        for (name, bucket) in &self.buckets {
            self.check_backend(name, &bucket.backend, &bucket.config)?;
        }

        for replica in &self.replicas {
            self.check_backend(&replica.name, &replica.backend, &replica.config)?;
            let physical = physical_name(&replica.config);
            let attached = self
                .buckets
                .values()
                .any(|b| physical_name(&b.config) == physical);
            if !attached {
                anyhow::bail!(
                    "replica '{}' targets '{}' which matches no configured bucket",
                    replica.name,
                    physical
                );
            }
        }

        if self.replication.workers_per_bucket == 0 {
            anyhow::bail!("replication.workers_per_bucket must be at least 1");
        }
        if self.replication.queue_capacity == 0 {
            anyhow::bail!("replication.queue_capacity must be at least 1");
        }
        if self.server.backend_timeout == 0 {
            anyhow::bail!("server.backend_timeout must be at least 1 second");
        }

        Ok(())
    }

    fn check_backend(
        &self,
        owner: &str,
        backend: &str,
        config: &ConnectionConfig,
    ) -> anyhow::Result<()> {
        let def = self
            .backends
            .get(backend)
            .ok_or_else(|| anyhow::anyhow!("'{owner}' references unknown backend '{backend}'"))?;
        if def.protocol != config.protocol() {
            anyhow::bail!(
                "'{owner}' uses backend '{backend}' ({}) with a {} connection config",
                def.protocol.as_str(),
                config.protocol().as_str()
            );
        }
        Ok(())
    }
}

/// Physical bucket or container name of a connection.
pub fn physical_name(config: &ConnectionConfig) -> &str {
    match config {
        ConnectionConfig::S3(c) => &c.bucket,
        ConnectionConfig::Swift(c) => &c.container,
    }
}

// Loading

/// Load, parse and validate configuration from a YAML file at `path`.
pub fn load_config<P: AsRef<Path>>(path: P) -> anyhow::Result<Config> {
    let contents = std::fs::read_to_string(path.as_ref())?;
    parse_config(&contents)
}

/// Parse and validate configuration from YAML text.
pub fn parse_config(contents: &str) -> anyhow::Result<Config> {
    let config: Config = serde_yaml::from_str(contents)?;
    config.validate()?;
    Ok(config)
}
