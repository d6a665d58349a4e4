//! Bucket and replica model.
//!
//! A [`Bucket`] is a plain value: it owns its connection config and its
//! replicas outright, so it can be serialized into a mirror task and
//! rebuilt on the other side of the queue without sharing any state.

use serde::{Deserialize, Serialize};
use std::collections::BTreeMap;

use crate::config::{physical_name, Config, ConnectionConfig, Protocol, S3Config, SwiftConfig};

/// Role and wire protocol of a bucket.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ProtocolType {
    S3,
    Swift,
    ReplicaS3,
    ReplicaSwift,
}

impl ProtocolType {
    fn new(protocol: Protocol, replica: bool) -> Self {
        match (protocol, replica) {
            (Protocol::S3, false) => ProtocolType::S3,
            (Protocol::Swift, false) => ProtocolType::Swift,
            (Protocol::S3, true) => ProtocolType::ReplicaS3,
            (Protocol::Swift, true) => ProtocolType::ReplicaSwift,
        }
    }

    /// Wire protocol regardless of role.
    pub fn protocol(&self) -> Protocol {
        match self {
            ProtocolType::S3 | ProtocolType::ReplicaS3 => Protocol::S3,
            ProtocolType::Swift | ProtocolType::ReplicaSwift => Protocol::Swift,
        }
    }
}

/// One storage location: a primary with its mirrors, or a single replica.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Bucket {
    pub name: String,
    pub config: ConnectionConfig,
    pub protocol_type: ProtocolType,
    pub backend_name: String,
    /// Ordered failover list. Always empty on a replica.
    #[serde(default)]
    pub replicas: Vec<Bucket>,
}

impl Bucket {
    /// Build a primary bucket. Replicas that themselves carry replicas are
    /// flattened so that nesting never goes deeper than one level.
    pub fn primary(
        name: impl Into<String>,
        backend_name: impl Into<String>,
        config: ConnectionConfig,
        replicas: Vec<Bucket>,
    ) -> Self {
        let replicas = replicas
            .into_iter()
            .map(|r| Bucket::replica(r.name, r.backend_name, r.config))
            .collect();
        Self {
            name: name.into(),
            protocol_type: ProtocolType::new(config.protocol(), false),
            config,
            backend_name: backend_name.into(),
            replicas,
        }
    }

    pub fn replica(
        name: impl Into<String>,
        backend_name: impl Into<String>,
        config: ConnectionConfig,
    ) -> Self {
        Self {
            name: name.into(),
            protocol_type: ProtocolType::new(config.protocol(), true),
            config,
            backend_name: backend_name.into(),
            replicas: Vec::new(),
        }
    }

    pub fn has_replicas(&self) -> bool {
        !self.replicas.is_empty()
    }

    pub fn is_replica(&self) -> bool {
        matches!(
            self.protocol_type,
            ProtocolType::ReplicaS3 | ProtocolType::ReplicaSwift
        )
    }

    /// Bucket or container name used on the wire.
    pub fn physical_name(&self) -> &str {
        physical_name(&self.config)
    }

    pub fn protocol(&self) -> Protocol {
        self.protocol_type.protocol()
    }

    /// Look up one of this bucket's replicas by logical name.
    pub fn find_replica(&self, name: &str) -> Option<&Bucket> {
        self.replicas.iter().find(|r| r.name == name)
    }

    /// Storage identity used by the lock counters: `protocol:endpoint/region`.
    pub fn storage_key(&self) -> String {
        match &self.config {
            ConnectionConfig::Swift(c) => format!("swift:{}/{}", c.auth_url, c.region),
            ConnectionConfig::S3(c) => format!("s3:{}/{}", c.endpoint, c.region),
        }
    }

    pub fn s3_config(&self) -> Option<&S3Config> {
        match &self.config {
            ConnectionConfig::S3(c) => Some(c),
            ConnectionConfig::Swift(_) => None,
        }
    }

    pub fn swift_config(&self) -> Option<&SwiftConfig> {
        match &self.config {
            ConnectionConfig::Swift(c) => Some(c),
            ConnectionConfig::S3(_) => None,
        }
    }
}

/// Every configured primary, keyed by logical name. Read-only after startup.
#[derive(Debug, Clone, Default)]
pub struct BucketStore {
    buckets: BTreeMap<String, Bucket>,
}

impl BucketStore {
    /// Build the store from validated configuration. Replicas attach to the
    /// primary with the same physical name, in configuration order.
    pub fn from_config(config: &Config) -> Self {
        let mut buckets = BTreeMap::new();
        for (name, bucket_config) in &config.buckets {
            let physical = physical_name(&bucket_config.config);
            let replicas = config
                .replicas
                .iter()
                .filter(|r| physical_name(&r.config) == physical)
                .map(|r| Bucket::replica(&r.name, &r.backend, r.config.clone()))
                .collect();
            let bucket = Bucket::primary(
                name,
                &bucket_config.backend,
                bucket_config.config.clone(),
                replicas,
            );
            buckets.insert(name.clone(), bucket);
        }
        Self { buckets }
    }

    pub fn from_buckets(list: impl IntoIterator<Item = Bucket>) -> Self {
        Self {
            buckets: list.into_iter().map(|b| (b.name.clone(), b)).collect(),
        }
    }

    pub fn get(&self, name: &str) -> Option<&Bucket> {
        self.buckets.get(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Bucket> {
        self.buckets.values()
    }

    pub fn len(&self) -> usize {
        self.buckets.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buckets.is_empty()
    }
}
