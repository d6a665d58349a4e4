//! Herald: an S3 gateway in front of S3-compatible and OpenStack Swift
//! backends.
//!
//! Each logical bucket maps to one primary backend and zero or more
//! replicas. Requests are translated to the primary's protocol; reads fail
//! over to replicas, and successful mutations are mirrored to every replica
//! through a durable task queue.

use std::sync::Arc;

pub mod auth;
pub mod backends;
pub mod buckets;
pub mod config;
pub mod errors;
pub mod forward;
pub mod metrics;
pub mod replication;
pub mod request;
pub mod resolver;
pub mod retry;
pub mod server;
pub mod xml;

#[cfg(test)]
mod testing;

use crate::backends::Backends;
use crate::buckets::BucketStore;
use crate::config::Config;
use crate::replication::TaskStore;

/// Shared application state passed to all handlers via `axum::extract::State`.
pub struct AppState {
    /// Validated configuration.
    pub config: Arc<Config>,
    /// Every configured primary with its replicas. Read-only.
    pub buckets: Arc<BucketStore>,
    /// Protocol adapters and the shared HTTP client.
    pub backends: Backends,
    /// Mirror task queues.
    pub tasks: Arc<TaskStore>,
}
