//! Asynchronous mirroring of mutations from primaries to their replicas.

pub mod mirror;
pub mod snapshot;
pub mod store;
pub mod task;
pub mod worker;

pub use mirror::{process_task, MirrorError};
pub use snapshot::{FileSnapshotStore, S3SnapshotStore, SnapshotError, SnapshotStore};
pub use store::TaskStore;
pub use task::{MirrorCommand, MirrorTask};
pub use worker::Replicator;
