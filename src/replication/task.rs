//! Mirror task model.

use serde::{Deserialize, Serialize};

use crate::backends::Operation;
use crate::buckets::Bucket;
use crate::request::{ProxyRequest, SerializedRequest};

/// Mutating verbs that are replayed against replicas.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub enum MirrorCommand {
    PutObject,
    DeleteObject,
    CopyObject,
    CreateBucket,
    DeleteBucket,
}

impl MirrorCommand {
    /// The command a successful `op` triggers, if any.
    pub fn for_operation(op: Operation) -> Option<Self> {
        match op {
            Operation::PutObject => Some(MirrorCommand::PutObject),
            Operation::DeleteObject => Some(MirrorCommand::DeleteObject),
            Operation::CopyObject => Some(MirrorCommand::CopyObject),
            // The assembled object is re-read from the primary like any put.
            Operation::CompleteMultipartUpload => Some(MirrorCommand::PutObject),
            Operation::CreateBucket => Some(MirrorCommand::CreateBucket),
            Operation::DeleteBucket => Some(MirrorCommand::DeleteBucket),
            _ => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            MirrorCommand::PutObject => "putObject",
            MirrorCommand::DeleteObject => "deleteObject",
            MirrorCommand::CopyObject => "copyObject",
            MirrorCommand::CreateBucket => "createBucket",
            MirrorCommand::DeleteBucket => "deleteBucket",
        }
    }
}

/// One operation to replay against one replica.
///
/// Both buckets are carried by value so the task is self-contained once
/// it leaves the request path.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct MirrorTask {
    #[serde(rename = "mainBucketConfig")]
    pub main_bucket: Bucket,
    #[serde(rename = "backupBucketConfig")]
    pub backup_bucket: Bucket,
    pub command: MirrorCommand,
    /// Method, URL and headers of the client request. No body.
    pub original_request: SerializedRequest,
    /// Set by the task store at enqueue time. Not checked for duplicates.
    #[serde(default)]
    pub nonce: String,
}

impl MirrorTask {
    /// One task per replica of `bucket`, in failover order.
    pub fn for_replicas(bucket: &Bucket, command: MirrorCommand, req: &ProxyRequest) -> Vec<Self> {
        let original_request = req.to_serialized();
        bucket
            .replicas
            .iter()
            .map(|replica| MirrorTask {
                main_bucket: bucket.clone(),
                backup_bucket: replica.clone(),
                command,
                original_request: original_request.clone(),
                nonce: String::new(),
            })
            .collect()
    }

    /// Queue this task belongs to: its primary bucket.
    pub fn queue_name(&self) -> &str {
        &self.main_bucket.name
    }
}
