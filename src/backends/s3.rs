//! S3 protocol adapter.
//!
//! Calls are relayed almost verbatim: the logical bucket is swapped for
//! the physical one, the request is re-signed with the backend's keys and
//! the backend response goes back untouched. Multipart uploads are relayed
//! the same way, so upload ids are the backend's own.

use axum::http::Method;

use super::{AdapterFuture, AdapterResult, BackendError, ProtocolAdapter, SubResource};
use crate::buckets::Bucket;
use crate::config::S3Config;
use crate::forward::Forwarder;
use crate::request::ProxyRequest;
use crate::retry::RetryPolicy;

pub struct S3Adapter {
    forwarder: Forwarder,
}

impl S3Adapter {
    pub fn new(forwarder: Forwarder) -> Self {
        Self { forwarder }
    }

    fn config(bucket: &Bucket) -> Result<&S3Config, BackendError> {
        bucket.s3_config().ok_or_else(|| {
            BackendError::InvalidRequest(format!("bucket '{}' is not an S3 bucket", bucket.name))
        })
    }

    /// Relay `req` to the backend, keeping method, key, query and body.
    async fn relay(&self, bucket: &Bucket, req: &ProxyRequest, policy: RetryPolicy) -> AdapterResult {
        let config = Self::config(bucket)?;
        self.forwarder
            .forward_s3(
                config,
                req.method.clone(),
                req.key.as_deref(),
                &req.query,
                &req.headers,
                req.body.clone(),
                policy,
            )
            .await
    }
}

impl ProtocolAdapter for S3Adapter {
    fn get_object<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(async move {
            let config = Self::config(bucket)?;
            self.forwarder
                .forward_s3(
                    config,
                    Method::GET,
                    req.key.as_deref(),
                    &req.query,
                    &req.headers,
                    bytes::Bytes::new(),
                    policy,
                )
                .await
        })
    }

    fn head_object<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(async move {
            let config = Self::config(bucket)?;
            self.forwarder
                .forward_s3(
                    config,
                    Method::HEAD,
                    req.key.as_deref(),
                    &req.query,
                    &req.headers,
                    bytes::Bytes::new(),
                    policy,
                )
                .await
        })
    }

    fn put_object<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(self.relay(bucket, req, policy))
    }

    fn delete_object<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(self.relay(bucket, req, policy))
    }

    fn copy_object<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(async move {
            let config = Self::config(bucket)?;
            self.forwarder
                .forward_s3(
                    config,
                    Method::PUT,
                    req.key.as_deref(),
                    &req.query,
                    &req.headers,
                    bytes::Bytes::new(),
                    policy,
                )
                .await
        })
    }

    fn list_objects<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(async move {
            let config = Self::config(bucket)?;
            self.forwarder
                .forward_s3(
                    config,
                    Method::GET,
                    None,
                    &req.query,
                    &req.headers,
                    bytes::Bytes::new(),
                    policy,
                )
                .await
        })
    }

    fn create_bucket<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(self.relay(bucket, req, policy))
    }

    fn delete_bucket<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(self.relay(bucket, req, policy))
    }

    fn head_bucket<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(async move {
            let config = Self::config(bucket)?;
            self.forwarder
                .forward_s3(
                    config,
                    Method::HEAD,
                    None,
                    &req.query,
                    &req.headers,
                    bytes::Bytes::new(),
                    policy,
                )
                .await
        })
    }

    fn get_bucket_subresource<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        _resource: SubResource,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(async move {
            let config = Self::config(bucket)?;
            self.forwarder
                .forward_s3(
                    config,
                    Method::GET,
                    None,
                    &req.query,
                    &req.headers,
                    bytes::Bytes::new(),
                    policy,
                )
                .await
        })
    }

    fn create_multipart_upload<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(self.relay(bucket, req, policy))
    }

    fn upload_part<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(self.relay(bucket, req, policy))
    }

    fn complete_multipart_upload<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(self.relay(bucket, req, policy))
    }

    fn abort_multipart_upload<'a>(
        &'a self,
        bucket: &'a Bucket,
        req: &'a ProxyRequest,
        policy: RetryPolicy,
    ) -> AdapterFuture<'a> {
        Box::pin(self.relay(bucket, req, policy))
    }
}
