//! Errors returned to S3 clients.
//!
//! [`S3Error`] carries its own code and status and renders as an XML
//! `<Error>` document, so handlers and middleware return it directly.

use axum::http::StatusCode;
use axum::response::{IntoResponse, Response};
use thiserror::Error;

use crate::xml::render_error;

/// Random request id: 8 bytes as uppercase hex.
pub fn generate_request_id() -> String {
    let bytes: [u8; 8] = rand::random();
    hex::encode(bytes).to_uppercase()
}

/// Client-facing errors of the gateway.
#[derive(Debug, Error)]
pub enum S3Error {
    /// No bucket configuration exists for the addressed bucket.
    #[error("The specified bucket does not exist")]
    NoSuchBucket { bucket: String },

    /// The bucket references a backend that is not configured.
    #[error("Backend configuration missing for backend '{backend}' under bucket '{bucket}'")]
    NoSuchBackend { bucket: String, backend: String },

    #[error("The specified key does not exist.")]
    NoSuchKey { key: String },

    #[error("The bucket you tried to delete is not empty")]
    BucketNotEmpty { bucket: String },

    #[error("{message}")]
    AccessDenied { message: String },

    /// No `Authorization` header on a request that needs one.
    #[error("Authorization header is required")]
    MissingAuthorization,

    #[error("Authorization header is empty.")]
    AuthHeaderEmpty,

    #[error("Signature header missing SignedHeaders field.")]
    MissingSignedHeaders,

    #[error("Signature header has an invalid SignedHeaders field.")]
    InvalidSignedHeaders,

    #[error("Signature header missing Signature field.")]
    MissingSignature,

    #[error("Signature header has an invalid Signature field.")]
    InvalidSignature,

    #[error("{message}")]
    InvalidArgument { message: String },

    #[error("The AWS Access Key Id you provided does not exist in our records.")]
    InvalidAccessKeyId,

    #[error("The request signature we calculated does not match the signature you provided.")]
    SignatureDoesNotMatch,

    /// Malformed or unsupported request shape.
    #[error("{message}")]
    InvalidRequest { message: String },

    #[error("The specified method is not allowed against this resource.")]
    MethodNotAllowed,

    #[error("The specified multipart upload does not exist.")]
    NoSuchUpload { upload_id: String },

    /// A listed part is missing or its ETag does not match.
    #[error("{message}")]
    InvalidPart { message: String },

    #[error("The list of parts was not in ascending order.")]
    InvalidPartOrder,

    #[error("The XML you provided was not well-formed or did not validate against our published schema.")]
    MalformedXML,

    /// Every attempt against the backend (and its replicas) failed.
    #[error("Upstream storage failure: {message}")]
    BadGateway { message: String },

    #[error("We encountered an internal error, please try again.")]
    InternalError(#[from] anyhow::Error),
}

impl S3Error {
    /// `<Code>` value.
    pub fn code(&self) -> &'static str {
        match self {
            S3Error::NoSuchBucket { .. } => "NoSuchBucket",
            S3Error::NoSuchBackend { .. } => "NoSuchBackend",
            S3Error::NoSuchKey { .. } => "NoSuchKey",
            S3Error::BucketNotEmpty { .. } => "BucketNotEmpty",
            S3Error::AccessDenied { .. } | S3Error::MissingAuthorization => "AccessDenied",
            S3Error::AuthHeaderEmpty
            | S3Error::MissingSignedHeaders
            | S3Error::InvalidSignedHeaders
            | S3Error::MissingSignature
            | S3Error::InvalidSignature
            | S3Error::InvalidArgument { .. } => "InvalidArgument",
            S3Error::InvalidAccessKeyId => "InvalidAccessKeyId",
            S3Error::SignatureDoesNotMatch => "SignatureDoesNotMatch",
            S3Error::InvalidRequest { .. } => "InvalidRequest",
            S3Error::MethodNotAllowed => "MethodNotAllowed",
            S3Error::NoSuchUpload { .. } => "NoSuchUpload",
            S3Error::InvalidPart { .. } => "InvalidPart",
            S3Error::InvalidPartOrder => "InvalidPartOrder",
            S3Error::MalformedXML => "MalformedXML",
            S3Error::BadGateway { .. } => "BadGateway",
            S3Error::InternalError(_) => "InternalError",
        }
    }

    pub fn status_code(&self) -> StatusCode {
        match self {
            S3Error::NoSuchBucket { .. }
            | S3Error::NoSuchBackend { .. }
            | S3Error::NoSuchKey { .. }
            | S3Error::NoSuchUpload { .. } => StatusCode::NOT_FOUND,
            S3Error::BucketNotEmpty { .. } => StatusCode::CONFLICT,
            S3Error::AccessDenied { .. }
            | S3Error::InvalidAccessKeyId
            | S3Error::SignatureDoesNotMatch => StatusCode::FORBIDDEN,
            S3Error::MissingAuthorization => StatusCode::UNAUTHORIZED,
            S3Error::AuthHeaderEmpty
            | S3Error::MissingSignedHeaders
            | S3Error::InvalidSignedHeaders
            | S3Error::MissingSignature
            | S3Error::InvalidSignature
            | S3Error::InvalidArgument { .. }
            | S3Error::InvalidRequest { .. }
            | S3Error::InvalidPart { .. }
            | S3Error::InvalidPartOrder
            | S3Error::MalformedXML => StatusCode::BAD_REQUEST,
            S3Error::MethodNotAllowed => StatusCode::METHOD_NOT_ALLOWED,
            S3Error::BadGateway { .. } => StatusCode::BAD_GATEWAY,
            S3Error::InternalError(_) => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// The resource the error refers to, for the XML `Resource` element.
    pub fn resource(&self) -> String {
        match self {
            S3Error::NoSuchBucket { bucket }
            | S3Error::NoSuchBackend { bucket, .. }
            | S3Error::BucketNotEmpty { bucket } => format!("/{bucket}"),
            S3Error::NoSuchKey { key } => key.clone(),
            S3Error::NoSuchUpload { upload_id } => upload_id.clone(),
            _ => String::new(),
        }
    }
}

impl IntoResponse for S3Error {
    fn into_response(self) -> Response {
        let request_id = generate_request_id();
        let status = self.status_code();

        if status.is_server_error() {
            tracing::error!("{}: {:#}", self.code(), self);
        }

        let body = render_error(self.code(), &self.to_string(), &self.resource(), &request_id);

        (
            status,
            [
                ("content-type", "application/xml".to_string()),
                ("x-amz-request-id", request_id),
            ],
            body,
        )
            .into_response()
    }
}
