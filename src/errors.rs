//! Error types shared by every [`super::ObjectStore`] and the helpers built on top of them.

use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::abort_multipart_upload::AbortMultipartUploadError;
use aws_sdk_s3::operation::complete_multipart_upload::CompleteMultipartUploadError;
use aws_sdk_s3::operation::create_multipart_upload::CreateMultipartUploadError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::operation::put_object::PutObjectError;
use aws_sdk_s3::operation::upload_part::UploadPartError;
use thiserror;

pub type Result<T> = std::result::Result<T, Error>;

/// Error type carried by object body streams.
pub type BoxError = Box<dyn std::error::Error + Send + Sync + 'static>;

/// General purpose error returned by the helpers in this crate.
///
/// Errors are surfaced to the caller as-is; nothing here retries or recovers. Partially collected
/// buffers and partially uploaded parts are discarded before one of these is returned.
#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("object not found: {0}")]
    NotFound(String),

    #[error("transport error: {0}")]
    Transport(#[from] TransportError),

    #[error("stream error: {0}")]
    Stream(#[from] StreamError),

    #[error("failed to parse object body as json: {0}")]
    Parse(#[source] serde_json::Error),

    #[error("failed to serialize object body as json: {0}")]
    Serialize(#[source] serde_json::Error),

    #[error("upload to {location} failed: {source}")]
    Upload {
        location: String,
        upload_id: Option<String>,
        #[source]
        source: Box<Error>,
    },

    #[error("upload exceeds the maximum of {0} parts")]
    TooManyParts(i32),

    #[error("invalid upload options: {0}")]
    InvalidOptions(String),

    #[error("invalid s3 configuration: {0}")]
    InvalidConfig(&'static str),

    #[error("invalid endpoint: {0}")]
    Endpoint(#[from] http::Error),
}

impl Error {
    /// Returns true when the object (or the upload it belongs to) does not exist.
    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }
}

/// Failures talking to the backing object store.
#[derive(thiserror::Error, Debug)]
pub enum TransportError {
    #[error("aws sdk get object error")]
    AWSSDKGetObjectError(#[from] SdkError<GetObjectError>),
    #[error("aws sdk put object error")]
    AWSSDKPutObjectError(#[from] SdkError<PutObjectError>),
    #[error("aws sdk create multipart upload error")]
    AWSSDKCreateMultipartUploadError(#[from] SdkError<CreateMultipartUploadError>),
    #[error("aws sdk upload part error")]
    AWSSDKUploadPartError(#[from] SdkError<UploadPartError>),
    #[error("aws sdk complete multipart upload error")]
    AWSSDKCompleteMultipartUploadError(#[from] SdkError<CompleteMultipartUploadError>),
    #[error("aws sdk abort multipart upload error")]
    AWSSDKAbortMultipartUploadError(#[from] SdkError<AbortMultipartUploadError>),

    #[error("failed to initiate chunked upload: {0}")]
    FailedToInitiateChunkedUpload(&'static str),

    #[error("backend error: {0}")]
    Backend(String),
}

/// Failures reading or decoding an object body mid-transfer.
#[derive(thiserror::Error, Debug)]
pub enum StreamError {
    #[error("error reading object body: {0}")]
    Read(#[source] BoxError),

    #[error("error decoding object body: {0}")]
    Decode(#[source] std::io::Error),

    #[error("object body ended after {received} of {expected} bytes")]
    Truncated { expected: u64, received: u64 },
}
