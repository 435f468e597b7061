//! Helpers for reading and writing objects in S3 compatible stores.
//!
//! Objects can be fetched as raw buffers, parsed JSON or live byte streams, written with a single
//! put, or streamed into a multipart upload. Every helper takes an explicitly constructed
//! [`ObjectStore`] handle, usually [`S3`] built from an [`S3Config`]:
//!
//! ```no_run
//! # async fn example() -> s3_helpers::Result<()> {
//! use s3_helpers::{get_json, Encoding, ObjectRef, S3Config};
//!
//! let store = S3Config::default().new_objects().await?;
//! let reference = ObjectRef::new("my-bucket", "config.json");
//! let value: serde_json::Value = get_json(&store, &reference, Encoding::Identity).await?;
//! # Ok(())
//! # }
//! ```
use async_trait::async_trait;
use bytes::Bytes;
use futures::stream::BoxStream;

mod config;
pub use config::S3Config;
mod errors;
pub use errors::{BoxError, Error, Result, StreamError, TransportError};
mod helpers;
pub use helpers::{
    get_bytes, get_json, get_object, get_object_stream, put_json, put_object, GetOptions, PutBody,
};
pub mod memory;
pub use memory::MemoryStore;
pub(crate) mod s3;
pub use s3::S3;
pub mod stream;
pub use stream::{collect, collect_and_parse, CollectOptions, Encoding, ObjectData};
pub mod upload;
pub use upload::{upload_stream, UploadOptions, UploadOutput, UploadProgress};

/// Region used when an [`ObjectRef`] doesn't name one.
pub const DEFAULT_REGION: &str = "eu-central-1";

/// Identifies a single object: the bucket it lives in, its key, and the region of the bucket.
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub struct ObjectRef {
    bucket: String,
    key: String,
    region: String,
}

impl ObjectRef {
    /// Reference `key` in `bucket`, located in [`DEFAULT_REGION`].
    pub fn new(bucket: impl Into<String>, key: impl Into<String>) -> Self {
        Self {
            bucket: bucket.into(),
            key: key.into(),
            region: DEFAULT_REGION.to_string(),
        }
    }

    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub fn bucket(&self) -> &str {
        &self.bucket
    }

    pub fn key(&self) -> &str {
        &self.key
    }

    pub fn region(&self) -> &str {
        &self.region
    }

    /// `bucket/key`, the location reported for finished uploads.
    pub fn location(&self) -> String {
        format!("{}/{}", self.bucket, self.key)
    }
}

impl std::fmt::Display for ObjectRef {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        write!(f, "{}/{}", self.bucket, self.key)
    }
}

/// An acknowledged part of a multipart upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Chunk {
    pub e_tag: Option<String>,
    pub chunk_number: i32,
}

/// Live, single-consumption object body.
pub type ObjectBody = BoxStream<'static, std::result::Result<Bytes, BoxError>>;

/// Result of [`ObjectStore::get`].
pub struct Object {
    pub body: ObjectBody,
    /// Length of the body as reported by the store, if known.
    pub content_length: Option<u64>,
}

impl std::fmt::Debug for Object {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("Object")
            .field("content_length", &self.content_length)
            .finish_non_exhaustive()
    }
}

/// Provides a common interface for interacting with different kinds of backend object stores.
///
/// Retrieval returns a [`futures::stream::Stream`] over [`bytes::Bytes`]; writes take whole
/// [`bytes::Bytes`] buffers, either as a single object or as one part of a chunked upload.
/// Retries and timeouts are the backend's business, implementations here should not add their
/// own.
#[async_trait]
pub trait ObjectStore: Clone + Send + Sync + 'static {
    async fn get(&self, reference: &ObjectRef) -> Result<Object>;

    async fn put(
        &self,
        reference: &ObjectRef,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<()>;

    async fn initiate_chunked_upload(&self, reference: &ObjectRef) -> Result<String>;

    async fn upload_chunk(
        &self,
        upload_id: &str,
        reference: &ObjectRef,
        chunk_number: i32,
        body: Bytes,
    ) -> Result<Chunk>;

    /// Completes the upload from `chunks`, which must be sorted by ascending chunk number.
    /// Returns the e-tag of the resulting object when the backend reports one.
    async fn finalize_chunked_upload(
        &self,
        upload_id: &str,
        reference: &ObjectRef,
        chunks: Vec<Chunk>,
    ) -> Result<Option<String>>;

    /// Releases every part uploaded so far for the session.
    async fn abort_chunked_upload(&self, upload_id: &str, reference: &ObjectRef) -> Result<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn object_ref_defaults_to_eu_central_1() {
        let reference = ObjectRef::new("b", "missing.json");
        assert_eq!(reference.region(), "eu-central-1");
        assert_eq!(reference.location(), "b/missing.json");

        let reference = reference.with_region("us-east-1");
        assert_eq!(reference.region(), "us-east-1");
        assert_eq!(format!("{reference}"), "b/missing.json");
    }
}
