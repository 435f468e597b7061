//! In-process [`ObjectStore`].
//!
//! Useful as a stand-in for S3 in tests. Besides storing objects it keeps enough bookkeeping about
//! multipart sessions to check that nothing is left behind after a failed upload.
use std::collections::{BTreeMap, HashMap};
use std::sync::{Arc, Mutex, MutexGuard};

use async_trait::async_trait;
use bytes::{Bytes, BytesMut};
use futures::stream::{self, StreamExt};
use uuid::Uuid;

use super::errors::{BoxError, Error, Result, TransportError};
use super::{Chunk, Object, ObjectRef, ObjectStore};

const DEFAULT_READ_CHUNK_SIZE: usize = 64 * 1024;

#[derive(Clone, Debug)]
struct StoredObject {
    body: Bytes,
    content_type: Option<String>,
}

struct PendingUpload {
    location: String,
    parts: BTreeMap<i32, (String, Bytes)>,
}

#[derive(Default)]
struct Inner {
    objects: HashMap<String, StoredObject>,
    uploads: HashMap<String, PendingUpload>,
    aborted: Vec<String>,
    fail_part: Option<i32>,
    fail_finalize: bool,
    in_flight: usize,
    max_in_flight: usize,
}

/// [`ObjectStore`] that keeps everything in memory. Clones share the same contents.
///
/// Regions are ignored; objects are addressed by `bucket/key` only.
#[derive(Clone)]
pub struct MemoryStore {
    inner: Arc<Mutex<Inner>>,
    read_chunk_size: usize,
}

impl Default for MemoryStore {
    fn default() -> Self {
        Self::new()
    }
}

impl MemoryStore {
    pub fn new() -> Self {
        Self {
            inner: Arc::new(Mutex::new(Inner::default())),
            read_chunk_size: DEFAULT_READ_CHUNK_SIZE,
        }
    }

    /// Size of the chunks object bodies are streamed back in.
    pub fn with_read_chunk_size(mut self, read_chunk_size: usize) -> Self {
        self.read_chunk_size = read_chunk_size.max(1);
        self
    }

    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner
            .lock()
            .expect("memory store mutex should never be poisoned")
    }

    /// Make every upload of part `chunk_number` fail with a transport error.
    pub fn fail_part(&self, chunk_number: i32) {
        self.lock().fail_part = Some(chunk_number);
    }

    /// Make every finalize fail with a transport error. The session stays open.
    pub fn fail_finalize(&self) {
        self.lock().fail_finalize = true;
    }

    /// Raw contents of an object, if it exists.
    pub fn object(&self, reference: &ObjectRef) -> Option<Bytes> {
        self.lock()
            .objects
            .get(&reference.location())
            .map(|o| o.body.clone())
    }

    pub fn content_type(&self, reference: &ObjectRef) -> Option<String> {
        self.lock()
            .objects
            .get(&reference.location())
            .and_then(|o| o.content_type.clone())
    }

    /// Number of multipart sessions that are neither finalized nor aborted.
    pub fn pending_uploads(&self) -> usize {
        self.lock().uploads.len()
    }

    /// Upload ids of every aborted session, in the order they were aborted.
    pub fn aborted_uploads(&self) -> Vec<String> {
        self.lock().aborted.clone()
    }

    /// Highest number of part uploads that were running at the same time.
    pub fn max_parts_in_flight(&self) -> usize {
        self.lock().max_in_flight
    }

    fn no_such_upload(upload_id: &str) -> Error {
        TransportError::Backend(format!("no such upload: {upload_id}")).into()
    }
}

#[async_trait]
impl ObjectStore for MemoryStore {
    async fn get(&self, reference: &ObjectRef) -> Result<Object> {
        let body = match self.lock().objects.get(&reference.location()) {
            Some(object) => object.body.clone(),
            None => return Err(Error::NotFound(reference.location())),
        };

        let content_length = Some(body.len() as u64);
        let chunks: Vec<std::result::Result<Bytes, BoxError>> = (0..body.len())
            .step_by(self.read_chunk_size)
            .map(|start| {
                let end = (start + self.read_chunk_size).min(body.len());
                Ok(body.slice(start..end))
            })
            .collect();
        Ok(Object {
            body: stream::iter(chunks).boxed(),
            content_length,
        })
    }

    async fn put(
        &self,
        reference: &ObjectRef,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<()> {
        let object = StoredObject {
            body,
            content_type: content_type.map(String::from),
        };
        self.lock().objects.insert(reference.location(), object);
        Ok(())
    }

    async fn initiate_chunked_upload(&self, reference: &ObjectRef) -> Result<String> {
        let upload_id = Uuid::new_v4().to_string();
        self.lock().uploads.insert(
            upload_id.clone(),
            PendingUpload {
                location: reference.location(),
                parts: BTreeMap::new(),
            },
        );
        Ok(upload_id)
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        _reference: &ObjectRef,
        chunk_number: i32,
        body: Bytes,
    ) -> Result<Chunk> {
        {
            let mut inner = self.lock();
            inner.in_flight += 1;
            inner.max_in_flight = inner.max_in_flight.max(inner.in_flight);
        }

        // give other part uploads a chance to start before this one lands
        tokio::task::yield_now().await;

        let mut inner = self.lock();
        inner.in_flight -= 1;
        if inner.fail_part == Some(chunk_number) {
            return Err(TransportError::Backend(format!(
                "injected failure for part {chunk_number}"
            ))
            .into());
        }
        let upload = inner
            .uploads
            .get_mut(upload_id)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;
        let e_tag = Uuid::new_v4().simple().to_string();
        upload.parts.insert(chunk_number, (e_tag.clone(), body));

        Ok(Chunk {
            e_tag: Some(e_tag),
            chunk_number,
        })
    }

    async fn finalize_chunked_upload(
        &self,
        upload_id: &str,
        reference: &ObjectRef,
        chunks: Vec<Chunk>,
    ) -> Result<Option<String>> {
        let mut inner = self.lock();
        if inner.fail_finalize {
            return Err(TransportError::Backend(format!(
                "injected failure finalizing {upload_id}"
            ))
            .into());
        }
        let upload = inner
            .uploads
            .get(upload_id)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;
        if upload.location != reference.location() {
            return Err(TransportError::Backend(format!(
                "upload {upload_id} belongs to {}",
                upload.location
            ))
            .into());
        }

        let mut body = BytesMut::new();
        let mut previous = 0;
        for chunk in chunks {
            if chunk.chunk_number <= previous {
                return Err(TransportError::Backend(String::from(
                    "parts must be listed in ascending order",
                ))
                .into());
            }
            previous = chunk.chunk_number;
            match upload.parts.get(&chunk.chunk_number) {
                Some((e_tag, part)) if chunk.e_tag.as_ref() == Some(e_tag) => {
                    body.extend_from_slice(part)
                }
                _ => {
                    return Err(TransportError::Backend(format!(
                        "invalid part {}",
                        chunk.chunk_number
                    ))
                    .into())
                }
            }
        }

        let location = upload.location.clone();
        inner.uploads.remove(upload_id);
        inner.objects.insert(
            location,
            StoredObject {
                body: body.freeze(),
                content_type: None,
            },
        );
        let e_tag = Uuid::new_v4().simple().to_string();
        Ok(Some(e_tag))
    }

    async fn abort_chunked_upload(&self, upload_id: &str, _reference: &ObjectRef) -> Result<()> {
        let mut inner = self.lock();
        inner
            .uploads
            .remove(upload_id)
            .ok_or_else(|| Self::no_such_upload(upload_id))?;
        inner.aborted.push(upload_id.to_string());
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use futures::TryStreamExt;

    use super::*;

    #[tokio::test]
    async fn get_streams_in_chunks() {
        let store = MemoryStore::new().with_read_chunk_size(3);
        let reference = ObjectRef::new("b", "k");
        store
            .put(&reference, Bytes::from_static(b"abcdefgh"), None)
            .await
            .expect("put should succeed");

        let object = store.get(&reference).await.expect("get should succeed");
        assert_eq!(object.content_length, Some(8));
        let chunks: Vec<Bytes> = object.body.try_collect().await.expect("body should stream");
        assert_eq!(chunks, vec!["abc", "def", "gh"]);
    }

    #[tokio::test]
    async fn missing_object() {
        let store = MemoryStore::new();
        let err = store
            .get(&ObjectRef::new("b", "missing.json"))
            .await
            .expect_err("get should fail");
        assert!(err.is_not_found());
    }

    #[tokio::test]
    async fn finalize_rejects_unsorted_parts() {
        let store = MemoryStore::new();
        let reference = ObjectRef::new("b", "k");
        let upload_id = store
            .initiate_chunked_upload(&reference)
            .await
            .expect("initiate should succeed");
        let one = store
            .upload_chunk(&upload_id, &reference, 1, Bytes::from_static(b"a"))
            .await
            .expect("upload should succeed");
        let two = store
            .upload_chunk(&upload_id, &reference, 2, Bytes::from_static(b"b"))
            .await
            .expect("upload should succeed");

        let result = store
            .finalize_chunked_upload(&upload_id, &reference, vec![two, one])
            .await;
        assert!(matches!(result, Err(Error::Transport(_))));
    }

    #[tokio::test]
    async fn failed_finalize_keeps_the_session_open() {
        let store = MemoryStore::new();
        store.fail_finalize();
        let reference = ObjectRef::new("b", "k");
        let upload_id = store
            .initiate_chunked_upload(&reference)
            .await
            .expect("initiate should succeed");
        let one = store
            .upload_chunk(&upload_id, &reference, 1, Bytes::from_static(b"a"))
            .await
            .expect("upload should succeed");

        let result = store
            .finalize_chunked_upload(&upload_id, &reference, vec![one])
            .await;
        assert!(matches!(result, Err(Error::Transport(_))));
        assert_eq!(store.pending_uploads(), 1);
        assert!(store.object(&reference).is_none());
    }

    #[tokio::test]
    async fn abort_releases_parts() {
        let store = MemoryStore::new();
        let reference = ObjectRef::new("b", "k");
        let upload_id = store
            .initiate_chunked_upload(&reference)
            .await
            .expect("initiate should succeed");
        store
            .upload_chunk(&upload_id, &reference, 1, Bytes::from_static(b"a"))
            .await
            .expect("upload should succeed");
        store
            .abort_chunked_upload(&upload_id, &reference)
            .await
            .expect("abort should succeed");

        assert_eq!(store.pending_uploads(), 0);
        assert!(store.object(&reference).is_none());
        let late = store
            .upload_chunk(&upload_id, &reference, 2, Bytes::from_static(b"b"))
            .await;
        assert!(late.is_err());
    }
}
