//! Streaming uploads of unbounded sources.
//!
//! The source is re-chunked into fixed size parts which are uploaded through a multipart session
//! with several parts in flight at once. Sources that fit in a single part skip the session and
//! are written with one put.
use core::pin::Pin;
use core::task::{Context, Poll};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use bytes::{Bytes, BytesMut};
use futures::ready;
use futures::stream::{self, Stream, StreamExt, TryStreamExt};
use pin_project::pin_project;

use crate::errors::{BoxError, Error, Result};
use crate::stream::classify;
use crate::{Chunk, ObjectRef, ObjectStore};

/// Smallest part size S3 accepts for any part but the last.
pub const MIN_PART_SIZE: usize = 5 * 1024 * 1024; // 5 MiB
pub const DEFAULT_PART_SIZE: usize = MIN_PART_SIZE;
pub const DEFAULT_CONCURRENCY: usize = 4;
pub const MAX_PARTS: i32 = 10_000;

pub type ProgressFn = Arc<dyn Fn(UploadProgress) + Send + Sync>;

/// Reported after each acknowledged part.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadProgress {
    pub location: String,
    pub part: i32,
    /// Cumulative bytes acknowledged so far.
    pub loaded: u64,
}

/// Options for [`upload_stream`].
///
/// * `part_size`: bytes per part, at least [`MIN_PART_SIZE`], defaults to [`DEFAULT_PART_SIZE`]
/// * `concurrency`: parts in flight at once, at least 1, defaults to [`DEFAULT_CONCURRENCY`]
/// * `progress`: called after each acknowledged part, defaults to `None`
#[derive(Clone)]
pub struct UploadOptions {
    pub part_size: usize,
    pub concurrency: usize,
    pub progress: Option<ProgressFn>,
}

impl Default for UploadOptions {
    fn default() -> Self {
        Self {
            part_size: DEFAULT_PART_SIZE,
            concurrency: DEFAULT_CONCURRENCY,
            progress: None,
        }
    }
}

impl std::fmt::Debug for UploadOptions {
    fn fmt(&self, f: &mut std::fmt::Formatter) -> std::fmt::Result {
        f.debug_struct("UploadOptions")
            .field("part_size", &self.part_size)
            .field("concurrency", &self.concurrency)
            .field("progress", &self.progress.is_some())
            .finish()
    }
}

impl UploadOptions {
    pub fn with_progress<F>(mut self, progress: F) -> Self
    where
        F: Fn(UploadProgress) + Send + Sync + 'static,
    {
        self.progress = Some(Arc::new(progress));
        self
    }

    fn validate(&self) -> Result<()> {
        if self.part_size < MIN_PART_SIZE {
            return Err(Error::InvalidOptions(format!(
                "part_size must be at least {MIN_PART_SIZE} bytes, got {}",
                self.part_size
            )));
        }
        if self.concurrency == 0 {
            return Err(Error::InvalidOptions(String::from(
                "concurrency must be at least 1",
            )));
        }
        Ok(())
    }

    fn report(&self, reference: &ObjectRef, part: i32, loaded: u64) {
        if let Some(progress) = &self.progress {
            progress(UploadProgress {
                location: reference.location(),
                part,
                loaded,
            });
        }
    }
}

/// Result of a finished upload.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct UploadOutput {
    /// `bucket/key` of the written object.
    pub location: String,
    pub e_tag: Option<String>,
    /// `None` when the source fit in a single put.
    pub upload_id: Option<String>,
    pub parts: usize,
    pub bytes: u64,
}

/// Turn a stream of arbitrarily sized [`bytes::Bytes`] into a stream of fixed-size parts.
///
/// Every part is exactly `chunk_size` bytes except the last, which holds whatever remains. Empty
/// parts are never emitted.
#[pin_project]
pub struct ChunkedBody<S> {
    #[pin]
    body: S,
    buffer: BytesMut,
    chunk_size: usize,
    done: bool,
}

impl<S> ChunkedBody<S> {
    pub fn new(body: S, chunk_size: usize) -> ChunkedBody<S> {
        ChunkedBody {
            body,
            buffer: BytesMut::with_capacity(chunk_size),
            chunk_size,
            done: false,
        }
    }
}

impl<S> Stream for ChunkedBody<S>
where
    S: Stream<Item = std::result::Result<Bytes, BoxError>>,
{
    type Item = std::result::Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let mut this = self.project();
        loop {
            if this.buffer.len() >= *this.chunk_size {
                let buf = this.buffer.split_to(*this.chunk_size);
                return Poll::Ready(Some(Ok(buf.freeze())));
            }
            if *this.done {
                if this.buffer.is_empty() {
                    return Poll::Ready(None);
                }
                let buf = this.buffer.split();
                return Poll::Ready(Some(Ok(buf.freeze())));
            }
            match ready!(this.body.as_mut().poll_next(cx)) {
                Some(Ok(bytes)) => this.buffer.extend_from_slice(&bytes),
                Some(Err(e)) => return Poll::Ready(Some(Err(e))),
                None => *this.done = true,
            }
        }
    }
}

/// Lifecycle of a multipart session.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub(crate) enum SessionState {
    Created,
    InProgress { parts_in_flight: usize },
    Completed,
    Aborted,
}

impl SessionState {
    fn is_open(&self) -> bool {
        matches!(self, SessionState::Created | SessionState::InProgress { .. })
    }
}

struct UploadSession<S: ObjectStore> {
    store: S,
    reference: ObjectRef,
    upload_id: String,
    state: SessionState,
    chunks: Vec<Chunk>,
    loaded: u64,
}

impl<S: ObjectStore> UploadSession<S> {
    fn new(store: S, reference: ObjectRef, upload_id: String) -> Self {
        Self {
            store,
            reference,
            upload_id,
            state: SessionState::Created,
            chunks: Vec::new(),
            loaded: 0,
        }
    }

    /// Uploads every part of `parts` and finalizes the session. On error the session is left
    /// open, the caller is expected to [`UploadSession::abort`] it.
    async fn drive<P>(&mut self, parts: P, options: &UploadOptions) -> Result<UploadOutput>
    where
        P: Stream<Item = std::result::Result<Bytes, BoxError>>,
    {
        let store = self.store.clone();
        let reference = self.reference.clone();
        let upload_id = self.upload_id.clone();
        let (store, reference, upload_id) = (&store, &reference, upload_id.as_str());
        let dispatched = AtomicUsize::new(0);
        let dispatched = &dispatched;

        self.state = SessionState::InProgress { parts_in_flight: 0 };
        let uploads = parts
            .enumerate()
            .map(move |(index, part)| {
                dispatched.fetch_add(1, Ordering::Relaxed);
                async move {
                    let body = part.map_err(|e| Error::Stream(classify(e)))?;
                    let chunk_number = i32::try_from(index + 1).unwrap_or(i32::MAX);
                    if chunk_number > MAX_PARTS {
                        return Err(Error::TooManyParts(MAX_PARTS));
                    }
                    let len = body.len() as u64;
                    tracing::trace!(%reference, upload_id, chunk_number, len, "uploading part");
                    let chunk = store
                        .upload_chunk(upload_id, reference, chunk_number, body)
                        .await?;
                    Ok::<_, Error>((chunk, len))
                }
            })
            .buffer_unordered(options.concurrency);
        tokio::pin!(uploads);

        let mut acknowledged = 0;
        while let Some(result) = uploads.next().await {
            let (chunk, len) = result?;
            acknowledged += 1;
            self.loaded += len;
            self.state = SessionState::InProgress {
                parts_in_flight: dispatched
                    .load(Ordering::Relaxed)
                    .saturating_sub(acknowledged),
            };
            options.report(reference, chunk.chunk_number, self.loaded);
            self.chunks.push(chunk);
        }

        self.chunks.sort_by_key(|chunk| chunk.chunk_number);
        let parts = self.chunks.len();
        let e_tag = store
            .finalize_chunked_upload(upload_id, reference, std::mem::take(&mut self.chunks))
            .await?;
        self.state = SessionState::Completed;
        tracing::debug!(
            %reference,
            upload_id,
            parts,
            bytes = self.loaded,
            "completed multipart upload"
        );

        Ok(UploadOutput {
            location: reference.location(),
            e_tag,
            upload_id: Some(upload_id.to_string()),
            parts,
            bytes: self.loaded,
        })
    }

    async fn abort(&mut self) {
        tracing::debug!(
            reference = %self.reference,
            upload_id = %self.upload_id,
            "aborting multipart upload"
        );
        if let Err(e) = self
            .store
            .abort_chunked_upload(&self.upload_id, &self.reference)
            .await
        {
            tracing::warn!(
                reference = %self.reference,
                upload_id = %self.upload_id,
                error = %e,
                "failed to abort multipart upload"
            );
        }
        self.state = SessionState::Aborted;
    }
}

impl<S: ObjectStore> Drop for UploadSession<S> {
    fn drop(&mut self) {
        if !self.state.is_open() {
            return;
        }
        let store = self.store.clone();
        let reference = self.reference.clone();
        let upload_id = std::mem::take(&mut self.upload_id);
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                tracing::debug!(
                    %reference,
                    %upload_id,
                    "upload dropped, aborting in the background"
                );
                handle.spawn(async move {
                    if let Err(e) = store.abort_chunked_upload(&upload_id, &reference).await {
                        tracing::warn!(
                            %reference,
                            %upload_id,
                            error = %e,
                            "failed to abort multipart upload"
                        );
                    }
                });
            }
            Err(_) => {
                tracing::warn!(
                    %reference,
                    %upload_id,
                    "upload dropped outside of a tokio runtime, parts were not released"
                );
            }
        }
        self.state = SessionState::Aborted;
    }
}

fn upload_error(reference: &ObjectRef, upload_id: Option<String>, source: Error) -> Error {
    Error::Upload {
        location: reference.location(),
        upload_id,
        source: Box::new(source),
    }
}

async fn next_part<S>(
    mut chunked: Pin<&mut ChunkedBody<S>>,
    reference: &ObjectRef,
) -> Result<Option<Bytes>>
where
    S: Stream<Item = std::result::Result<Bytes, BoxError>>,
{
    chunked
        .next()
        .await
        .transpose()
        .map_err(|e| upload_error(reference, None, Error::Stream(classify(e))))
}

async fn put_single<S: ObjectStore>(
    store: &S,
    reference: &ObjectRef,
    body: Bytes,
    options: &UploadOptions,
) -> Result<UploadOutput> {
    let len = body.len() as u64;
    tracing::debug!(%reference, len, "source fits in a single part, using put");
    store
        .put(reference, body, None)
        .await
        .map_err(|e| upload_error(reference, None, e))?;
    options.report(reference, 1, len);
    Ok(UploadOutput {
        location: reference.location(),
        e_tag: None,
        upload_id: None,
        parts: 1,
        bytes: len,
    })
}

/// Upload `source` to `reference` without buffering more than a few parts in memory.
///
/// Parts are dispatched with up to `options.concurrency` in flight. If the source stream fails,
/// a part fails, or finalizing fails, the session is aborted so no parts are left behind and
/// [`Error::Upload`] is returned. Dropping the returned future while a session is open aborts
/// the session in the background.
///
/// A session only becomes abortable once [`ObjectStore::initiate_chunked_upload`] has returned its
/// upload id. If the future is dropped while that call is still pending the store may open a
/// session nobody knows about; a bucket lifecycle rule for incomplete multipart uploads is the
/// only thing that reclaims it.
pub async fn upload_stream<S, B, E>(
    store: &S,
    reference: &ObjectRef,
    source: B,
    options: UploadOptions,
) -> Result<UploadOutput>
where
    S: ObjectStore,
    B: Stream<Item = std::result::Result<Bytes, E>> + Send,
    E: Into<BoxError>,
{
    options.validate()?;

    let chunked = ChunkedBody::new(source.map_err(Into::<BoxError>::into), options.part_size);
    tokio::pin!(chunked);

    let first = next_part(chunked.as_mut(), reference)
        .await?
        .unwrap_or_default();
    let second = match next_part(chunked.as_mut(), reference).await? {
        Some(second) => second,
        None => return put_single(store, reference, first, &options).await,
    };

    let upload_id = store
        .initiate_chunked_upload(reference)
        .await
        .map_err(|e| upload_error(reference, None, e))?;
    tracing::debug!(%reference, %upload_id, "initiated multipart upload");

    let mut session = UploadSession::new(store.clone(), reference.clone(), upload_id);
    let parts = stream::iter([Ok(first), Ok(second)]).chain(chunked);
    match session.drive(parts, &options).await {
        Ok(output) => Ok(output),
        Err(e) => {
            session.abort().await;
            Err(upload_error(reference, Some(session.upload_id.clone()), e))
        }
    }
}
