//! Turning object bodies into buffers.
//!
//! A body is optionally length checked against what the store reported, optionally run through a
//! gzip decoder, and finally appended chunk by chunk into an [`Accumulator`]. Chunks are kept in
//! the order the source emitted them; a failure at any stage throws away what was accumulated.
use core::pin::Pin;
use core::task::{Context, Poll};
use std::io;

use async_compression::tokio::bufread::GzipDecoder;
use bytes::{Bytes, BytesMut};
use futures::stream::{Stream, StreamExt, TryStreamExt};
use pin_project::pin_project;
use serde::Deserialize;
use tokio_util::io::{ReaderStream, StreamReader};

use crate::errors::{BoxError, Error, Result, StreamError};
use crate::ObjectBody;

/// Content encoding of a stored object body.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Encoding {
    /// Bytes are used as stored.
    #[default]
    Identity,
    /// Bytes are gzip compressed and get decompressed while streaming.
    Gzip,
}

/// Options for [`collect_and_parse`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct CollectOptions {
    /// Defaults to [`Encoding::Identity`].
    pub encoding: Encoding,
    /// Parse the collected buffer as JSON. Defaults to `false`.
    pub parse: bool,
}

impl Default for CollectOptions {
    fn default() -> Self {
        Self {
            encoding: Encoding::Identity,
            parse: false,
        }
    }
}

/// A collected object body, either as-is or parsed as JSON.
#[derive(Clone, Debug, PartialEq)]
pub enum ObjectData {
    Bytes(Bytes),
    Json(serde_json::Value),
}

impl ObjectData {
    pub fn as_bytes(&self) -> Option<&Bytes> {
        match self {
            ObjectData::Bytes(b) => Some(b),
            ObjectData::Json(_) => None,
        }
    }

    pub fn as_json(&self) -> Option<&serde_json::Value> {
        match self {
            ObjectData::Bytes(_) => None,
            ObjectData::Json(v) => Some(v),
        }
    }
}

/// Growable buffer that chunks of a transfer are appended to.
#[derive(Debug, Default)]
pub struct Accumulator {
    buffer: BytesMut,
}

impl Accumulator {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_capacity(capacity: usize) -> Self {
        Self {
            buffer: BytesMut::with_capacity(capacity),
        }
    }

    pub fn append(&mut self, chunk: &[u8]) {
        self.buffer.extend_from_slice(chunk);
    }

    pub fn len(&self) -> usize {
        self.buffer.len()
    }

    pub fn is_empty(&self) -> bool {
        self.buffer.is_empty()
    }

    /// Hands the accumulated bytes over as a single contiguous buffer.
    pub fn finalize(self) -> Bytes {
        self.buffer.freeze()
    }
}

/// Wrapper around an object body that fails with [`StreamError::Truncated`] when the body ends
/// before the number of bytes the store announced.
#[pin_project]
pub struct LengthCheckedBody<S> {
    #[pin]
    body: S,
    expected: Option<u64>,
    received: u64,
}

impl<S> LengthCheckedBody<S> {
    pub fn new(body: S, expected: Option<u64>) -> Self {
        Self {
            body,
            expected,
            received: 0,
        }
    }
}

impl<S> Stream for LengthCheckedBody<S>
where
    S: Stream<Item = std::result::Result<Bytes, BoxError>>,
{
    type Item = std::result::Result<Bytes, BoxError>;

    fn poll_next(self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Option<Self::Item>> {
        let this = self.project();
        match this.body.poll_next(cx) {
            Poll::Ready(Some(Ok(bytes))) => {
                *this.received += bytes.len() as u64;
                Poll::Ready(Some(Ok(bytes)))
            }
            Poll::Ready(Some(Err(e))) => Poll::Ready(Some(Err(e))),
            Poll::Ready(None) => match this.expected.take() {
                Some(expected) if *this.received < expected => {
                    Poll::Ready(Some(Err(Box::new(StreamError::Truncated {
                        expected,
                        received: *this.received,
                    }))))
                }
                _ => Poll::Ready(None),
            },
            Poll::Pending => Poll::Pending,
        }
    }
}

/// Maps an error yielded by a body stream onto [`StreamError`].
pub(crate) fn classify(e: BoxError) -> StreamError {
    let e = match e.downcast::<StreamError>() {
        Ok(e) => return *e,
        Err(e) => e,
    };
    match e.downcast::<io::Error>() {
        Ok(e) => classify_io(*e),
        Err(e) => StreamError::Read(e),
    }
}

fn classify_io(e: io::Error) -> StreamError {
    if !e
        .get_ref()
        .map_or(false, |inner| inner.is::<StreamError>())
    {
        return StreamError::Decode(e);
    }
    match e.into_inner().map(|inner| inner.downcast::<StreamError>()) {
        Some(Ok(inner)) => *inner,
        Some(Err(other)) => StreamError::Read(other),
        None => StreamError::Read("body failed without an error source".into()),
    }
}

/// Decodes `body` according to `encoding`.
///
/// Gzip bodies go through a streaming decoder, so decoded chunks become available as soon as
/// enough compressed input has arrived. Concatenated gzip members are decoded back to back. Errors
/// in the returned stream are always boxed [`StreamError`]s.
pub fn decode(body: ObjectBody, encoding: Encoding) -> ObjectBody {
    match encoding {
        Encoding::Identity => body.map_err(|e| Box::new(classify(e)) as BoxError).boxed(),
        Encoding::Gzip => {
            let reader = StreamReader::new(
                body.map_err(|e| io::Error::new(io::ErrorKind::Other, classify(e))),
            );
            let mut decoder = GzipDecoder::new(reader);
            decoder.multiple_members(true);
            ReaderStream::new(decoder)
                .map_err(|e| Box::new(classify_io(e)) as BoxError)
                .boxed()
        }
    }
}

/// Collects `body` into a single buffer, decoding it first according to `encoding`.
pub async fn collect<S, E>(body: S, encoding: Encoding) -> Result<Bytes>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    let (lower, _) = body.size_hint();
    let mut decoded = decode(body.map_err(Into::<BoxError>::into).boxed(), encoding);
    let mut accumulator = Accumulator::with_capacity(lower);
    while let Some(chunk) = decoded.next().await {
        let chunk = chunk.map_err(classify)?;
        accumulator.append(&chunk);
    }
    tracing::trace!(bytes = accumulator.len(), ?encoding, "collected object body");
    Ok(accumulator.finalize())
}

/// Collects `body` and, when `options.parse` is set, parses the result as JSON.
pub async fn collect_and_parse<S, E>(body: S, options: CollectOptions) -> Result<ObjectData>
where
    S: Stream<Item = std::result::Result<Bytes, E>> + Send + 'static,
    E: Into<BoxError> + 'static,
{
    let bytes = collect(body, options.encoding).await?;
    if !options.parse {
        return Ok(ObjectData::Bytes(bytes));
    }
    let value = serde_json::from_slice(&bytes).map_err(Error::Parse)?;
    Ok(ObjectData::Json(value))
}
