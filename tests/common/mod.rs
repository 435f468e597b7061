#![allow(dead_code)]

use std::sync::Once;

use bytes::Bytes;
use futures::stream::{self, Stream};

use s3_helpers::BoxError;

static TRACING: Once = Once::new();

pub fn init_tracing() {
    TRACING.call_once(|| {
        let _ = tracing_subscriber::fmt()
            .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
            .with_target(true)
            .with_test_writer()
            .compact()
            .try_init();
    });
}

/// Deterministic payload of `len` bytes.
pub fn payload(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 251) as u8).collect()
}

/// Streams `data` back in chunks of `chunk_size` bytes.
pub fn source(
    data: &[u8],
    chunk_size: usize,
) -> impl Stream<Item = Result<Bytes, BoxError>> + Send + 'static {
    let chunks: Vec<Result<Bytes, BoxError>> = data
        .chunks(chunk_size)
        .map(|c| Ok(Bytes::copy_from_slice(c)))
        .collect();
    stream::iter(chunks)
}
