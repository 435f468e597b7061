use bytes::Bytes;
use futures::stream::StreamExt;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::errors::{Error, Result};
use crate::stream::{
    collect, collect_and_parse, CollectOptions, Encoding, LengthCheckedBody, ObjectData,
};
use crate::{ObjectBody, ObjectRef, ObjectStore};

const JSON_CONTENT_TYPE: &str = "application/json";

/// Options for [`get_object`].
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct GetOptions {
    /// Parse the body as JSON. Defaults to `true`.
    pub parse: bool,
    /// Defaults to [`Encoding::Identity`].
    pub encoding: Encoding,
}

impl Default for GetOptions {
    fn default() -> Self {
        Self {
            parse: true,
            encoding: Encoding::Identity,
        }
    }
}

/// Body of a [`put_object`] call.
///
/// Text and bytes are written as-is. JSON values are always serialized, strings included, so that
/// whatever goes in comes back out of [`get_json`].
#[derive(Clone, Debug, PartialEq)]
pub enum PutBody {
    Text(String),
    Bytes(Bytes),
    Json(serde_json::Value),
}

impl PutBody {
    pub fn json<T: Serialize + ?Sized>(value: &T) -> Result<PutBody> {
        Ok(PutBody::Json(
            serde_json::to_value(value).map_err(Error::Serialize)?,
        ))
    }

    fn into_parts(self) -> Result<(Bytes, Option<&'static str>)> {
        match self {
            PutBody::Text(s) => Ok((Bytes::from(s), None)),
            PutBody::Bytes(b) => Ok((b, None)),
            PutBody::Json(v) => {
                let body = serde_json::to_vec(&v).map_err(Error::Serialize)?;
                Ok((Bytes::from(body), Some(JSON_CONTENT_TYPE)))
            }
        }
    }
}

impl From<String> for PutBody {
    fn from(s: String) -> PutBody {
        PutBody::Text(s)
    }
}

impl From<&str> for PutBody {
    fn from(s: &str) -> PutBody {
        PutBody::Text(s.to_string())
    }
}

impl From<Bytes> for PutBody {
    fn from(b: Bytes) -> PutBody {
        PutBody::Bytes(b)
    }
}

impl From<Vec<u8>> for PutBody {
    fn from(b: Vec<u8>) -> PutBody {
        PutBody::Bytes(Bytes::from(b))
    }
}

impl From<serde_json::Value> for PutBody {
    fn from(v: serde_json::Value) -> PutBody {
        PutBody::Json(v)
    }
}

async fn fetch_checked<S: ObjectStore>(store: &S, reference: &ObjectRef) -> Result<ObjectBody> {
    let object = store.get(reference).await?;
    tracing::debug!(%reference, content_length = ?object.content_length, "fetched object");
    Ok(LengthCheckedBody::new(object.body, object.content_length).boxed())
}

/// Fetch an object and collect it, parsing it as JSON unless `options.parse` is unset.
pub async fn get_object<S: ObjectStore>(
    store: &S,
    reference: &ObjectRef,
    options: &GetOptions,
) -> Result<ObjectData> {
    let body = fetch_checked(store, reference).await?;
    collect_and_parse(
        body,
        CollectOptions {
            encoding: options.encoding,
            parse: options.parse,
        },
    )
    .await
}

/// Fetch an object and deserialize it from JSON.
pub async fn get_json<S, T>(store: &S, reference: &ObjectRef, encoding: Encoding) -> Result<T>
where
    S: ObjectStore,
    T: DeserializeOwned,
{
    let bytes = get_bytes(store, reference, encoding).await?;
    serde_json::from_slice(&bytes).map_err(Error::Parse)
}

/// Fetch an object into a single buffer.
pub async fn get_bytes<S: ObjectStore>(
    store: &S,
    reference: &ObjectRef,
    encoding: Encoding,
) -> Result<Bytes> {
    let body = fetch_checked(store, reference).await?;
    collect(body, encoding).await
}

/// Fetch an object as a live byte stream. The body is passed through undecoded.
pub async fn get_object_stream<S: ObjectStore>(
    store: &S,
    reference: &ObjectRef,
) -> Result<ObjectBody> {
    Ok(store.get(reference).await?.body)
}

/// Write an object with a single put.
pub async fn put_object<S, B>(store: &S, reference: &ObjectRef, body: B) -> Result<()>
where
    S: ObjectStore,
    B: Into<PutBody>,
{
    let (body, content_type) = body.into().into_parts()?;
    tracing::debug!(%reference, len = body.len(), "putting object");
    store.put(reference, body, content_type).await
}

/// Serialize `value` as JSON and write it with a single put.
pub async fn put_json<S, T>(store: &S, reference: &ObjectRef, value: &T) -> Result<()>
where
    S: ObjectStore,
    T: Serialize + ?Sized,
{
    put_object(store, reference, PutBody::json(value)?).await
}
