use async_compression::tokio::bufread::GzipEncoder;
use bytes::Bytes;
use futures::TryStreamExt;
use rstest::*;
use serde::{Deserialize, Serialize};
use serde_json::json;
use tokio::io::AsyncReadExt;

use s3_helpers::{
    get_bytes, get_json, get_object, get_object_stream, put_json, put_object, Encoding, Error,
    GetOptions, MemoryStore, ObjectData, ObjectRef, PutBody,
};

mod common;

#[derive(Debug, PartialEq, Serialize, Deserialize)]
struct Manifest {
    name: String,
    layers: Vec<u32>,
}

#[rstest]
#[case::object(json!({"name": "portfolio", "nested": {"a": [1, 2, 3]}}))]
#[case::array(json!([1, "two", null, 4.5]))]
#[case::string(json!("just a string"))]
#[case::number(json!(42))]
#[case::null(json!(null))]
#[tokio::test]
async fn put_then_get_json_round_trips(#[case] value: serde_json::Value) {
    common::init_tracing();
    let store = MemoryStore::new().with_read_chunk_size(3);
    let reference = ObjectRef::new("b", "value.json");

    put_object(&store, &reference, value.clone())
        .await
        .expect("put should succeed");
    let fetched: serde_json::Value = get_json(&store, &reference, Encoding::Identity)
        .await
        .expect("get should succeed");

    assert_eq!(fetched, value);
    assert_eq!(
        store.content_type(&reference).as_deref(),
        Some("application/json")
    );
}

#[tokio::test]
async fn typed_json_round_trip() {
    let store = MemoryStore::new();
    let reference = ObjectRef::new("b", "manifest.json").with_region("us-east-1");
    let manifest = Manifest {
        name: String::from("meow"),
        layers: vec![1, 2, 3],
    };

    put_json(&store, &reference, &manifest)
        .await
        .expect("put should succeed");
    let fetched: Manifest = get_json(&store, &reference, Encoding::Identity)
        .await
        .expect("get should succeed");
    assert_eq!(fetched, manifest);
}

#[tokio::test]
async fn text_is_written_verbatim() {
    let store = MemoryStore::new();
    let reference = ObjectRef::new("b", "note.txt");

    put_object(&store, &reference, "hello world")
        .await
        .expect("put should succeed");
    assert_eq!(store.object(&reference), Some(Bytes::from_static(b"hello world")));
    assert_eq!(store.content_type(&reference), None);

    let data = get_object(
        &store,
        &reference,
        &GetOptions {
            parse: false,
            ..Default::default()
        },
    )
    .await
    .expect("get should succeed");
    assert_eq!(data, ObjectData::Bytes(Bytes::from_static(b"hello world")));
}

#[tokio::test]
async fn get_object_parses_by_default() {
    let store = MemoryStore::new();
    let reference = ObjectRef::new("b", "data.json");
    put_object(&store, &reference, r#"{"a": 1}"#)
        .await
        .expect("put should succeed");

    let data = get_object(&store, &reference, &GetOptions::default())
        .await
        .expect("get should succeed");
    assert_eq!(data.as_json(), Some(&json!({"a": 1})));
}

#[tokio::test]
async fn missing_object_is_not_found() {
    let store = MemoryStore::new();
    let reference = ObjectRef::new("b", "missing.json");

    let err = get_object(&store, &reference, &GetOptions::default())
        .await
        .expect_err("get should fail");
    match err {
        Error::NotFound(location) => assert_eq!(location, "b/missing.json"),
        e => panic!("expected not found, got {e:?}"),
    }

    let err = get_json::<_, serde_json::Value>(&store, &reference, Encoding::Identity)
        .await
        .expect_err("get should fail");
    assert!(err.is_not_found());

    let err = get_object_stream(&store, &reference)
        .await
        .err()
        .expect("get should fail");
    assert!(err.is_not_found());
}

#[tokio::test]
async fn invalid_json_is_a_parse_error() {
    let store = MemoryStore::new();
    let reference = ObjectRef::new("b", "broken.json");
    put_object(&store, &reference, PutBody::Bytes(Bytes::from_static(b"{\"a\":")))
        .await
        .expect("put should succeed");

    let result = get_object(&store, &reference, &GetOptions::default()).await;
    assert!(matches!(result, Err(Error::Parse(_))), "unexpected result: {result:?}");

    let result = get_json::<_, serde_json::Value>(&store, &reference, Encoding::Identity).await;
    assert!(matches!(result, Err(Error::Parse(_))), "unexpected result: {result:?}");
}

async fn gzip(data: &[u8]) -> Vec<u8> {
    let mut encoder = GzipEncoder::new(data);
    let mut out = Vec::new();
    encoder
        .read_to_end(&mut out)
        .await
        .expect("encoding in memory should not fail");
    out
}

#[tokio::test]
async fn gzip_objects_are_decoded_on_every_read_path() {
    let store = MemoryStore::new().with_read_chunk_size(5);
    let reference = ObjectRef::new("b", "data.json.gz");
    let value = json!({"layers": (0..500).collect::<Vec<u32>>()});
    let compressed = gzip(&serde_json::to_vec(&value).expect("value should serialize")).await;
    put_object(&store, &reference, compressed.clone())
        .await
        .expect("put should succeed");

    let fetched: serde_json::Value = get_json(&store, &reference, Encoding::Gzip)
        .await
        .expect("get should succeed");
    assert_eq!(fetched, value);

    let data = get_object(
        &store,
        &reference,
        &GetOptions {
            encoding: Encoding::Gzip,
            ..Default::default()
        },
    )
    .await
    .expect("get should succeed");
    assert_eq!(data, ObjectData::Json(value.clone()));

    let bytes = get_bytes(&store, &reference, Encoding::Gzip)
        .await
        .expect("get should succeed");
    assert_eq!(bytes, serde_json::to_vec(&value).expect("value should serialize"));

    let raw = get_bytes(&store, &reference, Encoding::Identity)
        .await
        .expect("get should succeed");
    assert_eq!(raw, compressed);
}

#[tokio::test]
async fn object_stream_is_raw() {
    let store = MemoryStore::new().with_read_chunk_size(4);
    let reference = ObjectRef::new("b", "stream.bin");
    let data = common::payload(1000);
    put_object(&store, &reference, data.clone())
        .await
        .expect("put should succeed");

    let body = get_object_stream(&store, &reference)
        .await
        .expect("get should succeed");
    let chunks: Vec<Bytes> = body.try_collect().await.expect("body should stream");
    assert_eq!(chunks.len(), 250);
    assert_eq!(chunks.concat(), data);
}
