use async_trait::async_trait;
use aws_credential_types::provider::SharedCredentialsProvider;
use aws_credential_types::Credentials;
use aws_sdk_s3::config::Region;
use aws_sdk_s3::error::SdkError;
use aws_sdk_s3::operation::get_object::GetObjectError;
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::{CompletedMultipartUpload, CompletedPart};
use aws_sdk_s3::Client;
use aws_types::SdkConfig;
use bytes::Bytes;
use futures::stream::{StreamExt, TryStreamExt};
use http::{StatusCode, Uri};

pub(crate) mod logging;
use self::logging::TracingInterceptor;
use super::config::S3Config;
use super::errors::{BoxError, Error, Result, TransportError};
use super::{Chunk, Object, ObjectRef, ObjectStore};

/// [`ObjectStore`] backed by `aws-sdk-s3`.
///
/// Requests go to the client for the configured region unless the [`ObjectRef`] names another
/// one, in which case a client for that region is derived from the same SDK configuration and
/// credentials.
#[derive(Clone)]
pub struct S3 {
    config: S3Config,
    sdk_config: SdkConfig,
    credentials: Option<SharedCredentialsProvider>,
    endpoint: Option<String>,
    client: Client,
}

impl S3 {
    pub(crate) async fn new(config: S3Config) -> Result<S3> {
        let credentials = match (&config.access_key, &config.secret_key) {
            (Some(access_key), Some(secret_key)) => Some(SharedCredentialsProvider::new(
                Credentials::new(
                    access_key.clone(),
                    secret_key.clone(),
                    None,
                    None,
                    "s3-helpers",
                ),
            )),
            (None, None) => None,
            _ => {
                return Err(Error::InvalidConfig(
                    "access_key and secret_key must be set together",
                ))
            }
        };

        let endpoint = match &config.hostname {
            Some(hostname) => {
                let uri = Uri::builder()
                    .scheme(if config.insecure { "http" } else { "https" })
                    .authority(hostname.as_str())
                    .path_and_query("/")
                    .build()?;
                Some(uri.to_string())
            }
            None => None,
        };

        let sdk_config = aws_config::load_from_env().await;
        let client = build_client(
            &sdk_config,
            &config,
            credentials.as_ref(),
            endpoint.as_deref(),
            &config.region,
        );

        Ok(S3 {
            config,
            sdk_config,
            credentials,
            endpoint,
            client,
        })
    }

    fn client(&self, reference: &ObjectRef) -> Client {
        if reference.region() == self.config.region {
            return self.client.clone();
        }
        tracing::debug!(region = reference.region(), "using client for non-default region");
        build_client(
            &self.sdk_config,
            &self.config,
            self.credentials.as_ref(),
            self.endpoint.as_deref(),
            reference.region(),
        )
    }
}

fn build_client(
    sdk_config: &SdkConfig,
    config: &S3Config,
    credentials: Option<&SharedCredentialsProvider>,
    endpoint: Option<&str>,
    region: &str,
) -> Client {
    let mut builder = aws_sdk_s3::config::Builder::from(sdk_config)
        .region(Region::new(region.to_string()))
        .force_path_style(config.force_path_style)
        .interceptor(TracingInterceptor::new(region));
    if let Some(credentials) = credentials {
        builder = builder.credentials_provider(credentials.clone());
    }
    if let Some(endpoint) = endpoint {
        builder = builder.endpoint_url(endpoint);
    }
    Client::from_conf(builder.build())
}

fn get_object_error(reference: &ObjectRef, e: SdkError<GetObjectError>) -> Error {
    if let SdkError::ServiceError(service_error) = &e {
        if service_error.err().is_no_such_key()
            || service_error.raw().status() == StatusCode::NOT_FOUND
        {
            return Error::NotFound(reference.location());
        }
    }
    TransportError::from(e).into()
}

#[async_trait]
impl ObjectStore for S3 {
    async fn get(&self, reference: &ObjectRef) -> Result<Object> {
        let get_object_output = self
            .client(reference)
            .get_object()
            .key(reference.key())
            .bucket(reference.bucket())
            .send()
            .await
            .map_err(|e| get_object_error(reference, e))?;

        let content_length = Option::<i64>::from(get_object_output.content_length())
            .and_then(|len| u64::try_from(len).ok());

        Ok(Object {
            body: get_object_output
                .body
                .map_err(|e| Box::new(e) as BoxError)
                .boxed(),
            content_length,
        })
    }

    async fn put(
        &self,
        reference: &ObjectRef,
        body: Bytes,
        content_type: Option<&str>,
    ) -> Result<()> {
        let mut request = self
            .client(reference)
            .put_object()
            .key(reference.key())
            .content_length(body.len() as i64)
            .body(ByteStream::from(body))
            .bucket(reference.bucket());
        if let Some(content_type) = content_type {
            request = request.content_type(content_type);
        }
        let _put_object_output = request.send().await.map_err(TransportError::from)?;
        Ok(())
    }

    async fn initiate_chunked_upload(&self, reference: &ObjectRef) -> Result<String> {
        let create_multipart_upload_output = self
            .client(reference)
            .create_multipart_upload()
            .key(reference.key())
            .bucket(reference.bucket())
            .send()
            .await
            .map_err(TransportError::from)?;

        let upload_id = create_multipart_upload_output.upload_id.ok_or(
            TransportError::FailedToInitiateChunkedUpload("missing upload id"),
        )?;

        Ok(upload_id)
    }

    async fn upload_chunk(
        &self,
        upload_id: &str,
        reference: &ObjectRef,
        chunk_number: i32,
        body: Bytes,
    ) -> Result<Chunk> {
        let upload_part_output = self
            .client(reference)
            .upload_part()
            .upload_id(upload_id)
            .part_number(chunk_number)
            .key(reference.key())
            .content_length(body.len() as i64)
            .body(ByteStream::from(body))
            .bucket(reference.bucket())
            .send()
            .await
            .map_err(TransportError::from)?;

        Ok(Chunk {
            e_tag: upload_part_output.e_tag,
            chunk_number,
        })
    }

    async fn finalize_chunked_upload(
        &self,
        upload_id: &str,
        reference: &ObjectRef,
        chunks: Vec<Chunk>,
    ) -> Result<Option<String>> {
        let mut mpu = CompletedMultipartUpload::builder();
        for chunk in chunks {
            let mut pb = CompletedPart::builder();
            if let Some(e_tag) = &chunk.e_tag {
                pb = pb.e_tag(e_tag);
            }
            mpu = mpu.parts(pb.part_number(chunk.chunk_number).build());
        }
        let complete_multipart_upload_output = self
            .client(reference)
            .complete_multipart_upload()
            .multipart_upload(mpu.build())
            .upload_id(upload_id)
            .key(reference.key())
            .bucket(reference.bucket())
            .send()
            .await
            .map_err(TransportError::from)?;

        Ok(complete_multipart_upload_output.e_tag)
    }

    async fn abort_chunked_upload(&self, upload_id: &str, reference: &ObjectRef) -> Result<()> {
        let _abort_multipart_upload_output = self
            .client(reference)
            .abort_multipart_upload()
            .upload_id(upload_id)
            .key(reference.key())
            .bucket(reference.bucket())
            .send()
            .await
            .map_err(TransportError::from)?;
        // parts still in flight when the abort lands can reappear; callers stop dispatching
        // parts before aborting so a single abort is enough here.
        Ok(())
    }
}

#[cfg(test)]
mod test {
    use aws_smithy_types::error::ErrorMetadata;
    use aws_sdk_s3::types::error::NoSuchKey;
    use rstest::*;

    use super::*;

    fn service_error(status: u16, err: GetObjectError) -> SdkError<GetObjectError> {
        let raw = http::Response::builder()
            .status(status)
            .body(ByteStream::from_static(b"").into_inner())
            .expect("response should build");
        SdkError::service_error(err, raw)
    }

    fn no_such_key() -> GetObjectError {
        GetObjectError::NoSuchKey(NoSuchKey::builder().message("missing").build())
    }

    fn access_denied() -> GetObjectError {
        GetObjectError::generic(ErrorMetadata::builder().code("AccessDenied").build())
    }

    #[rstest]
    #[case::no_such_key(404, no_such_key())]
    #[case::bare_404(404, access_denied())]
    fn missing_objects_are_not_found(#[case] status: u16, #[case] err: GetObjectError) {
        let reference = ObjectRef::new("b", "missing.json");
        match get_object_error(&reference, service_error(status, err)) {
            Error::NotFound(location) => assert_eq!(location, "b/missing.json"),
            e => panic!("expected not found, got {e:?}"),
        }
    }

    #[test]
    fn forbidden_stays_a_transport_error() {
        let reference = ObjectRef::new("b", "secret.json");
        let err = get_object_error(&reference, service_error(403, access_denied()));
        assert!(
            matches!(
                err,
                Error::Transport(TransportError::AWSSDKGetObjectError(_))
            ),
            "unexpected error: {err:?}"
        );
    }
}
