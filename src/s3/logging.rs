use aws_sdk_s3::config::interceptors::{
    AfterDeserializationInterceptorContextRef, BeforeTransmitInterceptorContextRef,
};
use aws_sdk_s3::config::{ConfigBag, Interceptor, RuntimeComponents};
use aws_sdk_s3::error::BoxError;

/// Traces every request a client sends and the status of the response it gets back.
///
/// Error responses are logged at `debug`, everything else at `trace`.
#[derive(Debug)]
pub(crate) struct TracingInterceptor {
    region: String,
}

impl TracingInterceptor {
    pub(crate) fn new(region: &str) -> Self {
        Self {
            region: region.to_string(),
        }
    }
}

impl Interceptor for TracingInterceptor {
    fn name(&self) -> &'static str {
        "TracingInterceptor"
    }

    fn read_after_serialization(
        &self,
        context: &BeforeTransmitInterceptorContextRef<'_>,
        _runtime_components: &RuntimeComponents,
        _cfg: &mut ConfigBag,
    ) -> Result<(), BoxError> {
        let request = context.request();
        tracing::trace!(
            region = %self.region,
            method = %request.method(),
            uri = %request.uri(),
            "sending s3 request"
        );
        Ok(())
    }

    fn read_after_deserialization(
        &self,
        context: &AfterDeserializationInterceptorContextRef<'_>,
        _runtime_components: &RuntimeComponents,
        _cfg: &mut ConfigBag,
    ) -> Result<(), BoxError> {
        let status = context.response().status();
        if status.is_client_error() || status.is_server_error() {
            tracing::debug!(region = %self.region, %status, "s3 request failed");
        } else {
            tracing::trace!(region = %self.region, %status, "received s3 response");
        }
        Ok(())
    }
}
