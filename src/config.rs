use serde::Deserialize;

use super::errors::Result;
use super::s3::S3;
use super::DEFAULT_REGION;

/// Settings used to construct an [`S3`] client handle.
///
/// When `access_key` and `secret_key` are both unset, credentials come from the SDK's usual
/// environment chain. `hostname` points the client at an S3 compatible endpoint other than AWS.
#[derive(Clone, Debug, Deserialize)]
pub struct S3Config {
    #[serde(default = "default_region")]
    pub region: String,
    #[serde(default)]
    pub hostname: Option<String>,
    #[serde(default)]
    pub insecure: bool,
    #[serde(default)]
    pub access_key: Option<String>,
    #[serde(default)]
    pub secret_key: Option<String>,
    #[serde(default)]
    pub force_path_style: bool,
}

fn default_region() -> String {
    DEFAULT_REGION.to_string()
}

impl Default for S3Config {
    fn default() -> Self {
        Self {
            region: default_region(),
            hostname: None,
            insecure: false,
            access_key: None,
            secret_key: None,
            force_path_style: false,
        }
    }
}

impl S3Config {
    pub fn with_region(mut self, region: impl Into<String>) -> Self {
        self.region = region.into();
        self
    }

    pub async fn new_objects(&self) -> Result<S3> {
        S3::new(self.clone()).await
    }
}
