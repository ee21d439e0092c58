use anyhow::{Context, Result};
use s3::creds::Credentials;
use s3::region::Region;
use s3::Bucket;
use tracing::debug;

use crate::config::Config;

/// Read-only S3 client for the bucket holding the bot configuration.
#[derive(Clone)]
pub struct S3Client {
    bucket: Box<Bucket>,
}

impl S3Client {
    /// Create a client for `bucket` using the region settings from `config`.
    ///
    /// # Errors
    ///
    /// Returns an error if credentials are missing or client initialization fails.
    pub fn new(config: &Config, bucket: &str) -> Result<Self> {
        let access_key = std::env::var("AWS_ACCESS_KEY_ID").context("AWS_ACCESS_KEY_ID not set")?;
        let secret_key =
            std::env::var("AWS_SECRET_ACCESS_KEY").context("AWS_SECRET_ACCESS_KEY not set")?;

        let credentials = Credentials::new(Some(&access_key), Some(&secret_key), None, None, None)
            .context("Failed to create S3 credentials")?;

        let region = if let Some(ref endpoint) = config.s3_endpoint {
            Region::Custom {
                region: config.s3_region.clone(),
                endpoint: endpoint.clone(),
            }
        } else {
            config.s3_region.parse().unwrap_or(Region::UsEast1)
        };

        let bucket =
            Bucket::new(bucket, region, credentials).context("Failed to create S3 bucket")?;

        // Use path-style for custom endpoints (MinIO, R2, etc.)
        let bucket = if config.s3_endpoint.is_some() {
            bucket.with_path_style()
        } else {
            bucket
        };

        Ok(Self { bucket })
    }

    /// Get an object's bytes, or `None` if it does not exist.
    ///
    /// # Errors
    ///
    /// Returns an error if the get request fails.
    pub async fn get_object(&self, s3_key: &str) -> Result<Option<Vec<u8>>> {
        debug!(bucket = %self.bucket.name(), key = %s3_key, "Getting S3 object");

        match self.bucket.get_object(s3_key).await {
            Ok(response) if response.status_code() == 404 => Ok(None),
            Ok(response) => Ok(Some(response.to_vec())),
            Err(s3::error::S3Error::HttpFailWithBody(404, _)) => Ok(None),
            Err(e) => Err(anyhow::anyhow!("S3 get object failed: {e}")),
        }
    }
}

impl std::fmt::Debug for S3Client {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("S3Client")
            .field("bucket", &self.bucket.name())
            .finish()
    }
}
