use async_trait::async_trait;
use tracing::{debug, info};

use super::{Operation, ProvisionContext, ProvisionError, UploadError};

/// The artifact bucket exists in the client's region. Records whether it
/// keeps object versions.
pub(super) struct VerifyBucket;

#[async_trait]
impl Operation for VerifyBucket {
  fn name(&self) -> &str {
    "verifyBucket"
  }

  async fn invoke(&self, ctx: &ProvisionContext) -> Result<(), ProvisionError> {
    let bucket = ctx.bucket();
    if ctx.options.noop {
      info!(bucket, "noop: skipping bucket checks");
      return Ok(());
    }

    debug!(bucket, "HeadBucket");
    let Some(bucket_region) = ctx.clients.objects.bucket_region(bucket).await.map_err(UploadError::from)? else {
      return Err(UploadError::MissingBucket(bucket.to_string()).into());
    };
    if !ctx.clients.region.is_empty() && bucket_region != ctx.clients.region {
      return Err(
        UploadError::WrongRegion {
          bucket: bucket.to_string(),
          bucket_region,
          region: ctx.clients.region.clone(),
        }
        .into(),
      );
    }

    debug!(bucket, "GetBucketVersioning");
    let versioned = ctx
      .clients
      .objects
      .bucket_versioning(bucket)
      .await
      .map_err(UploadError::from)?;
    info!(bucket, region = %bucket_region, versioned, "artifact bucket verified");
    ctx.state.lock().await.versioned = versioned;
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;
  use crate::cloud::memory::MemoryCloud;
  use crate::config::ProvisionOptions;
  use crate::provision::context::testing::{archive_build, context};

  #[tokio::test]
  async fn records_bucket_versioning() {
    let temp = TempDir::new().unwrap();
    let cloud = MemoryCloud::new("us-east-1");
    cloud.add_bucket("art", "us-east-1", true).await;
    let ctx = context(&cloud, archive_build(&temp), ProvisionOptions::new("art"));
    VerifyBucket.invoke(&ctx).await.unwrap();
    assert!(ctx.state.lock().await.versioned);
  }

  #[tokio::test]
  async fn missing_and_foreign_buckets_fail() {
    let temp = TempDir::new().unwrap();
    let cloud = MemoryCloud::new("us-east-1");
    let ctx = context(&cloud, archive_build(&temp), ProvisionOptions::new("art"));
    let err = VerifyBucket.invoke(&ctx).await.unwrap_err();
    assert_eq!(err.to_string(), "artifact bucket art does not exist");

    cloud.add_bucket("art", "eu-west-1", false).await;
    let err = VerifyBucket.invoke(&ctx).await.unwrap_err();
    assert!(matches!(err, ProvisionError::Upload(UploadError::WrongRegion { .. })));
  }

  #[tokio::test]
  async fn noop_skips_provider_calls() {
    let temp = TempDir::new().unwrap();
    let cloud = MemoryCloud::new("us-east-1");
    let mut options = ProvisionOptions::new("art");
    options.noop = true;
    let ctx = context(&cloud, archive_build(&temp), options);
    VerifyBucket.invoke(&ctx).await.unwrap();
    assert!(cloud.calls().await.is_empty());
  }
}
