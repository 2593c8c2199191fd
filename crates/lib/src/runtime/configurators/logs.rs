use async_trait::async_trait;
use aws_sdk_cloudwatchlogs::Client;
use serde::Deserialize;
use tracing::info;

use super::{Target, sdk_config, sdk_error};
use crate::consts::CR_LOGS_SUBSCRIPTION;
use crate::model::{BoxError, CustomResourceHandler};
use crate::runtime::cfn::{CustomResourceRequest, ResourceOutcome};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Properties {
  #[serde(flatten)]
  target: Target,
  log_group_name: String,
  filter_name: String,
  #[serde(default)]
  filter_pattern: String,
}

/// Puts a subscription filter that streams a log group to the function.
pub struct LogsSubscriptionConfigurator;

async fn delete_filter(client: &Client, props: &Properties) -> Result<(), BoxError> {
  let result = client
    .delete_subscription_filter()
    .log_group_name(&props.log_group_name)
    .filter_name(&props.filter_name)
    .send()
    .await;
  match result {
    Ok(_) => {
      info!(log_group = %props.log_group_name, filter = %props.filter_name, "subscription filter deleted");
      Ok(())
    }
    Err(err)
      if err
        .as_service_error()
        .is_some_and(|e| e.is_resource_not_found_exception()) =>
    {
      Ok(())
    }
    Err(err) => Err(sdk_error("DeleteSubscriptionFilter", err)),
  }
}

#[async_trait]
impl CustomResourceHandler for LogsSubscriptionConfigurator {
  fn resource_type(&self) -> &str {
    CR_LOGS_SUBSCRIPTION
  }

  async fn create(&self, request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
    let props: Properties = request.properties()?;
    let client = Client::new(sdk_config().await);
    client
      .put_subscription_filter()
      .log_group_name(&props.log_group_name)
      .filter_name(&props.filter_name)
      .filter_pattern(&props.filter_pattern)
      .destination_arn(&props.target.lambda_target_arn)
      .send()
      .await
      .map_err(|e| sdk_error("PutSubscriptionFilter", e))?;
    info!(log_group = %props.log_group_name, filter = %props.filter_name, "subscription filter put");
    Ok(ResourceOutcome::with_physical_id(format!("{}:{}", props.log_group_name, props.filter_name)))
  }

  async fn update(&self, request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
    if let Some(old) = request.old_properties::<Properties>()? {
      let new: Properties = request.properties()?;
      if old.log_group_name != new.log_group_name || old.filter_name != new.filter_name {
        delete_filter(&Client::new(sdk_config().await), &old).await?;
      }
    }
    self.create(request).await
  }

  async fn delete(&self, request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
    let props: Properties = request.properties()?;
    delete_filter(&Client::new(sdk_config().await), &props).await?;
    Ok(ResourceOutcome::default())
  }
}
