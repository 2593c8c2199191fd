use async_trait::async_trait;
use aws_sdk_sns::Client;
use serde::Deserialize;
use tracing::info;

use super::{Target, sdk_config, sdk_error};
use crate::consts::CR_SNS_SUBSCRIPTION;
use crate::model::{BoxError, CustomResourceHandler};
use crate::runtime::cfn::{CustomResourceRequest, ResourceOutcome};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Properties {
  #[serde(flatten)]
  target: Target,
  topic_arn: String,
}

/// Subscribes the function to a topic. The subscription ARN is the physical
/// id, so delete needs nothing else.
pub struct SnsSubscriptionConfigurator;

#[async_trait]
impl CustomResourceHandler for SnsSubscriptionConfigurator {
  fn resource_type(&self) -> &str {
    CR_SNS_SUBSCRIPTION
  }

  async fn create(&self, request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
    let props: Properties = request.properties()?;
    let client = Client::new(sdk_config().await);
    let output = client
      .subscribe()
      .topic_arn(&props.topic_arn)
      .protocol("lambda")
      .endpoint(&props.target.lambda_target_arn)
      .return_subscription_arn(true)
      .send()
      .await
      .map_err(|e| sdk_error("Subscribe", e))?;
    let arn = output.subscription_arn().unwrap_or_default().to_string();
    info!(topic = %props.topic_arn, subscription = %arn, "subscribed");
    Ok(ResourceOutcome::with_physical_id(&arn).attribute("SubscriptionArn", arn))
  }

  async fn update(&self, request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
    // Subscriptions are immutable; a new physical id makes the provider
    // delete the old one.
    self.create(request).await
  }

  async fn delete(&self, request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
    let Some(arn) = request.physical_resource_id.as_deref().filter(|id| id.starts_with("arn:")) else {
      return Ok(ResourceOutcome::default());
    };
    let client = Client::new(sdk_config().await);
    client
      .unsubscribe()
      .subscription_arn(arn)
      .send()
      .await
      .map_err(|e| sdk_error("Unsubscribe", e))?;
    info!(subscription = arn, "unsubscribed");
    Ok(ResourceOutcome::with_physical_id(arn))
  }
}
