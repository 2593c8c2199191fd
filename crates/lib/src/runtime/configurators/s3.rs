use async_trait::async_trait;
use aws_sdk_s3::Client;
use aws_sdk_s3::types::{
  Event, FilterRule, FilterRuleName, LambdaFunctionConfiguration, NotificationConfiguration,
  NotificationConfigurationFilter, S3KeyFilter,
};
use serde::Deserialize;
use tracing::info;

use super::{Target, arn_resource, sdk_config, sdk_error};
use crate::consts::CR_S3_NOTIFICATION;
use crate::model::{BoxError, CustomResourceHandler};
use crate::naming::logical_name;
use crate::runtime::cfn::{CustomResourceRequest, ResourceOutcome};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Rule {
  name: String,
  value: String,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct KeyRules {
  #[serde(default)]
  filter_rules: Vec<Rule>,
}

#[derive(Debug, Clone, Default, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Filter {
  #[serde(default)]
  key: KeyRules,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Properties {
  #[serde(flatten)]
  target: Target,
  bucket_arn: String,
  events: Vec<String>,
  #[serde(default)]
  filter: Option<Filter>,
}

/// Adds and removes one notification entry in a bucket's configuration,
/// leaving every other entry alone. Entries are matched by their `Id`, so a
/// function may hold several entries on the same bucket.
pub struct S3NotificationConfigurator;

fn notification_id(props: &Properties) -> String {
  let rules = props
    .filter
    .iter()
    .flat_map(|f| &f.key.filter_rules)
    .map(|rule| format!("{}={}", rule.name, rule.value));
  logical_name(
    "Notification",
    [props.target.lambda_target_arn.clone(), props.bucket_arn.clone()]
      .into_iter()
      .chain(props.events.iter().cloned())
      .chain(rules),
  )
}

fn configuration(props: &Properties) -> Result<LambdaFunctionConfiguration, BoxError> {
  let mut builder = LambdaFunctionConfiguration::builder()
    .id(notification_id(props))
    .lambda_function_arn(&props.target.lambda_target_arn)
    .set_events(Some(props.events.iter().map(|e| Event::from(e.as_str())).collect()));
  if let Some(filter) = &props.filter
    && !filter.key.filter_rules.is_empty()
  {
    let rules = filter
      .key
      .filter_rules
      .iter()
      .map(|rule| {
        FilterRule::builder()
          .name(FilterRuleName::from(rule.name.as_str()))
          .value(&rule.value)
          .build()
      })
      .collect();
    builder = builder.filter(
      NotificationConfigurationFilter::builder()
        .key(S3KeyFilter::builder().set_filter_rules(Some(rules)).build())
        .build(),
    );
  }
  Ok(builder.build()?)
}

/// Existing entries minus the ones whose id is in `stale` or matches
/// `replacement`, plus `replacement`.
fn merge(
  existing: &[LambdaFunctionConfiguration],
  stale: &[String],
  replacement: Option<LambdaFunctionConfiguration>,
) -> Vec<LambdaFunctionConfiguration> {
  let replaced = replacement.as_ref().and_then(|r| r.id()).map(str::to_owned);
  existing
    .iter()
    .filter(|c| match c.id() {
      Some(id) => !stale.iter().any(|s| s == id) && Some(id) != replaced.as_deref(),
      None => true,
    })
    .cloned()
    .chain(replacement)
    .collect()
}

async fn apply(
  bucket_arn: &str,
  stale: &[String],
  replacement: Option<LambdaFunctionConfiguration>,
) -> Result<(), BoxError> {
  let client = Client::new(sdk_config().await);
  let bucket = arn_resource(bucket_arn);
  let current = client
    .get_bucket_notification_configuration()
    .bucket(bucket)
    .send()
    .await
    .map_err(|e| sdk_error("GetBucketNotificationConfiguration", e))?;

  let added = replacement.as_ref().and_then(|r| r.id().map(str::to_string));
  let lambdas = merge(current.lambda_function_configurations(), stale, replacement);
  let config = NotificationConfiguration::builder()
    .set_lambda_function_configurations(Some(lambdas))
    .set_topic_configurations(Some(current.topic_configurations().to_vec()))
    .set_queue_configurations(Some(current.queue_configurations().to_vec()))
    .set_event_bridge_configuration(current.event_bridge_configuration().cloned())
    .build();
  client
    .put_bucket_notification_configuration()
    .bucket(bucket)
    .notification_configuration(config)
    .send()
    .await
    .map_err(|e| sdk_error("PutBucketNotificationConfiguration", e))?;
  info!(bucket, ?stale, ?added, "bucket notification configured");
  Ok(())
}

#[async_trait]
impl CustomResourceHandler for S3NotificationConfigurator {
  fn resource_type(&self) -> &str {
    CR_S3_NOTIFICATION
  }

  async fn create(&self, request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
    let props: Properties = request.properties()?;
    apply(&props.bucket_arn, &[], Some(configuration(&props)?)).await?;
    Ok(ResourceOutcome::default())
  }

  async fn update(&self, request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
    let props: Properties = request.properties()?;
    let mut stale = Vec::new();
    if let Some(old) = request.old_properties::<Properties>()? {
      if old.bucket_arn != props.bucket_arn {
        apply(&old.bucket_arn, &[notification_id(&old)], None).await?;
      } else {
        stale.push(notification_id(&old));
      }
    }
    apply(&props.bucket_arn, &stale, Some(configuration(&props)?)).await?;
    Ok(ResourceOutcome::default())
  }

  async fn delete(&self, request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
    let props: Properties = request.properties()?;
    apply(&props.bucket_arn, &[notification_id(&props)], None).await?;
    Ok(ResourceOutcome::default())
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn props() -> Properties {
    serde_json::from_value(json!({
      "ServiceToken": "arn:aws:lambda:us-east-1:1:function:configurator",
      "LambdaTargetArn": "arn:aws:lambda:us-east-1:1:function:svc_onUpload",
      "BucketArn": "arn:aws:s3:::b-xyz",
      "Events": ["s3:ObjectCreated:*", "s3:ObjectRemoved:*"],
      "Filter": {"Key": {"FilterRules": [{"Name": "suffix", "Value": ".jpg"}]}}
    }))
    .unwrap()
  }

  fn other(arn: &str, id: &str) -> LambdaFunctionConfiguration {
    LambdaFunctionConfiguration::builder()
      .id(id)
      .lambda_function_arn(arn)
      .events(Event::from("s3:ObjectCreated:*"))
      .build()
      .unwrap()
  }

  fn with_suffix(suffix: &str) -> Properties {
    let mut props = props();
    props.filter = Some(Filter {
      key: KeyRules {
        filter_rules: vec![Rule {
          name: "suffix".to_string(),
          value: suffix.to_string(),
        }],
      },
    });
    props
  }

  #[test]
  fn configuration_carries_events_and_filter() {
    let config = configuration(&props()).unwrap();
    assert_eq!(config.events().len(), 2);
    let rules = config.filter().unwrap().key().unwrap().filter_rules();
    assert_eq!(rules[0].value(), Some(".jpg"));
    assert_eq!(config.id(), configuration(&props()).unwrap().id());
  }

  #[test]
  fn merge_preserves_other_entries() {
    let keep = other("arn:aws:lambda:us-east-1:1:function:keep", "Keep");
    let current = configuration(&props()).unwrap();
    let existing = vec![keep.clone(), current.clone()];

    let replaced = merge(&existing, &[], Some(current.clone()));
    assert_eq!(replaced, [keep.clone(), current]);

    let removed = merge(&existing, &[notification_id(&props())], None);
    assert_eq!(removed, [keep]);
  }

  #[test]
  fn filters_on_one_bucket_keep_separate_entries() {
    let jpg = configuration(&with_suffix(".jpg")).unwrap();
    let png = configuration(&with_suffix(".png")).unwrap();
    assert_ne!(jpg.id(), png.id());
    assert_eq!(jpg.lambda_function_arn(), png.lambda_function_arn());

    let both = merge(&merge(&[], &[], Some(jpg.clone())), &[], Some(png.clone()));
    assert_eq!(both, [jpg.clone(), png.clone()]);

    // Removing one entry leaves the other function entry on the bucket.
    let one = merge(&both, &[notification_id(&with_suffix(".png"))], None);
    assert_eq!(one, [jpg.clone()]);

    // An update swaps the old entry for the new one in a single pass.
    let gif = configuration(&with_suffix(".gif")).unwrap();
    let updated = merge(&both, &[notification_id(&with_suffix(".png"))], Some(gif.clone()));
    assert_eq!(updated, [jpg, gif]);
  }
}
