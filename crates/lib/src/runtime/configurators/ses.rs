use async_trait::async_trait;
use aws_sdk_ses::Client;
use aws_sdk_ses::types::{InvocationType, LambdaAction, ReceiptAction, ReceiptRule, S3Action, TlsPolicy};
use serde::Deserialize;
use tracing::{debug, info};

use super::{Target, sdk_config, sdk_error};
use crate::consts::CR_SES_RULES;
use crate::model::{BoxError, CustomResourceHandler};
use crate::runtime::cfn::{CustomResourceRequest, ResourceOutcome, lenient_bool};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Rule {
  name: String,
  #[serde(default, deserialize_with = "lenient_bool")]
  enabled: bool,
  #[serde(default)]
  recipients: Vec<String>,
  #[serde(default, deserialize_with = "lenient_bool")]
  scan_enabled: bool,
  tls_policy: String,
}

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Properties {
  #[serde(flatten)]
  target: Target,
  rule_set_name: String,
  invocation_type: String,
  #[serde(default)]
  rules: Vec<Rule>,
  #[serde(default)]
  message_body_bucket: Option<String>,
  #[serde(default)]
  message_body_prefix: Option<String>,
}

/// Owns one receipt rule set per function and makes it the active set.
pub struct SesRulesConfigurator;

/// Receipt rules in declaration order. Message bodies are stored before the
/// function runs so it can read them.
fn receipt_rules(props: &Properties) -> Result<Vec<ReceiptRule>, BoxError> {
  props
    .rules
    .iter()
    .map(|rule| {
      let mut actions = Vec::new();
      if let Some(bucket) = &props.message_body_bucket {
        let store = S3Action::builder()
          .bucket_name(bucket)
          .set_object_key_prefix(props.message_body_prefix.clone())
          .build()?;
        actions.push(ReceiptAction::builder().s3_action(store).build());
      }
      let invoke = LambdaAction::builder()
        .function_arn(&props.target.lambda_target_arn)
        .invocation_type(InvocationType::from(props.invocation_type.as_str()))
        .build()?;
      actions.push(ReceiptAction::builder().lambda_action(invoke).build());

      Ok(
        ReceiptRule::builder()
          .name(&rule.name)
          .enabled(rule.enabled)
          .scan_enabled(rule.scan_enabled)
          .tls_policy(TlsPolicy::from(rule.tls_policy.as_str()))
          .set_recipients((!rule.recipients.is_empty()).then(|| rule.recipients.clone()))
          .set_actions(Some(actions))
          .build()?,
      )
    })
    .collect()
}

async fn delete_rule_set(client: &Client, name: &str) -> Result<(), BoxError> {
  client
    .set_active_receipt_rule_set()
    .send()
    .await
    .map_err(|e| sdk_error("SetActiveReceiptRuleSet", e))?;
  client
    .delete_receipt_rule_set()
    .rule_set_name(name)
    .send()
    .await
    .map_err(|e| sdk_error("DeleteReceiptRuleSet", e))?;
  info!(rule_set = name, "receipt rule set deleted");
  Ok(())
}

#[async_trait]
impl CustomResourceHandler for SesRulesConfigurator {
  fn resource_type(&self) -> &str {
    CR_SES_RULES
  }

  async fn create(&self, request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
    let props: Properties = request.properties()?;
    let rules = receipt_rules(&props)?;
    let client = Client::new(sdk_config().await);

    let existing = client
      .describe_receipt_rule_set()
      .rule_set_name(&props.rule_set_name)
      .send()
      .await;
    match existing {
      Ok(_) => {
        debug!(rule_set = %props.rule_set_name, "replacing existing rule set");
        delete_rule_set(&client, &props.rule_set_name).await?;
      }
      Err(err)
        if err
          .as_service_error()
          .is_some_and(|e| e.is_rule_set_does_not_exist_exception()) => {}
      Err(err) => return Err(sdk_error("DescribeReceiptRuleSet", err)),
    }

    client
      .create_receipt_rule_set()
      .rule_set_name(&props.rule_set_name)
      .send()
      .await
      .map_err(|e| sdk_error("CreateReceiptRuleSet", e))?;
    let mut after: Option<String> = None;
    for rule in rules {
      let name = rule.name().to_string();
      client
        .create_receipt_rule()
        .rule_set_name(&props.rule_set_name)
        .set_after(after.take())
        .rule(rule)
        .send()
        .await
        .map_err(|e| sdk_error("CreateReceiptRule", e))?;
      after = Some(name);
    }
    client
      .set_active_receipt_rule_set()
      .rule_set_name(&props.rule_set_name)
      .send()
      .await
      .map_err(|e| sdk_error("SetActiveReceiptRuleSet", e))?;
    info!(rule_set = %props.rule_set_name, rules = props.rules.len(), "receipt rule set active");
    Ok(ResourceOutcome::with_physical_id(&props.rule_set_name))
  }

  async fn update(&self, request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
    if let Some(old) = request.old_properties::<Properties>()?
      && old.rule_set_name != request.properties::<Properties>()?.rule_set_name
    {
      let client = Client::new(sdk_config().await);
      delete_rule_set(&client, &old.rule_set_name).await?;
    }
    self.create(request).await
  }

  async fn delete(&self, request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
    let props: Properties = request.properties()?;
    let client = Client::new(sdk_config().await);
    delete_rule_set(&client, &props.rule_set_name).await?;
    Ok(ResourceOutcome::with_physical_id(&props.rule_set_name))
  }
}
