use async_trait::async_trait;
use aws_sdk_codecommit::Client;
use aws_sdk_codecommit::types::{RepositoryTrigger, RepositoryTriggerEventEnum};
use serde::Deserialize;
use tracing::info;

use super::{Target, sdk_config, sdk_error};
use crate::consts::CR_CODECOMMIT_TRIGGER;
use crate::model::{BoxError, CustomResourceHandler};
use crate::runtime::cfn::{CustomResourceRequest, ResourceOutcome};

#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
struct Properties {
  #[serde(flatten)]
  target: Target,
  repository_name: String,
  trigger_name: String,
  #[serde(default)]
  branches: Vec<String>,
  #[serde(default)]
  events: Vec<String>,
}

/// Maintains one named trigger in a repository's trigger list.
pub struct CodeCommitTriggerConfigurator;

fn trigger(props: &Properties) -> Result<RepositoryTrigger, BoxError> {
  let events = if props.events.is_empty() {
    vec![RepositoryTriggerEventEnum::All]
  } else {
    props.events.iter().map(|e| RepositoryTriggerEventEnum::from(e.as_str())).collect()
  };
  Ok(
    RepositoryTrigger::builder()
      .name(&props.trigger_name)
      .destination_arn(&props.target.lambda_target_arn)
      .set_branches(Some(props.branches.clone()))
      .set_events(Some(events))
      .build()?,
  )
}

/// Existing triggers without the one named `name`, plus `replacement`.
fn merge(existing: &[RepositoryTrigger], name: &str, replacement: Option<RepositoryTrigger>) -> Vec<RepositoryTrigger> {
  existing
    .iter()
    .filter(|t| t.name() != name)
    .cloned()
    .chain(replacement)
    .collect()
}

async fn apply(props: &Properties, remove: bool) -> Result<(), BoxError> {
  let client = Client::new(sdk_config().await);
  let current = client
    .get_repository_triggers()
    .repository_name(&props.repository_name)
    .send()
    .await
    .map_err(|e| sdk_error("GetRepositoryTriggers", e))?;
  let replacement = if remove { None } else { Some(trigger(props)?) };
  let triggers = merge(current.triggers(), &props.trigger_name, replacement);
  client
    .put_repository_triggers()
    .repository_name(&props.repository_name)
    .set_triggers(Some(triggers))
    .send()
    .await
    .map_err(|e| sdk_error("PutRepositoryTriggers", e))?;
  info!(repository = %props.repository_name, trigger = %props.trigger_name, remove, "repository triggers updated");
  Ok(())
}

#[async_trait]
impl CustomResourceHandler for CodeCommitTriggerConfigurator {
  fn resource_type(&self) -> &str {
    CR_CODECOMMIT_TRIGGER
  }

  async fn create(&self, request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
    let props: Properties = request.properties()?;
    apply(&props, false).await?;
    Ok(ResourceOutcome::with_physical_id(&props.trigger_name))
  }

  async fn update(&self, request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
    if let Some(old) = request.old_properties::<Properties>()?
      && old.repository_name != request.properties::<Properties>()?.repository_name
    {
      apply(&old, true).await?;
    }
    self.create(request).await
  }

  async fn delete(&self, request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
    let props: Properties = request.properties()?;
    apply(&props, true).await?;
    Ok(ResourceOutcome::with_physical_id(&props.trigger_name))
  }
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;

  fn props(events: serde_json::Value) -> Properties {
    serde_json::from_value(json!({
      "LambdaTargetArn": "arn:aws:lambda:us-east-1:1:function:svc_onPush",
      "RepositoryName": "repo",
      "TriggerName": "svc-onPush",
      "Branches": ["main"],
      "Events": events
    }))
    .unwrap()
  }

  fn named(name: &str) -> RepositoryTrigger {
    RepositoryTrigger::builder()
      .name(name)
      .destination_arn("arn:aws:sns:us-east-1:1:topic")
      .events(RepositoryTriggerEventEnum::All)
      .build()
      .unwrap()
  }

  #[test]
  fn empty_events_mean_all() {
    let t = trigger(&props(json!([]))).unwrap();
    assert_eq!(t.events(), [RepositoryTriggerEventEnum::All]);
    let t = trigger(&props(json!(["createReference", "updateReference"]))).unwrap();
    assert_eq!(t.events().len(), 2);
    assert_eq!(t.branches(), ["main".to_string()]);
  }

  #[test]
  fn merge_replaces_by_name() {
    let existing = vec![named("other"), named("svc-onPush")];
    let merged = merge(&existing, "svc-onPush", Some(trigger(&props(json!([]))).unwrap()));
    assert_eq!(merged.len(), 2);
    assert_eq!(merged[0].name(), "other");
    assert_eq!(merged[1].destination_arn(), "arn:aws:lambda:us-east-1:1:function:svc_onPush");

    let removed = merge(&existing, "svc-onPush", None);
    assert_eq!(removed.len(), 1);
    assert_eq!(removed[0].name(), "other");
  }
}
