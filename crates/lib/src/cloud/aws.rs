//! SDK-backed implementations of the provider seams.

use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use aws_config::{BehaviorVersion, SdkConfig};
use aws_sdk_cloudformation::error::ProvideErrorMetadata;
use aws_sdk_cloudformation::primitives::DateTime as SmithyDateTime;
use aws_sdk_cloudformation::types::{Capability, ChangeSetStatus, ChangeSetType, Parameter, ResourceAttribute};
use aws_sdk_s3::primitives::ByteStream;
use aws_sdk_s3::types::BucketVersioningStatus;
use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use chrono::{DateTime, Utc};
use tokio::io::AsyncWriteExt;
use tokio::process::Command;
use tracing::debug;

use super::{
  ChangeSet, CloudClients, CloudError, FunctionCode, FunctionCodeUpdater, ImageRegistry, ObjectStore,
  ResourceChange, Result, StackControlPlane, StackEvent, StackRequest, StackSummary, UpdateOutcome,
};

const CHANGE_SET_POLL: Duration = Duration::from_secs(2);

fn sdk_error<E: std::error::Error + Send + Sync + 'static>(operation: &str, err: E) -> CloudError {
  CloudError::api(operation, aws_sdk_s3::error::DisplayErrorContext(&err))
}

/// Text of an SDK accessor, whether the model marks the member required or
/// optional.
fn text<'a>(value: impl Into<Option<&'a str>>) -> String {
  value.into().unwrap_or_default().to_string()
}

fn timestamp<'a>(value: impl Into<Option<&'a SmithyDateTime>>) -> Option<DateTime<Utc>> {
  value
    .into()
    .and_then(|t| DateTime::from_timestamp(t.secs(), t.subsec_nanos()))
}

/// Clients for the default credential chain and region.
pub async fn clients() -> CloudClients {
  let config = aws_config::load_defaults(BehaviorVersion::latest()).await;
  from_config(&config)
}

pub fn from_config(config: &SdkConfig) -> CloudClients {
  CloudClients {
    region: config.region().map(|r| r.to_string()).unwrap_or_default(),
    objects: Arc::new(S3Objects(aws_sdk_s3::Client::new(config))),
    stacks: Arc::new(CloudFormationStacks(aws_sdk_cloudformation::Client::new(config))),
    functions: Arc::new(LambdaFunctions(aws_sdk_lambda::Client::new(config))),
    images: Arc::new(EcrRegistry(aws_sdk_ecr::Client::new(config))),
  }
}

pub struct S3Objects(aws_sdk_s3::Client);

#[async_trait]
impl ObjectStore for S3Objects {
  async fn bucket_region(&self, bucket: &str) -> Result<Option<String>> {
    debug!(bucket, "HeadBucket");
    match self.0.head_bucket().bucket(bucket).send().await {
      Ok(out) => Ok(Some(out.bucket_region().unwrap_or("us-east-1").to_string())),
      Err(err) if err.as_service_error().is_some_and(|e| e.is_not_found()) => Ok(None),
      Err(err) => Err(sdk_error("HeadBucket", err)),
    }
  }

  async fn bucket_versioning(&self, bucket: &str) -> Result<bool> {
    debug!(bucket, "GetBucketVersioning");
    let out = self
      .0
      .get_bucket_versioning()
      .bucket(bucket)
      .send()
      .await
      .map_err(|e| sdk_error("GetBucketVersioning", e))?;
    Ok(out.status() == Some(&BucketVersioningStatus::Enabled))
  }

  async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<Option<String>> {
    debug!(bucket, key, bytes = body.len(), "PutObject");
    let out = self
      .0
      .put_object()
      .bucket(bucket)
      .key(key)
      .body(ByteStream::from(body))
      .send()
      .await
      .map_err(|e| sdk_error("PutObject", e))?;
    Ok(out.version_id().map(str::to_string))
  }

  async fn delete_object(&self, bucket: &str, key: &str, version: Option<&str>) -> Result<()> {
    debug!(bucket, key, version, "DeleteObject");
    self
      .0
      .delete_object()
      .bucket(bucket)
      .key(key)
      .set_version_id(version.map(str::to_string))
      .send()
      .await
      .map_err(|e| sdk_error("DeleteObject", e))?;
    Ok(())
  }
}

pub struct CloudFormationStacks(aws_sdk_cloudformation::Client);

/// `(TemplateURL, TemplateBody)`; exactly one is set.
fn template_source(request: &StackRequest) -> (Option<String>, Option<String>) {
  match &request.template_url {
    Some(url) => (Some(url.clone()), None),
    None => (None, Some(request.template_body.clone())),
  }
}

fn parameters(request: &StackRequest) -> Vec<Parameter> {
  request
    .parameters
    .iter()
    .map(|(k, v)| Parameter::builder().parameter_key(k).parameter_value(v).build())
    .collect()
}

fn is_validation<E: ProvideErrorMetadata>(err: &E, needle: &str) -> bool {
  err.code() == Some("ValidationError") && err.message().is_some_and(|m| m.contains(needle))
}

#[async_trait]
impl StackControlPlane for CloudFormationStacks {
  async fn describe_stack(&self, stack_name: &str) -> Result<Option<StackSummary>> {
    debug!(stack = stack_name, "DescribeStacks");
    let out = match self.0.describe_stacks().stack_name(stack_name).send().await {
      Ok(out) => out,
      Err(err) if is_validation(&err, "does not exist") => return Ok(None),
      Err(err) => return Err(sdk_error("DescribeStacks", err)),
    };
    let Some(stack) = out.stacks().first() else {
      return Ok(None);
    };
    Ok(Some(StackSummary {
      stack_id: text(stack.stack_id()),
      stack_name: text(stack.stack_name()),
      description: stack.description().map(str::to_string),
      status: stack.stack_status().map(|s| s.as_str().to_string()).unwrap_or_default(),
      status_reason: stack.stack_status_reason().map(str::to_string),
      creation_time: timestamp(stack.creation_time()),
      last_updated_time: timestamp(stack.last_updated_time()),
      parameters: stack
        .parameters()
        .iter()
        .map(|p| (text(p.parameter_key()), text(p.parameter_value())))
        .collect(),
      tags: stack.tags().iter().map(|t| (text(t.key()), text(t.value()))).collect(),
      outputs: stack
        .outputs()
        .iter()
        .map(|o| (text(o.output_key()), text(o.output_value())))
        .collect(),
    }))
  }

  async fn create_stack(&self, request: &StackRequest) -> Result<String> {
    debug!(stack = %request.stack_name, url = ?request.template_url, "CreateStack");
    let (url, body) = template_source(request);
    let out = self
      .0
      .create_stack()
      .stack_name(&request.stack_name)
      .set_template_url(url)
      .set_template_body(body)
      .set_parameters(Some(parameters(request)))
      .capabilities(Capability::CapabilityIam)
      .capabilities(Capability::CapabilityNamedIam)
      .capabilities(Capability::CapabilityAutoExpand)
      .send()
      .await
      .map_err(|e| sdk_error("CreateStack", e))?;
    Ok(out.stack_id().unwrap_or_default().to_string())
  }

  async fn update_stack(&self, request: &StackRequest) -> Result<UpdateOutcome> {
    debug!(stack = %request.stack_name, url = ?request.template_url, "UpdateStack");
    let (url, body) = template_source(request);
    let result = self
      .0
      .update_stack()
      .stack_name(&request.stack_name)
      .set_template_url(url)
      .set_template_body(body)
      .set_parameters(Some(parameters(request)))
      .capabilities(Capability::CapabilityIam)
      .capabilities(Capability::CapabilityNamedIam)
      .capabilities(Capability::CapabilityAutoExpand)
      .send()
      .await;
    match result {
      Ok(_) => Ok(UpdateOutcome::Started),
      Err(err) if is_validation(&err, "No updates are to be performed") => Ok(UpdateOutcome::NoChanges),
      Err(err) => Err(sdk_error("UpdateStack", err)),
    }
  }

  async fn delete_stack(&self, stack_name: &str) -> Result<()> {
    debug!(stack = stack_name, "DeleteStack");
    self
      .0
      .delete_stack()
      .stack_name(stack_name)
      .send()
      .await
      .map_err(|e| sdk_error("DeleteStack", e))?;
    Ok(())
  }

  async fn stack_events(&self, stack_name: &str) -> Result<Vec<StackEvent>> {
    debug!(stack = stack_name, "DescribeStackEvents");
    let out = self
      .0
      .describe_stack_events()
      .stack_name(stack_name)
      .send()
      .await
      .map_err(|e| sdk_error("DescribeStackEvents", e))?;
    Ok(
      out
        .stack_events()
        .iter()
        .map(|e| StackEvent {
          event_id: text(e.event_id()),
          timestamp: timestamp(e.timestamp()).unwrap_or_default(),
          logical_id: text(e.logical_resource_id()),
          resource_type: text(e.resource_type()),
          status: e.resource_status().map(|s| s.as_str().to_string()).unwrap_or_default(),
          reason: e.resource_status_reason().map(str::to_string),
        })
        .collect(),
    )
  }

  async fn create_change_set(&self, request: &StackRequest, change_set_name: &str) -> Result<ChangeSet> {
    debug!(stack = %request.stack_name, change_set = change_set_name, "CreateChangeSet");
    let (url, body) = template_source(request);
    self
      .0
      .create_change_set()
      .stack_name(&request.stack_name)
      .change_set_name(change_set_name)
      .change_set_type(ChangeSetType::Update)
      .set_template_url(url)
      .set_template_body(body)
      .set_parameters(Some(parameters(request)))
      .capabilities(Capability::CapabilityIam)
      .capabilities(Capability::CapabilityNamedIam)
      .capabilities(Capability::CapabilityAutoExpand)
      .send()
      .await
      .map_err(|e| sdk_error("CreateChangeSet", e))?;

    let mut changes = Vec::new();
    let mut next_token: Option<String> = None;
    loop {
      let out = self
        .0
        .describe_change_set()
        .stack_name(&request.stack_name)
        .change_set_name(change_set_name)
        .set_next_token(next_token.clone())
        .send()
        .await
        .map_err(|e| sdk_error("DescribeChangeSet", e))?;
      match out.status() {
        Some(ChangeSetStatus::CreateComplete) => {}
        Some(ChangeSetStatus::Failed) => {
          let reason = out.status_reason().unwrap_or_default();
          if reason.contains("didn't contain changes") || reason.contains("No updates are to be performed") {
            return Ok(ChangeSet {
              name: change_set_name.to_string(),
              changes: Vec::new(),
            });
          }
          return Err(CloudError::api("DescribeChangeSet", format!("change set failed: {reason}")));
        }
        _ => {
          tokio::time::sleep(CHANGE_SET_POLL).await;
          continue;
        }
      }
      for change in out.changes() {
        let Some(rc) = change.resource_change() else {
          continue;
        };
        let properties = rc
          .details()
          .iter()
          .filter_map(|d| d.target())
          .filter(|t| t.attribute() == Some(&ResourceAttribute::Properties))
          .filter_map(|t| t.name().map(str::to_string))
          .collect::<std::collections::BTreeSet<_>>()
          .into_iter()
          .collect();
        changes.push(ResourceChange {
          logical_id: text(rc.logical_resource_id()),
          physical_id: rc.physical_resource_id().map(str::to_string),
          resource_type: text(rc.resource_type()),
          action: rc.action().map(|a| a.as_str().to_string()).unwrap_or_default(),
          properties,
        });
      }
      match out.next_token() {
        Some(token) => next_token = Some(token.to_string()),
        None => break,
      }
    }
    Ok(ChangeSet {
      name: change_set_name.to_string(),
      changes,
    })
  }

  async fn delete_change_set(&self, stack_name: &str, change_set_name: &str) -> Result<()> {
    debug!(stack = stack_name, change_set = change_set_name, "DeleteChangeSet");
    self
      .0
      .delete_change_set()
      .stack_name(stack_name)
      .change_set_name(change_set_name)
      .send()
      .await
      .map_err(|e| sdk_error("DeleteChangeSet", e))?;
    Ok(())
  }
}

pub struct LambdaFunctions(aws_sdk_lambda::Client);

#[async_trait]
impl FunctionCodeUpdater for LambdaFunctions {
  async fn update_function_code(&self, function_name: &str, code: &FunctionCode) -> Result<()> {
    debug!(function = function_name, ?code, "UpdateFunctionCode");
    let request = self.0.update_function_code().function_name(function_name).publish(true);
    let request = match code {
      FunctionCode::Archive { bucket, key, version } => request
        .s3_bucket(bucket)
        .s3_key(key)
        .set_s3_object_version(version.clone()),
      FunctionCode::Image { uri } => request.image_uri(uri),
    };
    request.send().await.map_err(|e| sdk_error("UpdateFunctionCode", e))?;
    Ok(())
  }
}

pub struct EcrRegistry(aws_sdk_ecr::Client);

async fn docker(args: &[&str], stdin: Option<&str>) -> Result<()> {
  let command_err = |message: String| CloudError::Command {
    program: format!("docker {}", args.first().copied().unwrap_or_default()),
    message,
  };
  let mut child = Command::new("docker")
    .args(args)
    .stdin(if stdin.is_some() { Stdio::piped() } else { Stdio::null() })
    .stdout(Stdio::piped())
    .stderr(Stdio::piped())
    .spawn()
    .map_err(|e| command_err(e.to_string()))?;
  if let Some(input) = stdin
    && let Some(mut pipe) = child.stdin.take()
  {
    pipe.write_all(input.as_bytes()).await.map_err(|e| command_err(e.to_string()))?;
  }
  let output = child.wait_with_output().await.map_err(|e| command_err(e.to_string()))?;
  if !output.status.success() {
    return Err(command_err(String::from_utf8_lossy(&output.stderr).trim().to_string()));
  }
  Ok(())
}

/// `repository:tag` for a local `name:tag`.
fn remote_tag(local_tag: &str, repository: &str) -> String {
  let tag = local_tag.rsplit_once(':').map_or("latest", |(_, t)| t);
  format!("{repository}:{tag}")
}

#[async_trait]
impl ImageRegistry for EcrRegistry {
  async fn push(&self, local_tag: &str, repository: &str) -> Result<String> {
    debug!(image = local_tag, repository, "GetAuthorizationToken");
    let out = self
      .0
      .get_authorization_token()
      .send()
      .await
      .map_err(|e| sdk_error("GetAuthorizationToken", e))?;
    let auth = out
      .authorization_data()
      .first()
      .ok_or_else(|| CloudError::api("GetAuthorizationToken", "no authorization data returned"))?;
    let token = STANDARD
      .decode(auth.authorization_token().unwrap_or_default())
      .map_err(|e| CloudError::api("GetAuthorizationToken", e))?;
    let token = String::from_utf8_lossy(&token);
    let password = token.split_once(':').map_or(token.as_ref(), |(_, p)| p);
    let endpoint = auth.proxy_endpoint().unwrap_or_default();

    docker(&["login", "--username", "AWS", "--password-stdin", endpoint], Some(password)).await?;
    let remote = remote_tag(local_tag, repository);
    docker(&["tag", local_tag, remote.as_str()], None).await?;
    docker(&["push", remote.as_str()], None).await?;
    Ok(remote)
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn remote_tags_keep_the_build_id() {
    assert_eq!(
      remote_tag("svc:20260101", "123.dkr.ecr.us-east-1.amazonaws.com/svc"),
      "123.dkr.ecr.us-east-1.amazonaws.com/svc:20260101"
    );
    assert_eq!(remote_tag("svc", "repo"), "repo:latest");
  }

  #[test]
  fn uploaded_templates_replace_the_inline_body() {
    let mut request = StackRequest {
      stack_name: "svc".to_string(),
      template_body: "{}".to_string(),
      template_url: None,
      parameters: Default::default(),
    };
    assert_eq!(template_source(&request), (None, Some("{}".to_string())));
    request.template_url = Some("https://art.s3.us-east-1.amazonaws.com/svc/t.json".to_string());
    assert_eq!(
      template_source(&request),
      (Some("https://art.s3.us-east-1.amazonaws.com/svc/t.json".to_string()), None)
    );
  }

  #[test]
  fn accessor_text_accepts_both_shapes() {
    assert_eq!(text("a"), "a");
    assert_eq!(text(Some("b")), "b");
    assert_eq!(text(None::<&str>), "");
  }

  #[test]
  fn timestamps_convert() {
    let t = SmithyDateTime::from_secs(1_700_000_000);
    assert_eq!(timestamp(&t).unwrap().timestamp(), 1_700_000_000);
    assert_eq!(timestamp(None::<&SmithyDateTime>), None);
  }
}
