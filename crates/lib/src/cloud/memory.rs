//! In-memory provider.
//!
//! Records every call and keeps just enough state (buckets, objects, stacks)
//! for provisioning to run end to end without credentials. Tests script
//! failures, change sets and slow stack operations through it.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::Utc;
use tokio::sync::Mutex;

use super::{
  ChangeSet, CloudClients, CloudError, FunctionCode, FunctionCodeUpdater, ImageRegistry, ObjectStore,
  ResourceChange, Result, StackControlPlane, StackEvent, StackRequest, StackSummary, UpdateOutcome,
};

/// A recorded provider call.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Call {
  BucketRegion(String),
  BucketVersioning(String),
  PutObject { bucket: String, key: String },
  DeleteObject { bucket: String, key: String, version: Option<String> },
  DescribeStack(String),
  CreateStack(String),
  UpdateStack(String),
  DeleteStack(String),
  StackEvents(String),
  CreateChangeSet { stack: String, change_set: String },
  DeleteChangeSet { stack: String, change_set: String },
  UpdateFunctionCode { function: String, code: FunctionCode },
  PushImage { local_tag: String, repository: String },
}

#[derive(Debug, Default)]
struct Bucket {
  region: String,
  versioned: bool,
  objects: BTreeMap<String, Vec<u8>>,
  versions: u64,
}

#[derive(Debug, Default)]
struct State {
  calls: Vec<Call>,
  buckets: BTreeMap<String, Bucket>,
  stacks: BTreeMap<String, StackSummary>,
  templates: BTreeMap<String, String>,
  /// Last template location a create, update or change set was given.
  template_urls: BTreeMap<String, String>,
  events: BTreeMap<String, Vec<StackEvent>>,
  /// Status a create or update settles into.
  settle_status: Option<String>,
  /// Describes that still report the operation in progress.
  pending_polls: u32,
  final_status: BTreeMap<String, String>,
  change_set: Vec<ResourceChange>,
  failures: BTreeMap<String, String>,
}

impl State {
  fn fail(&self, operation: &str) -> Result<()> {
    match self.failures.get(operation) {
      Some(message) => Err(CloudError::api(operation, message)),
      None => Ok(()),
    }
  }

  fn note_template_url(&mut self, request: &StackRequest) {
    if let Some(url) = &request.template_url {
      self.template_urls.insert(request.stack_name.clone(), url.clone());
    }
  }

  fn push_event(&mut self, stack: &str, logical_id: &str, resource_type: &str, status: &str) {
    let events = self.events.entry(stack.to_string()).or_default();
    let event = StackEvent {
      event_id: format!("{stack}-{}", events.len() + 1),
      timestamp: Utc::now(),
      logical_id: logical_id.to_string(),
      resource_type: resource_type.to_string(),
      status: status.to_string(),
      reason: None,
    };
    events.insert(0, event);
  }

  /// Put `stack` in progress, settling into `done` once the scripted polls
  /// are used up.
  fn start(&mut self, stack: &str, in_progress: &str, done: &str) {
    let done = self.settle_status.clone().unwrap_or_else(|| done.to_string());
    if let Some(summary) = self.stacks.get_mut(stack) {
      summary.last_updated_time = Some(Utc::now());
      if self.pending_polls == 0 {
        summary.status = done.clone();
      } else {
        summary.status = in_progress.to_string();
        self.final_status.insert(stack.to_string(), done.clone());
      }
    }
    self.push_event(stack, stack, "AWS::CloudFormation::Stack", in_progress);
    if self.pending_polls == 0 {
      self.push_event(stack, stack, "AWS::CloudFormation::Stack", &done);
    }
  }
}

pub struct MemoryCloud {
  region: String,
  state: Mutex<State>,
}

impl MemoryCloud {
  pub fn new(region: impl Into<String>) -> Arc<Self> {
    Arc::new(Self {
      region: region.into(),
      state: Mutex::new(State::default()),
    })
  }

  pub fn clients(self: &Arc<Self>) -> CloudClients {
    CloudClients {
      region: self.region.clone(),
      objects: self.clone(),
      stacks: self.clone(),
      functions: self.clone(),
      images: self.clone(),
    }
  }

  pub async fn add_bucket(&self, name: &str, region: &str, versioned: bool) {
    self.state.lock().await.buckets.insert(
      name.to_string(),
      Bucket {
        region: region.to_string(),
        versioned,
        ..Bucket::default()
      },
    );
  }

  /// Seed an existing stack.
  pub async fn add_stack(&self, stack_name: &str, status: &str, template_body: &str) {
    let mut state = self.state.lock().await;
    state.stacks.insert(
      stack_name.to_string(),
      StackSummary {
        stack_id: format!("arn:aws:cloudformation:{}:123456789012:stack/{stack_name}/0001", self.region),
        stack_name: stack_name.to_string(),
        status: status.to_string(),
        creation_time: Some(Utc::now()),
        ..StackSummary::default()
      },
    );
    state.templates.insert(stack_name.to_string(), template_body.to_string());
  }

  /// Make `operation` (the provider API name, e.g. `PutObject`) fail.
  pub async fn fail_on(&self, operation: &str, message: &str) {
    self
      .state
      .lock()
      .await
      .failures
      .insert(operation.to_string(), message.to_string());
  }

  /// Status the next creates and updates end in instead of `*_COMPLETE`.
  pub async fn settle_as(&self, status: &str) {
    self.state.lock().await.settle_status = Some(status.to_string());
  }

  /// Report the next stack operation as in progress for `polls` describes.
  pub async fn slow_stack_operations(&self, polls: u32) {
    self.state.lock().await.pending_polls = polls;
  }

  /// Changes the next change set reports.
  pub async fn script_change_set(&self, changes: Vec<ResourceChange>) {
    self.state.lock().await.change_set = changes;
  }

  pub async fn calls(&self) -> Vec<Call> {
    self.state.lock().await.calls.clone()
  }

  pub async fn objects(&self, bucket: &str) -> Vec<String> {
    let state = self.state.lock().await;
    state
      .buckets
      .get(bucket)
      .map(|b| b.objects.keys().cloned().collect())
      .unwrap_or_default()
  }

  pub async fn object(&self, bucket: &str, key: &str) -> Option<Vec<u8>> {
    let state = self.state.lock().await;
    state.buckets.get(bucket).and_then(|b| b.objects.get(key).cloned())
  }

  pub async fn template(&self, stack_name: &str) -> Option<String> {
    self.state.lock().await.templates.get(stack_name).cloned()
  }

  pub async fn template_url(&self, stack_name: &str) -> Option<String> {
    self.state.lock().await.template_urls.get(stack_name).cloned()
  }

  pub async fn stack(&self, stack_name: &str) -> Option<StackSummary> {
    self.state.lock().await.stacks.get(stack_name).cloned()
  }
}

#[async_trait]
impl ObjectStore for MemoryCloud {
  async fn bucket_region(&self, bucket: &str) -> Result<Option<String>> {
    let mut state = self.state.lock().await;
    state.calls.push(Call::BucketRegion(bucket.to_string()));
    state.fail("HeadBucket")?;
    Ok(state.buckets.get(bucket).map(|b| b.region.clone()))
  }

  async fn bucket_versioning(&self, bucket: &str) -> Result<bool> {
    let mut state = self.state.lock().await;
    state.calls.push(Call::BucketVersioning(bucket.to_string()));
    state.fail("GetBucketVersioning")?;
    Ok(state.buckets.get(bucket).is_some_and(|b| b.versioned))
  }

  async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<Option<String>> {
    let mut state = self.state.lock().await;
    state.calls.push(Call::PutObject {
      bucket: bucket.to_string(),
      key: key.to_string(),
    });
    state.fail("PutObject")?;
    let b = state
      .buckets
      .get_mut(bucket)
      .ok_or_else(|| CloudError::api("PutObject", format!("bucket {bucket} does not exist")))?;
    b.objects.insert(key.to_string(), body);
    if b.versioned {
      b.versions += 1;
      Ok(Some(format!("v{}", b.versions)))
    } else {
      Ok(None)
    }
  }

  async fn delete_object(&self, bucket: &str, key: &str, version: Option<&str>) -> Result<()> {
    let mut state = self.state.lock().await;
    state.calls.push(Call::DeleteObject {
      bucket: bucket.to_string(),
      key: key.to_string(),
      version: version.map(str::to_string),
    });
    state.fail("DeleteObject")?;
    if let Some(b) = state.buckets.get_mut(bucket) {
      b.objects.remove(key);
    }
    Ok(())
  }
}

#[async_trait]
impl StackControlPlane for MemoryCloud {
  async fn describe_stack(&self, stack_name: &str) -> Result<Option<StackSummary>> {
    let mut state = self.state.lock().await;
    state.calls.push(Call::DescribeStack(stack_name.to_string()));
    state.fail("DescribeStacks")?;
    if state.final_status.contains_key(stack_name) {
      if state.pending_polls > 0 {
        state.pending_polls -= 1;
      } else if let Some(done) = state.final_status.remove(stack_name) {
        if let Some(summary) = state.stacks.get_mut(stack_name) {
          summary.status = done.clone();
        }
        state.push_event(stack_name, stack_name, "AWS::CloudFormation::Stack", &done);
        if done == "DELETE_COMPLETE" {
          state.stacks.remove(stack_name);
        }
      }
    }
    Ok(state.stacks.get(stack_name).cloned())
  }

  async fn create_stack(&self, request: &StackRequest) -> Result<String> {
    let mut state = self.state.lock().await;
    state.calls.push(Call::CreateStack(request.stack_name.clone()));
    state.fail("CreateStack")?;
    state.note_template_url(request);
    if state.stacks.contains_key(&request.stack_name) {
      return Err(CloudError::api(
        "CreateStack",
        format!("stack {} already exists", request.stack_name),
      ));
    }
    let stack_id = format!(
      "arn:aws:cloudformation:{}:123456789012:stack/{}/0001",
      self.region, request.stack_name
    );
    state.stacks.insert(
      request.stack_name.clone(),
      StackSummary {
        stack_id: stack_id.clone(),
        stack_name: request.stack_name.clone(),
        status: "CREATE_IN_PROGRESS".to_string(),
        creation_time: Some(Utc::now()),
        parameters: request.parameters.clone(),
        ..StackSummary::default()
      },
    );
    state
      .templates
      .insert(request.stack_name.clone(), request.template_body.clone());
    state.start(&request.stack_name, "CREATE_IN_PROGRESS", "CREATE_COMPLETE");
    Ok(stack_id)
  }

  async fn update_stack(&self, request: &StackRequest) -> Result<UpdateOutcome> {
    let mut state = self.state.lock().await;
    state.calls.push(Call::UpdateStack(request.stack_name.clone()));
    state.fail("UpdateStack")?;
    state.note_template_url(request);
    let Some(summary) = state.stacks.get(&request.stack_name) else {
      return Err(CloudError::api(
        "UpdateStack",
        format!("stack {} does not exist", request.stack_name),
      ));
    };
    let unchanged = state.templates.get(&request.stack_name) == Some(&request.template_body)
      && summary.parameters == request.parameters;
    if unchanged {
      return Ok(UpdateOutcome::NoChanges);
    }
    state
      .templates
      .insert(request.stack_name.clone(), request.template_body.clone());
    if let Some(summary) = state.stacks.get_mut(&request.stack_name) {
      summary.parameters = request.parameters.clone();
    }
    state.start(&request.stack_name, "UPDATE_IN_PROGRESS", "UPDATE_COMPLETE");
    Ok(UpdateOutcome::Started)
  }

  async fn delete_stack(&self, stack_name: &str) -> Result<()> {
    let mut state = self.state.lock().await;
    state.calls.push(Call::DeleteStack(stack_name.to_string()));
    state.fail("DeleteStack")?;
    if state.pending_polls > 0 {
      if let Some(summary) = state.stacks.get_mut(stack_name) {
        summary.status = "DELETE_IN_PROGRESS".to_string();
      }
      state
        .final_status
        .insert(stack_name.to_string(), "DELETE_COMPLETE".to_string());
    } else {
      state.stacks.remove(stack_name);
      state.push_event(stack_name, stack_name, "AWS::CloudFormation::Stack", "DELETE_COMPLETE");
    }
    state.templates.remove(stack_name);
    Ok(())
  }

  async fn stack_events(&self, stack_name: &str) -> Result<Vec<StackEvent>> {
    let mut state = self.state.lock().await;
    state.calls.push(Call::StackEvents(stack_name.to_string()));
    state.fail("DescribeStackEvents")?;
    Ok(state.events.get(stack_name).cloned().unwrap_or_default())
  }

  async fn create_change_set(&self, request: &StackRequest, change_set_name: &str) -> Result<ChangeSet> {
    let mut state = self.state.lock().await;
    state.calls.push(Call::CreateChangeSet {
      stack: request.stack_name.clone(),
      change_set: change_set_name.to_string(),
    });
    state.fail("CreateChangeSet")?;
    state.note_template_url(request);
    if !state.stacks.contains_key(&request.stack_name) {
      return Err(CloudError::api(
        "CreateChangeSet",
        format!("stack {} does not exist", request.stack_name),
      ));
    }
    Ok(ChangeSet {
      name: change_set_name.to_string(),
      changes: state.change_set.clone(),
    })
  }

  async fn delete_change_set(&self, stack_name: &str, change_set_name: &str) -> Result<()> {
    let mut state = self.state.lock().await;
    state.calls.push(Call::DeleteChangeSet {
      stack: stack_name.to_string(),
      change_set: change_set_name.to_string(),
    });
    state.fail("DeleteChangeSet")
  }
}

#[async_trait]
impl FunctionCodeUpdater for MemoryCloud {
  async fn update_function_code(&self, function_name: &str, code: &FunctionCode) -> Result<()> {
    let mut state = self.state.lock().await;
    state.calls.push(Call::UpdateFunctionCode {
      function: function_name.to_string(),
      code: code.clone(),
    });
    state.fail("UpdateFunctionCode")
  }
}

#[async_trait]
impl ImageRegistry for MemoryCloud {
  async fn push(&self, local_tag: &str, repository: &str) -> Result<String> {
    let mut state = self.state.lock().await;
    state.calls.push(Call::PushImage {
      local_tag: local_tag.to_string(),
      repository: repository.to_string(),
    });
    state.fail("PushImage")?;
    let tag = local_tag.rsplit_once(':').map_or("latest", |(_, t)| t);
    Ok(format!("{repository}:{tag}"))
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::cloud::StackPhase;

  fn request(template: &str) -> StackRequest {
    StackRequest {
      stack_name: "svc".to_string(),
      template_body: template.to_string(),
      template_url: None,
      parameters: BTreeMap::new(),
    }
  }

  #[tokio::test]
  async fn versioned_buckets_return_versions() {
    let cloud = MemoryCloud::new("us-east-1");
    cloud.add_bucket("plain", "us-east-1", false).await;
    cloud.add_bucket("versioned", "us-east-1", true).await;
    assert_eq!(cloud.put_object("plain", "k", vec![1]).await.unwrap(), None);
    assert_eq!(cloud.put_object("versioned", "k", vec![1]).await.unwrap().as_deref(), Some("v1"));
    assert!(cloud.put_object("missing", "k", vec![]).await.is_err());
    assert_eq!(cloud.objects("plain").await, ["k"]);
  }

  #[tokio::test]
  async fn identical_updates_report_no_changes() {
    let cloud = MemoryCloud::new("us-east-1");
    cloud.create_stack(&request("{}")).await.unwrap();
    assert_eq!(cloud.update_stack(&request("{}")).await.unwrap(), UpdateOutcome::NoChanges);
    assert_eq!(cloud.update_stack(&request("{\"a\":1}")).await.unwrap(), UpdateOutcome::Started);
  }

  #[tokio::test]
  async fn slow_operations_settle_after_polls() {
    let cloud = MemoryCloud::new("us-east-1");
    cloud.slow_stack_operations(2).await;
    cloud.create_stack(&request("{}")).await.unwrap();
    let phases = [
      cloud.describe_stack("svc").await.unwrap().unwrap().phase(),
      cloud.describe_stack("svc").await.unwrap().unwrap().phase(),
      cloud.describe_stack("svc").await.unwrap().unwrap().phase(),
    ];
    assert_eq!(phases, [StackPhase::InProgress, StackPhase::InProgress, StackPhase::Ready]);
  }

  #[tokio::test]
  async fn scripted_failures() {
    let cloud = MemoryCloud::new("us-east-1");
    cloud.fail_on("DeleteStack", "throttled").await;
    let err = cloud.delete_stack("svc").await.unwrap_err();
    assert_eq!(err.to_string(), "DeleteStack: throttled");
  }
}
