//! Provider seams.
//!
//! Provisioning talks to the provider only through these traits. `aws`
//! implements them with the SDK; `memory` records every call for tests and
//! dry runs.

pub mod aws;
pub mod memory;

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::Serialize;
use thiserror::Error;

#[derive(Debug, Clone, Error)]
pub enum CloudError {
  #[error("{operation}: {message}")]
  Api { operation: String, message: String },

  #[error("{program}: {message}")]
  Command { program: String, message: String },
}

impl CloudError {
  pub fn api(operation: impl Into<String>, message: impl fmt::Display) -> Self {
    CloudError::Api {
      operation: operation.into(),
      message: message.to_string(),
    }
  }
}

pub type Result<T> = std::result::Result<T, CloudError>;

/// Lifecycle bucket a provider stack status falls into.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum StackPhase {
  InProgress,
  Ready,
  Failed,
  /// A create that rolled back; the stack can only be deleted.
  RollbackComplete,
  Deleted,
}

impl StackPhase {
  pub fn of(status: &str) -> StackPhase {
    match status {
      "ROLLBACK_COMPLETE" => StackPhase::RollbackComplete,
      "DELETE_COMPLETE" => StackPhase::Deleted,
      "CREATE_COMPLETE" | "UPDATE_COMPLETE" | "IMPORT_COMPLETE" => StackPhase::Ready,
      s if s.ends_with("_IN_PROGRESS") => StackPhase::InProgress,
      // UPDATE_ROLLBACK_COMPLETE leaves the previous template in place and
      // accepts further updates.
      "UPDATE_ROLLBACK_COMPLETE" | "IMPORT_ROLLBACK_COMPLETE" => StackPhase::Ready,
      _ => StackPhase::Failed,
    }
  }

  pub fn is_terminal(self) -> bool {
    self != StackPhase::InProgress
  }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackSummary {
  pub stack_id: String,
  pub stack_name: String,
  pub description: Option<String>,
  pub status: String,
  pub status_reason: Option<String>,
  pub creation_time: Option<DateTime<Utc>>,
  pub last_updated_time: Option<DateTime<Utc>>,
  pub parameters: BTreeMap<String, String>,
  pub tags: BTreeMap<String, String>,
  pub outputs: BTreeMap<String, String>,
}

impl StackSummary {
  pub fn phase(&self) -> StackPhase {
    StackPhase::of(&self.status)
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct StackEvent {
  pub event_id: String,
  pub timestamp: DateTime<Utc>,
  pub logical_id: String,
  pub resource_type: String,
  pub status: String,
  pub reason: Option<String>,
}

/// Template and inputs for a create, update or change set.
#[derive(Debug, Clone, PartialEq)]
pub struct StackRequest {
  pub stack_name: String,
  pub template_body: String,
  /// Location of the uploaded copy of `template_body`. The provider reads
  /// the template from here when set, since inline bodies are capped at
  /// 51,200 bytes.
  pub template_url: Option<String>,
  pub parameters: BTreeMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum UpdateOutcome {
  Started,
  NoChanges,
}

/// One entry of a change set.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct ResourceChange {
  pub logical_id: String,
  pub physical_id: Option<String>,
  pub resource_type: String,
  /// `Add`, `Modify`, `Remove`, `Import` or `Dynamic`.
  pub action: String,
  /// Names of the changed properties.
  pub properties: Vec<String>,
}

impl fmt::Display for ResourceChange {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    write!(f, "{} {} ({})", self.action, self.logical_id, self.resource_type)?;
    if !self.properties.is_empty() {
      write!(f, " [{}]", self.properties.join(", "))?;
    }
    Ok(())
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ChangeSet {
  pub name: String,
  pub changes: Vec<ResourceChange>,
}

/// Where new function code lives.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum FunctionCode {
  Archive {
    bucket: String,
    key: String,
    version: Option<String>,
  },
  Image {
    uri: String,
  },
}

#[async_trait]
pub trait ObjectStore: Send + Sync {
  /// Region of `bucket`, or `None` when it does not exist.
  async fn bucket_region(&self, bucket: &str) -> Result<Option<String>>;

  async fn bucket_versioning(&self, bucket: &str) -> Result<bool>;

  /// Store an object and return its version id, if the bucket versions.
  async fn put_object(&self, bucket: &str, key: &str, body: Vec<u8>) -> Result<Option<String>>;

  async fn delete_object(&self, bucket: &str, key: &str, version: Option<&str>) -> Result<()>;
}

#[async_trait]
pub trait StackControlPlane: Send + Sync {
  /// `None` when no stack by that name exists.
  async fn describe_stack(&self, stack_name: &str) -> Result<Option<StackSummary>>;

  /// Returns the new stack id.
  async fn create_stack(&self, request: &StackRequest) -> Result<String>;

  async fn update_stack(&self, request: &StackRequest) -> Result<UpdateOutcome>;

  async fn delete_stack(&self, stack_name: &str) -> Result<()>;

  /// Events, newest first.
  async fn stack_events(&self, stack_name: &str) -> Result<Vec<StackEvent>>;

  /// Create a change set and wait until the provider has computed it. A
  /// change set with no changes comes back empty rather than failed.
  async fn create_change_set(&self, request: &StackRequest, change_set_name: &str) -> Result<ChangeSet>;

  async fn delete_change_set(&self, stack_name: &str, change_set_name: &str) -> Result<()>;
}

#[async_trait]
pub trait FunctionCodeUpdater: Send + Sync {
  async fn update_function_code(&self, function_name: &str, code: &FunctionCode) -> Result<()>;
}

#[async_trait]
pub trait ImageRegistry: Send + Sync {
  /// Push the local image `local_tag` into `repository` and return the
  /// pushed image URI.
  async fn push(&self, local_tag: &str, repository: &str) -> Result<String>;
}

/// Everything provisioning needs from the provider.
#[derive(Clone)]
pub struct CloudClients {
  pub region: String,
  pub objects: Arc<dyn ObjectStore>,
  pub stacks: Arc<dyn StackControlPlane>,
  pub functions: Arc<dyn FunctionCodeUpdater>,
  pub images: Arc<dyn ImageRegistry>,
}

impl fmt::Debug for CloudClients {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CloudClients").field("region", &self.region).finish()
  }
}
