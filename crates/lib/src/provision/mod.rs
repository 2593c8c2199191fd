//! Provisioning: push a build to the provider and converge its stack.
//!
//! A run is a [`Pipeline`] of four stages, `preconditions`, `upload`, `apply`
//! and `describe`. The apply stage holds exactly one operation: full
//! convergence, an in-place code update, or a no-op when a code pipeline
//! deploys the stack instead.

mod context;
mod converge;
mod describe;
mod inplace;
mod pipeline;
mod preconditions;
pub mod stack;
mod upload;

use std::collections::BTreeMap;
use std::sync::Arc;
use std::time::Duration;

use thiserror::Error;
use tokio_util::sync::CancellationToken;

pub use context::{ProvisionContext, UploadedObject};
pub use pipeline::{Operation, Pipeline, Stage};

use crate::cloud::{CloudClients, CloudError, ResourceChange, StackSummary};
use crate::config::{BuildConfig, ProvisionOptions};
use crate::package::{BuildOutput, PackageError};
use crate::template::TemplateError;
use crate::util::pool::render_failures;

#[derive(Debug, Error)]
pub enum UploadError {
  #[error("artifact bucket {0} does not exist")]
  MissingBucket(String),

  #[error("artifact bucket {bucket} is in {bucket_region}, but the client region is {region}")]
  WrongRegion {
    bucket: String,
    bucket_region: String,
    region: String,
  },

  #[error("image artifacts need an image repository")]
  MissingRepository,

  #[error("failed to read {path}: {source}")]
  Read {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error(transparent)]
  Cloud(#[from] CloudError),

  #[error(transparent)]
  Package(#[from] PackageError),

  #[error(transparent)]
  Template(#[from] TemplateError),

  #[error("uploads failed: {0}")]
  Failed(String),
}

#[derive(Debug, Error)]
pub enum ApplyError {
  #[error(transparent)]
  Cloud(#[from] CloudError),

  #[error(transparent)]
  Template(#[from] TemplateError),

  #[error("stack {stack} is {status} and cannot be updated; delete it and provision again")]
  RollbackComplete { stack: String, status: String },

  #[error("stack {stack} is {status} and cannot be updated")]
  NotUpdatable { stack: String, status: String },

  #[error("stack {stack} ended in {status}{}", render_events(events))]
  StackFailed {
    stack: String,
    status: String,
    events: Vec<String>,
  },

  #[error("gave up waiting on stack {stack} after {}; run status to see how it ends", humantime::format_duration(*waited))]
  Timeout { stack: String, waited: Duration },

  #[error("stack {0} does not exist")]
  MissingStack(String),

  #[error("cancelled while waiting on stack {0}")]
  Cancelled(String),

  #[error("in-place update refused, the change set has non-code changes: {}", render_changes(changes))]
  InPlaceRefused { changes: Vec<ResourceChange> },

  #[error("function code updates failed: {0}")]
  CodeUpdates(String),
}

fn render_events(events: &[String]) -> String {
  if events.is_empty() {
    String::new()
  } else {
    format!(": {}", events.join("; "))
  }
}

fn render_changes(changes: &[ResourceChange]) -> String {
  changes.iter().map(ToString::to_string).collect::<Vec<_>>().join(", ")
}

#[derive(Debug, Error)]
pub enum ProvisionError {
  #[error(transparent)]
  Package(#[from] PackageError),

  #[error(transparent)]
  Upload(#[from] UploadError),

  #[error(transparent)]
  Apply(#[from] ApplyError),

  #[error("stage {stage} failed: {}", render_failures(failures.iter().map(|(n, e)| (n.as_str(), e))))]
  Stage {
    stage: String,
    failures: Vec<(String, ProvisionError)>,
  },

  #[error("cancelled")]
  Cancelled,

  #[error("operation panicked: {0}")]
  Panicked(String),
}

impl ProvisionError {
  /// The operation errors behind a failed stage, or the error itself.
  pub fn causes(&self) -> Vec<&ProvisionError> {
    match self {
      ProvisionError::Stage { failures, .. } => failures.iter().flat_map(|(_, e)| e.causes()).collect(),
      other => vec![other],
    }
  }

  /// Name of the stage that failed, if any.
  pub fn stage(&self) -> Option<&str> {
    match self {
      ProvisionError::Stage { stage, .. } => Some(stage),
      _ => None,
    }
  }
}

/// What a provisioning run left behind.
#[derive(Debug, Clone, Default)]
pub struct ProvisionReport {
  pub stack_name: String,
  pub parameters: BTreeMap<String, String>,
  pub uploads: Vec<UploadedObject>,
  pub stack: Option<StackSummary>,
}

/// The default four-stage pipeline for `options`.
pub fn default_pipeline(options: &ProvisionOptions) -> Pipeline {
  let apply: Arc<dyn Operation> = if options.pipeline_trigger.is_some() {
    Arc::new(converge::PipelineHandoff)
  } else if options.in_place {
    Arc::new(inplace::InPlaceUpdate)
  } else {
    Arc::new(converge::FullConvergence)
  };
  Pipeline::new()
    .stage("preconditions", vec![Arc::new(preconditions::VerifyBucket) as Arc<dyn Operation>])
    .stage("upload", vec![Arc::new(upload::UploadArtifacts) as Arc<dyn Operation>])
    .stage("apply", vec![apply])
    .stage("describe", vec![Arc::new(describe::DescribeStack) as Arc<dyn Operation>])
}

/// Upload `build`'s artifacts and converge its stack.
pub async fn provision(
  build: BuildOutput,
  config: &BuildConfig,
  options: ProvisionOptions,
  clients: CloudClients,
  cancel: CancellationToken,
) -> Result<ProvisionReport, ProvisionError> {
  let pipeline = default_pipeline(&options);
  let ctx = Arc::new(ProvisionContext::new(build, config, options, clients, cancel));
  pipeline.run(ctx.clone()).await?;
  Ok(ctx.report().await)
}
