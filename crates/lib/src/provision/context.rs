//! State shared by the operations of one provisioning run.

use std::collections::BTreeMap;
use std::time::Duration;

use serde::Serialize;
use tokio::sync::Mutex;
use tokio_util::sync::CancellationToken;

use super::ProvisionReport;
use crate::cloud::{CloudClients, FunctionCode, StackRequest, StackSummary};
use crate::config::{BuildConfig, ProvisionOptions};
use crate::package::BuildOutput;
use crate::template::{Template, TemplateError};

const DEFAULT_STACK_TIMEOUT: Duration = Duration::from_secs(20 * 60);
const SLOW_STACK_TIMEOUT: Duration = Duration::from_secs(60 * 60);

/// Resource kinds whose create or update routinely takes longer than the
/// default stack timeout.
const SLOW_RESOURCE_TYPES: &[&str] = &["AWS::CloudFront::Distribution"];

/// An object written by the upload stage.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(rename_all = "camelCase")]
pub struct UploadedObject {
  pub bucket: String,
  pub key: String,
  pub version: Option<String>,
}

#[derive(Debug, Default)]
pub(crate) struct ProvisionState {
  pub versioned: bool,
  pub uploads: Vec<UploadedObject>,
  pub parameters: BTreeMap<String, String>,
  pub code: Option<FunctionCode>,
  /// Uploaded copy of the template, once the upload stage has run.
  pub template_url: Option<String>,
  pub stack: Option<StackSummary>,
}

pub struct ProvisionContext {
  pub stack_name: String,
  pub build: BuildOutput,
  pub config: BuildConfig,
  pub options: ProvisionOptions,
  pub clients: CloudClients,
  pub cancel: CancellationToken,
  /// Upper bound on waiting for one stack operation.
  pub stack_timeout: Duration,
  pub(crate) state: Mutex<ProvisionState>,
}

impl ProvisionContext {
  pub fn new(
    build: BuildOutput,
    config: &BuildConfig,
    options: ProvisionOptions,
    clients: CloudClients,
    cancel: CancellationToken,
  ) -> Self {
    Self {
      stack_name: build.service_name.clone(),
      stack_timeout: stack_timeout(&build.template),
      build,
      config: config.clone(),
      options,
      clients,
      cancel,
      state: Mutex::new(ProvisionState::default()),
    }
  }

  pub fn bucket(&self) -> &str {
    &self.options.bucket
  }

  pub(crate) async fn record_upload(&self, object: UploadedObject) {
    self.state.lock().await.uploads.push(object);
  }

  /// Set a stack parameter, if the template declares it.
  pub(crate) async fn set_parameter(&self, name: &str, value: impl Into<String>) {
    if self.build.template.parameters.contains_key(name) {
      self.state.lock().await.parameters.insert(name.to_string(), value.into());
    }
  }

  pub(crate) async fn parameters(&self) -> BTreeMap<String, String> {
    self.state.lock().await.parameters.clone()
  }

  /// The request that applies the built template with the current
  /// parameters.
  pub(crate) async fn stack_request(&self) -> Result<StackRequest, TemplateError> {
    let state = self.state.lock().await;
    Ok(StackRequest {
      stack_name: self.stack_name.clone(),
      template_body: self.build.template.to_json()?,
      template_url: state.template_url.clone(),
      parameters: state.parameters.clone(),
    })
  }

  pub async fn report(&self) -> ProvisionReport {
    let state = self.state.lock().await;
    ProvisionReport {
      stack_name: self.stack_name.clone(),
      parameters: state.parameters.clone(),
      uploads: state.uploads.clone(),
      stack: state.stack.clone(),
    }
  }
}

pub(crate) fn stack_timeout(template: &Template) -> Duration {
  if SLOW_RESOURCE_TYPES.iter().any(|t| template.contains_type(t)) {
    SLOW_STACK_TIMEOUT
  } else {
    DEFAULT_STACK_TIMEOUT
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::template::Resource;

  #[test]
  fn distributions_raise_the_stack_timeout() {
    let mut template = Template::new("t");
    assert_eq!(stack_timeout(&template), Duration::from_secs(1200));
    template
      .add_resource("Cdn", Resource::new("AWS::CloudFront::Distribution"))
      .unwrap();
    assert_eq!(stack_timeout(&template), Duration::from_secs(3600));
  }
}

#[cfg(test)]
pub(crate) mod testing {
  use std::sync::Arc;

  use tempfile::TempDir;
  use tokio_util::sync::CancellationToken;

  use super::*;
  use crate::cloud::memory::MemoryCloud;
  use crate::model::{BoxError, Function, Service};
  use crate::package::Artifact;
  use crate::runtime::Context;
  use crate::util::hash::hash_file;

  pub(crate) fn service() -> Service {
    let mut service = Service::new("svc", "test service").unwrap();
    service
      .add_function(Function::new("hello", |_c: Context| async move { Ok::<_, BoxError>("hi") }).unwrap())
      .unwrap();
    service
  }

  /// A synthesized single-function build with a code archive in `temp`.
  pub(crate) fn archive_build(temp: &TempDir) -> BuildOutput {
    let config = BuildConfig {
      build_id: "b1".to_string(),
      output_dir: temp.path().to_path_buf(),
      ..BuildConfig::default()
    };
    let template = crate::synth::synthesize(&service(), &config).unwrap();
    let path = config.code_archive_path("svc");
    std::fs::write(&path, b"code").unwrap();
    BuildOutput {
      service_name: "svc".to_string(),
      build_id: "b1".to_string(),
      template,
      template_path: config.template_path("svc"),
      artifact: Artifact::Archive {
        digest: hash_file(&path).unwrap(),
        path,
      },
      site_archive: None,
    }
  }

  pub(crate) fn context(cloud: &Arc<MemoryCloud>, build: BuildOutput, options: ProvisionOptions) -> ProvisionContext {
    let options = ProvisionOptions {
      tick: Duration::from_millis(1),
      ..options
    };
    ProvisionContext::new(
      build,
      &BuildConfig::default(),
      options,
      cloud.clients(),
      CancellationToken::new(),
    )
  }
}
