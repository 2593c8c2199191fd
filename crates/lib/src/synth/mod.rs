//! Template synthesis.
//!
//! Walks a frozen [`Service`] and emits every resource it needs:
//!
//! 1. function roles and functions
//! 2. permissions, configurators, event source mappings, custom resources
//! 3. gateway APIs and the static site
//! 4. user decorators
//! 5. annotation passes (stream statements, pipeline environment, discovery)
//! 6. dependency stitching and graph validation
//!
//! Synthesis is offline. It fails before anything is uploaded.

mod annotate;
mod configurator;
mod custom;
mod function;
mod gateway;
mod graph;
mod iam;
mod permissions;
mod site;

use std::collections::BTreeMap;

use thiserror::Error;
use tracing::{debug, info};

pub use graph::deployment_order;
pub use permissions::{ExportContext, export_permission};

use crate::config::BuildConfig;
use crate::consts::{OUTPUT_BUILD_ID, OUTPUT_TEMPLATE_CREATION_TIME};
use crate::model::{DecoratorContext, Service, ServiceDecoratorContext};
use crate::template::{BuildMetadata, Output, Template, TemplateError};
use crate::util::hash::HashError;

#[derive(Debug, Error)]
pub enum SynthError {
  #[error(transparent)]
  Template(#[from] TemplateError),

  #[error("{resource} references {reference}, which is not declared in the template")]
  UnresolvedReference { resource: String, reference: String },

  #[error("dependency cycle detected at {0}")]
  CycleDetected(String),

  #[error("no configurator handles {0} triggers")]
  MissingConfigurator(String),

  #[error("role {0} is not declared in the template")]
  MissingRole(String),

  #[error("code pipeline variable {0:?} must be alphanumeric")]
  InvalidPipelineVariable(String),

  #[error("function name {name} exceeds 64 characters")]
  FunctionNameTooLong { name: String },

  #[error("decorator for {owner} failed: {message}")]
  Decorator { owner: String, message: String },

  #[error("static site {path}: {source}")]
  Site {
    path: String,
    #[source]
    source: HashError,
  },
}

/// Emit the provider template for `service`.
pub fn synthesize(service: &Service, config: &BuildConfig) -> Result<Template, SynthError> {
  info!(service = service.name(), build_id = %config.build_id, "synthesizing template");

  let description = if service.description().is_empty() {
    format!("{} service", service.name())
  } else {
    service.description().to_string()
  };
  let mut template = Template::new(description);
  function::add_code_parameters(&mut template, config)?;

  let mut logical_names = BTreeMap::new();
  for f in service.functions() {
    let role = function::emit_role(&mut template, f)?;
    let logical = function::emit_function(&mut template, service.name(), config, f, role)?;
    debug!(function = f.name(), logical = %logical, "emitted function");
    logical_names.insert(f.name().to_string(), logical);
  }

  for f in service.functions() {
    let logical = &logical_names[f.name()];
    let ctx = ExportContext {
      service_name: service.name(),
      config,
      function: f,
      function_logical_name: logical,
    };
    for permission in f.permissions() {
      export_permission(&ctx, permission, &mut template)?;
    }
    for mapping in f.mappings() {
      function::emit_mapping(&mut template, f, logical, mapping)?;
    }
    for resource in f.custom_resources() {
      custom::emit(&mut template, config, f, resource)?;
    }
  }

  if let Some(api) = service.rest_api() {
    gateway::emit_rest_api(&mut template, service.name(), config, api, &logical_names)?;
  }
  if let Some(api) = service.websocket_api() {
    gateway::emit_websocket_api(&mut template, config, api, &logical_names)?;
  }
  if let Some(site) = service.site() {
    site::emit(&mut template, service.name(), config, site)?;
  }

  for f in service.functions() {
    let logical = &logical_names[f.name()];
    let ctx = DecoratorContext {
      service_name: service.name(),
      build_id: &config.build_id,
      function: f,
      function_logical_name: logical,
    };
    for decorator in f.decorators() {
      decorator
        .decorate(&ctx, &mut template)
        .map_err(|e| SynthError::Decorator {
          owner: f.name().to_string(),
          message: e.to_string(),
        })?;
    }
  }
  let service_ctx = ServiceDecoratorContext {
    service_name: service.name(),
    build_id: &config.build_id,
    function_logical_names: &logical_names,
  };
  for decorator in service.decorators() {
    decorator
      .decorate(&service_ctx, &mut template)
      .map_err(|e| SynthError::Decorator {
        owner: service.name().to_string(),
        message: e.to_string(),
      })?;
  }

  annotate::event_source_mappings(&mut template, service)?;
  annotate::pipeline_environment(&mut template, config, service, &logical_names)?;
  annotate::discovery(&mut template, service, &logical_names)?;

  template.add_output(
    OUTPUT_TEMPLATE_CREATION_TIME,
    Output::new("Template creation time", config.created_at.to_rfc3339()),
  )?;
  template.add_output(OUTPUT_BUILD_ID, Output::new("Build identifier", config.build_id.as_str()))?;
  template.set_build_metadata(&BuildMetadata {
    service_name: service.name().to_string(),
    build_id: config.build_id.clone(),
    artifact_s3_bucket: config.bucket.clone(),
    ..BuildMetadata::default()
  })?;

  graph::stitch(&mut template)?;

  info!(
    service = service.name(),
    resources = template.resources.len(),
    outputs = template.outputs.len(),
    "template synthesized"
  );
  Ok(template)
}

#[cfg(test)]
mod tests {
  use serde_json::json;

  use super::*;
  use crate::model::{BoxError, EventBridgePermission, EventsRule, Function, KeyFilter, RestApi, S3Permission, Stage};
  use crate::runtime::Context;
  use crate::template::Expr;

  type Res<T> = Result<T, BoxError>;

  fn service() -> Service {
    let mut service = Service::new("svc", "").unwrap();
    service
      .add_function(
        Function::new("getItem", |_c: Context| async { Res::Ok(()) })
          .unwrap()
          .permission(
            S3Permission::new("arn:aws:s3:::b-xyz", ["s3:ObjectCreated:*"]).with_filter(KeyFilter::suffix(".jpg")),
          )
          .permission(EventBridgePermission::new(EventsRule::pattern(json!({"source": ["orders"]})))),
      )
      .unwrap();
    let mut api = RestApi::new("items", Some(Stage::new("v1")));
    api.resource("/items/{id}", "getItem").unwrap().method("GET").unwrap();
    service.set_rest_api(api).unwrap();
    service
  }

  fn config(build_id: &str) -> BuildConfig {
    BuildConfig {
      build_id: build_id.to_string(),
      bucket: Some("art".to_string()),
      ..BuildConfig::default()
    }
  }

  #[test]
  fn one_config_synthesizes_one_template() {
    let config = config("b1");
    let first = synthesize(&service(), &config).unwrap();
    let second = synthesize(&service(), &config).unwrap();
    assert_eq!(first.to_json().unwrap(), second.to_json().unwrap());
    assert_eq!(
      first.outputs[OUTPUT_TEMPLATE_CREATION_TIME].value,
      Expr::str(config.created_at.to_rfc3339())
    );
  }

  #[test]
  fn rebuilding_changes_only_build_identity() {
    let first = config("b1");
    let second = BuildConfig {
      build_id: "b2".to_string(),
      ..first.clone()
    };
    let a = synthesize(&service(), &first).unwrap();
    let b = synthesize(&service(), &second).unwrap();

    assert_eq!(a.resources, b.resources);
    assert_eq!(a.parameters, b.parameters);
    let changed: Vec<_> = a
      .outputs
      .iter()
      .filter(|(name, output)| b.outputs.get(*name) != Some(*output))
      .map(|(name, _)| name.as_str())
      .collect();
    assert_eq!(changed, [OUTPUT_BUILD_ID]);
  }
}
