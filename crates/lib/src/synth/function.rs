//! Function, role and event source mapping emission.

use std::collections::BTreeMap;

use super::{SynthError, iam};
use crate::config::{ArtifactKind, BuildConfig};
use crate::consts::{
  CONDITION_HAS_CODE_VERSION, ENV_STACK_ID, ENV_STACK_NAME, LAMBDA_HANDLER, LAMBDA_RUNTIME, PARAM_ARTIFACT_BUCKET,
  PARAM_CODE_KEY, PARAM_CODE_VERSION, PARAM_IMAGE_URI,
};
use crate::model::{EventSourceMapping, Function, RoleSpec};
use crate::naming::logical_name;
use crate::resource_ref::source_expr;
use crate::template::{Expr, Parameter, Resource, Template};

const MAX_FUNCTION_NAME: usize = 64;

/// Parameters the upload stage fills in with the artifact location.
pub(super) fn add_code_parameters(template: &mut Template, config: &BuildConfig) -> Result<(), SynthError> {
  template.add_parameter(
    PARAM_ARTIFACT_BUCKET,
    Parameter::string("Bucket holding the build artifacts").with_default(config.bucket.clone().unwrap_or_default()),
  )?;
  match config.artifact_kind {
    ArtifactKind::Archive => {
      template.add_parameter(PARAM_CODE_KEY, Parameter::string("Object key of the code archive"))?;
      template.add_parameter(
        PARAM_CODE_VERSION,
        Parameter::string("Object version of the code archive").with_default(""),
      )?;
      template.add_condition(
        CONDITION_HAS_CODE_VERSION,
        Expr::not(Expr::equals(Expr::reference(PARAM_CODE_VERSION), Expr::str(""))),
      );
    }
    ArtifactKind::Image => {
      template.add_parameter(PARAM_IMAGE_URI, Parameter::string("Image URI of the dispatcher"))?;
    }
  }
  Ok(())
}

/// A function resource running the dispatcher binary.
///
/// Every function in the stack shares the same code location; only the
/// configuration around it differs.
pub(super) fn dispatcher_function(config: &BuildConfig, role: Expr, memory_mb: u32, timeout_secs: u32) -> Resource {
  let mut resource = Resource::new("AWS::Lambda::Function")
    .prop("Role", role)
    .prop("MemorySize", memory_mb)
    .prop("Timeout", timeout_secs)
    .prop("Architectures", Expr::strings([config.architecture()]));
  match config.artifact_kind {
    ArtifactKind::Archive => {
      resource.set_prop("Handler", LAMBDA_HANDLER);
      resource.set_prop("Runtime", LAMBDA_RUNTIME);
      resource.set_prop(
        "Code",
        Expr::map([
          ("S3Bucket", Expr::reference(PARAM_ARTIFACT_BUCKET)),
          ("S3Key", Expr::reference(PARAM_CODE_KEY)),
          (
            "S3ObjectVersion",
            Expr::if_(CONDITION_HAS_CODE_VERSION, Expr::reference(PARAM_CODE_VERSION), Expr::no_value()),
          ),
        ]),
      );
    }
    ArtifactKind::Image => {
      resource.set_prop("PackageType", "Image");
      resource.set_prop("Code", Expr::map([("ImageUri", Expr::reference(PARAM_IMAGE_URI))]));
    }
  }
  resource
}

/// Build the `Environment` property from variables plus the stack identity.
pub(super) fn environment(variables: &BTreeMap<String, Expr>) -> Expr {
  let mut all = variables.clone();
  all.insert(ENV_STACK_NAME.to_string(), Expr::stack_name());
  all.insert(ENV_STACK_ID.to_string(), Expr::stack_id());
  Expr::map([("Variables", Expr::Map(all))])
}

/// Emit the function's role, or return the literal role ARN.
pub(super) fn emit_role(template: &mut Template, function: &Function) -> Result<Expr, SynthError> {
  match function.role() {
    RoleSpec::Arn(arn) => Ok(arn.clone()),
    RoleSpec::Definition(definition) => {
      let logical = function.role_logical_name();
      iam::emit_definition(template, &logical, definition)?;
      Ok(Expr::get_att(logical, "Arn"))
    }
  }
}

pub(super) fn emit_function(
  template: &mut Template,
  service_name: &str,
  config: &BuildConfig,
  function: &Function,
  role: Expr,
) -> Result<String, SynthError> {
  let full_name = function.full_name(service_name);
  if full_name.len() > MAX_FUNCTION_NAME {
    return Err(SynthError::FunctionNameTooLong { name: full_name });
  }

  let options = function.options();
  let mut resource = dispatcher_function(config, role, options.memory_mb, options.timeout_secs)
    .prop("FunctionName", full_name)
    .prop("Environment", environment(&options.environment));
  if let Some(description) = &options.description {
    resource.set_prop("Description", description.as_str());
  }
  if let Some(reserved) = options.reserved_concurrency {
    resource.set_prop("ReservedConcurrentExecutions", reserved);
  }
  if let Some(mode) = options.tracing {
    resource.set_prop("TracingConfig", Expr::map([("Mode", Expr::str(mode.as_str()))]));
  }

  let logical = function.logical_name();
  template.add_resource(logical.clone(), resource)?;
  Ok(logical)
}

/// Emit an event source mapping. Role statements for the source are added
/// later by the annotation pass, once every resource is in the template.
pub(super) fn emit_mapping(
  template: &mut Template,
  function: &Function,
  function_logical: &str,
  mapping: &EventSourceMapping,
) -> Result<String, SynthError> {
  let source = source_expr(&mapping.source);
  let logical = logical_name("LambdaES", [function_logical.to_string(), source.to_json().to_string()]);

  let mut resource = Resource::new("AWS::Lambda::EventSourceMapping")
    .prop("EventSourceArn", source)
    .prop("FunctionName", Expr::reference(function_logical))
    .prop("Enabled", mapping.enabled);
  if let Some(size) = mapping.batch_size {
    resource.set_prop("BatchSize", size);
  }
  if let Some(position) = mapping.starting_position {
    resource.set_prop("StartingPosition", position.as_str());
  }
  // The poller checks the role when the mapping is created.
  if let RoleSpec::Definition(_) = function.role() {
    resource = resource.depends_on(function.role_logical_name());
  }

  template.ensure_resource(logical.clone(), resource)?;
  Ok(logical)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{BoxError, StartingPosition};
  use crate::runtime::Context;

  type Res<T> = Result<T, BoxError>;

  fn hello() -> Function {
    Function::new("hello", |_c: Context| async { Res::Ok("hi".to_string()) })
      .unwrap()
      .memory(256)
      .env("GREETING", "hi")
  }

  #[test]
  fn archive_functions_reference_code_parameters() {
    let config = BuildConfig::default();
    let mut t = Template::new("t");
    add_code_parameters(&mut t, &config).unwrap();
    let f = hello();
    let role = emit_role(&mut t, &f).unwrap();
    let logical = emit_function(&mut t, "svc", &config, &f, role).unwrap();

    let json = serde_json::to_value(&t.resources[&logical]).unwrap();
    let props = &json["Properties"];
    assert_eq!(props["FunctionName"], "svc_hello");
    assert_eq!(props["MemorySize"], 256);
    assert_eq!(props["Runtime"], LAMBDA_RUNTIME);
    assert_eq!(props["Code"]["S3Key"]["Ref"], PARAM_CODE_KEY);
    assert_eq!(props["Code"]["S3ObjectVersion"]["Fn::If"][0], CONDITION_HAS_CODE_VERSION);
    assert_eq!(props["Environment"]["Variables"]["GREETING"], "hi");
    assert_eq!(props["Environment"]["Variables"][ENV_STACK_NAME]["Ref"], "AWS::StackName");
    assert_eq!(props["Role"]["Fn::GetAtt"][0], f.role_logical_name());
    assert!(t.conditions.contains_key(CONDITION_HAS_CODE_VERSION));
  }

  #[test]
  fn image_functions_use_the_image_uri() {
    let config = BuildConfig {
      artifact_kind: ArtifactKind::Image,
      ..BuildConfig::default()
    };
    let mut t = Template::new("t");
    add_code_parameters(&mut t, &config).unwrap();
    let resource = dispatcher_function(&config, Expr::str("arn:aws:iam::1:role/r"), 128, 3);
    let json = serde_json::to_value(&resource).unwrap();
    assert_eq!(json["Properties"]["PackageType"], "Image");
    assert_eq!(json["Properties"]["Code"]["ImageUri"]["Ref"], PARAM_IMAGE_URI);
    assert!(json["Properties"].get("Runtime").is_none());
    assert!(!t.parameters.contains_key(PARAM_CODE_KEY));
  }

  #[test]
  fn literal_roles_emit_no_role_resource() {
    let mut t = Template::new("t");
    let f = hello().role_arn("arn:aws:iam::123456789012:role/exec");
    let role = emit_role(&mut t, &f).unwrap();
    assert_eq!(role, Expr::str("arn:aws:iam::123456789012:role/exec"));
    assert!(t.resources.is_empty());
  }

  #[test]
  fn long_function_names_are_rejected() {
    let config = BuildConfig::default();
    let mut t = Template::new("t");
    let f = hello();
    let stack = "s".repeat(60);
    let err = emit_function(&mut t, &stack, &config, &f, Expr::str("arn:aws:iam::1:role/r")).unwrap_err();
    assert!(matches!(err, SynthError::FunctionNameTooLong { .. }));
  }

  #[test]
  fn mappings_are_stable_and_depend_on_the_role() {
    let mut t = Template::new("t");
    let f = hello();
    emit_role(&mut t, &f).unwrap();
    let mapping = EventSourceMapping::new(Expr::get_att("Table", "StreamArn"))
      .batch_size(10)
      .starting_position(StartingPosition::TrimHorizon);
    let a = emit_mapping(&mut t, &f, "HelloFn", &mapping).unwrap();
    let b = emit_mapping(&mut t, &f, "HelloFn", &mapping).unwrap();
    assert_eq!(a, b);
    let esm = &t.resources[&a];
    assert!(esm.depends_on.contains(&f.role_logical_name()));
    assert_eq!(esm.get_prop("StartingPosition"), Some(&Expr::str("TRIM_HORIZON")));
  }
}
