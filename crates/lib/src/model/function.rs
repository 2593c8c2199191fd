use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use super::custom::CustomResource;
use super::handler::{BoxError, Handler, IntoHandler};
use super::mapping::EventSourceMapping;
use super::permission::Permission;
use super::ModelError;
use crate::consts::{DEFAULT_MEMORY_MB, DEFAULT_TIMEOUT_SECS};
use crate::iam::{PolicyStatement, RoleDefinition};
use crate::naming::{function_full_name, logical_name, sanitize};
use crate::resource_ref::{ResourceRef, is_arn_shaped};
use crate::template::{Expr, Template};

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TracingMode {
  Active,
  PassThrough,
}

impl TracingMode {
  pub fn as_str(self) -> &'static str {
    match self {
      TracingMode::Active => "Active",
      TracingMode::PassThrough => "PassThrough",
    }
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct FunctionOptions {
  pub description: Option<String>,
  pub memory_mb: u32,
  pub timeout_secs: u32,
  pub environment: BTreeMap<String, Expr>,
  pub reserved_concurrency: Option<u32>,
  pub tracing: Option<TracingMode>,
}

impl Default for FunctionOptions {
  fn default() -> Self {
    Self {
      description: None,
      memory_mb: DEFAULT_MEMORY_MB,
      timeout_secs: DEFAULT_TIMEOUT_SECS,
      environment: BTreeMap::new(),
      reserved_concurrency: None,
      tracing: None,
    }
  }
}

/// Exactly one of a literal role or a synthesized role definition.
#[derive(Debug, Clone, PartialEq)]
pub enum RoleSpec {
  Arn(Expr),
  Definition(RoleDefinition),
}

/// Values available to a function decorator during synthesis.
pub struct DecoratorContext<'a> {
  pub service_name: &'a str,
  pub build_id: &'a str,
  pub function: &'a Function,
  pub function_logical_name: &'a str,
}

/// Synthesis-time hook attached to a single function.
pub trait FunctionDecorator: Send + Sync {
  fn decorate(&self, ctx: &DecoratorContext<'_>, template: &mut Template) -> Result<(), BoxError>;
}

impl<F> FunctionDecorator for F
where
  F: Fn(&DecoratorContext<'_>, &mut Template) -> Result<(), BoxError> + Send + Sync,
{
  fn decorate(&self, ctx: &DecoratorContext<'_>, template: &mut Template) -> Result<(), BoxError> {
    self(ctx, template)
  }
}

/// Values available to a service decorator during synthesis.
pub struct ServiceDecoratorContext<'a> {
  pub service_name: &'a str,
  pub build_id: &'a str,
  pub function_logical_names: &'a BTreeMap<String, String>,
}

/// Synthesis-time hook that runs once after every function is emitted.
pub trait ServiceDecorator: Send + Sync {
  fn decorate(&self, ctx: &ServiceDecoratorContext<'_>, template: &mut Template) -> Result<(), BoxError>;
}

impl<F> ServiceDecorator for F
where
  F: Fn(&ServiceDecoratorContext<'_>, &mut Template) -> Result<(), BoxError> + Send + Sync,
{
  fn decorate(&self, ctx: &ServiceDecoratorContext<'_>, template: &mut Template) -> Result<(), BoxError> {
    self(ctx, template)
  }
}

/// A registered handler and everything attached to it.
#[derive(Clone)]
pub struct Function {
  name: String,
  internal_name: String,
  handler: Arc<dyn Handler>,
  options: FunctionOptions,
  role: RoleSpec,
  permissions: Vec<Permission>,
  mappings: Vec<EventSourceMapping>,
  decorators: Vec<Arc<dyn FunctionDecorator>>,
  dependencies: Vec<String>,
  custom_resources: Vec<CustomResource>,
}

impl Function {
  /// Wrap `handler` under the user-visible `name`.
  ///
  /// Fails when the handler's signature is not one of the accepted shapes.
  pub fn new<Args>(name: &str, handler: impl IntoHandler<Args>) -> Result<Self, ModelError> {
    let internal_name = sanitize(name);
    if internal_name.is_empty() {
      return Err(ModelError::InvalidOptions {
        function: name.to_string(),
        reason: "name must contain alphanumeric characters".to_string(),
      });
    }
    let handler = handler.into_handler();
    handler.signature().validate(name)?;
    Ok(Self {
      name: name.to_string(),
      internal_name,
      handler,
      options: FunctionOptions::default(),
      role: RoleSpec::Definition(RoleDefinition::new()),
      permissions: Vec::new(),
      mappings: Vec::new(),
      decorators: Vec::new(),
      dependencies: Vec::new(),
      custom_resources: Vec::new(),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  /// Sanitized name used in provider-visible identifiers.
  pub fn internal_name(&self) -> &str {
    &self.internal_name
  }

  pub fn handler(&self) -> &Arc<dyn Handler> {
    &self.handler
  }

  pub fn options(&self) -> &FunctionOptions {
    &self.options
  }

  pub fn role(&self) -> &RoleSpec {
    &self.role
  }

  pub fn permissions(&self) -> &[Permission] {
    &self.permissions
  }

  pub fn mappings(&self) -> &[EventSourceMapping] {
    &self.mappings
  }

  pub fn decorators(&self) -> &[Arc<dyn FunctionDecorator>] {
    &self.decorators
  }

  pub fn dependencies(&self) -> &[String] {
    &self.dependencies
  }

  pub fn custom_resources(&self) -> &[CustomResource] {
    &self.custom_resources
  }

  pub fn logical_name(&self) -> String {
    logical_name(&self.internal_name, [self.name.as_str()])
  }

  pub fn role_logical_name(&self) -> String {
    logical_name("IAMRole", [self.name.as_str()])
  }

  pub fn full_name(&self, stack_name: &str) -> String {
    function_full_name(stack_name, &self.internal_name)
  }

  pub fn with_options(mut self, options: FunctionOptions) -> Self {
    self.options = options;
    self
  }

  pub fn description(mut self, description: impl Into<String>) -> Self {
    self.options.description = Some(description.into());
    self
  }

  pub fn memory(mut self, megabytes: u32) -> Self {
    self.options.memory_mb = megabytes;
    self
  }

  pub fn timeout(mut self, seconds: u32) -> Self {
    self.options.timeout_secs = seconds;
    self
  }

  pub fn env(mut self, key: impl Into<String>, value: impl Into<Expr>) -> Self {
    self.options.environment.insert(key.into(), value.into());
    self
  }

  pub fn role_arn(mut self, arn: impl Into<Expr>) -> Self {
    self.role = RoleSpec::Arn(arn.into());
    self
  }

  pub fn role_definition(mut self, definition: RoleDefinition) -> Self {
    self.role = RoleSpec::Definition(definition);
    self
  }

  /// Add a statement to the synthesized role. Ignored for literal roles.
  pub fn privilege(mut self, statement: PolicyStatement) -> Self {
    if let RoleSpec::Definition(def) = &mut self.role {
      def.privileges.push(statement);
    }
    self
  }

  pub fn permission(mut self, permission: impl Into<Permission>) -> Self {
    self.permissions.push(permission.into());
    self
  }

  pub fn mapping(mut self, mapping: EventSourceMapping) -> Self {
    self.mappings.push(mapping);
    self
  }

  pub fn decorator(mut self, decorator: impl FunctionDecorator + 'static) -> Self {
    self.decorators.push(Arc::new(decorator));
    self
  }

  /// Declare a template resource this function reads at runtime through
  /// discovery.
  pub fn depends_on(mut self, logical_name: impl Into<String>) -> Self {
    let name = logical_name.into();
    if !self.dependencies.contains(&name) {
      self.dependencies.push(name);
    }
    self
  }

  /// Attach a custom resource. The function gains a dependency on the
  /// resource's invocation so discovery exposes its outputs.
  pub fn custom_resource(mut self, resource: CustomResource) -> Self {
    let invocation = resource.invocation_logical_name(&self.name);
    self.custom_resources.push(resource);
    self.depends_on(invocation)
  }

  /// Structural checks that do not need the rest of the service.
  pub(crate) fn validate(&self) -> Result<(), ModelError> {
    if self.options.memory_mb < 128 || self.options.memory_mb > 10_240 {
      return Err(ModelError::InvalidOptions {
        function: self.name.clone(),
        reason: format!("memory {} MB outside 128..=10240", self.options.memory_mb),
      });
    }
    if self.options.timeout_secs == 0 || self.options.timeout_secs > 900 {
      return Err(ModelError::InvalidOptions {
        function: self.name.clone(),
        reason: format!("timeout {}s outside 1..=900", self.options.timeout_secs),
      });
    }
    if let RoleSpec::Arn(arn) = &self.role
      && let Expr::Str(literal) = arn
      && !is_arn_shaped(literal)
    {
      return Err(ModelError::InvalidRole {
        function: self.name.clone(),
        reason: format!("{literal:?} is not an ARN"),
      });
    }
    for permission in &self.permissions {
      permission.validate().map_err(|reason| ModelError::InvalidPermission {
        function: self.name.clone(),
        reason,
      })?;
    }
    for resource in &self.custom_resources {
      resource.validate()?;
    }
    for mapping in &self.mappings {
      if let Some(r) = ResourceRef::from_expr(&mapping.source)
        && r.is_literal()
        && !is_arn_shaped(&r.resource_name)
      {
        return Err(ModelError::InvalidMapping {
          function: self.name.clone(),
          reason: format!("{} is not an ARN", r.resource_name),
        });
      }
      if mapping.batch_size == Some(0) {
        return Err(ModelError::InvalidMapping {
          function: self.name.clone(),
          reason: "batch size must be positive".to_string(),
        });
      }
    }
    Ok(())
  }
}

impl fmt::Debug for Function {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Function")
      .field("name", &self.name)
      .field("internal_name", &self.internal_name)
      .field("signature", self.handler.signature())
      .field("options", &self.options)
      .field("permissions", &self.permissions.len())
      .field("mappings", &self.mappings.len())
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::model::{BoxError, Event, S3Permission};
  use crate::runtime::Context;

  type Res<T> = Result<T, BoxError>;

  #[test]
  fn new_sanitizes_and_names_resources_stably() {
    let f = Function::new("handlers::hello-world", || async { Res::Ok(()) }).unwrap();
    assert_eq!(f.internal_name(), "handlers_hello_world");
    assert_eq!(f.full_name("svc"), "svc_handlers_hello_world");
    assert_eq!(f.logical_name(), f.clone().logical_name());
    assert!(f.logical_name().starts_with("handlershelloworld"));
  }

  #[test]
  fn literal_role_must_be_an_arn() {
    let f = Function::new("f", |_e: Event<serde_json::Value>| async { Res::Ok(()) })
      .unwrap()
      .role_arn("not-an-arn");
    assert!(matches!(f.validate(), Err(ModelError::InvalidRole { .. })));

    let f = Function::new("f", |_c: Context| async { Res::Ok(()) })
      .unwrap()
      .role_arn("arn:aws:iam::123456789012:role/exec");
    f.validate().unwrap();
  }

  #[test]
  fn invalid_permission_is_reported_with_function_name() {
    let f = Function::new("uploader", || async { Res::Ok(()) })
      .unwrap()
      .permission(S3Permission::new("bucket-without-arn", ["s3:ObjectCreated:*"]));
    let err = f.validate().unwrap_err();
    assert!(err.to_string().contains("uploader"));
  }

  #[test]
  fn options_are_range_checked() {
    let f = Function::new("f", || async { Res::Ok(()) }).unwrap().memory(64);
    assert!(f.validate().is_err());
    let f = Function::new("f", || async { Res::Ok(()) }).unwrap().timeout(901);
    assert!(f.validate().is_err());
  }
}
