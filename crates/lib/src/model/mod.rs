//! The in-memory service description.
//!
//! A [`Service`] is built additively in the user program and frozen once
//! synthesis starts. Every structural check runs at registration time so a
//! malformed model never reaches the pipeline.

mod custom;
mod function;
mod gateway;
mod handler;
mod mapping;
mod permission;
mod site;

use std::collections::BTreeMap;
use std::sync::Arc;

use thiserror::Error;

pub use custom::{CustomResource, CustomResourceHandler};
pub use function::{
  DecoratorContext, Function, FunctionDecorator, FunctionOptions, RoleSpec, ServiceDecorator, ServiceDecoratorContext,
  TracingMode,
};
pub use gateway::{ApiResource, CorsOptions, Method, ResourceBinding, RestApi, Route, Stage, WebSocketApi};
pub use handler::{
  BoxError, Event, FnHandler, FromInvocation, Handler, HandlerError, HandlerFuture, IntoHandler, Param, Return,
  Signature,
};
pub use mapping::{EventSourceMapping, StartingPosition};
pub use permission::{
  CloudWatchEventsPermission, CloudWatchLogsPermission, CodeCommitPermission, EventBridgePermission, EventsRule,
  KeyFilter, LogFilter, MessageBodyStorage, Permission, ReceiptRule, RuleTarget, S3Permission, SesInvocationType,
  SesPermission, SnsPermission, TlsPolicy,
};
pub use site::StaticSite;

use crate::naming::sanitize;
use crate::package::ArchiveHook;
use crate::runtime::Interceptor;

#[derive(Debug, Error)]
pub enum ModelError {
  #[error("invalid service name {name:?}: {reason}")]
  InvalidServiceName { name: String, reason: String },

  #[error("duplicate function name {name:?} (sanitized: {sanitized})")]
  DuplicateFunctionName { name: String, sanitized: String },

  #[error("function {function:?} has an unsupported handler signature: {reason}")]
  InvalidSignature { function: String, reason: String },

  #[error("function {function:?} has an invalid role: {reason}")]
  InvalidRole { function: String, reason: String },

  #[error("function {function:?} has an invalid permission: {reason}")]
  InvalidPermission { function: String, reason: String },

  #[error("function {function:?} has an invalid event source mapping: {reason}")]
  InvalidMapping { function: String, reason: String },

  #[error("function {function:?} has invalid options: {reason}")]
  InvalidOptions { function: String, reason: String },

  #[error("path {path} already defined for function {function:?}")]
  PathCollision { path: String, function: String },

  #[error("method {method} already defined for path {path}")]
  MethodCollision { method: String, path: String },

  #[error("route {route:?} already defined")]
  RouteCollision { route: String },

  #[error("custom resource {resource_type} is attached to both {first:?} and {second:?}")]
  CustomResourceReused {
    resource_type: String,
    first: String,
    second: String,
  },

  #[error("custom resource type {resource_type:?} is invalid: {reason}")]
  InvalidCustomResource { resource_type: String, reason: String },

  #[error("{context} references unknown function {function:?}")]
  UnknownFunction { context: String, function: String },
}

/// A complete service: its functions and auxiliary surfaces.
pub struct Service {
  name: String,
  description: String,
  functions: Vec<Function>,
  rest_api: Option<RestApi>,
  websocket_api: Option<WebSocketApi>,
  site: Option<StaticSite>,
  decorators: Vec<Arc<dyn ServiceDecorator>>,
  archive_hooks: Vec<Arc<dyn ArchiveHook>>,
  interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Service {
  /// Create an empty service. `name` doubles as the stack name.
  pub fn new(name: &str, description: &str) -> Result<Self, ModelError> {
    validate_stack_name(name)?;
    Ok(Self {
      name: name.to_string(),
      description: description.to_string(),
      functions: Vec::new(),
      rest_api: None,
      websocket_api: None,
      site: None,
      decorators: Vec::new(),
      archive_hooks: Vec::new(),
      interceptors: Vec::new(),
    })
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn description(&self) -> &str {
    &self.description
  }

  pub fn functions(&self) -> &[Function] {
    &self.functions
  }

  pub fn function(&self, name: &str) -> Option<&Function> {
    self.functions.iter().find(|f| f.name() == name)
  }

  pub fn rest_api(&self) -> Option<&RestApi> {
    self.rest_api.as_ref()
  }

  pub fn websocket_api(&self) -> Option<&WebSocketApi> {
    self.websocket_api.as_ref()
  }

  pub fn site(&self) -> Option<&StaticSite> {
    self.site.as_ref()
  }

  pub fn decorators(&self) -> &[Arc<dyn ServiceDecorator>] {
    &self.decorators
  }

  pub fn archive_hooks(&self) -> &[Arc<dyn ArchiveHook>] {
    &self.archive_hooks
  }

  pub fn interceptors(&self) -> &[Arc<dyn Interceptor>] {
    &self.interceptors
  }

  /// Register a function after validating it against the rest of the model.
  pub fn add_function(&mut self, function: Function) -> Result<(), ModelError> {
    let sanitized = function.internal_name().to_string();
    if let Some(existing) = self
      .functions
      .iter()
      .find(|f| f.name() == function.name() || f.internal_name() == sanitized)
    {
      return Err(ModelError::DuplicateFunctionName {
        name: function.name().to_string(),
        sanitized: existing.internal_name().to_string(),
      });
    }
    function.validate()?;

    let mut owners: BTreeMap<&str, &str> = BTreeMap::new();
    for f in &self.functions {
      for cr in f.custom_resources() {
        owners.insert(cr.resource_type(), f.name());
      }
    }
    let mut seen_here = Vec::new();
    for cr in function.custom_resources() {
      if let Some(first) = owners.get(cr.resource_type()) {
        return Err(ModelError::CustomResourceReused {
          resource_type: cr.resource_type().to_string(),
          first: first.to_string(),
          second: function.name().to_string(),
        });
      }
      if seen_here.contains(&cr.resource_type()) {
        return Err(ModelError::CustomResourceReused {
          resource_type: cr.resource_type().to_string(),
          first: function.name().to_string(),
          second: function.name().to_string(),
        });
      }
      seen_here.push(cr.resource_type());
    }

    tracing::debug!(function = function.name(), signature = %function.handler().signature(), "registered function");
    self.functions.push(function);
    Ok(())
  }

  pub fn set_rest_api(&mut self, api: RestApi) -> Result<(), ModelError> {
    for resource in api.resources() {
      self.require_function(&format!("API resource {}", resource.path()), resource.function())?;
    }
    self.rest_api = Some(api);
    Ok(())
  }

  pub fn set_websocket_api(&mut self, api: WebSocketApi) -> Result<(), ModelError> {
    for route in api.routes() {
      self.require_function(&format!("websocket route {}", route.route_key()), route.function())?;
    }
    self.websocket_api = Some(api);
    Ok(())
  }

  pub fn set_site(&mut self, site: StaticSite) {
    self.site = Some(site);
  }

  pub fn add_decorator(&mut self, decorator: impl ServiceDecorator + 'static) {
    self.decorators.push(Arc::new(decorator));
  }

  pub fn add_archive_hook(&mut self, hook: impl ArchiveHook + 'static) {
    self.archive_hooks.push(Arc::new(hook));
  }

  pub fn add_interceptor(&mut self, interceptor: impl Interceptor + 'static) {
    self.interceptors.push(Arc::new(interceptor));
  }

  fn require_function(&self, context: &str, name: &str) -> Result<(), ModelError> {
    if self.function(name).is_none() {
      return Err(ModelError::UnknownFunction {
        context: context.to_string(),
        function: name.to_string(),
      });
    }
    Ok(())
  }
}

impl std::fmt::Debug for Service {
  fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
    f.debug_struct("Service")
      .field("name", &self.name)
      .field("functions", &self.functions.iter().map(Function::name).collect::<Vec<_>>())
      .field("rest_api", &self.rest_api.as_ref().map(RestApi::name))
      .field("site", &self.site.is_some())
      .finish()
  }
}

fn validate_stack_name(name: &str) -> Result<(), ModelError> {
  let invalid = |reason: &str| ModelError::InvalidServiceName {
    name: name.to_string(),
    reason: reason.to_string(),
  };
  let mut chars = name.chars();
  match chars.next() {
    None => return Err(invalid("must not be empty")),
    Some(c) if !c.is_ascii_alphabetic() => return Err(invalid("must start with a letter")),
    _ => {}
  }
  if name.len() > 128 {
    return Err(invalid("must be at most 128 characters"));
  }
  if !chars.all(|c| c.is_ascii_alphanumeric() || c == '-') {
    return Err(invalid("may only contain letters, digits and hyphens"));
  }
  if sanitize(name).is_empty() {
    return Err(invalid("must contain alphanumeric characters"));
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::runtime::Context;

  type Res<T> = Result<T, BoxError>;

  fn hello(name: &str) -> Function {
    Function::new(name, |_ctx: Context| async { Res::Ok("hi".to_string()) }).unwrap()
  }

  #[test]
  fn service_name_must_be_a_valid_stack_name() {
    assert!(Service::new("my-service", "").is_ok());
    assert!(Service::new("", "").is_err());
    assert!(Service::new("9lives", "").is_err());
    assert!(Service::new("has_underscore", "").is_err());
  }

  #[test]
  fn duplicate_names_are_rejected() {
    let mut svc = Service::new("svc", "").unwrap();
    svc.add_function(hello("hello")).unwrap();
    let err = svc.add_function(hello("hello")).unwrap_err();
    assert!(matches!(err, ModelError::DuplicateFunctionName { .. }));
  }

  #[test]
  fn sanitized_collisions_are_rejected() {
    let mut svc = Service::new("svc", "").unwrap();
    svc.add_function(hello("api::get")).unwrap();
    let err = svc.add_function(hello("api.get")).unwrap_err();
    match err {
      ModelError::DuplicateFunctionName { name, sanitized } => {
        assert_eq!(name, "api.get");
        assert_eq!(sanitized, "api_get");
      }
      other => panic!("unexpected error: {other}"),
    }
  }

  #[test]
  fn api_must_reference_registered_functions() {
    let mut svc = Service::new("svc", "").unwrap();
    svc.add_function(hello("getItem")).unwrap();
    let mut api = RestApi::new("api", Some(Stage::new("v1")));
    api.resource("/items", "missing").unwrap().method("GET").unwrap();
    let err = svc.set_rest_api(api).unwrap_err();
    assert!(matches!(err, ModelError::UnknownFunction { .. }));
  }
}
