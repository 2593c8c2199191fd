//! User-defined custom resources.

use std::collections::BTreeMap;
use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;

use super::ModelError;
use super::handler::BoxError;
use crate::consts::CUSTOM_RESOURCE_PREFIX;
use crate::iam::PolicyStatement;
use crate::naming::logical_name;
use crate::runtime::cfn::{CustomResourceRequest, ResourceOutcome};
use crate::template::Expr;

/// A provisioning-time operation run while the stack converges.
///
/// The same binary serves these requests; the dispatcher selects the handler
/// by its resource type.
#[async_trait]
pub trait CustomResourceHandler: Send + Sync {
  /// Provider resource type, e.g. `Custom::HelloWorld`.
  fn resource_type(&self) -> &str;

  /// Statements added to the handler function's role.
  fn privileges(&self) -> Vec<PolicyStatement> {
    Vec::new()
  }

  async fn create(&self, request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError>;

  async fn update(&self, request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
    self.create(request).await
  }

  async fn delete(&self, _request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
    Ok(ResourceOutcome::default())
  }
}

/// A custom resource attached to a function, with the properties passed to
/// its handler.
#[derive(Clone)]
pub struct CustomResource {
  handler: Arc<dyn CustomResourceHandler>,
  properties: BTreeMap<String, Expr>,
}

impl CustomResource {
  pub fn new(handler: impl CustomResourceHandler + 'static) -> Self {
    Self::from_arc(Arc::new(handler))
  }

  pub fn from_arc(handler: Arc<dyn CustomResourceHandler>) -> Self {
    Self {
      handler,
      properties: BTreeMap::new(),
    }
  }

  pub fn property(mut self, key: impl Into<String>, value: impl Into<Expr>) -> Self {
    self.properties.insert(key.into(), value.into());
    self
  }

  pub fn resource_type(&self) -> &str {
    self.handler.resource_type()
  }

  pub fn handler(&self) -> &Arc<dyn CustomResourceHandler> {
    &self.handler
  }

  pub fn properties(&self) -> &BTreeMap<String, Expr> {
    &self.properties
  }

  /// Logical name of the function serving this resource type.
  pub fn handler_logical_name(&self) -> String {
    logical_name("CustomResourceHandler", [self.resource_type()])
  }

  /// Logical name of the resource invocation owned by `owner`.
  pub fn invocation_logical_name(&self, owner: &str) -> String {
    logical_name("CustomResource", [self.resource_type(), owner])
  }

  pub(crate) fn validate(&self) -> Result<(), ModelError> {
    let resource_type = self.resource_type();
    let invalid = |reason: &str| ModelError::InvalidCustomResource {
      resource_type: resource_type.to_string(),
      reason: reason.to_string(),
    };
    let Some(name) = resource_type.strip_prefix("Custom::") else {
      return Err(invalid("must start with Custom::"));
    };
    if name.is_empty() || name.len() > 60 {
      return Err(invalid("name must be 1 to 60 characters"));
    }
    if !name.chars().all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '@' | '-')) {
      return Err(invalid("name may only contain letters, digits, _, @ and -"));
    }
    if resource_type.starts_with(CUSTOM_RESOURCE_PREFIX) {
      return Err(invalid("the prefix is reserved for built-in configurators"));
    }
    Ok(())
  }
}

impl fmt::Debug for CustomResource {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("CustomResource")
      .field("resource_type", &self.resource_type())
      .field("properties", &self.properties)
      .finish()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  struct Named(&'static str);

  #[async_trait]
  impl CustomResourceHandler for Named {
    fn resource_type(&self) -> &str {
      self.0
    }

    async fn create(&self, _request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
      Ok(ResourceOutcome::default())
    }
  }

  #[test]
  fn resource_types_are_validated() {
    CustomResource::new(Named("Custom::HelloWorld")).validate().unwrap();
    assert!(CustomResource::new(Named("HelloWorld")).validate().is_err());
    assert!(CustomResource::new(Named("Custom::Hello World")).validate().is_err());
    assert!(CustomResource::new(Named("Custom::CirrusThing")).validate().is_err());
  }

  #[test]
  fn invocation_names_depend_on_owner() {
    let cr = CustomResource::new(Named("Custom::HelloWorld"));
    assert_eq!(cr.invocation_logical_name("a"), cr.invocation_logical_name("a"));
    assert_ne!(cr.invocation_logical_name("a"), cr.invocation_logical_name("b"));
  }
}
