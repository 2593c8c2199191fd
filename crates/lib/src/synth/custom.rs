//! User custom resources.

use super::SynthError;
use super::configurator::ensure_handler_function;
use crate::config::BuildConfig;
use crate::model::{CustomResource, Function};
use crate::naming::logical_name;
use crate::template::{Expr, Resource, Template};

/// Emit the handler function for the resource's type (once per type) and the
/// invocation owned by `function`.
pub(super) fn emit(
  template: &mut Template,
  config: &BuildConfig,
  function: &Function,
  resource: &CustomResource,
) -> Result<String, SynthError> {
  let handler = resource.handler_logical_name();
  let role = logical_name("CustomResourceRole", [resource.resource_type()]);
  ensure_handler_function(
    template,
    config,
    &handler,
    &role,
    resource.resource_type(),
    resource.handler().privileges(),
  )?;

  let logical = resource.invocation_logical_name(function.name());
  let mut invocation = Resource::new(resource.resource_type())
    .prop("ServiceToken", Expr::get_att(&handler, "Arn"))
    .depends_on(handler.as_str());
  for (key, value) in resource.properties() {
    invocation.set_prop(key, value.clone());
  }
  template.add_resource(logical.clone(), invocation)?;
  Ok(logical)
}
