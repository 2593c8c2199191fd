//! Passes that run once every resource is in the template.

use std::collections::{BTreeMap, BTreeSet};

use tracing::debug;

use super::{SynthError, iam};
use crate::config::BuildConfig;
use crate::consts::ENV_DISCOVERY_INFO;
use crate::iam::EventSourceKind;
use crate::model::{RoleSpec, Service};
use crate::resource_ref::{ResourceRef, is_resolved_resource_type, source_expr};
use crate::template::{Expr, Parameter, Template};

/// Grant each function's role the statements its pull-based sources need.
///
/// Only synthesized roles are touched; a literal role is the caller's
/// responsibility.
pub(super) fn event_source_mappings(template: &mut Template, service: &Service) -> Result<(), SynthError> {
  for function in service.functions() {
    if !matches!(function.role(), RoleSpec::Definition(_)) {
      continue;
    }
    let role = function.role_logical_name();
    for mapping in function.mappings() {
      let source = source_expr(&mapping.source);
      let Some(reference) = ResourceRef::from_expr(&source) else {
        continue;
      };
      let statements: Vec<_> = EventSourceKind::ALL
        .into_iter()
        .filter(|kind| is_resolved_resource_type(&reference, template, kind.literal_token(), kind.resource_type()))
        .map(|kind| kind.statement(source.clone()))
        .collect();
      if !statements.is_empty() {
        debug!(function = function.name(), source = %reference.resource_name, "granting event source statements");
        iam::add_statements(template, &role, statements)?;
      }
    }
  }
  Ok(())
}

fn variables_mut<'a>(template: &'a mut Template, logical: &str) -> Option<&'a mut BTreeMap<String, Expr>> {
  let Expr::Map(environment) = template.resource_mut(logical)?.get_prop_mut("Environment")? else {
    return None;
  };
  match environment.entry("Variables".to_string()).or_insert_with(|| Expr::Map(BTreeMap::new())) {
    Expr::Map(variables) => Some(variables),
    _ => None,
  }
}

/// Turn every code pipeline variable into a template parameter and pass it
/// to each user function.
///
/// The per-environment values are supplied by the parameter files written
/// alongside the pipeline trigger archive.
pub(super) fn pipeline_environment(
  template: &mut Template,
  config: &BuildConfig,
  service: &Service,
  functions: &BTreeMap<String, String>,
) -> Result<(), SynthError> {
  let names: BTreeSet<&String> = config.pipeline_env.values().flat_map(|vars| vars.keys()).collect();
  if names.is_empty() {
    return Ok(());
  }
  for name in &names {
    if name.is_empty() || !name.chars().all(|c| c.is_ascii_alphanumeric()) {
      return Err(SynthError::InvalidPipelineVariable(name.to_string()));
    }
    template.add_parameter(
      name.as_str(),
      Parameter::string(format!("Code pipeline variable {name}")).with_default(""),
    )?;
  }

  for function in service.functions() {
    let logical = &functions[function.name()];
    let Some(variables) = variables_mut(template, logical) else {
      continue;
    };
    for name in &names {
      variables.insert(name.to_string(), Expr::reference(name.as_str()));
    }
  }
  debug!(variables = names.len(), "injected code pipeline environment");
  Ok(())
}

/// Build the discovery payload for one function.
///
/// The payload is JSON assembled around intrinsic values, so the provider
/// resolves region, stack and dependency references when it creates the
/// function.
fn discovery_payload(template: &Template, logical: &str, dependencies: &[String]) -> Result<Expr, SynthError> {
  let literal = |s: &str| Expr::str(serde_json::Value::from(s).to_string());

  let mut parts = vec![
    Expr::str("{\"ResourceID\":"),
    literal(logical),
    Expr::str(",\"Region\":\""),
    Expr::region(),
    Expr::str("\",\"StackName\":\""),
    Expr::stack_name(),
    Expr::str("\",\"StackID\":\""),
    Expr::stack_id(),
    Expr::str("\",\"Resources\":{"),
  ];
  for (index, dependency) in dependencies.iter().enumerate() {
    let resource_type = template
      .resource_type(dependency)
      .ok_or_else(|| SynthError::UnresolvedReference {
        resource: logical.to_string(),
        reference: dependency.clone(),
      })?;
    if index > 0 {
      parts.push(Expr::str(","));
    }
    parts.extend([
      literal(dependency),
      Expr::str(":{\"ResourceID\":"),
      literal(dependency),
      Expr::str(",\"ResourceType\":"),
      literal(resource_type),
      Expr::str(",\"ResourceRef\":\""),
      Expr::reference(dependency),
      Expr::str("\"}"),
    ]);
  }
  parts.push(Expr::str("}}"));
  Ok(Expr::base64(Expr::join("", parts)))
}

/// Publish each function's dependency map in its environment.
pub(super) fn discovery(
  template: &mut Template,
  service: &Service,
  functions: &BTreeMap<String, String>,
) -> Result<(), SynthError> {
  for function in service.functions() {
    let logical = &functions[function.name()];
    let payload = discovery_payload(template, logical, function.dependencies())?;
    if let Some(variables) = variables_mut(template, logical) {
      variables.insert(ENV_DISCOVERY_INFO.to_string(), payload);
    }
    for dependency in function.dependencies() {
      if let Some(resource) = template.resource_mut(logical) {
        resource.depends_on.insert(dependency.clone());
      }
    }
  }
  Ok(())
}
