//! Role aggregation.
//!
//! One role per principal. Statements are unioned into it by resource: a
//! statement whose resource is already covered only contributes its missing
//! actions.

use tracing::debug;

use super::SynthError;
use crate::iam::{PolicyStatement, RoleDefinition, baseline_statements, lambda_assume_role_policy};
use crate::template::{Resource, RoleProperties, Template};

pub(super) const POLICY_NAME: &str = "LambdaPolicy";

/// Ensure a lambda role named `logical` exists, then merge `statements`.
///
/// A new role starts with the baseline statements.
pub(super) fn ensure_role(
  template: &mut Template,
  logical: &str,
  statements: impl IntoIterator<Item = PolicyStatement>,
) -> Result<(), SynthError> {
  if template.resource(logical).is_none() {
    let mut role = RoleProperties::new(lambda_assume_role_policy());
    for statement in baseline_statements() {
      role.upsert_statement(POLICY_NAME, statement);
    }
    template.add_resource(logical, Resource::role(role))?;
    debug!(role = logical, "created role");
  }
  add_statements(template, logical, statements)
}

/// Emit the role for a function's [`RoleDefinition`].
pub(super) fn emit_definition(template: &mut Template, logical: &str, definition: &RoleDefinition) -> Result<(), SynthError> {
  ensure_role(template, logical, definition.privileges.iter().cloned())?;
  if let Some(role) = template.resource_mut(logical).and_then(|r| r.role_mut()) {
    for arn in &definition.managed_policy_arns {
      if !role.managed_policy_arns.contains(arn) {
        role.managed_policy_arns.push(arn.clone());
      }
    }
  }
  Ok(())
}

/// Merge statements into an existing role.
pub(super) fn add_statements(
  template: &mut Template,
  logical: &str,
  statements: impl IntoIterator<Item = PolicyStatement>,
) -> Result<(), SynthError> {
  let role = template
    .resource_mut(logical)
    .and_then(|r| r.role_mut())
    .ok_or_else(|| SynthError::MissingRole(logical.to_string()))?;
  for statement in statements {
    role.upsert_statement(POLICY_NAME, statement);
  }
  Ok(())
}
