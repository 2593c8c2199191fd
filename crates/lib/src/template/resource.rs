use std::collections::{BTreeMap, BTreeSet};

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};
use serde_json::Value;

use super::Expr;
use crate::consts::POLICY_VERSION;
use crate::iam::PolicyStatement;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum DeletionPolicy {
  Delete,
  Retain,
}

/// One inline policy attached to a role.
#[derive(Debug, Clone, PartialEq)]
pub struct InlinePolicy {
  pub name: String,
  pub statements: Vec<PolicyStatement>,
}

/// Role properties kept in typed form so statements can be merged after
/// the role is first emitted.
#[derive(Debug, Clone, PartialEq)]
pub struct RoleProperties {
  pub assume_role_policy: Expr,
  pub policies: Vec<InlinePolicy>,
  pub managed_policy_arns: Vec<Expr>,
}

impl RoleProperties {
  pub fn new(assume_role_policy: Expr) -> Self {
    Self {
      assume_role_policy,
      policies: Vec::new(),
      managed_policy_arns: Vec::new(),
    }
  }

  /// The named inline policy, created empty on first use.
  pub fn policy_mut(&mut self, name: &str) -> &mut InlinePolicy {
    if let Some(idx) = self.policies.iter().position(|p| p.name == name) {
      return &mut self.policies[idx];
    }
    self.policies.push(InlinePolicy {
      name: name.to_string(),
      statements: Vec::new(),
    });
    let last = self.policies.len() - 1;
    &mut self.policies[last]
  }

  pub fn statements(&self) -> impl Iterator<Item = &PolicyStatement> {
    self.policies.iter().flat_map(|p| p.statements.iter())
  }

  /// Insert `statement` unless a statement with the same resource already
  /// exists in any of this role's policies; in that case its actions are
  /// merged into the existing statement. Returns true when a statement was
  /// inserted.
  pub fn upsert_statement(&mut self, policy: &str, statement: PolicyStatement) -> bool {
    for existing in self.policies.iter_mut().flat_map(|p| p.statements.iter_mut()) {
      if existing.resource == statement.resource && existing.effect == statement.effect {
        existing.merge_actions(&statement.actions);
        return false;
      }
    }
    self.policy_mut(policy).statements.push(statement);
    true
  }

  fn references(&self) -> BTreeSet<String> {
    let mut out = self.assume_role_policy.references();
    for stmt in self.statements() {
      out.extend(stmt.resource.references());
    }
    for arn in &self.managed_policy_arns {
      out.extend(arn.references());
    }
    out
  }
}

impl Serialize for RoleProperties {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(None)?;
    map.serialize_entry("AssumeRolePolicyDocument", &self.assume_role_policy)?;
    let policies: Vec<Value> = self
      .policies
      .iter()
      .filter(|p| !p.statements.is_empty())
      .map(|p| {
        serde_json::json!({
          "PolicyName": p.name,
          "PolicyDocument": {
            "Version": POLICY_VERSION,
            "Statement": p.statements,
          },
        })
      })
      .collect();
    if !policies.is_empty() {
      map.serialize_entry("Policies", &policies)?;
    }
    if !self.managed_policy_arns.is_empty() {
      map.serialize_entry("ManagedPolicyArns", &self.managed_policy_arns)?;
    }
    map.end()
  }
}

#[derive(Debug, Clone, PartialEq)]
pub enum Properties {
  Map(BTreeMap<String, Expr>),
  Role(RoleProperties),
}

impl Serialize for Properties {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    match self {
      Properties::Map(map) => map.serialize(serializer),
      Properties::Role(role) => role.serialize(serializer),
    }
  }
}

/// A typed template resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Resource {
  pub resource_type: String,
  pub properties: Properties,
  pub depends_on: BTreeSet<String>,
  pub deletion_policy: Option<DeletionPolicy>,
  pub condition: Option<String>,
  pub metadata: Option<Value>,
}

impl Resource {
  pub fn new(resource_type: impl Into<String>) -> Self {
    Self {
      resource_type: resource_type.into(),
      properties: Properties::Map(BTreeMap::new()),
      depends_on: BTreeSet::new(),
      deletion_policy: None,
      condition: None,
      metadata: None,
    }
  }

  pub fn role(properties: RoleProperties) -> Self {
    Self {
      properties: Properties::Role(properties),
      ..Self::new("AWS::IAM::Role")
    }
  }

  /// Set a property. Has no effect on role resources, whose properties are
  /// edited through [`Resource::role_mut`].
  pub fn prop(mut self, key: &str, value: impl Into<Expr>) -> Self {
    self.set_prop(key, value);
    self
  }

  pub fn set_prop(&mut self, key: &str, value: impl Into<Expr>) {
    if let Properties::Map(map) = &mut self.properties {
      map.insert(key.to_string(), value.into());
    }
  }

  pub fn get_prop(&self, key: &str) -> Option<&Expr> {
    match &self.properties {
      Properties::Map(map) => map.get(key),
      Properties::Role(_) => None,
    }
  }

  pub fn get_prop_mut(&mut self, key: &str) -> Option<&mut Expr> {
    match &mut self.properties {
      Properties::Map(map) => map.get_mut(key),
      Properties::Role(_) => None,
    }
  }

  pub fn role_mut(&mut self) -> Option<&mut RoleProperties> {
    match &mut self.properties {
      Properties::Role(role) => Some(role),
      Properties::Map(_) => None,
    }
  }

  pub fn role_properties(&self) -> Option<&RoleProperties> {
    match &self.properties {
      Properties::Role(role) => Some(role),
      Properties::Map(_) => None,
    }
  }

  pub fn depends_on(mut self, name: impl Into<String>) -> Self {
    self.depends_on.insert(name.into());
    self
  }

  pub fn deletion_policy(mut self, policy: DeletionPolicy) -> Self {
    self.deletion_policy = Some(policy);
    self
  }

  pub fn condition(mut self, condition: impl Into<String>) -> Self {
    self.condition = Some(condition.into());
    self
  }

  /// Names referenced from this resource's properties.
  pub fn references(&self) -> BTreeSet<String> {
    match &self.properties {
      Properties::Map(map) => {
        let mut out = BTreeSet::new();
        for value in map.values() {
          out.extend(value.references());
        }
        out
      }
      Properties::Role(role) => role.references(),
    }
  }
}

impl Serialize for Resource {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(None)?;
    map.serialize_entry("Type", &self.resource_type)?;
    let empty = matches!(&self.properties, Properties::Map(m) if m.is_empty());
    if !empty {
      map.serialize_entry("Properties", &self.properties)?;
    }
    if !self.depends_on.is_empty() {
      map.serialize_entry("DependsOn", &self.depends_on)?;
    }
    if let Some(policy) = &self.deletion_policy {
      map.serialize_entry("DeletionPolicy", policy)?;
    }
    if let Some(condition) = &self.condition {
      map.serialize_entry("Condition", condition)?;
    }
    if let Some(metadata) = &self.metadata {
      map.serialize_entry("Metadata", metadata)?;
    }
    map.end()
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Output {
  #[serde(rename = "Description")]
  pub description: String,
  #[serde(rename = "Value")]
  pub value: Expr,
}

impl Output {
  pub fn new(description: impl Into<String>, value: impl Into<Expr>) -> Self {
    Self {
      description: description.into(),
      value: value.into(),
    }
  }
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct Parameter {
  #[serde(rename = "Type")]
  pub param_type: String,
  #[serde(rename = "Description", skip_serializing_if = "Option::is_none")]
  pub description: Option<String>,
  #[serde(rename = "Default", skip_serializing_if = "Option::is_none")]
  pub default: Option<String>,
}

impl Parameter {
  pub fn string(description: impl Into<String>) -> Self {
    Self {
      param_type: "String".to_string(),
      description: Some(description.into()),
      default: None,
    }
  }

  pub fn with_default(mut self, default: impl Into<String>) -> Self {
    self.default = Some(default.into());
    self
  }
}
