//! The provider template: resources, outputs, parameters, conditions and
//! build metadata.
//!
//! A [`Template`] only ever grows during synthesis. Insertion goes through
//! [`Template::add_resource`] (fails on any existing name) or
//! [`Template::ensure_resource`] (idempotent for identical content, fails on
//! conflicting content), so two emitters can never silently overwrite each
//! other.

mod expr;
mod resource;

use std::collections::BTreeMap;

use serde::ser::SerializeMap;
use serde::{Deserialize, Serialize, Serializer};
use serde_json::Value;
use thiserror::Error;

pub use expr::{
  Expr, PSEUDO_ACCOUNT_ID, PSEUDO_NO_VALUE, PSEUDO_PARTITION, PSEUDO_REGION, PSEUDO_STACK_ID, PSEUDO_STACK_NAME,
};
pub use resource::{DeletionPolicy, InlinePolicy, Output, Parameter, Properties, Resource, RoleProperties};

use crate::consts::METADATA_BUILD_KEY;

#[derive(Debug, Error)]
pub enum TemplateError {
  #[error("duplicate logical name: {0}")]
  DuplicateLogicalName(String),

  #[error("conflicting emissions for logical name {0}")]
  ConflictingResource(String),

  #[error("conflicting emissions for output {0}")]
  ConflictingOutput(String),

  #[error("conflicting emissions for parameter {0}")]
  ConflictingParameter(String),

  #[error("failed to serialize template: {0}")]
  Serialize(#[from] serde_json::Error),
}

/// Build hints written into the template metadata and read back by the
/// provisioning pipeline.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct BuildMetadata {
  pub service_name: String,
  #[serde(rename = "BuildID")]
  pub build_id: String,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub artifact_s3_bucket: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub code_archive_path: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub s3_site_artifact_path: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub image_tag: Option<String>,
  #[serde(default, skip_serializing_if = "Option::is_none")]
  pub cloud_formation_stack_path: Option<String>,
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct Template {
  pub description: String,
  pub parameters: BTreeMap<String, Parameter>,
  pub conditions: BTreeMap<String, Expr>,
  pub resources: BTreeMap<String, Resource>,
  pub outputs: BTreeMap<String, Output>,
  pub metadata: BTreeMap<String, Value>,
}

impl Template {
  pub fn new(description: impl Into<String>) -> Self {
    Self {
      description: description.into(),
      ..Self::default()
    }
  }

  pub fn add_resource(&mut self, name: impl Into<String>, resource: Resource) -> Result<(), TemplateError> {
    let name = name.into();
    if self.resources.contains_key(&name) {
      return Err(TemplateError::DuplicateLogicalName(name));
    }
    self.resources.insert(name, resource);
    Ok(())
  }

  /// Insert `resource` unless an identical one is already present.
  ///
  /// Returns `Ok(true)` when inserted, `Ok(false)` when an identical resource
  /// already existed.
  pub fn ensure_resource(&mut self, name: impl Into<String>, resource: Resource) -> Result<bool, TemplateError> {
    let name = name.into();
    match self.resources.get(&name) {
      Some(existing) if *existing == resource => Ok(false),
      Some(_) => Err(TemplateError::ConflictingResource(name)),
      None => {
        self.resources.insert(name, resource);
        Ok(true)
      }
    }
  }

  pub fn resource(&self, name: &str) -> Option<&Resource> {
    self.resources.get(name)
  }

  pub fn resource_mut(&mut self, name: &str) -> Option<&mut Resource> {
    self.resources.get_mut(name)
  }

  pub fn resource_type(&self, name: &str) -> Option<&str> {
    self.resources.get(name).map(|r| r.resource_type.as_str())
  }

  pub fn contains_type(&self, resource_type: &str) -> bool {
    self.resources.values().any(|r| r.resource_type == resource_type)
  }

  pub fn resources_of_type<'a>(&'a self, resource_type: &'a str) -> impl Iterator<Item = (&'a String, &'a Resource)> {
    self
      .resources
      .iter()
      .filter(move |(_, r)| r.resource_type == resource_type)
  }

  pub fn add_output(&mut self, name: impl Into<String>, output: Output) -> Result<(), TemplateError> {
    let name = name.into();
    match self.outputs.get(&name) {
      Some(existing) if *existing == output => Ok(()),
      Some(_) => Err(TemplateError::ConflictingOutput(name)),
      None => {
        self.outputs.insert(name, output);
        Ok(())
      }
    }
  }

  pub fn add_parameter(&mut self, name: impl Into<String>, parameter: Parameter) -> Result<(), TemplateError> {
    let name = name.into();
    match self.parameters.get(&name) {
      Some(existing) if *existing == parameter => Ok(()),
      Some(_) => Err(TemplateError::ConflictingParameter(name)),
      None => {
        self.parameters.insert(name, parameter);
        Ok(())
      }
    }
  }

  pub fn add_condition(&mut self, name: impl Into<String>, condition: Expr) {
    self.conditions.insert(name.into(), condition);
  }

  /// Whether `name` is something a `Ref` may legally target.
  pub fn is_referenceable(&self, name: &str) -> bool {
    name.starts_with("AWS::") || self.resources.contains_key(name) || self.parameters.contains_key(name)
  }

  pub fn set_build_metadata(&mut self, metadata: &BuildMetadata) -> Result<(), TemplateError> {
    self
      .metadata
      .insert(METADATA_BUILD_KEY.to_string(), serde_json::to_value(metadata)?);
    Ok(())
  }

  pub fn build_metadata(&self) -> Option<BuildMetadata> {
    self
      .metadata
      .get(METADATA_BUILD_KEY)
      .and_then(|v| serde_json::from_value(v.clone()).ok())
  }

  pub fn to_json_pretty(&self) -> Result<String, TemplateError> {
    Ok(serde_json::to_string_pretty(self)?)
  }

  pub fn to_json(&self) -> Result<String, TemplateError> {
    Ok(serde_json::to_string(self)?)
  }
}

impl Serialize for Template {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(None)?;
    map.serialize_entry("AWSTemplateFormatVersion", "2010-09-09")?;
    if !self.description.is_empty() {
      map.serialize_entry("Description", &self.description)?;
    }
    if !self.parameters.is_empty() {
      map.serialize_entry("Parameters", &self.parameters)?;
    }
    if !self.conditions.is_empty() {
      map.serialize_entry("Conditions", &self.conditions)?;
    }
    map.serialize_entry("Resources", &self.resources)?;
    if !self.outputs.is_empty() {
      map.serialize_entry("Outputs", &self.outputs)?;
    }
    if !self.metadata.is_empty() {
      map.serialize_entry("Metadata", &self.metadata)?;
    }
    map.end()
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn add_resource_rejects_duplicates() {
    let mut t = Template::new("test");
    t.add_resource("A", Resource::new("AWS::SNS::Topic")).unwrap();
    let err = t.add_resource("A", Resource::new("AWS::SNS::Topic")).unwrap_err();
    assert!(matches!(err, TemplateError::DuplicateLogicalName(name) if name == "A"));
  }

  #[test]
  fn ensure_resource_is_idempotent_but_detects_conflicts() {
    let mut t = Template::new("test");
    assert!(t.ensure_resource("A", Resource::new("AWS::SNS::Topic")).unwrap());
    assert!(!t.ensure_resource("A", Resource::new("AWS::SNS::Topic")).unwrap());
    let err = t.ensure_resource("A", Resource::new("AWS::SQS::Queue")).unwrap_err();
    assert!(matches!(err, TemplateError::ConflictingResource(_)));
  }

  #[test]
  fn build_metadata_round_trips_through_template() {
    let mut t = Template::new("test");
    let meta = BuildMetadata {
      service_name: "svc".to_string(),
      build_id: "b1".to_string(),
      code_archive_path: Some("/tmp/svc.zip".to_string()),
      ..BuildMetadata::default()
    };
    t.set_build_metadata(&meta).unwrap();
    assert_eq!(t.build_metadata(), Some(meta));

    let json: Value = serde_json::from_str(&t.to_json().unwrap()).unwrap();
    assert_eq!(json["Metadata"][METADATA_BUILD_KEY]["ServiceName"], "svc");
    assert_eq!(json["Metadata"][METADATA_BUILD_KEY]["BuildID"], "b1");
    assert_eq!(json["AWSTemplateFormatVersion"], "2010-09-09");
  }

  #[test]
  fn outputs_conflict_on_different_values() {
    let mut t = Template::new("test");
    t.add_output("Url", Output::new("url", "a")).unwrap();
    t.add_output("Url", Output::new("url", "a")).unwrap();
    assert!(t.add_output("Url", Output::new("url", "b")).is_err());
  }
}
