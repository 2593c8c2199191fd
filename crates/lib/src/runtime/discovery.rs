//! Runtime view of a function's declared dependencies.

use std::collections::BTreeMap;
use std::sync::OnceLock;

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::Deserialize;
use thiserror::Error;

use crate::consts::ENV_DISCOVERY_INFO;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum DiscoveryError {
  #[error("{ENV_DISCOVERY_INFO} is not set")]
  Missing,

  #[error("{ENV_DISCOVERY_INFO} is not valid base64: {0}")]
  Encoding(String),

  #[error("{ENV_DISCOVERY_INFO} is not a discovery document: {0}")]
  Document(String),
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveredResource {
  #[serde(rename = "ResourceID")]
  pub resource_id: String,
  pub resource_type: String,
  /// The resolved `Ref` of the resource: a name, URL or ARN depending on
  /// its type.
  pub resource_ref: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct DiscoveryInfo {
  /// Logical name of the running function.
  #[serde(rename = "ResourceID")]
  pub resource_id: String,
  pub region: String,
  pub stack_name: String,
  #[serde(rename = "StackID")]
  pub stack_id: String,
  /// Declared dependencies keyed by logical name.
  #[serde(default)]
  pub resources: BTreeMap<String, DiscoveredResource>,
}

impl DiscoveryInfo {
  pub fn decode(encoded: &str) -> Result<Self, DiscoveryError> {
    let bytes = STANDARD
      .decode(encoded.trim())
      .map_err(|e| DiscoveryError::Encoding(e.to_string()))?;
    serde_json::from_slice(&bytes).map_err(|e| DiscoveryError::Document(e.to_string()))
  }

  pub fn resource(&self, logical_name: &str) -> Option<&DiscoveredResource> {
    self.resources.get(logical_name)
  }
}

static DISCOVERY: OnceLock<Result<DiscoveryInfo, DiscoveryError>> = OnceLock::new();

/// Decode this function's discovery document on first use and return the
/// cached result afterwards.
pub fn discover() -> Result<&'static DiscoveryInfo, DiscoveryError> {
  DISCOVERY
    .get_or_init(|| {
      let encoded = std::env::var(ENV_DISCOVERY_INFO).map_err(|_| DiscoveryError::Missing)?;
      DiscoveryInfo::decode(&encoded)
    })
    .as_ref()
    .map_err(Clone::clone)
}
