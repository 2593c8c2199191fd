//! Build and provisioning settings.
//!
//! Everything synthesis and packaging need is carried in a [`BuildConfig`]
//! that is passed down explicitly; nothing is read from process-wide state
//! after construction.

use std::collections::BTreeMap;
use std::path::{Path, PathBuf};
use std::time::Duration;

use chrono::{DateTime, Utc};

use crate::consts::{ENV_BUILD_ID, ENV_OUTPUT_DIR};

pub const DEFAULT_OUTPUT_DIR: &str = ".cirrus";
pub const DEFAULT_TARGET: &str = "x86_64-unknown-linux-musl";

/// What the functions' code is packaged as.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum ArtifactKind {
  #[default]
  Archive,
  Image,
}

/// How gateway deployments are named across builds.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum DeploymentMode {
  /// Stable deployment names; the provider updates the deployment in place.
  #[default]
  Idempotent,
  /// Deployment names are salted with the build id so every build deploys.
  ForceRedeploy,
}

/// What an in-place update does when the change set holds non-code changes.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum InPlaceFallback {
  #[default]
  Refuse,
  Converge,
}

#[derive(Debug, Clone, PartialEq)]
pub struct BuildConfig {
  pub build_id: String,
  /// When this build started. Synthesis reports it instead of reading the
  /// clock, so one config always yields the same template.
  pub created_at: DateTime<Utc>,
  pub output_dir: PathBuf,
  /// Target triple the dispatcher binary is compiled for.
  pub target: String,
  pub features: Vec<String>,
  pub linker_flags: Option<String>,
  /// Binary name passed to `cargo build --bin`. Defaults to the running
  /// executable's name.
  pub bin: Option<String>,
  /// A prebuilt dispatcher binary; skips compilation.
  pub binary: Option<PathBuf>,
  pub artifact_kind: ArtifactKind,
  pub deployment_mode: DeploymentMode,
  /// Code pipeline environments: environment name to variable values.
  pub pipeline_env: BTreeMap<String, BTreeMap<String, String>>,
  pub bucket: Option<String>,
}

impl Default for BuildConfig {
  fn default() -> Self {
    let created_at = Utc::now();
    Self {
      build_id: default_build_id(&created_at),
      created_at,
      output_dir: PathBuf::from(DEFAULT_OUTPUT_DIR),
      target: DEFAULT_TARGET.to_string(),
      features: Vec::new(),
      linker_flags: None,
      bin: None,
      binary: None,
      artifact_kind: ArtifactKind::default(),
      deployment_mode: DeploymentMode::default(),
      pipeline_env: BTreeMap::new(),
      bucket: None,
    }
  }
}

impl BuildConfig {
  /// Defaults overridden by `CIRRUS_OUTPUT_DIR` and `CIRRUS_BUILD_ID`.
  pub fn from_env() -> Self {
    let mut config = Self::default();
    if let Ok(dir) = std::env::var(ENV_OUTPUT_DIR)
      && !dir.is_empty()
    {
      config.output_dir = PathBuf::from(dir);
    }
    if let Ok(id) = std::env::var(ENV_BUILD_ID)
      && !id.is_empty()
    {
      config.build_id = id;
    }
    config
  }

  /// Lambda architecture matching the target triple.
  pub fn architecture(&self) -> &'static str {
    if self.target.starts_with("aarch64") { "arm64" } else { "x86_64" }
  }

  pub fn template_path(&self, service_name: &str) -> PathBuf {
    self.output_dir.join(format!("{service_name}-cftemplate.json"))
  }

  pub fn code_archive_path(&self, service_name: &str) -> PathBuf {
    self.output_dir.join(format!("{service_name}-code.zip"))
  }

  pub fn site_archive_path(&self, service_name: &str) -> PathBuf {
    self.output_dir.join(format!("{service_name}-site.zip"))
  }

  pub fn image_tag(&self, service_name: &str) -> String {
    format!("{}:{}", service_name.to_ascii_lowercase(), self.build_id)
  }

  pub fn output_dir(&self) -> &Path {
    &self.output_dir
  }
}

fn default_build_id(at: &DateTime<Utc>) -> String {
  at.format("%Y%m%d%H%M%S").to_string()
}

#[derive(Debug, Clone, PartialEq)]
pub struct ProvisionOptions {
  pub bucket: String,
  /// Build and log every step without calling the provider.
  pub noop: bool,
  pub in_place: bool,
  pub in_place_fallback: InPlaceFallback,
  /// Object key for a code pipeline trigger archive. When set the stack is
  /// not applied directly.
  pub pipeline_trigger: Option<String>,
  /// Interval between stack status polls.
  pub tick: Duration,
  /// Registry repository URI for image artifacts.
  pub image_repository: Option<String>,
}

impl ProvisionOptions {
  pub fn new(bucket: impl Into<String>) -> Self {
    Self {
      bucket: bucket.into(),
      noop: false,
      in_place: false,
      in_place_fallback: InPlaceFallback::default(),
      pipeline_trigger: None,
      tick: Duration::from_secs(10),
      image_repository: None,
    }
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serial_test::serial;

  #[test]
  #[serial]
  fn env_overrides_output_dir_and_build_id() {
    temp_env::with_vars([(ENV_OUTPUT_DIR, Some("/tmp/out")), (ENV_BUILD_ID, Some("b42"))], || {
      let config = BuildConfig::from_env();
      assert_eq!(config.output_dir, PathBuf::from("/tmp/out"));
      assert_eq!(config.build_id, "b42");
    });
  }

  #[test]
  #[serial]
  fn defaults_apply_without_env() {
    temp_env::with_vars_unset([ENV_OUTPUT_DIR, ENV_BUILD_ID], || {
      let config = BuildConfig::from_env();
      assert_eq!(config.output_dir, PathBuf::from(DEFAULT_OUTPUT_DIR));
      assert_eq!(config.build_id.len(), 14);
    });
  }

  #[test]
  fn architecture_follows_target() {
    let mut config = BuildConfig::default();
    assert_eq!(config.architecture(), "x86_64");
    config.target = "aarch64-unknown-linux-musl".to_string();
    assert_eq!(config.architecture(), "arm64");
  }

  #[test]
  fn artifact_paths_live_in_output_dir() {
    let config = BuildConfig {
      output_dir: PathBuf::from("out"),
      build_id: "7".to_string(),
      ..BuildConfig::default()
    };
    assert_eq!(config.template_path("svc"), PathBuf::from("out/svc-cftemplate.json"));
    assert_eq!(config.image_tag("MySvc"), "mysvc:7");
  }
}
