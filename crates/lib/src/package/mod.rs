//! Build artifacts: the template on disk plus either a code archive or a
//! container image holding the dispatcher binary.
//!
//! A build never touches the provider. Its output is what the upload stage
//! consumes.

mod archive;
mod binary;
mod image;

use std::path::{Path, PathBuf};

use thiserror::Error;
use tracing::info;

pub(crate) use archive::write_zip;
pub use archive::{ZipEntry, zip_directory};

use crate::config::{ArtifactKind, BuildConfig};
use crate::model::{BoxError, Service};
use crate::synth::{self, SynthError};
use crate::template::{Template, TemplateError};
use crate::util::hash::{ContentHash, HashError};

#[derive(Debug, Error)]
pub enum PackageError {
  #[error(transparent)]
  Synth(#[from] SynthError),

  #[error(transparent)]
  Template(#[from] TemplateError),

  #[error(transparent)]
  Hash(#[from] HashError),

  #[error("I/O error at {path}: {source}")]
  Io {
    path: String,
    #[source]
    source: std::io::Error,
  },

  #[error("failed to run {program}: {source}")]
  Spawn {
    program: String,
    #[source]
    source: std::io::Error,
  },

  #[error("{program} exited with {}: {stderr}", code.map_or("a signal".to_string(), |c| format!("code {c}")))]
  CommandFailed {
    program: String,
    code: Option<i32>,
    stderr: String,
  },

  #[error("dispatcher binary not found at {0}")]
  MissingBinary(String),

  #[error("failed to write archive {path}: {source}")]
  Archive {
    path: String,
    #[source]
    source: zip::result::ZipError,
  },

  #[error("archive hook failed: {0}")]
  Hook(BoxError),
}

impl PackageError {
  pub(crate) fn io(path: &Path, source: std::io::Error) -> Self {
    PackageError::Io {
      path: path.display().to_string(),
      source,
    }
  }
}

/// Where a file added by an [`ArchiveHook`] comes from.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ArchiveSource {
  File(PathBuf),
  Bytes(Vec<u8>),
}

/// A file an [`ArchiveHook`] places in the code artifact.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ArchiveEntry {
  /// Slash-separated path inside the archive, relative to the binary.
  pub archive_path: String,
  pub source: ArchiveSource,
}

impl ArchiveEntry {
  pub fn file(archive_path: impl Into<String>, path: impl Into<PathBuf>) -> Self {
    Self {
      archive_path: archive_path.into(),
      source: ArchiveSource::File(path.into()),
    }
  }

  pub fn bytes(archive_path: impl Into<String>, data: impl Into<Vec<u8>>) -> Self {
    Self {
      archive_path: archive_path.into(),
      source: ArchiveSource::Bytes(data.into()),
    }
  }
}

/// Contributes extra files to the code artifact.
pub trait ArchiveHook: Send + Sync {
  fn entries(&self, service_name: &str, config: &BuildConfig) -> Result<Vec<ArchiveEntry>, BoxError>;
}

impl<F> ArchiveHook for F
where
  F: Fn(&str, &BuildConfig) -> Result<Vec<ArchiveEntry>, BoxError> + Send + Sync,
{
  fn entries(&self, service_name: &str, config: &BuildConfig) -> Result<Vec<ArchiveEntry>, BoxError> {
    self(service_name, config)
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Artifact {
  Archive { path: PathBuf, digest: ContentHash },
  Image { tag: String },
}

#[derive(Debug, Clone)]
pub struct BuildOutput {
  pub service_name: String,
  pub build_id: String,
  pub template: Template,
  pub template_path: PathBuf,
  pub artifact: Artifact,
  pub site_archive: Option<PathBuf>,
}

/// Synthesize, compile and package `service` into `config.output_dir`.
pub async fn build(service: &Service, config: &BuildConfig) -> Result<BuildOutput, PackageError> {
  let started = std::time::Instant::now();
  tokio::fs::create_dir_all(&config.output_dir)
    .await
    .map_err(|e| PackageError::io(&config.output_dir, e))?;
  let output_dir = dunce::canonicalize(&config.output_dir).map_err(|e| PackageError::io(&config.output_dir, e))?;
  let config = BuildConfig {
    output_dir,
    ..config.clone()
  };

  let mut template = synth::synthesize(service, &config)?;

  let mut extra = Vec::new();
  for hook in service.archive_hooks() {
    extra.extend(hook.entries(service.name(), &config).map_err(PackageError::Hook)?);
  }

  let binary = binary::dispatcher_binary(&config).await?;
  let artifact = match config.artifact_kind {
    ArtifactKind::Archive => {
      let path = config.code_archive_path(service.name());
      let digest = archive::write_code_archive(&binary, &extra, &path)?;
      info!(path = %path.display(), digest = %digest, "code archive written");
      Artifact::Archive { path, digest }
    }
    ArtifactKind::Image => {
      let tag = config.image_tag(service.name());
      image::build_image(&binary, &extra, &tag, config.architecture()).await?;
      Artifact::Image { tag }
    }
  };

  let site_archive = match service.site() {
    Some(site) => {
      let path = config.site_archive_path(service.name());
      let source = dunce::canonicalize(site.source_dir()).map_err(|e| PackageError::io(site.source_dir(), e))?;
      zip_directory(&source, &path)?;
      Some(path)
    }
    None => None,
  };

  let template_path = config.template_path(service.name());
  let mut metadata = template.build_metadata().unwrap_or_default();
  metadata.cloud_formation_stack_path = Some(template_path.display().to_string());
  match &artifact {
    Artifact::Archive { path, .. } => metadata.code_archive_path = Some(path.display().to_string()),
    Artifact::Image { tag } => metadata.image_tag = Some(tag.clone()),
  }
  metadata.s3_site_artifact_path = site_archive.as_ref().map(|p| p.display().to_string());
  template.set_build_metadata(&metadata)?;

  tokio::fs::write(&template_path, template.to_json_pretty()?)
    .await
    .map_err(|e| PackageError::io(&template_path, e))?;
  info!(
    service = service.name(),
    template = %template_path.display(),
    elapsed = ?started.elapsed(),
    "build complete"
  );

  Ok(BuildOutput {
    service_name: service.name().to_string(),
    build_id: config.build_id.clone(),
    template,
    template_path,
    artifact,
    site_archive,
  })
}
