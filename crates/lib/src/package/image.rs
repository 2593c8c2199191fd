//! Container image artifacts.

use std::path::Path;

use tokio::process::Command;
use tracing::info;

use super::{ArchiveEntry, ArchiveSource, PackageError};
use crate::consts::ARCHIVE_BINARY_NAME;

const BASE_IMAGE: &str = "public.ecr.aws/lambda/provided:al2023";

fn dockerfile(extra: &[ArchiveEntry]) -> String {
  let mut lines = vec![
    format!("FROM {BASE_IMAGE}"),
    format!("COPY {ARCHIVE_BINARY_NAME} ${{LAMBDA_RUNTIME_DIR}}/{ARCHIVE_BINARY_NAME}"),
  ];
  for entry in extra {
    let path = entry.archive_path.trim_start_matches('/');
    lines.push(format!("COPY files/{path} ${{LAMBDA_TASK_ROOT}}/{path}"));
  }
  lines.push(format!("CMD [\"{ARCHIVE_BINARY_NAME}\"]"));
  lines.join("\n") + "\n"
}

async fn stage(context: &Path, binary: &Path, extra: &[ArchiveEntry]) -> Result<(), PackageError> {
  let bootstrap = context.join(ARCHIVE_BINARY_NAME);
  tokio::fs::copy(binary, &bootstrap)
    .await
    .map_err(|e| PackageError::io(binary, e))?;
  for entry in extra {
    let dest = context.join("files").join(entry.archive_path.trim_start_matches('/'));
    if let Some(parent) = dest.parent() {
      tokio::fs::create_dir_all(parent)
        .await
        .map_err(|e| PackageError::io(parent, e))?;
    }
    match &entry.source {
      ArchiveSource::File(path) => tokio::fs::copy(path, &dest).await.map(|_| ()),
      ArchiveSource::Bytes(data) => tokio::fs::write(&dest, data).await,
    }
    .map_err(|e| PackageError::io(&dest, e))?;
  }
  let dockerfile_path = context.join("Dockerfile");
  tokio::fs::write(&dockerfile_path, dockerfile(extra))
    .await
    .map_err(|e| PackageError::io(&dockerfile_path, e))
}

/// Build a local image tagged `tag` in a scratch build context.
pub(super) async fn build_image(
  binary: &Path,
  extra: &[ArchiveEntry],
  tag: &str,
  architecture: &str,
) -> Result<(), PackageError> {
  let context = tempfile::Builder::new()
    .prefix("cirrus-image-")
    .tempdir()
    .map_err(|e| PackageError::io(&std::env::temp_dir(), e))?;
  stage(context.path(), binary, extra).await?;

  let platform = if architecture == "arm64" { "linux/arm64" } else { "linux/amd64" };
  info!(tag, platform, "building image");
  let output = Command::new("docker")
    .arg("build")
    .arg("--platform")
    .arg(platform)
    .arg("--tag")
    .arg(tag)
    .arg(context.path())
    .output()
    .await
    .map_err(|source| PackageError::Spawn {
      program: "docker".to_string(),
      source,
    })?;
  if !output.status.success() {
    return Err(PackageError::CommandFailed {
      program: "docker build".to_string(),
      code: output.status.code(),
      stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    });
  }
  Ok(())
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;

  use super::*;

  #[test]
  fn dockerfile_installs_bootstrap_and_hook_files() {
    let text = dockerfile(&[ArchiveEntry::bytes("conf/app.toml", "x")]);
    assert!(text.starts_with("FROM public.ecr.aws/lambda/provided:al2023\n"));
    assert!(text.contains("COPY bootstrap ${LAMBDA_RUNTIME_DIR}/bootstrap"));
    assert!(text.contains("COPY files/conf/app.toml ${LAMBDA_TASK_ROOT}/conf/app.toml"));
    assert!(text.trim_end().ends_with("CMD [\"bootstrap\"]"));
  }

  #[tokio::test]
  async fn stage_lays_out_the_context() {
    let temp = TempDir::new().unwrap();
    let binary = temp.path().join("bin");
    std::fs::write(&binary, b"bin").unwrap();
    let context = temp.path().join("ctx");
    std::fs::create_dir(&context).unwrap();

    stage(&context, &binary, &[ArchiveEntry::bytes("/a/b.txt", "b")]).await.unwrap();
    assert_eq!(std::fs::read(context.join("bootstrap")).unwrap(), b"bin");
    assert_eq!(std::fs::read_to_string(context.join("files/a/b.txt")).unwrap(), "b");
    assert!(context.join("Dockerfile").is_file());
  }
}
