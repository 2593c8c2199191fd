//! Compiling the dispatcher.
//!
//! The user's own program is the dispatcher: it is rebuilt for the function
//! runtime's target with the build id compiled in.

use std::path::{Path, PathBuf};

use tokio::process::Command;
use tracing::{debug, info};

use super::PackageError;
use crate::config::BuildConfig;
use crate::consts::ENV_BUILD_ID;

/// Path of the dispatcher binary for this build, compiling it unless a
/// prebuilt one was supplied.
pub(super) async fn dispatcher_binary(config: &BuildConfig) -> Result<PathBuf, PackageError> {
  if let Some(prebuilt) = &config.binary {
    let path = dunce::canonicalize(prebuilt).map_err(|_| PackageError::MissingBinary(prebuilt.display().to_string()))?;
    if !path.is_file() {
      return Err(PackageError::MissingBinary(path.display().to_string()));
    }
    debug!(binary = %path.display(), "using prebuilt dispatcher");
    return Ok(path);
  }

  let bin = match &config.bin {
    Some(bin) => bin.clone(),
    None => current_bin_name()?,
  };
  let args = cargo_args(config, &bin);
  info!(bin = %bin, target = %config.target, build_id = %config.build_id, "compiling dispatcher");

  let mut command = Command::new("cargo");
  command.args(&args).env(ENV_BUILD_ID, &config.build_id);
  if let Some(flags) = &config.linker_flags {
    command.env("RUSTFLAGS", rustflags(flags));
  }
  let output = command.output().await.map_err(|source| PackageError::Spawn {
    program: "cargo".to_string(),
    source,
  })?;
  if !output.status.success() {
    return Err(PackageError::CommandFailed {
      program: "cargo build".to_string(),
      code: output.status.code(),
      stderr: String::from_utf8_lossy(&output.stderr).trim().to_string(),
    });
  }

  let target_dir = std::env::var("CARGO_TARGET_DIR").unwrap_or_else(|_| "target".to_string());
  let path = Path::new(&target_dir).join(&config.target).join("release").join(&bin);
  if !path.is_file() {
    return Err(PackageError::MissingBinary(path.display().to_string()));
  }
  Ok(path)
}

fn cargo_args(config: &BuildConfig, bin: &str) -> Vec<String> {
  let mut args = vec![
    "build".to_string(),
    "--release".to_string(),
    "--target".to_string(),
    config.target.clone(),
    "--bin".to_string(),
    bin.to_string(),
  ];
  if !config.features.is_empty() {
    args.push("--features".to_string());
    args.push(config.features.join(","));
  }
  args
}

/// Linker flags appended to any `RUSTFLAGS` already set.
fn rustflags(linker_flags: &str) -> String {
  let existing = std::env::var("RUSTFLAGS").unwrap_or_default();
  let added = linker_flags
    .split_whitespace()
    .map(|flag| format!("-C link-arg={flag}"))
    .collect::<Vec<_>>()
    .join(" ");
  if existing.trim().is_empty() { added } else { format!("{} {added}", existing.trim()) }
}

fn current_bin_name() -> Result<String, PackageError> {
  let exe = std::env::current_exe().map_err(|e| PackageError::io(Path::new("current executable"), e))?;
  exe
    .file_stem()
    .map(|s| s.to_string_lossy().into_owned())
    .ok_or_else(|| PackageError::MissingBinary(exe.display().to_string()))
}

#[cfg(test)]
mod tests {
  use serial_test::serial;

  use super::*;

  #[test]
  fn cargo_args_carry_target_and_features() {
    let config = BuildConfig {
      target: "aarch64-unknown-linux-musl".to_string(),
      features: vec!["metrics".to_string(), "tls".to_string()],
      ..BuildConfig::default()
    };
    assert_eq!(
      cargo_args(&config, "svc"),
      [
        "build",
        "--release",
        "--target",
        "aarch64-unknown-linux-musl",
        "--bin",
        "svc",
        "--features",
        "metrics,tls"
      ]
    );
  }

  #[test]
  #[serial]
  fn linker_flags_extend_rustflags() {
    temp_env::with_var("RUSTFLAGS", Some("-C target-cpu=native"), || {
      assert_eq!(rustflags("-s --gc-sections"), "-C target-cpu=native -C link-arg=-s -C link-arg=--gc-sections");
    });
    temp_env::with_var_unset("RUSTFLAGS", || {
      assert_eq!(rustflags("-s"), "-C link-arg=-s");
    });
  }
}
