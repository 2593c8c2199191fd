//! Shared helpers for CLI integration tests.

use std::path::{Path, PathBuf};

use assert_cmd::Command;
use assert_cmd::cargo::cargo_bin_cmd;
use tempfile::TempDir;

/// Isolated output directory plus a stand-in dispatcher binary, so builds
/// never invoke the compiler.
pub struct TestEnv {
  pub temp: TempDir,
  pub binary: PathBuf,
}

impl TestEnv {
  pub fn new() -> Self {
    let temp = TempDir::new().unwrap();
    let binary = temp.path().join("bootstrap-prebuilt");
    std::fs::write(&binary, b"\x7fELF").unwrap();
    Self { temp, binary }
  }

  pub fn output_dir(&self) -> PathBuf {
    self.temp.path().join("out")
  }

  pub fn template(&self) -> serde_json::Value {
    let path = self.output_dir().join("cirrusHello-cftemplate.json");
    serde_json::from_str(&std::fs::read_to_string(path).unwrap()).unwrap()
  }

  /// `cirrus-hello <command>` wired to the prebuilt binary and output dir.
  pub fn cmd(&self, command: &str) -> Command {
    let mut cmd = cargo_bin_cmd!("cirrus-hello");
    cmd
      .env_remove("AWS_LAMBDA_RUNTIME_API")
      .env_remove("CIRRUS_OUTPUT_DIR")
      .env_remove("CIRRUS_BUILD_ID")
      .current_dir(self.temp.path())
      .arg(command)
      .arg("--binary")
      .arg(&self.binary)
      .arg("--output-dir")
      .arg(self.output_dir())
      .args(["--build-id", "b1"]);
    cmd
  }

  pub fn exists(&self, name: &str) -> bool {
    Path::new(&self.output_dir()).join(name).exists()
  }
}
