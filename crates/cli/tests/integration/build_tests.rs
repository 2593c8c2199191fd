use predicates::prelude::*;
use serial_test::serial;

use crate::common::TestEnv;

#[test]
#[serial]
fn build_writes_template_and_archive() {
  let env = TestEnv::new();
  env
    .cmd("build")
    .assert()
    .success()
    .stdout(predicate::str::contains("Built cirrusHello (b1)"));

  assert!(env.exists("cirrusHello-code.zip"));
  let template = env.template();
  assert_eq!(template["Outputs"]["BuildID"]["Value"], "b1");
  let functions: Vec<_> = template["Resources"]
    .as_object()
    .unwrap()
    .values()
    .filter(|r| r["Type"] == "AWS::Lambda::Function")
    .collect();
  assert_eq!(functions.len(), 2);
}

#[test]
#[serial]
fn build_records_the_bucket_default() {
  let env = TestEnv::new();
  env.cmd("build").args(["-s", "artifacts"]).assert().success();
  assert_eq!(env.template()["Parameters"]["ArtifactS3Bucket"]["Default"], "artifacts");
}

#[test]
#[serial]
fn missing_binary_fails_the_build() {
  let env = TestEnv::new();
  std::fs::remove_file(&env.binary).unwrap();
  env
    .cmd("build")
    .assert()
    .failure()
    .stderr(predicate::str::contains("Build failed"));
}
