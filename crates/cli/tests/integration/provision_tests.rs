use predicates::prelude::*;
use serial_test::serial;

use crate::common::TestEnv;

#[test]
#[serial]
fn noop_provision_runs_offline() {
  let env = TestEnv::new();
  env
    .cmd("provision")
    .args(["--s3-bucket", "artifacts", "--noop"])
    .assert()
    .success()
    .stdout(predicate::str::contains("Provision dry run of cirrusHello complete"))
    .stdout(predicate::str::contains("was not applied"));
  assert!(env.exists("cirrusHello-cftemplate.json"));
}

#[test]
#[serial]
fn noop_provision_writes_the_pipeline_trigger() {
  let env = TestEnv::new();
  env
    .cmd("provision")
    .args(["-s", "artifacts", "--noop", "--pipeline-trigger", "triggers/hello.zip"])
    .assert()
    .success();
  assert!(env.exists("cirrusHello-pipeline-trigger.zip"));
}

#[test]
#[serial]
fn inplace_fallback_values_are_checked() {
  let env = TestEnv::new();
  env
    .cmd("provision")
    .args(["-s", "artifacts", "--noop", "--inplace", "--inplace-fallback", "maybe"])
    .assert()
    .failure()
    .stderr(predicate::str::contains("--inplace-fallback"));
}
