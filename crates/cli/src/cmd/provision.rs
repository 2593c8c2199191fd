//! Implementation of the `provision` command.
//!
//! Builds the service, then runs the provisioning pipeline: verify the
//! artifact bucket, upload, apply the stack and describe the result.
//! `--noop` runs the whole pipeline against an in-memory provider so nothing
//! leaves the machine.

use std::time::Instant;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;
use tracing::info;

use cirrus::cloud::memory::MemoryCloud;
use cirrus::cloud::{CloudClients, aws};
use cirrus::package;
use cirrus::provision::{self, ProvisionReport};
use cirrus::{BuildConfig, ProvisionOptions, Service};

use crate::output::{format_duration, print_info, print_stat, print_success};

async fn clients(options: &ProvisionOptions) -> CloudClients {
  if options.noop {
    info!("noop: using the in-memory provider");
    MemoryCloud::new("noop").clients()
  } else {
    aws::clients().await
  }
}

pub fn cmd_provision(service: &Service, config: &BuildConfig, options: ProvisionOptions) -> Result<()> {
  let started = Instant::now();
  let noop = options.noop;
  let rt = super::runtime()?;
  let report = rt.block_on(async {
    let output = package::build(service, config).await.context("Build failed")?;
    super::build::print_build(&output);

    let clients = clients(&options).await;
    let cancel = CancellationToken::new();
    super::cancel_on_interrupt(&cancel);
    provision::provision(output, config, options, clients, cancel)
      .await
      .context("Provision failed")
  })?;

  if noop {
    print_success(&format!("Provision dry run of {} complete", service.name()));
  } else {
    print_success(&format!("Provisioned {}", service.name()));
  }
  print_report(&report);
  print_stat("Elapsed", &format_duration(started.elapsed()));
  Ok(())
}

fn print_report(report: &ProvisionReport) {
  for object in &report.uploads {
    let version = object.version.as_deref().unwrap_or("unversioned");
    print_stat("Uploaded", &format!("s3://{}/{} ({version})", object.bucket, object.key));
  }
  match &report.stack {
    Some(stack) => {
      print_stat("Stack", &stack.stack_id);
      print_stat("Status", &stack.status);
      for (name, value) in &stack.outputs {
        print_stat(name, value);
      }
    }
    None => print_info(&format!("Stack {} was not applied", report.stack_name)),
  }
}
