//! Implementation of the `build` command.
//!
//! Synthesizes the template and packages the dispatcher without touching the
//! provider.

use std::time::Instant;

use anyhow::{Context, Result};

use cirrus::package::{self, Artifact, BuildOutput};
use cirrus::{BuildConfig, Service};

use crate::output::{format_bytes, format_duration, print_stat, print_success, truncate_hash};

pub fn cmd_build(service: &Service, config: &BuildConfig) -> Result<()> {
  let started = Instant::now();
  let rt = super::runtime()?;
  let output = rt.block_on(package::build(service, config)).context("Build failed")?;

  print_success(&format!("Built {} ({})", output.service_name, output.build_id));
  print_build(&output);
  print_stat("Elapsed", &format_duration(started.elapsed()));
  Ok(())
}

pub(super) fn print_build(output: &BuildOutput) {
  print_stat("Template", &output.template_path.display().to_string());
  print_stat("Resources", &output.template.resources.len().to_string());
  match &output.artifact {
    Artifact::Archive { path, digest } => {
      let size = std::fs::metadata(path).map(|m| m.len()).unwrap_or(0);
      print_stat(
        "Code",
        &format!("{} ({}, {})", path.display(), format_bytes(size), truncate_hash(&digest.0)),
      );
    }
    Artifact::Image { tag } => print_stat("Image", tag),
  }
  if let Some(site) = &output.site_archive {
    print_stat("Site", &site.display().to_string());
  }
}
