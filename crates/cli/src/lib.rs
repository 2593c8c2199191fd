//! Command surface for services built on cirrus.
//!
//! A service's `main` builds its [`Service`] and hands it to [`run`]. The same
//! binary is then the build tool on a workstation and the dispatcher inside
//! the provider: when the provider's runtime API is present it serves
//! invocations instead of parsing arguments.

mod cmd;
pub mod output;

use std::path::PathBuf;
use std::process::ExitCode;
use std::time::Duration;

use clap::{Args, Parser, Subcommand, ValueEnum};
use tracing_subscriber::EnvFilter;

use cirrus::consts::ENV_RUNTIME_API;
use cirrus::runtime::lambda;
use cirrus::{ArtifactKind, BuildConfig, DeploymentMode, InPlaceFallback, ProvisionOptions, Service};

use crate::output::print_error;

#[derive(Parser)]
#[command(author, version, about = "Build and provision a serverless service", long_about = None)]
struct Cli {
  /// Enable debug logging
  #[arg(short, long, global = true)]
  verbose: bool,

  #[command(subcommand)]
  command: Commands,
}

#[derive(Subcommand)]
enum Commands {
  /// Synthesize the template and package the code
  Build {
    #[command(flatten)]
    build: BuildArgs,

    /// Artifact bucket recorded in the template defaults
    #[arg(short = 's', long)]
    s3_bucket: Option<String>,
  },

  /// Build, upload and converge the stack
  Provision {
    #[command(flatten)]
    build: BuildArgs,

    #[command(flatten)]
    provision: ProvisionArgs,
  },

  /// Delete the stack
  Delete {
    /// Interval between stack status polls
    #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
    tick: Duration,
  },

  /// Show the stack status
  Status {
    /// Hide the account id
    #[arg(long)]
    redact: bool,

    /// Output as JSON
    #[arg(long)]
    json: bool,
  },

  /// Serve invocations as the dispatcher
  Execute,
}

#[derive(Args)]
struct BuildArgs {
  /// Build identifier (defaults to a timestamp)
  #[arg(short = 'i', long)]
  build_id: Option<String>,

  /// Directory for the template and artifacts
  #[arg(short, long)]
  output_dir: Option<PathBuf>,

  /// Target triple of the dispatcher binary
  #[arg(long)]
  target: Option<String>,

  /// Cargo feature to enable; repeatable
  #[arg(long = "tag", value_name = "FEATURE")]
  features: Vec<String>,

  /// Extra linker flags, whitespace separated
  #[arg(long)]
  ldflags: Option<String>,

  /// Use a prebuilt dispatcher binary instead of compiling one
  #[arg(long)]
  binary: Option<PathBuf>,

  /// Package the code as a container image
  #[arg(long)]
  image: bool,

  /// Roll a new gateway deployment on every build
  #[arg(long)]
  force_redeploy: bool,
}

impl BuildArgs {
  fn into_config(self, bucket: Option<String>) -> BuildConfig {
    let mut config = BuildConfig::from_env();
    if let Some(id) = self.build_id {
      config.build_id = id;
    }
    if let Some(dir) = self.output_dir {
      config.output_dir = dir;
    }
    if let Some(target) = self.target {
      config.target = target;
    }
    config.features = self.features;
    config.linker_flags = self.ldflags;
    config.binary = self.binary;
    if self.image {
      config.artifact_kind = ArtifactKind::Image;
    }
    if self.force_redeploy {
      config.deployment_mode = DeploymentMode::ForceRedeploy;
    }
    config.bucket = bucket;
    config
  }
}

#[derive(Debug, Clone, Copy, Default, ValueEnum)]
enum FallbackArg {
  #[default]
  Refuse,
  Converge,
}

#[derive(Args)]
struct ProvisionArgs {
  /// Artifact bucket
  #[arg(short = 's', long)]
  s3_bucket: String,

  /// Log every step without calling the provider
  #[arg(short, long)]
  noop: bool,

  /// Push code straight to the functions when only code changed
  #[arg(long)]
  inplace: bool,

  /// What --inplace does when the change set holds other changes
  #[arg(long, value_enum, default_value_t)]
  inplace_fallback: FallbackArg,

  /// Upload a code pipeline trigger under this key instead of applying
  #[arg(long)]
  pipeline_trigger: Option<String>,

  /// Interval between stack status polls
  #[arg(long, value_parser = humantime::parse_duration, default_value = "10s")]
  tick: Duration,

  /// Registry repository for image artifacts
  #[arg(long)]
  image_repository: Option<String>,
}

impl ProvisionArgs {
  fn into_options(self) -> ProvisionOptions {
    let mut options = ProvisionOptions::new(self.s3_bucket);
    options.noop = self.noop;
    options.in_place = self.inplace;
    options.in_place_fallback = match self.inplace_fallback {
      FallbackArg::Refuse => InPlaceFallback::Refuse,
      FallbackArg::Converge => InPlaceFallback::Converge,
    };
    options.pipeline_trigger = self.pipeline_trigger;
    options.tick = self.tick;
    options.image_repository = self.image_repository;
    options
  }
}

fn init_logging(verbose: bool) {
  let filter = if verbose { EnvFilter::new("debug") } else { lambda::env_filter() };
  let _ = tracing_subscriber::fmt()
    .with_env_filter(filter)
    .without_time()
    .with_writer(std::io::stderr)
    .try_init();
}

/// Run `service` as its command line, or as the dispatcher when started by
/// the provider.
pub fn run(service: Service) -> ExitCode {
  if std::env::var_os(ENV_RUNTIME_API).is_some() && std::env::args_os().len() <= 1 {
    return finish(cmd::cmd_execute(&service));
  }

  let cli = Cli::parse();
  init_logging(cli.verbose);

  let result = match cli.command {
    Commands::Build { build, s3_bucket } => cmd::cmd_build(&service, &build.into_config(s3_bucket)),
    Commands::Provision { build, provision } => {
      let config = build.into_config(Some(provision.s3_bucket.clone()));
      cmd::cmd_provision(&service, &config, provision.into_options())
    }
    Commands::Delete { tick } => cmd::cmd_delete(service.name(), tick),
    Commands::Status { redact, json } => cmd::cmd_status(service.name(), redact, json),
    Commands::Execute => cmd::cmd_execute(&service),
  };
  finish(result)
}

fn finish(result: anyhow::Result<()>) -> ExitCode {
  match result {
    Ok(()) => ExitCode::SUCCESS,
    Err(err) => {
      print_error(&format!("{err:#}"));
      ExitCode::FAILURE
    }
  }
}

#[cfg(test)]
mod tests {
  use serial_test::serial;

  use super::*;

  #[test]
  fn cli_definition_is_consistent() {
    use clap::CommandFactory;
    Cli::command().debug_assert();
  }

  #[test]
  fn provision_flags_map_to_options() {
    let cli = Cli::try_parse_from([
      "svc",
      "provision",
      "-s",
      "art",
      "--noop",
      "--inplace",
      "--inplace-fallback",
      "converge",
      "--tick",
      "2s",
      "--tag",
      "fast",
      "--tag",
      "small",
    ])
    .unwrap();
    let Commands::Provision { build, provision } = cli.command else {
      panic!("expected provision");
    };
    let options = provision.into_options();
    assert_eq!(options.bucket, "art");
    assert!(options.noop && options.in_place);
    assert_eq!(options.in_place_fallback, InPlaceFallback::Converge);
    assert_eq!(options.tick, Duration::from_secs(2));
    let config = build.into_config(Some("art".to_string()));
    assert_eq!(config.features, ["fast", "small"]);
    assert_eq!(config.bucket.as_deref(), Some("art"));
  }

  #[test]
  #[serial]
  fn flags_override_the_environment() {
    temp_env::with_vars(
      [("CIRRUS_BUILD_ID", Some("from-env")), ("CIRRUS_OUTPUT_DIR", Some("/tmp/cirrus-env"))],
      || {
        let build = |args: &[&str]| {
          let cli = Cli::try_parse_from(args).unwrap();
          let Commands::Build { build, s3_bucket } = cli.command else {
            panic!("expected build");
          };
          build.into_config(s3_bucket)
        };
        let config = build(&["svc", "build"]);
        assert_eq!(config.build_id, "from-env");
        assert_eq!(config.output_dir, PathBuf::from("/tmp/cirrus-env"));
        assert_eq!(config.bucket, None);

        let config = build(&["svc", "build", "-i", "b7", "-o", "out", "--image", "--force-redeploy"]);
        assert_eq!(config.build_id, "b7");
        assert_eq!(config.output_dir, PathBuf::from("out"));
        assert_eq!(config.artifact_kind, ArtifactKind::Image);
        assert_eq!(config.deployment_mode, DeploymentMode::ForceRedeploy);
      },
    );
  }

  #[test]
  fn provision_requires_a_bucket() {
    assert!(Cli::try_parse_from(["svc", "provision"]).is_err());
  }
}
