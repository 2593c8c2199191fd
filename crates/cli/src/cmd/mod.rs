mod build;
mod delete;
mod execute;
mod provision;
mod status;

pub use build::cmd_build;
pub use delete::cmd_delete;
pub use execute::cmd_execute;
pub use provision::cmd_provision;
pub use status::cmd_status;

/// Runtime for a single command.
fn runtime() -> anyhow::Result<tokio::runtime::Runtime> {
  use anyhow::Context;
  tokio::runtime::Runtime::new().context("Failed to create async runtime")
}

/// Cancel `token` on Ctrl-C. Work already submitted to the provider is left
/// to finish.
fn cancel_on_interrupt(token: &tokio_util::sync::CancellationToken) {
  let token = token.clone();
  tokio::spawn(async move {
    if tokio::signal::ctrl_c().await.is_ok() {
      tracing::warn!("interrupted, cancelling");
      token.cancel();
    }
  });
}
