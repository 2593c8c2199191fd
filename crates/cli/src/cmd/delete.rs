//! Implementation of the `delete` command.

use std::time::Duration;

use anyhow::{Context, Result};
use tokio_util::sync::CancellationToken;

use cirrus::cloud::aws;
use cirrus::provision::stack::{self, DeleteOutcome};

use crate::output::{print_info, print_success};

pub fn cmd_delete(stack_name: &str, tick: Duration) -> Result<()> {
  let rt = super::runtime()?;
  let outcome = rt
    .block_on(async {
      let clients = aws::clients().await;
      let cancel = CancellationToken::new();
      super::cancel_on_interrupt(&cancel);
      stack::delete(&clients, stack_name, tick, &cancel).await
    })
    .with_context(|| format!("Failed to delete stack {stack_name}"))?;

  match outcome {
    DeleteOutcome::Deleted => print_success(&format!("Deleted stack {stack_name}")),
    DeleteOutcome::Absent => print_info(&format!("Stack {stack_name} does not exist")),
  }
  Ok(())
}
