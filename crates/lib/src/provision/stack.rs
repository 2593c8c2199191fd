//! Stack lifecycle outside the provisioning pipeline: delete and status.

use std::collections::BTreeMap;
use std::time::Duration;

use tokio_util::sync::CancellationToken;
use tracing::info;

use super::ApplyError;
use super::converge::StackWatcher;
use crate::cloud::{CloudClients, StackSummary};

const DELETE_TIMEOUT: Duration = Duration::from_secs(30 * 60);

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DeleteOutcome {
  Deleted,
  /// There was no stack to delete.
  Absent,
}

/// Delete `stack_name` and wait until the provider has removed it.
pub async fn delete(
  clients: &CloudClients,
  stack_name: &str,
  tick: Duration,
  cancel: &CancellationToken,
) -> Result<DeleteOutcome, ApplyError> {
  let stacks = clients.stacks.as_ref();
  let Some(existing) = stacks.describe_stack(stack_name).await? else {
    info!(stack = stack_name, "stack does not exist");
    return Ok(DeleteOutcome::Absent);
  };

  let mut watcher = StackWatcher::new(stacks, stack_name, tick, DELETE_TIMEOUT, cancel);
  watcher.prime().await?;
  info!(stack = stack_name, status = %existing.status, "deleting stack");
  stacks.delete_stack(stack_name).await?;

  match watcher.wait().await? {
    None => {}
    Some(summary) if summary.status == "DELETE_COMPLETE" => {}
    Some(summary) => {
      return Err(ApplyError::StackFailed {
        stack: stack_name.to_string(),
        status: summary.status,
        events: watcher.failures(),
      });
    }
  }
  info!(stack = stack_name, "stack deleted");
  Ok(DeleteOutcome::Deleted)
}

/// Describe `stack_name`, optionally hiding the account id.
pub async fn status(clients: &CloudClients, stack_name: &str, redact: bool) -> Result<Option<StackSummary>, ApplyError> {
  let summary = clients.stacks.describe_stack(stack_name).await?;
  Ok(match summary {
    Some(summary) if redact => Some(redact_account(summary)),
    other => other,
  })
}

/// Account id in a stack ARN (`arn:partition:service:region:account:...`).
fn account_id(stack_id: &str) -> Option<&str> {
  stack_id.split(':').nth(4).filter(|a| !a.is_empty())
}

/// Replace every occurrence of the stack's account id with `*`s.
pub fn redact_account(summary: StackSummary) -> StackSummary {
  let Some(account) = account_id(&summary.stack_id).map(str::to_string) else {
    return summary;
  };
  let mask = "*".repeat(account.len());
  let hide = |s: String| s.replace(&account, &mask);
  let hide_map =
    |m: BTreeMap<String, String>| -> BTreeMap<String, String> { m.into_iter().map(|(k, v)| (k, hide(v))).collect() };
  StackSummary {
    stack_id: hide(summary.stack_id),
    description: summary.description.map(hide),
    status_reason: summary.status_reason.map(hide),
    parameters: hide_map(summary.parameters),
    tags: hide_map(summary.tags),
    outputs: hide_map(summary.outputs),
    ..summary
  }
}
