//! Full convergence: create or update the stack from the template and wait
//! for it to settle.

use std::collections::HashSet;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ApplyError, Operation, ProvisionContext, ProvisionError};
use crate::cloud::{StackControlPlane, StackEvent, StackPhase, StackSummary, UpdateOutcome};

/// Polls a stack until it reaches a terminal status, logging each new event
/// once.
pub(crate) struct StackWatcher<'a> {
  stacks: &'a dyn StackControlPlane,
  stack: &'a str,
  tick: Duration,
  timeout: Duration,
  cancel: &'a CancellationToken,
  seen: HashSet<String>,
  failures: Vec<String>,
}

impl<'a> StackWatcher<'a> {
  pub(crate) fn new(
    stacks: &'a dyn StackControlPlane,
    stack: &'a str,
    tick: Duration,
    timeout: Duration,
    cancel: &'a CancellationToken,
  ) -> Self {
    Self {
      stacks,
      stack,
      tick,
      timeout,
      cancel,
      seen: HashSet::new(),
      failures: Vec::new(),
    }
  }

  /// Mark the stack's existing events as seen so only events of the next
  /// operation are reported.
  pub(crate) async fn prime(&mut self) -> Result<(), ApplyError> {
    let events = self.stacks.stack_events(self.stack).await?;
    self.seen.extend(events.into_iter().map(|e| e.event_id));
    Ok(())
  }

  async fn stream_events(&mut self) -> Result<(), ApplyError> {
    let events = self.stacks.stack_events(self.stack).await?;
    let fresh: Vec<StackEvent> = events
      .into_iter()
      .filter(|e| !self.seen.contains(&e.event_id))
      .collect();
    for event in fresh.into_iter().rev() {
      let reason = event.reason.as_deref().unwrap_or("");
      info!(
        resource = %event.logical_id,
        kind = %event.resource_type,
        status = %event.status,
        reason,
        "stack event"
      );
      if event.status.ends_with("_FAILED") {
        self.failures.push(format!("{} {}: {}", event.logical_id, event.status, reason));
      }
      self.seen.insert(event.event_id);
    }
    Ok(())
  }

  /// Wait for a terminal status. `None` means the stack is gone.
  pub(crate) async fn wait(&mut self) -> Result<Option<StackSummary>, ApplyError> {
    let started = Instant::now();
    loop {
      let summary = self.stacks.describe_stack(self.stack).await?;
      self.stream_events().await?;
      match &summary {
        None => return Ok(None),
        Some(s) if s.phase().is_terminal() => return Ok(summary),
        Some(s) => debug!(stack = self.stack, status = %s.status, "waiting"),
      }
      if started.elapsed() >= self.timeout {
        return Err(ApplyError::Timeout {
          stack: self.stack.to_string(),
          waited: started.elapsed(),
        });
      }
      tokio::select! {
        _ = self.cancel.cancelled() => return Err(ApplyError::Cancelled(self.stack.to_string())),
        _ = tokio::time::sleep(self.tick) => {}
      }
    }
  }

  /// Failed-resource events seen so far, rendered for an error.
  pub(crate) fn failures(&self) -> Vec<String> {
    self.failures.clone()
  }

  /// Turn the settled summary of a create or update into a result.
  pub(crate) fn settled(&self, summary: Option<StackSummary>) -> Result<StackSummary, ApplyError> {
    let Some(summary) = summary else {
      return Err(ApplyError::MissingStack(self.stack.to_string()));
    };
    // An update that rolled back leaves the stack usable but is still a
    // failed run.
    if summary.phase() != StackPhase::Ready || summary.status.contains("ROLLBACK") {
      return Err(ApplyError::StackFailed {
        stack: self.stack.to_string(),
        status: summary.status,
        events: self.failures(),
      });
    }
    Ok(summary)
  }
}

/// Drive the stack to the built template.
pub(super) async fn converge(ctx: &ProvisionContext) -> Result<(), ApplyError> {
  let request = ctx.stack_request().await?;
  let stacks = ctx.clients.stacks.as_ref();
  let stack = ctx.stack_name.as_str();
  let mut watcher = StackWatcher::new(stacks, stack, ctx.options.tick, ctx.stack_timeout, &ctx.cancel);

  loop {
    debug!(stack, "DescribeStacks");
    let existing = stacks.describe_stack(stack).await?;
    watcher.prime().await?;
    match existing {
      None => {
        info!(stack, "creating stack");
        let id = stacks.create_stack(&request).await?;
        debug!(stack, id, "create submitted");
      }
      Some(summary) => match summary.phase() {
        StackPhase::Deleted => {
          info!(stack, "creating stack");
          stacks.create_stack(&request).await?;
        }
        StackPhase::Ready => match stacks.update_stack(&request).await? {
          UpdateOutcome::NoChanges => {
            info!(stack, status = %summary.status, "stack is up to date");
            ctx.state.lock().await.stack = Some(summary);
            return Ok(());
          }
          UpdateOutcome::Started => info!(stack, "updating stack"),
        },
        StackPhase::InProgress => {
          info!(stack, status = %summary.status, "waiting for the running stack operation");
          watcher.wait().await?;
          continue;
        }
        StackPhase::RollbackComplete => {
          return Err(ApplyError::RollbackComplete {
            stack: stack.to_string(),
            status: summary.status,
          });
        }
        StackPhase::Failed => {
          return Err(ApplyError::NotUpdatable {
            stack: stack.to_string(),
            status: summary.status,
          });
        }
      },
    }

    let settled = watcher.wait().await.and_then(|summary| watcher.settled(summary));
    if let Err(err) = &settled {
      warn!(stack, error = %err, "stack operation failed");
    }
    let summary = settled?;
    info!(stack, status = %summary.status, "stack converged");
    ctx.state.lock().await.stack = Some(summary);
    return Ok(());
  }
}

pub(super) struct FullConvergence;

#[async_trait]
impl Operation for FullConvergence {
  fn name(&self) -> &str {
    "fullConvergence"
  }

  async fn invoke(&self, ctx: &ProvisionContext) -> Result<(), ProvisionError> {
    if ctx.options.noop {
      info!(stack = %ctx.stack_name, resources = ctx.build.template.resources.len(), "noop: skipping stack convergence");
      return Ok(());
    }
    Ok(converge(ctx).await?)
  }
}

/// Apply step when a code pipeline deploys the stack from the trigger
/// archive.
pub(super) struct PipelineHandoff;

#[async_trait]
impl Operation for PipelineHandoff {
  fn name(&self) -> &str {
    "pipelineHandoff"
  }

  async fn invoke(&self, ctx: &ProvisionContext) -> Result<(), ProvisionError> {
    info!(
      stack = %ctx.stack_name,
      trigger = ctx.options.pipeline_trigger.as_deref().unwrap_or_default(),
      "stack is deployed by the code pipeline"
    );
    Ok(())
  }
}

#[cfg(test)]
mod tests {
  use tempfile::TempDir;
  use tracing_test::traced_test;

  use super::*;
  use crate::cloud::memory::{Call, MemoryCloud};
  use crate::config::ProvisionOptions;
  use crate::provision::context::testing::{archive_build, context};

  async fn run(cloud: &std::sync::Arc<MemoryCloud>, temp: &TempDir) -> Result<(), ApplyError> {
    let ctx = context(cloud, archive_build(temp), ProvisionOptions::new("art"));
    converge(&ctx).await
  }

  #[tokio::test]
  async fn absent_stacks_are_created() {
    let temp = TempDir::new().unwrap();
    let cloud = MemoryCloud::new("us-east-1");
    run(&cloud, &temp).await.unwrap();
    assert_eq!(cloud.stack("svc").await.unwrap().status, "CREATE_COMPLETE");
    assert!(cloud.calls().await.contains(&Call::CreateStack("svc".to_string())));
  }

  #[tokio::test]
  async fn unchanged_stacks_are_left_alone() {
    let temp = TempDir::new().unwrap();
    let cloud = MemoryCloud::new("us-east-1");
    let ctx = context(&cloud, archive_build(&temp), ProvisionOptions::new("art"));
    converge(&ctx).await.unwrap();
    converge(&ctx).await.unwrap();
    let calls = cloud.calls().await;
    let creates = calls.iter().filter(|c| matches!(c, Call::CreateStack(_))).count();
    assert_eq!(creates, 1);
    assert!(calls.contains(&Call::UpdateStack("svc".to_string())));
    assert_eq!(cloud.stack("svc").await.unwrap().status, "CREATE_COMPLETE");
  }

  #[tokio::test]
  async fn rolled_back_creates_need_a_delete() {
    let temp = TempDir::new().unwrap();
    let cloud = MemoryCloud::new("us-east-1");
    cloud.add_stack("svc", "ROLLBACK_COMPLETE", "{}").await;
    let err = run(&cloud, &temp).await.unwrap_err();
    assert!(matches!(err, ApplyError::RollbackComplete { .. }));
    assert!(err.to_string().contains("delete it"));
  }

  #[tokio::test]
  #[traced_test]
  async fn slow_operations_are_waited_on() {
    let temp = TempDir::new().unwrap();
    let cloud = MemoryCloud::new("us-east-1");
    cloud.slow_stack_operations(3).await;
    run(&cloud, &temp).await.unwrap();
    assert_eq!(cloud.stack("svc").await.unwrap().status, "CREATE_COMPLETE");
    assert!(logs_contain("stack event"));
    assert!(logs_contain("stack converged"));
  }

  #[tokio::test]
  async fn failed_creates_report_the_final_status() {
    let temp = TempDir::new().unwrap();
    let cloud = MemoryCloud::new("us-east-1");
    cloud.settle_as("ROLLBACK_COMPLETE").await;
    let err = run(&cloud, &temp).await.unwrap_err();
    let ApplyError::StackFailed { status, .. } = err else {
      panic!("expected a failed stack, got {err}");
    };
    assert_eq!(status, "ROLLBACK_COMPLETE");
  }

  #[tokio::test]
  async fn waiting_gives_up_at_the_timeout() {
    let temp = TempDir::new().unwrap();
    let cloud = MemoryCloud::new("us-east-1");
    cloud.slow_stack_operations(1000).await;
    let mut ctx = context(&cloud, archive_build(&temp), ProvisionOptions::new("art"));
    ctx.stack_timeout = Duration::from_millis(5);
    let err = converge(&ctx).await.unwrap_err();
    assert!(matches!(err, ApplyError::Timeout { .. }));
  }
}
