use async_trait::async_trait;
use tracing::info;

use super::{ApplyError, Operation, ProvisionContext, ProvisionError};

/// Read the final stack state and log its outputs.
pub(super) struct DescribeStack;

#[async_trait]
impl Operation for DescribeStack {
  fn name(&self) -> &str {
    "describeStack"
  }

  async fn invoke(&self, ctx: &ProvisionContext) -> Result<(), ProvisionError> {
    if ctx.options.noop {
      info!(stack = %ctx.stack_name, "noop: skipping describe");
      return Ok(());
    }
    let summary = ctx
      .clients
      .stacks
      .describe_stack(&ctx.stack_name)
      .await
      .map_err(ApplyError::from)?;
    match &summary {
      Some(summary) => {
        info!(stack = %ctx.stack_name, status = %summary.status, "stack status");
        for (name, value) in &summary.outputs {
          info!(output = %name, value = %value, "stack output");
        }
      }
      None => info!(stack = %ctx.stack_name, "stack does not exist yet"),
    }
    ctx.state.lock().await.stack = summary;
    Ok(())
  }
}
