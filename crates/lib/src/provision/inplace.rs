//! In-place update: push new code straight to the functions when the only
//! thing that changed is their code.

use async_trait::async_trait;
use tracing::{debug, info, warn};

use super::converge::converge;
use super::{ApplyError, Operation, ProvisionContext, ProvisionError};
use crate::cloud::ResourceChange;
use crate::config::InPlaceFallback;
use crate::util::pool::{Task, WorkerPool};

const FUNCTION_TYPE: &str = "AWS::Lambda::Function";

/// Whether `change` only touches a function's code.
pub(super) fn is_code_change(change: &ResourceChange) -> bool {
  change.action == "Modify"
    && change.resource_type == FUNCTION_TYPE
    && !change.properties.is_empty()
    && change.properties.iter().all(|p| p == "Code")
}

/// Change set names must start with a letter and hold only letters, digits
/// and hyphens.
pub(super) fn change_set_name(build_id: &str) -> String {
  let id: String = build_id
    .chars()
    .map(|c| if c.is_ascii_alphanumeric() { c } else { '-' })
    .collect();
  format!("cirrus-inplace-{id}")
}

pub(super) struct InPlaceUpdate;

impl InPlaceUpdate {
  async fn fall_back(&self, ctx: &ProvisionContext, refused: ApplyError) -> Result<(), ApplyError> {
    match ctx.options.in_place_fallback {
      InPlaceFallback::Refuse => Err(refused),
      InPlaceFallback::Converge => {
        warn!(stack = %ctx.stack_name, reason = %refused, "falling back to full convergence");
        converge(ctx).await
      }
    }
  }

  async fn update_functions(&self, ctx: &ProvisionContext, functions: Vec<String>) -> Result<(), ApplyError> {
    let Some(code) = ctx.state.lock().await.code.clone() else {
      return Err(ApplyError::CodeUpdates("no code artifact was uploaded".to_string()));
    };
    let tasks: Vec<Task<(), ApplyError>> = functions
      .into_iter()
      .map(|function| {
        let updater = ctx.clients.functions.clone();
        let code = code.clone();
        Task::new(function.clone(), async move {
          debug!(function, "UpdateFunctionCode");
          updater.update_function_code(&function, &code).await?;
          info!(function, "function code updated");
          Ok(())
        })
      })
      .collect();
    let outcome = WorkerPool::for_tasks(&tasks).run(tasks, &ctx.cancel).await;
    if !outcome.is_success() {
      return Err(ApplyError::CodeUpdates(outcome.render_failures()));
    }
    Ok(())
  }

  async fn run(&self, ctx: &ProvisionContext) -> Result<(), ApplyError> {
    let stack = ctx.stack_name.as_str();
    let stacks = ctx.clients.stacks.as_ref();
    if stacks.describe_stack(stack).await?.is_none() {
      return self.fall_back(ctx, ApplyError::MissingStack(stack.to_string())).await;
    }

    let request = ctx.stack_request().await?;
    let name = change_set_name(&ctx.build.build_id);
    debug!(stack, change_set = %name, "CreateChangeSet");
    let change_set = stacks.create_change_set(&request, &name).await?;

    let (code, other): (Vec<_>, Vec<_>) = change_set.changes.into_iter().partition(is_code_change);
    let result = if code.is_empty() && other.is_empty() {
      info!(stack, "no changes to apply");
      Ok(())
    } else if other.is_empty() {
      let functions = code
        .into_iter()
        .map(|c| c.physical_id.unwrap_or(c.logical_id))
        .collect();
      self.update_functions(ctx, functions).await
    } else {
      Err(ApplyError::InPlaceRefused { changes: other })
    };

    if let Err(err) = stacks.delete_change_set(stack, &name).await {
      warn!(stack, change_set = %name, error = %err, "failed to delete change set");
    }

    match result {
      Err(refused @ ApplyError::InPlaceRefused { .. }) => self.fall_back(ctx, refused).await,
      other => other,
    }
  }
}

#[async_trait]
impl Operation for InPlaceUpdate {
  fn name(&self) -> &str {
    "inPlaceUpdate"
  }

  async fn invoke(&self, ctx: &ProvisionContext) -> Result<(), ProvisionError> {
    if ctx.options.noop {
      info!(stack = %ctx.stack_name, "noop: skipping in-place update");
      return Ok(());
    }
    Ok(self.run(ctx).await?)
  }
}
