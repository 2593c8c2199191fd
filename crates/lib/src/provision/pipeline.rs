//! Staged execution with rollback.
//!
//! Stages run in order; the operations of a stage run concurrently and are
//! joined before the next stage starts. When a stage fails, every stage up to
//! and including it is rolled back in reverse order.

use std::sync::Arc;
use std::time::{Duration, Instant};

use async_trait::async_trait;
use tokio_util::sync::CancellationToken;
use tracing::{debug, info, warn};

use super::{ProvisionContext, ProvisionError};
use crate::util::pool::{Task, TaskError, WorkerPool};

/// Deadline for the rollbacks of one stage. Rollbacks run even after
/// cancellation, so they get their own bound.
const ROLLBACK_TIMEOUT: Duration = Duration::from_secs(5 * 60);

#[async_trait]
pub trait Operation: Send + Sync {
  fn name(&self) -> &str;

  async fn invoke(&self, ctx: &ProvisionContext) -> Result<(), ProvisionError>;

  async fn rollback(&self, _ctx: &ProvisionContext) -> Result<(), ProvisionError> {
    Ok(())
  }
}

pub struct Stage {
  pub name: String,
  pub operations: Vec<Arc<dyn Operation>>,
}

#[derive(Default)]
pub struct Pipeline {
  stages: Vec<Stage>,
}

impl Pipeline {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn stage(mut self, name: impl Into<String>, operations: Vec<Arc<dyn Operation>>) -> Self {
    self.stages.push(Stage {
      name: name.into(),
      operations,
    });
    self
  }

  pub fn stage_names(&self) -> Vec<&str> {
    self.stages.iter().map(|s| s.name.as_str()).collect()
  }

  pub fn operation_names(&self, stage: &str) -> Vec<&str> {
    self
      .stages
      .iter()
      .filter(|s| s.name == stage)
      .flat_map(|s| s.operations.iter().map(|op| op.name()))
      .collect()
  }

  pub async fn run(&self, ctx: Arc<ProvisionContext>) -> Result<(), ProvisionError> {
    for (idx, stage) in self.stages.iter().enumerate() {
      let started = Instant::now();
      let failures = if ctx.cancel.is_cancelled() {
        vec![("pipeline".to_string(), ProvisionError::Cancelled)]
      } else {
        run_stage(stage, &ctx).await
      };

      if failures.is_empty() {
        info!(stage = %stage.name, elapsed = ?started.elapsed(), "stage complete");
        continue;
      }

      let err = ProvisionError::Stage {
        stage: stage.name.clone(),
        failures,
      };
      warn!(stage = %stage.name, error = %err, "stage failed, rolling back");
      for done in self.stages[..=idx].iter().rev() {
        rollback_stage(done, &ctx).await;
      }
      return Err(err);
    }
    Ok(())
  }
}

fn flatten(err: TaskError<ProvisionError>) -> ProvisionError {
  match err {
    TaskError::Failed(e) => e,
    TaskError::Cancelled => ProvisionError::Cancelled,
    TaskError::Panicked(msg) => ProvisionError::Panicked(msg),
  }
}

async fn run_stage(stage: &Stage, ctx: &Arc<ProvisionContext>) -> Vec<(String, ProvisionError)> {
  let tasks: Vec<Task<(), ProvisionError>> = stage
    .operations
    .iter()
    .map(|op| {
      let op = op.clone();
      let ctx = ctx.clone();
      Task::new(op.name().to_string(), async move {
        debug!(operation = op.name(), "invoking");
        op.invoke(&ctx).await
      })
    })
    .collect();
  let outcome = WorkerPool::for_tasks(&tasks).run(tasks, &ctx.cancel).await;
  outcome.failed.into_iter().map(|(name, e)| (name, flatten(e))).collect()
}

async fn rollback_stage(stage: &Stage, ctx: &Arc<ProvisionContext>) {
  let tasks: Vec<Task<(), ProvisionError>> = stage
    .operations
    .iter()
    .map(|op| {
      let op = op.clone();
      let ctx = ctx.clone();
      Task::new(op.name().to_string(), async move {
        match tokio::time::timeout(ROLLBACK_TIMEOUT, op.rollback(&ctx)).await {
          Ok(result) => result,
          Err(_) => Err(ProvisionError::Cancelled),
        }
      })
    })
    .collect();
  // A fresh token: cancellation of the run must not skip its rollbacks.
  let outcome = WorkerPool::for_tasks(&tasks).run(tasks, &CancellationToken::new()).await;
  for (name, err) in outcome.failed {
    warn!(stage = %stage.name, operation = %name, error = %err, "rollback failed");
  }
  debug!(stage = %stage.name, "rolled back");
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex as StdMutex;

  use super::*;
  use crate::cloud::memory::MemoryCloud;
  use crate::config::{BuildConfig, ProvisionOptions};
  use crate::package::{Artifact, BuildOutput};
  use crate::template::Template;
  use crate::util::hash::ContentHash;

  type Journal = Arc<StdMutex<Vec<String>>>;

  struct Recorder {
    name: String,
    journal: Journal,
    fail: bool,
  }

  #[async_trait]
  impl Operation for Recorder {
    fn name(&self) -> &str {
      &self.name
    }

    async fn invoke(&self, _ctx: &ProvisionContext) -> Result<(), ProvisionError> {
      self.journal.lock().unwrap().push(format!("invoke {}", self.name));
      if self.fail {
        return Err(ProvisionError::Panicked(format!("{} broke", self.name)));
      }
      Ok(())
    }

    async fn rollback(&self, _ctx: &ProvisionContext) -> Result<(), ProvisionError> {
      self.journal.lock().unwrap().push(format!("rollback {}", self.name));
      if self.name == "b" {
        return Err(ProvisionError::Cancelled);
      }
      Ok(())
    }
  }

  fn op(name: &str, journal: &Journal, fail: bool) -> Arc<dyn Operation> {
    Arc::new(Recorder {
      name: name.to_string(),
      journal: journal.clone(),
      fail,
    })
  }

  fn ctx(cancel: CancellationToken) -> Arc<ProvisionContext> {
    let build = BuildOutput {
      service_name: "svc".to_string(),
      build_id: "b1".to_string(),
      template: Template::new("t"),
      template_path: "svc-cftemplate.json".into(),
      artifact: Artifact::Archive {
        path: "svc-code.zip".into(),
        digest: ContentHash("00".to_string()),
      },
      site_archive: None,
    };
    let clients = MemoryCloud::new("us-east-1").clients();
    Arc::new(ProvisionContext::new(
      build,
      &BuildConfig::default(),
      ProvisionOptions::new("bucket"),
      clients,
      cancel,
    ))
  }

  #[tokio::test]
  async fn stages_run_in_order() {
    let journal = Journal::default();
    let pipeline = Pipeline::new()
      .stage("one", vec![op("a", &journal, false)])
      .stage("two", vec![op("c", &journal, false)]);
    pipeline.run(ctx(CancellationToken::new())).await.unwrap();
    assert_eq!(*journal.lock().unwrap(), ["invoke a", "invoke c"]);
  }

  #[tokio::test]
  async fn failure_rolls_back_through_the_failed_stage() {
    let journal = Journal::default();
    let pipeline = Pipeline::new()
      .stage("one", vec![op("a", &journal, false)])
      .stage("two", vec![op("b", &journal, false), op("c", &journal, true)])
      .stage("three", vec![op("d", &journal, false)]);
    let err = pipeline.run(ctx(CancellationToken::new())).await.unwrap_err();

    assert_eq!(err.stage(), Some("two"));
    assert_eq!(err.to_string(), "stage two failed: c=>operation panicked: c broke");
    let journal = journal.lock().unwrap();
    assert!(!journal.contains(&"invoke d".to_string()));
    assert!(!journal.contains(&"rollback d".to_string()));
    // b's rollback fails; a is still rolled back after it.
    let pos = |s: &str| journal.iter().position(|j| j == s).unwrap();
    assert!(pos("rollback b") < pos("rollback a"));
    assert!(pos("rollback c") < pos("rollback a"));
  }

  #[tokio::test]
  async fn cancelled_runs_start_nothing_but_still_roll_back() {
    let journal = Journal::default();
    let cancel = CancellationToken::new();
    cancel.cancel();
    let pipeline = Pipeline::new().stage("one", vec![op("a", &journal, false)]);
    let err = pipeline.run(ctx(cancel)).await.unwrap_err();
    assert!(matches!(err.causes().as_slice(), [ProvisionError::Cancelled]));
    assert_eq!(*journal.lock().unwrap(), ["rollback a"]);
  }
}
