//! Bounded worker pool.
//!
//! Runs named tasks concurrently and reports each task's outcome under its
//! name. A cancelled token stops tasks that have not started yet; tasks that
//! are already running finish so their side effects can be rolled back.

use std::collections::HashMap;
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use tokio::sync::Semaphore;
use tokio::task::JoinSet;
use tokio_util::sync::CancellationToken;
use tracing::debug;

pub type TaskFuture<T, E> = Pin<Box<dyn Future<Output = Result<T, E>> + Send>>;

pub struct Task<T, E> {
  name: String,
  future: TaskFuture<T, E>,
}

impl<T, E> Task<T, E> {
  pub fn new(name: impl Into<String>, future: impl Future<Output = Result<T, E>> + Send + 'static) -> Self {
    Self {
      name: name.into(),
      future: Box::pin(future),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }
}

#[derive(Debug)]
pub enum TaskError<E> {
  Failed(E),
  Cancelled,
  Panicked(String),
}

impl<E: fmt::Display> fmt::Display for TaskError<E> {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    match self {
      TaskError::Failed(e) => write!(f, "{e}"),
      TaskError::Cancelled => write!(f, "cancelled before start"),
      TaskError::Panicked(msg) => write!(f, "task panicked: {msg}"),
    }
  }
}

impl<E: fmt::Debug + fmt::Display> std::error::Error for TaskError<E> {}

/// Per-task results in submission order.
pub struct PoolOutcome<T, E> {
  pub completed: Vec<(String, T)>,
  pub failed: Vec<(String, TaskError<E>)>,
}

impl<T, E: fmt::Display> PoolOutcome<T, E> {
  pub fn is_success(&self) -> bool {
    self.failed.is_empty()
  }

  /// `name=>error` pairs joined with `, `.
  pub fn render_failures(&self) -> String {
    render_failures(self.failed.iter().map(|(n, e)| (n.as_str(), e)))
  }
}

pub fn render_failures<'a, D: fmt::Display + 'a>(failures: impl IntoIterator<Item = (&'a str, D)>) -> String {
  failures
    .into_iter()
    .map(|(name, err)| format!("{name}=>{err}"))
    .collect::<Vec<_>>()
    .join(", ")
}

#[derive(Debug, Clone)]
pub struct WorkerPool {
  concurrency: usize,
}

impl WorkerPool {
  pub fn new(concurrency: usize) -> Self {
    Self {
      concurrency: concurrency.max(1),
    }
  }

  /// A pool as wide as the task list.
  pub fn for_tasks<T, E>(tasks: &[Task<T, E>]) -> Self {
    Self::new(tasks.len())
  }

  pub async fn run<T, E>(&self, tasks: Vec<Task<T, E>>, cancel: &CancellationToken) -> PoolOutcome<T, E>
  where
    T: Send + 'static,
    E: Send + 'static,
  {
    let semaphore = Arc::new(Semaphore::new(self.concurrency));
    let mut join_set = JoinSet::new();
    let mut index_of = HashMap::new();
    let mut names = Vec::with_capacity(tasks.len());

    debug!(tasks = tasks.len(), concurrency = self.concurrency, "starting worker pool");

    for (idx, task) in tasks.into_iter().enumerate() {
      names.push(task.name);
      let semaphore = semaphore.clone();
      let cancel = cancel.clone();
      let future = task.future;
      let handle = join_set.spawn(async move {
        let Ok(_permit) = semaphore.acquire_owned().await else {
          return (idx, Err(TaskError::Cancelled));
        };
        if cancel.is_cancelled() {
          return (idx, Err(TaskError::Cancelled));
        }
        (idx, future.await.map_err(TaskError::Failed))
      });
      index_of.insert(handle.id(), idx);
    }

    let mut results: Vec<Option<Result<T, TaskError<E>>>> = (0..names.len()).map(|_| None).collect();
    while let Some(joined) = join_set.join_next().await {
      match joined {
        Ok((idx, result)) => results[idx] = Some(result),
        Err(e) => {
          if let Some(&idx) = index_of.get(&e.id()) {
            let message = if e.is_panic() {
              panic_message(e.into_panic())
            } else {
              "aborted".to_string()
            };
            results[idx] = Some(Err(TaskError::Panicked(message)));
          }
        }
      }
    }

    let mut outcome = PoolOutcome {
      completed: Vec::new(),
      failed: Vec::new(),
    };
    for (name, result) in names.into_iter().zip(results) {
      match result {
        Some(Ok(value)) => outcome.completed.push((name, value)),
        Some(Err(e)) => outcome.failed.push((name, e)),
        None => outcome.failed.push((name, TaskError::Cancelled)),
      }
    }
    outcome
  }
}

/// Best-effort text of a panic payload.
pub fn panic_message(payload: Box<dyn std::any::Any + Send>) -> String {
  if let Some(s) = payload.downcast_ref::<&str>() {
    s.to_string()
  } else if let Some(s) = payload.downcast_ref::<String>() {
    s.clone()
  } else {
    "unknown panic payload".to_string()
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use std::sync::atomic::{AtomicUsize, Ordering};

  #[tokio::test]
  async fn results_keep_submission_order() {
    let tasks = vec![
      Task::new("slow", async {
        tokio::time::sleep(std::time::Duration::from_millis(20)).await;
        Ok::<_, String>(1)
      }),
      Task::new("fast", async { Ok(2) }),
    ];
    let pool = WorkerPool::for_tasks(&tasks);
    let outcome = pool.run(tasks, &CancellationToken::new()).await;
    assert!(outcome.is_success());
    assert_eq!(outcome.completed, vec![("slow".to_string(), 1), ("fast".to_string(), 2)]);
  }

  #[tokio::test]
  async fn failures_are_rendered_by_name() {
    let tasks = vec![
      Task::new("a", async { Err::<(), _>("boom".to_string()) }),
      Task::new("b", async { Ok(()) }),
      Task::new("c", async { Err("bang".to_string()) }),
    ];
    let outcome = WorkerPool::new(3).run(tasks, &CancellationToken::new()).await;
    assert_eq!(outcome.completed.len(), 1);
    assert_eq!(outcome.render_failures(), "a=>boom, c=>bang");
  }

  #[tokio::test]
  async fn cancelled_pool_starts_nothing() {
    let started = Arc::new(AtomicUsize::new(0));
    let cancel = CancellationToken::new();
    cancel.cancel();
    let tasks: Vec<Task<(), String>> = (0..3)
      .map(|i| {
        let started = started.clone();
        Task::new(format!("t{i}"), async move {
          started.fetch_add(1, Ordering::SeqCst);
          Ok(())
        })
      })
      .collect();
    let outcome = WorkerPool::new(3).run(tasks, &cancel).await;
    assert_eq!(started.load(Ordering::SeqCst), 0);
    assert_eq!(outcome.failed.len(), 3);
  }

  #[tokio::test]
  async fn panics_are_captured() {
    let tasks: Vec<Task<(), String>> = vec![Task::new("p", async { panic!("kaboom") })];
    let outcome = WorkerPool::new(1).run(tasks, &CancellationToken::new()).await;
    assert!(matches!(&outcome.failed[0].1, TaskError::Panicked(m) if m == "kaboom"));
  }
}
