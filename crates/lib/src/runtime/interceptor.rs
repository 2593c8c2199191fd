//! Dispatcher lifecycle hooks.

use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use super::Context;

/// Lifecycle phases, in the order the dispatcher runs them.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Phase {
  Begin,
  BeforeSetup,
  AfterSetup,
  BeforeDispatch,
  AfterDispatch,
  /// Runs on every exit path, including handler errors and panics.
  Complete,
}

impl Phase {
  pub const ALL: [Phase; 6] = [
    Phase::Begin,
    Phase::BeforeSetup,
    Phase::AfterSetup,
    Phase::BeforeDispatch,
    Phase::AfterDispatch,
    Phase::Complete,
  ];
}

impl fmt::Display for Phase {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let name = match self {
      Phase::Begin => "begin",
      Phase::BeforeSetup => "before_setup",
      Phase::AfterSetup => "after_setup",
      Phase::BeforeDispatch => "before_dispatch",
      Phase::AfterDispatch => "after_dispatch",
      Phase::Complete => "complete",
    };
    f.write_str(name)
  }
}

/// Observes each invocation and may derive a new context at every phase.
///
/// Interceptors cannot fail or suppress a handler error; the error is
/// visible through [`Context::error`] at `AfterDispatch` and `Complete`.
pub trait Interceptor: Send + Sync {
  fn begin(&self, ctx: Context, _event: &Value) -> Context {
    ctx
  }

  fn before_setup(&self, ctx: Context, _event: &Value) -> Context {
    ctx
  }

  fn after_setup(&self, ctx: Context, _event: &Value) -> Context {
    ctx
  }

  fn before_dispatch(&self, ctx: Context, _event: &Value) -> Context {
    ctx
  }

  fn after_dispatch(&self, ctx: Context, _event: &Value) -> Context {
    ctx
  }

  fn complete(&self, ctx: Context, _event: &Value) -> Context {
    ctx
  }

  fn intercept(&self, phase: Phase, ctx: Context, event: &Value) -> Context {
    match phase {
      Phase::Begin => self.begin(ctx, event),
      Phase::BeforeSetup => self.before_setup(ctx, event),
      Phase::AfterSetup => self.after_setup(ctx, event),
      Phase::BeforeDispatch => self.before_dispatch(ctx, event),
      Phase::AfterDispatch => self.after_dispatch(ctx, event),
      Phase::Complete => self.complete(ctx, event),
    }
  }
}

/// An interceptor for a single phase, built from a closure.
pub struct OnPhase<F> {
  phase: Phase,
  f: F,
}

/// Run `f` at `phase` only.
pub fn on_phase<F>(phase: Phase, f: F) -> OnPhase<F>
where
  F: Fn(Context, &Value) -> Context + Send + Sync,
{
  OnPhase { phase, f }
}

impl<F> Interceptor for OnPhase<F>
where
  F: Fn(Context, &Value) -> Context + Send + Sync,
{
  fn intercept(&self, phase: Phase, ctx: Context, event: &Value) -> Context {
    if phase == self.phase { (self.f)(ctx, event) } else { ctx }
  }
}

/// Run every interceptor for `phase` in registration order.
pub(crate) fn run_phase(interceptors: &[Arc<dyn Interceptor>], phase: Phase, ctx: Context, event: &Value) -> Context {
  interceptors
    .iter()
    .fold(ctx, |ctx, interceptor| interceptor.intercept(phase, ctx, event))
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use super::*;

  #[derive(Default)]
  struct Recorder(Mutex<Vec<Phase>>);

  impl Interceptor for Recorder {
    fn intercept(&self, phase: Phase, ctx: Context, _event: &Value) -> Context {
      self.0.lock().unwrap().push(phase);
      ctx
    }
  }

  #[test]
  fn phases_run_in_registration_order() {
    let first = Arc::new(on_phase(Phase::Begin, |ctx, _| ctx.with(1u8)));
    let second = Arc::new(on_phase(Phase::Begin, |ctx, _| {
      let seen = ctx.get::<u8>().copied().unwrap_or_default();
      ctx.with(seen + 1)
    }));
    let chain: Vec<Arc<dyn Interceptor>> = vec![first, second];
    let ctx = run_phase(&chain, Phase::Begin, Context::default(), &Value::Null);
    assert_eq!(ctx.get::<u8>(), Some(&2));

    let untouched = run_phase(&chain, Phase::Complete, Context::default(), &Value::Null);
    assert!(untouched.get::<u8>().is_none());
  }

  #[test]
  fn default_methods_see_every_phase() {
    let recorder = Arc::new(Recorder::default());
    let chain: Vec<Arc<dyn Interceptor>> = vec![recorder.clone()];
    for phase in Phase::ALL {
      run_phase(&chain, phase, Context::default(), &Value::Null);
    }
    assert_eq!(*recorder.0.lock().unwrap(), Phase::ALL.to_vec());
  }
}
