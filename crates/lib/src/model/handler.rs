//! Handler adapters.
//!
//! User handlers are ordinary async closures. Each accepted shape takes
//! zero, one or two extractor arguments ([`Context`], [`Event<E>`]) and
//! returns `Result<T, E>`. `T = ()` is the error-only shape. Registration
//! erases the closure into an [`Arc<dyn Handler>`] carrying a [`Signature`]
//! that is validated before the function is accepted.

use std::any::{TypeId, type_name};
use std::fmt;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;

use serde::Serialize;
use serde::de::DeserializeOwned;
use serde_json::Value;
use thiserror::Error;

use super::ModelError;
use crate::runtime::Context;

pub type BoxError = Box<dyn std::error::Error + Send + Sync>;

pub type HandlerFuture = Pin<Box<dyn Future<Output = Result<Value, HandlerError>> + Send>>;

#[derive(Debug, Error)]
pub enum HandlerError {
  #[error("failed to decode event as {type_name}: {source}")]
  Decode {
    type_name: &'static str,
    #[source]
    source: serde_json::Error,
  },

  #[error("failed to encode handler response: {0}")]
  Encode(#[source] serde_json::Error),

  #[error("{0}")]
  User(BoxError),

  #[error("handler panicked: {0}")]
  Panicked(String),

  #[error("handler task was cancelled")]
  Cancelled,
}

impl HandlerError {
  pub fn user(err: impl Into<BoxError>) -> Self {
    HandlerError::User(err.into())
  }
}

/// One declared handler parameter.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Param {
  Context,
  Event(&'static str),
}

/// One declared handler return slot.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Return {
  Value(&'static str),
  Error,
}

/// The declared shape of a handler.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Signature {
  pub params: Vec<Param>,
  pub returns: Vec<Return>,
}

impl Signature {
  pub fn new(params: Vec<Param>, returns: Vec<Return>) -> Self {
    Self { params, returns }
  }

  /// Check this signature against the eight accepted shapes.
  pub fn validate(&self, function: &str) -> Result<(), ModelError> {
    let invalid = |reason: String| ModelError::InvalidSignature {
      function: function.to_string(),
      reason,
    };

    if self.params.len() > 2 {
      return Err(invalid(format!(
        "accepts at most 2 parameters, found {}",
        self.params.len()
      )));
    }
    let contexts = self.params.iter().filter(|p| matches!(p, Param::Context)).count();
    let events = self.params.len() - contexts;
    if contexts > 1 || events > 1 {
      return Err(invalid("declares more than one context or event parameter".to_string()));
    }
    if self.params.len() == 2 && self.params[0] != Param::Context {
      return Err(invalid("the context must be the first of two parameters".to_string()));
    }

    match self.returns.as_slice() {
      [Return::Error] | [Return::Value(_), Return::Error] => Ok(()),
      [] => Err(invalid("must return an error".to_string())),
      r if r.len() > 2 => Err(invalid(format!("returns at most 2 values, found {}", r.len()))),
      _ => Err(invalid("the last return value must be an error".to_string())),
    }
  }

  pub fn takes_context(&self) -> bool {
    self.params.contains(&Param::Context)
  }

  pub fn event_type(&self) -> Option<&'static str> {
    self.params.iter().find_map(|p| match p {
      Param::Event(t) => Some(*t),
      Param::Context => None,
    })
  }
}

impl fmt::Display for Signature {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    let params: Vec<String> = self
      .params
      .iter()
      .map(|p| match p {
        Param::Context => "ctx".to_string(),
        Param::Event(t) => format!("event: {}", t),
      })
      .collect();
    let returns: Vec<String> = self
      .returns
      .iter()
      .map(|r| match r {
        Return::Value(t) => t.to_string(),
        Return::Error => "error".to_string(),
      })
      .collect();
    write!(f, "({}) -> ({})", params.join(", "), returns.join(", "))
  }
}

/// A type-erased handler.
pub trait Handler: Send + Sync {
  fn signature(&self) -> &Signature;

  fn call(&self, ctx: Context, event: Value) -> HandlerFuture;
}

type CallFn = dyn Fn(Context, Value) -> HandlerFuture + Send + Sync;

/// A handler built from a closure and an explicit signature.
pub struct FnHandler {
  signature: Signature,
  call: Box<CallFn>,
}

impl FnHandler {
  pub fn new<F>(signature: Signature, call: F) -> Self
  where
    F: Fn(Context, Value) -> HandlerFuture + Send + Sync + 'static,
  {
    Self {
      signature,
      call: Box::new(call),
    }
  }
}

impl Handler for FnHandler {
  fn signature(&self) -> &Signature {
    &self.signature
  }

  fn call(&self, ctx: Context, event: Value) -> HandlerFuture {
    (self.call)(ctx, event)
  }
}

impl fmt::Debug for FnHandler {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("FnHandler").field("signature", &self.signature).finish()
  }
}

/// Handler arguments that can be built from an invocation.
pub trait FromInvocation: Sized + Send + 'static {
  fn param() -> Param;

  fn from_invocation(ctx: &Context, event: &Value) -> Result<Self, HandlerError>;
}

impl FromInvocation for Context {
  fn param() -> Param {
    Param::Context
  }

  fn from_invocation(ctx: &Context, _event: &Value) -> Result<Self, HandlerError> {
    Ok(ctx.clone())
  }
}

/// The decoded invocation payload.
#[derive(Debug, Clone, PartialEq)]
pub struct Event<E>(pub E);

impl<E: DeserializeOwned + Send + 'static> FromInvocation for Event<E> {
  fn param() -> Param {
    Param::Event(type_name::<E>())
  }

  fn from_invocation(_ctx: &Context, event: &Value) -> Result<Self, HandlerError> {
    serde_json::from_value(event.clone())
      .map(Event)
      .map_err(|source| HandlerError::Decode {
        type_name: type_name::<E>(),
        source,
      })
  }
}

fn returns_of<T: 'static>() -> Vec<Return> {
  if TypeId::of::<T>() == TypeId::of::<()>() {
    vec![Return::Error]
  } else {
    vec![Return::Value(type_name::<T>()), Return::Error]
  }
}

fn respond<T: Serialize, Er: Into<BoxError>>(result: Result<T, Er>) -> Result<Value, HandlerError> {
  match result {
    Ok(value) => serde_json::to_value(value).map_err(HandlerError::Encode),
    Err(err) => Err(HandlerError::User(err.into())),
  }
}

/// Conversion of a user closure into an erased handler.
///
/// `Args` only disambiguates the implementations.
pub trait IntoHandler<Args>: Send + Sync + 'static {
  fn into_handler(self) -> Arc<dyn Handler>;
}

impl<F, Fut, T, Er> IntoHandler<()> for F
where
  F: Fn() -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, Er>> + Send + 'static,
  T: Serialize + 'static,
  Er: Into<BoxError> + 'static,
{
  fn into_handler(self) -> Arc<dyn Handler> {
    let signature = Signature::new(Vec::new(), returns_of::<T>());
    let f = Arc::new(self);
    Arc::new(FnHandler::new(signature, move |_ctx, _event| {
      let f = f.clone();
      Box::pin(async move { respond(f().await) })
    }))
  }
}

impl<F, Fut, A, T, Er> IntoHandler<(A,)> for F
where
  F: Fn(A) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, Er>> + Send + 'static,
  A: FromInvocation,
  T: Serialize + 'static,
  Er: Into<BoxError> + 'static,
{
  fn into_handler(self) -> Arc<dyn Handler> {
    let signature = Signature::new(vec![A::param()], returns_of::<T>());
    let f = Arc::new(self);
    Arc::new(FnHandler::new(signature, move |ctx, event| {
      let f = f.clone();
      Box::pin(async move {
        let a = A::from_invocation(&ctx, &event)?;
        respond(f(a).await)
      })
    }))
  }
}

impl<F, Fut, E, T, Er> IntoHandler<(Context, Event<E>)> for F
where
  F: Fn(Context, Event<E>) -> Fut + Send + Sync + 'static,
  Fut: Future<Output = Result<T, Er>> + Send + 'static,
  E: DeserializeOwned + Send + 'static,
  T: Serialize + 'static,
  Er: Into<BoxError> + 'static,
{
  fn into_handler(self) -> Arc<dyn Handler> {
    let signature = Signature::new(vec![Param::Context, Event::<E>::param()], returns_of::<T>());
    let f = Arc::new(self);
    Arc::new(FnHandler::new(signature, move |ctx, event| {
      let f = f.clone();
      Box::pin(async move {
        let e = Event::<E>::from_invocation(&ctx, &event)?;
        respond(f(ctx, e).await)
      })
    }))
  }
}

impl IntoHandler<Arc<dyn Handler>> for Arc<dyn Handler> {
  fn into_handler(self) -> Arc<dyn Handler> {
    self
  }
}

impl IntoHandler<FnHandler> for FnHandler {
  fn into_handler(self) -> Arc<dyn Handler> {
    Arc::new(self)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde::Deserialize;
  use serde_json::json;

  #[derive(Debug, Deserialize)]
  struct Greeting {
    name: String,
  }

  type Res<T> = Result<T, BoxError>;

  fn sig<Args, H: IntoHandler<Args>>(h: H) -> Signature {
    h.into_handler().signature().clone()
  }

  #[test]
  fn all_eight_shapes_validate() {
    let shapes = vec![
      sig(|| async { Res::Ok("x".to_string()) }),
      sig(|| async { Res::Ok(()) }),
      sig(|_ctx: Context| async { Res::Ok(1u32) }),
      sig(|_ctx: Context| async { Res::Ok(()) }),
      sig(|_e: Event<Greeting>| async { Res::Ok(true) }),
      sig(|_e: Event<Greeting>| async { Res::Ok(()) }),
      sig(|_ctx: Context, _e: Event<Greeting>| async { Res::Ok(json!({})) }),
      sig(|_ctx: Context, _e: Event<Greeting>| async { Res::Ok(()) }),
    ];
    for s in shapes {
      s.validate("f").unwrap_or_else(|e| panic!("{} should validate: {}", s, e));
    }
  }

  #[test]
  fn error_only_shape_has_single_return() {
    let s = sig(|_ctx: Context| async { Res::Ok(()) });
    assert_eq!(s.returns, vec![Return::Error]);
    assert!(s.takes_context());
    assert_eq!(s.event_type(), None);
  }

  #[test]
  fn invalid_shapes_are_rejected_with_function_name() {
    let bad = [
      Signature::new(
        vec![Param::Context, Param::Event("A"), Param::Event("B")],
        vec![Return::Error],
      ),
      Signature::new(vec![Param::Event("A"), Param::Context], vec![Return::Error]),
      Signature::new(vec![Param::Event("A"), Param::Event("B")], vec![Return::Error]),
      Signature::new(vec![], vec![]),
      Signature::new(vec![], vec![Return::Value("T")]),
      Signature::new(vec![], vec![Return::Error, Return::Value("T")]),
      Signature::new(
        vec![],
        vec![Return::Value("T"), Return::Value("U"), Return::Error],
      ),
    ];
    for s in bad {
      let err = s.validate("myFunc").unwrap_err();
      assert!(err.to_string().contains("myFunc"), "{}", err);
    }
  }

  #[tokio::test]
  async fn event_is_decoded_into_declared_type() {
    let h = (|_ctx: Context, Event(g): Event<Greeting>| async move { Res::Ok(format!("hi {}", g.name)) })
      .into_handler();
    let out = h.call(Context::default(), json!({"name": "bob"})).await.unwrap();
    assert_eq!(out, json!("hi bob"));
  }

  #[tokio::test]
  async fn decode_failure_is_reported() {
    let h = (|Event(g): Event<Greeting>| async move { Res::Ok(g.name) }).into_handler();
    let err = h.call(Context::default(), json!({"nope": 1})).await.unwrap_err();
    assert!(matches!(err, HandlerError::Decode { .. }));
  }

  #[tokio::test]
  async fn user_error_is_propagated() {
    let h = (|| async { Res::<()>::Err("boom".into()) }).into_handler();
    let err = h.call(Context::default(), Value::Null).await.unwrap_err();
    assert_eq!(err.to_string(), "boom");
  }
}
