//! Per-invocation context threaded through interceptors and handlers.

use std::any::{Any, TypeId};
use std::collections::HashMap;
use std::fmt;
use std::sync::Arc;

use serde_json::Value;

use crate::model::HandlerError;

/// Invocation context.
///
/// Cheap to clone. Interceptors derive new contexts with [`Context::with`];
/// the dispatcher records the request logger, the last result and the last
/// error here so `AfterDispatch` and `Complete` interceptors can observe them.
#[derive(Clone, Default)]
pub struct Context {
  request_id: String,
  function_arn: String,
  build_id: String,
  lambda: Option<lambda_runtime::Context>,
  request_logger: Option<tracing::Span>,
  response: Option<Value>,
  error: Option<Arc<HandlerError>>,
  values: HashMap<TypeId, Arc<dyn Any + Send + Sync>>,
}

impl Context {
  pub fn new(request_id: impl Into<String>, function_arn: impl Into<String>, build_id: impl Into<String>) -> Self {
    Self {
      request_id: request_id.into(),
      function_arn: function_arn.into(),
      build_id: build_id.into(),
      ..Self::default()
    }
  }

  pub fn from_lambda(lambda: lambda_runtime::Context, build_id: impl Into<String>) -> Self {
    Self {
      request_id: lambda.request_id.clone(),
      function_arn: lambda.invoked_function_arn.clone(),
      build_id: build_id.into(),
      lambda: Some(lambda),
      ..Self::default()
    }
  }

  pub fn request_id(&self) -> &str {
    &self.request_id
  }

  pub fn function_arn(&self) -> &str {
    &self.function_arn
  }

  pub fn build_id(&self) -> &str {
    &self.build_id
  }

  /// The provider's invocation context, when running inside the provider.
  pub fn lambda_context(&self) -> Option<&lambda_runtime::Context> {
    self.lambda.as_ref()
  }

  /// Span carrying request id, function ARN and build id.
  pub fn request_logger(&self) -> tracing::Span {
    self.request_logger.clone().unwrap_or_else(tracing::Span::current)
  }

  pub fn response(&self) -> Option<&Value> {
    self.response.as_ref()
  }

  pub fn error(&self) -> Option<&HandlerError> {
    self.error.as_deref()
  }

  /// Typed value previously attached with [`Context::with`].
  pub fn get<T: Any + Send + Sync>(&self) -> Option<&T> {
    self
      .values
      .get(&TypeId::of::<T>())
      .and_then(|v| v.downcast_ref::<T>())
  }

  /// Derive a context carrying `value`, replacing any value of the same type.
  pub fn with<T: Any + Send + Sync>(mut self, value: T) -> Self {
    self.values.insert(TypeId::of::<T>(), Arc::new(value));
    self
  }

  pub(crate) fn set_request_logger(&mut self, span: tracing::Span) {
    self.request_logger = Some(span);
  }

  pub(crate) fn set_response(&mut self, response: Option<Value>) {
    self.response = response;
  }

  pub(crate) fn set_error(&mut self, error: Option<Arc<HandlerError>>) {
    self.error = error;
  }
}

impl fmt::Debug for Context {
  fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
    f.debug_struct("Context")
      .field("request_id", &self.request_id)
      .field("function_arn", &self.function_arn)
      .field("build_id", &self.build_id)
      .field("has_error", &self.error.is_some())
      .finish()
  }
}
