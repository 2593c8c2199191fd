//! Provider entry point for the dispatcher binary.

use std::sync::Arc;

use lambda_runtime::{LambdaEvent, service_fn};
use serde_json::Value;
use tracing::{error, info};
use tracing_subscriber::EnvFilter;

use super::{Context, DispatchError, Dispatcher, build_id};
use crate::consts::{ENV_CUSTOM_RESOURCE_TYPE, ENV_FUNCTION_NAME, ENV_LOG_LEVEL};
use crate::model::{BoxError, Service};

/// Log filter: `RUST_LOG` when set, else `CIRRUS_LOG_LEVEL`, else `info`.
pub fn env_filter() -> EnvFilter {
  if std::env::var_os("RUST_LOG").is_some() {
    return EnvFilter::from_default_env();
  }
  let level = std::env::var(ENV_LOG_LEVEL).unwrap_or_else(|_| "info".to_string());
  EnvFilter::try_new(level.to_ascii_lowercase()).unwrap_or_else(|_| EnvFilter::new("info"))
}

/// Plain-text subscriber without timestamps; the provider stamps each line.
pub fn init_logging() {
  let _ = tracing_subscriber::fmt()
    .with_env_filter(env_filter())
    .without_time()
    .with_ansi(false)
    .try_init();
}

/// Route this process to its handler and serve invocations until the
/// provider shuts the sandbox down.
pub async fn run(service: &Service) -> Result<(), BoxError> {
  let dispatcher = Arc::new(Dispatcher::new(service));
  let function_name = std::env::var(ENV_FUNCTION_NAME).unwrap_or_default();
  let custom_type = std::env::var(ENV_CUSTOM_RESOURCE_TYPE).ok().filter(|t| !t.is_empty());

  let target = match dispatcher.route(&function_name, custom_type.as_deref()) {
    Ok(target) => target.clone(),
    Err(err @ DispatchError::NoHandler { .. }) => {
      error!(error = %err, "cannot route invocation");
      return Err(err.into());
    }
  };
  let build_id = build_id();
  info!(function = %function_name, handler = %target.name, build_id = %build_id, "dispatcher ready");

  lambda_runtime::run(service_fn(move |event: LambdaEvent<Value>| {
    let dispatcher = dispatcher.clone();
    let target = target.clone();
    let ctx = Context::from_lambda(event.context, build_id.clone());
    async move {
      dispatcher
        .invoke(&target, ctx, event.payload)
        .await
        .map_err(|err| lambda_runtime::Error::from(err.to_string()))
    }
  }))
  .await
}
