//! Invocation routing.
//!
//! One binary serves every function in the stack. The process works out
//! which handler it is from its environment once, then runs each invocation
//! through the interceptor chain.

use std::collections::BTreeMap;
use std::sync::Arc;

use serde_json::Value;
use thiserror::Error;
use tracing::{Instrument, debug, info_span};

use super::cfn::{self, CustomResourceRequest};
use super::interceptor::{Interceptor, Phase, run_phase};
use super::{Context, configurators};
use crate::model::{CustomResourceHandler, Handler, HandlerError, HandlerFuture, Param, Return, Service, Signature};
use crate::util::pool::panic_message;

#[derive(Debug, Error)]
pub enum DispatchError {
  #[error(
    "no handler for function {function_name:?} (custom resource type {custom_type:?}); registered: {}",
    registered.join(", ")
  )]
  NoHandler {
    function_name: String,
    custom_type: Option<String>,
    registered: Vec<String>,
  },
}

/// Serves a custom resource type through the request/response protocol.
pub struct CustomResourceAdapter {
  handler: Arc<dyn CustomResourceHandler>,
  client: reqwest::Client,
  signature: Signature,
}

impl CustomResourceAdapter {
  pub fn new(handler: Arc<dyn CustomResourceHandler>) -> Self {
    Self {
      handler,
      client: reqwest::Client::new(),
      signature: Signature::new(
        vec![Param::Context, Param::Event("CustomResourceRequest")],
        vec![Return::Value("ResponseDocument"), Return::Error],
      ),
    }
  }
}

impl Handler for CustomResourceAdapter {
  fn signature(&self) -> &Signature {
    &self.signature
  }

  fn call(&self, _ctx: Context, event: Value) -> HandlerFuture {
    let handler = self.handler.clone();
    let client = self.client.clone();
    Box::pin(async move {
      let request = CustomResourceRequest::decode(&event).map_err(HandlerError::user)?;
      let document = cfn::handle_isolated(handler, &request).await;
      cfn::send_response(&client, &request.response_url, &document)
        .await
        .map_err(HandlerError::user)?;
      serde_json::to_value(&document).map_err(HandlerError::Encode)
    })
  }
}

/// A routed handler.
#[derive(Clone)]
pub struct Target {
  pub name: String,
  pub handler: Arc<dyn Handler>,
}

pub struct Dispatcher {
  functions: Vec<(String, Target)>,
  custom_resources: BTreeMap<String, Target>,
  interceptors: Vec<Arc<dyn Interceptor>>,
}

impl Dispatcher {
  /// Register the service's functions, its custom resource handlers and the
  /// built-in configurators.
  pub fn new(service: &Service) -> Self {
    let functions = service
      .functions()
      .iter()
      .map(|f| {
        let target = Target {
          name: f.name().to_string(),
          handler: f.handler().clone(),
        };
        (f.full_name(service.name()), target)
      })
      .collect();

    let mut custom_resources = BTreeMap::new();
    let user = service
      .functions()
      .iter()
      .flat_map(|f| f.custom_resources())
      .map(|cr| cr.handler().clone());
    for handler in configurators::builtin().into_iter().chain(user) {
      let resource_type = handler.resource_type().to_string();
      let target = Target {
        name: resource_type.clone(),
        handler: Arc::new(CustomResourceAdapter::new(handler)),
      };
      custom_resources.insert(resource_type, target);
    }

    Self {
      functions,
      custom_resources,
      interceptors: service.interceptors().to_vec(),
    }
  }

  /// Pick the handler for this process: the user function whose full name
  /// matches `function_name`, else the custom resource handler for
  /// `custom_type`.
  pub fn route(&self, function_name: &str, custom_type: Option<&str>) -> Result<&Target, DispatchError> {
    if let Some((_, target)) = self.functions.iter().find(|(full, _)| full == function_name) {
      return Ok(target);
    }
    if let Some(resource_type) = custom_type
      && let Some(target) = self.custom_resources.get(resource_type)
    {
      return Ok(target);
    }
    Err(DispatchError::NoHandler {
      function_name: function_name.to_string(),
      custom_type: custom_type.map(str::to_string),
      registered: self
        .functions
        .iter()
        .map(|(full, _)| full.clone())
        .chain(self.custom_resources.keys().cloned())
        .collect(),
    })
  }

  /// Run one invocation through the interceptor chain.
  ///
  /// The handler runs in its own task so a panic becomes
  /// [`HandlerError::Panicked`]. `Complete` interceptors run on every path.
  pub async fn invoke(&self, target: &Target, ctx: Context, event: Value) -> Result<Value, Arc<HandlerError>> {
    let chain = &self.interceptors;
    let ctx = run_phase(chain, Phase::Begin, ctx, &event);
    let mut ctx = run_phase(chain, Phase::BeforeSetup, ctx, &event);

    let span = info_span!(
      "request",
      request_id = %ctx.request_id(),
      function_arn = %ctx.function_arn(),
      build_id = %ctx.build_id(),
      handler = %target.name,
    );
    ctx.set_request_logger(span.clone());
    let ctx = run_phase(chain, Phase::AfterSetup, ctx, &event);
    let mut ctx = run_phase(chain, Phase::BeforeDispatch, ctx, &event);

    let call = target.handler.call(ctx.clone(), event.clone());
    let result = match tokio::spawn(call.instrument(span.clone())).await {
      Ok(result) => result,
      Err(err) if err.is_panic() => Err(HandlerError::Panicked(panic_message(err.into_panic()))),
      Err(_) => Err(HandlerError::Cancelled),
    };
    let result = result.map_err(Arc::new);
    ctx.set_response(result.as_ref().ok().cloned());
    ctx.set_error(result.as_ref().err().cloned());

    let ctx = run_phase(chain, Phase::AfterDispatch, ctx, &event);
    run_phase(chain, Phase::Complete, ctx, &event);
    span.in_scope(|| debug!(ok = result.is_ok(), "invocation finished"));
    result
  }
}

#[cfg(test)]
mod tests {
  use std::sync::Mutex;

  use serde::Deserialize;

  use super::*;
  use crate::consts::CR_S3_NOTIFICATION;
  use crate::model::{BoxError, Event, Function};
  use crate::runtime::cfn::ResourceOutcome;
  use crate::runtime::interceptor::on_phase;

  #[derive(Deserialize)]
  struct Greeting {
    name: String,
  }

  fn service() -> Service {
    let mut service = Service::new("svc", "").unwrap();
    service
      .add_function(
        Function::new("hello world", |_c: Context, Event(g): Event<Greeting>| async move {
          Ok::<_, BoxError>(format!("hello {}", g.name))
        })
        .unwrap(),
      )
      .unwrap();
    service
      .add_function(
        Function::new("boom", |_c: Context| async move {
          if true {
            panic!("kaboom");
          }
          Ok::<_, BoxError>(())
        })
        .unwrap(),
      )
      .unwrap();
    service
  }

  #[test]
  fn routes_by_full_function_name() {
    let service = service();
    let dispatcher = Dispatcher::new(&service);
    let full = service.function("hello world").unwrap().full_name("svc");
    assert_eq!(dispatcher.route(&full, None).unwrap().name, "hello world");
    assert!(dispatcher.route("other_helloworld", None).is_err());
  }

  #[test]
  fn falls_back_to_custom_resource_type() {
    let dispatcher = Dispatcher::new(&service());
    let target = dispatcher.route("svc-ConfiguratorFunction-XYZ", Some(CR_S3_NOTIFICATION)).unwrap();
    assert_eq!(target.name, CR_S3_NOTIFICATION);

    let err = dispatcher.route("nope", Some("Custom::Unknown")).err().unwrap();
    let DispatchError::NoHandler { registered, .. } = &err;
    assert!(registered.iter().any(|r| r.starts_with("svc_")));
    assert!(err.to_string().contains("nope"));
  }

  #[tokio::test]
  async fn invokes_with_the_decoded_event() {
    let service = service();
    let dispatcher = Dispatcher::new(&service);
    let full = service.function("hello world").unwrap().full_name("svc");
    let target = dispatcher.route(&full, None).unwrap().clone();
    let out = dispatcher
      .invoke(&target, Context::default(), serde_json::json!({"name": "cirrus"}))
      .await
      .unwrap();
    assert_eq!(out, "hello cirrus");
  }

  #[tokio::test]
  async fn panics_are_captured_and_observed_at_complete() {
    let seen: Arc<Mutex<Option<String>>> = Arc::default();
    let mut service = service();
    let sink = seen.clone();
    service.add_interceptor(on_phase(Phase::Complete, move |ctx: Context, _: &Value| {
      *sink.lock().unwrap() = ctx.error().map(|e| e.to_string());
      ctx
    }));
    let dispatcher = Dispatcher::new(&service);
    let full = service.function("boom").unwrap().full_name("svc");
    let target = dispatcher.route(&full, None).unwrap().clone();

    let err = dispatcher.invoke(&target, Context::default(), Value::Null).await.unwrap_err();
    assert!(matches!(err.as_ref(), HandlerError::Panicked(msg) if msg.contains("kaboom")));
    assert!(seen.lock().unwrap().as_deref().unwrap().contains("kaboom"));
  }

  struct Exploding;

  #[async_trait::async_trait]
  impl CustomResourceHandler for Exploding {
    fn resource_type(&self) -> &str {
      "Custom::Exploding"
    }

    async fn create(&self, _request: &CustomResourceRequest) -> Result<ResourceOutcome, BoxError> {
      panic!("bucket vanished");
    }
  }

  /// Accept one PUT, answer 200 and return what was received.
  async fn response_sink() -> (String, tokio::task::JoinHandle<String>) {
    use tokio::io::{AsyncReadExt, AsyncWriteExt};

    let listener = tokio::net::TcpListener::bind("127.0.0.1:0").await.unwrap();
    let url = format!("http://{}/signed", listener.local_addr().unwrap());
    let server = tokio::spawn(async move {
      let (mut socket, _) = listener.accept().await.unwrap();
      let mut received = Vec::new();
      let mut buffer = [0u8; 4096];
      loop {
        let n = socket.read(&mut buffer).await.unwrap();
        received.extend_from_slice(&buffer[..n]);
        let text = String::from_utf8_lossy(&received);
        if n == 0 || (text.contains("\r\n\r\n") && text.ends_with('}')) {
          break;
        }
      }
      socket
        .write_all(b"HTTP/1.1 200 OK\r\ncontent-length: 0\r\nconnection: close\r\n\r\n")
        .await
        .unwrap();
      String::from_utf8(received).unwrap()
    });
    (url, server)
  }

  #[tokio::test]
  async fn panicking_custom_resources_still_answer_the_provider() {
    let (url, server) = response_sink().await;
    let adapter = CustomResourceAdapter::new(Arc::new(Exploding));
    let event = serde_json::json!({
      "RequestType": "Create",
      "ResponseURL": url,
      "StackId": "arn:aws:cloudformation:us-east-1:123456789012:stack/svc/guid",
      "RequestId": "req-1",
      "ResourceType": "Custom::Exploding",
      "LogicalResourceId": "Boom",
      "ResourceProperties": {"ServiceToken": "arn"}
    });

    let out = adapter.call(Context::default(), event).await.unwrap();
    assert_eq!(out["Status"], "FAILED");
    assert_eq!(out["Reason"], "handler panicked: bucket vanished");

    let received = server.await.unwrap();
    assert!(received.starts_with("PUT /signed"));
    assert!(received.contains("\"Status\":\"FAILED\""));
    assert!(received.contains("bucket vanished"));
  }

  #[tokio::test]
  async fn interceptors_see_the_response() {
    let seen: Arc<Mutex<Option<Value>>> = Arc::default();
    let mut service = service();
    let sink = seen.clone();
    service.add_interceptor(on_phase(Phase::AfterDispatch, move |ctx: Context, _: &Value| {
      *sink.lock().unwrap() = ctx.response().cloned();
      ctx
    }));
    let dispatcher = Dispatcher::new(&service);
    let full = service.function("hello world").unwrap().full_name("svc");
    let target = dispatcher.route(&full, None).unwrap().clone();
    dispatcher
      .invoke(&target, Context::default(), serde_json::json!({"name": "x"}))
      .await
      .unwrap();
    assert_eq!(*seen.lock().unwrap(), Some(Value::from("hello x")));
  }
}
