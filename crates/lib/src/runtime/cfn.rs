//! Custom resource request/response protocol.
//!
//! The provider invokes the handler function with a request document and
//! waits for a response document PUT to the presigned `ResponseURL`. Every
//! request gets exactly one response, including failed ones, or the stack
//! hangs until the provider times out.

use std::sync::Arc;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Deserializer, Serialize};
use serde_json::{Map, Value};
use thiserror::Error;
use tracing::{debug, info, warn};

use crate::model::CustomResourceHandler;
use crate::util::pool::panic_message;

#[derive(Debug, Error)]
pub enum CfnError {
  #[error("failed to decode custom resource request: {0}")]
  Decode(#[source] serde_json::Error),

  #[error("failed to encode custom resource response: {0}")]
  Encode(#[source] serde_json::Error),

  #[error("failed to send custom resource response: {0}")]
  Send(#[from] reqwest::Error),

  #[error("custom resource response rejected with status {0}")]
  Rejected(u16),
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Deserialize, Serialize)]
pub enum RequestType {
  Create,
  Update,
  Delete,
}

#[derive(Debug, Clone, PartialEq, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub struct CustomResourceRequest {
  pub request_type: RequestType,
  #[serde(rename = "ResponseURL")]
  pub response_url: String,
  pub stack_id: String,
  pub request_id: String,
  pub resource_type: String,
  pub logical_resource_id: String,
  #[serde(default)]
  pub physical_resource_id: Option<String>,
  #[serde(default)]
  pub resource_properties: Map<String, Value>,
  #[serde(default)]
  pub old_resource_properties: Option<Map<String, Value>>,
}

impl CustomResourceRequest {
  pub fn decode(event: &Value) -> Result<Self, CfnError> {
    serde_json::from_value(event.clone()).map_err(CfnError::Decode)
  }

  /// Decode `ResourceProperties` into a typed value.
  pub fn properties<T: DeserializeOwned>(&self) -> Result<T, serde_json::Error> {
    serde_json::from_value(Value::Object(self.resource_properties.clone()))
  }

  /// Decode `OldResourceProperties`, present on updates only.
  pub fn old_properties<T: DeserializeOwned>(&self) -> Result<Option<T>, serde_json::Error> {
    self
      .old_resource_properties
      .as_ref()
      .map(|props| serde_json::from_value(Value::Object(props.clone())))
      .transpose()
  }
}

/// What a handler reports back for a successful operation.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct ResourceOutcome {
  /// Physical id of the resource. Defaults to the id the provider already
  /// holds, or the logical id for a fresh resource.
  pub physical_resource_id: Option<String>,
  /// Attributes readable with `Fn::GetAtt`.
  pub data: Map<String, Value>,
}

impl ResourceOutcome {
  pub fn with_physical_id(id: impl Into<String>) -> Self {
    Self {
      physical_resource_id: Some(id.into()),
      ..Self::default()
    }
  }

  pub fn attribute(mut self, key: impl Into<String>, value: impl Into<Value>) -> Self {
    self.data.insert(key.into(), value.into());
    self
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "UPPERCASE")]
pub enum ResponseStatus {
  Success,
  Failed,
}

#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(rename_all = "PascalCase")]
pub struct ResponseDocument {
  pub status: ResponseStatus,
  pub reason: String,
  pub physical_resource_id: String,
  pub stack_id: String,
  pub request_id: String,
  pub logical_resource_id: String,
  #[serde(skip_serializing_if = "Map::is_empty")]
  pub data: Map<String, Value>,
}

impl ResponseDocument {
  fn for_request(request: &CustomResourceRequest, status: ResponseStatus, reason: String) -> Self {
    Self {
      status,
      reason,
      physical_resource_id: request
        .physical_resource_id
        .clone()
        .unwrap_or_else(|| request.logical_resource_id.clone()),
      stack_id: request.stack_id.clone(),
      request_id: request.request_id.clone(),
      logical_resource_id: request.logical_resource_id.clone(),
      data: Map::new(),
    }
  }
}

/// Run the operation the request asks for and build the response.
pub async fn handle(handler: &dyn CustomResourceHandler, request: &CustomResourceRequest) -> ResponseDocument {
  info!(
    resource_type = %request.resource_type,
    logical_id = %request.logical_resource_id,
    request_type = ?request.request_type,
    "custom resource request"
  );
  let result = match request.request_type {
    RequestType::Create => handler.create(request).await,
    RequestType::Update => handler.update(request).await,
    RequestType::Delete => handler.delete(request).await,
  };
  match result {
    Ok(outcome) => {
      let mut doc = ResponseDocument::for_request(request, ResponseStatus::Success, String::new());
      if let Some(id) = outcome.physical_resource_id {
        doc.physical_resource_id = id;
      }
      doc.data = outcome.data;
      doc
    }
    Err(err) => {
      warn!(logical_id = %request.logical_resource_id, error = %err, "custom resource operation failed");
      ResponseDocument::for_request(request, ResponseStatus::Failed, err.to_string())
    }
  }
}

/// [`handle`] on its own task. A handler that panics still gets a FAILED
/// response carrying the panic message.
pub async fn handle_isolated(
  handler: Arc<dyn CustomResourceHandler>,
  request: &CustomResourceRequest,
) -> ResponseDocument {
  let owned = request.clone();
  match tokio::spawn(async move { handle(handler.as_ref(), &owned).await }).await {
    Ok(document) => document,
    Err(err) => {
      let reason = if err.is_panic() {
        format!("handler panicked: {}", panic_message(err.into_panic()))
      } else {
        err.to_string()
      };
      warn!(logical_id = %request.logical_resource_id, reason = %reason, "custom resource handler aborted");
      ResponseDocument::for_request(request, ResponseStatus::Failed, reason)
    }
  }
}

/// PUT the response to the presigned URL.
///
/// The URL is signed without a content type, so none is sent.
pub async fn send_response(client: &reqwest::Client, url: &str, document: &ResponseDocument) -> Result<(), CfnError> {
  let body = serde_json::to_vec(document).map_err(CfnError::Encode)?;
  debug!(status = ?document.status, bytes = body.len(), "sending custom resource response");
  let response = client
    .put(url)
    .header(reqwest::header::CONTENT_TYPE, "")
    .header(reqwest::header::CONTENT_LENGTH, body.len())
    .body(body)
    .send()
    .await?;
  if !response.status().is_success() {
    return Err(CfnError::Rejected(response.status().as_u16()));
  }
  Ok(())
}

/// Accepts JSON booleans and the `"true"`/`"false"` strings the provider
/// turns them into.
pub(crate) fn lenient_bool<'de, D: Deserializer<'de>>(deserializer: D) -> Result<bool, D::Error> {
  match Value::deserialize(deserializer)? {
    Value::Bool(b) => Ok(b),
    Value::String(s) => Ok(s.eq_ignore_ascii_case("true")),
    Value::Null => Ok(false),
    other => Err(serde::de::Error::custom(format!("expected a boolean, got {other}"))),
  }
}
