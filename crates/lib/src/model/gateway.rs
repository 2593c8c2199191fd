//! REST and WebSocket gateway descriptions.
//!
//! Resources hold a non-owning reference (the display name) to the function
//! that handles them; the service checks those names when the API is set.

use std::collections::BTreeMap;

use super::ModelError;
use crate::template::Expr;

/// A deployment stage.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Stage {
  pub name: String,
  pub description: Option<String>,
  pub variables: BTreeMap<String, String>,
}

impl Stage {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      description: None,
      variables: BTreeMap::new(),
    }
  }

  pub fn description(mut self, description: impl Into<String>) -> Self {
    self.description = Some(description.into());
    self
  }

  pub fn variable(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
    self.variables.insert(key.into(), value.into());
    self
  }
}

/// Response headers returned by the synthesized `OPTIONS` methods.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CorsOptions {
  pub headers: BTreeMap<String, String>,
}

impl Default for CorsOptions {
  fn default() -> Self {
    let headers = [
      ("Access-Control-Allow-Headers", "Content-Type,X-Amz-Date,Authorization,X-Api-Key"),
      ("Access-Control-Allow-Methods", "*"),
      ("Access-Control-Allow-Origin", "*"),
    ];
    Self {
      headers: headers
        .into_iter()
        .map(|(k, v)| (k.to_string(), v.to_string()))
        .collect(),
    }
  }
}

impl CorsOptions {
  pub fn header(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
    self.headers.insert(name.into(), value.into());
    self
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct Method {
  pub http_method: String,
  /// `None` means authorization type `NONE`, otherwise `CUSTOM`.
  pub authorizer_id: Option<Expr>,
  pub api_key_required: bool,
}

impl Method {
  pub fn authorizer(&mut self, authorizer_id: impl Into<Expr>) -> &mut Self {
    self.authorizer_id = Some(authorizer_id.into());
    self
  }

  pub fn require_api_key(&mut self) -> &mut Self {
    self.api_key_required = true;
    self
  }

  pub fn authorization_type(&self) -> &'static str {
    if self.authorizer_id.is_some() { "CUSTOM" } else { "NONE" }
  }
}

/// One path bound to one function.
#[derive(Debug, Clone, PartialEq)]
pub struct ApiResource {
  path: String,
  function: String,
  methods: Vec<Method>,
}

impl ApiResource {
  pub fn path(&self) -> &str {
    &self.path
  }

  pub fn function(&self) -> &str {
    &self.function
  }

  pub fn methods(&self) -> &[Method] {
    &self.methods
  }

  /// Path segments, without empty components.
  pub fn segments(&self) -> impl Iterator<Item = &str> {
    self.path.split('/').filter(|s| !s.is_empty())
  }
}

/// A freshly bound resource. Methods added through it are checked against
/// every function bound to the same path.
#[derive(Debug)]
pub struct ResourceBinding<'a> {
  resources: &'a mut Vec<ApiResource>,
  index: usize,
}

impl ResourceBinding<'_> {
  pub fn path(&self) -> &str {
    &self.resources[self.index].path
  }

  pub fn methods(&self) -> &[Method] {
    &self.resources[self.index].methods
  }

  pub fn method(&mut self, http_method: &str) -> Result<&mut Method, ModelError> {
    let http_method = http_method.to_ascii_uppercase();
    let path = self.path().to_string();
    if self
      .resources
      .iter()
      .filter(|r| r.path == path)
      .flat_map(|r| &r.methods)
      .any(|m| m.http_method == http_method)
    {
      return Err(ModelError::MethodCollision {
        method: http_method,
        path,
      });
    }
    let methods = &mut self.resources[self.index].methods;
    methods.push(Method {
      http_method,
      authorizer_id: None,
      api_key_required: false,
    });
    let last = methods.len() - 1;
    Ok(&mut methods[last])
  }
}

/// A REST API. Resources are keyed by function and path.
#[derive(Debug, Clone, PartialEq)]
pub struct RestApi {
  name: String,
  description: String,
  stage: Option<Stage>,
  cors: Option<CorsOptions>,
  resources: Vec<ApiResource>,
}

impl RestApi {
  pub fn new(name: impl Into<String>, stage: Option<Stage>) -> Self {
    Self {
      name: name.into(),
      description: String::new(),
      stage,
      cors: Some(CorsOptions::default()),
      resources: Vec::new(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn description(&self) -> &str {
    &self.description
  }

  pub fn stage(&self) -> Option<&Stage> {
    self.stage.as_ref()
  }

  pub fn cors(&self) -> Option<&CorsOptions> {
    self.cors.as_ref()
  }

  pub fn resources(&self) -> &[ApiResource] {
    &self.resources
  }

  pub fn with_description(mut self, description: impl Into<String>) -> Self {
    self.description = description.into();
    self
  }

  pub fn with_cors(mut self, cors: Option<CorsOptions>) -> Self {
    self.cors = cors;
    self
  }

  /// Bind `path` to the function named `function`.
  pub fn resource(&mut self, path: &str, function: &str) -> Result<ResourceBinding<'_>, ModelError> {
    let path = normalize_path(path);
    if self.resources.iter().any(|r| r.function == function && r.path == path) {
      return Err(ModelError::PathCollision {
        path,
        function: function.to_string(),
      });
    }
    self.resources.push(ApiResource {
      path,
      function: function.to_string(),
      methods: Vec::new(),
    });
    let index = self.resources.len() - 1;
    Ok(ResourceBinding {
      resources: &mut self.resources,
      index,
    })
  }

  /// Distinct paths in first-registration order.
  pub fn paths(&self) -> Vec<&str> {
    let mut out: Vec<&str> = Vec::new();
    for resource in &self.resources {
      if !out.contains(&resource.path()) {
        out.push(resource.path());
      }
    }
    out
  }
}

fn normalize_path(path: &str) -> String {
  let trimmed = path.trim_matches('/');
  format!("/{trimmed}")
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Route {
  route_key: String,
  function: String,
}

impl Route {
  pub fn route_key(&self) -> &str {
    &self.route_key
  }

  pub fn function(&self) -> &str {
    &self.function
  }
}

/// A WebSocket API with lambda proxy routes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WebSocketApi {
  name: String,
  description: String,
  route_selection_expression: String,
  stage: Stage,
  routes: Vec<Route>,
}

impl WebSocketApi {
  pub fn new(name: impl Into<String>, route_selection_expression: impl Into<String>, stage: Stage) -> Self {
    Self {
      name: name.into(),
      description: String::new(),
      route_selection_expression: route_selection_expression.into(),
      stage,
      routes: Vec::new(),
    }
  }

  pub fn name(&self) -> &str {
    &self.name
  }

  pub fn description(&self) -> &str {
    &self.description
  }

  pub fn route_selection_expression(&self) -> &str {
    &self.route_selection_expression
  }

  pub fn stage(&self) -> &Stage {
    &self.stage
  }

  pub fn routes(&self) -> &[Route] {
    &self.routes
  }

  pub fn route(&mut self, route_key: &str, function: &str) -> Result<&mut Route, ModelError> {
    if self.routes.iter().any(|r| r.route_key == route_key) {
      return Err(ModelError::RouteCollision {
        route: route_key.to_string(),
      });
    }
    self.routes.push(Route {
      route_key: route_key.to_string(),
      function: function.to_string(),
    });
    let last = self.routes.len() - 1;
    Ok(&mut self.routes[last])
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn same_path_for_different_functions_is_allowed() {
    let mut api = RestApi::new("api", Some(Stage::new("v1")));
    api.resource("/items/{id}", "getItem").unwrap().method("get").unwrap();
    api.resource("items/{id}/", "putItem").unwrap().method("PUT").unwrap();
    assert_eq!(api.paths(), vec!["/items/{id}"]);
    assert_eq!(api.resources()[0].methods()[0].http_method, "GET");
  }

  #[test]
  fn same_path_for_same_function_collides() {
    let mut api = RestApi::new("api", None);
    api.resource("/items", "getItem").unwrap();
    let err = api.resource("/items", "getItem").unwrap_err();
    assert!(matches!(err, ModelError::PathCollision { .. }));
  }

  #[test]
  fn duplicate_methods_collide() {
    let mut api = RestApi::new("api", None);
    let mut resource = api.resource("/items", "getItem").unwrap();
    resource.method("GET").unwrap().authorizer("abc123");
    assert!(resource.method("get").is_err());
    assert_eq!(resource.methods()[0].authorization_type(), "CUSTOM");
  }

  #[test]
  fn a_method_belongs_to_one_function_per_path() {
    let mut api = RestApi::new("api", Some(Stage::new("v1")));
    api.resource("/items/{id}", "getItem").unwrap().method("GET").unwrap();
    let mut other = api.resource("items/{id}", "readItem").unwrap();
    let err = other.method("get").unwrap_err();
    assert!(matches!(
      err,
      ModelError::MethodCollision { ref method, ref path } if method == "GET" && path == "/items/{id}"
    ));
    other.method("DELETE").unwrap();
    api.resource("/other", "readItem").unwrap().method("GET").unwrap();
    assert_eq!(api.resources()[1].methods().len(), 1);
  }

  #[test]
  fn websocket_routes_are_unique() {
    let mut api = WebSocketApi::new("chat", "$request.body.action", Stage::new("v1"));
    api.route("$connect", "connect").unwrap();
    assert!(api.route("$connect", "other").is_err());
  }
}
