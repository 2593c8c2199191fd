//! REST and WebSocket gateway emission.

use std::collections::BTreeMap;

use tracing::debug;

use super::SynthError;
use crate::config::{BuildConfig, DeploymentMode};
use crate::consts::{OUTPUT_API_GATEWAY_URL, OUTPUT_WEBSOCKET_URL, PRINCIPAL_APIGATEWAY};
use crate::model::{CorsOptions, RestApi, Stage, WebSocketApi};
use crate::naming::logical_name;
use crate::template::{DeletionPolicy, Expr, Output, Resource, Template};

/// `arn:{partition}:apigateway:{region}:lambda:path/.../invocations` for a
/// lambda proxy integration.
fn integration_uri(function_logical: &str) -> Expr {
  Expr::join(
    "",
    [
      Expr::str("arn:"),
      Expr::partition(),
      Expr::str(":apigateway:"),
      Expr::region(),
      Expr::str(":lambda:path/2015-03-31/functions/"),
      Expr::get_att(function_logical, "Arn"),
      Expr::str("/invocations"),
    ],
  )
}

fn execute_api_arn(api_logical: &str) -> Expr {
  Expr::join(
    "",
    [
      Expr::str("arn:"),
      Expr::partition(),
      Expr::str(":execute-api:"),
      Expr::region(),
      Expr::str(":"),
      Expr::account_id(),
      Expr::str(":"),
      Expr::reference(api_logical),
      Expr::str("/*"),
    ],
  )
}

fn gateway_permission(
  template: &mut Template,
  prefix: &str,
  api_logical: &str,
  function_logical: &str,
) -> Result<String, SynthError> {
  let logical = logical_name(prefix, [api_logical, function_logical]);
  template.ensure_resource(
    logical.clone(),
    Resource::new("AWS::Lambda::Permission")
      .prop("Action", "lambda:InvokeFunction")
      .prop("FunctionName", Expr::get_att(function_logical, "Arn"))
      .prop("Principal", PRINCIPAL_APIGATEWAY)
      .prop("SourceArn", execute_api_arn(api_logical)),
  )?;
  Ok(logical)
}

fn deployment_name(prefix: &str, parts: &[&str], config: &BuildConfig) -> String {
  let mut parts: Vec<&str> = parts.to_vec();
  if config.deployment_mode == DeploymentMode::ForceRedeploy {
    parts.push(&config.build_id);
  }
  logical_name(prefix, parts)
}

/// The build id only appears when every build redeploys; otherwise an
/// unchanged API must synthesize to an unchanged deployment.
fn deployment_description(service_name: &str, config: &BuildConfig) -> String {
  match config.deployment_mode {
    DeploymentMode::ForceRedeploy => format!("Deployment of {service_name} build {}", config.build_id),
    DeploymentMode::Idempotent => format!("Deployment of {service_name}"),
  }
}

fn lookup<'a>(functions: &'a BTreeMap<String, String>, name: &str, context: &str) -> Result<&'a str, SynthError> {
  functions
    .get(name)
    .map(String::as_str)
    .ok_or_else(|| SynthError::UnresolvedReference {
      resource: context.to_string(),
      reference: name.to_string(),
    })
}

/// Emit the path resources leading to `path` and return the expression for
/// its resource id. Shared prefixes are emitted once.
fn ensure_path(template: &mut Template, api: &RestApi, api_logical: &str, path: &str) -> Result<Expr, SynthError> {
  let mut parent = Expr::get_att(api_logical, "RootResourceId");
  let mut prefix = String::new();
  for segment in path.split('/').filter(|s| !s.is_empty()) {
    prefix.push('/');
    prefix.push_str(segment);
    let logical = logical_name("APIGatewayResource", [api.name(), prefix.as_str()]);
    template.ensure_resource(
      logical.clone(),
      Resource::new("AWS::ApiGateway::Resource")
        .prop("ParentId", parent)
        .prop("PathPart", segment)
        .prop("RestApiId", Expr::reference(api_logical)),
    )?;
    parent = Expr::reference(logical);
  }
  Ok(parent)
}

fn options_method(api_logical: &str, resource_id: Expr, cors: &CorsOptions) -> Resource {
  let response_parameters = cors
    .headers
    .iter()
    .map(|(name, value)| (format!("method.response.header.{name}"), Expr::str(format!("'{value}'"))));
  let declared_parameters = cors
    .headers
    .keys()
    .map(|name| (format!("method.response.header.{name}"), Expr::Bool(true)));

  Resource::new("AWS::ApiGateway::Method")
    .prop("HttpMethod", "OPTIONS")
    .prop("AuthorizationType", "NONE")
    .prop("ResourceId", resource_id)
    .prop("RestApiId", Expr::reference(api_logical))
    .prop(
      "Integration",
      Expr::map([
        ("Type", Expr::str("MOCK")),
        (
          "RequestTemplates",
          Expr::map([("application/json", Expr::str("{\"statusCode\": 200}"))]),
        ),
        (
          "IntegrationResponses",
          Expr::list([Expr::map([
            ("StatusCode", Expr::str("200")),
            ("ResponseParameters", Expr::map(response_parameters)),
            ("ResponseTemplates", Expr::map([("application/json", Expr::str(""))])),
          ])]),
        ),
      ]),
    )
    .prop(
      "MethodResponses",
      Expr::list([Expr::map([
        ("StatusCode", Expr::str("200")),
        ("ResponseParameters", Expr::map(declared_parameters)),
        ("ResponseModels", Expr::map([("application/json", Expr::str("Empty"))])),
      ])]),
    )
}

/// Emit a REST API: path resources, methods with lambda proxy integrations,
/// one `OPTIONS` method per path when CORS is on, and, with a stage, the
/// deployment, stage and URL output.
pub(super) fn emit_rest_api(
  template: &mut Template,
  service_name: &str,
  config: &BuildConfig,
  api: &RestApi,
  functions: &BTreeMap<String, String>,
) -> Result<String, SynthError> {
  let api_logical = logical_name("APIGateway", [api.name()]);
  let description = if api.description().is_empty() {
    format!("{service_name} API")
  } else {
    api.description().to_string()
  };
  template.add_resource(
    api_logical.clone(),
    Resource::new("AWS::ApiGateway::RestApi")
      .prop("Name", api.name())
      .prop("Description", description),
  )?;

  let mut methods = Vec::new();
  for resource in api.resources() {
    let function_logical = lookup(functions, resource.function(), resource.path())?;
    let resource_id = ensure_path(template, api, &api_logical, resource.path())?;
    gateway_permission(template, "APIGatewayLambdaPerm", &api_logical, function_logical)?;

    for method in resource.methods() {
      let logical = logical_name(
        "APIGatewayMethod",
        [api.name(), resource.path(), method.http_method.as_str()],
      );
      let mut emitted = Resource::new("AWS::ApiGateway::Method")
        .prop("HttpMethod", method.http_method.as_str())
        .prop("AuthorizationType", method.authorization_type())
        .prop("ApiKeyRequired", method.api_key_required)
        .prop("ResourceId", resource_id.clone())
        .prop("RestApiId", Expr::reference(&api_logical))
        .prop(
          "Integration",
          Expr::map([
            ("Type", Expr::str("AWS_PROXY")),
            ("IntegrationHttpMethod", Expr::str("POST")),
            ("Uri", integration_uri(function_logical)),
          ]),
        );
      if let Some(authorizer) = &method.authorizer_id {
        emitted.set_prop("AuthorizerId", authorizer.clone());
      }
      template.ensure_resource(logical.clone(), emitted)?;
      methods.push(logical);
    }
  }

  if let Some(cors) = api.cors() {
    for path in api.paths() {
      let user_options = api
        .resources()
        .iter()
        .filter(|r| r.path() == path)
        .flat_map(|r| r.methods())
        .any(|m| m.http_method == "OPTIONS");
      if user_options {
        continue;
      }
      let resource_id = ensure_path(template, api, &api_logical, path)?;
      let logical = logical_name("APIGatewayOptions", [api.name(), path]);
      template.ensure_resource(logical.clone(), options_method(&api_logical, resource_id, cors))?;
      methods.push(logical);
    }
  }

  if let Some(stage) = api.stage() {
    emit_rest_stage(template, service_name, config, &api_logical, stage, &methods)?;
  }
  debug!(api = api.name(), methods = methods.len(), "emitted REST API");
  Ok(api_logical)
}

fn emit_rest_stage(
  template: &mut Template,
  service_name: &str,
  config: &BuildConfig,
  api_logical: &str,
  stage: &Stage,
  methods: &[String],
) -> Result<(), SynthError> {
  let deployment = deployment_name("APIGatewayDeployment", &[service_name, stage.name.as_str()], config);
  let mut resource = Resource::new("AWS::ApiGateway::Deployment")
    .prop("RestApiId", Expr::reference(api_logical))
    .prop("Description", deployment_description(service_name, config));
  // A deployment snapshots the methods that exist when it is created.
  for method in methods {
    resource = resource.depends_on(method.as_str());
  }
  template.add_resource(deployment.clone(), resource)?;

  let stage_logical = logical_name("APIGatewayStage", [service_name, stage.name.as_str()]);
  let mut stage_resource = Resource::new("AWS::ApiGateway::Stage")
    .prop("StageName", stage.name.as_str())
    .prop("RestApiId", Expr::reference(api_logical))
    .prop("DeploymentId", Expr::reference(&deployment));
  if let Some(description) = &stage.description {
    stage_resource.set_prop("Description", description.as_str());
  }
  if !stage.variables.is_empty() {
    stage_resource.set_prop(
      "Variables",
      Expr::map(stage.variables.iter().map(|(k, v)| (k.clone(), Expr::str(v)))),
    );
  }
  template.add_resource(stage_logical, stage_resource)?;

  template.add_output(
    OUTPUT_API_GATEWAY_URL,
    Output::new(
      "API Gateway URL",
      Expr::join(
        "",
        [
          Expr::str("https://"),
          Expr::reference(api_logical),
          Expr::str(".execute-api."),
          Expr::region(),
          Expr::str(".amazonaws.com/"),
          Expr::str(&stage.name),
        ],
      ),
    ),
  )?;
  Ok(())
}

/// Emit a WebSocket API with one lambda proxy integration per route, a
/// retained deployment and a stage.
pub(super) fn emit_websocket_api(
  template: &mut Template,
  config: &BuildConfig,
  api: &WebSocketApi,
  functions: &BTreeMap<String, String>,
) -> Result<String, SynthError> {
  let api_logical = logical_name("APIGatewayWebSocket", [api.name()]);
  let mut resource = Resource::new("AWS::ApiGatewayV2::Api")
    .prop("Name", api.name())
    .prop("ProtocolType", "WEBSOCKET")
    .prop("RouteSelectionExpression", api.route_selection_expression());
  if !api.description().is_empty() {
    resource.set_prop("Description", api.description());
  }
  template.add_resource(api_logical.clone(), resource)?;

  let mut routes = Vec::new();
  for route in api.routes() {
    let function_logical = lookup(functions, route.function(), route.route_key())?;
    gateway_permission(template, "APIV2GatewayLambdaPerm", &api_logical, function_logical)?;

    let integration = logical_name("APIGatewayWebSocketIntegration", [api.name(), route.route_key()]);
    template.add_resource(
      integration.clone(),
      Resource::new("AWS::ApiGatewayV2::Integration")
        .prop("ApiId", Expr::reference(&api_logical))
        .prop("IntegrationType", "AWS_PROXY")
        .prop("IntegrationUri", integration_uri(function_logical)),
    )?;

    let route_logical = logical_name("APIGatewayWebSocketRoute", [api.name(), route.route_key()]);
    template.add_resource(
      route_logical.clone(),
      Resource::new("AWS::ApiGatewayV2::Route")
        .prop("ApiId", Expr::reference(&api_logical))
        .prop("RouteKey", route.route_key())
        .prop("AuthorizationType", "NONE")
        .prop(
          "Target",
          Expr::join("/", [Expr::str("integrations"), Expr::reference(&integration)]),
        ),
    )?;
    routes.push(route_logical);
  }

  let stage = api.stage();
  let deployment = deployment_name("APIGatewayWebSocketDeployment", &[api.name(), stage.name.as_str()], config);
  let mut resource = Resource::new("AWS::ApiGatewayV2::Deployment")
    .prop("ApiId", Expr::reference(&api_logical))
    .deletion_policy(DeletionPolicy::Retain);
  for route in &routes {
    resource = resource.depends_on(route.as_str());
  }
  template.add_resource(deployment.clone(), resource)?;

  let stage_logical = logical_name("APIGatewayWebSocketStage", [api.name(), stage.name.as_str()]);
  let mut stage_resource = Resource::new("AWS::ApiGatewayV2::Stage")
    .prop("ApiId", Expr::reference(&api_logical))
    .prop("StageName", stage.name.as_str())
    .prop("DeploymentId", Expr::reference(&deployment));
  if let Some(description) = &stage.description {
    stage_resource.set_prop("Description", description.as_str());
  }
  if !stage.variables.is_empty() {
    stage_resource.set_prop(
      "StageVariables",
      Expr::map(stage.variables.iter().map(|(k, v)| (k.clone(), Expr::str(v)))),
    );
  }
  template.add_resource(stage_logical, stage_resource)?;

  template.add_output(
    OUTPUT_WEBSOCKET_URL,
    Output::new(
      "WebSocket API URL",
      Expr::join(
        "",
        [
          Expr::str("wss://"),
          Expr::reference(&api_logical),
          Expr::str(".execute-api."),
          Expr::region(),
          Expr::str(".amazonaws.com/"),
          Expr::str(&stage.name),
        ],
      ),
    ),
  )?;
  debug!(api = api.name(), routes = routes.len(), "emitted WebSocket API");
  Ok(api_logical)
}

#[cfg(test)]
mod tests {
  use super::*;

  fn functions() -> BTreeMap<String, String> {
    [("getItem", "GetItemFn"), ("putItem", "PutItemFn")]
      .into_iter()
      .map(|(k, v)| (k.to_string(), v.to_string()))
      .collect()
  }

  fn items_api() -> RestApi {
    let mut api = RestApi::new("items", Some(Stage::new("v1").variable("mode", "test")));
    api.resource("/items/{id}", "getItem").unwrap().method("GET").unwrap();
    api.resource("/items/{id}", "putItem").unwrap().method("PUT").unwrap();
    api
  }

  fn methods(t: &Template) -> Vec<String> {
    t.resources_of_type("AWS::ApiGateway::Method")
      .filter_map(|(_, r)| r.get_prop("HttpMethod").and_then(Expr::as_str).map(str::to_string))
      .collect()
  }

  #[test]
  fn shared_path_gets_one_options_method() {
    let mut t = Template::new("t");
    emit_rest_api(&mut t, "svc", &BuildConfig::default(), &items_api(), &functions()).unwrap();

    let mut found = methods(&t);
    found.sort();
    assert_eq!(found, vec!["GET", "OPTIONS", "PUT"]);
    // "/items" and "/items/{id}"
    assert_eq!(t.resources_of_type("AWS::ApiGateway::Resource").count(), 2);
    assert_eq!(t.resources_of_type("AWS::ApiGateway::Deployment").count(), 1);
    assert_eq!(t.resources_of_type("AWS::ApiGateway::Stage").count(), 1);
    assert_eq!(t.resources_of_type("AWS::Lambda::Permission").count(), 2);
    assert!(t.outputs.contains_key(OUTPUT_API_GATEWAY_URL));
  }

  #[test]
  fn cors_can_be_disabled() {
    let mut t = Template::new("t");
    let api = items_api().with_cors(None);
    emit_rest_api(&mut t, "svc", &BuildConfig::default(), &api, &functions()).unwrap();
    assert!(!methods(&t).contains(&"OPTIONS".to_string()));
  }

  #[test]
  fn deployment_names_follow_the_mode() {
    let idempotent = BuildConfig {
      build_id: "b1".to_string(),
      ..BuildConfig::default()
    };
    let rebuilt = BuildConfig {
      build_id: "b2".to_string(),
      ..idempotent.clone()
    };
    assert_eq!(
      deployment_name("D", &["svc", "v1"], &idempotent),
      deployment_name("D", &["svc", "v1"], &rebuilt)
    );

    let forced = BuildConfig {
      deployment_mode: DeploymentMode::ForceRedeploy,
      ..idempotent.clone()
    };
    let forced_again = BuildConfig {
      build_id: "b2".to_string(),
      ..forced.clone()
    };
    assert_ne!(
      deployment_name("D", &["svc", "v1"], &forced),
      deployment_name("D", &["svc", "v1"], &forced_again)
    );
  }

  #[test]
  fn idempotent_deployments_do_not_change_between_builds() {
    let emit = |config: &BuildConfig| {
      let mut t = Template::new("t");
      emit_rest_api(&mut t, "svc", config, &items_api(), &functions()).unwrap();
      t
    };
    let first = BuildConfig {
      build_id: "b1".to_string(),
      ..BuildConfig::default()
    };
    let second = BuildConfig {
      build_id: "b2".to_string(),
      ..first.clone()
    };
    assert_eq!(emit(&first), emit(&second));

    let forced = BuildConfig {
      deployment_mode: DeploymentMode::ForceRedeploy,
      ..second
    };
    let (_, deployment) = emit(&forced)
      .resources_of_type("AWS::ApiGateway::Deployment")
      .map(|(n, r)| (n.clone(), r.clone()))
      .next()
      .unwrap();
    assert_eq!(deployment.get_prop("Description"), Some(&Expr::str("Deployment of svc build b2")));
  }

  #[test]
  fn unknown_function_is_unresolved() {
    let mut t = Template::new("t");
    let err = emit_rest_api(&mut t, "svc", &BuildConfig::default(), &items_api(), &BTreeMap::new()).unwrap_err();
    assert!(matches!(err, SynthError::UnresolvedReference { .. }));
  }

  #[test]
  fn websocket_routes_get_integrations_and_a_retained_deployment() {
    let mut api = WebSocketApi::new("chat", "$request.body.action", Stage::new("v1"));
    api.route("$connect", "getItem").unwrap();
    api.route("sendMessage", "putItem").unwrap();
    let mut t = Template::new("t");
    emit_websocket_api(&mut t, &BuildConfig::default(), &api, &functions()).unwrap();

    assert_eq!(t.resources_of_type("AWS::ApiGatewayV2::Route").count(), 2);
    assert_eq!(t.resources_of_type("AWS::ApiGatewayV2::Integration").count(), 2);
    let (_, deployment) = t.resources_of_type("AWS::ApiGatewayV2::Deployment").next().unwrap();
    assert_eq!(deployment.deletion_policy, Some(DeletionPolicy::Retain));
    assert_eq!(deployment.depends_on.len(), 2);
    assert!(t.outputs.contains_key(OUTPUT_WEBSOCKET_URL));
  }
}
