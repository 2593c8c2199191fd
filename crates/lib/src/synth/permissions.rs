//! Permission export.
//!
//! Every push trigger becomes an invocation permission on the function plus
//! whatever wiring its kind needs: a configurator invocation for
//! out-of-band sources, or rule resources for scheduled and pattern
//! triggers. All emissions go through [`Template::ensure_resource`], so
//! exporting the same permission twice leaves the template unchanged.

use std::collections::BTreeMap;

use tracing::debug;

use super::configurator::{Configurator, ensure_configurator, source_statements};
use super::{SynthError, iam};
use crate::config::BuildConfig;
use crate::consts::{POLICY_VERSION, PRINCIPAL_SES};
use crate::iam::PolicyStatement;
use crate::model::{
  CloudWatchLogsPermission, CodeCommitPermission, EventBridgePermission, EventsRule, Function, Permission, RoleSpec,
  S3Permission, SesPermission, SnsPermission,
};
use crate::naming::{logical_name, sanitize};
use crate::resource_ref::source_expr;
use crate::template::{DeletionPolicy, Expr, Output, Resource, Template};

/// What an exporter knows about the function that owns the permission.
pub struct ExportContext<'a> {
  pub service_name: &'a str,
  pub config: &'a BuildConfig,
  pub function: &'a Function,
  pub function_logical_name: &'a str,
}

impl ExportContext<'_> {
  fn function_arn(&self) -> Expr {
    Expr::get_att(self.function_logical_name, "Arn")
  }
}

/// Export one permission. Returns the logical name of the resource that
/// wires the trigger (configurator invocation or rule).
pub fn export_permission(
  ctx: &ExportContext<'_>,
  permission: &Permission,
  template: &mut Template,
) -> Result<String, SynthError> {
  let exported = match permission {
    Permission::S3(p) => export_s3(ctx, permission, p, template)?,
    Permission::Sns(p) => export_sns(ctx, permission, p, template)?,
    Permission::Ses(p) => export_ses(ctx, permission, p, template)?,
    Permission::CloudWatchEvents(p) => {
      let mut last = String::new();
      for (name, rule) in &p.rules {
        last = export_rule(ctx, permission, name, rule, None, template)?;
      }
      last
    }
    Permission::EventBridge(p) => {
      let name = eventbridge_rule_name(p);
      export_rule(ctx, permission, &name, &p.rule, p.bus_name.as_ref(), template)?
    }
    Permission::CloudWatchLogs(p) => export_logs(ctx, permission, p, template)?,
    Permission::CodeCommit(p) => export_codecommit(ctx, permission, p, template)?,
  };
  debug!(
    function = ctx.function.name(),
    kind = permission.kind(),
    logical = %exported,
    "exported permission"
  );
  Ok(exported)
}

/// `lambda:InvokeFunction` for the trigger's principal, scoped to `source_arn`
/// or, when there is no ARN to scope to, to this account.
fn invoke_permission(
  ctx: &ExportContext<'_>,
  permission: &Permission,
  source_arn: Option<&Expr>,
  template: &mut Template,
) -> Result<String, SynthError> {
  let principal = permission.principal();
  let source = source_arn.cloned().unwrap_or_else(Expr::account_id);
  let logical = logical_name(
    "LambdaPermission",
    [
      ctx.function_logical_name.to_string(),
      principal.to_json().to_string(),
      source.to_json().to_string(),
    ],
  );
  let mut resource = Resource::new("AWS::Lambda::Permission")
    .prop("Action", "lambda:InvokeFunction")
    .prop("FunctionName", ctx.function_arn())
    .prop("Principal", principal);
  match source_arn {
    Some(arn) => resource.set_prop("SourceArn", arn.clone()),
    None => resource.set_prop("SourceAccount", Expr::account_id()),
  }
  template.ensure_resource(logical.clone(), resource)?;
  Ok(logical)
}

/// A configurator invocation. It runs after the invoke permission exists so
/// the source can verify the target when the wiring is created.
fn configurator_invocation(
  ctx: &ExportContext<'_>,
  configurator: &Configurator,
  resource_type: &str,
  source: &Expr,
  permission_logical: &str,
  properties: BTreeMap<String, Expr>,
  template: &mut Template,
) -> Result<String, SynthError> {
  // Every property feeds the name so two triggers on one source stay apart.
  let logical = logical_name(
    "ConfiguratorInvocation",
    [
      resource_type.to_string(),
      ctx.function_logical_name.to_string(),
      source.to_json().to_string(),
    ]
    .into_iter()
    .chain(properties.iter().map(|(key, value)| format!("{key}={}", value.to_json()))),
  );
  let mut resource = Resource::new(resource_type)
    .prop("ServiceToken", configurator.service_token())
    .prop("LambdaTargetArn", ctx.function_arn())
    .depends_on(permission_logical)
    .depends_on(configurator.function.as_str());
  for (key, value) in properties {
    resource.set_prop(&key, value);
  }
  template.ensure_resource(logical.clone(), resource)?;
  Ok(logical)
}

fn configured_trigger(
  ctx: &ExportContext<'_>,
  permission: &Permission,
  source: Expr,
  permission_scope: Option<&Expr>,
  properties: BTreeMap<String, Expr>,
  template: &mut Template,
) -> Result<String, SynthError> {
  let Some(resource_type) = permission.configurator_type() else {
    return Err(SynthError::MissingConfigurator(permission.kind().to_string()));
  };
  let permission_logical = invoke_permission(ctx, permission, permission_scope, template)?;
  let configurator = ensure_configurator(
    template,
    ctx.service_name,
    ctx.config,
    resource_type,
    source_statements(resource_type, source.clone()),
  )?;
  configurator_invocation(
    ctx,
    &configurator,
    resource_type,
    &source,
    &permission_logical,
    properties,
    template,
  )
}

fn export_s3(
  ctx: &ExportContext<'_>,
  permission: &Permission,
  p: &S3Permission,
  template: &mut Template,
) -> Result<String, SynthError> {
  let bucket = source_expr(&p.bucket_arn);
  let mut properties = BTreeMap::new();
  properties.insert("BucketArn".to_string(), bucket.clone());
  properties.insert("Events".to_string(), Expr::strings(p.events.iter().cloned()));
  if !p.filter.is_empty() {
    let mut rules = Vec::new();
    if let Some(prefix) = &p.filter.prefix {
      rules.push(Expr::map([("Name", Expr::str("prefix")), ("Value", Expr::str(prefix))]));
    }
    if let Some(suffix) = &p.filter.suffix {
      rules.push(Expr::map([("Name", Expr::str("suffix")), ("Value", Expr::str(suffix))]));
    }
    properties.insert("Filter".to_string(), Expr::map([("Key", Expr::map([("FilterRules", Expr::List(rules))]))]));
  }
  configured_trigger(ctx, permission, bucket.clone(), Some(&bucket), properties, template)
}

fn export_sns(
  ctx: &ExportContext<'_>,
  permission: &Permission,
  p: &SnsPermission,
  template: &mut Template,
) -> Result<String, SynthError> {
  let topic = source_expr(&p.topic_arn);
  let mut properties = BTreeMap::new();
  properties.insert("TopicArn".to_string(), topic.clone());
  configured_trigger(ctx, permission, topic.clone(), Some(&topic), properties, template)
}

fn export_ses(
  ctx: &ExportContext<'_>,
  permission: &Permission,
  p: &SesPermission,
  template: &mut Template,
) -> Result<String, SynthError> {
  let mut properties = BTreeMap::new();
  properties.insert(
    "RuleSetName".to_string(),
    Expr::str(format!("{}-{}", ctx.service_name, ctx.function.internal_name())),
  );
  properties.insert("InvocationType".to_string(), Expr::str(p.invocation_type.as_str()));
  let rules = p.receipt_rules.iter().map(|rule| {
    Expr::map([
      ("Name", Expr::str(&rule.name)),
      ("Enabled", Expr::Bool(rule.enabled)),
      ("Recipients", Expr::strings(rule.recipients.iter().cloned())),
      ("ScanEnabled", Expr::Bool(rule.scan_enabled)),
      ("TlsPolicy", Expr::str(rule.tls_policy.as_str())),
    ])
  });
  properties.insert("Rules".to_string(), Expr::list(rules));

  let mut storage_policy = None;
  if let Some(storage) = &p.message_body_storage {
    let bucket = match &storage.bucket_name {
      Some(name) => source_expr(name),
      None => {
        let logical = logical_name("SESMessageStoreBucket", [ctx.service_name, ctx.function_logical_name]);
        template.ensure_resource(
          logical.clone(),
          Resource::new("AWS::S3::Bucket").deletion_policy(DeletionPolicy::Retain),
        )?;
        template.add_output(
          logical.clone(),
          Output::new(format!("SES message body bucket for {}", ctx.function.name()), Expr::reference(&logical)),
        )?;
        Expr::reference(logical)
      }
    };
    let objects = Expr::join(
      "",
      [
        Expr::str("arn:"),
        Expr::partition(),
        Expr::str(":s3:::"),
        bucket.clone(),
        Expr::str("/*"),
      ],
    );
    let policy_logical = logical_name(
      "SESMessageStoreBucketPolicy",
      [ctx.function_logical_name.to_string(), bucket.to_json().to_string()],
    );
    let statement = Expr::map([
      ("Effect", Expr::str("Allow")),
      ("Principal", Expr::map([("Service", Expr::str(PRINCIPAL_SES))])),
      ("Action", Expr::strings(["s3:PutObject"])),
      ("Resource", objects.clone()),
      (
        "Condition",
        Expr::map([("StringEquals", Expr::map([("aws:Referer", Expr::account_id())]))]),
      ),
    ]);
    template.ensure_resource(
      policy_logical.clone(),
      Resource::new("AWS::S3::BucketPolicy").prop("Bucket", bucket.clone()).prop(
        "PolicyDocument",
        Expr::map([
          ("Version", Expr::str(POLICY_VERSION)),
          ("Statement", Expr::list([statement])),
        ]),
      ),
    )?;
    // The handler reads the stored bodies.
    if let RoleSpec::Definition(_) = ctx.function.role() {
      iam::add_statements(
        template,
        &ctx.function.role_logical_name(),
        [PolicyStatement::allow(["s3:GetObject", "s3:DeleteObject"], objects)],
      )?;
    }
    properties.insert("MessageBodyBucket".to_string(), bucket);
    if let Some(prefix) = &storage.key_prefix {
      properties.insert("MessageBodyPrefix".to_string(), Expr::str(prefix));
    }
    storage_policy = Some(policy_logical);
  }

  let invocation = configured_trigger(ctx, permission, Expr::str("*"), None, properties, template)?;
  if let Some(policy) = storage_policy
    && let Some(resource) = template.resource_mut(&invocation)
  {
    resource.depends_on.insert(policy);
  }
  Ok(invocation)
}

/// Name an EventBridge rule by its bus and contents; the permission carries
/// no user-given name.
fn eventbridge_rule_name(p: &EventBridgePermission) -> String {
  let rule = &p.rule;
  logical_name(
    "EventBridge",
    [
      p.bus_name.as_ref().map(|b| b.to_json().to_string()).unwrap_or_default(),
      rule.schedule_expression.clone().unwrap_or_default(),
      rule.event_pattern.as_ref().map(|v| v.to_string()).unwrap_or_default(),
      rule.target.input.clone().unwrap_or_default(),
      rule.target.input_path.clone().unwrap_or_default(),
      rule.description.clone().unwrap_or_default(),
    ],
  )
}

fn export_rule(
  ctx: &ExportContext<'_>,
  permission: &Permission,
  name: &str,
  rule: &EventsRule,
  bus: Option<&Expr>,
  template: &mut Template,
) -> Result<String, SynthError> {
  let logical = logical_name("EventsRule", [ctx.function_logical_name, name]);
  let mut target = BTreeMap::new();
  target.insert("Arn".to_string(), ctx.function_arn());
  target.insert("Id".to_string(), Expr::str(logical_name("Target", [ctx.function_logical_name, name])));
  if let Some(input) = &rule.target.input {
    target.insert("Input".to_string(), Expr::str(input));
  }
  if let Some(path) = &rule.target.input_path {
    target.insert("InputPath".to_string(), Expr::str(path));
  }

  let description = rule
    .description
    .clone()
    .unwrap_or_else(|| format!("{} rule for {}", sanitize(name), ctx.function.name()));
  let mut resource = Resource::new("AWS::Events::Rule")
    .prop("Description", description)
    .prop("State", "ENABLED")
    .prop("Targets", Expr::list([Expr::Map(target)]));
  if let Some(schedule) = &rule.schedule_expression {
    resource.set_prop("ScheduleExpression", schedule.as_str());
  }
  if let Some(pattern) = &rule.event_pattern {
    resource.set_prop("EventPattern", Expr::from_json(pattern));
  }
  if let Some(bus) = bus {
    resource.set_prop("EventBusName", bus.clone());
  }
  template.ensure_resource(logical.clone(), resource)?;

  invoke_permission(ctx, permission, Some(&Expr::get_att(&logical, "Arn")), template)?;
  Ok(logical)
}

fn export_logs(
  ctx: &ExportContext<'_>,
  permission: &Permission,
  p: &CloudWatchLogsPermission,
  template: &mut Template,
) -> Result<String, SynthError> {
  let mut last = String::new();
  for (name, filter) in &p.filters {
    let group = Expr::join(
      "",
      [
        Expr::str("arn:"),
        Expr::partition(),
        Expr::str(":logs:"),
        Expr::region(),
        Expr::str(":"),
        Expr::account_id(),
        Expr::str(":log-group:"),
        Expr::str(&filter.log_group_name),
        Expr::str(":*"),
      ],
    );
    let mut properties = BTreeMap::new();
    properties.insert("LogGroupName".to_string(), Expr::str(&filter.log_group_name));
    properties.insert("FilterName".to_string(), Expr::str(name));
    properties.insert("FilterPattern".to_string(), Expr::str(&filter.filter_pattern));
    last = configured_trigger(ctx, permission, group.clone(), Some(&group), properties, template)?;
  }
  Ok(last)
}

fn export_codecommit(
  ctx: &ExportContext<'_>,
  permission: &Permission,
  p: &CodeCommitPermission,
  template: &mut Template,
) -> Result<String, SynthError> {
  let repository = Expr::join(
    "",
    [
      Expr::str("arn:"),
      Expr::partition(),
      Expr::str(":codecommit:"),
      Expr::region(),
      Expr::str(":"),
      Expr::account_id(),
      Expr::str(":"),
      Expr::str(&p.repository_name),
    ],
  );
  let mut properties = BTreeMap::new();
  properties.insert("RepositoryName".to_string(), Expr::str(&p.repository_name));
  properties.insert(
    "TriggerName".to_string(),
    Expr::str(format!("{}-{}", ctx.service_name, ctx.function.internal_name())),
  );
  properties.insert("Branches".to_string(), Expr::strings(p.branches.iter().cloned()));
  properties.insert("Events".to_string(), Expr::strings(p.events.iter().cloned()));
  configured_trigger(ctx, permission, repository.clone(), Some(&repository), properties, template)
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::consts::{CR_S3_NOTIFICATION, CR_SES_RULES};
  use crate::model::{BoxError, CloudWatchEventsPermission, KeyFilter, LogFilter, MessageBodyStorage};
  use crate::runtime::Context;
  use serde_json::json;

  type Res<T> = Result<T, BoxError>;

  fn function() -> Function {
    Function::new("onUpload", |_c: Context| async { Res::Ok(()) }).unwrap()
  }

  fn export(f: &Function, permission: impl Into<Permission>, template: &mut Template) -> String {
    let config = BuildConfig::default();
    let logical = f.logical_name();
    let ctx = ExportContext {
      service_name: "svc",
      config: &config,
      function: f,
      function_logical_name: &logical,
    };
    export_permission(&ctx, &permission.into(), template).unwrap()
  }

  #[test]
  fn s3_trigger_emits_permission_configurator_and_invocation() {
    let f = function();
    let mut t = Template::new("t");
    let p = S3Permission::new("arn:aws:s3:::b-xyz", ["s3:ObjectCreated:*", "s3:ObjectRemoved:*"])
      .with_filter(KeyFilter::suffix(".jpg"));
    let invocation = export(&f, p, &mut t);

    assert_eq!(t.resource_type(&invocation), Some(CR_S3_NOTIFICATION));
    let json = serde_json::to_value(&t.resources[&invocation]).unwrap();
    assert_eq!(json["Properties"]["BucketArn"], "arn:aws:s3:::b-xyz");
    assert_eq!(json["Properties"]["Events"], json!(["s3:ObjectCreated:*", "s3:ObjectRemoved:*"]));
    assert_eq!(json["Properties"]["Filter"]["Key"]["FilterRules"][0]["Value"], ".jpg");

    let permissions: Vec<_> = t.resources_of_type("AWS::Lambda::Permission").collect();
    assert_eq!(permissions.len(), 1);
    let permission = serde_json::to_value(permissions[0].1).unwrap();
    assert_eq!(permission["Properties"]["Principal"], "s3.amazonaws.com");
    assert_eq!(permission["Properties"]["SourceArn"], "arn:aws:s3:::b-xyz");
    assert!(t.resources[&invocation].depends_on.contains(permissions[0].0));

    assert_eq!(t.resources_of_type("AWS::Lambda::Function").count(), 1);
    assert_eq!(t.resources_of_type("AWS::IAM::Role").count(), 1);
  }

  #[test]
  fn exporting_twice_is_idempotent() {
    let f = function();
    let mut once = Template::new("t");
    let p = S3Permission::new("arn:aws:s3:::b-xyz", ["s3:ObjectCreated:*"]);
    let a = export(&f, p.clone(), &mut once);

    let mut twice = once.clone();
    let b = export(&f, p, &mut twice);
    assert_eq!(a, b);
    assert_eq!(once, twice);
  }

  #[test]
  fn symbolic_sources_are_decoded() {
    let f = function();
    let mut t = Template::new("t");
    let encoded = Expr::reference("Topic").encode_symbolic();
    let invocation = export(&f, SnsPermission::new(encoded), &mut t);
    assert_eq!(t.resources[&invocation].get_prop("TopicArn"), Some(&Expr::reference("Topic")));
  }

  #[test]
  fn events_rules_target_the_function() {
    let f = function();
    let mut t = Template::new("t");
    let p = CloudWatchEventsPermission::new()
      .rule("every5", crate::model::EventsRule::schedule("rate(5 minutes)"))
      .rule("ec2", crate::model::EventsRule::pattern(json!({"source": ["aws.ec2"]})));
    export(&f, p, &mut t);

    let rules: Vec<_> = t.resources_of_type("AWS::Events::Rule").collect();
    assert_eq!(rules.len(), 2);
    assert_eq!(t.resources_of_type("AWS::Lambda::Permission").count(), 2);
    let scheduled = rules
      .iter()
      .find(|(_, r)| r.get_prop("ScheduleExpression").is_some())
      .unwrap();
    assert!(scheduled.1.get_prop("EventPattern").is_none());
    // No configurator for rule triggers.
    assert_eq!(t.resources_of_type("AWS::Lambda::Function").count(), 0);
  }

  #[test]
  fn eventbridge_rule_uses_the_bus() {
    let f = function();
    let mut t = Template::new("t");
    let p = EventBridgePermission::new(crate::model::EventsRule::pattern(json!({"source": ["app"]}))).on_bus("orders");
    let rule = export(&f, p, &mut t);
    assert_eq!(t.resources[&rule].get_prop("EventBusName"), Some(&Expr::str("orders")));
  }

  #[test]
  fn filtered_triggers_on_one_bucket_get_their_own_invocations() {
    let f = function();
    let mut t = Template::new("t");
    let jpg = S3Permission::new("arn:aws:s3:::b-xyz", ["s3:ObjectCreated:*"]).with_filter(KeyFilter::suffix(".jpg"));
    let png = S3Permission::new("arn:aws:s3:::b-xyz", ["s3:ObjectCreated:*"]).with_filter(KeyFilter::suffix(".png"));
    let a = export(&f, jpg.clone(), &mut t);
    let b = export(&f, png, &mut t);
    assert_ne!(a, b);
    assert_eq!(t.resources_of_type(CR_S3_NOTIFICATION).count(), 2);
    // Both share the invoke permission for the bucket.
    assert_eq!(t.resources_of_type("AWS::Lambda::Permission").count(), 1);
    assert_eq!(export(&f, jpg, &mut t), a);
  }

  #[test]
  fn eventbridge_rules_on_one_function_stay_apart() {
    let f = function();
    let mut t = Template::new("t");
    let orders = EventBridgePermission::new(crate::model::EventsRule::pattern(json!({"source": ["orders"]})));
    let billing = EventBridgePermission::new(crate::model::EventsRule::pattern(json!({"source": ["billing"]})));
    let a = export(&f, orders.clone(), &mut t);
    let b = export(&f, billing, &mut t);
    assert_ne!(a, b);
    assert_eq!(t.resources_of_type("AWS::Events::Rule").count(), 2);
    assert_eq!(t.resources_of_type("AWS::Lambda::Permission").count(), 2);

    let before = t.clone();
    assert_eq!(export(&f, orders, &mut t), a);
    assert_eq!(t, before);
  }

  #[test]
  fn ses_body_storage_adds_a_retained_bucket_as_prerequisite() {
    let f = function();
    let mut t = Template::new("t");
    iam::ensure_role(&mut t, &f.role_logical_name(), []).unwrap();
    let p = SesPermission::new().store_bodies(MessageBodyStorage::default());
    let invocation = export(&f, p, &mut t);

    assert_eq!(t.resource_type(&invocation), Some(CR_SES_RULES));
    let (bucket, resource) = t.resources_of_type("AWS::S3::Bucket").next().unwrap();
    assert_eq!(resource.deletion_policy, Some(DeletionPolicy::Retain));
    assert!(t.outputs.contains_key(bucket));
    let (policy, _) = t.resources_of_type("AWS::S3::BucketPolicy").next().unwrap();
    assert!(t.resources[&invocation].depends_on.contains(policy));

    let role = t.resource(&f.role_logical_name()).unwrap().role_properties().unwrap();
    assert!(
      role
        .statements()
        .any(|s| s.actions.contains(&"s3:GetObject".to_string()))
    );
  }

  #[test]
  fn logs_filters_emit_one_invocation_each() {
    let f = function();
    let mut t = Template::new("t");
    let p = CloudWatchLogsPermission::new()
      .filter("errors", LogFilter::new("/aws/lambda/x", "ERROR"))
      .filter("warnings", LogFilter::new("/aws/lambda/x", "WARN"));
    export(&f, p, &mut t);
    assert_eq!(
      t.resources
        .values()
        .filter(|r| r.resource_type == crate::consts::CR_LOGS_SUBSCRIPTION)
        .count(),
      2
    );
  }
}
