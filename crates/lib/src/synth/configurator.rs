//! Built-in configurator functions.
//!
//! Triggers that need out-of-band wiring are configured by a custom resource
//! served from the dispatcher binary itself. There is one configurator per
//! resource type and service; its role accumulates the statements of every
//! trigger routed through it.

use std::collections::BTreeMap;

use super::function::{dispatcher_function, environment};
use super::{SynthError, iam};
use crate::config::BuildConfig;
use crate::consts::{
  CONFIGURATOR_MEMORY_MB, CONFIGURATOR_TIMEOUT_SECS, CR_CODECOMMIT_TRIGGER, CR_LOGS_SUBSCRIPTION, CR_S3_NOTIFICATION,
  CR_SES_RULES, CR_SNS_SUBSCRIPTION, ENV_CUSTOM_RESOURCE_TYPE,
};
use crate::iam::PolicyStatement;
use crate::naming::logical_name;
use crate::template::{Expr, Template};

/// Logical names of a configurator's function and role.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(super) struct Configurator {
  pub function: String,
  pub role: String,
}

impl Configurator {
  pub fn for_type(service_name: &str, resource_type: &str) -> Self {
    Self {
      function: logical_name("ConfiguratorFunction", [resource_type, service_name]),
      role: logical_name("ConfiguratorRole", [resource_type, service_name]),
    }
  }

  /// Value for the `ServiceToken` of an invocation.
  pub fn service_token(&self) -> Expr {
    Expr::get_att(&self.function, "Arn")
  }
}

/// Ensure the configurator for `resource_type` exists and grant it
/// `statements`.
pub(super) fn ensure_configurator(
  template: &mut Template,
  service_name: &str,
  config: &BuildConfig,
  resource_type: &str,
  statements: Vec<PolicyStatement>,
) -> Result<Configurator, SynthError> {
  let configurator = Configurator::for_type(service_name, resource_type);
  ensure_handler_function(
    template,
    config,
    &configurator.function,
    &configurator.role,
    resource_type,
    statements,
  )?;
  Ok(configurator)
}

/// Ensure a dispatcher function routed by custom resource type, with its own
/// role.
pub(super) fn ensure_handler_function(
  template: &mut Template,
  config: &BuildConfig,
  function_logical: &str,
  role_logical: &str,
  resource_type: &str,
  statements: Vec<PolicyStatement>,
) -> Result<(), SynthError> {
  iam::ensure_role(template, role_logical, statements)?;
  if template.resource(function_logical).is_none() {
    let mut variables = BTreeMap::new();
    variables.insert(ENV_CUSTOM_RESOURCE_TYPE.to_string(), Expr::str(resource_type));
    let resource = dispatcher_function(
      config,
      Expr::get_att(role_logical, "Arn"),
      CONFIGURATOR_MEMORY_MB,
      CONFIGURATOR_TIMEOUT_SECS,
    )
    .prop("Description", format!("{resource_type} custom resource handler"))
    .prop("Environment", environment(&variables));
    template.add_resource(function_logical, resource)?;
  }
  Ok(())
}

/// Statements a configurator needs against one trigger source.
pub(super) fn source_statements(resource_type: &str, source: Expr) -> Vec<PolicyStatement> {
  match resource_type {
    CR_S3_NOTIFICATION => vec![PolicyStatement::allow(
      [
        "s3:GetBucketLocation",
        "s3:GetBucketNotification",
        "s3:PutBucketNotification",
        "s3:GetBucketNotificationConfiguration",
        "s3:PutBucketNotificationConfiguration",
      ],
      source,
    )],
    CR_SNS_SUBSCRIPTION => vec![PolicyStatement::allow(
      [
        "sns:ConfirmSubscription",
        "sns:GetTopicAttributes",
        "sns:Subscribe",
        "sns:Unsubscribe",
        "sns:ListSubscriptionsByTopic",
      ],
      source,
    )],
    CR_SES_RULES => vec![PolicyStatement::allow(
      [
        "ses:CreateReceiptRuleSet",
        "ses:CreateReceiptRule",
        "ses:DeleteReceiptRule",
        "ses:DeleteReceiptRuleSet",
        "ses:DescribeReceiptRuleSet",
        "ses:SetActiveReceiptRuleSet",
      ],
      "*",
    )],
    CR_LOGS_SUBSCRIPTION => vec![PolicyStatement::allow(
      [
        "logs:DescribeSubscriptionFilters",
        "logs:PutSubscriptionFilter",
        "logs:DeleteSubscriptionFilter",
      ],
      source,
    )],
    CR_CODECOMMIT_TRIGGER => vec![PolicyStatement::allow(
      ["codecommit:GetRepositoryTriggers", "codecommit:PutRepositoryTriggers"],
      source,
    )],
    _ => Vec::new(),
  }
}
