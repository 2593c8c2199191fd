//! Push-based triggers.
//!
//! Every variant names the principal that is allowed to invoke the function
//! and the source it invokes from. Variants that need out-of-band wiring
//! (bucket notifications, topic subscriptions, ...) are configured at stack
//! convergence time by a built-in configurator.

use std::collections::BTreeMap;

use serde_json::Value;

use crate::consts::{
  CR_CODECOMMIT_TRIGGER, CR_LOGS_SUBSCRIPTION, CR_S3_NOTIFICATION, CR_SES_RULES, CR_SNS_SUBSCRIPTION,
  PRINCIPAL_CODECOMMIT, PRINCIPAL_EVENTS, PRINCIPAL_S3, PRINCIPAL_SES, PRINCIPAL_SNS,
};
use crate::resource_ref::{ResourceRef, is_arn_shaped};
use crate::template::Expr;

/// Object key filter for bucket notifications.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct KeyFilter {
  pub prefix: Option<String>,
  pub suffix: Option<String>,
}

impl KeyFilter {
  pub fn prefix(prefix: impl Into<String>) -> Self {
    Self {
      prefix: Some(prefix.into()),
      suffix: None,
    }
  }

  pub fn suffix(suffix: impl Into<String>) -> Self {
    Self {
      prefix: None,
      suffix: Some(suffix.into()),
    }
  }

  pub fn is_empty(&self) -> bool {
    self.prefix.is_none() && self.suffix.is_none()
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct S3Permission {
  pub bucket_arn: Expr,
  pub events: Vec<String>,
  pub filter: KeyFilter,
}

impl S3Permission {
  pub fn new<S: Into<String>>(bucket_arn: impl Into<Expr>, events: impl IntoIterator<Item = S>) -> Self {
    Self {
      bucket_arn: bucket_arn.into(),
      events: events.into_iter().map(Into::into).collect(),
      filter: KeyFilter::default(),
    }
  }

  pub fn with_filter(mut self, filter: KeyFilter) -> Self {
    self.filter = filter;
    self
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct SnsPermission {
  pub topic_arn: Expr,
}

impl SnsPermission {
  pub fn new(topic_arn: impl Into<Expr>) -> Self {
    Self {
      topic_arn: topic_arn.into(),
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum SesInvocationType {
  #[default]
  Event,
  RequestResponse,
}

impl SesInvocationType {
  pub fn as_str(self) -> &'static str {
    match self {
      SesInvocationType::Event => "Event",
      SesInvocationType::RequestResponse => "RequestResponse",
    }
  }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum TlsPolicy {
  #[default]
  Optional,
  Require,
}

impl TlsPolicy {
  pub fn as_str(self) -> &'static str {
    match self {
      TlsPolicy::Optional => "Optional",
      TlsPolicy::Require => "Require",
    }
  }
}

/// One rule in the receipt rule set the SES configurator maintains.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ReceiptRule {
  pub name: String,
  pub enabled: bool,
  pub recipients: Vec<String>,
  pub scan_enabled: bool,
  pub tls_policy: TlsPolicy,
}

impl ReceiptRule {
  pub fn new(name: impl Into<String>) -> Self {
    Self {
      name: name.into(),
      enabled: true,
      recipients: Vec::new(),
      scan_enabled: false,
      tls_policy: TlsPolicy::default(),
    }
  }

  pub fn recipient(mut self, address: impl Into<String>) -> Self {
    self.recipients.push(address.into());
    self
  }

  pub fn scan(mut self, enabled: bool) -> Self {
    self.scan_enabled = enabled;
    self
  }

  pub fn tls(mut self, policy: TlsPolicy) -> Self {
    self.tls_policy = policy;
    self
  }
}

/// Where SES stores raw message bodies before invoking the function.
///
/// Without an explicit bucket a dedicated bucket is added to the template and
/// retained when the stack is deleted.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct MessageBodyStorage {
  pub bucket_name: Option<Expr>,
  pub key_prefix: Option<String>,
}

#[derive(Debug, Clone, PartialEq)]
pub struct SesPermission {
  pub invocation_type: SesInvocationType,
  pub receipt_rules: Vec<ReceiptRule>,
  pub message_body_storage: Option<MessageBodyStorage>,
}

impl Default for SesPermission {
  fn default() -> Self {
    Self {
      invocation_type: SesInvocationType::default(),
      receipt_rules: vec![ReceiptRule::new("Default")],
      message_body_storage: None,
    }
  }
}

impl SesPermission {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn invocation_type(mut self, invocation_type: SesInvocationType) -> Self {
    self.invocation_type = invocation_type;
    self
  }

  pub fn rules(mut self, rules: Vec<ReceiptRule>) -> Self {
    self.receipt_rules = rules;
    self
  }

  pub fn store_bodies(mut self, storage: MessageBodyStorage) -> Self {
    self.message_body_storage = Some(storage);
    self
  }
}

/// Target options for a rule that invokes the function.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct RuleTarget {
  pub input: Option<String>,
  pub input_path: Option<String>,
}

/// A scheduled or pattern-matching events rule. Exactly one of
/// `schedule_expression` and `event_pattern` must be set.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventsRule {
  pub description: Option<String>,
  pub schedule_expression: Option<String>,
  pub event_pattern: Option<Value>,
  pub target: RuleTarget,
}

impl EventsRule {
  pub fn schedule(expression: impl Into<String>) -> Self {
    Self {
      schedule_expression: Some(expression.into()),
      ..Self::default()
    }
  }

  pub fn pattern(pattern: Value) -> Self {
    Self {
      event_pattern: Some(pattern),
      ..Self::default()
    }
  }

  pub fn description(mut self, description: impl Into<String>) -> Self {
    self.description = Some(description.into());
    self
  }

  pub fn target(mut self, target: RuleTarget) -> Self {
    self.target = target;
    self
  }

  fn validate(&self, name: &str) -> Result<(), String> {
    match (&self.schedule_expression, &self.event_pattern) {
      (Some(_), Some(_)) => Err(format!("rule {name} sets both a schedule and an event pattern")),
      (None, None) => Err(format!("rule {name} needs a schedule or an event pattern")),
      _ => Ok(()),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloudWatchEventsPermission {
  pub rules: BTreeMap<String, EventsRule>,
}

impl CloudWatchEventsPermission {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn rule(mut self, name: impl Into<String>, rule: EventsRule) -> Self {
    self.rules.insert(name.into(), rule);
    self
  }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EventBridgePermission {
  pub bus_name: Option<Expr>,
  pub rule: EventsRule,
}

impl EventBridgePermission {
  pub fn new(rule: EventsRule) -> Self {
    Self { bus_name: None, rule }
  }

  pub fn on_bus(mut self, bus_name: impl Into<Expr>) -> Self {
    self.bus_name = Some(bus_name.into());
    self
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LogFilter {
  pub filter_pattern: String,
  pub log_group_name: String,
}

impl LogFilter {
  pub fn new(log_group_name: impl Into<String>, filter_pattern: impl Into<String>) -> Self {
    Self {
      filter_pattern: filter_pattern.into(),
      log_group_name: log_group_name.into(),
    }
  }
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct CloudWatchLogsPermission {
  pub filters: BTreeMap<String, LogFilter>,
}

impl CloudWatchLogsPermission {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn filter(mut self, name: impl Into<String>, filter: LogFilter) -> Self {
    self.filters.insert(name.into(), filter);
    self
  }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct CodeCommitPermission {
  pub repository_name: String,
  pub branches: Vec<String>,
  pub events: Vec<String>,
}

impl CodeCommitPermission {
  pub fn new(repository_name: impl Into<String>) -> Self {
    Self {
      repository_name: repository_name.into(),
      branches: Vec::new(),
      events: vec!["all".to_string()],
    }
  }

  pub fn branch(mut self, branch: impl Into<String>) -> Self {
    self.branches.push(branch.into());
    self
  }

  pub fn events<S: Into<String>>(mut self, events: impl IntoIterator<Item = S>) -> Self {
    self.events = events.into_iter().map(Into::into).collect();
    self
  }
}

/// A push trigger owned by one function.
#[derive(Debug, Clone, PartialEq)]
pub enum Permission {
  S3(S3Permission),
  Sns(SnsPermission),
  Ses(SesPermission),
  CloudWatchEvents(CloudWatchEventsPermission),
  CloudWatchLogs(CloudWatchLogsPermission),
  CodeCommit(CodeCommitPermission),
  EventBridge(EventBridgePermission),
}

impl Permission {
  /// Service principal granted `lambda:InvokeFunction`.
  pub fn principal(&self) -> Expr {
    match self {
      Permission::S3(_) => Expr::str(PRINCIPAL_S3),
      Permission::Sns(_) => Expr::str(PRINCIPAL_SNS),
      Permission::Ses(_) => Expr::str(PRINCIPAL_SES),
      Permission::CloudWatchEvents(_) | Permission::EventBridge(_) => Expr::str(PRINCIPAL_EVENTS),
      // Log delivery uses a regional principal.
      Permission::CloudWatchLogs(_) => Expr::join("", [Expr::str("logs."), Expr::region(), Expr::str(".amazonaws.com")]),
      Permission::CodeCommit(_) => Expr::str(PRINCIPAL_CODECOMMIT),
    }
  }

  /// Custom resource type of the configurator that wires this trigger, if any.
  pub fn configurator_type(&self) -> Option<&'static str> {
    match self {
      Permission::S3(_) => Some(CR_S3_NOTIFICATION),
      Permission::Sns(_) => Some(CR_SNS_SUBSCRIPTION),
      Permission::Ses(_) => Some(CR_SES_RULES),
      Permission::CloudWatchLogs(_) => Some(CR_LOGS_SUBSCRIPTION),
      Permission::CodeCommit(_) => Some(CR_CODECOMMIT_TRIGGER),
      Permission::CloudWatchEvents(_) | Permission::EventBridge(_) => None,
    }
  }

  pub fn kind(&self) -> &'static str {
    match self {
      Permission::S3(_) => "S3",
      Permission::Sns(_) => "SNS",
      Permission::Ses(_) => "SES",
      Permission::CloudWatchEvents(_) => "CloudWatchEvents",
      Permission::CloudWatchLogs(_) => "CloudWatchLogs",
      Permission::CodeCommit(_) => "CodeCommit",
      Permission::EventBridge(_) => "EventBridge",
    }
  }

  pub(crate) fn validate(&self) -> Result<(), String> {
    match self {
      Permission::S3(p) => {
        validate_source(&p.bucket_arn)?;
        if p.events.is_empty() {
          return Err("S3 permission needs at least one event".to_string());
        }
        Ok(())
      }
      Permission::Sns(p) => validate_source(&p.topic_arn),
      Permission::Ses(p) => {
        if p.receipt_rules.is_empty() {
          return Err("SES permission needs at least one receipt rule".to_string());
        }
        let mut names: Vec<&str> = p.receipt_rules.iter().map(|r| r.name.as_str()).collect();
        names.sort_unstable();
        names.dedup();
        if names.len() != p.receipt_rules.len() {
          return Err("SES receipt rule names must be unique".to_string());
        }
        Ok(())
      }
      Permission::CloudWatchEvents(p) => {
        if p.rules.is_empty() {
          return Err("events permission needs at least one rule".to_string());
        }
        p.rules.iter().try_for_each(|(name, rule)| rule.validate(name))
      }
      Permission::EventBridge(p) => p.rule.validate("EventBridge"),
      Permission::CloudWatchLogs(p) => {
        if p.filters.is_empty() {
          return Err("logs permission needs at least one filter".to_string());
        }
        match p.filters.iter().find(|(_, f)| f.log_group_name.is_empty()) {
          Some((name, _)) => Err(format!("log filter {name} has no log group")),
          None => Ok(()),
        }
      }
      Permission::CodeCommit(p) => {
        if p.repository_name.is_empty() {
          return Err("CodeCommit permission needs a repository".to_string());
        }
        Ok(())
      }
    }
  }
}

/// Literal sources must be ARN-shaped. Symbolic sources are checked against
/// the template during synthesis.
fn validate_source(source: &Expr) -> Result<(), String> {
  match source {
    Expr::Str(s) => match ResourceRef::resolve(s) {
      Some(r) if r.is_literal() && !is_arn_shaped(s) => Err(format!("{s:?} is not an ARN")),
      Some(_) => Ok(()),
      None => Err(format!("{s:?} is neither an ARN nor a resource reference")),
    },
    Expr::Null => Err("source is empty".to_string()),
    _ => Ok(()),
  }
}

macro_rules! permission_from {
  ($($ty:ident => $variant:ident),* $(,)?) => {
    $(
      impl From<$ty> for Permission {
        fn from(value: $ty) -> Self {
          Permission::$variant(value)
        }
      }
    )*
  };
}

permission_from! {
  S3Permission => S3,
  SnsPermission => Sns,
  SesPermission => Ses,
  CloudWatchEventsPermission => CloudWatchEvents,
  CloudWatchLogsPermission => CloudWatchLogs,
  CodeCommitPermission => CodeCommit,
  EventBridgePermission => EventBridge,
}
