//! IAM policy statements and role definitions.

use serde::ser::SerializeMap;
use serde::{Serialize, Serializer};

use crate::consts::{POLICY_VERSION, PRINCIPAL_LAMBDA};
use crate::template::Expr;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Effect {
  Allow,
  Deny,
}

#[derive(Debug, Clone, PartialEq)]
pub struct PolicyStatement {
  pub effect: Effect,
  pub actions: Vec<String>,
  pub resource: Expr,
}

impl PolicyStatement {
  pub fn allow<S: Into<String>>(actions: impl IntoIterator<Item = S>, resource: impl Into<Expr>) -> Self {
    Self {
      effect: Effect::Allow,
      actions: actions.into_iter().map(Into::into).collect(),
      resource: resource.into(),
    }
  }

  /// Add any of `actions` not already present, keeping order.
  pub fn merge_actions<'a>(&mut self, actions: impl IntoIterator<Item = &'a String>) {
    for action in actions {
      if !self.actions.contains(action) {
        self.actions.push(action.clone());
      }
    }
  }
}

impl Serialize for PolicyStatement {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    let mut map = serializer.serialize_map(Some(3))?;
    map.serialize_entry("Effect", &self.effect)?;
    map.serialize_entry("Action", &self.actions)?;
    map.serialize_entry("Resource", &self.resource)?;
    map.end()
  }
}

/// A role synthesized for a function from its privilege list.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct RoleDefinition {
  pub privileges: Vec<PolicyStatement>,
  pub managed_policy_arns: Vec<Expr>,
}

impl RoleDefinition {
  pub fn new() -> Self {
    Self::default()
  }

  pub fn with_privilege(mut self, statement: PolicyStatement) -> Self {
    self.privileges.push(statement);
    self
  }

  pub fn with_managed_policy(mut self, arn: impl Into<Expr>) -> Self {
    self.managed_policy_arns.push(arn.into());
    self
  }
}

/// Statements every synthesized role starts with: log delivery, metric
/// publishing, and read access to the owning stack.
pub fn baseline_statements() -> Vec<PolicyStatement> {
  vec![
    PolicyStatement::allow(
      ["logs:CreateLogGroup", "logs:CreateLogStream", "logs:PutLogEvents"],
      "arn:aws:logs:*:*:*",
    ),
    PolicyStatement::allow(["cloudwatch:PutMetricData"], "*"),
    PolicyStatement::allow(
      ["cloudformation:DescribeStacks", "cloudformation:DescribeStackResource"],
      Expr::stack_id(),
    ),
  ]
}

/// Trust policy letting the given service principals assume a role.
pub fn assume_role_policy(principals: &[&str]) -> Expr {
  Expr::map([
    ("Version", Expr::str(POLICY_VERSION)),
    (
      "Statement",
      Expr::list([Expr::map([
        ("Effect", Expr::str("Allow")),
        ("Principal", Expr::map([("Service", Expr::strings(principals.iter().copied()))])),
        ("Action", Expr::strings(["sts:AssumeRole"])),
      ])]),
    ),
  ])
}

pub fn lambda_assume_role_policy() -> Expr {
  assume_role_policy(&[PRINCIPAL_LAMBDA])
}

/// Pull-based event sources whose consumers need extra role statements.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EventSourceKind {
  DynamoDbStream,
  KinesisStream,
  SqsQueue,
  KafkaCluster,
  MqBroker,
}

impl EventSourceKind {
  pub const ALL: [EventSourceKind; 5] = [
    EventSourceKind::DynamoDbStream,
    EventSourceKind::KinesisStream,
    EventSourceKind::SqsQueue,
    EventSourceKind::KafkaCluster,
    EventSourceKind::MqBroker,
  ];

  /// Substring identifying this kind inside a literal ARN.
  pub fn literal_token(self) -> &'static str {
    match self {
      EventSourceKind::DynamoDbStream => ":dynamodb:",
      EventSourceKind::KinesisStream => ":kinesis:",
      EventSourceKind::SqsQueue => ":sqs:",
      EventSourceKind::KafkaCluster => ":kafka:",
      EventSourceKind::MqBroker => ":mq:",
    }
  }

  /// Template resource type declaring this kind.
  pub fn resource_type(self) -> &'static str {
    match self {
      EventSourceKind::DynamoDbStream => "AWS::DynamoDB::Table",
      EventSourceKind::KinesisStream => "AWS::Kinesis::Stream",
      EventSourceKind::SqsQueue => "AWS::SQS::Queue",
      EventSourceKind::KafkaCluster => "AWS::MSK::Cluster",
      EventSourceKind::MqBroker => "AWS::AmazonMQ::Broker",
    }
  }

  pub fn actions(self) -> &'static [&'static str] {
    match self {
      EventSourceKind::DynamoDbStream => &[
        "dynamodb:DescribeStream",
        "dynamodb:GetRecords",
        "dynamodb:GetShardIterator",
        "dynamodb:ListStreams",
      ],
      EventSourceKind::KinesisStream => &[
        "kinesis:GetRecords",
        "kinesis:GetShardIterator",
        "kinesis:DescribeStream",
        "kinesis:DescribeStreamSummary",
        "kinesis:ListShards",
        "kinesis:ListStreams",
        "kinesis:SubscribeToShard",
      ],
      EventSourceKind::SqsQueue => &[
        "sqs:ReceiveMessage",
        "sqs:DeleteMessage",
        "sqs:GetQueueAttributes",
        "sqs:ChangeMessageVisibility",
      ],
      EventSourceKind::KafkaCluster => &[
        "kafka:DescribeCluster",
        "kafka:DescribeClusterV2",
        "kafka:GetBootstrapBrokers",
      ],
      EventSourceKind::MqBroker => &["mq:DescribeBroker", "secretsmanager:GetSecretValue"],
    }
  }

  pub fn statement(self, source: Expr) -> PolicyStatement {
    PolicyStatement::allow(self.actions().iter().copied(), source)
  }
}
