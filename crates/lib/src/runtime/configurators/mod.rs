//! Built-in custom resource handlers.
//!
//! Each one wires a trigger the template cannot express directly. They run
//! inside the stack's own dispatcher binary, selected by
//! `CIRRUS_CUSTOM_RESOURCE_TYPE`.

mod codecommit;
mod logs;
mod s3;
mod ses;
mod site;
mod sns;

use std::error::Error;
use std::sync::Arc;

use aws_config::{BehaviorVersion, SdkConfig};
use serde::Deserialize;
use tokio::sync::OnceCell;

pub use codecommit::CodeCommitTriggerConfigurator;
pub use logs::LogsSubscriptionConfigurator;
pub use s3::S3NotificationConfigurator;
pub use ses::SesRulesConfigurator;
pub use site::SitePopulator;
pub use sns::SnsSubscriptionConfigurator;

use crate::model::{BoxError, CustomResourceHandler};

static SDK_CONFIG: OnceCell<SdkConfig> = OnceCell::const_new();

/// Provider configuration from the function's environment, loaded once.
pub(crate) async fn sdk_config() -> &'static SdkConfig {
  SDK_CONFIG
    .get_or_init(|| aws_config::load_defaults(BehaviorVersion::latest()))
    .await
}

/// Every built-in handler.
pub fn builtin() -> Vec<Arc<dyn CustomResourceHandler>> {
  vec![
    Arc::new(S3NotificationConfigurator),
    Arc::new(SnsSubscriptionConfigurator),
    Arc::new(SesRulesConfigurator),
    Arc::new(LogsSubscriptionConfigurator),
    Arc::new(CodeCommitTriggerConfigurator),
    Arc::new(SitePopulator),
  ]
}

/// Properties every configurator invocation carries.
#[derive(Debug, Clone, Deserialize)]
#[serde(rename_all = "PascalCase")]
pub(crate) struct Target {
  pub lambda_target_arn: String,
}

/// An SDK failure with the operation that produced it and the full error
/// chain rendered.
pub(crate) fn sdk_error<E: Error + Send + Sync + 'static>(operation: &str, err: E) -> BoxError {
  format!("{operation}: {}", aws_sdk_s3::error::DisplayErrorContext(&err)).into()
}

/// The trailing component of an ARN, e.g. the bucket of `arn:aws:s3:::b`.
pub(crate) fn arn_resource(arn: &str) -> &str {
  arn.rsplit(':').next().unwrap_or(arn)
}
