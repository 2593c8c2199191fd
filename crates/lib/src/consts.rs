pub const APP_NAME: &str = "cirrus";

/// Separator between the stack name and a function's sanitized name.
pub const FUNCTION_NAME_DELIMITER: &str = "_";

// Environment variables read by the dispatcher.
pub const ENV_FUNCTION_NAME: &str = "AWS_LAMBDA_FUNCTION_NAME";
pub const ENV_CUSTOM_RESOURCE_TYPE: &str = "CIRRUS_CUSTOM_RESOURCE_TYPE";
pub const ENV_DISCOVERY_INFO: &str = "CIRRUS_DISCOVERY_INFO";
pub const ENV_LOG_LEVEL: &str = "CIRRUS_LOG_LEVEL";
pub const ENV_STACK_NAME: &str = "CIRRUS_STACK_NAME";
pub const ENV_STACK_ID: &str = "CIRRUS_STACK_ID";
pub const ENV_BUILD_ID: &str = "CIRRUS_BUILD_ID";
pub const ENV_RUNTIME_API: &str = "AWS_LAMBDA_RUNTIME_API";

// Build-time overrides.
pub const ENV_OUTPUT_DIR: &str = "CIRRUS_OUTPUT_DIR";

pub const ARN_PREFIX: &str = "arn:aws:";
pub const POLICY_VERSION: &str = "2012-10-17";

// Service principals.
pub const PRINCIPAL_APIGATEWAY: &str = "apigateway.amazonaws.com";
pub const PRINCIPAL_EVENTS: &str = "events.amazonaws.com";
pub const PRINCIPAL_SES: &str = "ses.amazonaws.com";
pub const PRINCIPAL_SNS: &str = "sns.amazonaws.com";
pub const PRINCIPAL_S3: &str = "s3.amazonaws.com";
pub const PRINCIPAL_LOGS: &str = "logs.amazonaws.com";
pub const PRINCIPAL_LAMBDA: &str = "lambda.amazonaws.com";
pub const PRINCIPAL_CODECOMMIT: &str = "codecommit.amazonaws.com";

// Template parameters populated by the upload stage.
pub const PARAM_ARTIFACT_BUCKET: &str = "ArtifactS3Bucket";
pub const PARAM_CODE_KEY: &str = "CodeArtifactS3Key";
pub const PARAM_CODE_VERSION: &str = "CodeArtifactS3ObjectVersion";
pub const PARAM_SITE_KEY: &str = "SiteArtifactS3Key";
pub const PARAM_SITE_VERSION: &str = "SiteArtifactS3ObjectVersion";
pub const PARAM_IMAGE_URI: &str = "CodeImageURI";

pub const CONDITION_HAS_CODE_VERSION: &str = "HasCodeArtifactS3ObjectVersion";
pub const CONDITION_HAS_SITE_VERSION: &str = "HasSiteArtifactS3ObjectVersion";

// Template outputs.
pub const OUTPUT_TEMPLATE_CREATION_TIME: &str = "TemplateCreationTime";
pub const OUTPUT_BUILD_ID: &str = "BuildID";
pub const OUTPUT_API_GATEWAY_URL: &str = "APIGatewayURL";
pub const OUTPUT_WEBSOCKET_URL: &str = "APIGatewayWebSocketURL";
pub const OUTPUT_SITE_URL: &str = "S3SiteURL";

/// Metadata key holding build hints consumed by the pipeline.
pub const METADATA_BUILD_KEY: &str = "Cirrus::Build";

// Lambda function defaults.
pub const LAMBDA_RUNTIME: &str = "provided.al2023";
pub const LAMBDA_HANDLER: &str = "bootstrap";
pub const DEFAULT_MEMORY_MB: u32 = 128;
pub const DEFAULT_TIMEOUT_SECS: u32 = 3;
pub const CONFIGURATOR_MEMORY_MB: u32 = 256;
pub const CONFIGURATOR_TIMEOUT_SECS: u32 = 180;

/// Prefix for every built-in and user custom resource type.
pub const CUSTOM_RESOURCE_PREFIX: &str = "Custom::Cirrus";

// Built-in configurator resource types.
pub const CR_S3_NOTIFICATION: &str = "Custom::CirrusS3LambdaEventSource";
pub const CR_SNS_SUBSCRIPTION: &str = "Custom::CirrusSNSLambdaEventSource";
pub const CR_SES_RULES: &str = "Custom::CirrusSESLambdaEventSource";
pub const CR_LOGS_SUBSCRIPTION: &str = "Custom::CirrusCloudWatchLogsLambdaEventSource";
pub const CR_CODECOMMIT_TRIGGER: &str = "Custom::CirrusCodeCommitLambdaEventSource";
pub const CR_SITE_POPULATOR: &str = "Custom::CirrusZipToS3Bucket";

/// Name of the executable inside the code archive.
pub const ARCHIVE_BINARY_NAME: &str = "bootstrap";
