//! cirrus-lib: provisioning engine for serverless services.
//!
//! This crate turns an in-memory service description into a provider template
//! and drives that template to a converged stack:
//! - `model`: functions, triggers, gateway APIs, static sites, custom resources
//! - `synth`: template synthesis, permission export, IAM aggregation
//! - `package`: dispatcher binary, code archive, container image
//! - `provision`: staged pipeline with rollback, full convergence, in-place updates
//! - `runtime`: the in-lambda dispatcher, discovery, and built-in configurators

pub mod cloud;
pub mod config;
pub mod consts;
pub mod iam;
pub mod model;
pub mod naming;
pub mod package;
pub mod provision;
pub mod resource_ref;
pub mod runtime;
pub mod synth;
pub mod template;
pub mod util;

pub use config::{ArtifactKind, BuildConfig, DeploymentMode, InPlaceFallback, ProvisionOptions};
pub use model::{Function, Service};
