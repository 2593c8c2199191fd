//! In-function side of a service: routing, interceptors, discovery and the
//! custom resource protocol.

pub mod cfn;
pub mod configurators;
mod context;
mod discovery;
mod dispatcher;
mod interceptor;
pub mod lambda;

pub use context::Context;
pub use discovery::{DiscoveredResource, DiscoveryError, DiscoveryInfo, discover};
pub use dispatcher::{CustomResourceAdapter, DispatchError, Dispatcher, Target};
pub use interceptor::{Interceptor, OnPhase, Phase, on_phase};

use crate::consts::ENV_BUILD_ID;

/// Build id of the running binary.
///
/// The packager compiles it in; a `CIRRUS_BUILD_ID` set at runtime wins.
pub fn build_id() -> String {
  std::env::var(ENV_BUILD_ID)
    .ok()
    .filter(|id| !id.is_empty())
    .or_else(|| option_env!("CIRRUS_BUILD_ID").map(str::to_string))
    .unwrap_or_else(|| "unknown".to_string())
}
