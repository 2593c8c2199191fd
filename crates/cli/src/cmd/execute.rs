//! Implementation of the `execute` command: serve invocations as the
//! dispatcher.

use anyhow::{Result, anyhow};

use cirrus::Service;
use cirrus::runtime::lambda;

pub fn cmd_execute(service: &Service) -> Result<()> {
  lambda::init_logging();
  let rt = super::runtime()?;
  rt.block_on(lambda::run(service)).map_err(|e| anyhow!("Dispatcher failed: {e}"))
}
