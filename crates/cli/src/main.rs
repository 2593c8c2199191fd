//! `cirrus-hello`: a two-function service.
//!
//! `cirrus-hello build` writes the template and code archive,
//! `cirrus-hello provision -s <bucket>` deploys them, and inside the
//! provider the same binary dispatches invocations.

use std::process::ExitCode;

use serde::Deserialize;
use serde_json::{Value, json};

use cirrus::model::{BoxError, Event, ModelError};
use cirrus::runtime::Context;
use cirrus::{Function, Service};
use cirrus_cli::output::print_error;

#[derive(Debug, Deserialize)]
struct Greeting {
  #[serde(default)]
  name: Option<String>,
}

fn service() -> Result<Service, ModelError> {
  let mut service = Service::new("cirrusHello", "Hello world service")?;
  service.add_function(
    Function::new("hello", |ctx: Context| async move {
      Ok::<_, BoxError>(format!("Hello from build {}", ctx.build_id()))
    })?
    .description("Says hello"),
  )?;
  service.add_function(
    Function::new("greet", |_ctx: Context, Event(greeting): Event<Greeting>| async move {
      let name = greeting.name.unwrap_or_else(|| "world".to_string());
      Ok::<Value, BoxError>(json!({ "message": format!("Hello, {name}!") }))
    })?
    .memory(256)
    .env("GREETING_STYLE", "plain"),
  )?;
  Ok(service)
}

fn main() -> ExitCode {
  match service() {
    Ok(service) => cirrus_cli::run(service),
    Err(err) => {
      print_error(&format!("Invalid service: {err}"));
      ExitCode::FAILURE
    }
  }
}
