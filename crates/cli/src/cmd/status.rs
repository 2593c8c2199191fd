//! Implementation of the `status` command.

use anyhow::{Context, Result};

use cirrus::cloud::aws;
use cirrus::provision::stack;

use crate::output::{print_info, print_json, print_stat, print_success};

pub fn cmd_status(stack_name: &str, redact: bool, json: bool) -> Result<()> {
  let rt = super::runtime()?;
  let summary = rt
    .block_on(async {
      let clients = aws::clients().await;
      stack::status(&clients, stack_name, redact).await
    })
    .with_context(|| format!("Failed to describe stack {stack_name}"))?;

  let Some(summary) = summary else {
    if json {
      return print_json(&serde_json::Value::Null);
    }
    print_info(&format!("Stack {stack_name} does not exist"));
    return Ok(());
  };

  if json {
    return print_json(&summary);
  }

  print_success(&format!("{} {}", summary.stack_name, summary.status));
  print_stat("Id", &summary.stack_id);
  if let Some(description) = &summary.description {
    print_stat("Description", description);
  }
  if let Some(reason) = &summary.status_reason {
    print_stat("Reason", reason);
  }
  if let Some(created) = summary.creation_time {
    print_stat("Created", &created.to_rfc3339());
  }
  if let Some(updated) = summary.last_updated_time {
    print_stat("Updated", &updated.to_rfc3339());
  }
  for (title, values) in [
    ("Parameters", &summary.parameters),
    ("Tags", &summary.tags),
    ("Outputs", &summary.outputs),
  ] {
    if values.is_empty() {
      continue;
    }
    println!();
    println!("{title}:");
    for (key, value) in values {
      print_stat(key, value);
    }
  }
  Ok(())
}
