//! Deterministic resource naming.
//!
//! Every logical name emitted into a template comes from [`logical_name`]:
//! a caller-supplied prefix followed by a 40 hex digit digest of the parts.
//! Identical parts give identical names across runs and processes, which is
//! what lets the provider update a resource in place. Passing no parts salts
//! the digest with fresh randomness so the provider replaces the resource.

use sha1::{Digest, Sha1};

use crate::consts::FUNCTION_NAME_DELIMITER;

/// Derive an alphanumeric logical name from `prefix` and a digest of `parts`.
pub fn logical_name<I, S>(prefix: &str, parts: I) -> String
where
  I: IntoIterator<Item = S>,
  S: AsRef<str>,
{
  let mut hasher = Sha1::new();
  let mut any = false;
  for part in parts {
    hasher.update(part.as_ref().as_bytes());
    hasher.update([0u8]);
    any = true;
  }
  if !any {
    hasher.update(uuid::Uuid::new_v4().as_bytes());
  }
  let digest = format!("{:x}", hasher.finalize());

  format!("{}{}", prefix, digest)
    .chars()
    .filter(|c| c.is_ascii_alphanumeric())
    .collect()
}

/// Logical name whose only salt is the prefix itself.
pub fn stable_name(prefix: &str) -> String {
  logical_name(prefix, [prefix])
}

/// Collapse every run of non-alphanumeric characters to a single delimiter.
///
/// Leading and trailing runs are dropped, so `"::api::get_item"` becomes
/// `"api_get_item"`.
pub fn sanitize(name: &str) -> String {
  let mut out = String::with_capacity(name.len());
  let mut pending = false;
  for c in name.chars() {
    if c.is_ascii_alphanumeric() {
      if pending && !out.is_empty() {
        out.push_str(FUNCTION_NAME_DELIMITER);
      }
      pending = false;
      out.push(c);
    } else {
      pending = true;
    }
  }
  out
}

/// The provider-visible function name: `{stack}{delim}{sanitized}`.
pub fn function_full_name(stack_name: &str, internal_name: &str) -> String {
  format!("{}{}{}", stack_name, FUNCTION_NAME_DELIMITER, sanitize(internal_name))
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn logical_name_is_stable_for_same_parts() {
    let a = logical_name("Role", ["svc", "hello"]);
    let b = logical_name("Role", ["svc", "hello"]);
    assert_eq!(a, b);
    assert!(a.starts_with("Role"));
    assert_eq!(a.len(), "Role".len() + 40);
  }

  #[test]
  fn logical_name_differs_for_different_parts() {
    assert_ne!(logical_name("Role", ["a"]), logical_name("Role", ["b"]));
    // Part boundaries matter.
    assert_ne!(logical_name("Role", ["ab", "c"]), logical_name("Role", ["a", "bc"]));
  }

  #[test]
  fn logical_name_without_parts_is_fresh() {
    let empty: [&str; 0] = [];
    let a = logical_name("Deployment", empty);
    let b = logical_name("Deployment", empty);
    assert_ne!(a, b);
  }

  #[test]
  fn logical_name_strips_non_alphanumerics() {
    let name = logical_name("my-prefix.v2", ["x"]);
    assert!(name.starts_with("myprefixv2"));
    assert!(name.chars().all(|c| c.is_ascii_alphanumeric()));
  }

  #[test]
  fn sanitize_collapses_runs() {
    assert_eq!(sanitize("hello"), "hello");
    assert_eq!(sanitize("api::get-item"), "api_get_item");
    assert_eq!(sanitize("  lead..and  trail "), "lead_and_trail");
    assert_eq!(sanitize("a.-.b"), "a_b");
  }

  #[test]
  fn full_name_joins_stack_and_sanitized_name() {
    assert_eq!(function_full_name("MyStack", "handlers::hello"), "MyStack_handlers_hello");
  }
}
