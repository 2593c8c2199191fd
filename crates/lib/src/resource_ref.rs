//! Classification of resource identifiers.
//!
//! A source identifier is either a literal ARN or a symbolic reference to a
//! resource in the template being synthesized. Symbolic references arrive as
//! [`Expr`] values, or as base64-encoded intrinsic payloads when they had to
//! travel through a string-typed field.

use base64::Engine;
use base64::engine::general_purpose::STANDARD;

use crate::template::{Expr, Template};

const ARN_PREFIX: &str = "arn:aws";

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RefType {
  Literal,
  Ref,
  GetAtt,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ResourceRef {
  pub ref_type: RefType,
  /// The literal ARN for [`RefType::Literal`], otherwise the logical name.
  pub resource_name: String,
}

impl ResourceRef {
  /// Classify a string holding a literal ARN or an encoded intrinsic.
  ///
  /// Returns `None` for anything that is neither; the caller decides whether
  /// that is an error.
  pub fn resolve(value: &str) -> Option<Self> {
    if value.starts_with(ARN_PREFIX) {
      return Some(Self {
        ref_type: RefType::Literal,
        resource_name: value.to_string(),
      });
    }
    match decode_symbolic(value)? {
      // A decoded plain string is not a reference.
      Expr::Str(_) => None,
      expr => Self::from_expr(&expr),
    }
  }

  /// Classify an expression. Only bare `Ref`/`Fn::GetAtt` and literal ARNs
  /// are recognized; composite expressions yield `None`.
  pub fn from_expr(expr: &Expr) -> Option<Self> {
    match expr {
      Expr::Str(s) => Self::resolve(s),
      Expr::Ref(name) if !name.starts_with("AWS::") => Some(Self {
        ref_type: RefType::Ref,
        resource_name: name.clone(),
      }),
      Expr::GetAtt(name, _) => Some(Self {
        ref_type: RefType::GetAtt,
        resource_name: name.clone(),
      }),
      _ => None,
    }
  }

  pub fn is_literal(&self) -> bool {
    self.ref_type == RefType::Literal
  }
}

/// Decode a base64 intrinsic payload back into an expression.
pub fn decode_symbolic(value: &str) -> Option<Expr> {
  let decoded = STANDARD.decode(value.trim()).ok()?;
  let json: serde_json::Value = serde_json::from_slice(&decoded).ok()?;
  Some(Expr::from_json(&json))
}

/// The value a source field stands for. Encoded intrinsics are decoded;
/// literals and expressions are returned unchanged.
pub fn source_expr(source: &Expr) -> Expr {
  match source {
    Expr::Str(s) if !s.starts_with(ARN_PREFIX) => match decode_symbolic(s) {
      Some(expr @ (Expr::Ref(_) | Expr::GetAtt(..) | Expr::Fn(..))) => expr,
      _ => source.clone(),
    },
    _ => source.clone(),
  }
}

/// True when `reference` is a literal containing `literal_token`, or a
/// symbolic reference to a template resource of `expected_type`.
pub fn is_resolved_resource_type(
  reference: &ResourceRef,
  template: &Template,
  literal_token: &str,
  expected_type: &str,
) -> bool {
  match reference.ref_type {
    RefType::Literal => reference.resource_name.contains(literal_token),
    RefType::Ref | RefType::GetAtt => template
      .resource_type(&reference.resource_name)
      .is_some_and(|t| t == expected_type),
  }
}

/// Whether `arn` has the provider's ARN shape: `arn:partition:service:region:account:resource`.
pub fn is_arn_shaped(arn: &str) -> bool {
  let parts: Vec<&str> = arn.splitn(6, ':').collect();
  parts.len() == 6 && parts[0] == "arn" && parts[1].starts_with("aws") && !parts[2].is_empty() && !parts[5].is_empty()
}
