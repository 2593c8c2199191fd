//! Template values and intrinsic functions.
//!
//! Symbolic references are first-class values here rather than strings. They
//! only take their provider form (`{"Ref": ..}`, `{"Fn::GetAtt": [..]}`) when
//! the template is serialized.

use std::collections::{BTreeMap, BTreeSet};

use base64::Engine;
use base64::engine::general_purpose::STANDARD;
use serde::ser::{SerializeMap, SerializeSeq};
use serde::{Serialize, Serializer};
use serde_json::Value;

/// Pseudo parameters resolved by the provider.
pub const PSEUDO_REGION: &str = "AWS::Region";
pub const PSEUDO_ACCOUNT_ID: &str = "AWS::AccountId";
pub const PSEUDO_PARTITION: &str = "AWS::Partition";
pub const PSEUDO_STACK_NAME: &str = "AWS::StackName";
pub const PSEUDO_STACK_ID: &str = "AWS::StackId";
pub const PSEUDO_NO_VALUE: &str = "AWS::NoValue";

#[derive(Debug, Clone, PartialEq)]
pub enum Expr {
  Null,
  Bool(bool),
  Int(i64),
  Str(String),
  List(Vec<Expr>),
  Map(BTreeMap<String, Expr>),
  Ref(String),
  GetAtt(String, String),
  /// Any other intrinsic, e.g. `Fn::Join` or `Fn::If`, with its argument.
  Fn(String, Box<Expr>),
}

impl Expr {
  pub fn str(value: impl Into<String>) -> Self {
    Expr::Str(value.into())
  }

  pub fn reference(name: impl Into<String>) -> Self {
    Expr::Ref(name.into())
  }

  pub fn get_att(name: impl Into<String>, attribute: impl Into<String>) -> Self {
    Expr::GetAtt(name.into(), attribute.into())
  }

  pub fn join(delimiter: &str, parts: impl IntoIterator<Item = Expr>) -> Self {
    Expr::Fn(
      "Fn::Join".to_string(),
      Box::new(Expr::List(vec![
        Expr::str(delimiter),
        Expr::List(parts.into_iter().collect()),
      ])),
    )
  }

  pub fn sub(template: impl Into<String>) -> Self {
    Expr::Fn("Fn::Sub".to_string(), Box::new(Expr::Str(template.into())))
  }

  pub fn base64(value: Expr) -> Self {
    Expr::Fn("Fn::Base64".to_string(), Box::new(value))
  }

  pub fn if_(condition: impl Into<String>, then: Expr, otherwise: Expr) -> Self {
    Expr::Fn(
      "Fn::If".to_string(),
      Box::new(Expr::List(vec![Expr::Str(condition.into()), then, otherwise])),
    )
  }

  pub fn equals(left: Expr, right: Expr) -> Self {
    Expr::Fn("Fn::Equals".to_string(), Box::new(Expr::List(vec![left, right])))
  }

  pub fn not(value: Expr) -> Self {
    Expr::Fn("Fn::Not".to_string(), Box::new(Expr::List(vec![value])))
  }

  pub fn region() -> Self {
    Expr::Ref(PSEUDO_REGION.to_string())
  }

  pub fn account_id() -> Self {
    Expr::Ref(PSEUDO_ACCOUNT_ID.to_string())
  }

  pub fn partition() -> Self {
    Expr::Ref(PSEUDO_PARTITION.to_string())
  }

  pub fn stack_name() -> Self {
    Expr::Ref(PSEUDO_STACK_NAME.to_string())
  }

  pub fn stack_id() -> Self {
    Expr::Ref(PSEUDO_STACK_ID.to_string())
  }

  pub fn no_value() -> Self {
    Expr::Ref(PSEUDO_NO_VALUE.to_string())
  }

  pub fn map<K: Into<String>>(entries: impl IntoIterator<Item = (K, Expr)>) -> Self {
    Expr::Map(entries.into_iter().map(|(k, v)| (k.into(), v)).collect())
  }

  pub fn list(items: impl IntoIterator<Item = Expr>) -> Self {
    Expr::List(items.into_iter().collect())
  }

  pub fn strings<S: Into<String>>(items: impl IntoIterator<Item = S>) -> Self {
    Expr::List(items.into_iter().map(|s| Expr::Str(s.into())).collect())
  }

  pub fn as_str(&self) -> Option<&str> {
    match self {
      Expr::Str(s) => Some(s),
      _ => None,
    }
  }

  /// Names of the template entities this value refers to.
  ///
  /// Pseudo parameters are excluded. `Fn::Sub` strings are scanned for
  /// `${Name}` and `${Name.Attribute}` placeholders.
  pub fn references(&self) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    self.collect_references(&mut out);
    out
  }

  fn collect_references(&self, out: &mut BTreeSet<String>) {
    match self {
      Expr::Ref(name) | Expr::GetAtt(name, _) => {
        if !name.starts_with("AWS::") {
          out.insert(name.clone());
        }
      }
      Expr::List(items) => items.iter().for_each(|i| i.collect_references(out)),
      Expr::Map(entries) => entries.values().for_each(|v| v.collect_references(out)),
      Expr::Fn(name, arg) => {
        if name == "Fn::Sub" {
          let template = match arg.as_ref() {
            Expr::Str(s) => Some(s.as_str()),
            Expr::List(items) => items.first().and_then(Expr::as_str),
            _ => None,
          };
          if let Some(template) = template {
            out.extend(sub_placeholders(template));
          }
        }
        // Fn::If's first argument names a condition, not a resource.
        if name == "Fn::If"
          && let Expr::List(items) = arg.as_ref()
        {
          items.iter().skip(1).for_each(|i| i.collect_references(out));
          return;
        }
        arg.collect_references(out);
      }
      Expr::Null | Expr::Bool(_) | Expr::Int(_) | Expr::Str(_) => {}
    }
  }

  /// Parse a provider-form JSON value, recognizing intrinsic functions.
  pub fn from_json(value: &Value) -> Self {
    match value {
      Value::Null => Expr::Null,
      Value::Bool(b) => Expr::Bool(*b),
      Value::Number(n) => n.as_i64().map(Expr::Int).unwrap_or_else(|| Expr::Str(n.to_string())),
      Value::String(s) => Expr::Str(s.clone()),
      Value::Array(items) => Expr::List(items.iter().map(Expr::from_json).collect()),
      Value::Object(map) => {
        if map.len() == 1 {
          let (key, arg) = map.iter().next().map(|(k, v)| (k.as_str(), v)).unwrap_or(("", value));
          if key == "Ref"
            && let Value::String(name) = arg
          {
            return Expr::Ref(name.clone());
          }
          if key == "Fn::GetAtt" {
            match arg {
              Value::Array(parts) if parts.len() == 2 => {
                if let (Some(name), Some(attr)) = (parts[0].as_str(), parts[1].as_str()) {
                  return Expr::get_att(name, attr);
                }
              }
              Value::String(dotted) => {
                if let Some((name, attr)) = dotted.split_once('.') {
                  return Expr::get_att(name, attr);
                }
              }
              _ => {}
            }
          }
          if key.starts_with("Fn::") || key == "Condition" {
            return Expr::Fn(key.to_string(), Box::new(Expr::from_json(arg)));
          }
        }
        Expr::Map(map.iter().map(|(k, v)| (k.clone(), Expr::from_json(v))).collect())
      }
    }
  }

  /// Provider-form JSON for this value.
  pub fn to_json(&self) -> Value {
    serde_json::to_value(self).unwrap_or(Value::Null)
  }

  /// Base64 of the provider-form JSON.
  ///
  /// Lets string-typed inputs smuggle a symbolic reference, which
  /// [`crate::resource_ref::ResourceRef::resolve`] decodes again.
  pub fn encode_symbolic(&self) -> String {
    STANDARD.encode(self.to_json().to_string())
  }

  /// Evaluate to a string the way the provider would, given a resolver for
  /// `Ref` (attribute `None`) and `Fn::GetAtt` (attribute `Some`).
  ///
  /// Returns `None` for values that have no string form or unresolved names.
  pub fn render(&self, resolve: &dyn Fn(&str, Option<&str>) -> Option<String>) -> Option<String> {
    match self {
      Expr::Str(s) => Some(s.clone()),
      Expr::Int(i) => Some(i.to_string()),
      Expr::Bool(b) => Some(b.to_string()),
      Expr::Ref(name) => resolve(name, None),
      Expr::GetAtt(name, attr) => resolve(name, Some(attr)),
      Expr::Fn(name, arg) => match (name.as_str(), arg.as_ref()) {
        ("Fn::Join", Expr::List(args)) if args.len() == 2 => {
          let delimiter = args[0].as_str()?;
          let Expr::List(parts) = &args[1] else {
            return None;
          };
          let rendered: Option<Vec<String>> = parts.iter().map(|p| p.render(resolve)).collect();
          Some(rendered?.join(delimiter))
        }
        ("Fn::Base64", inner) => Some(STANDARD.encode(inner.render(resolve)?)),
        _ => None,
      },
      Expr::Null | Expr::List(_) | Expr::Map(_) => None,
    }
  }
}

fn sub_placeholders(template: &str) -> Vec<String> {
  let mut names = Vec::new();
  let mut rest = template;
  while let Some(start) = rest.find("${") {
    let after = &rest[start + 2..];
    let Some(end) = after.find('}') else {
      break;
    };
    let inner = &after[..end];
    if !inner.starts_with('!') && !inner.starts_with("AWS::") {
      let name = inner.split('.').next().unwrap_or(inner);
      if !name.is_empty() {
        names.push(name.to_string());
      }
    }
    rest = &after[end + 1..];
  }
  names
}

impl Serialize for Expr {
  fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
    match self {
      Expr::Null => serializer.serialize_none(),
      Expr::Bool(b) => serializer.serialize_bool(*b),
      Expr::Int(i) => serializer.serialize_i64(*i),
      Expr::Str(s) => serializer.serialize_str(s),
      Expr::List(items) => {
        let mut seq = serializer.serialize_seq(Some(items.len()))?;
        for item in items {
          seq.serialize_element(item)?;
        }
        seq.end()
      }
      Expr::Map(entries) => {
        let mut map = serializer.serialize_map(Some(entries.len()))?;
        for (k, v) in entries {
          map.serialize_entry(k, v)?;
        }
        map.end()
      }
      Expr::Ref(name) => {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("Ref", name)?;
        map.end()
      }
      Expr::GetAtt(name, attr) => {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry("Fn::GetAtt", &[name, attr])?;
        map.end()
      }
      Expr::Fn(name, arg) => {
        let mut map = serializer.serialize_map(Some(1))?;
        map.serialize_entry(name, arg.as_ref())?;
        map.end()
      }
    }
  }
}

impl From<&str> for Expr {
  fn from(value: &str) -> Self {
    Expr::Str(value.to_string())
  }
}

impl From<String> for Expr {
  fn from(value: String) -> Self {
    Expr::Str(value)
  }
}

impl From<&String> for Expr {
  fn from(value: &String) -> Self {
    Expr::Str(value.clone())
  }
}

impl From<bool> for Expr {
  fn from(value: bool) -> Self {
    Expr::Bool(value)
  }
}

impl From<i64> for Expr {
  fn from(value: i64) -> Self {
    Expr::Int(value)
  }
}

impl From<u32> for Expr {
  fn from(value: u32) -> Self {
    Expr::Int(i64::from(value))
  }
}

impl From<Vec<Expr>> for Expr {
  fn from(value: Vec<Expr>) -> Self {
    Expr::List(value)
  }
}

impl From<&Value> for Expr {
  fn from(value: &Value) -> Self {
    Expr::from_json(value)
  }
}

#[cfg(test)]
mod tests {
  use super::*;
  use serde_json::json;

  #[test]
  fn intrinsics_serialize_in_provider_form() {
    assert_eq!(Expr::reference("Bucket").to_json(), json!({"Ref": "Bucket"}));
    assert_eq!(
      Expr::get_att("Fn", "Arn").to_json(),
      json!({"Fn::GetAtt": ["Fn", "Arn"]})
    );
    assert_eq!(
      Expr::join("", [Expr::str("arn:aws:s3:::"), Expr::reference("Bucket")]).to_json(),
      json!({"Fn::Join": ["", ["arn:aws:s3:::", {"Ref": "Bucket"}]]})
    );
  }

  #[test]
  fn references_skip_pseudo_parameters() {
    let expr = Expr::join(
      ":",
      [
        Expr::region(),
        Expr::reference("Table"),
        Expr::get_att("Stream", "Arn"),
      ],
    );
    let refs: Vec<_> = expr.references().into_iter().collect();
    assert_eq!(refs, vec!["Stream".to_string(), "Table".to_string()]);
  }

  #[test]
  fn references_scan_sub_placeholders() {
    let expr = Expr::sub("arn:${AWS::Partition}:s3:::${Bucket}/${Key.Arn}/${!Literal}");
    let refs: Vec<_> = expr.references().into_iter().collect();
    assert_eq!(refs, vec!["Bucket".to_string(), "Key".to_string()]);
  }

  #[test]
  fn references_ignore_condition_names() {
    let expr = Expr::if_("HasVersion", Expr::reference("Version"), Expr::no_value());
    let refs: Vec<_> = expr.references().into_iter().collect();
    assert_eq!(refs, vec!["Version".to_string()]);
  }

  #[test]
  fn from_json_recognizes_intrinsics() {
    assert_eq!(Expr::from_json(&json!({"Ref": "X"})), Expr::reference("X"));
    assert_eq!(Expr::from_json(&json!({"Fn::GetAtt": "X.Arn"})), Expr::get_att("X", "Arn"));
    assert_eq!(
      Expr::from_json(&json!({"Fn::GetAtt": ["X", "Arn"]})),
      Expr::get_att("X", "Arn")
    );
    assert!(matches!(Expr::from_json(&json!({"a": 1, "b": 2})), Expr::Map(_)));
  }

  #[test]
  fn render_resolves_join_and_base64() {
    let expr = Expr::base64(Expr::join(
      "",
      [Expr::str("region="), Expr::region(), Expr::str(";arn="), Expr::get_att("Fn", "Arn")],
    ));
    let resolved = expr
      .render(&|name, attr| match (name, attr) {
        ("AWS::Region", None) => Some("us-west-2".to_string()),
        ("Fn", Some("Arn")) => Some("arn:aws:lambda:fn".to_string()),
        _ => None,
      })
      .unwrap();
    let decoded = String::from_utf8(STANDARD.decode(resolved).unwrap()).unwrap();
    assert_eq!(decoded, "region=us-west-2;arn=arn:aws:lambda:fn");
  }
}
