//! Resource dependency graph.
//!
//! Every resource's `DependsOn` set becomes the union of the resources it
//! references and the dependencies emitters declared explicitly. The result
//! is validated as a DAG before the template leaves synthesis.

use std::collections::HashMap;

use petgraph::algo::toposort;
use petgraph::graph::{DiGraph, NodeIndex};

use super::SynthError;
use crate::template::Template;

/// Fold property references into `DependsOn` and validate the graph.
///
/// # Errors
///
/// - `UnresolvedReference` when a property, `DependsOn` entry or output names
///   something that is neither a resource, a parameter nor a pseudo parameter.
/// - `CycleDetected` when the dependency graph is not acyclic.
pub(super) fn stitch(template: &mut Template) -> Result<(), SynthError> {
  let names: Vec<String> = template.resources.keys().cloned().collect();
  for name in &names {
    let references = template.resources[name].references();
    for reference in references {
      if reference == *name {
        continue;
      }
      if template.resources.contains_key(&reference) {
        if let Some(resource) = template.resources.get_mut(name) {
          resource.depends_on.insert(reference);
        }
      } else if !template.is_referenceable(&reference) {
        return Err(SynthError::UnresolvedReference {
          resource: name.clone(),
          reference,
        });
      }
    }
  }

  for (name, resource) in &template.resources {
    if let Some(missing) = resource.depends_on.iter().find(|d| !template.resources.contains_key(*d)) {
      return Err(SynthError::UnresolvedReference {
        resource: name.clone(),
        reference: missing.clone(),
      });
    }
  }

  for (name, output) in &template.outputs {
    if let Some(missing) = output.value.references().into_iter().find(|r| !template.is_referenceable(r)) {
      return Err(SynthError::UnresolvedReference {
        resource: format!("output {name}"),
        reference: missing,
      });
    }
  }

  deployment_order(template).map(|_| ())
}

/// Logical names ordered so every resource follows its dependencies.
pub fn deployment_order(template: &Template) -> Result<Vec<String>, SynthError> {
  let mut graph: DiGraph<&str, ()> = DiGraph::new();
  let mut nodes: HashMap<&str, NodeIndex> = HashMap::new();
  for name in template.resources.keys() {
    nodes.insert(name.as_str(), graph.add_node(name.as_str()));
  }
  for (name, resource) in &template.resources {
    let dependent = nodes[name.as_str()];
    for dependency in &resource.depends_on {
      if let Some(&idx) = nodes.get(dependency.as_str()) {
        // Edge from dependency to dependent
        graph.add_edge(idx, dependent, ());
      }
    }
  }

  let sorted = toposort(&graph, None).map_err(|cycle| SynthError::CycleDetected(graph[cycle.node_id()].to_string()))?;
  Ok(sorted.into_iter().map(|idx| graph[idx].to_string()).collect())
}

#[cfg(test)]
mod tests {
  use super::*;
  use crate::template::{Expr, Output, Parameter, Resource};

  #[test]
  fn references_become_dependencies() {
    let mut t = Template::new("t");
    t.add_resource("Topic", Resource::new("AWS::SNS::Topic")).unwrap();
    t.add_resource(
      "Sub",
      Resource::new("AWS::SNS::Subscription").prop("TopicArn", Expr::reference("Topic")),
    )
    .unwrap();
    stitch(&mut t).unwrap();
    assert!(t.resources["Sub"].depends_on.contains("Topic"));
    assert!(t.resources["Topic"].depends_on.is_empty());
  }

  #[test]
  fn parameters_and_pseudo_parameters_resolve() {
    let mut t = Template::new("t");
    t.add_parameter("Key", Parameter::string("key")).unwrap();
    t.add_resource(
      "Fn",
      Resource::new("AWS::Lambda::Function").prop("Code", Expr::join("/", [Expr::reference("Key"), Expr::region()])),
    )
    .unwrap();
    stitch(&mut t).unwrap();
    assert!(t.resources["Fn"].depends_on.is_empty());
  }

  #[test]
  fn unresolved_reference_is_reported() {
    let mut t = Template::new("t");
    t.add_resource("A", Resource::new("AWS::SNS::Topic").prop("X", Expr::get_att("Missing", "Arn")))
      .unwrap();
    let err = stitch(&mut t).unwrap_err();
    assert!(matches!(err, SynthError::UnresolvedReference { ref reference, .. } if reference == "Missing"));
  }

  #[test]
  fn unresolved_output_is_reported() {
    let mut t = Template::new("t");
    t.add_output("Url", Output::new("url", Expr::reference("Nope"))).unwrap();
    assert!(stitch(&mut t).is_err());
  }

  #[test]
  fn cycles_are_rejected() {
    let mut t = Template::new("t");
    t.add_resource("A", Resource::new("X").prop("P", Expr::reference("B"))).unwrap();
    t.add_resource("B", Resource::new("X").prop("P", Expr::reference("A"))).unwrap();
    assert!(matches!(stitch(&mut t), Err(SynthError::CycleDetected(_))));
  }

  #[test]
  fn order_puts_dependencies_first() {
    let mut t = Template::new("t");
    t.add_resource("Role", Resource::new("AWS::IAM::Role")).unwrap();
    t.add_resource("Fn", Resource::new("AWS::Lambda::Function").prop("Role", Expr::get_att("Role", "Arn")))
      .unwrap();
    stitch(&mut t).unwrap();
    let order = deployment_order(&t).unwrap();
    let role = order.iter().position(|n| n == "Role").unwrap();
    let function = order.iter().position(|n| n == "Fn").unwrap();
    assert!(role < function);
  }
}
