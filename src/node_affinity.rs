use std::collections::BTreeMap;

use color_eyre::eyre::{bail, eyre, WrapErr};
use color_eyre::Result;
use k8s_openapi::api::core::v1::{
    NodeAffinity, NodeSelector, NodeSelectorRequirement, NodeSelectorTerm, PersistentVolume,
};

use crate::config::ALPHA_NODE_AFFINITY_ANNOTATION;
use crate::ext::MonitorResourceExt;

/// Decides whether a PV's node affinity selects a node with the given labels.
///
/// The legacy JSON annotation takes precedence over the structured
/// `spec.nodeAffinity` field; a PV carrying neither matches no node.
pub fn check_node_affinity(
    pv: &PersistentVolume,
    node_labels: &BTreeMap<String, String>,
) -> Result<bool> {
    if let Some(encoded) = pv.annotation(ALPHA_NODE_AFFINITY_ANNOTATION) {
        let affinity: NodeAffinity = serde_json::from_str(encoded)
            .wrap_err_with(|| format!("invalid node-affinity annotation on PV {}", pv.display_name()))?;
        if let Some(required) = affinity.required_during_scheduling_ignored_during_execution {
            if match_node_selector(&required, node_labels)? {
                return Ok(true);
            }
        }
    }

    let required = pv
        .spec
        .as_ref()
        .and_then(|spec| spec.node_affinity.as_ref())
        .and_then(|affinity| affinity.required.as_ref());
    match required {
        Some(required) => match_node_selector(required, node_labels),
        None => Ok(false),
    }
}

/// Terms are ORed; a term's expressions are ANDed. A term without
/// expressions selects nothing.
fn match_node_selector(
    selector: &NodeSelector,
    node_labels: &BTreeMap<String, String>,
) -> Result<bool> {
    for term in &selector.node_selector_terms {
        if match_node_selector_term(term, node_labels)? {
            return Ok(true);
        }
    }
    Ok(false)
}

fn match_node_selector_term(
    term: &NodeSelectorTerm,
    node_labels: &BTreeMap<String, String>,
) -> Result<bool> {
    let Some(expressions) = term.match_expressions.as_ref().filter(|e| !e.is_empty()) else {
        return Ok(false);
    };

    for requirement in expressions {
        if !match_requirement(requirement, node_labels)? {
            return Ok(false);
        }
    }
    Ok(true)
}

fn match_requirement(
    requirement: &NodeSelectorRequirement,
    node_labels: &BTreeMap<String, String>,
) -> Result<bool> {
    let label = node_labels.get(&requirement.key);
    let values = requirement.values.as_deref().unwrap_or_default();

    match requirement.operator.as_str() {
        "In" => Ok(label.is_some_and(|v| values.contains(v))),
        "NotIn" => Ok(label.map_or(true, |v| !values.contains(v))),
        "Exists" => Ok(label.is_some()),
        "DoesNotExist" => Ok(label.is_none()),
        "Gt" | "Lt" => {
            let [bound] = values else {
                bail!(
                    "operator {} on key {} requires exactly one value",
                    requirement.operator,
                    requirement.key
                );
            };
            let bound: i64 = bound
                .parse()
                .wrap_err_with(|| format!("non-numeric bound for key {}", requirement.key))?;
            let Some(label) = label else {
                return Ok(false);
            };
            let observed: i64 = label
                .parse()
                .wrap_err_with(|| format!("non-numeric label value for key {}", requirement.key))?;
            if requirement.operator == "Gt" {
                Ok(observed > bound)
            } else {
                Ok(observed < bound)
            }
        }
        other => Err(eyre!("unsupported node selector operator: {}", other)),
    }
}
