// src/plan/validate.rs

use std::collections::HashSet;

use petgraph::algo::toposort;
use petgraph::graphmap::DiGraphMap;

use crate::errors::{MarathonError, Result};
use crate::plan::model::MarathonPlan;

/// Check the structural invariants of a plan before it is executed:
/// - at least one milestone,
/// - unique ids,
/// - every dependency names a known milestone (and not itself),
/// - the dependency graph is acyclic.
pub fn validate_plan(plan: &MarathonPlan) -> Result<()> {
    ensure_has_milestones(plan)?;
    ensure_unique_ids(plan)?;
    validate_dependencies(plan)?;
    validate_dag(plan)?;
    Ok(())
}

fn ensure_has_milestones(plan: &MarathonPlan) -> Result<()> {
    if plan.milestones.is_empty() {
        return Err(MarathonError::ConfigError(
            "plan must contain at least one milestone".to_string(),
        ));
    }
    Ok(())
}

fn ensure_unique_ids(plan: &MarathonPlan) -> Result<()> {
    let mut seen = HashSet::new();
    for milestone in &plan.milestones {
        if milestone.id.trim().is_empty() {
            return Err(MarathonError::ConfigError(
                "milestone id must not be empty".to_string(),
            ));
        }
        if !seen.insert(milestone.id.as_str()) {
            return Err(MarathonError::ConfigError(format!(
                "duplicate milestone id '{}'",
                milestone.id
            )));
        }
    }
    Ok(())
}

fn validate_dependencies(plan: &MarathonPlan) -> Result<()> {
    for milestone in &plan.milestones {
        for dep in &milestone.dependencies {
            if dep == &milestone.id {
                return Err(MarathonError::ConfigError(format!(
                    "milestone '{}' cannot depend on itself",
                    milestone.id
                )));
            }
            if plan.milestone(dep).is_none() {
                return Err(MarathonError::ConfigError(format!(
                    "milestone '{}' has unknown dependency '{}'",
                    milestone.id, dep
                )));
            }
        }
    }
    Ok(())
}

fn validate_dag(plan: &MarathonPlan) -> Result<()> {
    // Edge direction: dependency -> dependent.
    let mut graph: DiGraphMap<&str, ()> = DiGraphMap::new();

    for milestone in &plan.milestones {
        graph.add_node(milestone.id.as_str());
    }
    for milestone in &plan.milestones {
        for dep in &milestone.dependencies {
            graph.add_edge(dep.as_str(), milestone.id.as_str(), ());
        }
    }

    match toposort(&graph, None) {
        Ok(_order) => Ok(()),
        Err(cycle) => Err(MarathonError::DagCycle(format!(
            "cycle detected in milestone plan involving '{}'",
            cycle.node_id()
        ))),
    }
}
