// src/plan/graph.rs

use std::collections::{HashMap, HashSet};

use crate::plan::model::{MarathonPlan, MilestoneId};

/// Internal node structure: stores immediate deps and dependents.
#[derive(Debug, Clone)]
struct DagNode {
    /// Milestones that must complete before this one can start.
    deps: Vec<MilestoneId>,
    /// Milestones that depend on this one.
    dependents: Vec<MilestoneId>,
}

/// Adjacency view of a plan's dependency graph, keyed by milestone id.
///
/// Acyclicity is checked in [`crate::plan::validate`]; this type only keeps
/// the edges in both directions.
#[derive(Debug, Clone)]
pub struct DagGraph {
    nodes: HashMap<MilestoneId, DagNode>,
}

impl DagGraph {
    pub fn from_plan(plan: &MarathonPlan) -> Self {
        let mut nodes: HashMap<MilestoneId, DagNode> = plan
            .milestones
            .iter()
            .map(|m| {
                (
                    m.id.clone(),
                    DagNode {
                        deps: m.dependencies.clone(),
                        dependents: Vec::new(),
                    },
                )
            })
            .collect();

        for milestone in &plan.milestones {
            for dep in &milestone.dependencies {
                if let Some(dep_node) = nodes.get_mut(dep) {
                    dep_node.dependents.push(milestone.id.clone());
                }
            }
        }

        Self { nodes }
    }

    pub fn dependencies_of(&self, id: &str) -> &[MilestoneId] {
        self.nodes
            .get(id)
            .map(|n| n.deps.as_slice())
            .unwrap_or(&[])
    }

    pub fn dependents_of(&self, id: &str) -> &[MilestoneId] {
        self.nodes
            .get(id)
            .map(|n| n.dependents.as_slice())
            .unwrap_or(&[])
    }

    /// Every milestone reachable downstream of `root`, excluding `root`.
    pub fn transitive_dependents(&self, root: &str) -> Vec<MilestoneId> {
        let mut stack: Vec<MilestoneId> = self.dependents_of(root).to_vec();
        let mut seen: HashSet<MilestoneId> = HashSet::new();
        let mut out = Vec::new();

        while let Some(id) = stack.pop() {
            if !seen.insert(id.clone()) {
                continue;
            }
            stack.extend(self.dependents_of(&id).iter().cloned());
            out.push(id);
        }

        out
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::plan::model::Milestone;

    fn diamond() -> MarathonPlan {
        let a = Milestone::new("a", "A");
        let mut b = Milestone::new("b", "B");
        b.dependencies = vec!["a".into()];
        let mut c = Milestone::new("c", "C");
        c.dependencies = vec!["a".into()];
        let mut d = Milestone::new("d", "D");
        d.dependencies = vec!["b".into(), "c".into()];
        MarathonPlan::new("diamond", vec![a, b, c, d])
    }

    #[test]
    fn edges_are_indexed_both_ways() {
        let graph = DagGraph::from_plan(&diamond());
        assert_eq!(graph.dependencies_of("d"), &["b".to_string(), "c".to_string()]);
        assert_eq!(graph.dependents_of("a"), &["b".to_string(), "c".to_string()]);
        assert!(graph.dependents_of("d").is_empty());
    }

    #[test]
    fn transitive_dependents_visit_each_node_once() {
        let graph = DagGraph::from_plan(&diamond());
        let mut downstream = graph.transitive_dependents("a");
        downstream.sort();
        assert_eq!(downstream, vec!["b", "c", "d"]);
    }
}
