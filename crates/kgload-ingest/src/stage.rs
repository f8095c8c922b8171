//! Stage dependency graph

use kgload_common::StageName;
use std::collections::{BTreeMap, BTreeSet};

use crate::error::{LoadError, Result};

/// Directed acyclic graph of stages; an edge `a -> b` means `b` needs `a`
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct StageGraph {
    edges: BTreeMap<StageName, BTreeSet<StageName>>,
}

impl StageGraph {
    pub fn new() -> Self {
        Self::default()
    }

    /// Constraints -> independent entities -> dependent entities -> relationships
    pub fn standard() -> Self {
        let mut graph = Self::new();
        graph.add_edge(StageName::Constraints, StageName::IndependentEntities);
        graph.add_edge(StageName::IndependentEntities, StageName::DependentEntities);
        graph.add_edge(StageName::DependentEntities, StageName::Relationships);
        // Edge endpoints come from both entity stages.
        graph.add_edge(StageName::IndependentEntities, StageName::Relationships);
        graph
    }

    pub fn add_edge(&mut self, before: StageName, after: StageName) {
        self.edges.entry(before).or_default().insert(after);
        self.edges.entry(after).or_default();
    }

    /// Stages that must be terminal before `stage` starts
    pub fn prerequisites(&self, stage: StageName) -> BTreeSet<StageName> {
        self.edges
            .iter()
            .filter(|(_, after)| after.contains(&stage))
            .map(|(before, _)| *before)
            .collect()
    }

    /// Kahn's algorithm; ties are broken by stage order so the walk is deterministic
    pub fn topological_order(&self) -> Result<Vec<StageName>> {
        let mut indegree: BTreeMap<StageName, usize> =
            self.edges.keys().map(|s| (*s, 0)).collect();
        for after in self.edges.values().flatten() {
            *indegree.entry(*after).or_default() += 1;
        }

        let mut ready: BTreeSet<StageName> = indegree
            .iter()
            .filter(|(_, d)| **d == 0)
            .map(|(s, _)| *s)
            .collect();
        let mut order = Vec::with_capacity(indegree.len());

        while let Some(stage) = ready.pop_first() {
            order.push(stage);
            for next in self.edges.get(&stage).into_iter().flatten() {
                if let Some(d) = indegree.get_mut(next) {
                    *d -= 1;
                    if *d == 0 {
                        ready.insert(*next);
                    }
                }
            }
        }

        if order.len() != indegree.len() {
            let stuck: Vec<String> = indegree
                .iter()
                .filter(|(s, _)| !order.contains(*s))
                .map(|(s, _)| s.to_string())
                .collect();
            return Err(LoadError::config(format!(
                "stage graph has a cycle through {}",
                stuck.join(", ")
            )));
        }
        Ok(order)
    }
}

#[cfg(test)]
#[allow(clippy::unwrap_used, clippy::expect_used)]
mod tests {
    use super::*;

    #[test]
    fn test_standard_order() {
        let order = StageGraph::standard().topological_order().unwrap();
        assert_eq!(order, StageName::ALL.to_vec());
    }

    #[test]
    fn test_prerequisites() {
        let graph = StageGraph::standard();
        assert!(graph.prerequisites(StageName::Constraints).is_empty());
        assert_eq!(
            graph.prerequisites(StageName::Relationships),
            BTreeSet::from([StageName::IndependentEntities, StageName::DependentEntities])
        );
    }

    #[test]
    fn test_cycle_is_rejected() {
        let mut graph = StageGraph::standard();
        graph.add_edge(StageName::Relationships, StageName::IndependentEntities);
        let err = graph.topological_order().unwrap_err();
        assert!(err.to_string().contains("cycle"));
    }

    #[test]
    fn test_ties_break_by_stage_order() {
        let mut graph = StageGraph::new();
        graph.add_edge(StageName::Constraints, StageName::Relationships);
        graph.add_edge(StageName::Constraints, StageName::IndependentEntities);
        assert_eq!(
            graph.topological_order().unwrap(),
            vec![
                StageName::Constraints,
                StageName::IndependentEntities,
                StageName::Relationships
            ]
        );
    }
}
