//! DAG builder for constructing dependency graphs from phases.
//!
//! The builder takes a list of phases with their dependencies and constructs
//! a directed acyclic graph (DAG) that can be used for scheduling.

use crate::phase::Phase;
use anyhow::{Result, bail};
use std::collections::{HashMap, HashSet};

/// Undirected adjacency view of a graph, used by track partitioning.
pub type UndirectedAdjacency = Vec<Vec<PhaseIndex>>;

/// Index into the phase list.
pub type PhaseIndex = usize;

/// Directed graph edge: (from, to) meaning "from" must complete before "to".
#[derive(Debug, Clone)]
#[allow(dead_code)]
pub struct Edge {
    pub from: PhaseIndex,
    pub to: PhaseIndex,
}

/// A directed acyclic graph of phases.
#[derive(Debug)]
pub struct PhaseGraph {
    /// Phases indexed by their position
    phases: Vec<Phase>,
    /// Map from phase number to index
    index_map: HashMap<String, PhaseIndex>,
    /// Forward edges (dependencies): index -> list of phases that depend on it
    forward_edges: Vec<Vec<PhaseIndex>>,
    /// Reverse edges: index -> list of phases it depends on
    reverse_edges: Vec<Vec<PhaseIndex>>,
}

impl PhaseGraph {
    /// Get the number of phases in the graph.
    pub fn len(&self) -> usize {
        self.phases.len()
    }

    /// Check if the graph is empty.
    pub fn is_empty(&self) -> bool {
        self.phases.is_empty()
    }

    /// Get a phase by its index.
    pub fn get_phase(&self, index: PhaseIndex) -> Option<&Phase> {
        self.phases.get(index)
    }

    /// Get a phase by its id.
    pub fn get_phase_by_id(&self, id: &str) -> Option<&Phase> {
        self.index_map.get(id).and_then(|&i| self.phases.get(i))
    }

    /// Get the index for a phase id.
    pub fn get_index(&self, id: &str) -> Option<PhaseIndex> {
        self.index_map.get(id).copied()
    }

    /// Undirected adjacency (union of forward and reverse edges), used by
    /// track partitioning to find connected components.
    pub fn undirected_adjacency(&self) -> UndirectedAdjacency {
        let mut adj: UndirectedAdjacency = vec![Vec::new(); self.len()];
        for (i, outs) in self.forward_edges.iter().enumerate() {
            for &j in outs {
                adj[i].push(j);
                adj[j].push(i);
            }
        }
        adj
    }

    /// Get all phases.
    pub fn phases(&self) -> &[Phase] {
        &self.phases
    }

    /// Get phases that depend on the given phase (forward edges).
    pub fn dependents(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.forward_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Get phases that the given phase depends on (reverse edges).
    pub fn dependencies(&self, index: PhaseIndex) -> &[PhaseIndex] {
        self.reverse_edges.get(index).map_or(&[], |v| v.as_slice())
    }

    /// Get phases with no dependencies (entry points).
    pub fn root_phases(&self) -> Vec<PhaseIndex> {
        self.reverse_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Get phases that no other phase depends on (exit points).
    pub fn leaf_phases(&self) -> Vec<PhaseIndex> {
        self.forward_edges
            .iter()
            .enumerate()
            .filter(|(_, deps)| deps.is_empty())
            .map(|(i, _)| i)
            .collect()
    }

    /// Check if all dependencies of a phase are satisfied.
    pub fn dependencies_satisfied(
        &self,
        index: PhaseIndex,
        completed: &HashSet<PhaseIndex>,
    ) -> bool {
        self.dependencies(index)
            .iter()
            .all(|dep| completed.contains(dep))
    }
}

/// Builder for constructing phase graphs.
pub struct DagBuilder {
    phases: Vec<Phase>,
}

impl DagBuilder {
    /// Create a new builder with the given phases.
    pub fn new(phases: Vec<Phase>) -> Self {
        Self { phases }
    }

    /// Build the phase graph.
    ///
    /// This validates the graph structure:
    /// - All dependencies must reference existing phases
    /// - No cycles are allowed
    pub fn build(self) -> Result<PhaseGraph> {
        if self.phases.is_empty() {
            return Ok(PhaseGraph {
                phases: Vec::new(),
                index_map: HashMap::new(),
                forward_edges: Vec::new(),
                reverse_edges: Vec::new(),
            });
        }

        // Build index map
        let mut index_map = HashMap::new();
        for (i, phase) in self.phases.iter().enumerate() {
            if index_map.contains_key(&phase.id) {
                bail!("Duplicate phase number: {}", phase.id);
            }
            index_map.insert(phase.id.clone(), i);
        }

        // Validate dependencies and build edges
        let mut forward_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); self.phases.len()];
        let mut reverse_edges: Vec<Vec<PhaseIndex>> = vec![Vec::new(); self.phases.len()];

        for (to_idx, phase) in self.phases.iter().enumerate() {
            for dep in &phase.depends_on {
                let from_idx = *index_map.get(dep).ok_or_else(|| {
                    anyhow::anyhow!(
                        "Unknown dependency '{}' in phase '{}': no phase with that number exists",
                        dep,
                        phase.id
                    )
                })?;

                // Add edge: from_idx -> to_idx (from must complete before to)
                forward_edges[from_idx].push(to_idx);
                reverse_edges[to_idx].push(from_idx);
            }
        }

        let graph = PhaseGraph {
            phases: self.phases,
            index_map,
            forward_edges,
            reverse_edges,
        };

        // Validate no cycles using topological sort
        Self::validate_no_cycles(&graph)?;

        Ok(graph)
    }

    /// Validate that the graph has no cycles using Kahn's algorithm.
    fn validate_no_cycles(graph: &PhaseGraph) -> Result<()> {
        let mut in_degree: Vec<usize> = graph.reverse_edges.iter().map(|deps| deps.len()).collect();

        let mut queue: Vec<PhaseIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, deg)| *deg == 0)
            .map(|(i, _)| i)
            .collect();

        let mut processed = 0;

        while let Some(node) = queue.pop() {
            processed += 1;

            for &dependent in graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    queue.push(dependent);
                }
            }
        }

        if processed != graph.len() {
            // Find phases involved in cycles for better error message
            let cycle_phases: Vec<&str> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, deg)| *deg > 0)
                .filter_map(|(i, _)| graph.get_phase(i).map(|p| p.id.as_str()))
                .collect();

            bail!(
                "Cycle detected in phase dependencies. Involved phases: {:?}",
                cycle_phases
            );
        }

        Ok(())
    }
}
