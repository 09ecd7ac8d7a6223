//! DAG scheduler: answers "what is runnable right now, and in what order?"
//!
//! Wraps a `PhaseGraph` with per-phase status tracking and the four
//! read-only query operations the worker group drives off: ready tasks
//! (impact-ordered), speculative-eligible candidates, tracks, and impact
//! itself.

use crate::dag::builder::{DagBuilder, PhaseGraph, PhaseIndex};
use crate::dag::impact;
use crate::dag::tracks;
use crate::errors::ValidationError;
use crate::phase::{Phase, PhaseStatus};
use std::collections::{HashMap, HashSet};

/// Tuning knobs for scheduling decisions.
#[derive(Debug, Clone, Copy)]
pub struct DagConfig {
    /// Weight given to PageRank in the composite impact score; the
    /// remainder goes to betweenness centrality.
    pub impact_alpha: f64,
}

impl Default for DagConfig {
    fn default() -> Self {
        Self { impact_alpha: 0.6 }
    }
}

/// A candidate for speculative dispatch: the phase that could run early,
/// and the single dependency it is speculating on.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SpeculativeCandidate {
    pub phase_id: String,
    pub speculates_on: String,
}

/// The DAG-and-status view the scheduler answers queries against.
#[derive(Debug)]
pub struct DagScheduler {
    graph: PhaseGraph,
    statuses: Vec<PhaseStatus>,
    impact: Vec<f64>,
    config: DagConfig,
}

impl DagScheduler {
    pub fn from_phases(phases: &[Phase], config: DagConfig) -> anyhow::Result<Self> {
        let graph = DagBuilder::new(phases.to_vec()).build()?;
        let statuses = graph.phases().iter().map(|p| p.status).collect();
        let forward: Vec<Vec<PhaseIndex>> = (0..graph.len())
            .map(|i| graph.dependents(i).to_vec())
            .collect();
        let impact = impact::impact_scores(&forward, config.impact_alpha);

        Ok(Self {
            graph,
            statuses,
            impact,
            config,
        })
    }

    pub fn phase_count(&self) -> usize {
        self.graph.len()
    }

    pub fn status(&self, phase_id: &str) -> Option<PhaseStatus> {
        self.graph
            .get_index(phase_id)
            .and_then(|i| self.statuses.get(i))
            .copied()
    }

    pub fn set_status(&mut self, phase_id: &str, status: PhaseStatus) -> bool {
        let Some(idx) = self.graph.get_index(phase_id) else {
            return false;
        };
        let current = self.statuses[idx];
        if !current.can_transition_to(status) {
            return false;
        }
        self.statuses[idx] = status;
        true
    }

    pub fn impact_of(&self, phase_id: &str) -> f64 {
        self.graph
            .get_index(phase_id)
            .and_then(|i| self.impact.get(i))
            .copied()
            .unwrap_or(0.0)
    }

    fn dependencies_done(&self, index: PhaseIndex) -> bool {
        self.graph
            .dependencies(index)
            .iter()
            .all(|&d| self.statuses[d] == PhaseStatus::Done)
    }

    /// Every phase whose status is `pending` and whose dependencies are all
    /// `done`, ordered by impact descending and ties broken by phase id.
    pub fn ready_tasks(&self) -> Vec<String> {
        let mut ready: Vec<(PhaseIndex, f64)> = (0..self.graph.len())
            .filter(|&i| self.statuses[i] == PhaseStatus::Pending && self.dependencies_done(i))
            .map(|i| (i, self.impact[i]))
            .collect();

        ready.sort_by(|(ia, sa), (ib, sb)| {
            sb.partial_cmp(sa)
                .unwrap_or(std::cmp::Ordering::Equal)
                .then_with(|| {
                    self.graph.get_phase(*ia).unwrap().id.cmp(&self.graph.get_phase(*ib).unwrap().id)
                })
        });

        ready
            .into_iter()
            .map(|(i, _)| self.graph.get_phase(i).unwrap().id.clone())
            .collect()
    }

    /// Phases whose sole unfulfilled dependency is in `review_complete`.
    /// At most one speculative candidate is emitted per dependency, and a
    /// phase already speculating on something is never itself eligible
    /// (no cascading speculation).
    pub fn speculative_eligible(&self) -> Vec<SpeculativeCandidate> {
        let mut seen_deps: HashSet<PhaseIndex> = HashSet::new();
        let mut out = Vec::new();

        for i in 0..self.graph.len() {
            if self.statuses[i] != PhaseStatus::Pending {
                continue;
            }
            let deps = self.graph.dependencies(i);
            let unfulfilled: Vec<PhaseIndex> = deps
                .iter()
                .copied()
                .filter(|&d| self.statuses[d] != PhaseStatus::Done)
                .collect();

            if unfulfilled.len() != 1 {
                continue;
            }
            let dep = unfulfilled[0];
            if self.statuses[dep] != PhaseStatus::ReviewComplete {
                continue;
            }
            if seen_deps.contains(&dep) {
                continue;
            }
            seen_deps.insert(dep);
            out.push(SpeculativeCandidate {
                phase_id: self.graph.get_phase(i).unwrap().id.clone(),
                speculates_on: self.graph.get_phase(dep).unwrap().id.clone(),
            });
        }

        out
    }

    /// Partition phases into independent tracks (connected components of
    /// the undirected dependency projection).
    pub fn tracks(&self) -> HashMap<String, Vec<String>> {
        let adjacency = self.graph.undirected_adjacency();
        let components = tracks::partition(&adjacency);

        components
            .into_iter()
            .map(|(root, members)| {
                let track_id = self.graph.get_phase(root).unwrap().id.clone();
                let ids = members
                    .into_iter()
                    .map(|i| self.graph.get_phase(i).unwrap().id.clone())
                    .collect();
                (track_id, ids)
            })
            .collect()
    }

    /// A valid execution order respecting every dependency edge, or a
    /// cycle error (unreachable in practice since `from_phases` already
    /// validates acyclicity, but kept as a standalone query per the spec).
    pub fn topological_sort(&self) -> Result<Vec<String>, ValidationError> {
        let n = self.graph.len();
        let mut in_degree: Vec<usize> = (0..n).map(|i| self.graph.dependencies(i).len()).collect();
        let mut queue: Vec<PhaseIndex> = in_degree
            .iter()
            .enumerate()
            .filter(|&(_, d)| *d == 0)
            .map(|(i, _)| i)
            .collect();
        queue.sort_by_key(|&i| self.graph.get_phase(i).unwrap().id.clone());

        let mut order = Vec::with_capacity(n);
        let mut cursor = 0;
        while cursor < queue.len() {
            let node = queue[cursor];
            cursor += 1;
            order.push(self.graph.get_phase(node).unwrap().id.clone());

            let mut newly_ready: Vec<PhaseIndex> = Vec::new();
            for &dependent in self.graph.dependents(node) {
                in_degree[dependent] -= 1;
                if in_degree[dependent] == 0 {
                    newly_ready.push(dependent);
                }
            }
            newly_ready.sort_by_key(|&i| self.graph.get_phase(i).unwrap().id.clone());
            queue.extend(newly_ready);
        }

        if order.len() != n {
            let cycle_phases: Vec<String> = in_degree
                .iter()
                .enumerate()
                .filter(|&(_, d)| *d > 0)
                .map(|(i, _)| self.graph.get_phase(i).unwrap().id.clone())
                .collect();
            return Err(ValidationError::Cycle {
                phases: cycle_phases,
            });
        }

        Ok(order)
    }

    pub fn all_terminal(&self) -> bool {
        self.statuses.iter().all(|s| s.is_terminal())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phase(id: &str, deps: &[&str]) -> Phase {
        Phase::new(
            id,
            &format!("Phase {id}"),
            "body",
            deps.iter().map(|s| s.to_string()).collect(),
        )
    }

    #[test]
    fn ready_tasks_only_include_phases_with_satisfied_dependencies() {
        let phases = vec![phase("01", &[]), phase("02", &["01"]), phase("03", &["01"])];
        let scheduler = DagScheduler::from_phases(&phases, DagConfig::default()).unwrap();
        assert_eq!(scheduler.ready_tasks(), vec!["01".to_string()]);
    }

    #[test]
    fn ready_tasks_unlock_after_dependency_done() {
        let phases = vec![phase("01", &[]), phase("02", &["01"]), phase("03", &["01"])];
        let mut scheduler = DagScheduler::from_phases(&phases, DagConfig::default()).unwrap();
        scheduler.set_status("01", PhaseStatus::Ready);
        scheduler.set_status("01", PhaseStatus::Scanning);
        scheduler.set_status("01", PhaseStatus::Running);
        scheduler.set_status("01", PhaseStatus::ReviewComplete);
        assert!(scheduler.set_status("01", PhaseStatus::Done));

        let mut ready = scheduler.ready_tasks();
        ready.sort();
        assert_eq!(ready, vec!["02".to_string(), "03".to_string()]);
    }

    #[test]
    fn ready_tasks_tie_broken_by_phase_id() {
        // Two independent roots with equal (zero) impact: id order wins.
        let phases = vec![phase("b", &[]), phase("a", &[])];
        let scheduler = DagScheduler::from_phases(&phases, DagConfig::default()).unwrap();
        assert_eq!(scheduler.ready_tasks(), vec!["a".to_string(), "b".to_string()]);
    }

    #[test]
    fn speculative_eligible_requires_sole_unfulfilled_dependency_in_review_complete() {
        let phases = vec![phase("01", &[]), phase("02", &["01"])];
        let mut scheduler = DagScheduler::from_phases(&phases, DagConfig::default()).unwrap();
        assert!(scheduler.speculative_eligible().is_empty());

        scheduler.set_status("01", PhaseStatus::Ready);
        scheduler.set_status("01", PhaseStatus::Scanning);
        scheduler.set_status("01", PhaseStatus::Running);
        scheduler.set_status("01", PhaseStatus::ReviewComplete);

        let candidates = scheduler.speculative_eligible();
        assert_eq!(candidates.len(), 1);
        assert_eq!(candidates[0].phase_id, "02");
        assert_eq!(candidates[0].speculates_on, "01");
    }

    #[test]
    fn speculative_eligible_excludes_phases_with_multiple_unfulfilled_deps() {
        let phases = vec![phase("01", &[]), phase("02", &[]), phase("03", &["01", "02"])];
        let mut scheduler = DagScheduler::from_phases(&phases, DagConfig::default()).unwrap();
        scheduler.set_status("01", PhaseStatus::Ready);
        scheduler.set_status("01", PhaseStatus::Scanning);
        scheduler.set_status("01", PhaseStatus::Running);
        scheduler.set_status("01", PhaseStatus::ReviewComplete);
        assert!(scheduler.speculative_eligible().is_empty());
    }

    #[test]
    fn tracks_partitions_disjoint_components() {
        let phases = vec![
            phase("01", &[]),
            phase("02", &["01"]),
            phase("03", &[]),
            phase("04", &["03"]),
        ];
        let scheduler = DagScheduler::from_phases(&phases, DagConfig::default()).unwrap();
        let tracks = scheduler.tracks();
        assert_eq!(tracks.len(), 2);
        for members in tracks.values() {
            assert_eq!(members.len(), 2);
        }
    }

    #[test]
    fn topological_sort_respects_edges() {
        let phases = vec![phase("01", &[]), phase("02", &["01"]), phase("03", &["02"])];
        let scheduler = DagScheduler::from_phases(&phases, DagConfig::default()).unwrap();
        let order = scheduler.topological_sort().unwrap();
        assert_eq!(order, vec!["01".to_string(), "02".to_string(), "03".to_string()]);
    }

    #[test]
    fn impact_of_unknown_phase_is_zero() {
        let phases = vec![phase("01", &[])];
        let scheduler = DagScheduler::from_phases(&phases, DagConfig::default()).unwrap();
        assert_eq!(scheduler.impact_of("nonexistent"), 0.0);
    }

    #[test]
    fn set_status_rejects_invalid_transitions() {
        let phases = vec![phase("01", &[])];
        let mut scheduler = DagScheduler::from_phases(&phases, DagConfig::default()).unwrap();
        assert!(!scheduler.set_status("01", PhaseStatus::Done));
        assert_eq!(scheduler.status("01"), Some(PhaseStatus::Pending));
    }
}
