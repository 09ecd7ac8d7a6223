//! DAG and scheduler: topological readiness, track partitioning, and impact
//! scoring over a nebula's phase dependency graph.
//!
//! ```
//! use quasar::dag::{DagConfig, DagScheduler};
//! use quasar::phase::Phase;
//!
//! let phases = vec![
//!     Phase::new("01", "Setup", "set up the project", vec![]),
//!     Phase::new("02", "Core", "implement the core", vec!["01".to_string()]),
//! ];
//!
//! let scheduler = DagScheduler::from_phases(&phases, DagConfig::default()).unwrap();
//! assert_eq!(scheduler.ready_tasks(), vec!["01".to_string()]);
//! ```

mod builder;
mod impact;
mod scheduler;
mod tracks;

pub use builder::{DagBuilder, PhaseGraph, PhaseIndex};
pub use scheduler::{DagConfig, DagScheduler, SpeculativeCandidate};

#[cfg(test)]
mod tests {
    use super::*;
    use crate::phase::Phase;

    fn create_test_phases() -> Vec<Phase> {
        vec![
            Phase::new("01", "Setup", "set up", vec![]),
            Phase::new("02", "Core A", "core a", vec!["01".to_string()]),
            Phase::new("03", "Core B", "core b", vec!["01".to_string()]),
            Phase::new(
                "04",
                "Integration",
                "integrate",
                vec!["02".to_string(), "03".to_string()],
            ),
        ]
    }

    #[test]
    fn dag_construction_counts_phases() {
        let phases = create_test_phases();
        let scheduler = DagScheduler::from_phases(&phases, DagConfig::default()).unwrap();
        assert_eq!(scheduler.phase_count(), 4);
    }

    #[test]
    fn cycle_detection_is_fatal_at_construction() {
        let phases = vec![
            Phase::new("01", "A", "a", vec!["03".to_string()]),
            Phase::new("02", "B", "b", vec!["01".to_string()]),
            Phase::new("03", "C", "c", vec!["02".to_string()]),
        ];

        let result = DagScheduler::from_phases(&phases, DagConfig::default());
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.to_lowercase().contains("cycle"));
    }

    #[test]
    fn missing_dependency_is_fatal_at_construction() {
        let phases = vec![Phase::new("01", "A", "a", vec!["nonexistent".to_string()])];
        let result = DagScheduler::from_phases(&phases, DagConfig::default());
        assert!(result.is_err());
        let err = result.unwrap_err().to_string();
        assert!(err.contains("nonexistent"));
    }
}
