//! Phase and Nebula data model.
//!
//! A `Nebula` is a declared DAG of `Phase`s plus an `Execution` block. Phase
//! identity is a stable string id; everything else about a phase (status,
//! dependency set, prompt overrides) is data, not type state, so the
//! scheduler and worker group can hold phases in ordinary collections.

use serde::{Deserialize, Serialize};
use std::collections::HashSet;

/// Mutable lifecycle status of a phase within a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum PhaseStatus {
    Pending,
    Ready,
    Scanning,
    Running,
    /// Reviewer has returned but the cycle is not yet sealed; the only
    /// window in which a dependent may be dispatched speculatively.
    ReviewComplete,
    Speculative,
    Blocked,
    Done,
    Failed,
}

impl PhaseStatus {
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Done | Self::Failed)
    }

    /// Valid forward transitions, plus the two speculative exceptions:
    /// `speculative -> running` on confirm (the dependency it was betting
    /// on approved), and `speculative -> pending` on discard (the
    /// dependency failed or was rejected; the phase goes back on the
    /// dispatch queue for a real re-attempt once its true dependencies are
    /// met). Any other backward transition is rejected.
    pub fn can_transition_to(&self, next: PhaseStatus) -> bool {
        use PhaseStatus::*;
        match (*self, next) {
            (Pending, Ready)
            | (Ready, Scanning)
            | (Scanning, Running)
            | (Scanning, Blocked)
            | (Blocked, Scanning)
            | (Running, ReviewComplete)
            | (ReviewComplete, Done)
            | (ReviewComplete, Failed)
            | (Running, Failed)
            | (Speculative, Running)
            | (Speculative, Pending) => true,
            (a, b) if a == b => true,
            _ => false,
        }
    }
}

/// Optional per-phase overrides of the nebula's defaults.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PhaseOverrides {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_review_cycles: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub max_budget_usd: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub model: Option<String>,
}

/// One unit of agentic work within a nebula.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Phase {
    pub id: String,
    pub title: String,
    #[serde(default)]
    pub depends_on: Vec<String>,
    pub body: String,
    #[serde(default)]
    pub overrides: PhaseOverrides,
    #[serde(default = "default_status", skip_serializing_if = "is_default_status")]
    pub status: PhaseStatus,
}

fn default_status() -> PhaseStatus {
    PhaseStatus::Pending
}

fn is_default_status(s: &PhaseStatus) -> bool {
    matches!(s, PhaseStatus::Pending)
}

impl Phase {
    pub fn new(id: &str, title: &str, body: &str, depends_on: Vec<String>) -> Self {
        Self {
            id: id.to_string(),
            title: title.to_string(),
            depends_on,
            body: body.to_string(),
            overrides: PhaseOverrides::default(),
            status: PhaseStatus::Pending,
        }
    }

    pub fn with_max_review_cycles(mut self, n: u32) -> Self {
        self.overrides.max_review_cycles = Some(n);
        self
    }

    pub fn with_max_budget_usd(mut self, v: f64) -> Self {
        self.overrides.max_budget_usd = Some(v);
        self
    }

    pub fn with_model(mut self, model: &str) -> Self {
        self.overrides.model = Some(model.to_string());
        self
    }

    pub fn max_review_cycles(&self, default: u32) -> u32 {
        self.overrides.max_review_cycles.unwrap_or(default)
    }

    pub fn max_budget_usd(&self, default: f64) -> f64 {
        self.overrides.max_budget_usd.unwrap_or(default)
    }

    pub fn model<'a>(&'a self, default: &'a str) -> &'a str {
        self.overrides.model.as_deref().unwrap_or(default)
    }
}

/// Human-in-the-loop gating mode for a run.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GateMode {
    /// Dispatch continues without operator confirmation between waves.
    Auto,
    /// The run pauses for operator acknowledgement at configured points.
    Watch,
}

/// Email/notification flags for a run, named `agentmail` in the domain
/// vocabulary this crate inherited; kept as booleans rather than a richer
/// config object because the spec defines no further structure for it.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AgentMailFlags {
    #[serde(default)]
    pub on_hail: bool,
    #[serde(default)]
    pub on_completion: bool,
}

/// Execution configuration for a nebula run.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Execution {
    #[serde(default = "default_max_workers")]
    pub max_workers: usize,
    #[serde(default = "default_gate")]
    pub gate: GateMode,
    #[serde(default)]
    pub speculative: bool,
    #[serde(default)]
    pub agentmail: AgentMailFlags,
    #[serde(default = "default_max_review_cycles")]
    pub default_max_review_cycles: u32,
    #[serde(default)]
    pub default_max_budget_usd: f64,
}

fn default_max_workers() -> usize {
    1
}

fn default_gate() -> GateMode {
    GateMode::Auto
}

fn default_max_review_cycles() -> u32 {
    3
}

impl Default for Execution {
    fn default() -> Self {
        Self {
            max_workers: default_max_workers(),
            gate: default_gate(),
            speculative: false,
            agentmail: AgentMailFlags::default(),
            default_max_review_cycles: default_max_review_cycles(),
            default_max_budget_usd: 0.0,
        }
    }
}

/// An ordered set of phases plus run-level execution configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Nebula {
    pub phases: Vec<Phase>,
    #[serde(default)]
    pub execution: Execution,
}

impl Nebula {
    pub fn new(phases: Vec<Phase>, execution: Execution) -> Self {
        Self { phases, execution }
    }

    /// Validate that dependency ids exist and the dependency graph has no
    /// cycles. This does not build the scheduling graph (see `dag`); it is
    /// the cheap structural check performed at load time.
    pub fn validate(&self) -> anyhow::Result<()> {
        use crate::errors::ValidationError;

        let ids: HashSet<&str> = self.phases.iter().map(|p| p.id.as_str()).collect();
        if ids.len() != self.phases.len() {
            let mut seen = HashSet::new();
            for p in &self.phases {
                if !seen.insert(p.id.as_str()) {
                    return Err(ValidationError::DuplicatePhase(p.id.clone()).into());
                }
            }
        }

        for phase in &self.phases {
            for dep in &phase.depends_on {
                if !ids.contains(dep.as_str()) {
                    return Err(ValidationError::UnknownDependency {
                        phase: phase.id.clone(),
                        dependency: dep.clone(),
                    }
                    .into());
                }
            }
        }

        crate::dag::DagBuilder::new(self.phases.clone())
            .build()
            .map(|_| ())
    }

    pub fn phase(&self, id: &str) -> Option<&Phase> {
        self.phases.iter().find(|p| p.id == id)
    }

    pub fn phase_mut(&mut self, id: &str) -> Option<&mut Phase> {
        self.phases.iter_mut().find(|p| p.id == id)
    }
}
