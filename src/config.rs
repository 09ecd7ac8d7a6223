//! Nebula file loading: YAML or TOML, detected by extension, with CLI-flag
//! overrides layered on top.

use crate::phase::{Execution, GateMode, Nebula};
use std::path::Path;

/// CLI-supplied overrides of the loaded nebula's `Execution` block. `None`
/// fields leave the file's value untouched.
#[derive(Debug, Clone, Default)]
pub struct ExecutionOverrides {
    pub max_workers: Option<usize>,
    pub gate: Option<GateMode>,
    pub speculative: Option<bool>,
}

impl ExecutionOverrides {
    pub fn apply(&self, execution: &mut Execution) {
        if let Some(max_workers) = self.max_workers {
            execution.max_workers = max_workers;
        }
        if let Some(gate) = self.gate {
            execution.gate = gate;
        }
        if let Some(speculative) = self.speculative {
            execution.speculative = speculative;
        }
    }
}

/// Load a nebula file, applying any CLI overrides, then validate the
/// resulting dependency graph.
pub fn load_nebula(path: &Path, overrides: &ExecutionOverrides) -> anyhow::Result<Nebula> {
    let raw = std::fs::read_to_string(path).map_err(|source| {
        crate::errors::QuasarError::WorkDirResolution {
            path: path.to_path_buf(),
            source,
        }
    })?;

    let mut nebula = parse_nebula(path, &raw)?;
    overrides.apply(&mut nebula.execution);
    nebula.validate()?;
    Ok(nebula)
}

fn parse_nebula(path: &Path, raw: &str) -> anyhow::Result<Nebula> {
    match path.extension().and_then(|e| e.to_str()) {
        Some("yaml") | Some("yml") => Ok(serde_yaml::from_str(raw)?),
        Some("toml") => Ok(toml::from_str(raw)?),
        other => anyhow::bail!(
            "unrecognized nebula file extension {:?}; expected .yaml, .yml, or .toml",
            other
        ),
    }
}
