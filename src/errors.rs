//! Error taxonomy for Quasar.
//!
//! Mirrors the five-tier classification the orchestrator reasons about:
//! validation errors, expected terminal outcomes (sentinels), transient
//! invocation errors, non-fatal auxiliary errors, and fatal system errors.
//! Sentinels are matched by variant identity, never by message text.

use std::path::PathBuf;
use thiserror::Error;

/// Errors raised while validating a nebula's structure or a fabric state
/// transition. All are fatal to the caller that requested the validation.
#[derive(Debug, Error)]
pub enum ValidationError {
    #[error("dependency cycle detected; involved phases: {phases:?}")]
    Cycle { phases: Vec<String> },

    #[error("phase '{phase}' depends on unknown phase '{dependency}'")]
    UnknownDependency { phase: String, dependency: String },

    #[error("duplicate phase id: {0}")]
    DuplicatePhase(String),

    #[error("unknown hail kind: {0}")]
    UnknownHailKind(String),

    #[error("unknown discovery kind: {0}")]
    UnknownDiscoveryKind(String),

    #[error("invalid phase state transition for '{phase}': {from} -> {to}")]
    InvalidTransition {
        phase: String,
        from: String,
        to: String,
    },
}

/// Expected terminal outcomes of a phase loop. These are not failures in
/// the operational sense; callers distinguish them from fatal errors by
/// matching the variant, not the message.
#[derive(Debug, Error, Clone, PartialEq, Eq)]
pub enum SentinelError {
    #[error("phase exceeded its maximum review cycles")]
    ErrMaxCycles,

    #[error("phase exceeded its maximum budget")]
    ErrBudgetExceeded,

    #[error("run stopped by operator intervention")]
    ErrManualStop,

    #[error("file already claimed by {owner}")]
    ErrFileAlreadyClaimed { owner: String },
}

/// Transient failures invoking an external collaborator (coder/reviewer
/// agent). Fatal to the current cycle; the WorkerGroup may retry the phase.
#[derive(Debug, Error)]
pub enum InvocationError {
    #[error("failed to invoke agent: {0}")]
    AgentFailed(String),

    #[error("agent invocation timed out after {0}ms")]
    Timeout(u64),

    #[error("failed to spawn process: {0}")]
    Spawn(#[source] std::io::Error),
}

/// Top-level error type threaded through the crate's public `Result`s.
#[derive(Debug, Error)]
pub enum QuasarError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Sentinel(#[from] SentinelError),

    #[error(transparent)]
    Invocation(#[from] InvocationError),

    #[error("fabric could not be opened or closed: {0}")]
    FabricLifecycle(String),

    #[error("failed to resolve working directory {path:?}: {source}")]
    WorkDirResolution {
        path: PathBuf,
        #[source]
        source: std::io::Error,
    },

    #[error(transparent)]
    Other(#[from] anyhow::Error),
}

impl QuasarError {
    /// True for the four identity-comparable expected-terminal outcomes.
    pub fn as_sentinel(&self) -> Option<&SentinelError> {
        match self {
            Self::Sentinel(s) => Some(s),
            _ => None,
        }
    }

    pub fn is_fatal(&self) -> bool {
        !matches!(self, Self::Sentinel(_))
    }
}
