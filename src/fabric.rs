//! The coordination fabric: the shared, process-wide store consumed by both
//! the WorkerGroup and the PhaseLoop. Phase state, entanglements, file
//! claims, discoveries, and pulses are all append-only within an epoch; the
//! shipped backend is in-process and in-memory, matching the contract's
//! statement that durable backing is unspecified here.

use crate::errors::{QuasarError, ValidationError};
use crate::phase::PhaseStatus;
use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::sync::Mutex;

/// Kind of symbol an entanglement exports.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntanglementKind {
    Interface,
    Function,
    Method,
    Type,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EntanglementStatus {
    Pending,
    Fulfilled,
    Disputed,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Entanglement {
    pub producer: String,
    pub kind: EntanglementKind,
    pub name: String,
    pub signature: String,
    pub package: String,
    pub status: EntanglementStatus,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

impl Entanglement {
    fn dedup_key(&self) -> (String, EntanglementKind, String, String) {
        (
            self.producer.clone(),
            self.kind,
            self.name.clone(),
            self.signature.clone(),
        )
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DiscoveryKind {
    EntanglementDispute,
    MissingDependency,
    FileConflict,
    RequirementsAmbiguity,
    BudgetAlert,
}

impl DiscoveryKind {
    /// Every kind except `budget_alert` qualifies as a hail source.
    pub fn qualifies_as_hail(&self) -> bool {
        !matches!(self, Self::BudgetAlert)
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Discovery {
    pub id: i64,
    pub source_task: String,
    pub kind: DiscoveryKind,
    pub detail: String,
    pub affects: Option<String>,
    pub resolved: bool,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Pulse {
    pub task_id: String,
    pub text: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Error returned by `claim_file` when the path already has an owner.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AlreadyClaimed {
    pub owner: String,
}

#[derive(Default)]
struct FabricState {
    phase_states: HashMap<String, PhaseStatus>,
    entanglements: Vec<Entanglement>,
    claims: HashMap<String, String>,
    discoveries: Vec<Discovery>,
    next_discovery_id: i64,
    pulses: Vec<Pulse>,
    closed: bool,
}

/// The coordination fabric's capability set. All operations are safe under
/// concurrent invocation; writes are serialized by the backend, reads
/// observe a consistent point-in-time snapshot.
#[async_trait]
pub trait Fabric: Send + Sync {
    async fn set_phase_state(&self, phase: &str, state: PhaseStatus) -> Result<(), QuasarError>;
    async fn get_phase_state(&self, phase: &str) -> Option<PhaseStatus>;
    async fn all_phase_states(&self) -> HashMap<String, PhaseStatus>;

    async fn publish_entanglement(&self, entanglement: Entanglement);
    async fn publish_entanglements(&self, entanglements: Vec<Entanglement>) {
        for e in entanglements {
            self.publish_entanglement(e).await;
        }
    }
    async fn entanglements_for(&self, producer: &str) -> Vec<Entanglement>;
    async fn all_entanglements(&self) -> Vec<Entanglement>;

    async fn claim_file(&self, path: &str, task_id: &str) -> Result<(), AlreadyClaimed>;
    async fn release_claims(&self, task_id: &str);
    async fn release_file_claim(&self, path: &str, task_id: &str) -> Result<(), QuasarError>;
    async fn file_owner(&self, path: &str) -> Option<String>;
    async fn claims_for(&self, task_id: &str) -> Vec<String>;
    async fn all_claims(&self) -> HashMap<String, String>;

    async fn post_discovery(&self, discovery: NewDiscovery) -> i64;
    async fn discoveries(&self, source_task: &str) -> Vec<Discovery>;
    async fn all_discoveries(&self) -> Vec<Discovery>;
    async fn unresolved_discoveries(&self) -> Vec<Discovery>;
    async fn resolve_discovery(&self, id: i64) -> Result<(), QuasarError>;

    async fn emit_pulse(&self, task_id: &str, text: &str);
    async fn pulses_for(&self, task_id: &str) -> Vec<Pulse>;
    async fn all_pulses(&self) -> Vec<Pulse>;

    async fn purge_all(&self);
    async fn close(&self) -> Result<(), QuasarError>;
}

/// Caller-supplied discovery fields; `id` and `created_at` are assigned by
/// the fabric.
#[derive(Debug, Clone)]
pub struct NewDiscovery {
    pub source_task: String,
    pub kind: DiscoveryKind,
    pub detail: String,
    pub affects: Option<String>,
}

/// In-process, in-memory fabric backend.
pub struct InMemoryFabric {
    state: Mutex<FabricState>,
}

impl InMemoryFabric {
    pub fn new() -> Self {
        Self {
            state: Mutex::new(FabricState::default()),
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, FabricState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }
}

impl Default for InMemoryFabric {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl Fabric for InMemoryFabric {
    async fn set_phase_state(&self, phase: &str, next: PhaseStatus) -> Result<(), QuasarError> {
        let mut state = self.lock();
        let current = state.phase_states.get(phase).copied();
        if let Some(current) = current
            && !current.can_transition_to(next)
        {
            return Err(ValidationError::InvalidTransition {
                phase: phase.to_string(),
                from: format!("{current:?}"),
                to: format!("{next:?}"),
            }
            .into());
        }
        state.phase_states.insert(phase.to_string(), next);
        Ok(())
    }

    async fn get_phase_state(&self, phase: &str) -> Option<PhaseStatus> {
        self.lock().phase_states.get(phase).copied()
    }

    async fn all_phase_states(&self) -> HashMap<String, PhaseStatus> {
        self.lock().phase_states.clone()
    }

    async fn publish_entanglement(&self, entanglement: Entanglement) {
        let mut state = self.lock();
        let key = entanglement.dedup_key();
        if state.entanglements.iter().any(|e| e.dedup_key() == key) {
            return;
        }
        state.entanglements.push(entanglement);
    }

    async fn entanglements_for(&self, producer: &str) -> Vec<Entanglement> {
        self.lock()
            .entanglements
            .iter()
            .filter(|e| e.producer == producer)
            .cloned()
            .collect()
    }

    async fn all_entanglements(&self) -> Vec<Entanglement> {
        self.lock().entanglements.clone()
    }

    async fn claim_file(&self, path: &str, task_id: &str) -> Result<(), AlreadyClaimed> {
        let mut state = self.lock();
        if let Some(owner) = state.claims.get(path) {
            if owner == task_id {
                return Ok(());
            }
            return Err(AlreadyClaimed {
                owner: owner.clone(),
            });
        }
        state.claims.insert(path.to_string(), task_id.to_string());
        Ok(())
    }

    async fn release_claims(&self, task_id: &str) {
        self.lock().claims.retain(|_, owner| owner != task_id);
    }

    async fn release_file_claim(&self, path: &str, task_id: &str) -> Result<(), QuasarError> {
        let mut state = self.lock();
        match state.claims.get(path) {
            Some(owner) if owner == task_id => {
                state.claims.remove(path);
                Ok(())
            }
            Some(owner) => Err(crate::errors::SentinelError::ErrFileAlreadyClaimed {
                owner: owner.clone(),
            }
            .into()),
            None => Ok(()),
        }
    }

    async fn file_owner(&self, path: &str) -> Option<String> {
        self.lock().claims.get(path).cloned()
    }

    async fn claims_for(&self, task_id: &str) -> Vec<String> {
        self.lock()
            .claims
            .iter()
            .filter(|(_, owner)| owner.as_str() == task_id)
            .map(|(path, _)| path.clone())
            .collect()
    }

    async fn all_claims(&self) -> HashMap<String, String> {
        self.lock().claims.clone()
    }

    async fn post_discovery(&self, discovery: NewDiscovery) -> i64 {
        let mut state = self.lock();
        let id = state.next_discovery_id;
        state.next_discovery_id += 1;
        state.discoveries.push(Discovery {
            id,
            source_task: discovery.source_task,
            kind: discovery.kind,
            detail: discovery.detail,
            affects: discovery.affects,
            resolved: false,
            created_at: chrono::Utc::now(),
        });
        id
    }

    async fn discoveries(&self, source_task: &str) -> Vec<Discovery> {
        self.lock()
            .discoveries
            .iter()
            .filter(|d| d.source_task == source_task)
            .cloned()
            .collect()
    }

    async fn all_discoveries(&self) -> Vec<Discovery> {
        self.lock().discoveries.clone()
    }

    async fn unresolved_discoveries(&self) -> Vec<Discovery> {
        self.lock()
            .discoveries
            .iter()
            .filter(|d| !d.resolved)
            .cloned()
            .collect()
    }

    async fn resolve_discovery(&self, id: i64) -> Result<(), QuasarError> {
        let mut state = self.lock();
        match state.discoveries.iter_mut().find(|d| d.id == id) {
            Some(d) => {
                d.resolved = true;
                Ok(())
            }
            None => Err(anyhow::anyhow!("unknown discovery id {id}").into()),
        }
    }

    async fn emit_pulse(&self, task_id: &str, text: &str) {
        self.lock().pulses.push(Pulse {
            task_id: task_id.to_string(),
            text: text.to_string(),
            created_at: chrono::Utc::now(),
        });
    }

    async fn pulses_for(&self, task_id: &str) -> Vec<Pulse> {
        self.lock()
            .pulses
            .iter()
            .filter(|p| p.task_id == task_id)
            .cloned()
            .collect()
    }

    async fn all_pulses(&self) -> Vec<Pulse> {
        self.lock().pulses.clone()
    }

    async fn purge_all(&self) {
        let mut state = self.lock();
        *state = FabricState::default();
    }

    async fn close(&self) -> Result<(), QuasarError> {
        self.lock().closed = true;
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn discovery(kind: DiscoveryKind) -> NewDiscovery {
        NewDiscovery {
            source_task: "01".into(),
            kind,
            detail: "detail".into(),
            affects: None,
        }
    }

    #[tokio::test]
    async fn phase_state_transitions_follow_the_documented_lattice() {
        let fabric = InMemoryFabric::new();
        fabric.set_phase_state("01", PhaseStatus::Pending).await.unwrap();
        fabric.set_phase_state("01", PhaseStatus::Ready).await.unwrap();
        fabric.set_phase_state("01", PhaseStatus::Scanning).await.unwrap();
        fabric.set_phase_state("01", PhaseStatus::Running).await.unwrap();
        assert!(fabric.set_phase_state("01", PhaseStatus::Pending).await.is_err());
    }

    #[tokio::test]
    async fn speculative_confirm_and_discard_are_the_only_backward_transitions() {
        let fabric = InMemoryFabric::new();
        fabric
            .set_phase_state("01", PhaseStatus::Speculative)
            .await
            .unwrap();
        fabric.set_phase_state("01", PhaseStatus::Running).await.unwrap();

        let fabric2 = InMemoryFabric::new();
        fabric2
            .set_phase_state("02", PhaseStatus::Speculative)
            .await
            .unwrap();
        fabric2.set_phase_state("02", PhaseStatus::Pending).await.unwrap();
    }

    #[tokio::test]
    async fn file_claim_is_exclusive_until_released() {
        let fabric = InMemoryFabric::new();
        fabric.claim_file("src/x.rs", "t1").await.unwrap();
        let err = fabric.claim_file("src/x.rs", "t2").await.unwrap_err();
        assert_eq!(err.owner, "t1");

        fabric.release_file_claim("src/x.rs", "t1").await.unwrap();
        fabric.claim_file("src/x.rs", "t2").await.unwrap();
    }

    #[tokio::test]
    async fn release_file_claim_errors_when_not_owner() {
        let fabric = InMemoryFabric::new();
        fabric.claim_file("src/x.rs", "t1").await.unwrap();
        let err = fabric.release_file_claim("src/x.rs", "t2").await.unwrap_err();
        assert!(matches!(
            err,
            QuasarError::Sentinel(crate::errors::SentinelError::ErrFileAlreadyClaimed { .. })
        ));
    }

    #[tokio::test]
    async fn release_claims_releases_every_path_for_a_task() {
        let fabric = InMemoryFabric::new();
        fabric.claim_file("a.rs", "t1").await.unwrap();
        fabric.claim_file("b.rs", "t1").await.unwrap();
        fabric.release_claims("t1").await;
        assert!(fabric.claims_for("t1").await.is_empty());
        fabric.claim_file("a.rs", "t2").await.unwrap();
    }

    #[tokio::test]
    async fn entanglements_dedup_by_producer_kind_name_signature() {
        let fabric = InMemoryFabric::new();
        let e = Entanglement {
            producer: "01".into(),
            kind: EntanglementKind::Function,
            name: "Foo".into(),
            signature: "fn foo()".into(),
            package: "pkg".into(),
            status: EntanglementStatus::Pending,
            created_at: chrono::Utc::now(),
        };
        fabric.publish_entanglement(e.clone()).await;
        fabric.publish_entanglement(e).await;
        assert_eq!(fabric.all_entanglements().await.len(), 1);
    }

    #[tokio::test]
    async fn non_budget_alert_discoveries_qualify_as_hails() {
        assert!(DiscoveryKind::MissingDependency.qualifies_as_hail());
        assert!(DiscoveryKind::FileConflict.qualifies_as_hail());
        assert!(!DiscoveryKind::BudgetAlert.qualifies_as_hail());
    }

    #[tokio::test]
    async fn unresolved_discoveries_excludes_resolved() {
        let fabric = InMemoryFabric::new();
        let id = fabric.post_discovery(discovery(DiscoveryKind::FileConflict)).await;
        assert_eq!(fabric.unresolved_discoveries().await.len(), 1);
        fabric.resolve_discovery(id).await.unwrap();
        assert!(fabric.unresolved_discoveries().await.is_empty());
    }

    #[tokio::test]
    async fn pulses_are_append_only_and_scoped_per_task() {
        let fabric = InMemoryFabric::new();
        fabric.emit_pulse("01", "note one").await;
        fabric.emit_pulse("02", "note two").await;
        assert_eq!(fabric.pulses_for("01").await.len(), 1);
        assert_eq!(fabric.all_pulses().await.len(), 2);
    }

    #[tokio::test]
    async fn purge_all_resets_every_collection() {
        let fabric = InMemoryFabric::new();
        fabric.claim_file("a.rs", "t1").await.unwrap();
        fabric.emit_pulse("t1", "hi").await;
        fabric.purge_all().await;
        assert!(fabric.all_claims().await.is_empty());
        assert!(fabric.all_pulses().await.is_empty());
    }
}
