//! The per-phase coder/reviewer loop: drives one phase through cycles of
//! code, lint-fix, and review until the reviewer approves or a cycle/budget
//! cap is hit.

use crate::collaborators::{AgentInvoker, BeadClient, CycleCommitter, Linter};
use crate::errors::{QuasarError, SentinelError};
use crate::fabric::{DiscoveryKind, Fabric};
use crate::hail::{format_relay_block, HailKind, HailQueue, NewHail, SourceRole};
use crate::review::findings::{
    apply_lifecycle, jaccard_similarity, parse_review_output, FindingStatus, ReviewFinding,
    ReviewReport, Severity,
};
use std::collections::HashSet;
use std::path::PathBuf;
use std::sync::{Arc, Mutex};
use tokio::sync::watch;

const DEFAULT_MAX_LINT_RETRIES: u32 = 2;
const DEFAULT_MIN_CYCLES_BEFORE_CHECK: u32 = 2;
const DEFAULT_STRUGGLE_THRESHOLD: f64 = 0.6;
const REVIEWER_OUTPUT_TRUNCATE: usize = 3000;
const MAX_FINDINGS_IN_HAIL: usize = 10;
const JACCARD_OVERLAP_THRESHOLD: f64 = 0.8;
const FILTER_REPEAT_NORMALIZER: usize = 3;

/// Mid-run update to a phase's task description. The latest value wins; a
/// non-blocking drain at the start of each cycle (after cycle 1) picks up
/// at most the most recent update.
#[derive(Debug, Clone)]
pub struct RefactorUpdate {
    pub new_description: String,
}

#[derive(Debug, Clone)]
pub struct PhaseLoopConfig {
    pub phase_id: String,
    pub task_title: String,
    pub task_description: String,
    pub max_cycles: u32,
    pub max_budget_usd: f64,
    pub model: String,
    pub max_lint_retries: u32,
    pub min_cycles_before_check: u32,
    pub struggle_threshold: f64,
}

impl PhaseLoopConfig {
    pub fn new(phase_id: &str, task_title: &str, task_description: &str) -> Self {
        Self {
            phase_id: phase_id.to_string(),
            task_title: task_title.to_string(),
            task_description: task_description.to_string(),
            max_cycles: 3,
            max_budget_usd: 0.0,
            model: "default".to_string(),
            max_lint_retries: DEFAULT_MAX_LINT_RETRIES,
            min_cycles_before_check: DEFAULT_MIN_CYCLES_BEFORE_CHECK,
            struggle_threshold: DEFAULT_STRUGGLE_THRESHOLD,
        }
    }

    /// `MaxBudgetUSD / (2 * MaxCycles)`, or unbounded (`f64::INFINITY`) when
    /// no budget is configured.
    pub fn per_agent_budget(&self) -> f64 {
        if self.max_budget_usd > 0.0 && self.max_cycles > 0 {
            self.max_budget_usd / (2.0 * self.max_cycles as f64)
        } else {
            f64::INFINITY
        }
    }
}

/// Advisory struggle signal; surfaced but never alters control flow.
#[derive(Debug, Clone)]
pub struct StruggleSignal {
    pub triggered: bool,
    pub score: f64,
    pub reason: String,
}

#[derive(Debug, Clone, Default)]
struct CycleState {
    cycle: u32,
    total_cost_usd: f64,
    all_findings: Vec<ReviewFinding>,
    cycle_commits: Vec<String>,
    last_cycle_sha: Option<String>,
    base_commit_sha: Option<String>,
    filter_history: Vec<String>,
    task_title: String,
    original_description: Option<String>,
    refactor_description: Option<String>,
    refactored: bool,
    parent_bead_id: String,
    /// Finding id -> the child bead opened for it, so a later `Fixed`
    /// verification knows which bead to close.
    child_bead_ids: std::collections::HashMap<String, String>,
}

#[derive(Debug, Clone)]
pub struct PhaseLoopOutcome {
    pub cycles_used: u32,
    pub total_cost_usd: f64,
    pub all_findings: Vec<ReviewFinding>,
    pub cycle_commits: Vec<String>,
    pub final_report: Option<ReviewReport>,
}

/// Drives one phase to completion by orchestrating the coder, reviewer,
/// linter, committer, bead client, fabric, and hail queue collaborators.
pub struct PhaseLoop {
    config: PhaseLoopConfig,
    coder: Arc<dyn AgentInvoker>,
    reviewer: Arc<dyn AgentInvoker>,
    linter: Arc<dyn Linter>,
    committer: Option<Arc<dyn CycleCommitter>>,
    bead_client: Arc<dyn BeadClient>,
    fabric: Arc<dyn Fabric>,
    hails: Arc<HailQueue>,
    project_dir: PathBuf,
    refactor_rx: Mutex<watch::Receiver<Option<RefactorUpdate>>>,
    bridged_discoveries: Mutex<HashSet<i64>>,
}

impl PhaseLoop {
    #[allow(clippy::too_many_arguments)]
    pub fn new(
        config: PhaseLoopConfig,
        coder: Arc<dyn AgentInvoker>,
        reviewer: Arc<dyn AgentInvoker>,
        linter: Arc<dyn Linter>,
        committer: Option<Arc<dyn CycleCommitter>>,
        bead_client: Arc<dyn BeadClient>,
        fabric: Arc<dyn Fabric>,
        hails: Arc<HailQueue>,
        project_dir: PathBuf,
        refactor_rx: watch::Receiver<Option<RefactorUpdate>>,
    ) -> Self {
        Self {
            config,
            coder,
            reviewer,
            linter,
            committer,
            bead_client,
            fabric,
            hails,
            project_dir,
            refactor_rx: Mutex::new(refactor_rx),
            bridged_discoveries: Mutex::new(HashSet::new()),
        }
    }

    fn check_budget(&self, state: &CycleState) -> Result<(), QuasarError> {
        if self.config.max_budget_usd > 0.0 && state.total_cost_usd >= self.config.max_budget_usd {
            return Err(SentinelError::ErrBudgetExceeded.into());
        }
        Ok(())
    }

    /// Non-blocking drain of the refactor channel; the latest value wins.
    fn drain_refactor(&self, state: &mut CycleState) {
        let mut rx = self.refactor_rx.lock().unwrap_or_else(|e| e.into_inner());
        if rx.has_changed().unwrap_or(false) {
            if let Some(update) = rx.borrow_and_update().clone() {
                state.original_description = Some(state.task_title.clone());
                state.refactor_description = Some(update.new_description.clone());
                state.task_title = update.new_description;
                state.refactored = true;
            }
        }
    }

    async fn relay_block(&self) -> Option<String> {
        self.hails.sweep_expired();
        let resolved = self.hails.unrelayed_resolved();
        if resolved.is_empty() {
            return None;
        }
        let ids: Vec<u64> = resolved.iter().map(|h| h.id).collect();
        let block = format_relay_block(&resolved);
        if let Err(err) = self.hails.mark_relayed(&ids) {
            tracing::warn!(phase = %self.config.phase_id, error = %err, "failed to mark hails relayed");
        }
        block
    }

    fn build_coder_prompt(&self, state: &CycleState, relay: Option<&str>) -> String {
        let mut prompt = String::new();
        if let Some(relay) = relay {
            prompt.push_str(relay);
            prompt.push('\n');
        }
        if state.refactored {
            prompt.push_str("[REFACTOR]\n");
            if let Some(original) = &state.original_description {
                prompt.push_str(&format!("original description: {original}\n"));
            }
            if let Some(updated) = &state.refactor_description {
                prompt.push_str(&format!("updated description: {updated}\n"));
            }
        }

        if state.cycle == 1 {
            prompt.push_str(&format!(
                "task: {}\ndescription: {}\n",
                state.task_title, self.config.task_description
            ));
        } else {
            prompt.push_str(&format!("task: {}\nprevious findings:\n", state.task_title));
            for (i, finding) in state
                .all_findings
                .iter()
                .filter(|f| f.status != FindingStatus::Fixed)
                .enumerate()
            {
                prompt.push_str(&format!(
                    "{}. [{:?}] {}\n",
                    i + 1,
                    finding.severity,
                    finding.description
                ));
            }
        }
        prompt
    }

    fn build_reviewer_prompt(
        &self,
        state: &CycleState,
        coder_output: &str,
        lint_output: &str,
        relay: Option<&str>,
    ) -> String {
        let truncated: String = coder_output.chars().take(REVIEWER_OUTPUT_TRUNCATE).collect();
        let mut prompt = String::new();
        if let Some(relay) = relay {
            prompt.push_str(relay);
            prompt.push('\n');
        }
        prompt.push_str(&format!(
            "task: {}\ncoder output:\n{}\n",
            state.task_title, truncated
        ));
        if !lint_output.is_empty() {
            prompt.push_str(&format!("unresolved lint output:\n{lint_output}\n"));
        }
        prompt.push_str(
            "Respond with either a line starting with APPROVED: or one or more ISSUE: blocks \
             (SEVERITY:, DESCRIPTION:) followed by an optional REPORT: block \
             (SATISFACTION:, RISK:, NEEDS_HUMAN_REVIEW:, SUMMARY:).\n",
        );
        if !state.all_findings.is_empty() {
            prompt.push_str("[PRIOR FINDINGS]\n");
            for finding in &state.all_findings {
                prompt.push_str(&format!(
                    "id={} severity={:?} cycle={} status={:?}\n",
                    finding.id, finding.severity, finding.cycle, finding.status
                ));
            }
            prompt.push_str(
                "For each prior finding emit a VERIFICATION: block with FINDING_ID:, \
                 STATUS: fixed|still_present|regressed, optional COMMENT:.\n",
            );
        }
        prompt
    }

    async fn run_lint_fix_subloop(&self, state: &mut CycleState, coder_output: &mut String) -> Result<String, QuasarError> {
        let mut lint_output = self
            .linter
            .run(&self.project_dir)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(phase = %self.config.phase_id, %err, "lint run failed, treating as clean");
                String::new()
            });

        let mut retries = 0;
        while !lint_output.is_empty() && retries < self.config.max_lint_retries {
            state.filter_history.push("lint_failed".to_string());
            let relay = self.relay_block().await;
            if relay.is_some() {
                tracing::info!(phase = %self.config.phase_id, "relaying resolved hails into lint-fix prompt");
            }
            let mut prompt = relay.map(|b| format!("{b}\n")).unwrap_or_default();
            prompt.push_str(&format!(
                "Fix the following lint issues:\n{lint_output}\n\noriginal task: {}\n",
                state.task_title
            ));
            let output = self.coder.invoke(&prompt, &self.config.model).await?;
            state.total_cost_usd += output.cost_usd;
            *coder_output = output.text;
            self.record_commit(state, "lint-fix");
            self.check_budget(state)?;

            lint_output = self
                .linter
                .run(&self.project_dir)
                .await
                .unwrap_or_default();
            retries += 1;
        }
        if lint_output.is_empty() {
            state.filter_history.push("lint_clean".to_string());
        }
        Ok(lint_output)
    }

    fn record_commit(&self, state: &mut CycleState, summary: &str) {
        let Some(committer) = &self.committer else {
            return;
        };
        match committer.commit_cycle(&self.config.phase_id, state.cycle, summary) {
            Ok(sha) if !sha.is_empty() => state.last_cycle_sha = Some(sha),
            Ok(_) => {}
            Err(err) => {
                tracing::warn!(phase = %self.config.phase_id, %err, "cycle commit failed, continuing uncommitted");
            }
        }
    }

    /// Append `last_cycle_sha` to `cycle_commits` if present and clear it.
    fn seal_cycle(&self, state: &mut CycleState) {
        if let Some(sha) = state.last_cycle_sha.take() {
            state.cycle_commits.push(sha);
        }
    }

    /// Open a child bead under the phase's parent bead for every finding
    /// this cycle introduced, and close the child bead for any finding a
    /// verification just marked fixed.
    async fn sync_child_beads(
        &self,
        state: &mut CycleState,
        previously_known: &HashSet<String>,
        verifications: &[crate::review::findings::Verification],
    ) {
        let new_findings: Vec<(String, String)> = state
            .all_findings
            .iter()
            .filter(|f| !previously_known.contains(&f.id))
            .map(|f| (f.id.clone(), format!("[{:?}] {}", f.severity, f.description)))
            .collect();

        for (finding_id, title) in new_findings {
            match self
                .bead_client
                .create_bead(&title, Some(&state.parent_bead_id))
                .await
            {
                Ok(child_id) => {
                    state.child_bead_ids.insert(finding_id, child_id);
                }
                Err(err) => {
                    tracing::warn!(phase = %self.config.phase_id, %err, "child bead creation failed");
                }
            }
        }

        for verification in verifications {
            if verification.status != FindingStatus::Fixed {
                continue;
            }
            let Some(child_id) = state.child_bead_ids.remove(&verification.finding_id) else {
                continue;
            };
            if let Err(err) = self.bead_client.close_bead(&child_id).await {
                tracing::warn!(phase = %self.config.phase_id, %err, "child bead close failed");
            }
        }
    }

    fn extract_hails(&self, state: &CycleState, report: &Option<ReviewReport>, new_findings: &[(Severity, String)]) {
        if let Some(report) = report {
            if report.needs_human_review {
                self.hails.post(NewHail {
                    phase_id: self.config.phase_id.clone(),
                    cycle: state.cycle,
                    source_role: SourceRole::Reviewer,
                    kind: HailKind::HumanReview,
                    summary: "reviewer flagged this phase for human review".to_string(),
                    detail: format!(
                        "risk={:?} satisfaction={:?} summary={}",
                        report.risk, report.satisfaction, report.summary
                    ),
                    options: vec![],
                });
            } else if matches!(report.risk, crate::review::findings::Confidence::High)
                && matches!(report.satisfaction, crate::review::findings::Confidence::Low)
            {
                self.hails.post(NewHail {
                    phase_id: self.config.phase_id.clone(),
                    cycle: state.cycle,
                    source_role: SourceRole::Reviewer,
                    kind: HailKind::DecisionNeeded,
                    summary: "high risk, low satisfaction review".to_string(),
                    detail: report.summary.clone(),
                    options: vec![],
                });
            }
        }

        for (severity, description) in new_findings {
            if matches!(severity, Severity::Critical) {
                self.hails.post(NewHail {
                    phase_id: self.config.phase_id.clone(),
                    cycle: state.cycle,
                    source_role: SourceRole::Reviewer,
                    kind: HailKind::Blocker,
                    summary: "critical finding reported".to_string(),
                    detail: description.clone(),
                    options: vec![],
                });
            }
        }
    }

    async fn bridge_discoveries(&self) {
        let discoveries = self.fabric.unresolved_discoveries().await;
        let mut bridged = self.bridged_discoveries.lock().unwrap_or_else(|e| e.into_inner());
        for discovery in discoveries {
            if !discovery
                .affects
                .as_deref()
                .map(|p| p == self.config.phase_id)
                .unwrap_or(false)
            {
                continue;
            }
            if bridged.contains(&discovery.id) {
                continue;
            }
            let kind = match discovery.kind {
                DiscoveryKind::RequirementsAmbiguity => Some(HailKind::Ambiguity),
                DiscoveryKind::MissingDependency => Some(HailKind::Blocker),
                _ => None,
            };
            if let Some(kind) = kind {
                self.hails.post(NewHail {
                    phase_id: self.config.phase_id.clone(),
                    cycle: 0,
                    source_role: SourceRole::Agent,
                    kind,
                    summary: format!("bridged discovery: {:?}", discovery.kind),
                    detail: discovery.detail.clone(),
                    options: vec![],
                });
                bridged.insert(discovery.id);
            }
        }
    }

    fn struggle_signal(&self, state: &CycleState, current_findings: &[(Severity, String)]) -> Option<StruggleSignal> {
        if state.cycle < self.config.min_cycles_before_check {
            return None;
        }

        let trailing_repeat = state
            .filter_history
            .iter()
            .rev()
            .take_while(|tag| Some(*tag) == state.filter_history.last())
            .count();
        let filter_repeat = (trailing_repeat as f64 / FILTER_REPEAT_NORMALIZER as f64).min(1.0);

        let overlap_count = current_findings
            .iter()
            .filter(|(_, desc)| {
                state
                    .all_findings
                    .iter()
                    .any(|f| jaccard_similarity(&f.description, desc) >= JACCARD_OVERLAP_THRESHOLD)
            })
            .count();
        let finding_overlap = if current_findings.is_empty() {
            0.0
        } else {
            overlap_count as f64 / current_findings.len() as f64
        };

        let expected_rate = if self.config.max_budget_usd > 0.0 && self.config.max_cycles > 0 {
            self.config.max_budget_usd / self.config.max_cycles as f64
        } else {
            0.0
        };
        let actual_rate = if state.cycle > 0 {
            state.total_cost_usd / state.cycle as f64
        } else {
            0.0
        };
        let budget_burn_rate = if expected_rate > 0.0 {
            (actual_rate / expected_rate).min(1.0)
        } else {
            0.0
        };

        let score = 0.35 * filter_repeat + 0.40 * finding_overlap + 0.25 * budget_burn_rate;
        let triggered = score >= self.config.struggle_threshold;
        let reason = format!(
            "filter_repeat={filter_repeat:.2} finding_overlap={finding_overlap:.2} budget_burn_rate={budget_burn_rate:.2}"
        );
        Some(StruggleSignal {
            triggered,
            score,
            reason,
        })
    }

    /// Drive the phase to completion. Returns `Ok` on reviewer approval and
    /// `Err(QuasarError::Sentinel(...))` for the two expected terminal
    /// failure outcomes.
    pub async fn run(&self) -> Result<PhaseLoopOutcome, QuasarError> {
        let bead_id = self
            .bead_client
            .create_bead(&self.config.task_title, None)
            .await
            .unwrap_or_else(|err| {
                tracing::warn!(phase = %self.config.phase_id, %err, "bead creation failed, continuing without a bead");
                String::new()
            });
        tracing::info!(phase = %self.config.phase_id, bead_id, "phase loop started");

        let mut state = CycleState {
            base_commit_sha: self.committer.as_ref().and_then(|c| c.head_sha()),
            task_title: self.config.task_title.clone(),
            parent_bead_id: bead_id,
            ..CycleState::default()
        };

        for cycle in 1..=self.config.max_cycles {
            state.cycle = cycle;
            if cycle > 1 {
                self.drain_refactor(&mut state);
            }
            self.bridge_discoveries().await;

            let coder_relay = self.relay_block().await;
            if coder_relay.is_some() {
                tracing::info!(phase = %self.config.phase_id, cycle, "relaying resolved hails into coder prompt");
            }

            let coder_prompt = self.build_coder_prompt(&state, coder_relay.as_deref());
            let coder_output = self.coder.invoke(&coder_prompt, &self.config.model).await?;
            state.total_cost_usd += coder_output.cost_usd;
            let mut coder_text = coder_output.text;
            self.record_commit(&mut state, "coder cycle");
            self.check_budget(&state)?;

            let lint_output = self.run_lint_fix_subloop(&mut state, &mut coder_text).await?;

            let reviewer_relay = self.relay_block().await;
            if reviewer_relay.is_some() {
                tracing::info!(phase = %self.config.phase_id, cycle, "relaying resolved hails into reviewer prompt");
            }

            let reviewer_prompt =
                self.build_reviewer_prompt(&state, &coder_text, &lint_output, reviewer_relay.as_deref());
            let reviewer_output = self.reviewer.invoke(&reviewer_prompt, &self.config.model).await?;
            state.total_cost_usd += reviewer_output.cost_usd;
            self.check_budget(&state)?;

            // The reviewer has returned but this cycle isn't sealed yet; per
            // the status lattice this is the only window a dependent may be
            // dispatched against speculatively.
            let _ = self
                .fabric
                .set_phase_state(&self.config.phase_id, crate::phase::PhaseStatus::ReviewComplete)
                .await;

            let parsed = parse_review_output(&reviewer_output.text);
            let previously_known: HashSet<String> =
                state.all_findings.iter().map(|f| f.id.clone()).collect();
            let summary = apply_lifecycle(&mut state.all_findings, &parsed.verifications, &parsed.findings, cycle);
            tracing::info!(
                phase = %self.config.phase_id,
                cycle,
                fixed = summary.fixed,
                still_present = summary.still_present,
                regressed = summary.regressed,
                "lifecycle summary"
            );

            self.sync_child_beads(&mut state, &previously_known, &parsed.verifications).await;
            self.extract_hails(&state, &parsed.report, &parsed.findings);

            if let Some(signal) = self.struggle_signal(&state, &parsed.findings)
                && signal.triggered
            {
                tracing::info!(phase = %self.config.phase_id, cycle, score = signal.score, reason = %signal.reason, "struggle signal triggered");
            }

            if parsed.approved {
                self.seal_cycle(&mut state);
                let _ = self.fabric.set_phase_state(&self.config.phase_id, crate::phase::PhaseStatus::Done).await;
                return Ok(PhaseLoopOutcome {
                    cycles_used: cycle,
                    total_cost_usd: state.total_cost_usd,
                    all_findings: state.all_findings,
                    cycle_commits: state.cycle_commits,
                    final_report: parsed.report,
                });
            }

            self.seal_cycle(&mut state);

            if cycle == self.config.max_cycles {
                let unresolved: Vec<String> = crate::review::findings::unresolved(&state.all_findings)
                    .into_iter()
                    .take(MAX_FINDINGS_IN_HAIL)
                    .map(|f| format!("[{:?}] {}", f.severity, f.description))
                    .collect();
                self.hails.post(NewHail {
                    phase_id: self.config.phase_id.clone(),
                    cycle,
                    source_role: SourceRole::Agent,
                    kind: HailKind::Blocker,
                    summary: "phase exhausted its maximum review cycles".to_string(),
                    detail: unresolved.join("\n"),
                    options: vec![],
                });
                let _ = self.fabric.set_phase_state(&self.config.phase_id, crate::phase::PhaseStatus::Failed).await;
                return Err(SentinelError::ErrMaxCycles.into());
            }
        }

        unreachable!("loop always returns by its final iteration")
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::{InMemoryBeadClient, NullCommitter, NullLinter, ScriptedInvoker};
    use crate::fabric::InMemoryFabric;

    fn base_config() -> PhaseLoopConfig {
        let mut cfg = PhaseLoopConfig::new("01", "implement thing", "do the work");
        cfg.max_cycles = 3;
        cfg
    }

    fn make_loop(coder: ScriptedInvoker, reviewer: ScriptedInvoker) -> PhaseLoop {
        let (_tx, rx) = watch::channel(None);
        PhaseLoop::new(
            base_config(),
            Arc::new(coder),
            Arc::new(reviewer),
            Arc::new(NullLinter),
            None,
            Arc::new(InMemoryBeadClient::new()),
            Arc::new(InMemoryFabric::new()),
            Arc::new(HailQueue::new(None)),
            PathBuf::from("."),
            rx,
        )
    }

    #[tokio::test]
    async fn approves_on_first_cycle_when_reviewer_approves_immediately() {
        let coder = ScriptedInvoker::new(vec![ScriptedInvoker::text("attempt1", 0.1)]);
        let reviewer = ScriptedInvoker::new(vec![ScriptedInvoker::text("APPROVED: looks good", 0.1)]);
        let phase_loop = make_loop(coder, reviewer);
        let outcome = phase_loop.run().await.unwrap();
        assert_eq!(outcome.cycles_used, 1);
        assert!(outcome.all_findings.is_empty());
    }

    #[tokio::test]
    async fn rejected_then_approved_resolves_the_finding_by_id() {
        let coder = ScriptedInvoker::new(vec![
            ScriptedInvoker::text("attempt1", 0.1),
            ScriptedInvoker::text("fixed", 0.1),
        ]);
        let reviewer = ScriptedInvoker::new(vec![
            ScriptedInvoker::text("ISSUE:\nSEVERITY: major\nDESCRIPTION: missing error check", 0.1),
            ScriptedInvoker::text("APPROVED: ok", 0.1),
        ]);
        let phase_loop = make_loop(coder, reviewer);
        let outcome = phase_loop.run().await.unwrap();
        assert_eq!(outcome.cycles_used, 2);
        assert_eq!(outcome.all_findings.len(), 1);
    }

    #[tokio::test]
    async fn applies_verification_to_the_matching_finding_id() {
        let issue_desc = "missing error check";
        let id = crate::review::findings::finding_id(Severity::Major, issue_desc);
        let coder = ScriptedInvoker::new(vec![
            ScriptedInvoker::text("attempt1", 0.1),
            ScriptedInvoker::text("fixed", 0.1),
        ]);
        let reviewer = ScriptedInvoker::new(vec![
            ScriptedInvoker::text(&format!("ISSUE:\nSEVERITY: major\nDESCRIPTION: {issue_desc}"), 0.1),
            ScriptedInvoker::text(
                &format!("VERIFICATION:\nFINDING_ID: {id}\nSTATUS: fixed\nAPPROVED: ok"),
                0.1,
            ),
        ]);
        let phase_loop = make_loop(coder, reviewer);
        let outcome = phase_loop.run().await.unwrap();
        assert_eq!(outcome.all_findings[0].status, FindingStatus::Fixed);
    }

    #[tokio::test]
    async fn a_new_finding_opens_a_child_bead_and_fixing_it_closes_that_bead() {
        let issue_desc = "missing error check";
        let id = crate::review::findings::finding_id(Severity::Major, issue_desc);
        let coder = ScriptedInvoker::new(vec![
            ScriptedInvoker::text("attempt1", 0.1),
            ScriptedInvoker::text("fixed", 0.1),
        ]);
        let reviewer = ScriptedInvoker::new(vec![
            ScriptedInvoker::text(&format!("ISSUE:\nSEVERITY: major\nDESCRIPTION: {issue_desc}"), 0.1),
            ScriptedInvoker::text(
                &format!("VERIFICATION:\nFINDING_ID: {id}\nSTATUS: fixed\nAPPROVED: ok"),
                0.1,
            ),
        ]);
        let bead_client = Arc::new(InMemoryBeadClient::new());
        let (_tx, rx) = watch::channel(None);
        let phase_loop = PhaseLoop::new(
            base_config(),
            Arc::new(coder),
            Arc::new(reviewer),
            Arc::new(NullLinter),
            None,
            bead_client.clone(),
            Arc::new(InMemoryFabric::new()),
            Arc::new(HailQueue::new(None)),
            PathBuf::from("."),
            rx,
        );
        phase_loop.run().await.unwrap();
        assert_eq!(bead_client.closed_ids().len(), 1);
    }

    #[tokio::test]
    async fn exhausting_max_cycles_returns_the_sentinel_and_posts_a_blocker_hail() {
        let mut cfg = base_config();
        cfg.max_cycles = 2;
        let coder = ScriptedInvoker::new(vec![
            ScriptedInvoker::text("attempt1", 0.1),
            ScriptedInvoker::text("attempt2", 0.1),
        ]);
        let reviewer = ScriptedInvoker::new(vec![
            ScriptedInvoker::text("ISSUE:\nSEVERITY: major\nDESCRIPTION: still broken", 0.1),
            ScriptedInvoker::text("ISSUE:\nSEVERITY: major\nDESCRIPTION: still broken again", 0.1),
        ]);
        let (_tx, rx) = watch::channel(None);
        let hails = Arc::new(HailQueue::new(None));
        let phase_loop = PhaseLoop::new(
            cfg,
            Arc::new(coder),
            Arc::new(reviewer),
            Arc::new(NullLinter),
            None,
            Arc::new(InMemoryBeadClient::new()),
            Arc::new(InMemoryFabric::new()),
            hails.clone(),
            PathBuf::from("."),
            rx,
        );
        let err = phase_loop.run().await.unwrap_err();
        assert_eq!(err.as_sentinel(), Some(&SentinelError::ErrMaxCycles));
        let blockers: Vec<_> = hails
            .all()
            .into_iter()
            .filter(|h| matches!(h.kind, HailKind::Blocker))
            .collect();
        assert_eq!(blockers.len(), 1);
    }

    #[tokio::test]
    async fn budget_exceeded_short_circuits_before_max_cycles() {
        let mut cfg = base_config();
        cfg.max_budget_usd = 0.05;
        cfg.max_cycles = 5;
        let coder = ScriptedInvoker::new(vec![ScriptedInvoker::text("attempt1", 0.1)]);
        let reviewer = ScriptedInvoker::new(vec![ScriptedInvoker::text("ISSUE:\nDESCRIPTION: x", 0.0)]);
        let (_tx, rx) = watch::channel(None);
        let phase_loop = PhaseLoop::new(
            cfg,
            Arc::new(coder),
            Arc::new(reviewer),
            Arc::new(NullLinter),
            None,
            Arc::new(InMemoryBeadClient::new()),
            Arc::new(InMemoryFabric::new()),
            Arc::new(HailQueue::new(None)),
            PathBuf::from("."),
            rx,
        );
        let err = phase_loop.run().await.unwrap_err();
        assert_eq!(err.as_sentinel(), Some(&SentinelError::ErrBudgetExceeded));
    }

    #[tokio::test]
    async fn refactor_update_is_consumed_exactly_once() {
        let (tx, rx) = watch::channel(None);
        tx.send(Some(RefactorUpdate {
            new_description: "updated scope".to_string(),
        }))
        .unwrap();
        let coder = ScriptedInvoker::new(vec![
            ScriptedInvoker::text("attempt1", 0.0),
            ScriptedInvoker::text("attempt2", 0.0),
        ]);
        let reviewer = ScriptedInvoker::new(vec![
            ScriptedInvoker::text("ISSUE:\nDESCRIPTION: x", 0.0),
            ScriptedInvoker::text("APPROVED: ok", 0.0),
        ]);
        let phase_loop = PhaseLoop::new(
            base_config(),
            Arc::new(coder),
            Arc::new(reviewer),
            Arc::new(NullLinter),
            None,
            Arc::new(InMemoryBeadClient::new()),
            Arc::new(InMemoryFabric::new()),
            Arc::new(HailQueue::new(None)),
            PathBuf::from("."),
            rx,
        );
        phase_loop.run().await.unwrap();
    }

    #[tokio::test]
    async fn critical_finding_posts_a_blocker_hail() {
        let coder = ScriptedInvoker::new(vec![ScriptedInvoker::text("attempt1", 0.0)]);
        let reviewer = ScriptedInvoker::new(vec![ScriptedInvoker::text(
            "ISSUE:\nSEVERITY: critical\nDESCRIPTION: sql injection\nAPPROVED: ok",
            0.0,
        )]);
        let hails = Arc::new(HailQueue::new(None));
        let (_tx, rx) = watch::channel(None);
        let phase_loop = PhaseLoop::new(
            base_config(),
            Arc::new(coder),
            Arc::new(reviewer),
            Arc::new(NullLinter),
            None,
            Arc::new(InMemoryBeadClient::new()),
            Arc::new(InMemoryFabric::new()),
            hails.clone(),
            PathBuf::from("."),
            rx,
        );
        phase_loop.run().await.unwrap();
        assert!(hails.all().iter().any(|h| matches!(h.kind, HailKind::Blocker)));
    }

    #[test]
    fn per_agent_budget_is_unbounded_when_no_budget_is_configured() {
        let cfg = PhaseLoopConfig::new("01", "t", "d");
        assert_eq!(cfg.per_agent_budget(), f64::INFINITY);
    }

    #[test]
    fn per_agent_budget_divides_by_twice_the_cycle_count() {
        let mut cfg = PhaseLoopConfig::new("01", "t", "d");
        cfg.max_budget_usd = 10.0;
        cfg.max_cycles = 5;
        assert_eq!(cfg.per_agent_budget(), 1.0);
    }
}
