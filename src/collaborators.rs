//! External collaborator contracts: how the phase loop calls out to an
//! agent, a ticket tracker, version control, and a linter. Each is a trait
//! so the worker group and phase loop can be driven by deterministic test
//! doubles; the git-backed `CycleCommitter` is the one real implementation
//! this crate ships, since every deployment of this lineage commits cycles
//! to a real repository.

use crate::errors::{InvocationError, QuasarError};
use async_trait::async_trait;
use git2::{Oid, Repository, Signature};
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::Mutex;

/// Output of one agent invocation: raw text plus the cost attributed to it.
#[derive(Debug, Clone)]
pub struct AgentOutput {
    pub text: String,
    pub cost_usd: f64,
}

/// Calls out to an external coder or reviewer agent. The real transport
/// (HTTP, subprocess, SDK) is out of scope for this crate; callers supply
/// an implementation.
#[async_trait]
pub trait AgentInvoker: Send + Sync {
    async fn invoke(&self, prompt: &str, model: &str) -> Result<AgentOutput, InvocationError>;
}

/// Deterministic test double that plays back a fixed script of responses
/// in order, regardless of prompt or model.
pub struct ScriptedInvoker {
    responses: Mutex<VecDeque<AgentOutput>>,
}

impl ScriptedInvoker {
    pub fn new(responses: Vec<AgentOutput>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
        }
    }

    pub fn text(text: &str, cost_usd: f64) -> AgentOutput {
        AgentOutput {
            text: text.to_string(),
            cost_usd,
        }
    }
}

#[async_trait]
impl AgentInvoker for ScriptedInvoker {
    async fn invoke(&self, _prompt: &str, _model: &str) -> Result<AgentOutput, InvocationError> {
        self.responses
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .pop_front()
            .ok_or_else(|| InvocationError::AgentFailed("scripted responses exhausted".into()))
    }
}

/// Ticket-tracking contract. A phase's coder output may spawn child beads
/// for out-of-scope follow-up work discovered mid-cycle.
#[async_trait]
pub trait BeadClient: Send + Sync {
    async fn create_bead(&self, title: &str, parent: Option<&str>) -> Result<String, QuasarError>;
    async fn close_bead(&self, id: &str) -> Result<(), QuasarError>;
}

/// In-memory bead client backed by an incrementing counter; sufficient for
/// tests and for deployments with no external tracker.
pub struct InMemoryBeadClient {
    next_id: Mutex<u64>,
    closed: Mutex<Vec<String>>,
}

impl InMemoryBeadClient {
    pub fn new() -> Self {
        Self {
            next_id: Mutex::new(1),
            closed: Mutex::new(Vec::new()),
        }
    }

    pub fn closed_ids(&self) -> Vec<String> {
        self.closed.lock().unwrap_or_else(|e| e.into_inner()).clone()
    }
}

impl Default for InMemoryBeadClient {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BeadClient for InMemoryBeadClient {
    async fn create_bead(&self, _title: &str, _parent: Option<&str>) -> Result<String, QuasarError> {
        let mut next = self.next_id.lock().unwrap_or_else(|e| e.into_inner());
        let id = format!("bead-{next}");
        *next += 1;
        Ok(id)
    }

    async fn close_bead(&self, id: &str) -> Result<(), QuasarError> {
        self.closed
            .lock()
            .unwrap_or_else(|e| e.into_inner())
            .push(id.to_string());
        Ok(())
    }
}

/// Runs project linters. A non-zero exit from an individual command is
/// expected and reported as output text, not surfaced as an error.
#[async_trait]
pub trait Linter: Send + Sync {
    async fn run(&self, project_dir: &Path) -> Result<String, QuasarError>;
}

/// No-op linter for nebulas that declare no lint commands.
pub struct NullLinter;

#[async_trait]
impl Linter for NullLinter {
    async fn run(&self, _project_dir: &Path) -> Result<String, QuasarError> {
        Ok(String::new())
    }
}

/// Shells out to a configured list of commands, concatenating any non-empty
/// stdout/stderr into the combined lint output.
pub struct CommandLinter {
    commands: Vec<Vec<String>>,
}

impl CommandLinter {
    pub fn new(commands: Vec<Vec<String>>) -> Self {
        Self { commands }
    }
}

#[async_trait]
impl Linter for CommandLinter {
    async fn run(&self, project_dir: &Path) -> Result<String, QuasarError> {
        let mut combined = String::new();
        for command in &self.commands {
            let Some((program, args)) = command.split_first() else {
                continue;
            };
            let output = tokio::process::Command::new(program)
                .args(args)
                .current_dir(project_dir)
                .output()
                .await
                .map_err(InvocationError::Spawn)?;

            combined.push_str(&String::from_utf8_lossy(&output.stdout));
            combined.push_str(&String::from_utf8_lossy(&output.stderr));
        }
        Ok(combined.trim().to_string())
    }
}

/// Version-control contract for the per-cycle commit protocol: snapshot the
/// working tree at the start of a cycle, seal it once the cycle's findings
/// are resolved, and support rollback to any sealed commit.
pub trait CycleCommitter: Send + Sync {
    fn head_sha(&self) -> Option<String>;
    fn commit_cycle(&self, phase_id: &str, cycle: u32, summary: &str) -> anyhow::Result<String>;
    fn diff_range(&self, base: &str, head: &str) -> anyhow::Result<String>;
    fn reset_to(&self, sha: &str) -> anyhow::Result<()>;
}

/// Commits nowhere; used by nebulas run outside a git working tree.
pub struct NullCommitter;

impl CycleCommitter for NullCommitter {
    fn head_sha(&self) -> Option<String> {
        None
    }

    fn commit_cycle(&self, _phase_id: &str, _cycle: u32, _summary: &str) -> anyhow::Result<String> {
        Ok(String::new())
    }

    fn diff_range(&self, _base: &str, _head: &str) -> anyhow::Result<String> {
        Ok(String::new())
    }

    fn reset_to(&self, _sha: &str) -> anyhow::Result<()> {
        Ok(())
    }
}

/// `git2`-backed `CycleCommitter`, stages the full working tree and commits
/// on every call; `reset_to` refuses to move HEAD to a commit that is not
/// an ancestor of the current HEAD, since rollback only ever discards
/// work, never jumps forward.
pub struct GitCommitter {
    repo: Mutex<Repository>,
}

impl GitCommitter {
    pub fn new(project_dir: &Path) -> anyhow::Result<Self> {
        let repo = Repository::open(project_dir)?;
        Ok(Self {
            repo: Mutex::new(repo),
        })
    }

    fn head_commit(repo: &Repository) -> Option<git2::Commit<'_>> {
        repo.head().ok().and_then(|h| h.peel_to_commit().ok())
    }
}

impl CycleCommitter for GitCommitter {
    fn head_sha(&self) -> Option<String> {
        let repo = self.repo.lock().unwrap();
        Self::head_commit(&repo).map(|c| c.id().to_string())
    }

    fn commit_cycle(&self, phase_id: &str, cycle: u32, summary: &str) -> anyhow::Result<String> {
        let repo = self.repo.lock().unwrap();
        let mut index = repo.index()?;
        index.add_all(["*"].iter(), git2::IndexAddOption::DEFAULT, None)?;
        index.write()?;
        let tree_id = index.write_tree()?;
        let tree = repo.find_tree(tree_id)?;
        let sig = Signature::now("quasar", "quasar@localhost")?;
        let message = format!("[quasar] phase {phase_id} cycle {cycle}: {summary}");

        let commit_id = if let Some(parent) = Self::head_commit(&repo) {
            repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[&parent])?
        } else {
            repo.commit(Some("HEAD"), &sig, &sig, &message, &tree, &[])?
        };
        Ok(commit_id.to_string())
    }

    fn diff_range(&self, base: &str, head: &str) -> anyhow::Result<String> {
        let repo = self.repo.lock().unwrap();
        let base_tree = repo.find_commit(Oid::from_str(base)?)?.tree()?;
        let head_tree = repo.find_commit(Oid::from_str(head)?)?.tree()?;
        let diff = repo.diff_tree_to_tree(Some(&base_tree), Some(&head_tree), None)?;

        let mut buf = Vec::new();
        diff.print(git2::DiffFormat::Patch, |_delta, _hunk, line| {
            buf.extend_from_slice(line.content());
            true
        })?;
        Ok(String::from_utf8_lossy(&buf).to_string())
    }

    fn reset_to(&self, sha: &str) -> anyhow::Result<()> {
        let repo = self.repo.lock().unwrap();
        let target_oid = Oid::from_str(sha)?;
        if let Some(head) = Self::head_commit(&repo) {
            let is_ancestor = repo
                .graph_descendant_of(head.id(), target_oid)
                .unwrap_or(false)
                || head.id() == target_oid;
            if !is_ancestor {
                anyhow::bail!("refusing to reset to {sha}: not an ancestor of current HEAD");
            }
        }
        let object = repo.find_object(target_oid, None)?;
        repo.reset(&object, git2::ResetType::Hard, None)?;
        Ok(())
    }
}

/// Resolves a full unified diff and per-file change counts for an audit
/// trail; kept separate from the commit protocol itself since it is read
/// against arbitrary revisions, not just sealed cycle commits.
pub struct FileChangeSummary {
    pub files_added: Vec<PathBuf>,
    pub files_modified: Vec<PathBuf>,
    pub files_deleted: Vec<PathBuf>,
    pub total_lines_added: usize,
    pub total_lines_removed: usize,
}

impl Default for FileChangeSummary {
    fn default() -> Self {
        Self {
            files_added: Vec::new(),
            files_modified: Vec::new(),
            files_deleted: Vec::new(),
            total_lines_added: 0,
            total_lines_removed: 0,
        }
    }
}

/// Computes a `FileChangeSummary` for the working tree relative to a
/// previously recorded commit sha, used to narrate a cycle's impact in
/// logs and hail detail text.
pub fn compute_changes(repo: &Repository, before_sha: &str) -> anyhow::Result<FileChangeSummary> {
    let before_tree = repo.find_commit(Oid::from_str(before_sha)?)?.tree()?;
    let mut opts = git2::DiffOptions::new();
    opts.include_untracked(true);
    let diff = repo.diff_tree_to_workdir_with_index(Some(&before_tree), Some(&mut opts))?;

    let mut summary = FileChangeSummary::default();
    diff.foreach(
        &mut |delta, _progress| {
            if let Some(path) = delta.new_file().path() {
                let path_buf = path.to_path_buf();
                match delta.status() {
                    git2::Delta::Added | git2::Delta::Untracked => summary.files_added.push(path_buf),
                    git2::Delta::Modified => summary.files_modified.push(path_buf),
                    git2::Delta::Deleted => summary.files_deleted.push(path_buf),
                    _ => {}
                }
            }
            true
        },
        None,
        None,
        Some(&mut |_delta, _hunk, line| {
            match line.origin() {
                '+' => summary.total_lines_added += 1,
                '-' => summary.total_lines_removed += 1,
                _ => {}
            }
            true
        }),
    )?;
    Ok(summary)
}
