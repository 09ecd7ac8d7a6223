//! The hail queue: an in-memory, append-only ledger of human-attention
//! requests raised by phases or bridged in from fabric discoveries.
//!
//! ```
//! use quasar::hail::{HailQueue, HailKind, NewHail, SourceRole};
//!
//! let queue = HailQueue::new(None);
//! let id = queue.post(NewHail {
//!     phase_id: "01".into(),
//!     cycle: 1,
//!     source_role: SourceRole::Reviewer,
//!     kind: HailKind::Blocker,
//!     summary: "needs a decision".into(),
//!     detail: String::new(),
//!     options: vec![],
//! });
//! assert_eq!(queue.unresolved().len(), 1);
//! ```

use chrono::{DateTime, Duration, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Mutex;

/// The sentinel resolution text for timeout-driven auto-resolution.
pub const AUTO_RESOLVED_SENTINEL: &str = "auto-resolved: timed out waiting for a response";

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SourceRole {
    Coder,
    Reviewer,
    Agent,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HailKind {
    DecisionNeeded,
    Ambiguity,
    Blocker,
    HumanReview,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Hail {
    pub id: u64,
    pub phase_id: String,
    pub cycle: u32,
    pub source_role: SourceRole,
    pub kind: HailKind,
    pub summary: String,
    pub detail: String,
    pub options: Vec<String>,
    pub resolution: Option<String>,
    pub created_at: DateTime<Utc>,
    pub resolved_at: Option<DateTime<Utc>>,
    pub relayed_at: Option<DateTime<Utc>>,
    pub auto_resolved: bool,
}

impl Hail {
    pub fn is_resolved(&self) -> bool {
        self.resolved_at.is_some()
    }

    pub fn is_relayed(&self) -> bool {
        self.relayed_at.is_some()
    }
}

/// Caller-supplied fields for a new hail; `id`/timestamps are assigned on
/// `post`.
#[derive(Debug, Clone)]
pub struct NewHail {
    pub phase_id: String,
    pub cycle: u32,
    pub source_role: SourceRole,
    pub kind: HailKind,
    pub summary: String,
    pub detail: String,
    pub options: Vec<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum HailError {
    Unknown(u64),
    AlreadyResolved(u64),
}

impl std::fmt::Display for HailError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Unknown(id) => write!(f, "unknown hail id {id}"),
            Self::AlreadyResolved(id) => write!(f, "hail {id} is already resolved"),
        }
    }
}

impl std::error::Error for HailError {}

struct QueueState {
    hails: Vec<Hail>,
    next_id: u64,
}

/// Append-only, concurrency-safe hail queue. Optionally auto-resolves hails
/// that outlive a configured timeout.
pub struct HailQueue {
    state: Mutex<QueueState>,
    timeout: Option<Duration>,
}

impl HailQueue {
    pub fn new(timeout: Option<Duration>) -> Self {
        Self {
            state: Mutex::new(QueueState {
                hails: Vec::new(),
                next_id: 1,
            }),
            timeout,
        }
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, QueueState> {
        self.state.lock().unwrap_or_else(|e| e.into_inner())
    }

    pub fn post(&self, new_hail: NewHail) -> u64 {
        let mut state = self.lock();
        let id = state.next_id;
        state.next_id += 1;
        state.hails.push(Hail {
            id,
            phase_id: new_hail.phase_id,
            cycle: new_hail.cycle,
            source_role: new_hail.source_role,
            kind: new_hail.kind,
            summary: new_hail.summary,
            detail: new_hail.detail,
            options: new_hail.options,
            resolution: None,
            created_at: Utc::now(),
            resolved_at: None,
            relayed_at: None,
            auto_resolved: false,
        });
        id
    }

    /// Oldest-first deep copy of every unresolved hail.
    pub fn unresolved(&self) -> Vec<Hail> {
        let mut hails: Vec<Hail> = self
            .lock()
            .hails
            .iter()
            .filter(|h| !h.is_resolved())
            .cloned()
            .collect();
        hails.sort_by_key(|h| h.created_at);
        hails
    }

    pub fn resolve(&self, id: u64, resolution_text: &str) -> Result<(), HailError> {
        let mut state = self.lock();
        let hail = state
            .hails
            .iter_mut()
            .find(|h| h.id == id)
            .ok_or(HailError::Unknown(id))?;
        if hail.is_resolved() {
            return Err(HailError::AlreadyResolved(id));
        }
        hail.resolution = Some(resolution_text.to_string());
        hail.resolved_at = Some(Utc::now());
        Ok(())
    }

    /// Mark a set of hail ids as relayed; unknown ids error, already-relayed
    /// ids are a no-op so the call stays idempotent.
    pub fn mark_relayed(&self, ids: &[u64]) -> Result<(), HailError> {
        let mut state = self.lock();
        for &id in ids {
            if !state.hails.iter().any(|h| h.id == id) {
                return Err(HailError::Unknown(id));
            }
        }
        let now = Utc::now();
        for &id in ids {
            if let Some(hail) = state.hails.iter_mut().find(|h| h.id == id)
                && hail.relayed_at.is_none()
            {
                hail.relayed_at = Some(now);
            }
        }
        Ok(())
    }

    /// Deep copy of hails that are resolved but not yet relayed, oldest
    /// first.
    pub fn unrelayed_resolved(&self) -> Vec<Hail> {
        let mut hails: Vec<Hail> = self
            .lock()
            .hails
            .iter()
            .filter(|h| h.is_resolved() && !h.is_relayed())
            .cloned()
            .collect();
        hails.sort_by_key(|h| h.created_at);
        hails
    }

    /// Auto-resolve hails older than the configured timeout. No-op if no
    /// timeout is configured.
    pub fn sweep_expired(&self) {
        let Some(timeout) = self.timeout else {
            return;
        };
        let mut state = self.lock();
        let now = Utc::now();
        for hail in state.hails.iter_mut() {
            if !hail.is_resolved() && now - hail.created_at >= timeout {
                hail.resolution = Some(AUTO_RESOLVED_SENTINEL.to_string());
                hail.resolved_at = Some(now);
                hail.auto_resolved = true;
            }
        }
    }

    pub fn all(&self) -> Vec<Hail> {
        self.lock().hails.clone()
    }
}

/// Format resolved-and-unrelayed hails into the prompt-injection block
/// described by the contract: timed-out hails get a `[HAIL TIMEOUT]`
/// header, human-answered hails get `[HUMAN RESPONSES]`. Returns `None` if
/// there is nothing to relay.
pub fn format_relay_block(hails: &[Hail]) -> Option<String> {
    if hails.is_empty() {
        return None;
    }
    let (timeouts, answered): (Vec<&Hail>, Vec<&Hail>) =
        hails.iter().partition(|h| h.auto_resolved);

    let mut blocks = Vec::new();
    if !answered.is_empty() {
        let mut block = String::from("[HUMAN RESPONSES]\n");
        for hail in &answered {
            block.push_str(&format!(
                "- {}: {}\n",
                hail.summary,
                hail.resolution.as_deref().unwrap_or_default()
            ));
        }
        blocks.push(block);
    }
    if !timeouts.is_empty() {
        let mut block = String::from("[HAIL TIMEOUT]\n");
        for hail in &timeouts {
            block.push_str(&format!("- {}\n", hail.summary));
        }
        blocks.push(block);
    }
    Some(blocks.join("\n"))
}
