//! Review findings: parsing a reviewer agent's free-text output into
//! structured findings, verifications, and a report block, plus the
//! cross-cycle lifecycle that tracks a finding's identity by content hash
//! rather than by position.
//!
//! ```
//! use quasar::review::findings::parse_review_output;
//!
//! let output = "ISSUE:\nSEVERITY: critical\nDESCRIPTION: missing bounds check\nAPPROVED: no";
//! let parsed = parse_review_output(output);
//! assert_eq!(parsed.findings.len(), 1);
//! assert!(!parsed.approved);
//! ```

use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::HashMap;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Severity {
    Critical,
    Major,
    Minor,
}

impl Default for Severity {
    fn default() -> Self {
        Self::Major
    }
}

impl Severity {
    fn parse(raw: &str) -> Self {
        match raw.trim().to_ascii_lowercase().as_str() {
            "critical" => Self::Critical,
            "minor" => Self::Minor,
            _ => Self::Major,
        }
    }

    fn as_str(&self) -> &'static str {
        match self {
            Self::Critical => "critical",
            Self::Major => "major",
            Self::Minor => "minor",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum FindingStatus {
    Found,
    Fixed,
    StillPresent,
    Regressed,
}

/// Deterministic cross-cycle identity: `sha256(severity|trimmed_description)`,
/// hex-encoded. Insensitive to leading/trailing whitespace in the
/// description so the reviewer can reformat without losing identity.
pub fn finding_id(severity: Severity, description: &str) -> String {
    let mut hasher = Sha256::new();
    hasher.update(severity.as_str().as_bytes());
    hasher.update(b"|");
    hasher.update(description.trim().as_bytes());
    format!("{:x}", hasher.finalize())
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ReviewFinding {
    pub id: String,
    pub severity: Severity,
    pub description: String,
    pub cycle: u32,
    pub status: FindingStatus,
}

impl ReviewFinding {
    pub fn new(severity: Severity, description: &str, cycle: u32) -> Self {
        let description = description.trim().to_string();
        Self {
            id: finding_id(severity, &description),
            severity,
            description,
            cycle,
            status: FindingStatus::Found,
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Confidence {
    High,
    Medium,
    Low,
}

impl Default for Confidence {
    fn default() -> Self {
        Self::Medium
    }
}

fn parse_confidence(raw: &str) -> Confidence {
    match raw.trim().to_ascii_lowercase().as_str() {
        "high" => Confidence::High,
        "low" => Confidence::Low,
        _ => Confidence::Medium,
    }
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct ReviewReport {
    pub satisfaction: Confidence,
    pub risk: Confidence,
    pub needs_human_review: bool,
    pub summary: String,
}

/// A single `VERIFICATION:` block applying a status update to an existing
/// finding id. Unknown status strings are conservatively treated as
/// `still_present`.
#[derive(Debug, Clone)]
pub struct Verification {
    pub finding_id: String,
    pub status: FindingStatus,
    pub comment: String,
}

fn parse_verification_status(raw: &str) -> FindingStatus {
    match raw.trim().to_ascii_lowercase().as_str() {
        "fixed" => FindingStatus::Fixed,
        "regressed" => FindingStatus::Regressed,
        _ => FindingStatus::StillPresent,
    }
}

/// `NEEDS_HUMAN_REVIEW` is documented as `yes|no`; accept `true`/`false` too
/// since reviewers drift toward either spelling.
fn parse_yes_no(raw: &str) -> bool {
    matches!(raw.trim().to_ascii_lowercase().as_str(), "yes" | "true")
}

/// Result of parsing one reviewer turn's raw text output.
#[derive(Debug, Clone, Default)]
pub struct ParsedReview {
    pub approved: bool,
    pub findings: Vec<(Severity, String)>,
    pub verifications: Vec<Verification>,
    pub report: Option<ReviewReport>,
}

enum Block {
    None,
    Issue {
        severity: Option<String>,
        description: Vec<String>,
    },
    Report {
        fields: HashMap<String, String>,
    },
    Verification {
        finding_id: Option<String>,
        status: Option<String>,
        comment: Vec<String>,
    },
}

/// Scan reviewer output line by line for `ISSUE:`, `VERIFICATION:`, and
/// `REPORT:` blocks, plus bare `APPROVED:` lines. Field lines within a block
/// are recognized by a known `KEY:` prefix; any other non-blank line extends
/// the current free-text field (description or comment) until the next
/// marker.
pub fn parse_review_output(output: &str) -> ParsedReview {
    let mut result = ParsedReview::default();
    let mut block = Block::None;

    macro_rules! flush {
        () => {
            match std::mem::replace(&mut block, Block::None) {
                Block::None => {}
                Block::Issue {
                    severity,
                    description,
                } => {
                    let severity = Severity::parse(severity.as_deref().unwrap_or("major"));
                    let description = description.join(" ").trim().to_string();
                    if !description.is_empty() {
                        result.findings.push((severity, description));
                    }
                }
                Block::Report { fields } => {
                    result.report = Some(ReviewReport {
                        satisfaction: fields
                            .get("satisfaction")
                            .map(|s| parse_confidence(s))
                            .unwrap_or_default(),
                        risk: fields
                            .get("risk")
                            .map(|s| parse_confidence(s))
                            .unwrap_or_default(),
                        needs_human_review: fields
                            .get("needs_human_review")
                            .map(|s| parse_yes_no(s))
                            .unwrap_or(false),
                        summary: fields.get("summary").cloned().unwrap_or_default(),
                    });
                }
                Block::Verification {
                    finding_id,
                    status,
                    comment,
                } => {
                    if let Some(finding_id) = finding_id {
                        result.verifications.push(Verification {
                            finding_id,
                            status: parse_verification_status(status.as_deref().unwrap_or("")),
                            comment: comment.join(" ").trim().to_string(),
                        });
                    }
                }
            }
        };
    }

    for raw_line in output.lines() {
        let line = raw_line.trim();
        if line.is_empty() {
            continue;
        }
        let upper_prefix = |p: &str| line.to_ascii_uppercase().starts_with(p);

        if upper_prefix("APPROVED:") {
            flush!();
            result.approved = true;
            continue;
        }
        if upper_prefix("ISSUE:") {
            flush!();
            block = Block::Issue {
                severity: None,
                description: Vec::new(),
            };
            continue;
        }
        if upper_prefix("REPORT:") {
            flush!();
            block = Block::Report {
                fields: HashMap::new(),
            };
            continue;
        }
        if upper_prefix("VERIFICATION:") {
            flush!();
            block = Block::Verification {
                finding_id: None,
                status: None,
                comment: Vec::new(),
            };
            continue;
        }

        if let Some((key, value)) = line.split_once(':') {
            let key_upper = key.trim().to_ascii_uppercase();
            let value = value.trim().to_string();
            match (&mut block, key_upper.as_str()) {
                (Block::Issue { severity, .. }, "SEVERITY") => {
                    *severity = Some(value);
                    continue;
                }
                (Block::Issue { description, .. }, "DESCRIPTION") => {
                    description.push(value);
                    continue;
                }
                (Block::Report { fields }, "SATISFACTION" | "RISK" | "NEEDS_HUMAN_REVIEW" | "SUMMARY") => {
                    fields.insert(key_upper.to_ascii_lowercase(), value);
                    continue;
                }
                (Block::Verification { finding_id, .. }, "FINDING_ID") => {
                    *finding_id = Some(value);
                    continue;
                }
                (Block::Verification { status, .. }, "STATUS") => {
                    *status = Some(value);
                    continue;
                }
                (Block::Verification { comment, .. }, "COMMENT") => {
                    comment.push(value);
                    continue;
                }
                _ => {}
            }
        }

        match &mut block {
            Block::Issue { description, .. } => description.push(line.to_string()),
            Block::Verification { comment, .. } => comment.push(line.to_string()),
            _ => {}
        }
    }
    flush!();

    result
}

/// Per-cycle lifecycle counts after applying verifications to the
/// accumulated finding set.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LifecycleSummary {
    pub fixed: usize,
    pub still_present: usize,
    pub regressed: usize,
}

/// Apply this cycle's parsed verifications to the accumulated finding list,
/// then append newly discovered findings tagged with `cycle`. Returns the
/// per-cycle lifecycle summary.
pub fn apply_lifecycle(
    all_findings: &mut Vec<ReviewFinding>,
    verifications: &[Verification],
    new_findings: &[(Severity, String)],
    cycle: u32,
) -> LifecycleSummary {
    let mut summary = LifecycleSummary::default();

    for verification in verifications {
        if let Some(finding) = all_findings
            .iter_mut()
            .find(|f| f.id == verification.finding_id)
        {
            finding.status = verification.status;
            match verification.status {
                FindingStatus::Fixed => summary.fixed += 1,
                FindingStatus::StillPresent => summary.still_present += 1,
                FindingStatus::Regressed => summary.regressed += 1,
                FindingStatus::Found => {}
            }
        }
    }

    for (severity, description) in new_findings {
        let id = finding_id(*severity, description);
        if all_findings.iter().any(|f| f.id == id) {
            continue;
        }
        all_findings.push(ReviewFinding::new(*severity, description, cycle));
    }

    summary
}

/// Unresolved findings: anything not currently `fixed`.
pub fn unresolved(all_findings: &[ReviewFinding]) -> Vec<&ReviewFinding> {
    all_findings
        .iter()
        .filter(|f| f.status != FindingStatus::Fixed)
        .collect()
}

/// Whitespace-tokenized, case-insensitive Jaccard similarity between two
/// descriptions, used only as an advisory struggle-detection signal.
pub fn jaccard_similarity(a: &str, b: &str) -> f64 {
    let tokenize = |s: &str| -> std::collections::HashSet<String> {
        s.split_whitespace()
            .map(|w| w.to_ascii_lowercase())
            .collect()
    };
    let ta = tokenize(a);
    let tb = tokenize(b);
    if ta.is_empty() && tb.is_empty() {
        return 0.0;
    }
    let intersection = ta.intersection(&tb).count();
    let union = ta.union(&tb).count();
    if union == 0 {
        0.0
    } else {
        intersection as f64 / union as f64
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn finding_id_is_insensitive_to_surrounding_whitespace() {
        let a = finding_id(Severity::Major, "missing error check");
        let b = finding_id(Severity::Major, "  missing error check  ");
        assert_eq!(a, b);
    }

    #[test]
    fn finding_id_differs_across_severity_or_description() {
        let a = finding_id(Severity::Major, "missing error check");
        let b = finding_id(Severity::Critical, "missing error check");
        let c = finding_id(Severity::Major, "unrelated issue");
        assert_ne!(a, b);
        assert_ne!(a, c);
    }

    #[test]
    fn parses_a_single_issue_block() {
        let output = "ISSUE:\nSEVERITY: critical\nDESCRIPTION: missing bounds check\nacross two lines";
        let parsed = parse_review_output(output);
        assert_eq!(parsed.findings.len(), 1);
        assert_eq!(parsed.findings[0].0, Severity::Critical);
        assert!(parsed.findings[0].1.contains("missing bounds check"));
        assert!(parsed.findings[0].1.contains("across two lines"));
    }

    #[test]
    fn missing_severity_defaults_to_major() {
        let parsed = parse_review_output("ISSUE:\nDESCRIPTION: something is off");
        assert_eq!(parsed.findings[0].0, Severity::Major);
    }

    #[test]
    fn approved_line_sets_flag_and_yields_no_finding_from_that_line() {
        let parsed = parse_review_output("APPROVED: looks good");
        assert!(parsed.approved);
        assert!(parsed.findings.is_empty());
    }

    #[test]
    fn parses_report_block_with_defaults_for_missing_fields() {
        let parsed = parse_review_output("REPORT:\nRISK: high\nSUMMARY: mostly fine");
        let report = parsed.report.unwrap();
        assert_eq!(report.risk, Confidence::High);
        assert_eq!(report.satisfaction, Confidence::Medium);
        assert!(!report.needs_human_review);
        assert_eq!(report.summary, "mostly fine");
    }

    #[test]
    fn needs_human_review_accepts_the_documented_yes_no_spelling() {
        let parsed = parse_review_output("REPORT:\nNEEDS_HUMAN_REVIEW: yes\nSUMMARY: flagging");
        assert!(parsed.report.unwrap().needs_human_review);

        let parsed = parse_review_output("REPORT:\nNEEDS_HUMAN_REVIEW: no\nSUMMARY: fine");
        assert!(!parsed.report.unwrap().needs_human_review);
    }

    #[test]
    fn parses_verification_block() {
        let parsed = parse_review_output(
            "VERIFICATION:\nFINDING_ID: abc123\nSTATUS: fixed\nCOMMENT: looks resolved",
        );
        assert_eq!(parsed.verifications.len(), 1);
        assert_eq!(parsed.verifications[0].finding_id, "abc123");
        assert_eq!(parsed.verifications[0].status, FindingStatus::Fixed);
    }

    #[test]
    fn unknown_verification_status_is_conservatively_still_present() {
        let parsed = parse_review_output(
            "VERIFICATION:\nFINDING_ID: abc\nSTATUS: something_weird",
        );
        assert_eq!(parsed.verifications[0].status, FindingStatus::StillPresent);
    }

    #[test]
    fn lifecycle_applies_verification_and_appends_new_finding() {
        let mut all = vec![ReviewFinding::new(Severity::Major, "old issue", 1)];
        let old_id = all[0].id.clone();
        let verifications = vec![Verification {
            finding_id: old_id.clone(),
            status: FindingStatus::Fixed,
            comment: String::new(),
        }];
        let new = vec![(Severity::Critical, "new issue".to_string())];
        let summary = apply_lifecycle(&mut all, &verifications, &new, 2);

        assert_eq!(summary.fixed, 1);
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].status, FindingStatus::Fixed);
        assert_eq!(unresolved(&all).len(), 1);
    }

    #[test]
    fn lifecycle_regressed_reopens_previously_fixed_finding() {
        let mut all = vec![ReviewFinding {
            status: FindingStatus::Fixed,
            ..ReviewFinding::new(Severity::Minor, "flaky thing", 1)
        }];
        let id = all[0].id.clone();
        let verifications = vec![Verification {
            finding_id: id,
            status: FindingStatus::Regressed,
            comment: String::new(),
        }];
        let summary = apply_lifecycle(&mut all, &verifications, &[], 3);
        assert_eq!(summary.regressed, 1);
        assert_eq!(all[0].status, FindingStatus::Regressed);
    }

    #[test]
    fn lifecycle_does_not_duplicate_a_finding_that_recurs_with_identical_content() {
        let mut all = vec![ReviewFinding::new(Severity::Major, "dup issue", 1)];
        let new = vec![(Severity::Major, "dup issue".to_string())];
        apply_lifecycle(&mut all, &[], &new, 2);
        assert_eq!(all.len(), 1);
    }

    #[test]
    fn jaccard_similarity_of_identical_text_is_one() {
        assert_eq!(jaccard_similarity("missing error check", "missing error check"), 1.0);
    }

    #[test]
    fn jaccard_similarity_of_disjoint_text_is_zero() {
        assert_eq!(jaccard_similarity("foo bar", "baz qux"), 0.0);
    }
}
