//! Reviewer output parsing and the cross-cycle findings lifecycle consumed
//! by the phase loop.
//!
//! ```
//! use quasar::review::findings::{parse_review_output, Severity};
//!
//! let parsed = parse_review_output("ISSUE:\nSEVERITY: major\nDESCRIPTION: needs a test");
//! assert_eq!(parsed.findings[0].0, Severity::Major);
//! ```

pub mod findings;

pub use findings::{
    apply_lifecycle, finding_id, jaccard_similarity, parse_review_output, Confidence,
    FindingStatus, LifecycleSummary, ParsedReview, ReviewFinding, ReviewReport, Severity,
    Verification,
};
