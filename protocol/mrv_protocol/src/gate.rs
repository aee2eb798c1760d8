//! # Verification gate
//!
//! Pure decision logic: given a project's evidence so far, which stage must
//! complete next and whether the project may advance into it. No I/O, no
//! clock, no mutation — the lifecycle controller applies the decision.
//!
//! Stage rules, in order:
//!
//! 1. No completed AI record → the AI stage is required. It auto-completes
//!    when an external score arrives; no human action.
//! 2. AI score below [`AI_FAST_PATH_THRESHOLD`] → third-party field
//!    verification is mandatory before admin review is reachable. A score at
//!    or above the threshold takes the fast path straight to admin review.
//! 3. The third-party stage completes only with an organization-attributed
//!    report carrying an approve/reject decision.
//! 4. The admin stage is the sole stage that can set a terminal verdict. An
//!    admin may override and skip the third-party stage, but only with a
//!    logged justification — that path lives in the controller, not here.
//!
//! Scores are write-once: the gate never demotes a project because a score
//! changed. Only a fresh admin decision reopens a completed pipeline.

use crate::types::{Project, VerificationRecord, VerificationStage};

/// Minimum AI score that skips mandatory third-party verification.
pub const AI_FAST_PATH_THRESHOLD: f64 = 70.0;

/// Outcome of a gate evaluation.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct GateDecision {
    /// The stage that must complete next; `None` when verification is done.
    pub required_stage: Option<VerificationStage>,
    /// Whether the project may move toward that stage right now.
    pub can_advance: bool,
    /// Human-readable explanation, recorded in the audit trail.
    pub reason: &'static str,
}

fn completed(records: &[VerificationRecord], stage: VerificationStage) -> Option<&VerificationRecord> {
    records.iter().find(|r| r.stage == stage && r.completed)
}

/// Evaluate the gate for `project` given its verification records.
pub fn next_stage(project: &Project, records: &[VerificationRecord]) -> GateDecision {
    let ai = completed(records, VerificationStage::Ai);
    let third_party = completed(records, VerificationStage::ThirdParty);
    let admin = completed(records, VerificationStage::Admin);

    if admin.is_some() {
        return GateDecision {
            required_stage: None,
            can_advance: false,
            reason: "verification pipeline complete",
        };
    }

    let Some(ai) = ai else {
        return GateDecision {
            required_stage: Some(VerificationStage::Ai),
            can_advance: false,
            reason: "automated verification score not yet recorded",
        };
    };

    // Prefer the record's score; the project copy is a denormalized mirror.
    let score = ai.score.or(project.verification_score).unwrap_or(0.0);

    if third_party.is_some() {
        return GateDecision {
            required_stage: Some(VerificationStage::Admin),
            can_advance: true,
            reason: "field verification recorded; awaiting admin review",
        };
    }

    if score >= AI_FAST_PATH_THRESHOLD {
        GateDecision {
            required_stage: Some(VerificationStage::Admin),
            can_advance: true,
            reason: "score meets fast-path threshold; direct admin review",
        }
    } else {
        GateDecision {
            required_stage: Some(VerificationStage::ThirdParty),
            can_advance: true,
            reason: "score below fast-path threshold; field verification required",
        }
    }
}
