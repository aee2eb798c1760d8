use crate::gate::{next_stage, AI_FAST_PATH_THRESHOLD};
use crate::invariants;
use crate::status::ProjectStatus;
use crate::types::{EcosystemType, Project, VerificationRecord, VerificationStage};

fn sample_project() -> Project {
    Project {
        id: "proj-1".to_string(),
        name: "Sundarbans mangrove belt".to_string(),
        ecosystem: EcosystemType::Mangrove,
        area_hectares: 120.5,
        location: "21.95N 89.18E".to_string(),
        owner_wallet: "0xowner".to_string(),
        status: ProjectStatus::AiVerifying,
        verification_score: None,
        estimated_credits: 0.0,
        issued_credits: 0.0,
        media_refs: vec!["bafyhash1".to_string()],
        created_at: 1_700_000_000,
        updated_at: 1_700_000_000,
    }
}

fn ai_record(score: f64) -> VerificationRecord {
    VerificationRecord {
        project_id: "proj-1".to_string(),
        stage: VerificationStage::Ai,
        completed: true,
        score: Some(score),
        decision: None,
        actor: "scoring-service".to_string(),
        timestamp: 1_700_000_100,
    }
}

fn third_party_record(decision: &str) -> VerificationRecord {
    VerificationRecord {
        project_id: "proj-1".to_string(),
        stage: VerificationStage::ThirdParty,
        completed: true,
        score: None,
        decision: Some(decision.to_string()),
        actor: "ngo-blue-forests".to_string(),
        timestamp: 1_700_000_200,
    }
}

fn admin_record() -> VerificationRecord {
    VerificationRecord {
        project_id: "proj-1".to_string(),
        stage: VerificationStage::Admin,
        completed: true,
        score: None,
        decision: Some("approved".to_string()),
        actor: "admin".to_string(),
        timestamp: 1_700_000_300,
    }
}

#[test]
fn no_records_requires_ai_stage() {
    let decision = next_stage(&sample_project(), &[]);
    assert_eq!(decision.required_stage, Some(VerificationStage::Ai));
    assert!(!decision.can_advance);
}

#[test]
fn high_score_takes_fast_path_to_admin() {
    let decision = next_stage(&sample_project(), &[ai_record(85.0)]);
    assert_eq!(decision.required_stage, Some(VerificationStage::Admin));
    assert!(decision.can_advance);
}

#[test]
fn low_score_requires_third_party() {
    let decision = next_stage(&sample_project(), &[ai_record(40.0)]);
    assert_eq!(decision.required_stage, Some(VerificationStage::ThirdParty));
    assert!(decision.can_advance);
}

#[test]
fn threshold_boundary_is_fast_path() {
    let decision = next_stage(&sample_project(), &[ai_record(AI_FAST_PATH_THRESHOLD)]);
    assert_eq!(decision.required_stage, Some(VerificationStage::Admin));
}

#[test]
fn just_below_threshold_is_slow_path() {
    let decision = next_stage(&sample_project(), &[ai_record(69.9)]);
    assert_eq!(decision.required_stage, Some(VerificationStage::ThirdParty));
}

#[test]
fn third_party_report_unlocks_admin_review() {
    let records = [ai_record(40.0), third_party_record("approve")];
    let decision = next_stage(&sample_project(), &records);
    assert_eq!(decision.required_stage, Some(VerificationStage::Admin));
    assert!(decision.can_advance);
}

#[test]
fn rejecting_report_still_routes_to_admin() {
    // The admin stage is the sole stage that can set a terminal verdict;
    // a rejecting field report is evidence for that review, not a verdict.
    let records = [ai_record(40.0), third_party_record("reject")];
    let decision = next_stage(&sample_project(), &records);
    assert_eq!(decision.required_stage, Some(VerificationStage::Admin));
}

#[test]
fn completed_admin_stage_closes_the_gate() {
    let records = [ai_record(85.0), admin_record()];
    let decision = next_stage(&sample_project(), &records);
    assert_eq!(decision.required_stage, None);
    assert!(!decision.can_advance);
}

#[test]
fn incomplete_ai_record_does_not_count() {
    let mut record = ai_record(90.0);
    record.completed = false;
    let decision = next_stage(&sample_project(), &[record]);
    assert_eq!(decision.required_stage, Some(VerificationStage::Ai));
}

#[test]
fn gate_uses_record_score_over_project_mirror() {
    let mut project = sample_project();
    project.verification_score = Some(95.0);
    let decision = next_stage(&project, &[ai_record(40.0)]);
    assert_eq!(decision.required_stage, Some(VerificationStage::ThirdParty));
}

#[test]
fn stage_order_invariant_holds_for_full_pipeline() {
    let records = [ai_record(40.0), third_party_record("approve"), admin_record()];
    invariants::assert_stage_order(&records, false);
}

#[test]
#[should_panic(expected = "INV-8")]
fn stage_order_invariant_catches_admin_before_ai() {
    invariants::assert_stage_order(&[admin_record()], false);
}

#[test]
fn stage_order_allows_admin_override() {
    invariants::assert_stage_order(&[admin_record()], true);
}

#[test]
fn missing_fields_flags_empty_media() {
    let mut project = sample_project();
    project.media_refs.clear();
    assert_eq!(project.missing_fields(), vec!["media_refs"]);
}

#[test]
fn missing_fields_empty_for_complete_project() {
    assert!(sample_project().missing_fields().is_empty());
    invariants::assert_all_project_invariants(&sample_project());
}

#[test]
fn mintable_credits_never_negative() {
    let mut project = sample_project();
    project.estimated_credits = 100.0;
    project.issued_credits = 100.0;
    assert_eq!(project.mintable_credits(), 0.0);
}
