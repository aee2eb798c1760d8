#![allow(dead_code)]

use crate::status::ProjectStatus;
use crate::types::{
    BlockchainRegistration, CarbonCreditBatch, MarketplaceListing, Project, RegistrationStatus,
    VerificationRecord, VerificationStage,
};

/// INV-1: Restored area must be positive.
pub fn assert_area_positive(project: &Project) {
    assert!(
        project.area_hectares > 0.0,
        "INV-1 violated: project {} has non-positive area ({})",
        project.id,
        project.area_hectares
    );
}

/// INV-2: A recorded verification score lies in 0–100.
pub fn assert_score_in_range(project: &Project) {
    if let Some(score) = project.verification_score {
        assert!(
            (0.0..=100.0).contains(&score),
            "INV-2 violated: project {} has out-of-range score ({score})",
            project.id
        );
    }
}

/// INV-3: Issued credits never exceed the admin-awarded estimate.
pub fn assert_issuance_within_estimate(project: &Project) {
    assert!(
        project.issued_credits <= project.estimated_credits,
        "INV-3 violated: project {} issued {} of {} estimated credits",
        project.id,
        project.issued_credits,
        project.estimated_credits
    );
}

/// INV-4: Sum of batch amounts never exceeds the estimate current at mint time.
pub fn assert_batch_sum_within_estimate(project: &Project, batches: &[CarbonCreditBatch]) {
    let total: f64 = batches
        .iter()
        .filter(|b| b.project_id == project.id)
        .map(|b| b.amount)
        .sum();
    assert!(
        total <= project.estimated_credits,
        "INV-4 violated: project {} batches total {} > estimate {}",
        project.id,
        total,
        project.estimated_credits
    );
}

/// INV-5: At most one Confirmed registration per project.
pub fn assert_confirmed_registration_unique(registrations: &[BlockchainRegistration]) {
    let confirmed = registrations
        .iter()
        .filter(|r| r.status == RegistrationStatus::Confirmed)
        .count();
    assert!(
        confirmed <= 1,
        "INV-5 violated: {confirmed} confirmed registrations for one project"
    );
}

/// INV-6: Listing availability is never negative.
pub fn assert_availability_non_negative(listing: &MarketplaceListing) {
    assert!(
        listing.credits_available >= 0.0,
        "INV-6 violated: listing {} has negative availability ({})",
        listing.listing_id,
        listing.credits_available
    );
}

/// INV-7: Status transition validity — only the edges in the transition
/// table are legal; terminal states have no exits.
pub fn assert_valid_status_transition(from: ProjectStatus, to: ProjectStatus) {
    assert!(
        ProjectStatus::can_transition(from, to),
        "INV-7 violated: invalid status transition from {:?} to {:?}",
        from,
        to
    );
}

/// INV-8: Stage ordering — a completed later stage implies the earlier
/// required stage completed, unless an override flag is passed.
pub fn assert_stage_order(records: &[VerificationRecord], admin_override: bool) {
    let done = |stage| records.iter().any(|r: &VerificationRecord| r.stage == stage && r.completed);
    if done(VerificationStage::Admin) && !admin_override {
        assert!(
            done(VerificationStage::Ai),
            "INV-8 violated: admin stage completed before AI stage"
        );
    }
    if done(VerificationStage::ThirdParty) {
        assert!(
            done(VerificationStage::Ai),
            "INV-8 violated: third-party stage completed before AI stage"
        );
    }
}

/// Run all stateless project invariants.
pub fn assert_all_project_invariants(project: &Project) {
    assert_area_positive(project);
    assert_score_in_range(project);
    assert_issuance_within_estimate(project);
}
