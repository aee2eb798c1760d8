use crate::invariants;
use crate::status::ProjectStatus::{self, *};

const ALL: [ProjectStatus; 13] = [
    Draft,
    Submitted,
    AiVerifying,
    RequiresThirdParty,
    AdminReview,
    Approved,
    Rejected,
    RequiresRevision,
    BlockchainPending,
    BlockchainRegistered,
    Tokenized,
    Listed,
    Settled,
];

#[test]
fn happy_path_transitions_are_legal() {
    let path = [
        Draft,
        Submitted,
        AiVerifying,
        AdminReview,
        Approved,
        BlockchainPending,
        BlockchainRegistered,
        Tokenized,
        Listed,
        Settled,
    ];
    for pair in path.windows(2) {
        invariants::assert_valid_status_transition(pair[0], pair[1]);
    }
}

#[test]
fn slow_path_goes_through_third_party() {
    invariants::assert_valid_status_transition(AiVerifying, RequiresThirdParty);
    invariants::assert_valid_status_transition(RequiresThirdParty, AdminReview);
}

#[test]
fn failed_registration_returns_to_approved() {
    assert!(ProjectStatus::can_transition(BlockchainPending, Approved));
}

#[test]
fn revision_loops_back_to_submission() {
    invariants::assert_valid_status_transition(AdminReview, RequiresRevision);
    invariants::assert_valid_status_transition(RequiresRevision, Submitted);
}

#[test]
fn terminal_states_have_no_exits() {
    for from in [Rejected, Settled] {
        assert!(from.is_terminal());
        for to in ALL {
            assert!(
                !ProjectStatus::can_transition(from, to),
                "terminal {from:?} must not transition to {to:?}"
            );
        }
    }
}

#[test]
fn no_skipping_admin_review() {
    assert!(!ProjectStatus::can_transition(AiVerifying, Approved));
    assert!(!ProjectStatus::can_transition(RequiresThirdParty, Approved));
    assert!(!ProjectStatus::can_transition(Submitted, AdminReview));
}

#[test]
fn no_minting_before_registration() {
    assert!(!ProjectStatus::can_transition(Approved, Tokenized));
    assert!(!ProjectStatus::can_transition(BlockchainPending, Tokenized));
}

#[test]
fn self_transitions_are_illegal() {
    for status in ALL {
        assert!(!ProjectStatus::can_transition(status, status));
    }
}

#[test]
fn status_string_codec_round_trips() {
    for status in ALL {
        assert_eq!(ProjectStatus::parse(status.as_str()), Some(status));
    }
    assert_eq!(ProjectStatus::parse("no_such_status"), None);
}
