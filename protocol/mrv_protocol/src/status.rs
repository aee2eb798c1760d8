//! # Project status
//!
//! [`ProjectStatus`] enforces a strict forward-only lifecycle:
//!
//! ```text
//! Draft ──► Submitted ──► AiVerifying ──┬──► AdminReview ──┬──► Approved ──► BlockchainPending
//!               ▲                       │        ▲         ├──► Rejected              │
//!               │                       ▼        │         └──► RequiresRevision ─────┤
//!               │              RequiresThirdParty┘                                    ▼
//!               └──────────────────────────────────────────────┘       BlockchainRegistered
//!                                                                                    │
//!                                            Settled ◄── Listed ◄── Tokenized ◄──────┘
//! ```
//!
//! The one backward edge is `BlockchainPending → Approved`: a failed
//! registration submission restores the pre-call state, retry-eligible.
//! Terminal states (`Rejected`, `Settled`) have no exits.
//!
//! This table is the single authority on legal transitions. The lifecycle
//! controller is the only writer of `Project::status`; every other component
//! reads it.

use serde::{Deserialize, Serialize};

/// Lifecycle status of a project.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ProjectStatus {
    /// Created, not yet submitted for verification.
    Draft,
    /// Submission accepted; mandatory fields validated.
    Submitted,
    /// Awaiting the automated evidence score.
    AiVerifying,
    /// Score below the fast-path threshold; field verification required.
    RequiresThirdParty,
    /// Awaiting the admin verdict.
    AdminReview,
    /// Admin approved; eligible for chain registration.
    Approved,
    /// Admin rejected. Terminal.
    Rejected,
    /// Admin sent the project back for rework; resubmission allowed.
    RequiresRevision,
    /// Registration transaction in flight.
    BlockchainPending,
    /// Registration receipt obtained.
    BlockchainRegistered,
    /// At least one credit batch minted.
    Tokenized,
    /// Credits offered on the marketplace.
    Listed,
    /// Listing sold out and proceeds distributed. Terminal.
    Settled,
}

impl ProjectStatus {
    /// Terminal states cannot be left.
    pub fn is_terminal(&self) -> bool {
        matches!(self, Self::Rejected | Self::Settled)
    }

    /// Whether `from → to` is a legal lifecycle transition.
    pub fn can_transition(from: Self, to: Self) -> bool {
        use ProjectStatus::*;
        matches!(
            (from, to),
            (Draft, Submitted)
                | (Submitted, AiVerifying)
                | (AiVerifying, RequiresThirdParty)
                | (AiVerifying, AdminReview)
                | (RequiresThirdParty, AdminReview)
                | (AdminReview, Approved)
                | (AdminReview, Rejected)
                | (AdminReview, RequiresRevision)
                | (RequiresRevision, Submitted)
                | (Approved, BlockchainPending)
                | (BlockchainPending, BlockchainRegistered)
                | (BlockchainPending, Approved)
                | (BlockchainRegistered, Tokenized)
                | (Tokenized, Listed)
                | (Listed, Settled)
        )
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Draft => "draft",
            Self::Submitted => "submitted",
            Self::AiVerifying => "ai_verifying",
            Self::RequiresThirdParty => "requires_third_party",
            Self::AdminReview => "admin_review",
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::RequiresRevision => "requires_revision",
            Self::BlockchainPending => "blockchain_pending",
            Self::BlockchainRegistered => "blockchain_registered",
            Self::Tokenized => "tokenized",
            Self::Listed => "listed",
            Self::Settled => "settled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "draft" => Some(Self::Draft),
            "submitted" => Some(Self::Submitted),
            "ai_verifying" => Some(Self::AiVerifying),
            "requires_third_party" => Some(Self::RequiresThirdParty),
            "admin_review" => Some(Self::AdminReview),
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "requires_revision" => Some(Self::RequiresRevision),
            "blockchain_pending" => Some(Self::BlockchainPending),
            "blockchain_registered" => Some(Self::BlockchainRegistered),
            "tokenized" => Some(Self::Tokenized),
            "listed" => Some(Self::Listed),
            "settled" => Some(Self::Settled),
            _ => None,
        }
    }
}
