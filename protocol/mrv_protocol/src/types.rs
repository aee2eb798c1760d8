//! # Types
//!
//! Shared data structures used across the MRV pipeline.
//!
//! ## Design decisions
//!
//! ### One record per ledger-touching operation
//!
//! Every operation that leaves the process — chain registration, credit
//! minting, marketplace settlement, revenue transfers — gets its own durable
//! record ([`BlockchainRegistration`], [`CarbonCreditBatch`],
//! [`PaymentTransfer`]) created *before* the operation is submitted. The gap
//! between "submitted" and "confirmed" is therefore always visible to
//! reconciliation.
//!
//! ### Status enums carry their own string codec
//!
//! All status enums expose `as_str`/`parse` pairs so the backend can store
//! them as TEXT columns without a storage dependency leaking into this crate.

use serde::{Deserialize, Serialize};

use crate::status::ProjectStatus;

/// Coastal ecosystem categories eligible for blue-carbon accreditation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EcosystemType {
    Mangrove,
    Seagrass,
    SaltMarsh,
    CoastalWetland,
    CoralReef,
    Mudflat,
}

impl EcosystemType {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Mangrove => "mangrove",
            Self::Seagrass => "seagrass",
            Self::SaltMarsh => "salt_marsh",
            Self::CoastalWetland => "coastal_wetland",
            Self::CoralReef => "coral_reef",
            Self::Mudflat => "mudflat",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "mangrove" => Some(Self::Mangrove),
            "seagrass" => Some(Self::Seagrass),
            "salt_marsh" => Some(Self::SaltMarsh),
            "coastal_wetland" => Some(Self::CoastalWetland),
            "coral_reef" => Some(Self::CoralReef),
            "mudflat" => Some(Self::Mudflat),
            _ => None,
        }
    }
}

/// A restoration project moving through the MRV pipeline.
///
/// Owned by the backend store; mutated only through lifecycle transitions.
/// Projects are never deleted, only terminal-marked.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Project {
    /// Caller-generated, globally unique identifier.
    pub id: String,
    pub name: String,
    pub ecosystem: EcosystemType,
    /// Restored area in hectares; must be positive.
    pub area_hectares: f64,
    /// Free-form site location (coordinates or place name).
    pub location: String,
    /// Wallet that owns the project and receives minted credits.
    pub owner_wallet: String,
    pub status: ProjectStatus,
    /// 0–100 automated score; absent until the AI stage completes.
    pub verification_score: Option<f64>,
    /// Credits awarded by admin review; cap for all minting.
    pub estimated_credits: f64,
    /// Credits minted so far across all batches.
    pub issued_credits: f64,
    /// Content hashes of uploaded evidence media.
    pub media_refs: Vec<String>,
    pub created_at: i64,
    pub updated_at: i64,
}

impl Project {
    /// Mandatory fields that are still missing for submission.
    ///
    /// An empty return means the project is submittable.
    pub fn missing_fields(&self) -> Vec<&'static str> {
        let mut missing = Vec::new();
        if self.name.trim().is_empty() {
            missing.push("name");
        }
        if self.area_hectares <= 0.0 {
            missing.push("area_hectares");
        }
        if self.location.trim().is_empty() {
            missing.push("location");
        }
        if self.owner_wallet.trim().is_empty() {
            missing.push("owner_wallet");
        }
        if self.media_refs.is_empty() {
            missing.push("media_refs");
        }
        missing
    }

    /// Credits still mintable under the admin-awarded estimate.
    pub fn mintable_credits(&self) -> f64 {
        (self.estimated_credits - self.issued_credits).max(0.0)
    }
}

/// The three verification stages, in pipeline order.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerificationStage {
    /// Automated scoring of submitted evidence (0–100).
    Ai,
    /// Accredited-organization field verification report.
    ThirdParty,
    /// Admin review; the only stage that can set a terminal verdict.
    Admin,
}

impl VerificationStage {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Ai => "ai",
            Self::ThirdParty => "third_party",
            Self::Admin => "admin",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "ai" => Some(Self::Ai),
            "third_party" => Some(Self::ThirdParty),
            "admin" => Some(Self::Admin),
            _ => None,
        }
    }
}

/// Verdict of a third-party field report.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ReportDecision {
    Approve,
    Reject,
}

impl ReportDecision {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approve => "approve",
            Self::Reject => "reject",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approve" => Some(Self::Approve),
            "reject" => Some(Self::Reject),
            _ => None,
        }
    }
}

/// Admin review verdict.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum AdminVerdict {
    Approved,
    Rejected,
    RequiresRevision,
}

impl AdminVerdict {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Approved => "approved",
            Self::Rejected => "rejected",
            Self::RequiresRevision => "requires_revision",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "approved" => Some(Self::Approved),
            "rejected" => Some(Self::Rejected),
            "requires_revision" => Some(Self::RequiresRevision),
            _ => None,
        }
    }
}

/// One verification-stage record for a project.
///
/// A later stage's record must not be `completed` while an earlier required
/// stage is incomplete, unless an admin override was audit-logged.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VerificationRecord {
    pub project_id: String,
    pub stage: VerificationStage,
    pub completed: bool,
    /// AI stage: the 0–100 score.
    pub score: Option<f64>,
    /// ThirdParty/Admin stages: the recorded decision string.
    pub decision: Option<String>,
    /// Who produced the record (scorer id, organization, admin account).
    pub actor: String,
    pub timestamp: i64,
}

/// Lifecycle status of an on-chain registration attempt.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RegistrationStatus {
    /// Submitted (or about to be); awaiting resolution.
    Pending,
    /// Transaction receipt obtained; at most one per project.
    Confirmed,
    /// Submission failed; a new attempt is allowed.
    Failed,
}

impl RegistrationStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Confirmed => "confirmed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "confirmed" => Some(Self::Confirmed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// Durable record of a project-registration transaction.
///
/// Created `Pending` before the ledger call goes out, so a crash between
/// ledger success and backend write is always detectable by reconciliation.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct BlockchainRegistration {
    pub project_id: String,
    pub chain_id: u64,
    pub tx_hash: Option<String>,
    pub block_number: Option<i64>,
    pub contract_address: String,
    pub status: RegistrationStatus,
    pub submitted_at: i64,
}

/// A discrete minting event for a project's credits.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CarbonCreditBatch {
    pub batch_id: String,
    pub project_id: String,
    /// Credits minted in this batch (tCO₂e).
    pub amount: f64,
    pub minted_tx_hash: String,
    pub owner_wallet: String,
    pub minted_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ListingStatus {
    Active,
    Sold,
    Cancelled,
}

impl ListingStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Active => "active",
            Self::Sold => "sold",
            Self::Cancelled => "cancelled",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "active" => Some(Self::Active),
            "sold" => Some(Self::Sold),
            "cancelled" => Some(Self::Cancelled),
            _ => None,
        }
    }
}

/// A tokenized credit batch offered for sale.
///
/// `credits_available` only ever decreases and never goes negative; a failed
/// purchase must restore whatever it decremented.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct MarketplaceListing {
    pub listing_id: String,
    pub project_id: String,
    pub credits_available: f64,
    pub price_per_credit: f64,
    pub seller_wallet: String,
    pub status: ListingStatus,
    pub created_at: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum TransferStatus {
    Pending,
    Completed,
    Failed,
}

impl TransferStatus {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Pending => "pending",
            Self::Completed => "completed",
            Self::Failed => "failed",
        }
    }

    pub fn parse(s: &str) -> Option<Self> {
        match s {
            "pending" => Some(Self::Pending),
            "completed" => Some(Self::Completed),
            "failed" => Some(Self::Failed),
            _ => None,
        }
    }
}

/// A revenue-sharing token transfer between wallets.
///
/// A transfer with a given `idempotency_key` reaches the ledger at most once
/// regardless of how many times the caller retries.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PaymentTransfer {
    pub transfer_id: String,
    pub from_wallet: String,
    pub to_wallet: String,
    pub amount: f64,
    pub token_type: String,
    pub purpose: String,
    pub status: TransferStatus,
    pub tx_hash: Option<String>,
    pub idempotency_key: String,
    pub created_at: i64,
}

/// One entry in a project's transition audit trail.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AuditEntry {
    pub project_id: String,
    /// `None` for the creation entry.
    pub from: Option<ProjectStatus>,
    pub to: ProjectStatus,
    pub actor: String,
    pub timestamp: i64,
    /// Content hash or record id backing the transition, if any.
    pub evidence_ref: Option<String>,
    /// Override justifications and other free-form annotations.
    pub note: Option<String>,
}
