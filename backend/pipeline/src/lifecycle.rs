//! Project lifecycle controller.
//!
//! The single writer of `Project::status`. Every mutation goes through
//! [`LifecycleController::apply_transition`], which checks the transition
//! table and writes an audit entry; every public operation first takes the
//! project's async mutex, so transitions for one project are totally
//! ordered. A late callback that arrives after the project moved on is
//! rejected with a `State` error, never silently applied.
//!
//! Ledger writes go through a process-wide [`WriteGate`] — back-to-back
//! submissions from one account would otherwise race on the client-side
//! nonce.

use std::collections::HashMap;
use std::sync::Arc;

use sqlx::SqlitePool;
use tokio::sync::Mutex;
use tracing::{info, warn};
use uuid::Uuid;

use mrv_protocol::{
    gate, AdminVerdict, AuditEntry, BlockchainRegistration, CarbonCreditBatch, EcosystemType,
    ListingStatus, MarketplaceListing, Project, ProjectStatus, RegistrationStatus, ReportDecision,
    VerificationRecord, VerificationStage,
};

use crate::config::Config;
use crate::db;
use crate::errors::{PipelineError, Result};
use crate::ledger::{Ledger, RegisterProject, TxOutcome};

/// Serializes ledger write submissions across all components.
pub type WriteGate = Arc<Mutex<()>>;

/// Actor recorded for transitions the pipeline performs on its own.
pub const PIPELINE_ACTOR: &str = "pipeline";

pub struct NewProject {
    /// Caller-generated id; a fresh UUID is assigned when omitted.
    pub id: Option<String>,
    pub name: String,
    pub ecosystem: EcosystemType,
    pub area_hectares: f64,
    pub location: String,
    pub owner_wallet: String,
    pub media_refs: Vec<String>,
}

pub struct ThirdPartyReport {
    pub organization: String,
    pub decision: ReportDecision,
    /// Content hash of the uploaded report document, if any.
    pub report_ref: Option<String>,
}

pub struct AdminDecision {
    pub verdict: AdminVerdict,
    pub comments: String,
    pub credits_awarded: Option<f64>,
    pub actor: String,
    /// Required to decide from `RequiresThirdParty`; logged verbatim.
    pub override_justification: Option<String>,
}

#[derive(Debug)]
pub struct MintOutcome {
    pub outcome: TxOutcome,
    pub batch: Option<CarbonCreditBatch>,
    pub project: Project,
}

pub struct LifecycleController<L> {
    pool: SqlitePool,
    ledger: Arc<L>,
    config: Arc<Config>,
    write_gate: WriteGate,
    locks: Mutex<HashMap<String, Arc<Mutex<()>>>>,
}

impl<L: Ledger> LifecycleController<L> {
    pub fn new(pool: SqlitePool, ledger: Arc<L>, config: Arc<Config>, write_gate: WriteGate) -> Self {
        Self {
            pool,
            ledger,
            config,
            write_gate,
            locks: Mutex::new(HashMap::new()),
        }
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }

    /// Per-project transition mutex.
    async fn lock_for(&self, project_id: &str) -> Arc<Mutex<()>> {
        let mut map = self.locks.lock().await;
        map.entry(project_id.to_string())
            .or_insert_with(|| Arc::new(Mutex::new(())))
            .clone()
    }

    async fn load(&self, project_id: &str) -> Result<Project> {
        db::get_project(&self.pool, project_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("project {project_id}")))
    }

    /// The only status writer. Validates against the transition table,
    /// persists, and appends the audit entry.
    async fn apply_transition(
        &self,
        project: &mut Project,
        to: ProjectStatus,
        actor: &str,
        evidence_ref: Option<String>,
        note: Option<String>,
    ) -> Result<()> {
        let from = project.status;
        if !ProjectStatus::can_transition(from, to) {
            return Err(PipelineError::State(format!(
                "illegal transition {} -> {} for project {}",
                from.as_str(),
                to.as_str(),
                project.id
            )));
        }

        project.status = to;
        project.updated_at = db::unix_now();
        db::update_project(&self.pool, project).await?;
        db::insert_audit(
            &self.pool,
            &AuditEntry {
                project_id: project.id.clone(),
                from: Some(from),
                to,
                actor: actor.to_string(),
                timestamp: project.updated_at,
                evidence_ref,
                note,
            },
        )
        .await?;

        info!(
            "project {}: {} -> {}",
            project.id,
            from.as_str(),
            to.as_str()
        );
        Ok(())
    }

    // ─────────────────────────────────────────────────────────
    // Submission
    // ─────────────────────────────────────────────────────────

    /// Validate and accept a project submission.
    ///
    /// New projects are created in `Draft` and immediately advanced through
    /// `Submitted` into `AiVerifying` — the pipeline does not block on the
    /// external scorer. Submitting an existing `RequiresRevision` project
    /// starts a fresh verification round with the revised fields.
    pub async fn submit(&self, new: NewProject) -> Result<Project> {
        let id = new.id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let lock = self.lock_for(&id).await;
        let _guard = lock.lock().await;

        let now = db::unix_now();
        let mut project = match db::get_project(&self.pool, &id).await? {
            None => {
                let project = Project {
                    id: id.clone(),
                    name: new.name,
                    ecosystem: new.ecosystem,
                    area_hectares: new.area_hectares,
                    location: new.location,
                    owner_wallet: new.owner_wallet,
                    status: ProjectStatus::Draft,
                    verification_score: None,
                    estimated_credits: 0.0,
                    issued_credits: 0.0,
                    media_refs: new.media_refs,
                    created_at: now,
                    updated_at: now,
                };
                let missing = project.missing_fields();
                if !missing.is_empty() {
                    return Err(PipelineError::Validation(format!(
                        "missing mandatory fields: {}",
                        missing.join(", ")
                    )));
                }
                db::insert_project(&self.pool, &project).await?;
                db::insert_audit(
                    &self.pool,
                    &AuditEntry {
                        project_id: id.clone(),
                        from: None,
                        to: ProjectStatus::Draft,
                        actor: project.owner_wallet.clone(),
                        timestamp: now,
                        evidence_ref: None,
                        note: Some("project created".to_string()),
                    },
                )
                .await?;
                project
            }
            Some(mut existing) if existing.status == ProjectStatus::RequiresRevision => {
                existing.name = new.name;
                existing.ecosystem = new.ecosystem;
                existing.area_hectares = new.area_hectares;
                existing.location = new.location;
                existing.media_refs = new.media_refs;
                existing.verification_score = None;
                let missing = existing.missing_fields();
                if !missing.is_empty() {
                    return Err(PipelineError::Validation(format!(
                        "missing mandatory fields: {}",
                        missing.join(", ")
                    )));
                }
                db::reset_verification_records(&self.pool, &id).await?;
                let owner = existing.owner_wallet.clone();
                self.apply_transition(
                    &mut existing,
                    ProjectStatus::Submitted,
                    &owner,
                    None,
                    Some("resubmitted after revision".to_string()),
                )
                .await?;
                self.apply_transition(
                    &mut existing,
                    ProjectStatus::AiVerifying,
                    PIPELINE_ACTOR,
                    None,
                    Some("awaiting automated score".to_string()),
                )
                .await?;
                return Ok(existing);
            }
            Some(existing) => {
                return Err(PipelineError::Validation(format!(
                    "project {} already exists (status {})",
                    existing.id,
                    existing.status.as_str()
                )));
            }
        };

        let owner = project.owner_wallet.clone();
        self.apply_transition(&mut project, ProjectStatus::Submitted, &owner, None, None)
            .await?;
        self.apply_transition(
            &mut project,
            ProjectStatus::AiVerifying,
            PIPELINE_ACTOR,
            None,
            Some("awaiting automated score".to_string()),
        )
        .await?;
        Ok(project)
    }

    // ─────────────────────────────────────────────────────────
    // Verification stages
    // ─────────────────────────────────────────────────────────

    /// Record the external scorer's result and advance per the gate.
    ///
    /// Idempotent: re-submitting the same score is a no-op. Scores are
    /// write-once — a different score after the project moved on is a
    /// `State` error (only an admin decision reopens a project).
    pub async fn record_ai_score(&self, project_id: &str, score: f64, actor: &str) -> Result<Project> {
        let lock = self.lock_for(project_id).await;
        let _guard = lock.lock().await;

        let mut project = self.load(project_id).await?;
        if !(0.0..=100.0).contains(&score) {
            return Err(PipelineError::Validation(format!(
                "verification score out of range: {score}"
            )));
        }

        let records = db::verification_records(&self.pool, project_id).await?;
        if let Some(existing) = records
            .iter()
            .find(|r| r.stage == VerificationStage::Ai && r.completed)
        {
            if existing.score == Some(score) {
                return Ok(project);
            }
            return Err(PipelineError::State(format!(
                "score already recorded for project {project_id}; rescoring requires an admin reopen"
            )));
        }

        if project.status != ProjectStatus::AiVerifying {
            return Err(PipelineError::State(format!(
                "project {project_id} is not awaiting automated scoring (status {})",
                project.status.as_str()
            )));
        }

        let record = VerificationRecord {
            project_id: project_id.to_string(),
            stage: VerificationStage::Ai,
            completed: true,
            score: Some(score),
            decision: None,
            actor: actor.to_string(),
            timestamp: db::unix_now(),
        };
        db::upsert_verification_record(&self.pool, &record).await?;
        project.verification_score = Some(score);

        let mut records = records;
        records.push(record);
        let decision = gate::next_stage(&project, &records);
        let to = match decision.required_stage {
            Some(VerificationStage::ThirdParty) => ProjectStatus::RequiresThirdParty,
            Some(VerificationStage::Admin) => ProjectStatus::AdminReview,
            _ => {
                return Err(PipelineError::State(format!(
                    "unexpected gate outcome after scoring: {}",
                    decision.reason
                )))
            }
        };
        self.apply_transition(&mut project, to, actor, None, Some(decision.reason.to_string()))
            .await?;
        Ok(project)
    }

    /// Record an organization-attributed field-verification report.
    pub async fn record_third_party_report(
        &self,
        project_id: &str,
        report: ThirdPartyReport,
    ) -> Result<Project> {
        let lock = self.lock_for(project_id).await;
        let _guard = lock.lock().await;

        let mut project = self.load(project_id).await?;
        if project.status != ProjectStatus::RequiresThirdParty {
            return Err(PipelineError::State(format!(
                "project {project_id} is not awaiting field verification (status {})",
                project.status.as_str()
            )));
        }

        db::upsert_verification_record(
            &self.pool,
            &VerificationRecord {
                project_id: project_id.to_string(),
                stage: VerificationStage::ThirdParty,
                completed: true,
                score: None,
                decision: Some(report.decision.as_str().to_string()),
                actor: report.organization.clone(),
                timestamp: db::unix_now(),
            },
        )
        .await?;

        self.apply_transition(
            &mut project,
            ProjectStatus::AdminReview,
            &report.organization,
            report.report_ref,
            Some(format!("field report: {}", report.decision.as_str())),
        )
        .await?;
        Ok(project)
    }

    /// Apply the admin verdict.
    ///
    /// Requires `AdminReview`, or `RequiresThirdParty` with an override
    /// justification (logged as its own audit entry). Approval requires
    /// `credits_awarded > 0` and sets the project's credit estimate.
    pub async fn admin_decide(&self, project_id: &str, decision: AdminDecision) -> Result<Project> {
        let lock = self.lock_for(project_id).await;
        let _guard = lock.lock().await;

        let mut project = self.load(project_id).await?;
        match project.status {
            ProjectStatus::AdminReview => {}
            ProjectStatus::RequiresThirdParty => {
                let Some(justification) = decision.override_justification.as_deref() else {
                    return Err(PipelineError::State(format!(
                        "project {project_id} awaits field verification; an override justification is required to decide now"
                    )));
                };
                self.apply_transition(
                    &mut project,
                    ProjectStatus::AdminReview,
                    &decision.actor,
                    None,
                    Some(format!("admin override, third-party stage skipped: {justification}")),
                )
                .await?;
            }
            other => {
                return Err(PipelineError::State(format!(
                    "project {project_id} is not under admin review (status {})",
                    other.as_str()
                )));
            }
        }

        let to = match decision.verdict {
            AdminVerdict::Approved => {
                let credits = decision.credits_awarded.unwrap_or(0.0);
                if credits <= 0.0 {
                    return Err(PipelineError::Validation(
                        "approval requires credits_awarded > 0".to_string(),
                    ));
                }
                project.estimated_credits = credits;
                ProjectStatus::Approved
            }
            AdminVerdict::Rejected => ProjectStatus::Rejected,
            AdminVerdict::RequiresRevision => ProjectStatus::RequiresRevision,
        };

        db::upsert_verification_record(
            &self.pool,
            &VerificationRecord {
                project_id: project_id.to_string(),
                stage: VerificationStage::Admin,
                completed: true,
                score: None,
                decision: Some(decision.verdict.as_str().to_string()),
                actor: decision.actor.clone(),
                timestamp: db::unix_now(),
            },
        )
        .await?;

        let note = if decision.comments.trim().is_empty() {
            None
        } else {
            Some(decision.comments.clone())
        };
        self.apply_transition(&mut project, to, &decision.actor, None, note)
            .await?;
        Ok(project)
    }

    // ─────────────────────────────────────────────────────────
    // Ledger anchoring
    // ─────────────────────────────────────────────────────────

    /// Submit the registry transaction for an `Approved` project.
    ///
    /// A durable `Pending` registration row is written before the ledger
    /// call. On a failed submission the row resolves to `Failed` and the
    /// project returns to `Approved`, retry-eligible — never a silent
    /// status corruption. The returned outcome carries the ledger-level
    /// error, if any.
    pub async fn register_on_chain(&self, project_id: &str, actor: &str) -> Result<TxOutcome> {
        let lock = self.lock_for(project_id).await;
        let _guard = lock.lock().await;

        let mut project = self.load(project_id).await?;
        if project.status != ProjectStatus::Approved {
            return Err(PipelineError::State(format!(
                "project {project_id} is not approved for registration (status {})",
                project.status.as_str()
            )));
        }
        if db::confirmed_registration(&self.pool, project_id).await?.is_some() {
            return Err(PipelineError::State(format!(
                "project {project_id} already has a confirmed registration"
            )));
        }
        if let Some(latest) = db::latest_registration(&self.pool, project_id).await? {
            if latest.status == RegistrationStatus::Pending {
                return Err(PipelineError::State(format!(
                    "a registration for project {project_id} is already in flight"
                )));
            }
        }

        // A declined wallet prompt aborts this operation only; nothing has
        // been persisted yet and the project stays where it was.
        if let Err(e) = self.ledger.connect().await {
            return match e {
                PipelineError::Ledger(err) => {
                    warn!("wallet session unavailable for {project_id}: {err}");
                    Ok(TxOutcome {
                        success: false,
                        tx_hash: None,
                        block_number: None,
                        error: Some(err),
                    })
                }
                other => Err(other),
            };
        }

        self.apply_transition(
            &mut project,
            ProjectStatus::BlockchainPending,
            actor,
            None,
            Some("registry transaction submitted".to_string()),
        )
        .await?;
        db::insert_registration(
            &self.pool,
            &BlockchainRegistration {
                project_id: project_id.to_string(),
                chain_id: self.config.chain_id,
                tx_hash: None,
                block_number: None,
                contract_address: self.config.registry_address.clone(),
                status: RegistrationStatus::Pending,
                submitted_at: db::unix_now(),
            },
        )
        .await?;

        let request = RegisterProject {
            project_id: project.id.clone(),
            owner_wallet: project.owner_wallet.clone(),
            name: project.name.clone(),
            area_hectares: project.area_hectares,
            evidence_hash: project.media_refs.first().cloned(),
        };
        let outcome = {
            let _gate = self.write_gate.lock().await;
            self.ledger.register_project(&request).await
        };

        if outcome.success {
            db::resolve_pending_registration(
                &self.pool,
                project_id,
                RegistrationStatus::Confirmed,
                outcome.tx_hash.as_deref(),
                outcome.block_number,
            )
            .await?;
            self.apply_transition(
                &mut project,
                ProjectStatus::BlockchainRegistered,
                actor,
                outcome.tx_hash.clone(),
                None,
            )
            .await?;

            // Anchor the admin verdict on the registry as well. A failure
            // here does not disturb the registration; reconciliation
            // resubmits the approval when the ledger still shows it unset.
            let approval = {
                let _gate = self.write_gate.lock().await;
                self.ledger.approve_project(project_id).await
            };
            if !approval.success {
                warn!(
                    "on-chain approval of {project_id} failed: {}; reconciliation will retry",
                    approval
                        .error
                        .map(|e| e.to_string())
                        .unwrap_or_else(|| "unknown ledger failure".to_string())
                );
            }
        } else {
            let reason = outcome
                .error
                .as_ref()
                .map(|e| e.to_string())
                .unwrap_or_else(|| "unknown ledger failure".to_string());
            db::resolve_pending_registration(
                &self.pool,
                project_id,
                RegistrationStatus::Failed,
                None,
                None,
            )
            .await?;
            self.apply_transition(
                &mut project,
                ProjectStatus::Approved,
                PIPELINE_ACTOR,
                None,
                Some(format!("registration failed: {reason}; retry eligible")),
            )
            .await?;
        }
        Ok(outcome)
    }

    /// Mint a credit batch for a registered project.
    ///
    /// The amount is capped by `estimated_credits − issued_credits`; the
    /// first successful mint moves the project to `Tokenized`.
    pub async fn mint_credits(
        &self,
        project_id: &str,
        amount: f64,
        batch_id: Option<String>,
        actor: &str,
    ) -> Result<MintOutcome> {
        let lock = self.lock_for(project_id).await;
        let _guard = lock.lock().await;

        let mut project = self.load(project_id).await?;
        if !matches!(
            project.status,
            ProjectStatus::BlockchainRegistered | ProjectStatus::Tokenized
        ) {
            return Err(PipelineError::State(format!(
                "project {project_id} is not registered for minting (status {})",
                project.status.as_str()
            )));
        }
        if amount <= 0.0 {
            return Err(PipelineError::Validation("mint amount must be positive".to_string()));
        }
        if amount > project.mintable_credits() {
            return Err(PipelineError::Validation(format!(
                "mint amount {amount} exceeds remaining estimated credits {}",
                project.mintable_credits()
            )));
        }

        if let Err(e) = self.ledger.connect().await {
            return match e {
                PipelineError::Ledger(err) => Ok(MintOutcome {
                    outcome: TxOutcome {
                        success: false,
                        tx_hash: None,
                        block_number: None,
                        error: Some(err),
                    },
                    batch: None,
                    project,
                }),
                other => Err(other),
            };
        }

        let batch_id = batch_id.unwrap_or_else(|| Uuid::new_v4().to_string());
        let outcome = {
            let _gate = self.write_gate.lock().await;
            self.ledger
                .mint(&project.owner_wallet, amount, project_id, &batch_id)
                .await
        };

        if !outcome.success {
            return Ok(MintOutcome {
                outcome,
                batch: None,
                project,
            });
        }

        let batch = CarbonCreditBatch {
            batch_id,
            project_id: project_id.to_string(),
            amount,
            minted_tx_hash: outcome.tx_hash.clone().unwrap_or_default(),
            owner_wallet: project.owner_wallet.clone(),
            minted_at: db::unix_now(),
        };
        db::insert_batch(&self.pool, &batch).await?;
        project.issued_credits += amount;

        if project.status == ProjectStatus::BlockchainRegistered {
            self.apply_transition(
                &mut project,
                ProjectStatus::Tokenized,
                actor,
                outcome.tx_hash.clone(),
                Some(format!("minted {amount} credits (batch {})", batch.batch_id)),
            )
            .await?;
        } else {
            project.updated_at = db::unix_now();
            db::update_project(&self.pool, &project).await?;
            db::insert_audit(
                &self.pool,
                &AuditEntry {
                    project_id: project_id.to_string(),
                    from: Some(ProjectStatus::Tokenized),
                    to: ProjectStatus::Tokenized,
                    actor: actor.to_string(),
                    timestamp: project.updated_at,
                    evidence_ref: outcome.tx_hash.clone(),
                    note: Some(format!("minted {amount} credits (batch {})", batch.batch_id)),
                },
            )
            .await?;
        }

        Ok(MintOutcome {
            outcome,
            batch: Some(batch),
            project,
        })
    }

    /// Offer minted credits for sale and move the project to `Listed`.
    pub async fn list_credits(
        &self,
        project_id: &str,
        quantity: Option<f64>,
        price_per_credit: f64,
        actor: &str,
    ) -> Result<MarketplaceListing> {
        let lock = self.lock_for(project_id).await;
        let _guard = lock.lock().await;

        let mut project = self.load(project_id).await?;
        if project.status != ProjectStatus::Tokenized {
            return Err(PipelineError::State(format!(
                "project {project_id} has no unlisted tokenized credits (status {})",
                project.status.as_str()
            )));
        }
        let quantity = quantity.unwrap_or(project.issued_credits);
        if quantity <= 0.0 || quantity > project.issued_credits {
            return Err(PipelineError::Validation(format!(
                "listing quantity {quantity} outside (0, {}]",
                project.issued_credits
            )));
        }
        if price_per_credit <= 0.0 {
            return Err(PipelineError::Validation("price_per_credit must be positive".to_string()));
        }

        let listing = MarketplaceListing {
            listing_id: Uuid::new_v4().to_string(),
            project_id: project_id.to_string(),
            credits_available: quantity,
            price_per_credit,
            seller_wallet: project.owner_wallet.clone(),
            status: ListingStatus::Active,
            created_at: db::unix_now(),
        };
        db::insert_listing(&self.pool, &listing).await?;

        self.apply_transition(
            &mut project,
            ProjectStatus::Listed,
            actor,
            Some(listing.listing_id.clone()),
            None,
        )
        .await?;
        Ok(listing)
    }

    /// Close out a fully sold project.
    pub async fn settle(&self, project_id: &str, actor: &str, evidence_ref: Option<String>) -> Result<Project> {
        let lock = self.lock_for(project_id).await;
        let _guard = lock.lock().await;

        let mut project = self.load(project_id).await?;
        self.apply_transition(
            &mut project,
            ProjectStatus::Settled,
            actor,
            evidence_ref,
            Some("listing sold out; proceeds distributed".to_string()),
        )
        .await?;
        Ok(project)
    }

    // ─────────────────────────────────────────────────────────
    // Repair hooks (event consumer & reconciliation)
    // ─────────────────────────────────────────────────────────

    /// Confirm a registration observed on the ledger.
    ///
    /// Returns `Ok(false)` when already confirmed with the same hash. A
    /// differing hash is a conflict and is never overwritten.
    pub async fn confirm_registration(
        &self,
        project_id: &str,
        tx_hash: &str,
        block_number: i64,
        actor: &str,
    ) -> Result<bool> {
        let lock = self.lock_for(project_id).await;
        let _guard = lock.lock().await;

        let mut project = self.load(project_id).await?;
        let latest = db::latest_registration(&self.pool, project_id).await?;

        match latest {
            Some(reg) if reg.status == RegistrationStatus::Confirmed => {
                if reg.tx_hash.as_deref() == Some(tx_hash) {
                    return Ok(false);
                }
                return Err(PipelineError::Conflict(format!(
                    "project {project_id}: confirmed registration {} disagrees with ledger {tx_hash}",
                    reg.tx_hash.as_deref().unwrap_or("<none>")
                )));
            }
            Some(reg) if reg.status == RegistrationStatus::Pending => {
                if let Some(known) = reg.tx_hash.as_deref() {
                    if known != tx_hash {
                        return Err(PipelineError::Conflict(format!(
                            "project {project_id}: pending registration {known} disagrees with ledger {tx_hash}"
                        )));
                    }
                }
                db::resolve_pending_registration(
                    &self.pool,
                    project_id,
                    RegistrationStatus::Confirmed,
                    Some(tx_hash),
                    Some(block_number),
                )
                .await?;
            }
            _ => {
                // Backend missed the write entirely: adopt the ledger record.
                db::insert_registration(
                    &self.pool,
                    &BlockchainRegistration {
                        project_id: project_id.to_string(),
                        chain_id: self.config.chain_id,
                        tx_hash: Some(tx_hash.to_string()),
                        block_number: Some(block_number),
                        contract_address: self.config.registry_address.clone(),
                        status: RegistrationStatus::Confirmed,
                        submitted_at: db::unix_now(),
                    },
                )
                .await?;
            }
        }

        if project.status == ProjectStatus::Approved {
            self.apply_transition(
                &mut project,
                ProjectStatus::BlockchainPending,
                actor,
                None,
                Some("adopting registration found on ledger".to_string()),
            )
            .await?;
        }
        if project.status == ProjectStatus::BlockchainPending {
            self.apply_transition(
                &mut project,
                ProjectStatus::BlockchainRegistered,
                actor,
                Some(tx_hash.to_string()),
                None,
            )
            .await?;
        }
        Ok(true)
    }

    /// Expire a Pending registration with no ledger counterpart.
    ///
    /// Returns `Ok(true)` when the row was marked Failed and the project
    /// restored to `Approved`.
    pub async fn fail_stale_registration(&self, project_id: &str, actor: &str) -> Result<bool> {
        let lock = self.lock_for(project_id).await;
        let _guard = lock.lock().await;

        let mut project = self.load(project_id).await?;
        let Some(reg) = db::latest_registration(&self.pool, project_id).await? else {
            return Ok(false);
        };
        if reg.status != RegistrationStatus::Pending {
            return Ok(false);
        }
        if db::unix_now() - reg.submitted_at < self.config.registration_timeout_secs {
            return Ok(false);
        }

        db::resolve_pending_registration(&self.pool, project_id, RegistrationStatus::Failed, None, None)
            .await?;
        if project.status == ProjectStatus::BlockchainPending {
            self.apply_transition(
                &mut project,
                ProjectStatus::Approved,
                actor,
                None,
                Some("registration timed out; retry eligible".to_string()),
            )
            .await?;
        }
        Ok(true)
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
pub(crate) mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::ledger::mock::MockLedger;
    use crate::ledger::TxErrorKind;

    pub(crate) fn test_config() -> Arc<Config> {
        Arc::new(Config {
            rpc_url: "http://127.0.0.1:8545".to_string(),
            chain_id: 31337,
            explorer_url: "http://127.0.0.1:8080".to_string(),
            registry_address: "0xregistry".to_string(),
            token_address: "0xtoken".to_string(),
            media_gateway_url: "http://127.0.0.1:5001".to_string(),
            database_url: "sqlite::memory:".to_string(),
            api_port: 0,
            events_poll_interval_secs: 1,
            events_per_page: 100,
            start_block: 0,
            reconcile_interval_secs: 60,
            registration_timeout_secs: 600,
        })
    }

    pub(crate) async fn setup() -> (Arc<MockLedger>, Arc<LifecycleController<MockLedger>>) {
        let pool = test_pool().await;
        let ledger = Arc::new(MockLedger::new());
        let controller = Arc::new(LifecycleController::new(
            pool,
            ledger.clone(),
            test_config(),
            Arc::new(Mutex::new(())),
        ));
        (ledger, controller)
    }

    pub(crate) fn new_project(id: &str) -> NewProject {
        NewProject {
            id: Some(id.to_string()),
            name: "Sundarbans mangrove belt".to_string(),
            ecosystem: EcosystemType::Mangrove,
            area_hectares: 120.5,
            location: "21.95N 89.18E".to_string(),
            owner_wallet: "0xowner".to_string(),
            media_refs: vec!["bafyhash1".to_string()],
        }
    }

    pub(crate) async fn approved(
        controller: &LifecycleController<MockLedger>,
        id: &str,
        credits: f64,
    ) -> Project {
        controller.submit(new_project(id)).await.unwrap();
        controller.record_ai_score(id, 85.0, "scorer").await.unwrap();
        controller
            .admin_decide(
                id,
                AdminDecision {
                    verdict: AdminVerdict::Approved,
                    comments: "looks good".to_string(),
                    credits_awarded: Some(credits),
                    actor: "admin".to_string(),
                    override_justification: None,
                },
            )
            .await
            .unwrap()
    }

    pub(crate) async fn tokenized(
        controller: &LifecycleController<MockLedger>,
        id: &str,
        credits: f64,
    ) -> Project {
        approved(controller, id, credits).await;
        controller.register_on_chain(id, "admin").await.unwrap();
        controller
            .mint_credits(id, credits, None, "admin")
            .await
            .unwrap()
            .project
    }

    #[tokio::test]
    async fn submit_requires_mandatory_fields() {
        let (_, controller) = setup().await;
        let mut incomplete = new_project("p1");
        incomplete.media_refs.clear();
        let err = controller.submit(incomplete).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)), "{err}");
    }

    #[tokio::test]
    async fn submit_lands_in_ai_verifying_with_audit_trail() {
        let (_, controller) = setup().await;
        let project = controller.submit(new_project("p1")).await.unwrap();
        assert_eq!(project.status, ProjectStatus::AiVerifying);

        let audit = db::audit_for_project(controller.pool(), "p1").await.unwrap();
        let statuses: Vec<_> = audit.iter().map(|e| e.to).collect();
        assert_eq!(
            statuses,
            vec![
                ProjectStatus::Draft,
                ProjectStatus::Submitted,
                ProjectStatus::AiVerifying
            ]
        );
    }

    #[tokio::test]
    async fn duplicate_submission_is_rejected() {
        let (_, controller) = setup().await;
        controller.submit(new_project("p1")).await.unwrap();
        let err = controller.submit(new_project("p1")).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn high_score_takes_fast_path_to_admin_review() {
        // Scenario A: score 85 skips the third-party stage entirely.
        let (_, controller) = setup().await;
        controller.submit(new_project("p1")).await.unwrap();
        let project = controller.record_ai_score("p1", 85.0, "scorer").await.unwrap();
        assert_eq!(project.status, ProjectStatus::AdminReview);
    }

    #[tokio::test]
    async fn low_score_requires_third_party_before_admin() {
        // Scenario B: score 40 routes through field verification; deciding
        // early without an override is a state error.
        let (_, controller) = setup().await;
        controller.submit(new_project("p1")).await.unwrap();
        let project = controller.record_ai_score("p1", 40.0, "scorer").await.unwrap();
        assert_eq!(project.status, ProjectStatus::RequiresThirdParty);

        let err = controller
            .admin_decide(
                "p1",
                AdminDecision {
                    verdict: AdminVerdict::Approved,
                    comments: String::new(),
                    credits_awarded: Some(100.0),
                    actor: "admin".to_string(),
                    override_justification: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::State(_)));

        controller
            .record_third_party_report(
                "p1",
                ThirdPartyReport {
                    organization: "ngo-blue-forests".to_string(),
                    decision: ReportDecision::Approve,
                    report_ref: Some("bafyreport".to_string()),
                },
            )
            .await
            .unwrap();
        let project = db::get_project(controller.pool(), "p1").await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::AdminReview);
    }

    #[tokio::test]
    async fn record_ai_score_is_idempotent() {
        let (_, controller) = setup().await;
        controller.submit(new_project("p1")).await.unwrap();
        controller.record_ai_score("p1", 85.0, "scorer").await.unwrap();
        let before = db::audit_for_project(controller.pool(), "p1").await.unwrap().len();

        let project = controller.record_ai_score("p1", 85.0, "scorer").await.unwrap();
        assert_eq!(project.status, ProjectStatus::AdminReview);
        let after = db::audit_for_project(controller.pool(), "p1").await.unwrap().len();
        assert_eq!(before, after, "idempotent rescore must not add audit entries");
    }

    #[tokio::test]
    async fn rescoring_with_different_value_is_rejected() {
        let (_, controller) = setup().await;
        controller.submit(new_project("p1")).await.unwrap();
        controller.record_ai_score("p1", 85.0, "scorer").await.unwrap();

        let err = controller.record_ai_score("p1", 60.0, "scorer").await.unwrap_err();
        assert!(matches!(err, PipelineError::State(_)));
        // Never demote: the project stays where the first score put it.
        let project = db::get_project(controller.pool(), "p1").await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::AdminReview);
    }

    #[tokio::test]
    async fn concurrent_scoring_serializes_one_winner() {
        let (_, controller) = setup().await;
        controller.submit(new_project("p1")).await.unwrap();

        let a = controller.clone();
        let b = controller.clone();
        let (ra, rb) = tokio::join!(
            async move { a.record_ai_score("p1", 80.0, "scorer-a").await },
            async move { b.record_ai_score("p1", 50.0, "scorer-b").await },
        );
        assert_eq!(
            ra.is_ok() as u8 + rb.is_ok() as u8,
            1,
            "exactly one of two conflicting scores may win"
        );
    }

    #[tokio::test]
    async fn report_outside_third_party_stage_is_rejected() {
        let (_, controller) = setup().await;
        controller.submit(new_project("p1")).await.unwrap();
        let err = controller
            .record_third_party_report(
                "p1",
                ThirdPartyReport {
                    organization: "ngo".to_string(),
                    decision: ReportDecision::Approve,
                    report_ref: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::State(_)));
    }

    #[tokio::test]
    async fn approval_requires_positive_credits() {
        let (_, controller) = setup().await;
        controller.submit(new_project("p1")).await.unwrap();
        controller.record_ai_score("p1", 85.0, "scorer").await.unwrap();

        let err = controller
            .admin_decide(
                "p1",
                AdminDecision {
                    verdict: AdminVerdict::Approved,
                    comments: String::new(),
                    credits_awarded: None,
                    actor: "admin".to_string(),
                    override_justification: None,
                },
            )
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
    }

    #[tokio::test]
    async fn admin_override_skips_third_party_with_logged_justification() {
        let (_, controller) = setup().await;
        controller.submit(new_project("p1")).await.unwrap();
        controller.record_ai_score("p1", 40.0, "scorer").await.unwrap();

        let project = controller
            .admin_decide(
                "p1",
                AdminDecision {
                    verdict: AdminVerdict::Approved,
                    comments: "verified during site audit".to_string(),
                    credits_awarded: Some(250.0),
                    actor: "admin".to_string(),
                    override_justification: Some("NGO unavailable in region".to_string()),
                },
            )
            .await
            .unwrap();
        assert_eq!(project.status, ProjectStatus::Approved);
        assert_eq!(project.estimated_credits, 250.0);

        let audit = db::audit_for_project(controller.pool(), "p1").await.unwrap();
        assert!(
            audit
                .iter()
                .any(|e| e.note.as_deref().is_some_and(|n| n.contains("admin override"))),
            "override must leave an audit entry"
        );
    }

    #[tokio::test]
    async fn revision_round_trips_back_to_scoring() {
        let (_, controller) = setup().await;
        controller.submit(new_project("p1")).await.unwrap();
        controller.record_ai_score("p1", 85.0, "scorer").await.unwrap();
        controller
            .admin_decide(
                "p1",
                AdminDecision {
                    verdict: AdminVerdict::RequiresRevision,
                    comments: "area boundary unclear".to_string(),
                    credits_awarded: None,
                    actor: "admin".to_string(),
                    override_justification: None,
                },
            )
            .await
            .unwrap();

        let project = controller.submit(new_project("p1")).await.unwrap();
        assert_eq!(project.status, ProjectStatus::AiVerifying);
        assert_eq!(project.verification_score, None);
        // Fresh round: a new score is accepted again.
        let project = controller.record_ai_score("p1", 72.0, "scorer").await.unwrap();
        assert_eq!(project.status, ProjectStatus::AdminReview);
    }

    #[tokio::test]
    async fn registration_failure_keeps_project_approved_and_retryable() {
        // Scenario C: user rejects the wallet prompt; the retry succeeds.
        let (ledger, controller) = setup().await;
        approved(&controller, "p1", 500.0).await;

        ledger.script(TxOutcome::failed(TxErrorKind::UserRejected, "User rejected"));
        let outcome = controller.register_on_chain("p1", "admin").await.unwrap();
        assert!(!outcome.success);

        let project = db::get_project(controller.pool(), "p1").await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Approved);
        let reg = db::latest_registration(controller.pool(), "p1").await.unwrap().unwrap();
        assert_eq!(reg.status, RegistrationStatus::Failed);

        let outcome = controller.register_on_chain("p1", "admin").await.unwrap();
        assert!(outcome.success);
        let project = db::get_project(controller.pool(), "p1").await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::BlockchainRegistered);
        let reg = db::confirmed_registration(controller.pool(), "p1").await.unwrap().unwrap();
        assert_eq!(reg.tx_hash, outcome.tx_hash);
    }

    #[tokio::test]
    async fn wallet_connect_failure_leaves_no_trace() {
        let (ledger, controller) = setup().await;
        approved(&controller, "p1", 500.0).await;
        *ledger.connect_failure.lock().unwrap() = Some(crate::ledger::TxError::new(
            TxErrorKind::WalletUnavailable,
            "no provider",
        ));

        let outcome = controller.register_on_chain("p1", "admin").await.unwrap();
        assert!(!outcome.success);
        assert_eq!(ledger.writes(), 0);

        let project = db::get_project(controller.pool(), "p1").await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Approved);
        assert!(db::latest_registration(controller.pool(), "p1").await.unwrap().is_none());
    }

    #[tokio::test]
    async fn second_registration_is_rejected() {
        let (_, controller) = setup().await;
        approved(&controller, "p1", 500.0).await;
        controller.register_on_chain("p1", "admin").await.unwrap();

        let err = controller.register_on_chain("p1", "admin").await.unwrap_err();
        assert!(matches!(err, PipelineError::State(_)));
    }

    #[tokio::test]
    async fn overmint_is_rejected_without_a_batch() {
        // Scenario D: minting beyond the estimate fails validation and no
        // batch (and no ledger call) is produced.
        let (ledger, controller) = setup().await;
        approved(&controller, "p1", 500.0).await;
        controller.register_on_chain("p1", "admin").await.unwrap();
        let writes_before = ledger.writes();

        let err = controller
            .mint_credits("p1", 1000.0, None, "admin")
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(ledger.writes(), writes_before);
        assert!(db::batches_for_project(controller.pool(), "p1").await.unwrap().is_empty());
    }

    #[tokio::test]
    async fn minting_caps_at_estimate_across_batches() {
        let (_, controller) = setup().await;
        approved(&controller, "p1", 500.0).await;
        controller.register_on_chain("p1", "admin").await.unwrap();

        let first = controller.mint_credits("p1", 300.0, None, "admin").await.unwrap();
        assert_eq!(first.project.status, ProjectStatus::Tokenized);

        let second = controller.mint_credits("p1", 200.0, None, "admin").await.unwrap();
        assert_eq!(second.project.issued_credits, 500.0);

        let err = controller.mint_credits("p1", 1.0, None, "admin").await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));

        let batches = db::batches_for_project(controller.pool(), "p1").await.unwrap();
        let total: f64 = batches.iter().map(|b| b.amount).sum();
        assert!(total <= 500.0);
    }

    #[tokio::test]
    async fn mint_before_registration_is_rejected() {
        let (_, controller) = setup().await;
        approved(&controller, "p1", 500.0).await;
        let err = controller.mint_credits("p1", 10.0, None, "admin").await.unwrap_err();
        assert!(matches!(err, PipelineError::State(_)));
    }

    #[tokio::test]
    async fn listing_moves_project_to_listed() {
        let (_, controller) = setup().await;
        tokenized(&controller, "p1", 500.0).await;

        let listing = controller
            .list_credits("p1", None, 14.5, "admin")
            .await
            .unwrap();
        assert_eq!(listing.credits_available, 500.0);
        assert_eq!(listing.seller_wallet, "0xowner");

        let project = db::get_project(controller.pool(), "p1").await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Listed);
    }

    #[tokio::test]
    async fn stale_pending_registration_expires_to_failed() {
        let (_, controller) = setup().await;
        approved(&controller, "p1", 500.0).await;

        // Simulate a crash that left a Pending row behind, past the timeout.
        db::insert_registration(
            controller.pool(),
            &BlockchainRegistration {
                project_id: "p1".to_string(),
                chain_id: 31337,
                tx_hash: None,
                block_number: None,
                contract_address: "0xregistry".to_string(),
                status: RegistrationStatus::Pending,
                submitted_at: db::unix_now() - 3600,
            },
        )
        .await
        .unwrap();

        assert!(controller.fail_stale_registration("p1", "reconciler").await.unwrap());
        let reg = db::latest_registration(controller.pool(), "p1").await.unwrap().unwrap();
        assert_eq!(reg.status, RegistrationStatus::Failed);
    }

    #[tokio::test]
    async fn fresh_pending_registration_is_left_alone() {
        let (_, controller) = setup().await;
        approved(&controller, "p1", 500.0).await;
        db::insert_registration(
            controller.pool(),
            &BlockchainRegistration {
                project_id: "p1".to_string(),
                chain_id: 31337,
                tx_hash: None,
                block_number: None,
                contract_address: "0xregistry".to_string(),
                status: RegistrationStatus::Pending,
                submitted_at: db::unix_now(),
            },
        )
        .await
        .unwrap();

        assert!(!controller.fail_stale_registration("p1", "reconciler").await.unwrap());
    }
}
