//! Backend ↔ ledger reconciliation.
//!
//! The backend's belief about a project's chain state and the ledger's
//! actual state can diverge whenever a write fails half-way: the registry
//! transaction landed but the backend row was never confirmed, or a Pending
//! row outlived a submission that never happened. `reconcile` detects and
//! repairs the repairable cases and refuses to touch the rest:
//!
//! * ledger has a registration the backend missed → adopt the ledger record;
//! * backend Pending with no ledger counterpart past the timeout → mark
//!   Failed, retry-eligible;
//! * tx hashes disagree → `Conflict`, manual resolution only.
//!
//! Runs on a schedule and on demand after registration or mint failures.

use std::sync::Arc;
use std::time::Duration;

use sqlx::SqlitePool;
use tokio_util::sync::CancellationToken;
use tracing::{error, info};

use mrv_protocol::{ProjectStatus, RegistrationStatus};

use crate::config::Config;
use crate::db;
use crate::errors::{PipelineError, Result};
use crate::ledger::Ledger;
use crate::lifecycle::{LifecycleController, WriteGate};

const RECONCILER_ACTOR: &str = "reconciler";

/// What a reconciliation pass found (conflicts are returned as errors).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReconcileOutcome {
    /// Backend and ledger agree.
    InSync,
    /// Neither side has a live registration.
    NoRegistration,
    /// A Pending submission is still within its timeout window.
    InFlight,
    /// The ledger had a registration the backend missed; adopted.
    AdoptedLedgerRecord,
    /// Registration agrees but the on-chain approval flag was still unset;
    /// the approval transaction was resubmitted.
    ApprovalResubmitted,
    /// A stale Pending row was marked Failed; retry-eligible.
    ExpiredPending,
}

pub struct ReconciliationService<L> {
    pool: SqlitePool,
    ledger: Arc<L>,
    controller: Arc<LifecycleController<L>>,
    config: Arc<Config>,
    write_gate: WriteGate,
}

impl<L: Ledger> ReconciliationService<L> {
    pub fn new(
        pool: SqlitePool,
        ledger: Arc<L>,
        controller: Arc<LifecycleController<L>>,
        config: Arc<Config>,
        write_gate: WriteGate,
    ) -> Self {
        Self {
            pool,
            ledger,
            controller,
            config,
            write_gate,
        }
    }

    /// Compare the stored registration with the ledger's view and repair
    /// drift. Mismatched tx hashes are never overwritten.
    pub async fn reconcile(&self, project_id: &str) -> Result<ReconcileOutcome> {
        let local = db::latest_registration(&self.pool, project_id).await?;
        let onchain = self.ledger.get_project(project_id).await?;

        match (local, onchain) {
            (None, None) => Ok(ReconcileOutcome::NoRegistration),

            // Ledger succeeded but the backend never recorded it: adopt.
            (None, Some(oc)) => {
                self.controller
                    .confirm_registration(
                        project_id,
                        &oc.registered_tx_hash,
                        oc.block_number,
                        RECONCILER_ACTOR,
                    )
                    .await?;
                info!("adopted ledger registration for {project_id} ({})", oc.registered_tx_hash);
                Ok(ReconcileOutcome::AdoptedLedgerRecord)
            }

            (Some(reg), Some(oc)) => {
                // `confirm_registration` is idempotent and raises Conflict
                // on a hash mismatch — exactly the semantics needed here.
                let applied = self
                    .controller
                    .confirm_registration(
                        project_id,
                        &oc.registered_tx_hash,
                        oc.block_number,
                        RECONCILER_ACTOR,
                    )
                    .await?;
                if applied {
                    info!(
                        "confirmed {} registration for {project_id} from ledger state",
                        reg.status.as_str()
                    );
                    return Ok(ReconcileOutcome::AdoptedLedgerRecord);
                }
                if !oc.approved {
                    // The verdict anchor never landed; resubmit it.
                    let approval = {
                        let _gate = self.write_gate.lock().await;
                        self.ledger.approve_project(project_id).await
                    };
                    if approval.success {
                        info!("resubmitted on-chain approval for {project_id}");
                    } else {
                        error!(
                            "approval resubmission for {project_id} failed: {}",
                            approval
                                .error
                                .map(|e| e.to_string())
                                .unwrap_or_else(|| "unknown ledger failure".to_string())
                        );
                    }
                    return Ok(ReconcileOutcome::ApprovalResubmitted);
                }
                Ok(ReconcileOutcome::InSync)
            }

            (Some(reg), None) => match reg.status {
                RegistrationStatus::Pending => {
                    if self
                        .controller
                        .fail_stale_registration(project_id, RECONCILER_ACTOR)
                        .await?
                    {
                        info!("expired stale pending registration for {project_id}");
                        Ok(ReconcileOutcome::ExpiredPending)
                    } else {
                        Ok(ReconcileOutcome::InFlight)
                    }
                }
                RegistrationStatus::Confirmed => Err(PipelineError::Conflict(format!(
                    "project {project_id}: confirmed registration {} has no ledger counterpart",
                    reg.tx_hash.as_deref().unwrap_or("<none>")
                ))),
                RegistrationStatus::Failed => Ok(ReconcileOutcome::NoRegistration),
            },
        }
    }

    /// One sweep over every project that could have chain drift.
    pub async fn sweep(&self) -> Result<()> {
        let projects = db::list_projects(&self.pool).await?;
        for project in projects {
            if !matches!(
                project.status,
                ProjectStatus::Approved
                    | ProjectStatus::BlockchainPending
                    | ProjectStatus::BlockchainRegistered
                    | ProjectStatus::Tokenized
            ) {
                continue;
            }
            match self.reconcile(&project.id).await {
                Ok(_) => {}
                Err(PipelineError::Conflict(msg)) => {
                    // Flagged for manual resolution; the sweep continues.
                    error!("reconciliation conflict: {msg}");
                }
                Err(e) => error!("reconciliation of {} failed: {e}", project.id),
            }
        }
        Ok(())
    }
}

/// Scheduled reconciliation loop.
pub async fn run<L: Ledger>(service: Arc<ReconciliationService<L>>, cancel: CancellationToken) {
    let interval = Duration::from_secs(service.config.reconcile_interval_secs);
    info!("reconciliation loop starting (every {}s)", interval.as_secs());

    loop {
        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(interval) => {}
        }
        if let Err(e) = service.sweep().await {
            error!("reconciliation sweep failed: {e}");
        }
    }
    info!("reconciliation loop stopped");
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::mock::MockLedger;
    use crate::ledger::OnChainProject;
    use crate::lifecycle::tests::{approved, setup, test_config};
    use mrv_protocol::BlockchainRegistration;

    fn service(
        ledger: Arc<MockLedger>,
        controller: Arc<LifecycleController<MockLedger>>,
    ) -> ReconciliationService<MockLedger> {
        ReconciliationService::new(
            controller.pool().clone(),
            ledger,
            controller,
            test_config(),
            Arc::new(tokio::sync::Mutex::new(())),
        )
    }

    fn onchain(tx_hash: &str) -> OnChainProject {
        OnChainProject {
            project_id: "p1".to_string(),
            owner_wallet: "0xowner".to_string(),
            registered_tx_hash: tx_hash.to_string(),
            block_number: 99,
            approved: false,
            credits_issued: 0.0,
        }
    }

    fn pending_row(tx_hash: Option<&str>, submitted_at: i64) -> BlockchainRegistration {
        BlockchainRegistration {
            project_id: "p1".to_string(),
            chain_id: 31337,
            tx_hash: tx_hash.map(String::from),
            block_number: None,
            contract_address: "0xregistry".to_string(),
            status: RegistrationStatus::Pending,
            submitted_at,
        }
    }

    #[tokio::test]
    async fn missed_backend_write_adopts_ledger_record() {
        let (ledger, controller) = setup().await;
        approved(&controller, "p1", 500.0).await;
        ledger
            .projects
            .lock()
            .unwrap()
            .insert("p1".to_string(), onchain("0xledger"));

        let service = service(ledger, controller.clone());
        let outcome = service.reconcile("p1").await.unwrap();
        assert_eq!(outcome, ReconcileOutcome::AdoptedLedgerRecord);

        let project = db::get_project(controller.pool(), "p1").await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::BlockchainRegistered);
        let reg = db::confirmed_registration(controller.pool(), "p1").await.unwrap().unwrap();
        assert_eq!(reg.tx_hash.as_deref(), Some("0xledger"));
    }

    #[tokio::test]
    async fn stale_pending_without_ledger_record_expires() {
        let (ledger, controller) = setup().await;
        approved(&controller, "p1", 500.0).await;
        db::insert_registration(
            controller.pool(),
            &pending_row(None, db::unix_now() - 3600),
        )
        .await
        .unwrap();

        let service = service(ledger, controller.clone());
        assert_eq!(
            service.reconcile("p1").await.unwrap(),
            ReconcileOutcome::ExpiredPending
        );
        let reg = db::latest_registration(controller.pool(), "p1").await.unwrap().unwrap();
        assert_eq!(reg.status, RegistrationStatus::Failed);
    }

    #[tokio::test]
    async fn fresh_pending_is_in_flight() {
        let (ledger, controller) = setup().await;
        approved(&controller, "p1", 500.0).await;
        db::insert_registration(controller.pool(), &pending_row(None, db::unix_now()))
            .await
            .unwrap();

        let service = service(ledger, controller.clone());
        assert_eq!(service.reconcile("p1").await.unwrap(), ReconcileOutcome::InFlight);
    }

    #[tokio::test]
    async fn mismatched_tx_hash_is_a_conflict_and_never_overwritten() {
        // Scenario E: backend expected one transaction, the ledger shows a
        // different one — flag it, change nothing.
        let (ledger, controller) = setup().await;
        approved(&controller, "p1", 500.0).await;
        db::insert_registration(
            controller.pool(),
            &pending_row(Some("0xlocal"), db::unix_now()),
        )
        .await
        .unwrap();
        ledger
            .projects
            .lock()
            .unwrap()
            .insert("p1".to_string(), onchain("0xother"));

        let service = service(ledger, controller.clone());
        let err = service.reconcile("p1").await.unwrap_err();
        assert!(matches!(err, PipelineError::Conflict(_)), "{err}");

        let reg = db::latest_registration(controller.pool(), "p1").await.unwrap().unwrap();
        assert_eq!(reg.status, RegistrationStatus::Pending);
        assert_eq!(reg.tx_hash.as_deref(), Some("0xlocal"));
    }

    #[tokio::test]
    async fn matching_registration_is_in_sync() {
        let (ledger, controller) = setup().await;
        approved(&controller, "p1", 500.0).await;
        // register_on_chain anchors both the registration and the approval.
        controller.register_on_chain("p1", "admin").await.unwrap();

        let service = service(ledger, controller.clone());
        assert_eq!(service.reconcile("p1").await.unwrap(), ReconcileOutcome::InSync);
    }

    #[tokio::test]
    async fn unset_approval_flag_is_resubmitted() {
        let (ledger, controller) = setup().await;
        approved(&controller, "p1", 500.0).await;
        let outcome = controller.register_on_chain("p1", "admin").await.unwrap();
        let tx_hash = outcome.tx_hash.unwrap();
        // Simulate the approval transaction never landing.
        let mut oc = onchain(&tx_hash);
        oc.approved = false;
        ledger.projects.lock().unwrap().insert("p1".to_string(), oc);

        let service = service(ledger.clone(), controller.clone());
        assert_eq!(
            service.reconcile("p1").await.unwrap(),
            ReconcileOutcome::ApprovalResubmitted
        );
        assert!(ledger.projects.lock().unwrap().get("p1").unwrap().approved);
        assert_eq!(service.reconcile("p1").await.unwrap(), ReconcileOutcome::InSync);
    }

    #[tokio::test]
    async fn untouched_project_has_no_registration() {
        let (ledger, controller) = setup().await;
        approved(&controller, "p1", 500.0).await;
        let service = service(ledger, controller.clone());
        assert_eq!(
            service.reconcile("p1").await.unwrap(),
            ReconcileOutcome::NoRegistration
        );
    }
}
