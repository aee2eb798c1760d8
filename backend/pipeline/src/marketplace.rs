//! Marketplace engine — listed credit batches and atomic purchases.
//!
//! A purchase decrements availability with a guarded SQL update before the
//! ledger transfer goes out; a failed transfer re-credits the listing
//! (compensating action), so availability is never lost to a failed
//! purchase and never goes negative. Listings that sell out are marked
//! `Sold` and the project is settled through the lifecycle controller —
//! this module never writes project status itself.

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::info;

use mrv_protocol::{ListingStatus, MarketplaceListing};

use crate::db;
use crate::errors::{PipelineError, Result};
use crate::ledger::{Ledger, TxOutcome};
use crate::lifecycle::{LifecycleController, WriteGate};

pub struct PurchaseRequest {
    pub listing_id: String,
    pub quantity: f64,
    pub buyer_wallet: String,
}

#[derive(Debug)]
pub struct PurchaseOutcome {
    pub outcome: TxOutcome,
    pub listing: MarketplaceListing,
}

pub struct MarketplaceEngine<L> {
    pool: SqlitePool,
    ledger: Arc<L>,
    controller: Arc<LifecycleController<L>>,
    write_gate: WriteGate,
}

impl<L: Ledger> MarketplaceEngine<L> {
    pub fn new(
        pool: SqlitePool,
        ledger: Arc<L>,
        controller: Arc<LifecycleController<L>>,
        write_gate: WriteGate,
    ) -> Self {
        Self {
            pool,
            ledger,
            controller,
            write_gate,
        }
    }

    pub async fn active_listings(&self) -> Result<Vec<MarketplaceListing>> {
        db::active_listings(&self.pool).await
    }

    /// Buy `quantity` credits from a listing.
    pub async fn purchase(&self, req: PurchaseRequest) -> Result<PurchaseOutcome> {
        if req.quantity <= 0.0 {
            return Err(PipelineError::Validation("purchase quantity must be positive".to_string()));
        }
        if req.buyer_wallet.trim().is_empty() {
            return Err(PipelineError::Validation("buyer_wallet is required".to_string()));
        }

        let listing = db::get_listing(&self.pool, &req.listing_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("listing {}", req.listing_id)))?;
        if listing.status != ListingStatus::Active {
            return Err(PipelineError::State(format!(
                "listing {} is not active ({})",
                listing.listing_id,
                listing.status.as_str()
            )));
        }

        // Reserve first; the guarded update refuses an oversell.
        if !db::try_decrement_listing(&self.pool, &req.listing_id, req.quantity).await? {
            return Err(PipelineError::Validation(format!(
                "quantity {} exceeds credits available on listing {}",
                req.quantity, req.listing_id
            )));
        }

        let outcome = {
            let _gate = self.write_gate.lock().await;
            self.ledger.transfer(&req.buyer_wallet, req.quantity).await
        };

        if !outcome.success {
            // Compensate: the reservation is returned to the listing.
            db::restore_listing(&self.pool, &req.listing_id, req.quantity).await?;
            let listing = db::get_listing(&self.pool, &req.listing_id)
                .await?
                .ok_or_else(|| PipelineError::NotFound(format!("listing {}", req.listing_id)))?;
            return Ok(PurchaseOutcome { outcome, listing });
        }

        let mut listing = db::get_listing(&self.pool, &req.listing_id)
            .await?
            .ok_or_else(|| PipelineError::NotFound(format!("listing {}", req.listing_id)))?;

        if listing.credits_available <= 0.0 {
            db::set_listing_status(&self.pool, &req.listing_id, ListingStatus::Sold).await?;
            listing.status = ListingStatus::Sold;
            self.controller
                .settle(&listing.project_id, "marketplace", outcome.tx_hash.clone())
                .await?;
            info!("listing {} sold out; project {} settled", listing.listing_id, listing.project_id);
        }

        Ok(PurchaseOutcome { outcome, listing })
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::ledger::mock::MockLedger;
    use crate::ledger::TxErrorKind;
    use crate::lifecycle::tests::{setup, tokenized};
    use mrv_protocol::ProjectStatus;
    use tokio::sync::Mutex;

    async fn listed_engine(credits: f64) -> (Arc<MockLedger>, Arc<LifecycleController<MockLedger>>, MarketplaceEngine<MockLedger>, String) {
        let (ledger, controller) = setup().await;
        tokenized(&controller, "p1", credits).await;
        let listing = controller
            .list_credits("p1", None, 12.0, "admin")
            .await
            .unwrap();
        let engine = MarketplaceEngine::new(
            controller.pool().clone(),
            ledger.clone(),
            controller.clone(),
            Arc::new(Mutex::new(())),
        );
        (ledger, controller, engine, listing.listing_id)
    }

    #[tokio::test]
    async fn purchase_decrements_availability() {
        let (_, _, engine, listing_id) = listed_engine(500.0).await;
        let result = engine
            .purchase(PurchaseRequest {
                listing_id,
                quantity: 100.0,
                buyer_wallet: "0xbuyer".to_string(),
            })
            .await
            .unwrap();
        assert!(result.outcome.success);
        assert_eq!(result.listing.credits_available, 400.0);
        assert_eq!(result.listing.status, ListingStatus::Active);
    }

    #[tokio::test]
    async fn failed_transfer_restores_availability() {
        let (ledger, _, engine, listing_id) = listed_engine(500.0).await;
        ledger.script(TxOutcome::failed(TxErrorKind::Network, "rpc timeout"));

        let result = engine
            .purchase(PurchaseRequest {
                listing_id,
                quantity: 100.0,
                buyer_wallet: "0xbuyer".to_string(),
            })
            .await
            .unwrap();
        assert!(!result.outcome.success);
        // Availability is not lost to a failed purchase.
        assert_eq!(result.listing.credits_available, 500.0);
        assert_eq!(result.listing.status, ListingStatus::Active);
    }

    #[tokio::test]
    async fn oversell_is_rejected_before_the_ledger() {
        let (ledger, _, engine, listing_id) = listed_engine(500.0).await;
        let writes_before = ledger.writes();

        let err = engine
            .purchase(PurchaseRequest {
                listing_id: listing_id.clone(),
                quantity: 600.0,
                buyer_wallet: "0xbuyer".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(ledger.writes(), writes_before);

        let listing = db::get_listing(engine.controller.pool(), &listing_id)
            .await
            .unwrap()
            .unwrap();
        assert_eq!(listing.credits_available, 500.0);
    }

    #[tokio::test]
    async fn sellout_marks_listing_sold_and_settles_project() {
        let (_, controller, engine, listing_id) = listed_engine(500.0).await;
        let result = engine
            .purchase(PurchaseRequest {
                listing_id,
                quantity: 500.0,
                buyer_wallet: "0xbuyer".to_string(),
            })
            .await
            .unwrap();
        assert_eq!(result.listing.status, ListingStatus::Sold);

        let project = db::get_project(controller.pool(), "p1").await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::Settled);
    }

    #[tokio::test]
    async fn purchase_on_sold_listing_is_rejected() {
        let (_, _, engine, listing_id) = listed_engine(100.0).await;
        engine
            .purchase(PurchaseRequest {
                listing_id: listing_id.clone(),
                quantity: 100.0,
                buyer_wallet: "0xbuyer".to_string(),
            })
            .await
            .unwrap();

        let err = engine
            .purchase(PurchaseRequest {
                listing_id,
                quantity: 1.0,
                buyer_wallet: "0xbuyer".to_string(),
            })
            .await
            .unwrap_err();
        assert!(matches!(err, PipelineError::State(_)));
    }
}
