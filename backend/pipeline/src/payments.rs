//! Payment distributor — idempotent revenue-share transfers.
//!
//! Every transfer gets a durable row keyed by an idempotency key *before*
//! the ledger sees it. A retry with the same key first checks for a
//! recorded tx hash and returns the prior result instead of resubmitting,
//! so a transfer reaches the ledger at most once no matter how many times a
//! caller retries after lost responses.

use std::sync::Arc;

use sqlx::SqlitePool;
use tracing::info;
use uuid::Uuid;

use mrv_protocol::{PaymentTransfer, TransferStatus};

use crate::db;
use crate::errors::{PipelineError, Result};
use crate::ledger::Ledger;
use crate::lifecycle::WriteGate;

pub struct TransferRequest {
    pub from_wallet: String,
    pub to_wallet: String,
    pub amount: f64,
    pub token_type: String,
    pub purpose: String,
    /// Caller-supplied key for safe retries; generated when omitted.
    pub idempotency_key: Option<String>,
}

pub struct PaymentDistributor<L> {
    pool: SqlitePool,
    ledger: Arc<L>,
    write_gate: WriteGate,
}

impl<L: Ledger> PaymentDistributor<L> {
    pub fn new(pool: SqlitePool, ledger: Arc<L>, write_gate: WriteGate) -> Self {
        Self {
            pool,
            ledger,
            write_gate,
        }
    }

    /// Submit (or resume) a transfer. The returned record carries the final
    /// status; a `Failed` record with no tx hash may be retried with the
    /// same key.
    pub async fn transfer(&self, req: TransferRequest) -> Result<PaymentTransfer> {
        if req.amount <= 0.0 {
            return Err(PipelineError::Validation("transfer amount must be positive".to_string()));
        }
        if req.from_wallet.trim().is_empty() || req.to_wallet.trim().is_empty() {
            return Err(PipelineError::Validation("from_wallet and to_wallet are required".to_string()));
        }

        let key = req
            .idempotency_key
            .clone()
            .unwrap_or_else(|| Uuid::new_v4().to_string());

        let record = match db::transfer_by_key(&self.pool, &key).await? {
            Some(existing) if existing.tx_hash.is_some() => {
                // Already submitted once; never double-spend on retry.
                info!("transfer {} already submitted ({})", key, existing.tx_hash.as_deref().unwrap());
                return Ok(existing);
            }
            Some(existing) => existing,
            None => {
                let record = PaymentTransfer {
                    transfer_id: Uuid::new_v4().to_string(),
                    from_wallet: req.from_wallet.clone(),
                    to_wallet: req.to_wallet.clone(),
                    amount: req.amount,
                    token_type: req.token_type.clone(),
                    purpose: req.purpose.clone(),
                    status: TransferStatus::Pending,
                    tx_hash: None,
                    idempotency_key: key.clone(),
                    created_at: db::unix_now(),
                };
                db::insert_transfer(&self.pool, &record).await?;
                record
            }
        };

        let balance = self.ledger.balance_of(&record.from_wallet).await?;
        if balance < record.amount {
            db::update_transfer(&self.pool, &record.transfer_id, TransferStatus::Failed, None).await?;
            return Err(PipelineError::Validation(format!(
                "insufficient balance: {} < {}",
                balance, record.amount
            )));
        }

        let outcome = {
            let _gate = self.write_gate.lock().await;
            self.ledger.transfer(&record.to_wallet, record.amount).await
        };

        let (status, tx_hash) = if outcome.success {
            (TransferStatus::Completed, outcome.tx_hash.clone())
        } else {
            (TransferStatus::Failed, None)
        };
        db::update_transfer(&self.pool, &record.transfer_id, status, tx_hash.as_deref()).await?;

        Ok(PaymentTransfer {
            status,
            tx_hash,
            ..record
        })
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::db::test_pool;
    use crate::ledger::mock::MockLedger;
    use crate::ledger::{TxErrorKind, TxOutcome};
    use tokio::sync::Mutex;

    async fn distributor() -> (Arc<MockLedger>, PaymentDistributor<MockLedger>) {
        let pool = test_pool().await;
        let ledger = Arc::new(MockLedger::new());
        let distributor = PaymentDistributor::new(pool, ledger.clone(), Arc::new(Mutex::new(())));
        (ledger, distributor)
    }

    fn request(key: Option<&str>) -> TransferRequest {
        TransferRequest {
            from_wallet: "0xplatform".to_string(),
            to_wallet: "0xcommunity".to_string(),
            amount: 250.0,
            token_type: "BCC".to_string(),
            purpose: "revenue-share".to_string(),
            idempotency_key: key.map(String::from),
        }
    }

    #[tokio::test]
    async fn successful_transfer_completes_with_hash() {
        let (_, distributor) = distributor().await;
        let record = distributor.transfer(request(Some("key-1"))).await.unwrap();
        assert_eq!(record.status, TransferStatus::Completed);
        assert!(record.tx_hash.is_some());
    }

    #[tokio::test]
    async fn retry_after_success_does_not_resubmit() {
        let (ledger, distributor) = distributor().await;
        let first = distributor.transfer(request(Some("key-1"))).await.unwrap();
        assert_eq!(ledger.writes(), 1);

        let second = distributor.transfer(request(Some("key-1"))).await.unwrap();
        assert_eq!(second.tx_hash, first.tx_hash);
        assert_eq!(second.transfer_id, first.transfer_id);
        assert_eq!(ledger.writes(), 1, "a recorded tx hash must never be resubmitted");
    }

    #[tokio::test]
    async fn retry_after_network_failure_resumes_same_record() {
        let (ledger, distributor) = distributor().await;
        ledger.script(TxOutcome::failed(TxErrorKind::Network, "rpc timeout"));

        let failed = distributor.transfer(request(Some("key-1"))).await.unwrap();
        assert_eq!(failed.status, TransferStatus::Failed);
        assert!(failed.tx_hash.is_none());

        let retried = distributor.transfer(request(Some("key-1"))).await.unwrap();
        assert_eq!(retried.status, TransferStatus::Completed);
        assert_eq!(retried.transfer_id, failed.transfer_id, "retry resumes the durable record");

        // One durable row, one eventual ledger transfer.
        let stored = db::transfer_by_key(&distributor.pool, "key-1").await.unwrap().unwrap();
        assert_eq!(stored.status, TransferStatus::Completed);
    }

    #[tokio::test]
    async fn insufficient_balance_never_reaches_the_ledger() {
        let (ledger, distributor) = distributor().await;
        ledger
            .balances
            .lock()
            .unwrap()
            .insert("0xplatform".to_string(), 10.0);

        let err = distributor.transfer(request(Some("key-1"))).await.unwrap_err();
        assert!(matches!(err, PipelineError::Validation(_)));
        assert_eq!(ledger.writes(), 0);
    }

    #[tokio::test]
    async fn missing_key_gets_generated() {
        let (_, distributor) = distributor().await;
        let record = distributor.transfer(request(None)).await.unwrap();
        assert!(!record.idempotency_key.is_empty());
    }
}
