//! Ledger access layer.
//!
//! [`Ledger`] is the single seam between the pipeline and the chain: the
//! lifecycle controller, marketplace, payment distributor, and
//! reconciliation service all go through it and know nothing about wallets
//! or RPC. The production implementation is [`rpc::JsonRpcLedger`]; tests
//! use a scripted mock.
//!
//! Write operations never raise for on-chain failures — they return a
//! uniform [`TxOutcome`] so callers can persist partial failure and stay
//! retry-eligible. `TxOutcome.tx_hash` is a *submitted-transaction* receipt,
//! not a confirmation; confirmation arrives through the event stream or
//! reconciliation.

pub mod events;
pub mod rpc;

use std::fmt;

use async_trait::async_trait;
use serde_json::Value;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;

use crate::errors::Result;

/// Classified ledger failure.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum TxErrorKind {
    /// No wallet/provider reachable. Not retryable.
    WalletUnavailable,
    /// The user declined the wallet prompt. Not retryable; the operation is
    /// cancelled and project state is unchanged.
    UserRejected,
    /// Connected to the wrong network and the switch was refused.
    /// Retryable after a successful switch.
    WrongNetwork,
    /// RPC timeout or connectivity failure. Retryable with backoff; safe
    /// because writes are checked for a prior tx hash before resubmission.
    Network,
    /// The chain rejected the transaction; carries the revert reason.
    /// Not retried automatically.
    ContractRevert,
}

impl TxErrorKind {
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::WalletUnavailable => "wallet_unavailable",
            Self::UserRejected => "user_rejected",
            Self::WrongNetwork => "wrong_network",
            Self::Network => "network",
            Self::ContractRevert => "contract_revert",
        }
    }

    pub fn retryable(&self) -> bool {
        matches!(self, Self::Network | Self::WrongNetwork)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TxError {
    pub kind: TxErrorKind,
    pub message: String,
}

impl TxError {
    pub fn new(kind: TxErrorKind, message: impl Into<String>) -> Self {
        Self {
            kind,
            message: message.into(),
        }
    }
}

impl fmt::Display for TxError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}: {}", self.kind.as_str(), self.message)
    }
}

/// Uniform result of a ledger write.
#[derive(Debug, Clone, PartialEq)]
pub struct TxOutcome {
    pub success: bool,
    pub tx_hash: Option<String>,
    pub block_number: Option<i64>,
    pub error: Option<TxError>,
}

impl TxOutcome {
    pub fn submitted(tx_hash: impl Into<String>, block_number: Option<i64>) -> Self {
        Self {
            success: true,
            tx_hash: Some(tx_hash.into()),
            block_number,
            error: None,
        }
    }

    pub fn failed(kind: TxErrorKind, message: impl Into<String>) -> Self {
        Self {
            success: false,
            tx_hash: None,
            block_number: None,
            error: Some(TxError::new(kind, message)),
        }
    }
}

/// The process-wide wallet session. One per process; `connect` coalesces
/// concurrent requests into a single in-flight wallet prompt.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct WalletSession {
    pub account: String,
    pub chain_id: u64,
}

/// Registration payload for the registry contract.
#[derive(Debug, Clone, PartialEq)]
pub struct RegisterProject {
    pub project_id: String,
    pub owner_wallet: String,
    pub name: String,
    pub area_hectares: f64,
    /// Content hash of the evidence bundle, if any.
    pub evidence_hash: Option<String>,
}

/// The registry's view of a project, including the registering transaction.
#[derive(Debug, Clone, PartialEq)]
pub struct OnChainProject {
    pub project_id: String,
    pub owner_wallet: String,
    pub registered_tx_hash: String,
    pub block_number: i64,
    pub approved: bool,
    pub credits_issued: f64,
}

/// Recognised registry / credit-token event kinds.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LedgerEventKind {
    ProjectRegistered,
    ProjectApproved,
    CreditsMinted,
    CreditsTransferred,
    Unknown,
}

impl LedgerEventKind {
    /// Parse the event name delivered by the provider.
    pub fn from_topic(topic: &str) -> Self {
        match topic {
            "ProjectRegistered" => Self::ProjectRegistered,
            "ProjectApproved" => Self::ProjectApproved,
            "CreditsMinted" => Self::CreditsMinted,
            "CreditsTransferred" => Self::CreditsTransferred,
            _ => Self::Unknown,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Self::ProjectRegistered => "project_registered",
            Self::ProjectApproved => "project_approved",
            Self::CreditsMinted => "credits_minted",
            Self::CreditsTransferred => "credits_transferred",
            Self::Unknown => "unknown",
        }
    }
}

/// A decoded ledger event. Delivery is at-least-once: the same event can
/// arrive again after a reorg or resubscribe, so consumers deduplicate by
/// `(tx_hash, kind)` before applying it.
#[derive(Debug, Clone, PartialEq)]
pub struct LedgerEvent {
    pub kind: LedgerEventKind,
    pub project_id: Option<String>,
    pub tx_hash: String,
    pub block_number: i64,
    pub payload: Value,
}

/// Port over all ledger operations. No project business rules live here.
#[async_trait]
pub trait Ledger: Send + Sync + 'static {
    /// Request (or reuse) the wallet session, switching to the expected
    /// network. Concurrent calls coalesce into one pending request.
    async fn connect(&self) -> Result<WalletSession>;

    async fn register_project(&self, req: &RegisterProject) -> TxOutcome;

    async fn approve_project(&self, project_id: &str) -> TxOutcome;

    async fn mint(&self, to: &str, amount: f64, project_id: &str, batch_id: &str) -> TxOutcome;

    async fn transfer(&self, to: &str, amount: f64) -> TxOutcome;

    async fn get_project(&self, project_id: &str) -> Result<Option<OnChainProject>>;

    async fn balance_of(&self, address: &str) -> Result<f64>;

    async fn total_supply(&self) -> Result<f64>;

    /// Long-lived event stream. The background poller stops when `cancel`
    /// fires; the receiver then drains and closes.
    fn subscribe_events(&self, cancel: CancellationToken) -> mpsc::Receiver<LedgerEvent>;
}

#[cfg(test)]
pub mod mock {
    //! Scripted ledger double for controller/service tests.

    use std::collections::{HashMap, VecDeque};
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::Mutex;

    use super::*;
    use crate::errors::PipelineError;

    #[derive(Default)]
    pub struct MockLedger {
        /// Pre-scripted outcomes for the next write calls; a successful
        /// submission with a fresh hash is synthesized when empty.
        pub outcomes: Mutex<VecDeque<TxOutcome>>,
        pub write_calls: AtomicUsize,
        pub projects: Mutex<HashMap<String, OnChainProject>>,
        pub balances: Mutex<HashMap<String, f64>>,
        pub connect_failure: Mutex<Option<TxError>>,
    }

    impl MockLedger {
        pub fn new() -> Self {
            Self::default()
        }

        pub fn script(&self, outcome: TxOutcome) {
            self.outcomes.lock().unwrap().push_back(outcome);
        }

        pub fn writes(&self) -> usize {
            self.write_calls.load(Ordering::SeqCst)
        }

        fn next_outcome(&self) -> TxOutcome {
            self.write_calls.fetch_add(1, Ordering::SeqCst);
            self.outcomes.lock().unwrap().pop_front().unwrap_or_else(|| {
                TxOutcome::submitted(format!("0x{}", uuid::Uuid::new_v4().simple()), Some(1))
            })
        }
    }

    #[async_trait]
    impl Ledger for MockLedger {
        async fn connect(&self) -> Result<WalletSession> {
            if let Some(err) = self.connect_failure.lock().unwrap().clone() {
                return Err(PipelineError::Ledger(err));
            }
            Ok(WalletSession {
                account: "0xmock".to_string(),
                chain_id: 31337,
            })
        }

        async fn register_project(&self, req: &RegisterProject) -> TxOutcome {
            let outcome = self.next_outcome();
            if outcome.success {
                let onchain = OnChainProject {
                    project_id: req.project_id.clone(),
                    owner_wallet: req.owner_wallet.clone(),
                    registered_tx_hash: outcome.tx_hash.clone().unwrap(),
                    block_number: outcome.block_number.unwrap_or(1),
                    approved: false,
                    credits_issued: 0.0,
                };
                self.projects
                    .lock()
                    .unwrap()
                    .insert(req.project_id.clone(), onchain);
            }
            outcome
        }

        async fn approve_project(&self, project_id: &str) -> TxOutcome {
            let outcome = self.next_outcome();
            if outcome.success {
                if let Some(p) = self.projects.lock().unwrap().get_mut(project_id) {
                    p.approved = true;
                }
            }
            outcome
        }

        async fn mint(&self, _to: &str, amount: f64, project_id: &str, _batch_id: &str) -> TxOutcome {
            let outcome = self.next_outcome();
            if outcome.success {
                if let Some(p) = self.projects.lock().unwrap().get_mut(project_id) {
                    p.credits_issued += amount;
                }
            }
            outcome
        }

        async fn transfer(&self, _to: &str, _amount: f64) -> TxOutcome {
            self.next_outcome()
        }

        async fn get_project(&self, project_id: &str) -> Result<Option<OnChainProject>> {
            Ok(self.projects.lock().unwrap().get(project_id).cloned())
        }

        async fn balance_of(&self, address: &str) -> Result<f64> {
            Ok(self
                .balances
                .lock()
                .unwrap()
                .get(address)
                .copied()
                .unwrap_or(1_000_000.0))
        }

        async fn total_supply(&self) -> Result<f64> {
            Ok(self.projects.lock().unwrap().values().map(|p| p.credits_issued).sum())
        }

        fn subscribe_events(&self, _cancel: CancellationToken) -> mpsc::Receiver<LedgerEvent> {
            let (_tx, rx) = mpsc::channel(1);
            rx
        }
    }
}
