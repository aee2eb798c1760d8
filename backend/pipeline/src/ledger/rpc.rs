//! JSON-RPC ledger client.
//!
//! Talks to a wallet-bridge/provider gateway: the wallet methods
//! (`eth_requestAccounts`, `wallet_switchEthereumChain`,
//! `wallet_addEthereumChain`) plus the registry and credit-token contract
//! methods exposed as named JSON-RPC calls (`registerProject`, `getProject`,
//! `approveProject`, `mint`, `balanceOf`, `totalSupply`, `transfer`,
//! `getEvents`). ABI encoding lives behind the gateway; network parameters
//! and contract addresses are configuration.
//!
//! ## Resilience
//!
//! * Read calls retry transient failures with exponential back-off, up to
//!   [`MAX_BACKOFF_SECS`] seconds between attempts.
//! * Write calls never auto-retry: the caller owns the durable retry record
//!   and must check for a prior tx hash before resubmitting.
//! * Wallet prompts can sit open indefinitely — there is no client-side
//!   timeout on write submission beyond the transport's.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use reqwest::Client;
use serde::Deserialize;
use serde_json::{json, Value};
use tokio::sync::{mpsc, Mutex};
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use crate::config::Config;
use crate::errors::{PipelineError, Result};

use super::{
    Ledger, LedgerEvent, LedgerEventKind, OnChainProject, RegisterProject, TxError, TxErrorKind,
    TxOutcome, WalletSession,
};

const MAX_BACKOFF_SECS: u64 = 60;
const INITIAL_BACKOFF_SECS: u64 = 2;
/// Bounded retries for read calls; writes are never auto-retried.
const MAX_READ_ATTEMPTS: u32 = 5;

// ─────────────────────────────────────────────────────────
// JSON-RPC envelope
// ─────────────────────────────────────────────────────────

#[derive(Debug, Deserialize)]
struct RpcResponse {
    result: Option<Value>,
    error: Option<RpcError>,
}

#[derive(Debug, Deserialize)]
pub struct RpcError {
    pub code: i64,
    pub message: String,
}

/// Map a provider error to the failure taxonomy.
///
/// EIP-1193 / EIP-1474 codes: 4001 user rejected, 4900/4901 provider or
/// chain disconnected, 4902 unrecognized chain. Revert reasons arrive as
/// `execution reverted[: reason]` server errors.
pub fn map_rpc_error(code: i64, message: &str) -> TxError {
    let kind = match code {
        4001 => TxErrorKind::UserRejected,
        4900 | 4901 => TxErrorKind::WalletUnavailable,
        4902 => TxErrorKind::WrongNetwork,
        _ if message.to_ascii_lowercase().contains("revert") => TxErrorKind::ContractRevert,
        _ => TxErrorKind::Network,
    };
    TxError::new(kind, format!("RPC error {code}: {message}"))
}

// ─────────────────────────────────────────────────────────
// Client
// ─────────────────────────────────────────────────────────

pub struct JsonRpcLedger {
    client: Client,
    config: Arc<Config>,
    /// Holding this across the wallet handshake coalesces concurrent
    /// `connect` calls into a single pending request.
    session: Mutex<Option<WalletSession>>,
    req_id: AtomicU64,
}

impl JsonRpcLedger {
    pub fn new(client: Client, config: Arc<Config>) -> Self {
        Self {
            client,
            config,
            session: Mutex::new(None),
            req_id: AtomicU64::new(1),
        }
    }

    async fn call_once(&self, method: &str, params: Value) -> std::result::Result<Value, TxError> {
        let id = self.req_id.fetch_add(1, Ordering::Relaxed);
        let response = self
            .client
            .post(&self.config.rpc_url)
            .json(&json!({
                "jsonrpc": "2.0",
                "id": id,
                "method": method,
                "params": params,
            }))
            .send()
            .await
            .map_err(|e| TxError::new(TxErrorKind::Network, e.to_string()))?;

        if response.status() == reqwest::StatusCode::TOO_MANY_REQUESTS {
            return Err(TxError::new(TxErrorKind::Network, "rate-limited by provider"));
        }

        let body: RpcResponse = response
            .json()
            .await
            .map_err(|e| TxError::new(TxErrorKind::Network, e.to_string()))?;

        if let Some(err) = body.error {
            return Err(map_rpc_error(err.code, &err.message));
        }

        body.result
            .ok_or_else(|| TxError::new(TxErrorKind::Network, format!("empty result from {method}")))
    }

    /// Read call with bounded exponential back-off on transient failures.
    async fn read(&self, method: &str, params: Value) -> Result<Value> {
        let mut backoff = INITIAL_BACKOFF_SECS;
        let mut attempt = 0;
        loop {
            match self.call_once(method, params.clone()).await {
                Ok(value) => return Ok(value),
                Err(err) if err.kind == TxErrorKind::Network && attempt + 1 < MAX_READ_ATTEMPTS => {
                    attempt += 1;
                    warn!("{method} failed (attempt {attempt}, retry in {backoff}s): {err}");
                    tokio::time::sleep(Duration::from_secs(backoff)).await;
                    backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                }
                Err(err) => return Err(PipelineError::Ledger(err)),
            }
        }
    }

    /// Write submission. Blocks until the wallet returns a submitted-tx
    /// receipt (or declines); returns the uniform outcome either way.
    async fn write(&self, method: &str, params: Value) -> TxOutcome {
        if let Err(e) = self.connect().await {
            return match e {
                PipelineError::Ledger(err) => TxOutcome {
                    success: false,
                    tx_hash: None,
                    block_number: None,
                    error: Some(err),
                },
                other => TxOutcome::failed(TxErrorKind::Network, other.to_string()),
            };
        }

        match self.call_once(method, params).await {
            Ok(value) => {
                let tx_hash = value
                    .get("txHash")
                    .and_then(|v| v.as_str())
                    .map(String::from);
                let block_number = value.get("blockNumber").and_then(|v| v.as_i64());
                match tx_hash {
                    Some(hash) => {
                        debug!("{method} submitted: {hash}");
                        TxOutcome::submitted(hash, block_number)
                    }
                    None => TxOutcome::failed(
                        TxErrorKind::Network,
                        format!("{method} returned no txHash"),
                    ),
                }
            }
            Err(err) => TxOutcome {
                success: false,
                tx_hash: None,
                block_number: None,
                error: Some(err),
            },
        }
    }

    /// Switch the wallet to the configured chain, adding it when unknown.
    async fn ensure_network(&self) -> std::result::Result<(), TxError> {
        let chain_hex = format!("0x{:x}", self.config.chain_id);
        let switch = self
            .call_once(
                "wallet_switchEthereumChain",
                json!([{ "chainId": chain_hex }]),
            )
            .await;

        match switch {
            Ok(_) => Ok(()),
            Err(err) if err.kind == TxErrorKind::WrongNetwork => {
                // Chain unknown to the wallet: add it, then switch again.
                self.call_once(
                    "wallet_addEthereumChain",
                    json!([{
                        "chainId": chain_hex,
                        "rpcUrls": [self.config.rpc_url],
                        "blockExplorerUrls": [self.config.explorer_url],
                    }]),
                )
                .await?;
                self.call_once(
                    "wallet_switchEthereumChain",
                    json!([{ "chainId": chain_hex }]),
                )
                .await
                .map(|_| ())
            }
            Err(err) => Err(err),
        }
    }
}

#[async_trait]
impl Ledger for JsonRpcLedger {
    async fn connect(&self) -> Result<WalletSession> {
        let mut guard = self.session.lock().await;
        if let Some(session) = guard.as_ref() {
            return Ok(session.clone());
        }

        // A transport failure here means no provider is reachable at all.
        let accounts = self
            .call_once("eth_requestAccounts", json!([]))
            .await
            .map_err(|err| {
                let kind = if err.kind == TxErrorKind::Network {
                    TxErrorKind::WalletUnavailable
                } else {
                    err.kind
                };
                PipelineError::Ledger(TxError::new(kind, err.message))
            })?;
        let account = accounts
            .as_array()
            .and_then(|a| a.first())
            .and_then(|v| v.as_str())
            .ok_or_else(|| {
                PipelineError::Ledger(TxError::new(
                    TxErrorKind::WalletUnavailable,
                    "provider returned no accounts",
                ))
            })?
            .to_string();

        // Whatever kept the wallet off the expected chain, the session is
        // on the wrong network; retryable once a switch succeeds.
        self.ensure_network().await.map_err(|err| {
            PipelineError::Ledger(TxError::new(TxErrorKind::WrongNetwork, err.message))
        })?;

        let session = WalletSession {
            account,
            chain_id: self.config.chain_id,
        };
        *guard = Some(session.clone());
        Ok(session)
    }

    async fn register_project(&self, req: &RegisterProject) -> TxOutcome {
        self.write(
            "registerProject",
            json!([{
                "contract": self.config.registry_address,
                "projectId": req.project_id,
                "owner": req.owner_wallet,
                "name": req.name,
                "areaHectares": req.area_hectares,
                "evidenceHash": req.evidence_hash,
            }]),
        )
        .await
    }

    async fn approve_project(&self, project_id: &str) -> TxOutcome {
        self.write(
            "approveProject",
            json!([{
                "contract": self.config.registry_address,
                "projectId": project_id,
            }]),
        )
        .await
    }

    async fn mint(&self, to: &str, amount: f64, project_id: &str, batch_id: &str) -> TxOutcome {
        self.write(
            "mint",
            json!([{
                "contract": self.config.token_address,
                "to": to,
                "amount": amount,
                "projectId": project_id,
                "batchId": batch_id,
            }]),
        )
        .await
    }

    async fn transfer(&self, to: &str, amount: f64) -> TxOutcome {
        self.write(
            "transfer",
            json!([{
                "contract": self.config.token_address,
                "to": to,
                "amount": amount,
            }]),
        )
        .await
    }

    async fn get_project(&self, project_id: &str) -> Result<Option<OnChainProject>> {
        let value = self
            .read(
                "getProject",
                json!([{
                    "contract": self.config.registry_address,
                    "projectId": project_id,
                }]),
            )
            .await?;

        if value.is_null() {
            return Ok(None);
        }
        Ok(Some(decode_onchain_project(&value)?))
    }

    async fn balance_of(&self, address: &str) -> Result<f64> {
        let value = self
            .read(
                "balanceOf",
                json!([{
                    "contract": self.config.token_address,
                    "address": address,
                }]),
            )
            .await?;
        decode_amount(&value)
            .ok_or_else(|| PipelineError::Ledger(TxError::new(TxErrorKind::Network, "bad balance")))
    }

    async fn total_supply(&self) -> Result<f64> {
        let value = self
            .read(
                "totalSupply",
                json!([{ "contract": self.config.token_address }]),
            )
            .await?;
        decode_amount(&value)
            .ok_or_else(|| PipelineError::Ledger(TxError::new(TxErrorKind::Network, "bad supply")))
    }

    fn subscribe_events(&self, cancel: CancellationToken) -> mpsc::Receiver<LedgerEvent> {
        let (tx, rx) = mpsc::channel(256);
        let client = self.client.clone();
        let config = self.config.clone();
        tokio::spawn(super::events::poll_events(client, config, tx, cancel));
        rx
    }
}

// ─────────────────────────────────────────────────────────
// Decoding
// ─────────────────────────────────────────────────────────

fn decode_onchain_project(value: &Value) -> Result<OnChainProject> {
    let field = |key: &str| -> Result<String> {
        value
            .get(key)
            .and_then(|v| v.as_str())
            .map(String::from)
            .ok_or_else(|| {
                PipelineError::Ledger(TxError::new(
                    TxErrorKind::Network,
                    format!("getProject result missing {key}"),
                ))
            })
    };

    Ok(OnChainProject {
        project_id: field("projectId")?,
        owner_wallet: field("owner")?,
        registered_tx_hash: field("txHash")?,
        block_number: value.get("blockNumber").and_then(|v| v.as_i64()).unwrap_or(0),
        approved: value.get("approved").and_then(|v| v.as_bool()).unwrap_or(false),
        credits_issued: value
            .get("creditsIssued")
            .and_then(decode_amount_opt)
            .unwrap_or(0.0),
    })
}

/// Amounts arrive as JSON numbers or decimal strings depending on provider.
fn decode_amount(value: &Value) -> Option<f64> {
    decode_amount_opt(value)
}

fn decode_amount_opt(value: &Value) -> Option<f64> {
    match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.parse().ok(),
        _ => None,
    }
}

/// Decode one raw event object from `getEvents`.
pub fn decode_event(raw: &Value) -> Option<LedgerEvent> {
    let name = raw.get("event").and_then(|v| v.as_str())?;
    let tx_hash = raw.get("txHash").and_then(|v| v.as_str())?.to_string();
    let kind = LedgerEventKind::from_topic(name);
    let payload = raw.get("args").cloned().unwrap_or(Value::Null);
    let project_id = payload
        .get("projectId")
        .and_then(|v| match v {
            Value::String(s) => Some(s.clone()),
            Value::Number(n) => Some(n.to_string()),
            _ => None,
        });

    Some(LedgerEvent {
        kind,
        project_id,
        tx_hash,
        block_number: raw.get("blockNumber").and_then(|v| v.as_i64()).unwrap_or(0),
        payload,
    })
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn user_rejection_maps_to_user_rejected() {
        let err = map_rpc_error(4001, "User rejected the request");
        assert_eq!(err.kind, TxErrorKind::UserRejected);
        assert!(!err.kind.retryable());
    }

    #[test]
    fn disconnected_provider_maps_to_wallet_unavailable() {
        assert_eq!(map_rpc_error(4900, "disconnected").kind, TxErrorKind::WalletUnavailable);
        assert_eq!(map_rpc_error(4901, "chain disconnected").kind, TxErrorKind::WalletUnavailable);
    }

    #[test]
    fn unrecognized_chain_maps_to_wrong_network() {
        let err = map_rpc_error(4902, "Unrecognized chain ID");
        assert_eq!(err.kind, TxErrorKind::WrongNetwork);
        assert!(err.kind.retryable());
    }

    #[test]
    fn revert_maps_to_contract_revert() {
        let err = map_rpc_error(-32000, "execution reverted: caller is not approver");
        assert_eq!(err.kind, TxErrorKind::ContractRevert);
        assert!(!err.kind.retryable());
    }

    #[test]
    fn server_errors_map_to_network() {
        let err = map_rpc_error(-32005, "request limit exceeded");
        assert_eq!(err.kind, TxErrorKind::Network);
        assert!(err.kind.retryable());
    }

    #[test]
    fn decode_registered_event() {
        let raw = serde_json::json!({
            "event": "ProjectRegistered",
            "txHash": "0xabc",
            "blockNumber": 42,
            "args": { "projectId": "proj-1", "owner": "0xowner" },
        });
        let event = decode_event(&raw).unwrap();
        assert_eq!(event.kind, LedgerEventKind::ProjectRegistered);
        assert_eq!(event.project_id.as_deref(), Some("proj-1"));
        assert_eq!(event.tx_hash, "0xabc");
        assert_eq!(event.block_number, 42);
    }

    #[test]
    fn decode_event_without_hash_is_dropped() {
        let raw = serde_json::json!({ "event": "ProjectRegistered", "args": {} });
        assert!(decode_event(&raw).is_none());
    }

    #[test]
    fn unknown_event_kind_is_preserved() {
        let raw = serde_json::json!({ "event": "SomethingElse", "txHash": "0x1" });
        assert_eq!(decode_event(&raw).unwrap().kind, LedgerEventKind::Unknown);
    }

    #[test]
    fn amounts_decode_from_number_and_string() {
        assert_eq!(decode_amount(&serde_json::json!(12.5)), Some(12.5));
        assert_eq!(decode_amount(&serde_json::json!("340.25")), Some(340.25));
        assert_eq!(decode_amount(&serde_json::json!(null)), None);
    }
}
