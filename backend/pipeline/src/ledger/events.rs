//! Ledger event stream — background poller and deduplicating consumer.
//!
//! The poller fetches decoded registry/token events from the provider and
//! feeds a bounded channel; it stops when the cancellation token fires or
//! the consumer goes away. Delivery is at-least-once (reorgs, resubscribes,
//! restarts all cause redelivery), so the consumer deduplicates by
//! `(tx_hash, kind)` — in memory for the session, and through the
//! `ledger_events` UNIQUE key across restarts — before applying anything to
//! project state.

use std::collections::HashSet;
use std::sync::Arc;
use std::time::Duration;

use reqwest::Client;
use serde_json::{json, Value};
use sqlx::SqlitePool;
use tokio::sync::mpsc;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use crate::config::Config;
use crate::db;
use crate::errors::{PipelineError, Result};
use crate::ledger::rpc::decode_event;
use crate::ledger::{Ledger, LedgerEvent, LedgerEventKind};
use crate::lifecycle::LifecycleController;

const MAX_BACKOFF_SECS: u64 = 60;
const INITIAL_BACKOFF_SECS: u64 = 2;

/// Actor recorded for transitions driven by observed ledger events.
const EVENT_ACTOR: &str = "ledger-event";

// ─────────────────────────────────────────────────────────
// Poller
// ─────────────────────────────────────────────────────────

/// Poll the provider for contract events and forward them to `tx`.
pub async fn poll_events(
    client: Client,
    config: Arc<Config>,
    tx: mpsc::Sender<LedgerEvent>,
    cancel: CancellationToken,
) {
    let mut from_block = config.start_block as i64;
    let mut backoff = INITIAL_BACKOFF_SECS;
    info!("event poller starting from block {from_block}");

    loop {
        if cancel.is_cancelled() {
            break;
        }

        let delay = match fetch_page(&client, &config, from_block).await {
            Ok((events, latest_block)) => {
                backoff = INITIAL_BACKOFF_SECS;
                if !events.is_empty() {
                    debug!("fetched {} ledger events", events.len());
                }
                for event in events {
                    if tx.send(event).await.is_err() {
                        // Consumer gone; nothing left to do.
                        return;
                    }
                }
                if let Some(latest) = latest_block {
                    from_block = from_block.max(latest);
                }
                Duration::from_secs(config.events_poll_interval_secs)
            }
            Err(msg) => {
                warn!("event poll failed (retry in {backoff}s): {msg}");
                let delay = Duration::from_secs(backoff);
                backoff = (backoff * 2).min(MAX_BACKOFF_SECS);
                delay
            }
        };

        tokio::select! {
            _ = cancel.cancelled() => break,
            _ = tokio::time::sleep(delay) => {}
        }
    }
    info!("event poller stopped");
}

/// Fetch one page of decoded events.
///
/// Returns `(events, latest_block)`.
async fn fetch_page(
    client: &Client,
    config: &Config,
    from_block: i64,
) -> std::result::Result<(Vec<LedgerEvent>, Option<i64>), String> {
    let response = client
        .post(&config.rpc_url)
        .json(&json!({
            "jsonrpc": "2.0",
            "id": 1,
            "method": "getEvents",
            "params": [{
                "contracts": [config.registry_address, config.token_address],
                "fromBlock": from_block,
                "limit": config.events_per_page,
            }],
        }))
        .send()
        .await
        .map_err(|e| e.to_string())?;

    let body: Value = response.json().await.map_err(|e| e.to_string())?;
    if let Some(err) = body.get("error") {
        return Err(err.to_string());
    }
    let result = body
        .get("result")
        .ok_or_else(|| "empty result from getEvents".to_string())?;

    let events = result
        .get("events")
        .and_then(|v| v.as_array())
        .map(|raw| raw.iter().filter_map(decode_event).collect())
        .unwrap_or_default();
    let latest_block = result.get("latestBlock").and_then(|v| v.as_i64());

    Ok((events, latest_block))
}

// ─────────────────────────────────────────────────────────
// Consumer
// ─────────────────────────────────────────────────────────

pub struct EventConsumer<L> {
    pool: SqlitePool,
    controller: Arc<LifecycleController<L>>,
}

impl<L: Ledger> EventConsumer<L> {
    pub fn new(pool: SqlitePool, controller: Arc<LifecycleController<L>>) -> Self {
        Self { pool, controller }
    }

    /// Drain the event channel until it closes.
    pub async fn run(self, mut rx: mpsc::Receiver<LedgerEvent>) {
        let mut seen: HashSet<(String, &'static str)> = HashSet::new();

        while let Some(event) = rx.recv().await {
            if !seen.insert((event.tx_hash.clone(), event.kind.as_str())) {
                continue;
            }
            match db::record_ledger_event(&self.pool, &event).await {
                Ok(true) => {
                    if let Err(e) = self.apply(&event).await {
                        error!("failed to apply event {}: {e}", event.tx_hash);
                    }
                    if let Err(e) = db::save_cursor(&self.pool, event.block_number).await {
                        error!("failed to save event cursor: {e}");
                    }
                }
                Ok(false) => debug!("duplicate event {} ignored", event.tx_hash),
                Err(e) => error!("failed to persist event {}: {e}", event.tx_hash),
            }
        }
    }

    async fn apply(&self, event: &LedgerEvent) -> Result<()> {
        match event.kind {
            LedgerEventKind::ProjectRegistered => {
                let Some(project_id) = event.project_id.as_deref() else {
                    warn!("registration event {} carries no project id", event.tx_hash);
                    return Ok(());
                };
                match self
                    .controller
                    .confirm_registration(project_id, &event.tx_hash, event.block_number, EVENT_ACTOR)
                    .await
                {
                    Ok(true) => info!("registration of {project_id} confirmed by event"),
                    Ok(false) => {}
                    // Conflicts are surfaced by reconciliation, not repaired here.
                    Err(PipelineError::Conflict(msg)) => error!("registration conflict: {msg}"),
                    Err(PipelineError::NotFound(_)) => {
                        warn!("registration event for unknown project {project_id}")
                    }
                    Err(e) => return Err(e),
                }
            }
            LedgerEventKind::ProjectApproved
            | LedgerEventKind::CreditsMinted
            | LedgerEventKind::CreditsTransferred => {
                debug!("{} event for {:?} recorded", event.kind.as_str(), event.project_id);
            }
            LedgerEventKind::Unknown => {}
        }
        Ok(())
    }
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use crate::lifecycle::tests::{approved, setup};
    use mrv_protocol::{BlockchainRegistration, ProjectStatus, RegistrationStatus};

    fn registered_event(tx_hash: &str) -> LedgerEvent {
        LedgerEvent {
            kind: LedgerEventKind::ProjectRegistered,
            project_id: Some("p1".to_string()),
            tx_hash: tx_hash.to_string(),
            block_number: 42,
            payload: serde_json::json!({ "projectId": "p1" }),
        }
    }

    #[tokio::test]
    async fn redelivered_event_is_applied_once() {
        let (_, controller) = setup().await;
        approved(&controller, "p1", 500.0).await;
        // Crash left a Pending row without a hash; the event repairs it.
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

        let (tx, rx) = mpsc::channel(8);
        tx.send(registered_event("0xabc")).await.unwrap();
        tx.send(registered_event("0xabc")).await.unwrap();
        drop(tx);

        let consumer = EventConsumer::new(controller.pool().clone(), controller.clone());
        consumer.run(rx).await;

        let project = db::get_project(controller.pool(), "p1").await.unwrap().unwrap();
        assert_eq!(project.status, ProjectStatus::BlockchainRegistered);

        let reg = db::confirmed_registration(controller.pool(), "p1").await.unwrap().unwrap();
        assert_eq!(reg.tx_hash.as_deref(), Some("0xabc"));

        let confirmations = db::audit_for_project(controller.pool(), "p1")
            .await
            .unwrap()
            .into_iter()
            .filter(|e| e.to == ProjectStatus::BlockchainRegistered)
            .count();
        assert_eq!(confirmations, 1, "redelivery must not re-apply the transition");
        assert_eq!(db::get_last_block(controller.pool()).await.unwrap(), 42);
    }

    #[tokio::test]
    async fn event_for_unknown_project_is_skipped() {
        let (_, controller) = setup().await;
        let (tx, rx) = mpsc::channel(2);
        let mut event = registered_event("0xdef");
        event.project_id = Some("ghost".to_string());
        tx.send(event).await.unwrap();
        drop(tx);

        // Must not panic or poison anything.
        EventConsumer::new(controller.pool().clone(), controller.clone())
            .run(rx)
            .await;
    }
}
