//! Database layer — migrations, queries, and cursor management.
//!
//! Plain runtime-checked `sqlx` queries over SQLite. Status enums are stored
//! as their `as_str` codes; `media_refs` as a JSON array. All writes that
//! back idempotent operations use `INSERT OR IGNORE` plus a UNIQUE key so
//! redelivery is harmless.

use chrono::Utc;
use sqlx::{sqlite::SqlitePoolOptions, Row, SqlitePool};
use tracing::info;

use mrv_protocol::{
    AuditEntry, BlockchainRegistration, CarbonCreditBatch, EcosystemType, ListingStatus,
    MarketplaceListing, PaymentTransfer, Project, ProjectStatus, RegistrationStatus,
    TransferStatus, VerificationRecord, VerificationStage,
};

use crate::errors::Result;
use crate::ledger::LedgerEvent;

/// Establish a SQLite connection pool and run pending migrations.
pub async fn init_pool(database_url: &str) -> Result<SqlitePool> {
    let url = if database_url.starts_with("sqlite:") {
        database_url.to_string()
    } else {
        format!("sqlite:{database_url}")
    };

    let pool = SqlitePoolOptions::new()
        .max_connections(5)
        .connect(&url)
        .await?;

    sqlx::migrate!("./migrations").run(&pool).await?;
    info!("Database migrations applied successfully");
    Ok(pool)
}

/// Pool over a fresh in-memory database, for tests.
#[cfg(test)]
pub async fn test_pool() -> SqlitePool {
    let pool = SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .expect("in-memory sqlite");
    sqlx::migrate!("./migrations").run(&pool).await.expect("migrations");
    pool
}

pub fn unix_now() -> i64 {
    Utc::now().timestamp()
}

fn decode_err(msg: String) -> sqlx::Error {
    sqlx::Error::Decode(msg.into())
}

// ─────────────────────────────────────────────────────────
// Projects
// ─────────────────────────────────────────────────────────

fn row_to_project(row: &sqlx::sqlite::SqliteRow) -> std::result::Result<Project, sqlx::Error> {
    let ecosystem: String = row.try_get("ecosystem")?;
    let status: String = row.try_get("status")?;
    let media_refs: String = row.try_get("media_refs")?;
    Ok(Project {
        id: row.try_get("id")?,
        name: row.try_get("name")?,
        ecosystem: EcosystemType::parse(&ecosystem)
            .ok_or_else(|| decode_err(format!("unknown ecosystem: {ecosystem}")))?,
        area_hectares: row.try_get("area_hectares")?,
        location: row.try_get("location")?,
        owner_wallet: row.try_get("owner_wallet")?,
        status: ProjectStatus::parse(&status)
            .ok_or_else(|| decode_err(format!("unknown status: {status}")))?,
        verification_score: row.try_get("verification_score")?,
        estimated_credits: row.try_get("estimated_credits")?,
        issued_credits: row.try_get("issued_credits")?,
        media_refs: serde_json::from_str(&media_refs)
            .map_err(|e| decode_err(format!("bad media_refs: {e}")))?,
        created_at: row.try_get("created_at")?,
        updated_at: row.try_get("updated_at")?,
    })
}

pub async fn insert_project(pool: &SqlitePool, project: &Project) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO projects
            (id, name, ecosystem, area_hectares, location, owner_wallet, status,
             verification_score, estimated_credits, issued_credits, media_refs,
             created_at, updated_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10, ?11, ?12, ?13)
        "#,
    )
    .bind(&project.id)
    .bind(&project.name)
    .bind(project.ecosystem.as_str())
    .bind(project.area_hectares)
    .bind(&project.location)
    .bind(&project.owner_wallet)
    .bind(project.status.as_str())
    .bind(project.verification_score)
    .bind(project.estimated_credits)
    .bind(project.issued_credits)
    .bind(serde_json::to_string(&project.media_refs)?)
    .bind(project.created_at)
    .bind(project.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

/// Write back every mutable project field (resubmission may revise the
/// descriptive fields too).
pub async fn update_project(pool: &SqlitePool, project: &Project) -> Result<()> {
    sqlx::query(
        r#"
        UPDATE projects
        SET    name = ?2, ecosystem = ?3, area_hectares = ?4, location = ?5,
               status = ?6, verification_score = ?7, estimated_credits = ?8,
               issued_credits = ?9, media_refs = ?10, updated_at = ?11
        WHERE  id = ?1
        "#,
    )
    .bind(&project.id)
    .bind(&project.name)
    .bind(project.ecosystem.as_str())
    .bind(project.area_hectares)
    .bind(&project.location)
    .bind(project.status.as_str())
    .bind(project.verification_score)
    .bind(project.estimated_credits)
    .bind(project.issued_credits)
    .bind(serde_json::to_string(&project.media_refs)?)
    .bind(project.updated_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_project(pool: &SqlitePool, id: &str) -> Result<Option<Project>> {
    let row = sqlx::query("SELECT * FROM projects WHERE id = ?1")
        .bind(id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| row_to_project(&r)).transpose().map_err(Into::into)
}

pub async fn list_projects(pool: &SqlitePool) -> Result<Vec<Project>> {
    let rows = sqlx::query("SELECT * FROM projects ORDER BY created_at ASC, id ASC")
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|r| row_to_project(r).map_err(Into::into))
        .collect()
}

// ─────────────────────────────────────────────────────────
// Verification records
// ─────────────────────────────────────────────────────────

fn row_to_record(row: &sqlx::sqlite::SqliteRow) -> std::result::Result<VerificationRecord, sqlx::Error> {
    let stage: String = row.try_get("stage")?;
    let completed: i64 = row.try_get("completed")?;
    Ok(VerificationRecord {
        project_id: row.try_get("project_id")?,
        stage: VerificationStage::parse(&stage)
            .ok_or_else(|| decode_err(format!("unknown stage: {stage}")))?,
        completed: completed != 0,
        score: row.try_get("score")?,
        decision: row.try_get("decision")?,
        actor: row.try_get("actor")?,
        timestamp: row.try_get("timestamp")?,
    })
}

/// One record per project per stage; re-recording a stage replaces it.
pub async fn upsert_verification_record(pool: &SqlitePool, record: &VerificationRecord) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO verification_records
            (project_id, stage, completed, score, decision, actor, timestamp)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        ON CONFLICT (project_id, stage) DO UPDATE
        SET completed = ?3, score = ?4, decision = ?5, actor = ?6, timestamp = ?7
        "#,
    )
    .bind(&record.project_id)
    .bind(record.stage.as_str())
    .bind(record.completed as i64)
    .bind(record.score)
    .bind(&record.decision)
    .bind(&record.actor)
    .bind(record.timestamp)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn verification_records(pool: &SqlitePool, project_id: &str) -> Result<Vec<VerificationRecord>> {
    let rows = sqlx::query("SELECT * FROM verification_records WHERE project_id = ?1 ORDER BY timestamp ASC")
        .bind(project_id)
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|r| row_to_record(r).map_err(Into::into))
        .collect()
}

/// Drop stage records for a fresh verification round (resubmission).
pub async fn reset_verification_records(pool: &SqlitePool, project_id: &str) -> Result<()> {
    sqlx::query("DELETE FROM verification_records WHERE project_id = ?1")
        .bind(project_id)
        .execute(pool)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Audit trail
// ─────────────────────────────────────────────────────────

pub async fn insert_audit(pool: &SqlitePool, entry: &AuditEntry) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO audit_log
            (project_id, from_status, to_status, actor, timestamp, evidence_ref, note)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&entry.project_id)
    .bind(entry.from.map(|s| s.as_str()))
    .bind(entry.to.as_str())
    .bind(&entry.actor)
    .bind(entry.timestamp)
    .bind(&entry.evidence_ref)
    .bind(&entry.note)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn audit_for_project(pool: &SqlitePool, project_id: &str) -> Result<Vec<AuditEntry>> {
    let rows = sqlx::query("SELECT * FROM audit_log WHERE project_id = ?1 ORDER BY timestamp ASC, id ASC")
        .bind(project_id)
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| {
            let from: Option<String> = row.try_get("from_status")?;
            let to: String = row.try_get("to_status")?;
            Ok(AuditEntry {
                project_id: row.try_get("project_id")?,
                from: from
                    .map(|s| {
                        ProjectStatus::parse(&s)
                            .ok_or_else(|| decode_err(format!("unknown status: {s}")))
                    })
                    .transpose()?,
                to: ProjectStatus::parse(&to)
                    .ok_or_else(|| decode_err(format!("unknown status: {to}")))?,
                actor: row.try_get("actor")?,
                timestamp: row.try_get("timestamp")?,
                evidence_ref: row.try_get("evidence_ref")?,
                note: row.try_get("note")?,
            })
        })
        .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
        .map_err(Into::into)
}

// ─────────────────────────────────────────────────────────
// Registrations
// ─────────────────────────────────────────────────────────

fn row_to_registration(row: &sqlx::sqlite::SqliteRow) -> std::result::Result<BlockchainRegistration, sqlx::Error> {
    let status: String = row.try_get("status")?;
    let chain_id: i64 = row.try_get("chain_id")?;
    Ok(BlockchainRegistration {
        project_id: row.try_get("project_id")?,
        chain_id: chain_id as u64,
        tx_hash: row.try_get("tx_hash")?,
        block_number: row.try_get("block_number")?,
        contract_address: row.try_get("contract_address")?,
        status: RegistrationStatus::parse(&status)
            .ok_or_else(|| decode_err(format!("unknown registration status: {status}")))?,
        submitted_at: row.try_get("submitted_at")?,
    })
}

pub async fn insert_registration(pool: &SqlitePool, reg: &BlockchainRegistration) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO registrations
            (project_id, chain_id, tx_hash, block_number, contract_address, status, submitted_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&reg.project_id)
    .bind(reg.chain_id as i64)
    .bind(&reg.tx_hash)
    .bind(reg.block_number)
    .bind(&reg.contract_address)
    .bind(reg.status.as_str())
    .bind(reg.submitted_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn latest_registration(pool: &SqlitePool, project_id: &str) -> Result<Option<BlockchainRegistration>> {
    let row = sqlx::query("SELECT * FROM registrations WHERE project_id = ?1 ORDER BY id DESC LIMIT 1")
        .bind(project_id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| row_to_registration(&r)).transpose().map_err(Into::into)
}

pub async fn confirmed_registration(pool: &SqlitePool, project_id: &str) -> Result<Option<BlockchainRegistration>> {
    let row = sqlx::query(
        "SELECT * FROM registrations WHERE project_id = ?1 AND status = 'confirmed' ORDER BY id DESC LIMIT 1",
    )
    .bind(project_id)
    .fetch_optional(pool)
    .await?;
    row.map(|r| row_to_registration(&r)).transpose().map_err(Into::into)
}

/// Resolve the latest Pending registration for a project.
pub async fn resolve_pending_registration(
    pool: &SqlitePool,
    project_id: &str,
    to: RegistrationStatus,
    tx_hash: Option<&str>,
    block_number: Option<i64>,
) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE registrations
        SET    status = ?2, tx_hash = COALESCE(?3, tx_hash), block_number = COALESCE(?4, block_number)
        WHERE  id = (SELECT id FROM registrations
                     WHERE project_id = ?1 AND status = 'pending'
                     ORDER BY id DESC LIMIT 1)
        "#,
    )
    .bind(project_id)
    .bind(to.as_str())
    .bind(tx_hash)
    .bind(block_number)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

// ─────────────────────────────────────────────────────────
// Credit batches
// ─────────────────────────────────────────────────────────

pub async fn insert_batch(pool: &SqlitePool, batch: &CarbonCreditBatch) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO credit_batches
            (batch_id, project_id, amount, minted_tx_hash, owner_wallet, minted_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(&batch.batch_id)
    .bind(&batch.project_id)
    .bind(batch.amount)
    .bind(&batch.minted_tx_hash)
    .bind(&batch.owner_wallet)
    .bind(batch.minted_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn batches_for_project(pool: &SqlitePool, project_id: &str) -> Result<Vec<CarbonCreditBatch>> {
    let rows = sqlx::query("SELECT * FROM credit_batches WHERE project_id = ?1 ORDER BY minted_at ASC")
        .bind(project_id)
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|row| {
            Ok(CarbonCreditBatch {
                batch_id: row.try_get("batch_id")?,
                project_id: row.try_get("project_id")?,
                amount: row.try_get("amount")?,
                minted_tx_hash: row.try_get("minted_tx_hash")?,
                owner_wallet: row.try_get("owner_wallet")?,
                minted_at: row.try_get("minted_at")?,
            })
        })
        .collect::<std::result::Result<Vec<_>, sqlx::Error>>()
        .map_err(Into::into)
}

// ─────────────────────────────────────────────────────────
// Marketplace listings
// ─────────────────────────────────────────────────────────

fn row_to_listing(row: &sqlx::sqlite::SqliteRow) -> std::result::Result<MarketplaceListing, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(MarketplaceListing {
        listing_id: row.try_get("listing_id")?,
        project_id: row.try_get("project_id")?,
        credits_available: row.try_get("credits_available")?,
        price_per_credit: row.try_get("price_per_credit")?,
        seller_wallet: row.try_get("seller_wallet")?,
        status: ListingStatus::parse(&status)
            .ok_or_else(|| decode_err(format!("unknown listing status: {status}")))?,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn insert_listing(pool: &SqlitePool, listing: &MarketplaceListing) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO listings
            (listing_id, project_id, credits_available, price_per_credit, seller_wallet, status, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7)
        "#,
    )
    .bind(&listing.listing_id)
    .bind(&listing.project_id)
    .bind(listing.credits_available)
    .bind(listing.price_per_credit)
    .bind(&listing.seller_wallet)
    .bind(listing.status.as_str())
    .bind(listing.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn get_listing(pool: &SqlitePool, listing_id: &str) -> Result<Option<MarketplaceListing>> {
    let row = sqlx::query("SELECT * FROM listings WHERE listing_id = ?1")
        .bind(listing_id)
        .fetch_optional(pool)
        .await?;
    row.map(|r| row_to_listing(&r)).transpose().map_err(Into::into)
}

pub async fn active_listings(pool: &SqlitePool) -> Result<Vec<MarketplaceListing>> {
    let rows = sqlx::query("SELECT * FROM listings WHERE status = 'active' ORDER BY created_at ASC")
        .fetch_all(pool)
        .await?;
    rows.iter()
        .map(|r| row_to_listing(r).map_err(Into::into))
        .collect()
}

/// Guarded decrement: only succeeds while the listing is active and holds
/// enough credits, so availability can never go negative.
pub async fn try_decrement_listing(pool: &SqlitePool, listing_id: &str, quantity: f64) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        UPDATE listings
        SET    credits_available = credits_available - ?2
        WHERE  listing_id = ?1 AND status = 'active' AND credits_available >= ?2
        "#,
    )
    .bind(listing_id)
    .bind(quantity)
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

/// Compensating action for a failed purchase.
pub async fn restore_listing(pool: &SqlitePool, listing_id: &str, quantity: f64) -> Result<()> {
    sqlx::query("UPDATE listings SET credits_available = credits_available + ?2 WHERE listing_id = ?1")
        .bind(listing_id)
        .bind(quantity)
        .execute(pool)
        .await?;
    Ok(())
}

pub async fn set_listing_status(pool: &SqlitePool, listing_id: &str, status: ListingStatus) -> Result<()> {
    sqlx::query("UPDATE listings SET status = ?2 WHERE listing_id = ?1")
        .bind(listing_id)
        .bind(status.as_str())
        .execute(pool)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Payment transfers
// ─────────────────────────────────────────────────────────

fn row_to_transfer(row: &sqlx::sqlite::SqliteRow) -> std::result::Result<PaymentTransfer, sqlx::Error> {
    let status: String = row.try_get("status")?;
    Ok(PaymentTransfer {
        transfer_id: row.try_get("transfer_id")?,
        from_wallet: row.try_get("from_wallet")?,
        to_wallet: row.try_get("to_wallet")?,
        amount: row.try_get("amount")?,
        token_type: row.try_get("token_type")?,
        purpose: row.try_get("purpose")?,
        status: TransferStatus::parse(&status)
            .ok_or_else(|| decode_err(format!("unknown transfer status: {status}")))?,
        tx_hash: row.try_get("tx_hash")?,
        idempotency_key: row.try_get("idempotency_key")?,
        created_at: row.try_get("created_at")?,
    })
}

pub async fn insert_transfer(pool: &SqlitePool, transfer: &PaymentTransfer) -> Result<()> {
    sqlx::query(
        r#"
        INSERT INTO transfers
            (transfer_id, from_wallet, to_wallet, amount, token_type, purpose, status,
             tx_hash, idempotency_key, created_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6, ?7, ?8, ?9, ?10)
        "#,
    )
    .bind(&transfer.transfer_id)
    .bind(&transfer.from_wallet)
    .bind(&transfer.to_wallet)
    .bind(transfer.amount)
    .bind(&transfer.token_type)
    .bind(&transfer.purpose)
    .bind(transfer.status.as_str())
    .bind(&transfer.tx_hash)
    .bind(&transfer.idempotency_key)
    .bind(transfer.created_at)
    .execute(pool)
    .await?;
    Ok(())
}

pub async fn transfer_by_key(pool: &SqlitePool, idempotency_key: &str) -> Result<Option<PaymentTransfer>> {
    let row = sqlx::query("SELECT * FROM transfers WHERE idempotency_key = ?1")
        .bind(idempotency_key)
        .fetch_optional(pool)
        .await?;
    row.map(|r| row_to_transfer(&r)).transpose().map_err(Into::into)
}

pub async fn update_transfer(
    pool: &SqlitePool,
    transfer_id: &str,
    status: TransferStatus,
    tx_hash: Option<&str>,
) -> Result<()> {
    sqlx::query("UPDATE transfers SET status = ?2, tx_hash = COALESCE(?3, tx_hash) WHERE transfer_id = ?1")
        .bind(transfer_id)
        .bind(status.as_str())
        .bind(tx_hash)
        .execute(pool)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Ledger events & cursor
// ─────────────────────────────────────────────────────────

/// Persist a delivered ledger event. Returns `false` for a duplicate
/// `(tx_hash, kind)` pair, making at-least-once delivery idempotent.
pub async fn record_ledger_event(pool: &SqlitePool, event: &LedgerEvent) -> Result<bool> {
    let rows = sqlx::query(
        r#"
        INSERT OR IGNORE INTO ledger_events
            (kind, project_id, tx_hash, block_number, payload, received_at)
        VALUES (?1, ?2, ?3, ?4, ?5, ?6)
        "#,
    )
    .bind(event.kind.as_str())
    .bind(&event.project_id)
    .bind(&event.tx_hash)
    .bind(event.block_number)
    .bind(event.payload.to_string())
    .bind(unix_now())
    .execute(pool)
    .await?
    .rows_affected();
    Ok(rows > 0)
}

/// Read the last-seen block from the cursor row. `0` when unset.
pub async fn get_last_block(pool: &SqlitePool) -> Result<i64> {
    let row: Option<(i64,)> = sqlx::query_as("SELECT last_block FROM ledger_cursor WHERE id = 1")
        .fetch_optional(pool)
        .await?;
    Ok(row.map(|(v,)| v).unwrap_or(0))
}

/// Persist the last-seen block so restarts resume without gaps. Monotonic:
/// out-of-order event delivery never rewinds the cursor.
pub async fn save_cursor(pool: &SqlitePool, last_block: i64) -> Result<()> {
    sqlx::query("UPDATE ledger_cursor SET last_block = MAX(last_block, ?1) WHERE id = 1")
        .bind(last_block)
        .execute(pool)
        .await?;
    Ok(())
}

// ─────────────────────────────────────────────────────────
// Unit tests
// ─────────────────────────────────────────────────────────

#[cfg(test)]
mod tests {
    use super::*;
    use mrv_protocol::ListingStatus;

    fn listing(available: f64) -> MarketplaceListing {
        MarketplaceListing {
            listing_id: "lst-1".to_string(),
            project_id: "proj-1".to_string(),
            credits_available: available,
            price_per_credit: 12.0,
            seller_wallet: "0xseller".to_string(),
            status: ListingStatus::Active,
            created_at: unix_now(),
        }
    }

    #[tokio::test]
    async fn guarded_decrement_refuses_oversell() {
        let pool = test_pool().await;
        insert_listing(&pool, &listing(10.0)).await.unwrap();

        assert!(try_decrement_listing(&pool, "lst-1", 6.0).await.unwrap());
        assert!(!try_decrement_listing(&pool, "lst-1", 6.0).await.unwrap());

        let remaining = get_listing(&pool, "lst-1").await.unwrap().unwrap();
        assert_eq!(remaining.credits_available, 4.0);
    }

    #[tokio::test]
    async fn decrement_ignores_non_active_listings() {
        let pool = test_pool().await;
        insert_listing(&pool, &listing(10.0)).await.unwrap();
        set_listing_status(&pool, "lst-1", ListingStatus::Cancelled)
            .await
            .unwrap();

        assert!(!try_decrement_listing(&pool, "lst-1", 1.0).await.unwrap());
    }

    #[tokio::test]
    async fn ledger_event_dedup_by_hash_and_kind() {
        let pool = test_pool().await;
        let event = LedgerEvent {
            kind: crate::ledger::LedgerEventKind::ProjectRegistered,
            project_id: Some("proj-1".to_string()),
            tx_hash: "0xabc".to_string(),
            block_number: 7,
            payload: serde_json::json!({"projectId": "proj-1"}),
        };

        assert!(record_ledger_event(&pool, &event).await.unwrap());
        assert!(!record_ledger_event(&pool, &event).await.unwrap());
    }

    #[tokio::test]
    async fn cursor_round_trips() {
        let pool = test_pool().await;
        assert_eq!(get_last_block(&pool).await.unwrap(), 0);
        save_cursor(&pool, 1234).await.unwrap();
        assert_eq!(get_last_block(&pool).await.unwrap(), 1234);
    }
}
