//! Application-wide error types.
//!
//! Ledger write failures are not errors at this level: writes return a
//! structured [`crate::ledger::TxOutcome`] so callers can persist "attempt
//! failed, retry-eligible" without unwinding. `PipelineError` covers local
//! rejections (validation, illegal state), backend/ledger disagreement, and
//! infrastructure faults.

use thiserror::Error;

use crate::ledger::TxError;

#[derive(Debug, Error)]
pub enum PipelineError {
    /// Malformed or incomplete input at a controller boundary; never
    /// reaches the ledger.
    #[error("Validation error: {0}")]
    Validation(String),

    /// Operation attempted from an illegal lifecycle state.
    #[error("State error: {0}")]
    State(String),

    #[error("Not found: {0}")]
    NotFound(String),

    /// Backend and ledger disagree; manual resolution required.
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Wallet/provider failure outside a write submission (e.g. `connect`).
    #[error("Ledger error: {0}")]
    Ledger(TxError),

    #[error("Database error: {0}")]
    Database(#[from] sqlx::Error),

    #[error("Migration error: {0}")]
    Migrate(#[from] sqlx::migrate::MigrateError),

    #[error("HTTP error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),

    #[error("Configuration error: {0}")]
    Config(String),
}

pub type Result<T> = std::result::Result<T, PipelineError>;
