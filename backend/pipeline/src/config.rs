//! Application configuration loaded from environment variables.

use crate::errors::{PipelineError, Result};

#[derive(Debug, Clone)]
pub struct Config {
    /// Wallet-provider / RPC gateway endpoint
    pub rpc_url: String,
    /// Chain the registry and credit-token contracts are deployed on
    pub chain_id: u64,
    /// Block-explorer base URL (informational, returned by the API)
    pub explorer_url: String,
    /// Project-registry contract address
    pub registry_address: String,
    /// Credit-token contract address
    pub token_address: String,
    /// Content-addressed media gateway endpoint
    pub media_gateway_url: String,
    /// Path to the SQLite database file
    pub database_url: String,
    /// Port for the REST API server
    pub api_port: u16,
    /// How often (in seconds) to poll the provider for new ledger events
    pub events_poll_interval_secs: u64,
    /// Maximum number of events to fetch per poll
    pub events_per_page: u32,
    /// Block to start event polling from if no cursor is saved
    pub start_block: u64,
    /// How often (in seconds) the reconciliation sweep runs
    pub reconcile_interval_secs: u64,
    /// Age (in seconds) after which an unresolved Pending registration is
    /// marked Failed and becomes retry-eligible
    pub registration_timeout_secs: i64,
}

impl Config {
    pub fn from_env() -> Result<Self> {
        Ok(Config {
            rpc_url: env_var("RPC_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:8545".to_string()),
            chain_id: env_var("CHAIN_ID")
                .unwrap_or_else(|_| "80002".to_string())
                .parse()
                .map_err(|_| PipelineError::Config("Invalid CHAIN_ID".to_string()))?,
            explorer_url: env_var("EXPLORER_URL")
                .unwrap_or_else(|_| "https://amoy.polygonscan.com".to_string()),
            registry_address: env_var("REGISTRY_ADDRESS").map_err(|_| {
                PipelineError::Config("REGISTRY_ADDRESS environment variable is required".to_string())
            })?,
            token_address: env_var("TOKEN_ADDRESS").map_err(|_| {
                PipelineError::Config("TOKEN_ADDRESS environment variable is required".to_string())
            })?,
            media_gateway_url: env_var("MEDIA_GATEWAY_URL")
                .unwrap_or_else(|_| "http://127.0.0.1:5001".to_string()),
            database_url: env_var("DATABASE_URL")
                .unwrap_or_else(|_| "sqlite:./mrv_pipeline.db".to_string()),
            api_port: env_var("API_PORT")
                .unwrap_or_else(|_| "3001".to_string())
                .parse()
                .map_err(|_| PipelineError::Config("Invalid API_PORT".to_string()))?,
            events_poll_interval_secs: env_var("EVENTS_POLL_INTERVAL_SECS")
                .unwrap_or_else(|_| "5".to_string())
                .parse()
                .map_err(|_| {
                    PipelineError::Config("Invalid EVENTS_POLL_INTERVAL_SECS".to_string())
                })?,
            events_per_page: env_var("EVENTS_PER_PAGE")
                .unwrap_or_else(|_| "100".to_string())
                .parse()
                .map_err(|_| PipelineError::Config("Invalid EVENTS_PER_PAGE".to_string()))?,
            start_block: env_var("START_BLOCK")
                .unwrap_or_else(|_| "0".to_string())
                .parse()
                .map_err(|_| PipelineError::Config("Invalid START_BLOCK".to_string()))?,
            reconcile_interval_secs: env_var("RECONCILE_INTERVAL_SECS")
                .unwrap_or_else(|_| "60".to_string())
                .parse()
                .map_err(|_| PipelineError::Config("Invalid RECONCILE_INTERVAL_SECS".to_string()))?,
            registration_timeout_secs: env_var("REGISTRATION_TIMEOUT_SECS")
                .unwrap_or_else(|_| "600".to_string())
                .parse()
                .map_err(|_| {
                    PipelineError::Config("Invalid REGISTRATION_TIMEOUT_SECS".to_string())
                })?,
        })
    }
}

fn env_var(key: &str) -> Result<String> {
    std::env::var(key).map_err(|_| PipelineError::Config(format!("Missing env var: {key}")))
}
