//! Axum REST API handlers.

use std::sync::Arc;

use axum::{
    extract::{Multipart, Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sqlx::SqlitePool;
use tracing::{error, warn};

use mrv_protocol::{
    AdminVerdict, AuditEntry, EcosystemType, MarketplaceListing, PaymentTransfer, Project,
    ProjectStatus, ReportDecision, VerificationStage,
};

use crate::config::Config;
use crate::db;
use crate::errors::PipelineError;
use crate::ledger::rpc::JsonRpcLedger;
use crate::ledger::{Ledger, TxOutcome};
use crate::lifecycle::{AdminDecision, LifecycleController, NewProject, ThirdPartyReport};
use crate::marketplace::{MarketplaceEngine, PurchaseRequest};
use crate::media::{HttpMediaGateway, MediaStore, MediaUpload};
use crate::payments::{PaymentDistributor, TransferRequest};
use crate::reconcile::ReconciliationService;

pub struct ApiState {
    pub pool: SqlitePool,
    pub config: Arc<Config>,
    pub ledger: Arc<JsonRpcLedger>,
    pub controller: Arc<LifecycleController<JsonRpcLedger>>,
    pub marketplace: Arc<MarketplaceEngine<JsonRpcLedger>>,
    pub payments: Arc<PaymentDistributor<JsonRpcLedger>>,
    pub reconciler: Arc<ReconciliationService<JsonRpcLedger>>,
    pub media: Arc<HttpMediaGateway>,
}

pub fn router(state: Arc<ApiState>) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/projects", get(list_projects).post(create_project))
        .route("/api/projects/:id", get(get_project))
        .route("/api/projects/:id/verification-status", get(verification_status))
        .route("/api/projects/:id/audit", get(project_audit))
        .route("/api/projects/:id/ai-score", post(record_ai_score))
        .route("/api/projects/:id/third-party-report", post(record_third_party_report))
        .route("/api/admin/projects/:id/review", post(admin_review))
        .route("/api/projects/:id/register", post(register_on_chain))
        .route("/api/projects/:id/mint", post(mint_credits))
        .route("/api/projects/:id/list", post(list_credits))
        .route("/api/ipfs/upload", post(upload_media))
        .route("/api/blockchain/status", get(blockchain_status))
        .route("/api/contracts/info", get(contracts_info))
        .route("/api/marketplace/listings", get(marketplace_listings))
        .route("/api/marketplace/purchase", post(marketplace_purchase))
        .route("/api/payments/transfer", post(payment_transfer))
        .with_state(state)
}

// ─────────────────────────────────────────────────────────
// Response shapes
// ─────────────────────────────────────────────────────────

#[derive(Serialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Serialize)]
pub struct HealthResponse {
    pub status: &'static str,
    pub version: &'static str,
}

#[derive(Serialize)]
pub struct ProjectsResponse {
    pub count: usize,
    pub projects: Vec<Project>,
}

#[derive(Serialize)]
pub struct TxOutcomeResponse {
    pub success: bool,
    pub tx_hash: Option<String>,
    pub block_number: Option<i64>,
    pub error: Option<String>,
}

impl From<TxOutcome> for TxOutcomeResponse {
    fn from(outcome: TxOutcome) -> Self {
        Self {
            success: outcome.success,
            tx_hash: outcome.tx_hash,
            block_number: outcome.block_number,
            error: outcome.error.map(|e| e.to_string()),
        }
    }
}

#[derive(Serialize)]
pub struct StageStatus {
    pub completed: bool,
    pub score: Option<f64>,
    pub decision: Option<String>,
    pub actor: Option<String>,
}

#[derive(Serialize)]
pub struct VerificationStatusResponse {
    pub project_id: String,
    pub status: ProjectStatus,
    pub ai_verification: StageStatus,
    pub third_party_verification: StageStatus,
    pub admin_review: StageStatus,
    pub blockchain_registration: Option<RegistrationSummary>,
}

#[derive(Serialize)]
pub struct RegistrationSummary {
    pub status: String,
    pub tx_hash: Option<String>,
    pub block_number: Option<i64>,
}

#[derive(Serialize)]
pub struct AuditResponse {
    pub project_id: String,
    pub count: usize,
    pub entries: Vec<AuditEntry>,
}

#[derive(Serialize)]
pub struct UploadMediaResponse {
    pub status: &'static str,
    pub ipfs_hash: String,
    pub gateway_url: String,
    pub size: u64,
}

impl IntoResponse for PipelineError {
    fn into_response(self) -> Response {
        let status = match &self {
            PipelineError::Validation(_) => StatusCode::BAD_REQUEST,
            PipelineError::NotFound(_) => StatusCode::NOT_FOUND,
            PipelineError::State(_) | PipelineError::Conflict(_) => StatusCode::CONFLICT,
            PipelineError::Ledger(_) => StatusCode::BAD_GATEWAY,
            _ => StatusCode::INTERNAL_SERVER_ERROR,
        };
        if status == StatusCode::INTERNAL_SERVER_ERROR {
            error!("internal error: {self}");
        }
        (
            status,
            Json(ErrorResponse {
                error: self.to_string(),
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = std::result::Result<T, PipelineError>;

// ─────────────────────────────────────────────────────────
// Request shapes
// ─────────────────────────────────────────────────────────

#[derive(Deserialize)]
pub struct CreateProjectRequest {
    pub id: Option<String>,
    pub name: String,
    pub ecosystem: String,
    pub area_hectares: f64,
    pub location: String,
    pub owner_wallet: String,
    #[serde(default)]
    pub media_refs: Vec<String>,
}

#[derive(Deserialize)]
pub struct AiScoreRequest {
    pub score: f64,
    pub actor: Option<String>,
}

#[derive(Deserialize)]
pub struct ThirdPartyReportRequest {
    pub organization: String,
    pub decision: String,
    pub report_ref: Option<String>,
}

#[derive(Deserialize)]
pub struct AdminReviewRequest {
    pub decision: String,
    pub comments: Option<String>,
    pub credits_awarded: Option<f64>,
    pub actor: Option<String>,
    pub override_justification: Option<String>,
}

#[derive(Deserialize)]
pub struct ActorRequest {
    pub actor: Option<String>,
}

#[derive(Deserialize)]
pub struct MintRequest {
    pub amount: f64,
    pub batch_id: Option<String>,
    pub actor: Option<String>,
}

#[derive(Deserialize)]
pub struct ListCreditsRequest {
    pub quantity: Option<f64>,
    pub price_per_credit: f64,
    pub actor: Option<String>,
}

#[derive(Deserialize)]
pub struct PurchaseBody {
    pub listing_id: String,
    pub quantity: f64,
    pub buyer_wallet: String,
}

#[derive(Deserialize)]
pub struct TransferBody {
    pub from_wallet: String,
    pub to_wallet: String,
    pub amount: f64,
    pub token_type: Option<String>,
    pub purpose: Option<String>,
    pub idempotency_key: Option<String>,
}

// ─────────────────────────────────────────────────────────
// Handlers
// ─────────────────────────────────────────────────────────

/// `GET /health`
pub async fn health() -> impl IntoResponse {
    Json(HealthResponse {
        status: "ok",
        version: env!("CARGO_PKG_VERSION"),
    })
}

/// `GET /api/projects`
pub async fn list_projects(State(state): State<Arc<ApiState>>) -> ApiResult<Json<ProjectsResponse>> {
    let projects = db::list_projects(&state.pool).await?;
    Ok(Json(ProjectsResponse {
        count: projects.len(),
        projects,
    }))
}

/// `GET /api/projects/:id`
pub async fn get_project(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<Project>> {
    let project = db::get_project(&state.pool, &id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("project {id}")))?;
    Ok(Json(project))
}

/// `POST /api/projects` — submit a project into the pipeline.
pub async fn create_project(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<CreateProjectRequest>,
) -> ApiResult<(StatusCode, Json<Project>)> {
    let ecosystem = EcosystemType::parse(&body.ecosystem)
        .ok_or_else(|| PipelineError::Validation(format!("unknown ecosystem: {}", body.ecosystem)))?;
    let project = state
        .controller
        .submit(NewProject {
            id: body.id,
            name: body.name,
            ecosystem,
            area_hectares: body.area_hectares,
            location: body.location,
            owner_wallet: body.owner_wallet,
            media_refs: body.media_refs,
        })
        .await?;
    Ok((StatusCode::CREATED, Json(project)))
}

/// `GET /api/projects/:id/verification-status`
pub async fn verification_status(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<VerificationStatusResponse>> {
    let project = db::get_project(&state.pool, &id)
        .await?
        .ok_or_else(|| PipelineError::NotFound(format!("project {id}")))?;
    let records = db::verification_records(&state.pool, &id).await?;
    let registration = db::latest_registration(&state.pool, &id).await?;

    let stage = |target: VerificationStage| {
        records
            .iter()
            .find(|r| r.stage == target)
            .map(|r| StageStatus {
                completed: r.completed,
                score: r.score,
                decision: r.decision.clone(),
                actor: Some(r.actor.clone()),
            })
            .unwrap_or(StageStatus {
                completed: false,
                score: None,
                decision: None,
                actor: None,
            })
    };

    Ok(Json(VerificationStatusResponse {
        project_id: id,
        status: project.status,
        ai_verification: stage(VerificationStage::Ai),
        third_party_verification: stage(VerificationStage::ThirdParty),
        admin_review: stage(VerificationStage::Admin),
        blockchain_registration: registration.map(|r| RegistrationSummary {
            status: r.status.as_str().to_string(),
            tx_hash: r.tx_hash,
            block_number: r.block_number,
        }),
    }))
}

/// `GET /api/projects/:id/audit`
pub async fn project_audit(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
) -> ApiResult<Json<AuditResponse>> {
    let entries = db::audit_for_project(&state.pool, &id).await?;
    Ok(Json(AuditResponse {
        project_id: id,
        count: entries.len(),
        entries,
    }))
}

/// `POST /api/projects/:id/ai-score` — the external scorer's callback.
pub async fn record_ai_score(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<AiScoreRequest>,
) -> ApiResult<Json<Project>> {
    let actor = body.actor.as_deref().unwrap_or("scoring-service");
    let project = state.controller.record_ai_score(&id, body.score, actor).await?;
    Ok(Json(project))
}

/// `POST /api/projects/:id/third-party-report`
pub async fn record_third_party_report(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<ThirdPartyReportRequest>,
) -> ApiResult<Json<Project>> {
    let decision = ReportDecision::parse(&body.decision)
        .ok_or_else(|| PipelineError::Validation(format!("unknown decision: {}", body.decision)))?;
    let project = state
        .controller
        .record_third_party_report(
            &id,
            ThirdPartyReport {
                organization: body.organization,
                decision,
                report_ref: body.report_ref,
            },
        )
        .await?;
    Ok(Json(project))
}

/// `POST /api/admin/projects/:id/review`
///
/// An approval triggers chain registration asynchronously; the admin call
/// returns as soon as the verdict is persisted.
pub async fn admin_review(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<AdminReviewRequest>,
) -> ApiResult<Json<Project>> {
    let verdict = AdminVerdict::parse(&body.decision)
        .ok_or_else(|| PipelineError::Validation(format!("unknown decision: {}", body.decision)))?;
    let actor = body.actor.unwrap_or_else(|| "admin".to_string());
    let project = state
        .controller
        .admin_decide(
            &id,
            AdminDecision {
                verdict,
                comments: body.comments.unwrap_or_default(),
                credits_awarded: body.credits_awarded,
                actor: actor.clone(),
                override_justification: body.override_justification,
            },
        )
        .await?;

    if project.status == ProjectStatus::Approved {
        let controller = state.controller.clone();
        let reconciler = state.reconciler.clone();
        let project_id = id.clone();
        tokio::spawn(async move {
            match controller.register_on_chain(&project_id, &actor).await {
                Ok(outcome) if !outcome.success => {
                    warn!(
                        "auto-registration of {project_id} failed: {}",
                        outcome.error.map(|e| e.to_string()).unwrap_or_default()
                    );
                    if let Err(e) = reconciler.reconcile(&project_id).await {
                        error!("post-failure reconcile of {project_id}: {e}");
                    }
                }
                Ok(_) => {}
                Err(e) => warn!("auto-registration of {project_id} rejected: {e}"),
            }
        });
    }
    Ok(Json(project))
}

/// `POST /api/projects/:id/register` — explicit (re)registration.
pub async fn register_on_chain(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<ActorRequest>,
) -> ApiResult<Json<TxOutcomeResponse>> {
    let actor = body.actor.as_deref().unwrap_or("admin");
    let outcome = state.controller.register_on_chain(&id, actor).await?;
    if !outcome.success {
        // On-demand reconcile after a failed write.
        if let Err(e) = state.reconciler.reconcile(&id).await {
            error!("post-failure reconcile of {id}: {e}");
        }
    }
    Ok(Json(outcome.into()))
}

/// `POST /api/projects/:id/mint`
pub async fn mint_credits(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<MintRequest>,
) -> ApiResult<Json<TxOutcomeResponse>> {
    let actor = body.actor.as_deref().unwrap_or("admin");
    let minted = state
        .controller
        .mint_credits(&id, body.amount, body.batch_id, actor)
        .await?;
    if !minted.outcome.success {
        if let Err(e) = state.reconciler.reconcile(&id).await {
            error!("post-failure reconcile of {id}: {e}");
        }
    }
    Ok(Json(minted.outcome.into()))
}

/// `POST /api/projects/:id/list`
pub async fn list_credits(
    State(state): State<Arc<ApiState>>,
    Path(id): Path<String>,
    Json(body): Json<ListCreditsRequest>,
) -> ApiResult<(StatusCode, Json<MarketplaceListing>)> {
    let actor = body.actor.as_deref().unwrap_or("admin");
    let listing = state
        .controller
        .list_credits(&id, body.quantity, body.price_per_credit, actor)
        .await?;
    Ok((StatusCode::CREATED, Json(listing)))
}

/// `POST /api/ipfs/upload` — multipart `file`, `file_type`, `project_id`, `metadata`.
pub async fn upload_media(
    State(state): State<Arc<ApiState>>,
    mut multipart: Multipart,
) -> ApiResult<Json<UploadMediaResponse>> {
    let mut file_name = String::from("upload.bin");
    let mut bytes: Option<Vec<u8>> = None;
    let mut file_type = String::from("application/octet-stream");
    let mut project_id = String::new();
    let mut metadata = Value::Null;

    while let Some(field) = multipart
        .next_field()
        .await
        .map_err(|e| PipelineError::Validation(format!("bad multipart body: {e}")))?
    {
        match field.name().unwrap_or_default() {
            "file" => {
                if let Some(name) = field.file_name() {
                    file_name = name.to_string();
                }
                bytes = Some(
                    field
                        .bytes()
                        .await
                        .map_err(|e| PipelineError::Validation(format!("bad file field: {e}")))?
                        .to_vec(),
                );
            }
            "file_type" => {
                file_type = field
                    .text()
                    .await
                    .map_err(|e| PipelineError::Validation(format!("bad file_type field: {e}")))?;
            }
            "project_id" => {
                project_id = field
                    .text()
                    .await
                    .map_err(|e| PipelineError::Validation(format!("bad project_id field: {e}")))?;
            }
            "metadata" => {
                let raw = field
                    .text()
                    .await
                    .map_err(|e| PipelineError::Validation(format!("bad metadata field: {e}")))?;
                metadata = serde_json::from_str(&raw).unwrap_or(Value::String(raw));
            }
            _ => {}
        }
    }

    let bytes =
        bytes.ok_or_else(|| PipelineError::Validation("missing file field".to_string()))?;
    let media_ref = state
        .media
        .upload(MediaUpload {
            file_name,
            file_type,
            project_id,
            bytes,
            metadata,
        })
        .await?;

    Ok(Json(UploadMediaResponse {
        status: "success",
        ipfs_hash: media_ref.content_hash,
        gateway_url: media_ref.gateway_url,
        size: media_ref.size,
    }))
}

/// `GET /api/blockchain/status`
pub async fn blockchain_status(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    let supply = state.ledger.total_supply().await;
    Json(serde_json::json!({
        "chain_id": state.config.chain_id,
        "explorer_url": state.config.explorer_url,
        "connected": supply.is_ok(),
        "total_supply": supply.ok(),
    }))
}

/// `GET /api/contracts/info`
pub async fn contracts_info(State(state): State<Arc<ApiState>>) -> impl IntoResponse {
    Json(serde_json::json!({
        "chain_id": state.config.chain_id,
        "registry_address": state.config.registry_address,
        "token_address": state.config.token_address,
        "explorer_url": state.config.explorer_url,
    }))
}

/// `GET /api/marketplace/listings`
pub async fn marketplace_listings(
    State(state): State<Arc<ApiState>>,
) -> ApiResult<Json<Vec<MarketplaceListing>>> {
    Ok(Json(state.marketplace.active_listings().await?))
}

/// `POST /api/marketplace/purchase`
pub async fn marketplace_purchase(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<PurchaseBody>,
) -> ApiResult<Json<serde_json::Value>> {
    let result = state
        .marketplace
        .purchase(PurchaseRequest {
            listing_id: body.listing_id,
            quantity: body.quantity,
            buyer_wallet: body.buyer_wallet,
        })
        .await?;
    Ok(Json(serde_json::json!({
        "outcome": TxOutcomeResponse::from(result.outcome),
        "listing": result.listing,
    })))
}

/// `POST /api/payments/transfer`
pub async fn payment_transfer(
    State(state): State<Arc<ApiState>>,
    Json(body): Json<TransferBody>,
) -> ApiResult<Json<PaymentTransfer>> {
    let record = state
        .payments
        .transfer(TransferRequest {
            from_wallet: body.from_wallet,
            to_wallet: body.to_wallet,
            amount: body.amount,
            token_type: body.token_type.unwrap_or_else(|| "BCC".to_string()),
            purpose: body.purpose.unwrap_or_else(|| "revenue-share".to_string()),
            idempotency_key: body.idempotency_key,
        })
        .await?;
    Ok(Json(record))
}
