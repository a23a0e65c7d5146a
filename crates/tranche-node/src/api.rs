use crate::metrics::Metrics;
use axum::{
    extract::{Path, State},
    http::{HeaderMap, StatusCode},
    response::{IntoResponse, Json, Response},
    routing::{get, post},
    Router,
};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use std::time::Instant;
use tokio::task::JoinHandle;
use tracing::info;
use tranche_core::{EscrowEngine, MilestoneState, PublicAuditEntry};
use tranche_store::{
    Bid, BidDraft, ChangeRequest, ChangeRequestStatus, EscrowStore, MilestoneDraft, Payment, Proof,
};
use tranche_types::{
    ActorContext, ActorRole, BidId, EscrowError, FileRef, ProposalId, RequestId, UsdAmount,
    WalletAddress,
};

#[derive(Clone)]
pub struct AppState {
    pub engine: Arc<EscrowEngine>,
    pub metrics: Metrics,
}

#[derive(Serialize, Deserialize)]
struct ErrorResponse {
    error: String,
}

pub struct ApiError(EscrowError);

impl From<EscrowError> for ApiError {
    fn from(e: EscrowError) -> Self {
        Self(e)
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let status = match &self.0 {
            EscrowError::InvalidMilestone(_) | EscrowError::InvalidArgument(_) => {
                StatusCode::BAD_REQUEST
            }
            EscrowError::NotFound(_) => StatusCode::NOT_FOUND,
            EscrowError::DuplicatePayment(_) | EscrowError::InsufficientFunds { .. } => {
                StatusCode::CONFLICT
            }
            EscrowError::RateLimited(_)
            | EscrowError::UpstreamUnavailable(_)
            | EscrowError::TransactionReverted(_) => StatusCode::BAD_GATEWAY,
            EscrowError::TransactionTimeout(_) => StatusCode::GATEWAY_TIMEOUT,
            EscrowError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
        };
        (
            status,
            Json(ErrorResponse {
                error: self.0.to_string(),
            }),
        )
            .into_response()
    }
}

/// Session establishment is a collaborator concern; the control surface
/// only requires the already-authenticated actor to be named explicitly.
fn actor_from_headers(headers: &HeaderMap) -> Result<ActorContext, ApiError> {
    let actor_id = headers
        .get("x-actor-id")
        .and_then(|v| v.to_str().ok())
        .map(str::trim)
        .filter(|s| !s.is_empty())
        .ok_or_else(|| {
            ApiError(EscrowError::InvalidArgument(
                "missing x-actor-id header".to_string(),
            ))
        })?;
    let role = match headers
        .get("x-actor-role")
        .and_then(|v| v.to_str().ok())
        .unwrap_or_default()
    {
        "admin" => ActorRole::Admin,
        "vendor" => ActorRole::Vendor,
        other => {
            return Err(ApiError(EscrowError::InvalidArgument(format!(
                "x-actor-role must be admin or vendor, got '{}'",
                other
            ))))
        }
    };
    Ok(ActorContext {
        actor_id: actor_id.to_string(),
        role,
    })
}

pub fn start_api_server(engine: Arc<EscrowEngine>, metrics: Metrics, addr: String) -> JoinHandle<()> {
    let state = AppState { engine, metrics };

    let app = Router::new()
        .route("/health", get(health))
        .route("/status", get(get_status))
        .route("/metrics", get(get_metrics))
        .route("/v1/bids", post(create_bid))
        .route("/v1/bids/:id", get(get_bid))
        .route("/v1/bids/:id/analysis", post(attach_analysis))
        .route("/v1/bids/:id/milestones/:index/proofs", post(submit_proof))
        .route("/v1/bids/:id/milestones/:index/approve", post(approve_milestone))
        .route("/v1/bids/:id/milestones/:index/release", post(release_payment))
        .route("/v1/bids/:id/milestones/:index/archive", post(archive_milestone))
        .route(
            "/v1/bids/:id/milestones/:index/unarchive",
            post(unarchive_milestone),
        )
        .route("/v1/bids/:id/milestones/:index/state", get(milestone_state))
        .route("/v1/change-requests", post(open_change_request))
        .route("/v1/change-requests/:id/responses", post(post_change_response))
        .route("/v1/change-requests/:id/resolve", post(resolve_change_request))
        .route(
            "/v1/proposals/:id/change-requests/open",
            get(open_change_requests),
        )
        .route("/v1/proposals/:id/audit", get(public_audit_feed))
        .with_state(Arc::new(state));

    info!(addr = %addr, "📡 Starting API server");

    tokio::spawn(async move {
        let listener = tokio::net::TcpListener::bind(&addr)
            .await
            .expect("failed to bind API server");
        axum::serve(listener, app).await.expect("API server failed");
    })
}

async fn health() -> &'static str {
    "OK"
}

#[derive(Serialize)]
struct StatusResponse {
    version: &'static str,
    bids: usize,
    pending_settlements: usize,
}

async fn get_status(State(state): State<Arc<AppState>>) -> Result<Json<StatusResponse>, ApiError> {
    let bids = state.engine.store.list_bids().await.map_err(EscrowError::from)?;
    let pending = state
        .engine
        .store
        .list_pending_settlements()
        .await
        .map_err(EscrowError::from)?;
    Ok(Json(StatusResponse {
        version: env!("CARGO_PKG_VERSION"),
        bids: bids.len(),
        pending_settlements: pending.len(),
    }))
}

async fn get_metrics(State(state): State<Arc<AppState>>) -> String {
    state.metrics.gather()
}

#[derive(Deserialize)]
struct MilestoneRequest {
    name: String,
    /// Decimal string, e.g. "250.00"; parsed without floating point.
    amount: String,
    due_date: DateTime<Utc>,
}

#[derive(Deserialize)]
struct CreateBidRequest {
    proposal_id: u64,
    vendor_id: String,
    payout_wallet: String,
    currency: String,
    milestones: Vec<MilestoneRequest>,
}

async fn create_bid(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<CreateBidRequest>,
) -> Result<Json<Bid>, ApiError> {
    let ctx = actor_from_headers(&headers)?;
    let payout_wallet: WalletAddress = req.payout_wallet.parse()?;
    let mut milestones = Vec::with_capacity(req.milestones.len());
    for m in req.milestones {
        milestones.push(MilestoneDraft {
            name: m.name,
            amount: m.amount.parse::<UsdAmount>()?,
            due_date: m.due_date,
        });
    }
    let draft = BidDraft {
        proposal_id: ProposalId(req.proposal_id),
        vendor_id: req.vendor_id,
        payout_wallet,
        currency: req.currency,
        milestones,
    };
    let bid = state.engine.create_bid(&ctx, draft).await?;
    Ok(Json(bid))
}

async fn get_bid(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<Bid>, ApiError> {
    Ok(Json(state.engine.get_bid(BidId(id)).await?))
}

async fn attach_analysis(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
    headers: HeaderMap,
    Json(analysis): Json<serde_json::Value>,
) -> Result<StatusCode, ApiError> {
    let ctx = actor_from_headers(&headers)?;
    state.engine.attach_analysis(&ctx, BidId(id), analysis).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Deserialize)]
struct SubmitProofRequest {
    #[serde(default)]
    description: String,
    #[serde(default)]
    files: Vec<FileRef>,
}

async fn submit_proof(
    State(state): State<Arc<AppState>>,
    Path((id, index)): Path<(u64, u32)>,
    headers: HeaderMap,
    Json(req): Json<SubmitProofRequest>,
) -> Result<Json<Proof>, ApiError> {
    let ctx = actor_from_headers(&headers)?;
    let proof = state
        .engine
        .proofs
        .submit_proof(&ctx, BidId(id), index, req.description, req.files)
        .await?;
    state.metrics.proofs_submitted.inc();
    Ok(Json(proof))
}

#[derive(Deserialize, Default)]
struct ApproveRequest {
    #[serde(default)]
    summary: Option<String>,
}

async fn approve_milestone(
    State(state): State<Arc<AppState>>,
    Path((id, index)): Path<(u64, u32)>,
    headers: HeaderMap,
    Json(req): Json<ApproveRequest>,
) -> Result<StatusCode, ApiError> {
    let ctx = actor_from_headers(&headers)?;
    state
        .engine
        .approvals
        .approve(&ctx, BidId(id), index, req.summary)
        .await?;
    state.metrics.milestones_approved.inc();
    Ok(StatusCode::NO_CONTENT)
}

async fn release_payment(
    State(state): State<Arc<AppState>>,
    Path((id, index)): Path<(u64, u32)>,
    headers: HeaderMap,
) -> Result<Json<Payment>, ApiError> {
    let ctx = actor_from_headers(&headers)?;
    let started = Instant::now();
    let result = state
        .engine
        .payments
        .release_payment(&ctx, BidId(id), index)
        .await;
    state
        .metrics
        .release_duration
        .observe(started.elapsed().as_secs_f64());
    match result {
        Ok(payment) => {
            state.metrics.payments_released.inc();
            Ok(Json(payment))
        }
        Err(e) => {
            state.metrics.payments_failed.inc();
            Err(e.into())
        }
    }
}

async fn archive_milestone(
    State(state): State<Arc<AppState>>,
    Path((id, index)): Path<(u64, u32)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let ctx = actor_from_headers(&headers)?;
    state.engine.approvals.archive(&ctx, BidId(id), index).await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn unarchive_milestone(
    State(state): State<Arc<AppState>>,
    Path((id, index)): Path<(u64, u32)>,
    headers: HeaderMap,
) -> Result<StatusCode, ApiError> {
    let ctx = actor_from_headers(&headers)?;
    state.engine.approvals.unarchive(&ctx, BidId(id), index).await?;
    Ok(StatusCode::NO_CONTENT)
}

#[derive(Serialize)]
struct MilestoneStateResponse {
    state: MilestoneState,
}

async fn milestone_state(
    State(state): State<Arc<AppState>>,
    Path((id, index)): Path<(u64, u32)>,
) -> Result<Json<MilestoneStateResponse>, ApiError> {
    let milestone_state = state.engine.milestone_state(BidId(id), index).await?;
    Ok(Json(MilestoneStateResponse {
        state: milestone_state,
    }))
}

#[derive(Deserialize)]
struct OpenChangeRequestRequest {
    bid_id: u64,
    milestone_index: u32,
    comment: String,
    #[serde(default)]
    checklist: Vec<String>,
}

async fn open_change_request(
    State(state): State<Arc<AppState>>,
    headers: HeaderMap,
    Json(req): Json<OpenChangeRequestRequest>,
) -> Result<Json<ChangeRequest>, ApiError> {
    let ctx = actor_from_headers(&headers)?;
    let request = state
        .engine
        .changes
        .open_request(
            &ctx,
            BidId(req.bid_id),
            req.milestone_index,
            req.comment,
            req.checklist,
        )
        .await?;
    state.metrics.change_requests_opened.inc();
    Ok(Json(request))
}

#[derive(Deserialize)]
struct ChangeResponseRequest {
    #[serde(default)]
    comment: String,
    #[serde(default)]
    files: Vec<FileRef>,
}

async fn post_change_response(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ChangeResponseRequest>,
) -> Result<Json<ChangeRequest>, ApiError> {
    let ctx = actor_from_headers(&headers)?;
    let request_id: RequestId = id.parse()?;
    let request = state
        .engine
        .changes
        .post_response(&ctx, request_id, req.comment, req.files)
        .await?;
    state.metrics.change_responses_posted.inc();
    Ok(Json(request))
}

#[derive(Deserialize)]
struct ResolveRequest {
    status: ChangeRequestStatus,
}

async fn resolve_change_request(
    State(state): State<Arc<AppState>>,
    Path(id): Path<String>,
    headers: HeaderMap,
    Json(req): Json<ResolveRequest>,
) -> Result<StatusCode, ApiError> {
    let ctx = actor_from_headers(&headers)?;
    let request_id: RequestId = id.parse()?;
    state
        .engine
        .changes
        .resolve(&ctx, request_id, req.status)
        .await?;
    Ok(StatusCode::NO_CONTENT)
}

async fn open_change_requests(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<Vec<ChangeRequest>>, ApiError> {
    let requests = state
        .engine
        .changes
        .open_for_proposal(ProposalId(id))
        .await?;
    Ok(Json(requests))
}

async fn public_audit_feed(
    State(state): State<Arc<AppState>>,
    Path(id): Path<u64>,
) -> Result<Json<Vec<PublicAuditEntry>>, ApiError> {
    let feed = state.engine.audit.public_feed(ProposalId(id)).await?;
    Ok(Json(feed))
}
