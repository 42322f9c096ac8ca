//! # REST + WebSocket API
//!
//! The node's HTTP interface over the vault registry. Callers identify
//! themselves with a `caller` / `depositor` / `holder` field in the request
//! body; owner-only operations are checked by the engine.
//!
//! ## Endpoints
//!
//! | Method | Path                                | Description                      |
//! |--------|-------------------------------------|----------------------------------|
//! | GET    | `/health`                           | Liveness check                   |
//! | GET    | `/status`                           | Node and manager summary         |
//! | GET    | `/vaults`                           | Snapshots of every vault         |
//! | POST   | `/vaults`                           | Create a vault                   |
//! | GET    | `/vaults/:id`                       | One vault's snapshot             |
//! | GET    | `/vaults/:id/holders/:holder`       | Claim balance and redeem value   |
//! | POST   | `/vaults/:id/deposit`               | Deposit the underlying asset     |
//! | POST   | `/vaults/:id/withdraw`              | Burn claims for assets           |
//! | POST   | `/vaults/:id/rebalance`             | Owner: move liquidity to target  |
//! | POST   | `/vaults/:id/distribute-yield`      | Owner: fold in venue yield       |
//! | POST   | `/vaults/:id/deactivate`            | Owner: close to deposits         |
//! | POST   | `/faucet`                           | Mint simulated asset             |
//! | POST   | `/venue/accrue`                     | Credit simulated LP fees         |
//! | GET    | `/ws`                               | Live vault events                |

use std::time::Duration;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use futures::{SinkExt, StreamExt};
use serde::{Deserialize, Serialize};
use std::sync::Arc;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use marketpulse_engine::distributor::YieldDistribution;
use marketpulse_engine::vault::{DepositReceipt, RebalanceReceipt, WithdrawReceipt};
use marketpulse_engine::{
    VaultError, VaultHandle, VaultId, VaultParams, VaultRegistry, VaultSnapshot,
};

use crate::manager::{ManagerStatus, SharedManagerStatus};
use crate::metrics::SharedMetrics;
use crate::simulation::Simulation;

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared state for all handlers. Cheap to clone.
#[derive(Clone)]
pub struct AppState {
    pub version: String,
    /// Account the vault manager acts as.
    pub operator: String,
    pub registry: Arc<VaultRegistry>,
    pub sim: Simulation,
    pub metrics: SharedMetrics,
    pub manager: SharedManagerStatus,
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the API router with CORS and request tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/vaults", get(list_vaults_handler).post(create_vault_handler))
        .route("/vaults/:id", get(vault_handler))
        .route("/vaults/:id/holders/:holder", get(holder_handler))
        .route("/vaults/:id/deposit", post(deposit_handler))
        .route("/vaults/:id/withdraw", post(withdraw_handler))
        .route("/vaults/:id/rebalance", post(rebalance_handler))
        .route("/vaults/:id/distribute-yield", post(distribute_yield_handler))
        .route("/vaults/:id/deactivate", post(deactivate_handler))
        .route("/faucet", post(faucet_handler))
        .route("/venue/accrue", post(accrue_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Body returned by every endpoint on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    pub error: String,
}

#[derive(Debug)]
pub struct ApiError {
    status: StatusCode,
    message: String,
}

impl ApiError {
    fn bad_request(message: impl Into<String>) -> Self {
        Self {
            status: StatusCode::BAD_REQUEST,
            message: message.into(),
        }
    }
}

/// HTTP status for each engine error.
pub fn status_for(err: &VaultError) -> StatusCode {
    match err {
        VaultError::VaultNotFound(_) => StatusCode::NOT_FOUND,
        VaultError::Unauthorized { .. } => StatusCode::FORBIDDEN,
        VaultError::VaultExpired | VaultError::VaultNotActive | VaultError::AlreadyDeactivated => {
            StatusCode::CONFLICT
        }
        VaultError::SlippageExceeded { .. } => StatusCode::UNPROCESSABLE_ENTITY,
        VaultError::InsufficientAssets { .. }
        | VaultError::InsufficientClaims { .. }
        | VaultError::ZeroSharesMinted { .. }
        | VaultError::InvalidBurnAmount { .. }
        | VaultError::ArithmeticOverflow
        | VaultError::InvalidParameter(_)
        | VaultError::TransferFailed(_) => StatusCode::BAD_REQUEST,
        VaultError::VenueFailed(_) | VaultError::Storage(_) => StatusCode::INTERNAL_SERVER_ERROR,
    }
}

impl From<VaultError> for ApiError {
    fn from(err: VaultError) -> Self {
        Self {
            status: status_for(&err),
            message: err.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        if self.status.is_server_error() {
            tracing::error!(status = %self.status, "request failed: {}", self.message);
        }
        (
            self.status,
            Json(ErrorResponse {
                error: self.message,
            }),
        )
            .into_response()
    }
}

type ApiResult<T> = Result<Json<T>, ApiError>;

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

/// Body of `POST /vaults`. Omitted tuning fields take the engine defaults.
#[derive(Debug, Deserialize)]
pub struct CreateVaultRequest {
    pub caller: String,
    pub asset: String,
    pub event_id: String,
    pub name: String,
    pub symbol: String,
    pub target_liquidity_bps: Option<u32>,
    pub max_slippage_bps: Option<u32>,
    pub expiry_secs: Option<u64>,
}

impl CreateVaultRequest {
    fn params(&self) -> VaultParams {
        let mut params = VaultParams::new(&self.asset, &self.event_id, &self.name, &self.symbol);
        if let Some(bps) = self.target_liquidity_bps {
            params = params.with_target_liquidity_bps(bps);
        }
        if let Some(bps) = self.max_slippage_bps {
            params = params.with_max_slippage_bps(bps);
        }
        if let Some(secs) = self.expiry_secs {
            params = params.with_expiry(Duration::from_secs(secs));
        }
        params
    }
}

#[derive(Debug, Deserialize)]
pub struct DepositRequest {
    pub depositor: String,
    pub amount: u64,
}

#[derive(Debug, Deserialize)]
pub struct WithdrawRequest {
    pub holder: String,
    pub shares: u64,
}

/// Body of the owner-only operations.
#[derive(Debug, Deserialize)]
pub struct CallerRequest {
    pub caller: String,
}

#[derive(Debug, Deserialize)]
pub struct FaucetRequest {
    pub account: String,
    pub asset: String,
    pub amount: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct FaucetResponse {
    pub account: String,
    pub asset: String,
    pub balance: u64,
}

#[derive(Debug, Deserialize)]
pub struct AccrueRequest {
    pub vault_id: VaultId,
    pub amount: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct AccrueResponse {
    pub vault_id: VaultId,
    pub position_value: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct HolderResponse {
    pub vault_id: VaultId,
    pub holder: String,
    pub claims: u64,
    /// Assets the holder would receive for burning every claim now.
    pub redeemable: u64,
}

/// Response payload for `GET /status`.
#[derive(Debug, Serialize)]
pub struct StatusResponse {
    pub version: String,
    pub operator: String,
    pub vault_count: u64,
    pub total_value_locked: u64,
    pub persistent: bool,
    pub venue_price_impact_bps: u32,
    pub manager: ManagerStatus,
    /// ISO-8601 timestamp of the response.
    pub timestamp: String,
}

#[derive(Debug, Default, Deserialize)]
pub struct WsParams {
    /// Only forward events for this vault.
    pub vault: Option<VaultId>,
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health`: 200 while the process is serving.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> Json<StatusResponse> {
    Json(StatusResponse {
        version: state.version.clone(),
        operator: state.operator.clone(),
        vault_count: state.registry.vault_count(),
        total_value_locked: state.registry.total_value_locked(),
        persistent: state.registry.is_persistent(),
        venue_price_impact_bps: state.sim.venue.price_impact_bps(),
        manager: state.manager.read().clone(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn list_vaults_handler(State(state): State<AppState>) -> Json<Vec<VaultSnapshot>> {
    Json(state.registry.snapshots())
}

async fn create_vault_handler(
    State(state): State<AppState>,
    Json(req): Json<CreateVaultRequest>,
) -> Result<(StatusCode, Json<VaultHandle>), ApiError> {
    let handle = state.registry.create_vault(&req.caller, req.params())?;
    Ok((StatusCode::CREATED, Json(handle)))
}

async fn vault_handler(
    Path(id): Path<VaultId>,
    State(state): State<AppState>,
) -> ApiResult<VaultSnapshot> {
    Ok(Json(state.registry.snapshot(id)?))
}

async fn holder_handler(
    Path((id, holder)): Path<(VaultId, String)>,
    State(state): State<AppState>,
) -> ApiResult<HolderResponse> {
    let claims = state.registry.balance_of(id, &holder)?;
    let redeemable = state.registry.preview_redeem(id, &holder)?;
    Ok(Json(HolderResponse {
        vault_id: id,
        holder,
        claims,
        redeemable,
    }))
}

async fn deposit_handler(
    Path(id): Path<VaultId>,
    State(state): State<AppState>,
    Json(req): Json<DepositRequest>,
) -> ApiResult<DepositReceipt> {
    Ok(Json(state.registry.deposit(id, &req.depositor, req.amount)?))
}

async fn withdraw_handler(
    Path(id): Path<VaultId>,
    State(state): State<AppState>,
    Json(req): Json<WithdrawRequest>,
) -> ApiResult<WithdrawReceipt> {
    Ok(Json(state.registry.withdraw(id, &req.holder, req.shares)?))
}

async fn rebalance_handler(
    Path(id): Path<VaultId>,
    State(state): State<AppState>,
    Json(req): Json<CallerRequest>,
) -> ApiResult<RebalanceReceipt> {
    Ok(Json(state.registry.rebalance(id, &req.caller)?))
}

async fn distribute_yield_handler(
    Path(id): Path<VaultId>,
    State(state): State<AppState>,
    Json(req): Json<CallerRequest>,
) -> ApiResult<YieldDistribution> {
    Ok(Json(state.registry.distribute_yield(id, &req.caller)?))
}

/// Returns the vault's snapshot after deactivation.
async fn deactivate_handler(
    Path(id): Path<VaultId>,
    State(state): State<AppState>,
    Json(req): Json<CallerRequest>,
) -> ApiResult<VaultSnapshot> {
    state.registry.deactivate(id, &req.caller)?;
    Ok(Json(state.registry.snapshot(id)?))
}

/// `POST /faucet`: mints simulated asset into an account.
async fn faucet_handler(
    State(state): State<AppState>,
    Json(req): Json<FaucetRequest>,
) -> ApiResult<FaucetResponse> {
    if req.amount == 0 {
        return Err(ApiError::bad_request("amount must be positive"));
    }
    if req.account.is_empty() || req.asset.is_empty() {
        return Err(ApiError::bad_request("account and asset are required"));
    }
    let balance = state
        .sim
        .bank
        .mint(&req.asset, &req.account, req.amount)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    tracing::info!(account = %req.account, asset = %req.asset, amount = req.amount, "faucet mint");
    Ok(Json(FaucetResponse {
        account: req.account,
        asset: req.asset,
        balance,
    }))
}

/// `POST /venue/accrue`: credits LP fee income to a vault's position.
/// The vault books it on its next yield distribution.
async fn accrue_handler(
    State(state): State<AppState>,
    Json(req): Json<AccrueRequest>,
) -> ApiResult<AccrueResponse> {
    if req.amount == 0 {
        return Err(ApiError::bad_request("amount must be positive"));
    }
    let snap = state.registry.snapshot(req.vault_id)?;
    let position_value = state
        .sim
        .venue
        .accrue_fees(&snap.address, &snap.underlying_asset, req.amount)
        .map_err(|e| ApiError::bad_request(e.to_string()))?;
    Ok(Json(AccrueResponse {
        vault_id: req.vault_id,
        position_value,
    }))
}

/// `GET /ws`: streams JSON-encoded vault events. `?vault=<id>` narrows the
/// stream to one vault. Client messages are ignored.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(params): Query<WsParams>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, params.vault))
}

async fn handle_ws_connection(socket: WebSocket, state: AppState, vault: Option<VaultId>) {
    let (mut sender, mut receiver) = socket.split();
    let mut rx = state.registry.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(ev) => {
                        if vault.is_some_and(|id| id != ev.vault_id()) {
                            continue;
                        }
                        let payload = match serde_json::to_string(&ev) {
                            Ok(s) => s,
                            Err(e) => {
                                tracing::warn!("failed to serialize ws event: {}", e);
                                continue;
                            }
                        };
                        if sender.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("ws subscriber lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => break,
                }
            }
            msg = receiver.next() => {
                match msg {
                    Some(Ok(Message::Close(_))) | Some(Err(_)) | None => break,
                    Some(Ok(_)) => {}
                }
            }
        }
    }
}

// ---------------------------------------------------------------------------
// Tests
// ---------------------------------------------------------------------------
