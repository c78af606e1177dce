//! # REST + WebSocket API
//!
//! Builds the axum router that exposes the escrow engine over HTTP.
//! All endpoints share application state through axum's `State` extractor.
//!
//! The acting party is taken from the `x-party-id` header. Authenticating
//! that header is left to whatever sits in front of the node.
//!
//! ## Endpoints
//!
//! | Method | Path                        | Description                          |
//! |--------|-----------------------------|--------------------------------------|
//! | GET    | `/health`                   | Liveness probe                       |
//! | GET    | `/status`                   | Node status summary                  |
//! | GET    | `/escrows`                  | Number of escrows created            |
//! | POST   | `/escrows`                  | Deposit and open an escrow           |
//! | GET    | `/escrows/:id`              | Full escrow record                   |
//! | GET    | `/escrows/:id/state`        | Escrow state only                    |
//! | POST   | `/escrows/:id/confirm`      | Buyer confirms delivery              |
//! | POST   | `/escrows/:id/refund`       | Buyer requests a refund              |
//! | POST   | `/escrows/:id/resolve`      | Settle a dispute                     |
//! | GET    | `/parties/:party/escrows`   | Escrows a party takes part in        |
//! | GET    | `/accounts/:party`          | Ledger balance                       |
//! | POST   | `/accounts/:party/credit`   | Faucet credit                        |
//! | POST   | `/admin/ledger/halt`        | Suspend ledger payouts               |
//! | POST   | `/admin/ledger/resume`      | Resume ledger payouts                |
//! | GET    | `/ws`                       | WebSocket stream of escrow events    |

use std::sync::Arc;

use axum::{
    extract::{
        ws::{Message, WebSocket, WebSocketUpgrade},
        Path, Query, State,
    },
    http::{HeaderMap, Method, StatusCode},
    response::{IntoResponse, Response},
    routing::{get, post},
    Json, Router,
};
use covenant_contracts::{
    Amount, Escrow, EscrowEngine, EscrowError, EscrowEvent, EscrowId, EscrowState, PartyId,
};
use serde::{Deserialize, Serialize};
use thiserror::Error;
use tokio::sync::broadcast;
use tower_http::cors::{Any, CorsLayer};
use tower_http::trace::TraceLayer;

use crate::ledger::{Ledger, LedgerError};
use crate::metrics::SharedMetrics;

/// Header carrying the acting party's identity.
pub const CALLER_HEADER: &str = "x-party-id";

// ---------------------------------------------------------------------------
// Application State
// ---------------------------------------------------------------------------

/// Shared application state available to all request handlers.
///
/// Cheap to clone, everything sits behind an `Arc`.
#[derive(Clone)]
pub struct AppState {
    /// The node's reported version string.
    pub version: String,
    /// The escrow state machine.
    pub engine: Arc<EscrowEngine>,
    /// Account balances and the escrow vault.
    pub ledger: Arc<Ledger>,
    /// Broadcast channel feeding WebSocket subscribers.
    pub event_tx: broadcast::Sender<EscrowEvent>,
    /// Reference to Prometheus metrics for in-handler recording.
    pub metrics: SharedMetrics,
}

impl AppState {
    /// Runs an engine call, recording its latency and any rejection.
    fn observe<T>(
        &self,
        operation: &str,
        call: impl FnOnce(&EscrowEngine) -> Result<T, EscrowError>,
    ) -> Result<T, ApiError> {
        let timer = self
            .metrics
            .operation_latency_seconds
            .with_label_values(&[operation])
            .start_timer();
        let result = call(&self.engine);
        timer.observe_duration();

        result.map_err(|e| {
            self.metrics.observe_rejection(e.kind());
            ApiError::Escrow(e)
        })
    }
}

// ---------------------------------------------------------------------------
// Router Construction
// ---------------------------------------------------------------------------

/// Builds the full axum [`Router`] with all API routes, CORS, and tracing.
pub fn create_router(state: AppState) -> Router {
    let cors = CorsLayer::new()
        .allow_origin(Any)
        .allow_methods([Method::GET, Method::POST, Method::OPTIONS])
        .allow_headers(Any);

    Router::new()
        .route("/health", get(health_handler))
        .route("/status", get(status_handler))
        .route("/escrows", get(count_handler).post(create_handler))
        .route("/escrows/:id", get(escrow_handler))
        .route("/escrows/:id/state", get(state_handler))
        .route("/escrows/:id/confirm", post(confirm_handler))
        .route("/escrows/:id/refund", post(refund_handler))
        .route("/escrows/:id/resolve", post(resolve_handler))
        .route("/parties/:party/escrows", get(party_escrows_handler))
        .route("/accounts/:party", get(account_handler))
        .route("/accounts/:party/credit", post(credit_handler))
        .route("/admin/ledger/halt", post(halt_handler))
        .route("/admin/ledger/resume", post(resume_handler))
        .route("/ws", get(ws_handler))
        .layer(cors)
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

// ---------------------------------------------------------------------------
// Request / Response Types
// ---------------------------------------------------------------------------

/// Request body for `POST /escrows`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateEscrowRequest {
    pub seller: String,
    /// Deposit drawn from the caller's account.
    pub amount: Amount,
    /// Refund timeout in seconds.
    pub timeout_secs: u64,
    #[serde(default)]
    pub description: String,
}

/// Response body for `POST /escrows`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreateEscrowResponse {
    pub id: EscrowId,
    pub escrow: Escrow,
}

/// Request body for `POST /escrows/:id/resolve`.
#[derive(Debug, Serialize, Deserialize)]
pub struct ResolveRequest {
    pub favor_buyer: bool,
}

/// Request body for `POST /accounts/:party/credit`.
#[derive(Debug, Serialize, Deserialize)]
pub struct CreditRequest {
    pub amount: Amount,
}

/// Response payload for `GET /status`.
#[derive(Debug, Serialize, Deserialize)]
pub struct StatusResponse {
    pub version: String,
    pub escrow_count: u64,
    pub funds_held: Amount,
    pub vault_balance: Amount,
    pub ledger_halted: bool,
    pub timestamp: String,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct CountResponse {
    pub count: u64,
}

#[derive(Debug, Serialize, Deserialize)]
pub struct StateResponse {
    pub id: EscrowId,
    pub state: EscrowState,
}

/// Response payload for the `/accounts` endpoints.
#[derive(Debug, Serialize, Deserialize)]
pub struct AccountResponse {
    pub party: String,
    pub balance: Amount,
}

/// Generic error body returned by REST endpoints on failure.
#[derive(Debug, Serialize, Deserialize)]
pub struct ErrorResponse {
    /// Stable machine-readable label, e.g. `invalid_state`.
    pub kind: String,
    pub error: String,
}

// ---------------------------------------------------------------------------
// Errors
// ---------------------------------------------------------------------------

/// Failures surfaced by the HTTP layer.
#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Escrow(#[from] EscrowError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),

    #[error("missing or empty x-party-id header")]
    MissingCaller,
}

impl ApiError {
    fn status(&self) -> StatusCode {
        match self {
            ApiError::Escrow(e) => match e {
                EscrowError::NotFound(_) => StatusCode::NOT_FOUND,
                EscrowError::Unauthorized { .. } => StatusCode::FORBIDDEN,
                EscrowError::InvalidState { .. } => StatusCode::CONFLICT,
                EscrowError::InvalidArgument(_) => StatusCode::BAD_REQUEST,
                EscrowError::TimeoutNotElapsed { .. } => StatusCode::PRECONDITION_FAILED,
                EscrowError::TransferFailed { .. } => StatusCode::BAD_GATEWAY,
            },
            ApiError::Ledger(e) => match e {
                LedgerError::InsufficientFunds { .. } => StatusCode::PAYMENT_REQUIRED,
                LedgerError::Overflow { .. } | LedgerError::Invalid(_) => StatusCode::BAD_REQUEST,
                LedgerError::Halted => StatusCode::SERVICE_UNAVAILABLE,
            },
            ApiError::MissingCaller => StatusCode::UNAUTHORIZED,
        }
    }

    fn kind(&self) -> &'static str {
        match self {
            ApiError::Escrow(e) => e.kind(),
            ApiError::Ledger(LedgerError::InsufficientFunds { .. }) => "insufficient_funds",
            ApiError::Ledger(LedgerError::Halted) => "ledger_halted",
            ApiError::Ledger(_) => "invalid_argument",
            ApiError::MissingCaller => "missing_caller",
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        let body = ErrorResponse {
            kind: self.kind().to_string(),
            error: self.to_string(),
        };
        (self.status(), Json(body)).into_response()
    }
}

/// Reads the acting party from the request headers.
fn caller(headers: &HeaderMap) -> Result<PartyId, ApiError> {
    let party = headers
        .get(CALLER_HEADER)
        .and_then(|v| v.to_str().ok())
        .map(PartyId::new)
        .ok_or(ApiError::MissingCaller)?;
    if party.is_null() {
        return Err(ApiError::MissingCaller);
    }
    Ok(party)
}

// ---------------------------------------------------------------------------
// Handlers
// ---------------------------------------------------------------------------

/// `GET /health` returns 200 while the process is serving requests.
async fn health_handler() -> impl IntoResponse {
    (StatusCode::OK, Json(serde_json::json!({ "status": "ok" })))
}

async fn status_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(StatusResponse {
        version: state.version.clone(),
        escrow_count: state.engine.escrow_count(),
        funds_held: state.engine.funds_held(),
        vault_balance: state.ledger.vault_balance(),
        ledger_halted: state.ledger.is_halted(),
        timestamp: chrono::Utc::now().to_rfc3339(),
    })
}

async fn count_handler(State(state): State<AppState>) -> impl IntoResponse {
    Json(CountResponse {
        count: state.engine.escrow_count(),
    })
}

/// `POST /escrows` moves the deposit into the vault and opens the escrow.
///
/// If the engine rejects the creation the deposit goes straight back to the
/// caller's account.
async fn create_handler(
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<CreateEscrowRequest>,
) -> Result<impl IntoResponse, ApiError> {
    let buyer = caller(&headers)?;
    state.ledger.deposit(&buyer, req.amount)?;

    let created = state.observe("create_escrow", |engine| {
        engine.create_escrow(
            &buyer,
            PartyId::new(req.seller),
            std::time::Duration::from_secs(req.timeout_secs),
            req.description,
            req.amount,
        )
    });

    let id = match created {
        Ok(id) => id,
        Err(e) => {
            if let Err(refund_err) = state.ledger.return_deposit(&buyer, req.amount) {
                tracing::error!(
                    buyer = %buyer,
                    amount = req.amount,
                    "failed to return deposit after rejected creation: {}",
                    refund_err
                );
            }
            return Err(e);
        }
    };

    let escrow = state.engine.escrow(id)?;
    Ok((StatusCode::CREATED, Json(CreateEscrowResponse { id, escrow })))
}

async fn escrow_handler(
    Path(id): Path<EscrowId>,
    State(state): State<AppState>,
) -> Result<Json<Escrow>, ApiError> {
    Ok(Json(state.engine.escrow(id)?))
}

async fn state_handler(
    Path(id): Path<EscrowId>,
    State(state): State<AppState>,
) -> Result<Json<StateResponse>, ApiError> {
    let escrow_state = state.engine.state(id)?;
    Ok(Json(StateResponse {
        id,
        state: escrow_state,
    }))
}

async fn confirm_handler(
    Path(id): Path<EscrowId>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Escrow>, ApiError> {
    let party = caller(&headers)?;
    let escrow = state.observe("confirm_delivery", |engine| {
        engine.confirm_delivery(&party, id)
    })?;
    Ok(Json(escrow))
}

async fn refund_handler(
    Path(id): Path<EscrowId>,
    State(state): State<AppState>,
    headers: HeaderMap,
) -> Result<Json<Escrow>, ApiError> {
    let party = caller(&headers)?;
    let escrow = state.observe("request_refund", |engine| engine.request_refund(&party, id))?;
    Ok(Json(escrow))
}

async fn resolve_handler(
    Path(id): Path<EscrowId>,
    State(state): State<AppState>,
    headers: HeaderMap,
    Json(req): Json<ResolveRequest>,
) -> Result<Json<Escrow>, ApiError> {
    let party = caller(&headers)?;
    let escrow = state.observe("resolve_dispute", |engine| {
        engine.resolve_dispute(&party, id, req.favor_buyer)
    })?;
    Ok(Json(escrow))
}

async fn party_escrows_handler(
    Path(party): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    Json(state.engine.escrows_for(&PartyId::new(party)))
}

/// `GET /accounts/:party` returns zero for accounts never credited.
async fn account_handler(
    Path(party): Path<String>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    let balance = state.ledger.balance(&PartyId::new(party.as_str()));
    Json(AccountResponse { party, balance })
}

async fn credit_handler(
    Path(party): Path<String>,
    State(state): State<AppState>,
    Json(req): Json<CreditRequest>,
) -> Result<Json<AccountResponse>, ApiError> {
    let balance = state
        .ledger
        .credit(&PartyId::new(party.as_str()), req.amount)?;
    Ok(Json(AccountResponse { party, balance }))
}

/// `POST /admin/ledger/halt` makes every payout fail until resumed.
async fn halt_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.ledger.halt();
    Json(serde_json::json!({ "halted": true }))
}

async fn resume_handler(State(state): State<AppState>) -> impl IntoResponse {
    state.ledger.resume();
    Json(serde_json::json!({ "halted": false }))
}

/// Optional filter for `/ws`.
#[derive(Debug, Default, Deserialize)]
pub struct WsFilter {
    /// Only forward events for this escrow.
    pub escrow_id: Option<EscrowId>,
}

/// `GET /ws` upgrades to a WebSocket that pushes JSON-encoded
/// [`EscrowEvent`]s. Client messages are ignored.
async fn ws_handler(
    ws: WebSocketUpgrade,
    Query(filter): Query<WsFilter>,
    State(state): State<AppState>,
) -> impl IntoResponse {
    ws.on_upgrade(move |socket| handle_ws_connection(socket, state, filter))
}

/// Drives a single WebSocket connection, forwarding broadcast events
/// until the client disconnects or the channel is closed.
async fn handle_ws_connection(mut socket: WebSocket, state: AppState, filter: WsFilter) {
    let mut rx = state.event_tx.subscribe();

    loop {
        tokio::select! {
            event = rx.recv() => {
                match event {
                    Ok(ev) => {
                        if filter.escrow_id.is_some_and(|id| id != ev.escrow_id()) {
                            continue;
                        }
                        let payload = match serde_json::to_string(&ev) {
                            Ok(s) => s,
                            Err(e) => {
                                tracing::warn!("failed to serialize ws event: {}", e);
                                continue;
                            }
                        };
                        if socket.send(Message::Text(payload)).await.is_err() {
                            break;
                        }
                    }
                    Err(broadcast::error::RecvError::Lagged(n)) => {
                        tracing::warn!("ws subscriber lagged by {} events", n);
                    }
                    Err(broadcast::error::RecvError::Closed) => {
                        break;
                    }
                }
            }
            msg = socket.recv() => {
                match msg {
                    Some(Ok(_)) => {}
                    _ => break,
                }
            }
        }
    }
}
