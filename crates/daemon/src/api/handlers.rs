/// API request handlers

use super::responses::*;
use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    Json,
};
use bitmesh_core::RouterSnapshot;
use tokio::sync::watch;
use tracing::{debug, error};

/// Shared application state
#[derive(Clone)]
pub struct AppState {
    pub snapshots: watch::Receiver<RouterSnapshot>,
}

impl AppState {
    fn snapshot(&self) -> RouterSnapshot {
        self.snapshots.borrow().clone()
    }
}

/// Handler for GET /api/wallet
pub async fn get_wallet(State(state): State<AppState>) -> Json<WalletResponse> {
    debug!("API: GET /api/wallet");

    let snapshot = state.snapshot();
    Json(WalletResponse::new(&snapshot.wallet, snapshot.credit))
}

/// Handler for GET /api/circuits
pub async fn get_circuits(State(state): State<AppState>) -> Json<CircuitsResponse> {
    debug!("API: GET /api/circuits");

    let circuits: Vec<CircuitInfo> = state.snapshot().circuits.iter().map(CircuitInfo::from).collect();
    let total = circuits.len();

    Json(CircuitsResponse { circuits, total })
}

/// Handler for GET /api/circuits/:key
pub async fn get_circuit(
    State(state): State<AppState>,
    Path(key): Path<u64>,
) -> Result<Json<CircuitInfo>, AppError> {
    debug!("API: GET /api/circuits/{}", key);

    state
        .snapshot()
        .circuits
        .iter()
        .find(|circuit| circuit.key == key)
        .map(|circuit| Json(CircuitInfo::from(circuit)))
        .ok_or_else(|| AppError::not_found(format!("no circuit {}", key)))
}

/// Handler for GET /api/status
pub async fn get_status(State(state): State<AppState>) -> Json<StatusResponse> {
    debug!("API: GET /api/status");

    let snapshot = state.snapshot();
    Json(StatusResponse {
        link_ready: snapshot.link_ready,
        logged_in: snapshot.logged_in,
        bootstrap_progress: snapshot.bootstrap_progress,
        relays: snapshot.relays,
        usable_relays: snapshot.usable_relays,
        circuits: snapshot.circuits.len(),
        open_circuits: snapshot.circuits.iter().filter(|circuit| circuit.open).count(),
        streams: snapshot.streams,
        applications: snapshot.applications.iter().map(ApplicationInfo::from).collect(),
        bytes_read: snapshot.bytes_read,
        bytes_written: snapshot.bytes_written,
    })
}

/// Health check endpoint
pub async fn health_check() -> impl IntoResponse {
    debug!("API: GET /health");
    (StatusCode::OK, "OK")
}

/// Application error type
pub struct AppError {
    message: String,
    status_code: StatusCode,
}

impl AppError {
    pub fn not_found(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            status_code: StatusCode::NOT_FOUND,
        }
    }
}

impl IntoResponse for AppError {
    fn into_response(self) -> Response {
        if self.status_code.is_server_error() {
            error!("API Error: {}", self.message);
        } else {
            debug!("API Error: {}", self.message);
        }

        let body = Json(ErrorResponse::new(self.message, self.status_code.as_u16()));

        (self.status_code, body).into_response()
    }
}
