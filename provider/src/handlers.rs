use axum::{
    extract::{Path, State},
    http::StatusCode,
    response::{IntoResponse, Response},
    routing::{get, post, put},
    Json, Router,
};
use common::{
    ErrorBody, PriceQuote, ResizeRequest, SchedulerSnapshot, SubmitTaskRequest,
    SubmitTaskResponse, TaskRecord, ValidationError,
};
use thiserror::Error;
use tower_http::trace::TraceLayer;
use tracing::info;

use crate::ledger::LedgerError;
use crate::scheduler::SchedulerError;
use crate::state::AppState;
use crate::ws;

pub fn build_router(state: AppState) -> Router {
    Router::new()
        .route("/health", get(health))
        .route("/api/v1/tasks", post(submit_task).get(list_tasks))
        .route("/api/v1/tasks/:id", get(get_task).delete(cancel_task))
        .route("/api/v1/scheduler", get(get_scheduler))
        .route("/api/v1/capacity", put(resize))
        .route("/api/v1/price", get(get_price))
        .route("/parameters/spot_price", get(spot_price_history))
        .route("/api/v1/bids/ws", get(ws::bid_session))
        .layer(TraceLayer::new_for_http())
        .with_state(state)
}

/* ---------------- errores de la API ---------------- */

#[derive(Debug, Error)]
pub enum ApiError {
    #[error(transparent)]
    Validation(#[from] ValidationError),

    #[error(transparent)]
    Scheduler(#[from] SchedulerError),

    #[error(transparent)]
    Ledger(#[from] LedgerError),
}

impl ApiError {
    pub fn status(&self) -> StatusCode {
        match self {
            ApiError::Validation(ValidationError::BelowReserve { .. }) => {
                StatusCode::UNPROCESSABLE_ENTITY
            }
            ApiError::Validation(_) => StatusCode::BAD_REQUEST,
            ApiError::Scheduler(SchedulerError::InvalidCapacity(_)) => StatusCode::BAD_REQUEST,
            ApiError::Scheduler(SchedulerError::UnknownTask(_)) => StatusCode::NOT_FOUND,
            ApiError::Scheduler(SchedulerError::AlreadyTerminal { .. }) => StatusCode::CONFLICT,
            ApiError::Ledger(LedgerError::InsufficientFunds { .. }) => StatusCode::PAYMENT_REQUIRED,
            ApiError::Ledger(_) => StatusCode::BAD_GATEWAY,
        }
    }

    pub fn kind(&self) -> &'static str {
        match self {
            ApiError::Validation(ValidationError::BelowReserve { .. }) => "below_reserve",
            ApiError::Validation(_) => "invalid_request",
            ApiError::Scheduler(SchedulerError::InvalidCapacity(_)) => "invalid_capacity",
            ApiError::Scheduler(SchedulerError::UnknownTask(_)) => "not_found",
            ApiError::Scheduler(SchedulerError::AlreadyTerminal { .. }) => "already_terminal",
            ApiError::Ledger(LedgerError::InsufficientFunds { .. }) => "insufficient_funds",
            ApiError::Ledger(_) => "ledger_unavailable",
        }
    }

    pub fn body(&self) -> ErrorBody {
        ErrorBody {
            status: self.kind().to_string(),
            error_message: self.to_string(),
        }
    }
}

impl IntoResponse for ApiError {
    fn into_response(self) -> Response {
        (self.status(), Json(self.body())).into_response()
    }
}

/// Validación, precio de reserva, retención en el ledger y por último el
/// scheduler. Un rechazo en cualquier paso previo no toca el scheduler.
pub async fn admit_request(
    state: &AppState,
    req: SubmitTaskRequest,
) -> Result<SubmitTaskResponse, ApiError> {
    let bid = req.validate()?;

    let reserve = state.price.reserve_price();
    if bid.value() < reserve {
        return Err(ValidationError::BelowReserve {
            bid: bid.value(),
            reserve,
        }
        .into());
    }

    state.ledger.hold(req.user_account, bid.value()).await?;

    let task = state
        .scheduler
        .submit(req.bidder_id, req.user_account, bid, req.spec);
    info!(
        "tarea {} de {} aceptada (bid={}, reserva={:.4}) -> {:?}",
        task.id, task.bidder_id, bid, reserve, task.state
    );
    Ok(SubmitTaskResponse {
        task,
        reserve_price: reserve,
    })
}

/* ---------------- handlers HTTP ---------------- */

async fn health() -> &'static str {
    "ok"
}

async fn submit_task(
    State(state): State<AppState>,
    Json(req): Json<SubmitTaskRequest>,
) -> Result<Json<SubmitTaskResponse>, ApiError> {
    admit_request(&state, req).await.map(Json)
}

async fn list_tasks(State(state): State<AppState>) -> Json<Vec<TaskRecord>> {
    Json(state.scheduler.list())
}

async fn get_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskRecord>, ApiError> {
    state
        .scheduler
        .get(&id)
        .map(Json)
        .ok_or(ApiError::Scheduler(SchedulerError::UnknownTask(id)))
}

async fn cancel_task(
    State(state): State<AppState>,
    Path(id): Path<String>,
) -> Result<Json<TaskRecord>, ApiError> {
    Ok(Json(state.scheduler.cancel(&id)?))
}

async fn get_scheduler(State(state): State<AppState>) -> Json<SchedulerSnapshot> {
    Json(state.scheduler.snapshot())
}

async fn resize(
    State(state): State<AppState>,
    Json(req): Json<ResizeRequest>,
) -> Result<Json<SchedulerSnapshot>, ApiError> {
    Ok(Json(state.scheduler.resize(req.capacity)?))
}

async fn get_price(State(state): State<AppState>) -> Json<PriceQuote> {
    Json(state.price.quote())
}

// Historial de precios de reserva, del más antiguo al más reciente
async fn spot_price_history(State(state): State<AppState>) -> Json<Vec<f64>> {
    Json(state.price.history())
}
