use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::routing::{get, post};
use serde::Deserialize;

use crate::engine::realtime::refresh_once;
use crate::error::AppError;
use crate::finalize::sequencer::{DeliveryInput, FinalizeOutcome};
use crate::models::order::{Order, OrderId};
use crate::state::AppState;
use crate::sync::repository::RefreshOutcome;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/orders", get(list_orders))
        .route("/orders/history", get(list_history))
        .route("/orders/refresh", post(refresh_orders))
        .route("/orders/move", post(move_order))
        .route("/orders/:id/deliver", post(deliver_order))
        .route("/orders/:id/fail", post(fail_order))
}

#[derive(Deserialize)]
pub struct MoveRequest {
    pub from: usize,
    pub to: usize,
}

#[derive(Deserialize, Default)]
pub struct FailRequest {
    #[serde(default)]
    pub reason: String,
}

async fn list_orders(State(state): State<Arc<AppState>>) -> Json<Vec<Order>> {
    Json(state.repo.snapshot())
}

async fn list_history(State(state): State<Arc<AppState>>) -> Json<Vec<Order>> {
    Json(state.repo.history())
}

async fn refresh_orders(
    State(state): State<Arc<AppState>>,
) -> Result<Json<RefreshOutcome>, AppError> {
    Ok(Json(refresh_once(&state).await?))
}

async fn move_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<MoveRequest>,
) -> Result<Json<Vec<Order>>, AppError> {
    if !state.repo.move_local(payload.from, payload.to) {
        return Err(AppError::BadRequest(format!(
            "cannot move {} to {}: list holds {} orders",
            payload.from,
            payload.to,
            state.repo.len()
        )));
    }

    Ok(Json(state.repo.snapshot()))
}

fn select_active(state: &AppState, id: i64) -> Result<(), AppError> {
    state
        .repo
        .select(OrderId(id))
        .map(|_| ())
        .ok_or_else(|| AppError::NotFound(format!("order {id} is not active")))
}

async fn deliver_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<DeliveryInput>,
) -> Result<Json<FinalizeOutcome>, AppError> {
    select_active(&state, id)?;
    Ok(Json(state.sequencer.deliver(payload).await?))
}

async fn fail_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    payload: Option<Json<FailRequest>>,
) -> Result<Json<FinalizeOutcome>, AppError> {
    let Json(payload) = payload.unwrap_or_default();
    select_active(&state, id)?;
    Ok(Json(state.sequencer.fail(&payload.reason).await?))
}
