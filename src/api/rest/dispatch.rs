//! Dispatcher-side writes. They go straight to the backend; the driver's list
//! only changes when the resulting realtime events arrive.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::{Path, State};
use axum::http::StatusCode;
use axum::routing::{delete, patch, post};
use serde::Deserialize;
use serde_json::Value;
use tracing::info;

use crate::backend::{Filter, ORDERS_TABLE, Row};
use crate::error::AppError;
use crate::models::order::{DriverId, Order, OrderStatus};
use crate::state::AppState;
use crate::sync::normalize::{Field, column, normalize_order};

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/dispatch/orders", post(create_order))
        .route("/dispatch/orders/:id", delete(delete_order))
        .route("/dispatch/orders/:id/status", patch(update_status))
}

#[derive(Deserialize)]
pub struct CreateOrderRequest {
    pub driver_id: DriverId,
    pub customer: String,
    pub address: String,
    #[serde(default)]
    pub service_type: Option<String>,
    #[serde(default)]
    pub status: Option<String>,
    #[serde(default)]
    pub notes: Option<String>,
    #[serde(default)]
    pub instructions: Option<String>,
    #[serde(default)]
    pub lat: Option<f64>,
    #[serde(default)]
    pub lng: Option<f64>,
}

#[derive(Deserialize)]
pub struct StatusRequest {
    pub status: String,
}

fn parse_status(raw: &str) -> Result<OrderStatus, AppError> {
    OrderStatus::parse(raw).ok_or_else(|| AppError::BadRequest(format!("unknown status '{raw}'")))
}

fn to_order(row: &Row) -> Result<Order, AppError> {
    normalize_order(row).map_err(|err| AppError::Internal(format!("stored order is unreadable: {err}")))
}

async fn create_order(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<CreateOrderRequest>,
) -> Result<(StatusCode, Json<Order>), AppError> {
    if payload.customer.trim().is_empty() {
        return Err(AppError::BadRequest("customer is required".to_string()));
    }

    let status = match payload.status.as_deref() {
        Some(raw) => parse_status(raw)?,
        None => OrderStatus::Pending,
    };

    let mut row = Row::new();
    row.insert(column(Field::DriverId).to_string(), Value::from(payload.driver_id.0));
    row.insert(column(Field::Customer).to_string(), Value::from(payload.customer));
    row.insert(column(Field::Address).to_string(), Value::from(payload.address));
    row.insert(column(Field::Status).to_string(), Value::from(status.as_str()));

    let optional = [
        (Field::ServiceType, payload.service_type.map(Value::from)),
        (Field::Notes, payload.notes.map(Value::from)),
        (Field::Instructions, payload.instructions.map(Value::from)),
        (Field::Lat, payload.lat.map(Value::from)),
        (Field::Lng, payload.lng.map(Value::from)),
    ];
    for (field, value) in optional {
        if let Some(value) = value {
            row.insert(column(field).to_string(), value);
        }
    }

    let stored = state.backend.insert(ORDERS_TABLE, row).await?;
    let order = to_order(&stored)?;

    info!(order_id = %order.id, driver_id = %payload.driver_id, "order dispatched");
    Ok((StatusCode::CREATED, Json(order)))
}

async fn update_status(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
    Json(payload): Json<StatusRequest>,
) -> Result<Json<Order>, AppError> {
    let status = parse_status(&payload.status)?;

    let mut patch = Row::new();
    patch.insert(column(Field::Status).to_string(), Value::from(status.as_str()));

    let updated = state
        .backend
        .update(ORDERS_TABLE, Filter::new().eq(column(Field::Id), id), patch)
        .await?;
    let row = updated
        .first()
        .ok_or_else(|| AppError::NotFound(format!("order {id} not found")))?;

    info!(order_id = id, status = status.as_str(), "order status changed by dispatch");
    Ok(Json(to_order(row)?))
}

async fn delete_order(
    State(state): State<Arc<AppState>>,
    Path(id): Path<i64>,
) -> Result<StatusCode, AppError> {
    let removed = state
        .backend
        .delete(ORDERS_TABLE, Filter::new().eq(column(Field::Id), id))
        .await?;

    if removed.is_empty() {
        return Err(AppError::NotFound(format!("order {id} not found")));
    }

    info!(order_id = id, "order removed by dispatch");
    Ok(StatusCode::NO_CONTENT)
}
