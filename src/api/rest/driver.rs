//! Driver-side actions that are not about a specific order.

use std::sync::Arc;

use axum::Json;
use axum::Router;
use axum::extract::State;
use axum::http::StatusCode;
use axum::routing::{get, post};
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

use crate::alert::DismissReport;
use crate::error::AppError;
use crate::models::position::{Fix, GeoPoint};
use crate::state::AppState;
use crate::tracking::fleet::FleetEntry;
use crate::tracking::reporter::LogoutReport;

pub fn router() -> Router<Arc<AppState>> {
    Router::new()
        .route("/position", post(push_position))
        .route("/logout", post(logout))
        .route("/alert/dismiss", post(dismiss_alert))
        .route("/receivers/recent", get(recent_receivers))
        .route("/fleet", get(fleet))
}

#[derive(Deserialize)]
pub struct PositionRequest {
    pub lat: f64,
    pub lng: f64,
    #[serde(default)]
    pub heading: Option<f64>,
    #[serde(default)]
    pub taken_at: Option<DateTime<Utc>>,
}

#[derive(Serialize)]
pub struct PositionResponse {
    pub watching: bool,
    pub centering_target: Option<GeoPoint>,
}

async fn push_position(
    State(state): State<Arc<AppState>>,
    Json(payload): Json<PositionRequest>,
) -> Result<(StatusCode, Json<PositionResponse>), AppError> {
    if !(-90.0..=90.0).contains(&payload.lat) || !(-180.0..=180.0).contains(&payload.lng) {
        return Err(AppError::BadRequest("coordinates out of range".to_string()));
    }

    state.location.push(Fix {
        point: GeoPoint::new(payload.lat, payload.lng),
        heading: payload.heading,
        taken_at: payload.taken_at.unwrap_or_else(Utc::now),
    });

    Ok((
        StatusCode::ACCEPTED,
        Json(PositionResponse {
            watching: state.reporter.is_watching(),
            centering_target: state.reporter.centering_target(),
        }),
    ))
}

#[derive(Serialize)]
pub struct LogoutResponse {
    #[serde(flatten)]
    pub position: LogoutReport,
    pub alert: DismissReport,
}

/// Ends the session: stops the feeds and the refresh loop, silences any
/// alert, drops pending notifications and clears the published position.
async fn logout(State(state): State<Arc<AppState>>) -> Json<LogoutResponse> {
    state.session.cancel();
    let alert = state.alert.dismiss();
    state.notifications.cancel_pending();
    state.repo.clear_selection();
    let position = state.reporter.logout().await;

    if let Err(err) = state.store.set_driver_id(None) {
        warn!(error = %err, "could not forget driver id");
    }

    info!(driver_id = %state.driver_id, "driver logged out");
    Json(LogoutResponse { position, alert })
}

async fn dismiss_alert(State(state): State<Arc<AppState>>) -> Json<DismissReport> {
    Json(state.alert.dismiss())
}

async fn recent_receivers(State(state): State<Arc<AppState>>) -> Json<Vec<String>> {
    Json(state.store.recent_receivers())
}

async fn fleet(State(state): State<Arc<AppState>>) -> Json<Vec<FleetEntry>> {
    Json(state.fleet.list(Utc::now()))
}
